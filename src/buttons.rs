// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeOptions;
use crate::press::{self, PressCallbacks, PressKind, PressTracker};
use crate::protocol::{
    AreaDefinition, ControlStationDefinition, DeviceDefinition, OneButtonStatusEvent, Response,
};
use crate::session::{LinkState, Session, SessionEvent, SubscriptionCallback};
use crate::topology::{DeviceWiring, WireResult};

/// Delay before retrying button subscriptions that failed.
const RESUBSCRIBE_RETRY: Duration = Duration::from_secs(10);

const BUTTON_STATUS_BODY: &str = "OneButtonStatusEvent";

/// A classified gesture on one button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonAction {
    pub controller_id: String,
    /// Area and device name, e.g. "Kitchen Pico".
    pub device: String,
    pub button_href: String,
    pub button_number: u32,
    pub label: String,
    pub kind: PressKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceClass {
    Keypad,
    Pico,
    /// Known hardware with no button mapping yet.
    Pending,
    Unsupported,
}

fn classify(device_type: &str) -> DeviceClass {
    match device_type {
        "SunnataKeypad" | "SunnataHybridKeypad" => DeviceClass::Keypad,
        "Pico2Button" | "Pico2ButtonRaiseLower" | "Pico3Button" | "Pico3ButtonRaiseLower"
        | "Pico4Button2Group" | "Pico4ButtonScene" | "Pico4ButtonZone" | "PaddleSwitchPico" => {
            DeviceClass::Pico
        }
        "Pico4Button" | "FourGroupRemote" => DeviceClass::Pending,
        _ => DeviceClass::Unsupported,
    }
}

/// Raise and lower paddles on the RaiseLower Picos repeat Press while held.
pub fn is_up_down(device_type: &str, button_number: u32) -> bool {
    matches!(device_type, "Pico2ButtonRaiseLower" | "Pico3ButtonRaiseLower")
        && matches!(button_number, 3 | 4)
}

type Trackers = Arc<HashMap<String, PressTracker>>;

struct WiredDevice {
    controller_id: String,
    trackers: Trackers,
    rearm: JoinHandle<()>,
}

impl Drop for WiredDevice {
    fn drop(&mut self) {
        self.rearm.abort();
    }
}

/// Wires keypads and Pico remotes: one Press Tracker per button, fed by a
/// button-event subscription that is re-armed whenever the session
/// reports `Disconnected`. Classified gestures come out of the receiver
/// returned by [`ButtonWiring::new`].
pub struct ButtonWiring {
    options: BridgeOptions,
    actions: mpsc::UnboundedSender<ButtonAction>,
    wired: Mutex<HashMap<String, WiredDevice>>,
}

impl ButtonWiring {
    pub fn new(options: BridgeOptions) -> (Self, mpsc::UnboundedReceiver<ButtonAction>) {
        let (actions, rx) = mpsc::unbounded_channel();
        let wiring = Self {
            options,
            actions,
            wired: Mutex::new(HashMap::new()),
        };
        (wiring, rx)
    }

    /// Number of devices currently wired.
    pub async fn wired_count(&self) -> usize {
        self.wired.lock().await.len()
    }

    /// Number of buttons wired for one controller.
    pub async fn button_count(&self, controller_id: &str) -> usize {
        self.wired
            .lock()
            .await
            .values()
            .filter(|d| d.controller_id == controller_id)
            .map(|d| d.trackers.len())
            .sum()
    }

    /// Tear down everything wired for a controller.
    pub async fn forget_controller(&self, controller_id: &str) {
        let mut wired = self.wired.lock().await;
        let before = wired.len();
        wired.retain(|_, d| d.controller_id != controller_id);
        debug!(
            "Forgot {} devices for controller {}",
            before - wired.len(),
            controller_id
        );
    }
}

impl DeviceWiring for ButtonWiring {
    async fn wire(
        &self,
        session: &Session,
        area: &AreaDefinition,
        _station: &ControlStationDefinition,
        device: &DeviceDefinition,
    ) -> WireResult {
        let name = format!("{} {}", area.name, device.name);
        match classify(&device.device_type) {
            DeviceClass::Keypad => info!("Found a {}: {}", device.device_type, name),
            DeviceClass::Pico if self.options.filter_pico => {
                return WireResult::Skipped {
                    reason: format!("Pico remotes are filtered out ({})", device.device_type),
                };
            }
            DeviceClass::Pico => info!("Found a {} remote {}", device.device_type, name),
            DeviceClass::Pending => {
                return WireResult::Skipped {
                    reason: format!("Device type {} not yet supported", device.device_type),
                };
            }
            DeviceClass::Unsupported => {
                return WireResult::Skipped {
                    reason: format!("Device type {} not supported", device.device_type),
                };
            }
        }

        // Held for the whole wiring so two walks cannot wire one identity twice.
        let mut wired = self.wired.lock().await;
        if wired.contains_key(device.identity()) {
            debug!("{} is already wired", name);
            return WireResult::Success { name };
        }

        let groups = match session.device_button_groups(device).await {
            Ok(groups) => groups,
            Err(e) => {
                return WireResult::Error {
                    reason: e.to_string(),
                };
            }
        };
        let mut buttons = Vec::new();
        for group in &groups {
            match session.buttons_from_group(group).await {
                Ok(found) => buttons.extend(found),
                Err(e) => {
                    return WireResult::Error {
                        reason: e.to_string(),
                    };
                }
            }
        }
        if buttons.is_empty() {
            return WireResult::Skipped {
                reason: format!("{name} has no buttons"),
            };
        }

        let timing = self.options.press_timing();
        let mut trackers = HashMap::with_capacity(buttons.len());
        for button in &buttons {
            let up_down = is_up_down(&device.device_type, button.button_number);
            debug!(
                "Setting up {} named {} numbered {}{}",
                button.href,
                button.label(),
                button.button_number,
                if up_down { " (up/down)" } else { "" }
            );
            let template = ButtonAction {
                controller_id: session.controller_id().to_string(),
                device: name.clone(),
                button_href: button.href.clone(),
                button_number: button.button_number,
                label: button.label().to_string(),
                kind: PressKind::Single,
            };
            let tx = self.actions.clone();
            let callbacks = PressCallbacks::from_fn(move |kind| {
                let _ = tx.send(ButtonAction {
                    kind,
                    ..template.clone()
                });
            });
            trackers.insert(
                button.href.clone(),
                PressTracker::spawn(&button.href, up_down, timing, callbacks),
            );
        }

        let trackers: Trackers = Arc::new(trackers);
        let handler = button_handler(name.clone(), trackers.clone());
        let events = session.events();
        let subscribed = subscribe_all(session, &trackers, &handler).await;
        let rearm = tokio::spawn(rearm(
            session.clone(),
            events,
            name.clone(),
            trackers.clone(),
            handler,
            subscribed,
        ));

        wired.insert(
            device.identity().to_string(),
            WiredDevice {
                controller_id: session.controller_id().to_string(),
                trackers,
                rearm,
            },
        );
        WireResult::Success { name }
    }
}

fn button_handler(device: String, trackers: Trackers) -> SubscriptionCallback {
    Arc::new(move |response: &Response| {
        handle_button_event(&device, &trackers, response);
    })
}

/// Feed a button-status push to its tracker. Returns false when the push is
/// not for one of these buttons.
fn handle_button_event(device: &str, trackers: &HashMap<String, PressTracker>, response: &Response) -> bool {
    let status = match response.body_as::<OneButtonStatusEvent>() {
        Ok(event) => event.button_status,
        Err(e) => {
            debug!("Ignoring push for {}: {}", device, e);
            return false;
        }
    };
    match trackers.get(&status.button.href) {
        Some(tracker) => {
            info!(
                "Button {} on {} got action {:?}",
                status.button.href, device, status.button_event.event_type
            );
            tracker.update(&status.button_event.event_type);
            true
        }
        None => false,
    }
}

/// Subscribe every button. Returns false if any subscription failed.
/// Subscriptions stay registered on failure, so a retry re-issues them all.
async fn subscribe_all(session: &Session, trackers: &Trackers, handler: &SubscriptionCallback) -> bool {
    let mut ok = true;
    for href in trackers.keys() {
        debug!("Subscribing to {} events", href);
        if let Err(e) = session.subscribe_to_button(href, handler.clone()).await {
            warn!("Failed to subscribe to {}: {}", href, e);
            ok = false;
        }
    }
    ok
}

async fn rearm(
    session: Session,
    mut events: broadcast::Receiver<SessionEvent>,
    device: String,
    trackers: Trackers,
    handler: SubscriptionCallback,
    subscribed: bool,
) {
    let mut retry_at = (!subscribed).then(|| Instant::now() + RESUBSCRIBE_RETRY);
    loop {
        let resubscribe = tokio::select! {
            () = press::wait_for(retry_at) => {
                retry_at = None;
                session.state() != LinkState::Idle
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Disconnected) => {
                    debug!("Re-subscribing {} after connection loss", device);
                    true
                }
                Ok(SessionEvent::Unsolicited(response)) => {
                    if response.message_body_type() == Some(BUTTON_STATUS_BODY) {
                        handle_unsolicited(&device, &trackers, &response);
                    }
                    false
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("{} missed {} session events, re-subscribing", device, missed);
                    true
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if resubscribe && !subscribe_all(&session, &trackers, &handler).await {
            retry_at = Some(Instant::now() + RESUBSCRIBE_RETRY);
        }
    }
}

fn handle_unsolicited(device: &str, trackers: &HashMap<String, PressTracker>, response: &Response) {
    let known = response
        .body_as::<OneButtonStatusEvent>()
        .is_ok_and(|e| trackers.contains_key(&e.button_status.button.href));
    if known {
        warn!("Unsolicited event for a known button on {}, handling anyway", device);
        handle_button_event(device, trackers, response);
    }
}
