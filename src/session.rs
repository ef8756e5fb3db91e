// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

//! One long-lived session per controller.
//!
//! A [`Session`] owns the current [`LeapConnection`] to a controller and
//! keeps it healthy with a periodic ping. Subscriptions are registered on
//! the session rather than on the connection, so when the connection is
//! replaced by [`Session::reconfigure`] the registry survives and the
//! subscribers re-arm on the synthesized [`SessionEvent::Disconnected`].
//!
//! Inbound messages that do not answer a request are routed by `ClientTag`
//! to the subscription that created them, then by `Url`, and anything left
//! over is broadcast as [`SessionEvent::Unsolicited`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionOptions;
use crate::error::{LeapError, Result};
use crate::protocol::{self, CommuniqueType, Response};
use crate::transport::{ConnectionEvent, LeapConnection};

/// Callback invoked for every push on a subscribed resource.
pub type SubscriptionCallback = Arc<dyn Fn(&Response) + Send + Sync>;

/// Lifecycle notifications broadcast to everyone holding a receiver.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The connection dropped or was replaced. Subscribers must re-subscribe.
    Disconnected,
    /// A message no request or subscription claimed.
    Unsolicited(Arc<Response>),
}

/// Where the session is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected, or the last reconfiguration failed.
    Idle,
    /// A reconfiguration is swapping the connection.
    Reconnecting,
    /// Connected; requests and keepalive pings flow.
    Ready,
}

struct Subscription {
    tag: String,
    callback: SubscriptionCallback,
}

/// Subscriptions keyed by url. Re-subscribing to a url replaces the earlier
/// entry, so a reconnect never leaves two callbacks on one resource.
#[derive(Default)]
struct Registry {
    by_url: HashMap<String, Subscription>,
    url_by_tag: HashMap<String, String>,
}

impl Registry {
    fn register(&mut self, url: &str, callback: SubscriptionCallback) -> String {
        let tag = Uuid::new_v4().to_string();
        let previous = self.by_url.insert(
            url.to_string(),
            Subscription {
                tag: tag.clone(),
                callback,
            },
        );
        if let Some(previous) = previous {
            self.url_by_tag.remove(&previous.tag);
        }
        self.url_by_tag.insert(tag.clone(), url.to_string());
        tag
    }

    fn callback_for(&self, response: &Response) -> Option<SubscriptionCallback> {
        let by_tag = response
            .tag()
            .and_then(|tag| self.url_by_tag.get(tag))
            .and_then(|url| self.by_url.get(url));
        by_tag
            .or_else(|| response.url().and_then(|url| self.by_url.get(url)))
            .map(|s| s.callback.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionInner {
    controller_id: String,
    options: SessionOptions,
    connection: RwLock<Arc<LeapConnection>>,
    state: Mutex<LinkState>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Registry>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionInner {
    fn dispatch(&self, response: Response) {
        let callback = lock(&self.subscriptions).callback_for(&response);
        match callback {
            Some(callback) => callback(&response),
            None => {
                debug!(
                    "Unsolicited {} {} from controller {}",
                    response.communique_type,
                    response.url().unwrap_or("?"),
                    self.controller_id
                );
                let _ = self
                    .events
                    .send(SessionEvent::Unsolicited(Arc::new(response)));
            }
        }
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = lock(&self.keepalive).take() {
            handle.abort();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.stop_keepalive();
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
    }
}

/// Holding one of these is the only way into `LinkState::Reconnecting`.
/// Dropping it without `complete` leaves the session `Idle`.
struct ReconfigureGuard<'a> {
    state: &'a Mutex<LinkState>,
    completed: bool,
}

impl<'a> ReconfigureGuard<'a> {
    fn acquire(inner: &'a SessionInner) -> Result<Self> {
        let mut state = lock(&inner.state);
        if *state == LinkState::Reconnecting {
            return Err(LeapError::ReconfigurationInProgress {
                controller_id: inner.controller_id.clone(),
            });
        }
        *state = LinkState::Reconnecting;
        Ok(Self {
            state: &inner.state,
            completed: false,
        })
    }

    fn complete(mut self) {
        self.completed = true;
        *lock(self.state) = LinkState::Ready;
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *lock(self.state) = LinkState::Idle;
        }
    }
}

/// Handle to a controller session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(controller_id: impl Into<String>, connection: LeapConnection, options: SessionOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity);
        let connection = Arc::new(connection);
        let session = Self {
            inner: Arc::new(SessionInner {
                controller_id: controller_id.into(),
                options,
                connection: RwLock::new(connection.clone()),
                state: Mutex::new(LinkState::Idle),
                keepalive: Mutex::new(None),
                pump: Mutex::new(None),
                subscriptions: Mutex::new(Registry::default()),
                events,
            }),
        };
        session.attach(&connection);
        session
    }

    pub fn controller_id(&self) -> &str {
        &self.inner.controller_id
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.inner.state)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Receive lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of resources currently subscribed.
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).by_url.len()
    }

    async fn connection(&self) -> Arc<LeapConnection> {
        self.inner.connection.read().await.clone()
    }

    /// Open the connection and start the keepalive.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == LinkState::Reconnecting {
            return Err(LeapError::ReconfigurationInProgress {
                controller_id: self.inner.controller_id.clone(),
            });
        }
        let connection = self.connection().await;
        info!(
            "Connecting to controller {} at {}",
            self.inner.controller_id,
            connection.describe()
        );
        connection.connect().await?;
        {
            let mut state = lock(&self.inner.state);
            if *state == LinkState::Idle {
                *state = LinkState::Ready;
            }
        }
        self.start_keepalive();
        info!("Connected to controller {}", self.inner.controller_id);
        Ok(())
    }

    /// Send a request on the current connection.
    pub async fn request(
        &self,
        communique_type: CommuniqueType,
        url: &str,
        body: Option<Value>,
    ) -> Result<Response> {
        self.connection()
            .await
            .request(communique_type, url, body)
            .await
    }

    /// `ReadRequest` that fails on an exception or error status.
    pub async fn read(&self, url: &str) -> Result<Response> {
        self.request(CommuniqueType::ReadRequest, url, None)
            .await?
            .ensure_success()
    }

    /// `ReadRequest` with the body decoded as `T`.
    pub async fn read_body<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.read(url).await?.body_as()
    }

    pub async fn ping(&self) -> Result<Response> {
        self.read(protocol::PING_URL).await
    }

    /// Subscribe to `url`. The callback runs for every later push on it,
    /// including pushes after the connection has been replaced and the
    /// subscription re-issued.
    pub async fn subscribe<F>(&self, url: &str, callback: F) -> Result<Response>
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.subscribe_shared(url, Arc::new(callback)).await
    }

    pub async fn subscribe_shared(&self, url: &str, callback: SubscriptionCallback) -> Result<Response> {
        let tag = lock(&self.inner.subscriptions).register(url, callback);
        debug!("Subscribing to {} on controller {}", url, self.inner.controller_id);
        self.connection()
            .await
            .request_tagged(
                CommuniqueType::SubscribeRequest,
                url,
                None,
                &tag,
                self.inner.options.request_timeout,
            )
            .await?
            .ensure_success()
    }

    /// Subscribe to press and release events for one button.
    pub async fn subscribe_to_button(
        &self,
        button_href: &str,
        callback: SubscriptionCallback,
    ) -> Result<Response> {
        self.subscribe_shared(&protocol::button_events_url(button_href), callback)
            .await
    }

    /// Stop the keepalive and close the connection.
    pub async fn close(&self) {
        info!("Closing session for controller {}", self.inner.controller_id);
        self.inner.stop_keepalive();
        self.connection().await.close().await;
        let mut state = lock(&self.inner.state);
        if *state == LinkState::Ready {
            *state = LinkState::Idle;
        }
    }

    /// Replace the connection after the controller moved or reappeared.
    ///
    /// The new connection is installed before the old one is drained, so no
    /// request ever observes a session without a connection. Requests still
    /// outstanding on the old connection fail with `ConnectionLost`. On
    /// success every subscriber receives `SessionEvent::Disconnected` and is
    /// expected to re-subscribe. Connecting is retried up to
    /// `reconnect_attempts` times, but a failure that is not retryable, such
    /// as unusable credentials, is returned at once.
    pub async fn reconfigure(&self, connection: LeapConnection) -> Result<()> {
        let id = &self.inner.controller_id;
        let guard = ReconfigureGuard::acquire(&self.inner)?;
        info!("Reconfiguring controller {} to {}", id, connection.describe());

        self.inner.stop_keepalive();

        let connection = Arc::new(connection);
        let old = {
            let mut slot = self.inner.connection.write().await;
            std::mem::replace(&mut *slot, connection.clone())
        };
        self.attach(&connection);
        old.drain().await;

        if let Err(e) = self.connect_with_retry(&connection).await {
            connection.drain().await;
            return Err(e);
        }

        let _ = self.inner.events.send(SessionEvent::Disconnected);
        self.start_keepalive();
        guard.complete();
        info!("Controller {} reconfigured", id);
        Ok(())
    }

    async fn connect_with_retry(&self, connection: &LeapConnection) -> Result<()> {
        let attempts = self.inner.options.reconnect_attempts;
        let delay = self.inner.options.reconnect_delay;
        for attempt in 1..=attempts {
            match connection.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    error!(
                        "Controller {} cannot be reached with this connection: {}",
                        self.inner.controller_id, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to controller {} failed: {}",
                        attempt, attempts, self.inner.controller_id, e
                    );
                    if attempt < attempts {
                        sleep(delay).await;
                    }
                }
            }
        }
        error!(
            "Giving up on controller {} after {} attempts",
            self.inner.controller_id, attempts
        );
        Err(LeapError::ReconfigurationExhausted { attempts })
    }

    /// Route this connection's inbound traffic into the session, replacing
    /// whatever was routed before.
    fn attach(&self, connection: &LeapConnection) {
        let Some(rx) = connection.take_events() else {
            warn!(
                "Connection for controller {} already has a listener",
                self.inner.controller_id
            );
            return;
        };
        let handle = tokio::spawn(pump(Arc::downgrade(&self.inner), rx));
        if let Some(previous) = lock(&self.inner.pump).replace(handle) {
            previous.abort();
        }
    }

    fn start_keepalive(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.options.ping_interval;
        let deadline = self.inner.options.ping_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let connection = inner.connection.read().await.clone();
                let id = inner.controller_id.clone();
                drop(inner);

                match connection
                    .request_within(deadline, CommuniqueType::ReadRequest, protocol::PING_URL, None)
                    .await
                {
                    Ok(resp) => debug!(
                        "Ping controller {}: {}",
                        id,
                        resp.header
                            .status_code
                            .map(|s| s.to_string())
                            .unwrap_or_default()
                    ),
                    Err(e) => debug!("Ping controller {} failed: {}", id, e),
                }
            }
        });

        if let Some(previous) = lock(&self.inner.keepalive).replace(handle) {
            previous.abort();
        }
    }
}

async fn pump(weak: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            ConnectionEvent::Message(response) => inner.dispatch(response),
            ConnectionEvent::Disconnected => {
                info!("Controller {} disconnected", inner.controller_id);
                let _ = inner.events.send(SessionEvent::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;

    fn push(url: &str, tag: Option<&str>) -> Response {
        Response {
            communique_type: CommuniqueType::ReadResponse,
            header: Header {
                url: Some(url.to_string()),
                client_tag: tag.map(str::to_string),
                ..Header::default()
            },
            body: None,
        }
    }

    fn counting() -> (SubscriptionCallback, Arc<std::sync::atomic::AtomicUsize>) {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        let cb: SubscriptionCallback = Arc::new(move |_: &Response| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        (cb, count)
    }

    #[test]
    fn test_registry_routes_by_tag_then_url() {
        let mut registry = Registry::default();
        let (cb, _) = counting();
        let tag = registry.register("/button/1/status/event", cb);

        assert!(registry.callback_for(&push("/elsewhere", Some(&tag))).is_some());
        assert!(registry.callback_for(&push("/button/1/status/event", None)).is_some());
        assert!(registry.callback_for(&push("/button/2/status/event", None)).is_none());
    }

    #[test]
    fn test_registry_resubscribe_replaces() {
        let mut registry = Registry::default();
        let (first, first_count) = counting();
        let (second, second_count) = counting();
        let old_tag = registry.register("/button/1/status/event", first);
        let new_tag = registry.register("/button/1/status/event", second);

        assert_ne!(old_tag, new_tag);
        assert_eq!(registry.by_url.len(), 1);
        assert_eq!(registry.url_by_tag.len(), 1);

        let cb = registry
            .callback_for(&push("/button/1/status/event", Some(&new_tag)))
            .unwrap();
        cb(&push("/button/1/status/event", None));
        assert_eq!(first_count.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(second_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
