// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

//! Press disambiguation.
//!
//! [`PressState`] is the pure state machine: it consumes press/release
//! signals and timer expiries and says what to emit and how to re-arm the
//! single timer it needs. [`PressTracker`] runs one `PressState` per button
//! on a tokio task, so signals for a button are handled strictly in arrival
//! order and timers run on tokio's clock (pausable in tests).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::config::PressTiming;
use crate::protocol::ButtonEventType;

/// A classified gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PressKind {
    Single,
    Double,
    Long,
}

impl PressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
            Self::Long => "long",
        }
    }
}

/// A raw hardware signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressSignal {
    Press,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressPhase {
    Idle,
    /// Pressed; the long-press timer (if enabled) is running.
    AwaitingRelease,
    /// Released once; the double-press window is running.
    AwaitingSecondPress,
    /// Already classified as long; waiting for the release to discard it.
    LongHeld,
}

/// What to do with the tracker's timer after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Keep,
    Start(Duration),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub emit: Option<PressKind>,
    pub timer: TimerCommand,
}

impl Step {
    const NOTHING: Step = Step {
        emit: None,
        timer: TimerCommand::Keep,
    };

    fn emit(kind: PressKind, timer: TimerCommand) -> Self {
        Self {
            emit: Some(kind),
            timer,
        }
    }

    fn timer(timer: TimerCommand) -> Self {
        Self { emit: None, timer }
    }
}

#[derive(Debug, Clone)]
pub struct PressState {
    phase: PressPhase,
    up_down: bool,
    timing: PressTiming,
}

impl PressState {
    pub fn new(up_down: bool, timing: PressTiming) -> Self {
        Self {
            phase: PressPhase::Idle,
            up_down,
            timing,
        }
    }

    pub fn phase(&self) -> PressPhase {
        self.phase
    }

    pub fn is_up_down(&self) -> bool {
        self.up_down
    }

    pub fn on_signal(&mut self, signal: PressSignal) -> Step {
        // Raise/lower paddles repeat Press while held to drive dimming.
        if self.up_down {
            return match signal {
                PressSignal::Press => Step::emit(PressKind::Single, TimerCommand::Keep),
                PressSignal::Release => Step::NOTHING,
            };
        }

        match (self.phase, signal) {
            (PressPhase::Idle, PressSignal::Press) => {
                self.phase = PressPhase::AwaitingRelease;
                Step::timer(arm(self.timing.long_press))
            }
            (PressPhase::AwaitingRelease, PressSignal::Release) => match self.timing.double_press {
                Some(window) => {
                    self.phase = PressPhase::AwaitingSecondPress;
                    Step::timer(TimerCommand::Start(window))
                }
                None => {
                    self.phase = PressPhase::Idle;
                    Step::emit(PressKind::Single, TimerCommand::Cancel)
                }
            },
            (PressPhase::AwaitingSecondPress, PressSignal::Press) => {
                self.phase = PressPhase::Idle;
                Step::emit(PressKind::Double, TimerCommand::Cancel)
            }
            (PressPhase::LongHeld, PressSignal::Release) => {
                self.phase = PressPhase::Idle;
                Step::NOTHING
            }
            _ => Step::NOTHING,
        }
    }

    pub fn on_timer(&mut self) -> Step {
        match self.phase {
            PressPhase::AwaitingRelease => {
                self.phase = PressPhase::LongHeld;
                Step::emit(PressKind::Long, TimerCommand::Cancel)
            }
            PressPhase::AwaitingSecondPress => {
                self.phase = PressPhase::Idle;
                Step::emit(PressKind::Single, TimerCommand::Cancel)
            }
            PressPhase::Idle | PressPhase::LongHeld => Step::NOTHING,
        }
    }
}

fn arm(window: Option<Duration>) -> TimerCommand {
    window.map_or(TimerCommand::Cancel, TimerCommand::Start)
}

pub type PressCallback = Arc<dyn Fn() + Send + Sync>;

/// The three gesture handlers for one button.
#[derive(Clone)]
pub struct PressCallbacks {
    pub single: PressCallback,
    pub double: PressCallback,
    pub long: PressCallback,
}

impl PressCallbacks {
    pub fn new(
        single: impl Fn() + Send + Sync + 'static,
        double: impl Fn() + Send + Sync + 'static,
        long: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            single: Arc::new(single),
            double: Arc::new(double),
            long: Arc::new(long),
        }
    }

    /// Route every gesture to one handler.
    pub fn from_fn(f: impl Fn(PressKind) + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        let (s, d, l) = (f.clone(), f.clone(), f);
        Self::new(
            move || s(PressKind::Single),
            move || d(PressKind::Double),
            move || l(PressKind::Long),
        )
    }

    fn fire(&self, kind: PressKind) {
        match kind {
            PressKind::Single => (self.single)(),
            PressKind::Double => (self.double)(),
            PressKind::Long => (self.long)(),
        }
    }
}

/// Per-button tracker running on its own task.
pub struct PressTracker {
    href: String,
    up_down: bool,
    tx: mpsc::UnboundedSender<PressSignal>,
    task: JoinHandle<()>,
}

impl PressTracker {
    pub fn spawn(
        href: impl Into<String>,
        up_down: bool,
        timing: PressTiming,
        callbacks: PressCallbacks,
    ) -> Self {
        let href = href.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            href.clone(),
            PressState::new(up_down, timing),
            callbacks,
            rx,
        ));
        Self {
            href,
            up_down,
            tx,
            task,
        }
    }

    pub fn href(&self) -> &str {
        &self.href
    }

    pub fn is_up_down(&self) -> bool {
        self.up_down
    }

    /// Feed one raw button event. Anything but Press/Release is ignored.
    pub fn update(&self, event: &ButtonEventType) {
        match event {
            ButtonEventType::Press => self.signal(PressSignal::Press),
            ButtonEventType::Release => self.signal(PressSignal::Release),
            ButtonEventType::Other(other) => {
                debug!("Ignoring {} event for button {}", other, self.href)
            }
        }
    }

    pub fn signal(&self, signal: PressSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Drop for PressTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    href: String,
    mut state: PressState,
    callbacks: PressCallbacks,
    mut rx: mpsc::UnboundedReceiver<PressSignal>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let step = tokio::select! {
            biased;
            () = wait_for(deadline) => {
                deadline = None;
                state.on_timer()
            }
            signal = rx.recv() => match signal {
                Some(signal) => state.on_signal(signal),
                None => break,
            },
        };

        match step.timer {
            TimerCommand::Keep => {}
            TimerCommand::Start(window) => deadline = Some(Instant::now() + window),
            TimerCommand::Cancel => deadline = None,
        }
        if let Some(kind) = step.emit {
            debug!("Button {}: {} press", href, kind.as_str());
            callbacks.fire(kind);
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
