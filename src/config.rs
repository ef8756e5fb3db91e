// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use std::time::Duration;

use serde::Deserialize;

/// TLS port the controller listens on.
pub const LEAP_PORT: u16 = 8081;

/// Named speed setting for one press-disambiguation tier.
///
/// `Quick`, `Default` and `Relaxed` map to increasing windows. `Disabled`
/// removes the tier entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickSpeed {
    Quick,
    #[default]
    Default,
    Relaxed,
    Disabled,
}

impl ClickSpeed {
    /// Window in which a second press counts as a double press.
    pub fn double_press_window(self) -> Option<Duration> {
        match self {
            Self::Quick => Some(Duration::from_millis(300)),
            Self::Default => Some(Duration::from_millis(500)),
            Self::Relaxed => Some(Duration::from_millis(750)),
            Self::Disabled => None,
        }
    }

    /// Hold time after which a press counts as a long press.
    pub fn long_press_window(self) -> Option<Duration> {
        match self {
            Self::Quick => Some(Duration::from_millis(350)),
            Self::Default => Some(Duration::from_millis(750)),
            Self::Relaxed => Some(Duration::from_millis(1250)),
            Self::Disabled => None,
        }
    }
}

/// Resolved timing thresholds for a Press Tracker. `None` disables the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressTiming {
    pub double_press: Option<Duration>,
    pub long_press: Option<Duration>,
}

impl PressTiming {
    pub fn new(double: ClickSpeed, long: ClickSpeed) -> Self {
        Self {
            double_press: double.double_press_window(),
            long_press: long.long_press_window(),
        }
    }
}

impl Default for PressTiming {
    fn default() -> Self {
        Self::new(ClickSpeed::Default, ClickSpeed::Default)
    }
}

/// Options for button wiring, shared by every controller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeOptions {
    /// Skip Pico remotes entirely.
    #[serde(default)]
    pub filter_pico: bool,
    #[serde(default)]
    pub click_speed_double: ClickSpeed,
    #[serde(default)]
    pub click_speed_long: ClickSpeed,
}

impl BridgeOptions {
    pub fn press_timing(&self) -> PressTiming {
        PressTiming::new(self.click_speed_double, self.click_speed_long)
    }
}

/// Timing and retry policy for one controller session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Controller TCP port (default: 8081)
    pub port: u16,
    /// Keepalive ping period (default: 30s)
    pub ping_interval: Duration,
    /// How long a keepalive ping may take before it is written off (default: 5s)
    pub ping_timeout: Duration,
    /// Deadline for any single request (default: 10s)
    pub request_timeout: Duration,
    /// Connection attempts made while reconfiguring (default: 20)
    pub reconnect_attempts: u32,
    /// Fixed delay between reconfiguration attempts (default: 1s)
    pub reconnect_delay: Duration,
    /// Capacity of the per-session lifecycle event channel
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            port: LEAP_PORT,
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            reconnect_attempts: 20,
            reconnect_delay: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

impl SessionOptions {
    /// Create a new options builder starting from defaults.
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::default()
    }
}

/// Builder for SessionOptions.
#[derive(Debug, Clone, Default)]
pub struct SessionOptionsBuilder {
    options: SessionOptions,
}

impl SessionOptionsBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.options.ping_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options.reconnect_attempts = attempts.max(1);
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.options.reconnect_delay = delay;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> SessionOptions {
        self.options
    }
}
