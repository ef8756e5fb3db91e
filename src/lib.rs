// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge
//
//! # leap-bridge
//!
//! Session layer for LEAP lighting controllers (RadioRA 3, HomeWorks QSX),
//! plus button-press disambiguation for the keypads and remotes they host.
//!
//! A [`Session`] keeps one mutual-TLS connection per controller, correlates
//! concurrent requests by tag, pings every 30 s, and keeps button
//! subscriptions alive across reconnects. The [`SessionManager`] turns
//! discovery announcements into new sessions or in-place reconfiguration.
//! [`walk`] reads the controller's object graph and hands every addressed
//! device to a [`DeviceWiring`]; [`ButtonWiring`] is the bundled one, turning
//! raw press/release events into single, double and long presses.
//!
//! ## Quick Start
//!
//! ```no_run
//! use leap_bridge::{
//!     BridgeOptions, ButtonWiring, ControllerAnnouncement, CredentialStore, Credentials,
//!     SessionManager, SessionOptions, walk,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut store = CredentialStore::new();
//!     store.insert(
//!         "0b1c2d3e",
//!         Credentials::from_files("ca.pem".as_ref(), "cert.pem".as_ref(), "key.pem".as_ref())?,
//!     );
//!     let manager = SessionManager::with_tls(store, SessionOptions::default());
//!
//!     let announced = manager
//!         .handle_announcement(&ControllerAnnouncement::new("0b1c2d3e", "192.168.1.40"))
//!         .await?;
//!     let (wiring, mut actions) = ButtonWiring::new(BridgeOptions::default());
//!     if let leap_bridge::Announced::Created(session) = announced {
//!         walk(&session, &wiring).await?;
//!     }
//!
//!     while let Some(action) = actions.recv().await {
//!         println!("{} button {}: {:?}", action.device, action.button_number, action.kind);
//!     }
//!     Ok(())
//! }
//! ```

pub mod buttons;
pub mod config;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod press;
pub mod protocol;
pub mod session;
pub mod topology;
pub mod transport;

// Re-exports for convenience
pub use buttons::{ButtonAction, ButtonWiring};
pub use config::{BridgeOptions, ClickSpeed, PressTiming, SessionOptions, SessionOptionsBuilder};
pub use credentials::{CredentialStore, Credentials};
pub use error::{LeapError, Result};
pub use manager::{Announced, ConnectorFactory, ControllerAnnouncement, SessionManager};
pub use press::{PressCallbacks, PressKind, PressTracker};
pub use session::{LinkState, Session, SessionEvent};
pub use topology::{DeviceWiring, ProcessorInfo, ProjectType, WalkReport, WireResult, walk};
pub use transport::{Connector, LeapConnection};
