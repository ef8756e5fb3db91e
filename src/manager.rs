// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::SessionOptions;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::{LeapError, Result};
use crate::session::{LinkState, Session};
use crate::transport::{Connector, LeapConnection, TlsConnector};

/// A controller seen on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerAnnouncement {
    pub controller_id: String,
    pub address: String,
}

impl ControllerAnnouncement {
    pub fn new(controller_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            address: address.into(),
        }
    }
}

/// Builds the connector for an announced controller.
pub trait ConnectorFactory: Send + Sync {
    fn build(
        &self,
        announcement: &ControllerAnnouncement,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connector>>;
}

/// Mutual-TLS connectors on a fixed port.
#[derive(Debug, Clone)]
pub struct TlsConnectorFactory {
    port: u16,
}

impl TlsConnectorFactory {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl ConnectorFactory for TlsConnectorFactory {
    fn build(
        &self,
        announcement: &ControllerAnnouncement,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(TlsConnector::new(
            announcement.address.clone(),
            self.port,
            credentials,
        )?))
    }
}

/// What an announcement led to.
#[derive(Clone)]
pub enum Announced {
    /// No credentials for this controller; nothing was done.
    NoCredentials,
    /// First sighting: a new session was created and connected.
    Created(Session),
    /// Known controller: its session now runs on a new connection.
    Reconfigured(Session),
    /// A first connection or reconfiguration for this controller is
    /// already running.
    InProgress,
}

/// Claim on a controller id while its first connection is attempted.
/// Released on drop.
struct Reservation<'a> {
    connecting: &'a StdMutex<HashSet<String>>,
    key: String,
}

impl<'a> Reservation<'a> {
    fn take(connecting: &'a StdMutex<HashSet<String>>, key: &str) -> Option<Self> {
        let fresh = connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
        fresh.then(|| Self {
            connecting,
            key: key.to_string(),
        })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

enum Slot<'a> {
    Known(Session),
    Fresh(Reservation<'a>),
}

/// Owns every controller session, keyed by controller id.
pub struct SessionManager {
    credentials: CredentialStore,
    factory: Arc<dyn ConnectorFactory>,
    options: SessionOptions,
    sessions: Mutex<HashMap<String, Session>>,
    /// Ids whose first connection is in flight.
    connecting: StdMutex<HashSet<String>>,
}

impl SessionManager {
    pub fn new(
        credentials: CredentialStore,
        factory: Arc<dyn ConnectorFactory>,
        options: SessionOptions,
    ) -> Self {
        Self {
            credentials,
            factory,
            options,
            sessions: Mutex::new(HashMap::new()),
            connecting: StdMutex::new(HashSet::new()),
        }
    }

    /// Mutual TLS on the port from `options`.
    pub fn with_tls(credentials: CredentialStore, options: SessionOptions) -> Self {
        let factory = Arc::new(TlsConnectorFactory::new(options.port));
        Self::new(credentials, factory, options)
    }

    /// Handle a discovery announcement.
    ///
    /// An unknown controller gets a fresh, connected session. A known one is
    /// reconfigured onto a connection to the announced address. The id is
    /// claimed before the first connect, so a second announcement arriving
    /// meanwhile gets `InProgress` rather than a second session. A failure
    /// to connect a fresh session leaves nothing behind, so the next
    /// announcement starts over.
    pub async fn handle_announcement(&self, announcement: &ControllerAnnouncement) -> Result<Announced> {
        let key = announcement.controller_id.to_lowercase();
        let slot = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(session) => Slot::Known(session.clone()),
                None => match Reservation::take(&self.connecting, &key) {
                    Some(reservation) => Slot::Fresh(reservation),
                    None => {
                        info!(
                            "Controller {} is already connecting, ignoring announcement",
                            announcement.controller_id
                        );
                        return Ok(Announced::InProgress);
                    }
                },
            }
        };

        if let Slot::Known(session) = &slot
            && session.state() == LinkState::Reconnecting
        {
            info!(
                "Controller {} is already reconfiguring, ignoring announcement",
                announcement.controller_id
            );
            return Ok(Announced::InProgress);
        }

        let Some(credentials) = self.credentials.get(&key) else {
            info!(
                "No credentials for controller {} at {}, skipping",
                announcement.controller_id, announcement.address
            );
            return Ok(Announced::NoCredentials);
        };

        let connector = self.factory.build(announcement, credentials)?;
        let connection = LeapConnection::new(connector, self.options.request_timeout);

        match slot {
            Slot::Known(session) => {
                info!(
                    "Controller {} re-announced at {}",
                    announcement.controller_id, announcement.address
                );
                match session.reconfigure(connection).await {
                    Ok(()) => Ok(Announced::Reconfigured(session)),
                    Err(LeapError::ReconfigurationInProgress { .. }) => {
                        info!(
                            "Controller {} is already reconfiguring, ignoring announcement",
                            announcement.controller_id
                        );
                        Ok(Announced::InProgress)
                    }
                    Err(e) => {
                        error!(
                            "Reconfiguration of controller {} failed: {}",
                            announcement.controller_id, e
                        );
                        Err(e)
                    }
                }
            }
            Slot::Fresh(reservation) => {
                let session = Session::new(key.clone(), connection, self.options.clone());
                if let Err(e) = session.connect().await {
                    warn!(
                        "Could not connect to controller {}: {}",
                        announcement.controller_id, e
                    );
                    session.close().await;
                    return Err(e);
                }
                self.sessions.lock().await.insert(key, session.clone());
                drop(reservation);
                Ok(Announced::Created(session))
            }
        }
    }

    pub async fn session(&self, controller_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .await
            .get(&controller_id.to_lowercase())
            .cloned()
    }

    pub async fn controller_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take a controller out of service. Its session is closed.
    pub async fn remove(&self, controller_id: &str) -> Option<Session> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(&controller_id.to_lowercase())?;
        info!("Removing controller {}", controller_id);
        session.close().await;
        Some(session)
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
