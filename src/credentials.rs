// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::{LeapError, Result};

/// PEM material for one controller: the controller's CA, our client
/// certificate, and the client private key.
#[derive(Clone)]
pub struct Credentials {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl Credentials {
    pub fn new(ca: impl Into<String>, cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            ca: ca.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Read the three PEM files from disk.
    pub fn from_files(ca: &Path, cert: &Path, key: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| LeapError::Credentials {
                reason: format!("{}: {e}", path.display()),
            })
        };
        Ok(Self::new(read(ca)?, read(cert)?, read(key)?))
    }
}

// Never print key material.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ca", &format_args!("<{} bytes>", self.ca.len()))
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Credentials keyed by controller id. Lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<String, Credentials>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, controller_id: &str, credentials: Credentials) {
        debug!("Registered credentials for controller {}", controller_id);
        self.entries.insert(controller_id.to_lowercase(), credentials);
    }

    pub fn get(&self, controller_id: &str) -> Option<&Credentials> {
        self.entries.get(&controller_id.to_lowercase())
    }

    pub fn contains(&self, controller_id: &str) -> bool {
        self.entries.contains_key(&controller_id.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
