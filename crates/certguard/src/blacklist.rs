//! SPKI revocation blacklist
//!
//! A [`SpkiBlacklist`] is an immutable snapshot of revoked public keys,
//! distributed out of band. The active snapshot lives in a
//! [`BlacklistSlot`]: readers take an `Arc` to whatever is current, writers
//! replace it wholesale. Nothing mutates a snapshot in place.
//!
//! On-disk format (JSON):
//!
//! ```json
//! { "version": 42, "revoked_spki_sha256": ["<64 hex chars>", "..."] }
//! ```

use crate::cert::SpkiHash;
use crate::error::GuardError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Result of a blacklist lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistStatus {
    Ok,
    Revoked,
}

/// Immutable set of revoked SPKI hashes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpkiBlacklist {
    #[serde(default)]
    version: u64,

    #[serde(rename = "revoked_spki_sha256", default)]
    revoked: HashSet<SpkiHash>,
}

impl SpkiBlacklist {
    pub fn new(version: u64, revoked: impl IntoIterator<Item = SpkiHash>) -> Self {
        Self {
            version,
            revoked: revoked.into_iter().collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, GuardError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GuardError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn check_spki(&self, hash: &SpkiHash) -> BlacklistStatus {
        if self.revoked.contains(hash) {
            BlacklistStatus::Revoked
        } else {
            BlacklistStatus::Ok
        }
    }

    /// `Revoked` if any presented hash is listed
    pub fn check_certificate(&self, presented: &[SpkiHash]) -> BlacklistStatus {
        if presented
            .iter()
            .any(|h| self.check_spki(h) == BlacklistStatus::Revoked)
        {
            BlacklistStatus::Revoked
        } else {
            BlacklistStatus::Ok
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

/// Lock-protected slot holding the active snapshot
#[derive(Debug, Default)]
pub struct BlacklistSlot {
    current: RwLock<Option<Arc<SpkiBlacklist>>>,
}

impl BlacklistSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Arc<SpkiBlacklist>) -> Self {
        Self {
            current: RwLock::new(Some(snapshot)),
        }
    }

    /// Replace the active snapshot, returning the previous one
    pub fn set(&self, snapshot: Option<Arc<SpkiBlacklist>>) -> Option<Arc<SpkiBlacklist>> {
        if let Some(ref s) = snapshot {
            info!(version = s.version(), entries = s.len(), "Installing SPKI blacklist snapshot");
        }
        std::mem::replace(&mut *self.current.write(), snapshot)
    }

    pub fn current(&self) -> Option<Arc<SpkiBlacklist>> {
        self.current.read().clone()
    }

    /// Check against the active snapshot; `Ok` when none is installed
    pub fn check_certificate(&self, presented: &[SpkiHash]) -> BlacklistStatus {
        match self.current() {
            Some(snapshot) => snapshot.check_certificate(presented),
            None => BlacklistStatus::Ok,
        }
    }
}
