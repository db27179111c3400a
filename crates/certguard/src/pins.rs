//! Host-to-public-key pinning
//!
//! A pinset maps a host pattern to the SPKI hashes acceptable for matching
//! hosts. Pinsets are checked in registration order and the first pattern
//! that matches decides; later, possibly more specific, patterns are not
//! consulted.

use crate::cert::{SpkiHash, SHA256_LEN};
use crate::config::PinRule;
use crate::error::GuardError;
use crate::pattern::HostPattern;
use std::collections::HashSet;
use tracing::debug;

/// Result of a pin check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    /// No pinset matches the host; treated as a pass
    NoPinsDefined,
    /// At least one presented key is pinned
    Verified,
    /// A pinset matched but no presented key is in it
    NotVerified,
}

#[derive(Debug)]
struct Pinset {
    pattern: HostPattern,
    acceptable: HashSet<SpkiHash>,
}

/// Registry of pinsets
#[derive(Debug, Default)]
pub struct PinStore {
    pinsets: Vec<Pinset>,
}

impl PinStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load declarative pin rules
    pub fn from_rules(rules: &[PinRule]) -> Result<Self, GuardError> {
        let mut store = Self::new();
        for rule in rules {
            for hash in &rule.spki_sha256 {
                store.add_pin(&rule.pattern, hash.as_bytes())?;
            }
        }
        Ok(store)
    }

    /// Append `public_key_hash` to the pinset for `host_pattern`, creating it if absent
    ///
    /// # Panics
    ///
    /// If `public_key_hash` is not exactly a SHA-256 digest.
    pub fn add_pin(&mut self, host_pattern: &str, public_key_hash: &[u8]) -> Result<(), GuardError> {
        let Some(hash) = SpkiHash::from_slice(public_key_hash) else {
            panic!(
                "pin for '{}' must be a SHA-256 digest ({} bytes), got {} bytes",
                host_pattern,
                SHA256_LEN,
                public_key_hash.len()
            );
        };

        if let Some(pinset) = self
            .pinsets
            .iter_mut()
            .find(|p| p.pattern.as_str() == host_pattern)
        {
            pinset.acceptable.insert(hash);
            return Ok(());
        }

        let pattern = HostPattern::new(host_pattern)?;
        self.pinsets.push(Pinset {
            pattern,
            acceptable: HashSet::from([hash]),
        });
        debug!(pattern = host_pattern, "Registered new pinset");
        Ok(())
    }

    /// Check presented key hashes against the first pinset matching `hostname`
    pub fn check_pins(&self, hostname: &str, presented: &[SpkiHash]) -> PinCheck {
        let Some(pinset) = self.pinsets.iter().find(|p| p.pattern.matches(hostname)) else {
            return PinCheck::NoPinsDefined;
        };

        if presented.iter().any(|h| pinset.acceptable.contains(h)) {
            PinCheck::Verified
        } else {
            PinCheck::NotVerified
        }
    }

    pub fn len(&self) -> usize {
        self.pinsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pinsets.is_empty()
    }
}
