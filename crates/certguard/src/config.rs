//! Configuration types for revocation augmentation and pinning
//!
//! These are the library-level settings. The CLI wraps them in its own
//! top-level configuration file.

use crate::cert::SpkiHash;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Revocation augmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AugmentConfig {
    /// Fetch OCSP/CRL data before invoking the underlying verifier
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Glob host patterns for which augmentation is skipped
    #[serde(default)]
    pub fetcher_exceptions: Vec<String>,

    /// Per-request network timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Maximum OCSP response size in bytes
    #[serde(default = "default_max_ocsp_response")]
    pub max_ocsp_response_bytes: usize,

    /// Maximum CRL size in bytes
    ///
    /// Protects against memory exhaustion from oversized CRLs.
    #[serde(default = "default_max_crl_size")]
    pub max_crl_bytes: usize,

    /// Maximum number of cached responses
    ///
    /// Oldest entries are evicted when the limit is reached.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,

    /// TTL for cached responses in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_cache_ttl_secs: u64,
}

impl AugmentConfig {
    /// Augmentation turned off; the underlying verifier runs directly
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl_secs)
    }
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetcher_exceptions: vec![],
            fetch_timeout_secs: default_fetch_timeout(),
            max_ocsp_response_bytes: default_max_ocsp_response(),
            max_crl_bytes: default_max_crl_size(),
            max_cache_entries: default_max_cache_entries(),
            default_cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Declarative pin: hosts matching `pattern` must present one of `spki_sha256`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinRule {
    pub pattern: String,
    pub spki_sha256: Vec<SpkiHash>,
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_fetch_timeout() -> u64 {
    15 // 15 seconds
}

fn default_max_ocsp_response() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_crl_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_max_cache_entries() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    3600 // 1 hour
}
