use certguard::{AugmentConfig, GuardError, HostPatternSet, PinRule, PinStore, SpkiBlacklist};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<GuardError> for ConfigError {
    fn from(e: GuardError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Revocation augmentation settings
    #[serde(default)]
    pub revocation: AugmentConfig,

    /// Host key pins
    #[serde(default)]
    pub pins: Vec<PinRule>,

    /// JSON SPKI blacklist snapshot to install at startup
    #[serde(default)]
    pub blacklist_path: Option<String>,

    /// PEM files holding private trust anchors
    #[serde(default)]
    pub trust_anchor_paths: Vec<String>,

    /// Trust the built-in public root store
    #[serde(default = "default_true")]
    pub use_public_roots: bool,

    /// Serve revocation fetches from cache only
    #[serde(default)]
    pub offline: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,
}

impl GuardConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: GuardConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Build the pin store described by `pins`
    pub fn pin_store(&self) -> Result<PinStore, ConfigError> {
        Ok(PinStore::from_rules(&self.pins)?)
    }

    /// Load the configured blacklist snapshot, if any
    pub fn load_blacklist(&self) -> Result<Option<SpkiBlacklist>, ConfigError> {
        match &self.blacklist_path {
            Some(path) => Ok(Some(SpkiBlacklist::from_file(path)?)),
            None => Ok(None),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.use_public_roots && self.trust_anchor_paths.is_empty() {
            return Err(ConfigError::Invalid(
                "No trust anchors: enable use_public_roots or set trust_anchor_paths".to_string(),
            ));
        }

        HostPatternSet::from_patterns(&self.revocation.fetcher_exceptions)?;

        for rule in &self.pins {
            if rule.spki_sha256.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Pin for '{}' has no hashes",
                    rule.pattern
                )));
            }
        }
        PinStore::from_rules(&self.pins)?;

        if self.revocation.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch_timeout_secs cannot be 0".to_string()));
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn example() -> Self {
        GuardConfig {
            revocation: AugmentConfig {
                fetcher_exceptions: vec!["*.internal".to_string(), "localhost".to_string()],
                ..AugmentConfig::default()
            },
            pins: vec![],
            blacklist_path: Some("/etc/certguard/blacklist.json".to_string()),
            trust_anchor_paths: vec![],
            use_public_roots: true,
            offline: false,
            log_level: Some("info".to_string()),
        }
    }
}

fn default_true() -> bool {
    true
}
