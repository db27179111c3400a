//! Error types
//!
//! Two families live here:
//!
//! - [`GuardError`]: configuration and collaborator failures (bad patterns,
//!   unparseable certificates or revocation data, IO, JSON, HTTP client setup).
//! - [`CertError`] / [`CertVerifyError`]: the typed verification failures
//!   surfaced to callers of the pipeline.
//!
//! Download failures have their own type in
//! [`crate::revocation::fetch::FetchError`] because they are always swallowed.

use crate::cert::CertVerifyResult;

/// Errors raised while configuring the pipeline or talking to collaborators
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Host pattern could not be compiled
    #[error("Invalid host pattern '{0}': {1}")]
    InvalidPattern(String, String),

    /// Certificate DER could not be parsed
    #[error("Certificate parsing error: {0}")]
    CertificateError(String),

    /// OCSP response or CRL could not be parsed
    #[error("Revocation data parse error: {0}")]
    ParseError(String),

    /// SPKI hash had the wrong length or was not valid hex
    #[error("Invalid SPKI hash: {0}")]
    InvalidHash(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Typed certificate verification failure
///
/// Local post-checks (blacklist, pinning) produce `Revoked` and
/// `PinnedKeyNotInChain`; the rest come from the underlying verifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertError {
    /// Certificate (or a key in its chain) is revoked
    #[error("Certificate revoked")]
    Revoked,

    /// None of the chain's public keys is pinned for this host
    #[error("Public key not in pinned set for {0}")]
    PinnedKeyNotInChain(String),

    /// Chain does not lead to a trusted root
    #[error("Certificate authority invalid")]
    AuthorityInvalid,

    /// Certificate expired or not yet valid
    #[error("Certificate date invalid")]
    DateInvalid,

    /// Certificate is not valid for the requested host
    #[error("Certificate name does not match host")]
    CommonNameInvalid,

    /// Revocation status was required but could not be determined
    #[error("Unable to check revocation")]
    UnableToCheckRevocation,

    /// Any other verifier failure
    #[error("Invalid certificate: {0}")]
    Invalid(String),
}

impl CertError {
    fn severity(&self) -> u8 {
        match self {
            CertError::Revoked => 6,
            CertError::PinnedKeyNotInChain(_) => 5,
            CertError::AuthorityInvalid => 4,
            CertError::Invalid(_) => 3,
            CertError::CommonNameInvalid => 2,
            CertError::DateInvalid => 2,
            CertError::UnableToCheckRevocation => 1,
        }
    }

    /// Pick the stricter of an existing (optional) error and a new one.
    ///
    /// Ties keep the existing error.
    pub fn stricter(existing: Option<CertError>, candidate: CertError) -> CertError {
        match existing {
            Some(current) if current.severity() >= candidate.severity() => current,
            _ => candidate,
        }
    }
}

/// Failed verification: the error plus whatever result was computed
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct CertVerifyError {
    /// The surfaced error
    pub error: CertError,

    /// Partial result (chain, hashes, status bits) at the time of failure
    pub result: CertVerifyResult,
}

impl CertVerifyError {
    pub fn new(error: CertError, result: CertVerifyResult) -> Self {
        Self { error, result }
    }
}
