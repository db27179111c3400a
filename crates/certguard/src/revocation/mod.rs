//! Revocation data augmentation
//!
//! Before a chain reaches the underlying verifier, fresh OCSP responses or
//! CRLs are fetched for every non-root certificate and attached to it, so
//! the verifier sees current revocation information rather than whatever
//! it happened to have cached.
//!
//! # Architecture
//!
//! ```text
//! RevocationDownloadCoordinator (downloads.rs)
//!   ├─ builds revocation-check chains (store::CertificateStore)
//!   ├─ writes cache hits synchronously (cache::RevocationCache)
//!   └─ RevocationDownloads: one RevocationFetch per remaining certificate
//!        └─ RevocationFetch (task.rs)
//!             ├─ CheckingCache → Fetching → Done
//!             ├─ Retrying: next URL of the same kind
//!             ├─ FallingBack: OCSP exhausted, switch to CRL
//!             └─ fetch::RevocationFetcher (deduplicated per coordinator)
//! ```
//!
//! Download failures never surface to callers. A certificate without data
//! just reaches the verifier unaugmented.

pub mod cache;
pub mod crl;
pub(crate) mod der;
pub mod downloads;
pub mod fetch;
pub mod ocsp;
pub mod task;

use crate::cert::RevocationKind;
use chrono::{DateTime, Utc};
use tracing::debug;

pub use cache::{MemoryRevocationCache, RevocationCache};
pub use downloads::{DownloadSummary, RevocationDownloadCoordinator, RevocationDownloads};
pub use fetch::{
    CacheMode, FetchError, FetchRequest, FetchResponse, HttpRevocationFetcher, RevocationFetcher,
};
pub use task::{FetchOutcome, RevocationFetch};

/// Where a response sits relative to its validity window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Current,
    NotYetValid,
    Expired,
}

/// Whether `response` parses and is inside its validity window at `now`
///
/// OCSP responses must also carry a successful response status.
pub fn is_time_valid_response(response: &[u8], kind: RevocationKind, now: DateTime<Utc>) -> bool {
    let freshness = match kind {
        RevocationKind::Ocsp => ocsp::OcspResponse::parse(response).map(|r| r.freshness(now)),
        RevocationKind::Crl => crl::CrlInfo::parse_der(response).map(|c| c.freshness(now)),
    };

    match freshness {
        Ok(Freshness::Current) => true,
        Ok(other) => {
            debug!(%kind, freshness = ?other, "Revocation response outside validity window");
            false
        }
        Err(e) => {
            debug!(%kind, error = %e, "Revocation response failed to parse");
            false
        }
    }
}

/// [`is_time_valid_response`] against the current time
pub fn is_time_valid_now(response: &[u8], kind: RevocationKind) -> bool {
    is_time_valid_response(response, kind, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ocsp::testing::{encode_response, placeholder_cert_id};
    use ocsp::CertificateStatus;

    #[test]
    fn test_ocsp_time_validity() {
        let now = Utc::now();
        let fresh = encode_response(
            &placeholder_cert_id(),
            &CertificateStatus::Good,
            now - Duration::minutes(5),
            Some(now + Duration::hours(1)),
        );
        assert!(is_time_valid_response(&fresh, RevocationKind::Ocsp, now));
        assert!(!is_time_valid_response(
            &fresh,
            RevocationKind::Ocsp,
            now + Duration::hours(2)
        ));
    }

    #[test]
    fn test_garbage_is_never_valid() {
        assert!(!is_time_valid_now(b"garbage", RevocationKind::Ocsp));
        assert!(!is_time_valid_now(b"garbage", RevocationKind::Crl));
    }
}
