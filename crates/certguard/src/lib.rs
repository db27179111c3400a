//! Certificate verification augmentation
//!
//! `certguard` sits in front of an X.509 chain verifier and adds three
//! things to every verification:
//!
//! - **Key pinning**: hosts matching a pinned pattern must present one of
//!   the pinned SPKI hashes somewhere in the verified chain.
//! - **SPKI blacklisting**: a swappable snapshot of revoked public keys,
//!   checked against every certificate in the chain.
//! - **Revocation prefetch**: fresh OCSP responses or CRLs are fetched for
//!   every non-root certificate and attached before the verifier runs.
//!
//! # Example
//!
//! ```no_run
//! use certguard::{
//!     AugmentConfig, BlacklistSlot, HttpRevocationFetcher, MemoryRevocationCache,
//!     RustlsCertVerifier, VerificationPipeline, VerifyParams, X509CertificateStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(chain: Vec<Arc<certguard::Certificate>>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AugmentConfig::default();
//! let cache = Arc::new(MemoryRevocationCache::from_config(&config));
//!
//! let pipeline = VerificationPipeline::new(
//!     &config,
//!     Arc::new(RustlsCertVerifier::with_public_roots()),
//!     Arc::new(X509CertificateStore::default().with_public_roots()),
//!     cache.clone(),
//!     Arc::new(BlacklistSlot::new()),
//! )?;
//! pipeline.install_fetcher(Arc::new(HttpRevocationFetcher::new(&config)?.with_cache(cache)));
//!
//! let result = pipeline.verify(VerifyParams::new("www.example.com", chain)).await?;
//! println!("verified {} certificates", result.verified_chain.len());
//! # Ok(())
//! # }
//! ```

pub mod blacklist;
pub mod cert;
pub mod config;
pub mod error;
pub mod pattern;
pub mod pins;
pub mod pipeline;
pub mod revocation;
pub mod store;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use blacklist::{BlacklistSlot, BlacklistStatus, SpkiBlacklist};
pub use cert::{
    CertHandle, CertStatus, CertVerifyResult, Certificate, HandleLedger, IssuerKey,
    RevocationCheckChain, RevocationKind, SpkiHash, VerifyParams,
};
pub use config::{AugmentConfig, PinRule};
pub use error::{CertError, CertVerifyError, GuardError};
pub use pattern::{HostPattern, HostPatternSet};
pub use pins::{PinCheck, PinStore};
pub use pipeline::{UnknownRootObserver, VerificationPipeline, VerifyOutcome, VerifyRequest};
pub use revocation::{
    CacheMode, DownloadSummary, FetchError, FetchOutcome, FetchRequest, FetchResponse,
    HttpRevocationFetcher,
    MemoryRevocationCache, RevocationCache, RevocationDownloadCoordinator, RevocationDownloads,
    RevocationFetch, RevocationFetcher,
};
pub use store::{CertificateStore, X509CertificateStore};
pub use verifier::{CertVerifier, RustlsCertVerifier};
