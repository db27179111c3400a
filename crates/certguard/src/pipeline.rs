//! Verification pipeline
//!
//! [`VerificationPipeline`] is the entry point. One verification runs:
//!
//! 1. revocation augmentation, at most once ([`RevocationDownloadCoordinator`])
//! 2. the underlying verifier ([`CertVerifier`])
//! 3. local post-checks: SPKI blacklist, then key pinning
//! 4. the unknown-root notification, for successful results only
//!
//! Local checks can only make a result stricter. A failure from the
//! underlying verifier is kept unless a local check produces a more severe
//! error.
//!
//! # Cancellation
//!
//! [`VerificationPipeline::verify`] is cancelled by dropping its future.
//! Pending downloads are polled inside that future, so every certificate
//! handle is released by the time the drop returns.
//! [`VerificationPipeline::start`] runs a verification on the tokio runtime
//! and reports through a callback; dropping the returned [`VerifyRequest`]
//! aborts it and the callback is never invoked afterwards.

use crate::blacklist::{BlacklistSlot, BlacklistStatus, SpkiBlacklist};
use crate::cert::{CertStatus, CertVerifyResult, VerifyParams};
use crate::config::AugmentConfig;
use crate::error::{CertError, CertVerifyError, GuardError};
use crate::pins::{PinCheck, PinStore};
use crate::revocation::{RevocationCache, RevocationDownloadCoordinator, RevocationFetcher};
use crate::store::CertificateStore;
use crate::verifier::CertVerifier;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives successful verifications that do not chain to a known root
pub trait UnknownRootObserver: Send + Sync {
    fn on_unknown_root(&self, hostname: &str, result: &CertVerifyResult);
}

/// Final outcome of one verification
pub type VerifyOutcome = Result<CertVerifyResult, CertVerifyError>;

type VerifyCallback = Box<dyn FnOnce(VerifyOutcome) + Send + 'static>;

/// Certificate verification with pinning, blacklisting and revocation prefetch
pub struct VerificationPipeline {
    verifier: Arc<dyn CertVerifier>,
    pins: RwLock<PinStore>,
    blacklist: Arc<BlacklistSlot>,
    downloads: RevocationDownloadCoordinator,
    observer: Option<Arc<dyn UnknownRootObserver>>,
}

impl VerificationPipeline {
    /// Build a pipeline; a fetcher must be installed before verifying if
    /// augmentation is enabled
    pub fn new(
        config: &AugmentConfig,
        verifier: Arc<dyn CertVerifier>,
        store: Arc<dyn CertificateStore>,
        cache: Arc<dyn RevocationCache>,
        blacklist: Arc<BlacklistSlot>,
    ) -> Result<Self, GuardError> {
        Ok(Self {
            verifier,
            pins: RwLock::new(PinStore::new()),
            blacklist,
            downloads: RevocationDownloadCoordinator::new(config, store, cache)?,
            observer: None,
        })
    }

    pub fn with_pins(mut self, pins: PinStore) -> Self {
        self.pins = RwLock::new(pins);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn UnknownRootObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Register `hash` as acceptable for hosts matching `pattern`
    ///
    /// # Panics
    ///
    /// If `hash` is not a SHA-256 digest.
    pub fn add_pin_for_host(&self, pattern: &str, hash: &[u8]) -> Result<(), GuardError> {
        self.pins.write().add_pin(pattern, hash)
    }

    /// Replace the SPKI blacklist snapshot, returning the previous one
    pub fn set_certificate_revocation_list(
        &self,
        snapshot: Option<Arc<SpkiBlacklist>>,
    ) -> Option<Arc<SpkiBlacklist>> {
        self.blacklist.set(snapshot)
    }

    pub fn certificate_revocation_list(&self) -> Option<Arc<SpkiBlacklist>> {
        self.blacklist.current()
    }

    pub fn set_revocation_fetcher_exceptions(&self, patterns: &[String]) -> Result<(), GuardError> {
        self.downloads.set_exceptions(patterns)
    }

    pub fn install_fetcher(&self, fetcher: Arc<dyn RevocationFetcher>) {
        self.downloads.install_fetcher(fetcher);
    }

    pub fn shutdown_fetcher(&self) -> Option<Arc<dyn RevocationFetcher>> {
        self.downloads.shutdown_fetcher()
    }

    /// Run a full verification
    ///
    /// # Panics
    ///
    /// If augmentation applies and no fetcher is installed.
    pub async fn verify(&self, mut params: VerifyParams) -> VerifyOutcome {
        if let Some(downloads) = self.downloads.maybe_augment(&params).await {
            if downloads.is_empty() {
                debug!(host = %params.hostname, "Revocation augmentation completed synchronously");
            } else {
                let summary = downloads.run().await;
                info!(
                    host = %params.hostname,
                    completed = summary.completed,
                    written = summary.written,
                    no_data = summary.no_data,
                    "Revocation augmentation finished"
                );
            }
            params.did_revocation_check = true;
        }

        let outcome = self.verifier.verify(&params, self.blacklist.current()).await;
        self.apply_local_checks(&params.hostname, outcome)
    }

    /// Run [`verify`](Self::verify) on the runtime and hand the outcome to `callback`
    ///
    /// The callback runs at most once. It must not drop the returned
    /// [`VerifyRequest`], since dropping waits for a running callback.
    pub fn start<F>(self: &Arc<Self>, params: VerifyParams, callback: F) -> VerifyRequest
    where
        F: FnOnce(VerifyOutcome) + Send + 'static,
    {
        let boxed: VerifyCallback = Box::new(callback);
        let callback = Arc::new(Mutex::new(Some(boxed)));
        let pipeline = Arc::clone(self);
        let slot = Arc::clone(&callback);

        let task = tokio::spawn(async move {
            let outcome = pipeline.verify(params).await;
            let mut pending = slot.lock();
            if let Some(callback) = pending.take() {
                callback(outcome);
            }
        });

        VerifyRequest { task, callback }
    }

    fn apply_local_checks(&self, hostname: &str, outcome: VerifyOutcome) -> VerifyOutcome {
        let (mut result, mut error) = match outcome {
            Ok(result) => (result, None),
            Err(e) => (e.result, Some(e.error)),
        };

        if self.blacklist.check_certificate(&result.public_key_hashes) == BlacklistStatus::Revoked {
            warn!(host = hostname, "Certificate chain contains a blacklisted public key");
            result.cert_status.insert(CertStatus::REVOKED);
            error = Some(CertError::stricter(error, CertError::Revoked));
        }

        if self.pins.read().check_pins(hostname, &result.public_key_hashes) == PinCheck::NotVerified {
            warn!(host = hostname, "No pinned public key in certificate chain");
            result.cert_status.insert(CertStatus::PINNED_KEY_MISSING);
            error = Some(CertError::stricter(
                error,
                CertError::PinnedKeyNotInChain(hostname.to_string()),
            ));
        }

        if let Some(error) = error {
            return Err(CertVerifyError::new(error, result));
        }

        if !result.cert_status.is_error() && !result.is_issued_by_known_root {
            if let Some(observer) = &self.observer {
                observer.on_unknown_root(hostname, &result);
            }
        }
        Ok(result)
    }
}

impl fmt::Debug for VerificationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationPipeline")
            .field("pins", &self.pins.read().len())
            .field("blacklist", &self.blacklist)
            .field("downloads", &self.downloads)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle onto a verification started with [`VerificationPipeline::start`]
///
/// Dropping it cancels the verification.
pub struct VerifyRequest {
    task: JoinHandle<()>,
    callback: Arc<Mutex<Option<VerifyCallback>>>,
}

impl VerifyRequest {
    /// The verification ran to completion (or panicked)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for VerifyRequest {
    fn drop(&mut self) {
        self.task.abort();
        self.callback.lock().take();
    }
}

impl fmt::Debug for VerifyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyRequest")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
