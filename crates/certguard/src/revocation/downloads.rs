//! Revocation download coordinator
//!
//! [`RevocationDownloadCoordinator::maybe_augment`] decides whether a
//! verification gets augmented and, if so, fans out one
//! [`RevocationFetch`] per non-root certificate of every revocation-check
//! chain. The fetches are held in a [`RevocationDownloads`] registry that
//! completes only once every one of them is done, successful or not.
//!
//! The registry polls its fetches in place rather than spawning them, so
//! dropping it cancels every pending fetch and releases every certificate
//! handle before the drop returns.

use super::cache::RevocationCache;
use super::fetch::RevocationFetcher;
use super::task::{FetchContext, FetchDedup, FetchLimits, FetchOutcome, RevocationFetch, RevocationUrls};
use crate::cert::{CertHandle, VerifyParams};
use crate::config::AugmentConfig;
use crate::error::GuardError;
use crate::pattern::HostPatternSet;
use crate::store::CertificateStore;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Tally of a completed download run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub completed: usize,
    pub written: usize,
    pub no_data: usize,
}

/// Pending fetches of one augmentation
///
/// An empty registry means every certificate was satisfied synchronously;
/// callers should continue immediately instead of awaiting [`run`](Self::run).
pub struct RevocationDownloads {
    pending: FuturesUnordered<BoxFuture<'static, FetchOutcome>>,
    cache_satisfied: usize,
}

impl RevocationDownloads {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Certificates written from cache without spawning a fetch
    pub fn cache_satisfied(&self) -> usize {
        self.cache_satisfied
    }

    /// Wait for every pending fetch; completion order does not matter
    pub async fn run(mut self) -> DownloadSummary {
        let mut summary = DownloadSummary::default();
        while let Some(outcome) = self.pending.next().await {
            summary.completed += 1;
            if outcome.is_written() {
                summary.written += 1;
            } else {
                summary.no_data += 1;
            }
        }
        summary
    }
}

impl fmt::Debug for RevocationDownloads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationDownloads")
            .field("pending", &self.pending.len())
            .field("cache_satisfied", &self.cache_satisfied)
            .finish()
    }
}

/// Decides on and launches revocation augmentation
pub struct RevocationDownloadCoordinator {
    enabled: bool,
    limits: FetchLimits,
    exceptions: RwLock<HostPatternSet>,
    store: Arc<dyn CertificateStore>,
    cache: Arc<dyn RevocationCache>,
    fetcher: RwLock<Option<Arc<dyn RevocationFetcher>>>,
}

impl RevocationDownloadCoordinator {
    pub fn new(
        config: &AugmentConfig,
        store: Arc<dyn CertificateStore>,
        cache: Arc<dyn RevocationCache>,
    ) -> Result<Self, GuardError> {
        Ok(Self {
            enabled: config.enabled,
            limits: FetchLimits {
                timeout: Duration::from_secs(config.fetch_timeout_secs),
                max_ocsp_bytes: config.max_ocsp_response_bytes,
                max_crl_bytes: config.max_crl_bytes,
            },
            exceptions: RwLock::new(HostPatternSet::from_patterns(&config.fetcher_exceptions)?),
            store,
            cache,
            fetcher: RwLock::new(None),
        })
    }

    /// Replace the hosts for which augmentation is skipped
    pub fn set_exceptions(&self, patterns: &[String]) -> Result<(), GuardError> {
        let set = HostPatternSet::from_patterns(patterns)?;
        info!(count = set.len(), "Updated revocation fetcher exceptions");
        *self.exceptions.write() = set;
        Ok(())
    }

    pub fn install_fetcher(&self, fetcher: Arc<dyn RevocationFetcher>) {
        *self.fetcher.write() = Some(fetcher);
    }

    /// Remove the fetcher; later augmentation attempts fail fast
    pub fn shutdown_fetcher(&self) -> Option<Arc<dyn RevocationFetcher>> {
        self.fetcher.write().take()
    }

    pub fn has_fetcher(&self) -> bool {
        self.fetcher.read().is_some()
    }

    /// `None` when no augmentation applies; otherwise the pending downloads
    ///
    /// Augmentation is skipped when it already ran for this verification,
    /// is disabled, or the host is excepted.
    ///
    /// # Panics
    ///
    /// If augmentation applies and no fetcher is installed.
    pub async fn maybe_augment(&self, params: &VerifyParams) -> Option<RevocationDownloads> {
        if params.did_revocation_check || !self.enabled {
            return None;
        }
        if self.exceptions.read().matches(&params.hostname) {
            debug!(host = %params.hostname, "Host excepted from revocation augmentation");
            return None;
        }

        let fetcher = self.fetcher.read().clone();
        let Some(fetcher) = fetcher else {
            panic!("revocation augmentation is enabled but no fetcher is installed");
        };

        let ctx = Arc::new(FetchContext {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            fetcher,
            dedup: FetchDedup::default(),
            limits: self.limits,
        });

        let chains = self
            .store
            .build_revocation_check_chains(params, params.require_ev);
        let chain_count = chains.len();

        let mut downloads = RevocationDownloads {
            pending: FuturesUnordered::new(),
            cache_satisfied: 0,
        };

        for chain in chains {
            let mut certs = chain.into_certs();
            // Root stays in scope until its children's URLs are known
            let root = match certs.last() {
                Some(last) if self.store.is_root(last) => certs.pop(),
                _ => None,
            };

            let urls: Vec<RevocationUrls> = (0..certs.len())
                .map(|i| {
                    let issuer: Option<&CertHandle> = certs.get(i + 1).or(root.as_ref());
                    RevocationUrls {
                        ocsp: issuer
                            .map(|issuer| self.store.ocsp_urls(&certs[i], issuer))
                            .unwrap_or_default(),
                        crl: self.store.crl_urls(&certs[i]),
                    }
                })
                .collect();
            drop(root);

            for (handle, urls) in certs.into_iter().zip(urls) {
                if urls.is_empty() {
                    debug!(subject = handle.subject(), "No revocation URLs");
                    continue;
                }
                let fetch = RevocationFetch::new(handle, urls, Arc::clone(&ctx));
                if let Some(fetch) = self.try_cache(fetch).await {
                    downloads.pending.push(Box::pin(fetch.run()));
                } else {
                    downloads.cache_satisfied += 1;
                }
            }
        }

        info!(
            host = %params.hostname,
            chains = chain_count,
            pending = downloads.len(),
            cache_satisfied = downloads.cache_satisfied,
            "Revocation augmentation started"
        );
        Some(downloads)
    }

    /// Write a valid cached response for the fetch's first URL; the fetch is
    /// handed back, positioned past the cache check, if that did not work
    async fn try_cache(&self, fetch: RevocationFetch) -> Option<RevocationFetch> {
        let url = fetch.current_url()?.to_string();
        let kind = fetch.kind();

        if let Some(cached) = self.cache.time_valid_response(&url, kind).await {
            if self
                .store
                .set_revocation_response(fetch.handle(), &cached, kind)
            {
                debug!(url = %url, %kind, "Revocation data satisfied from cache");
                return None;
            }
        }
        Some(fetch.after_cache_miss())
    }
}

impl fmt::Debug for RevocationDownloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationDownloadCoordinator")
            .field("enabled", &self.enabled)
            .field("limits", &self.limits)
            .field("exceptions", &self.exceptions.read().len())
            .field("has_fetcher", &self.has_fetcher())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{Certificate, HandleLedger, RevocationCheckChain, RevocationKind, SpkiHash};
    use crate::revocation::fetch::{FetchError, FetchRequest, FetchResponse};
    use crate::store::X509CertificateStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One chain over the presented certificates, URLs derived from subjects
    #[derive(Default)]
    struct ChainStore {
        ledger: HandleLedger,
        no_urls: Vec<String>,
    }

    impl CertificateStore for ChainStore {
        fn build_revocation_check_chains(&self, params: &VerifyParams, _: bool) -> Vec<RevocationCheckChain> {
            let certs = params
                .chain
                .iter()
                .map(|c| self.ledger.lease(Arc::clone(c)))
                .collect();
            vec![RevocationCheckChain::new(certs)]
        }
        fn ocsp_urls(&self, cert: &Certificate, _: &Certificate) -> Vec<String> {
            if self.no_urls.iter().any(|s| s == cert.subject()) {
                return vec![];
            }
            vec![format!("http://ocsp/{}", cert.subject())]
        }
        fn crl_urls(&self, cert: &Certificate) -> Vec<String> {
            if self.no_urls.iter().any(|s| s == cert.subject()) {
                return vec![];
            }
            vec![format!("http://crl/{}", cert.subject())]
        }
        fn set_revocation_response(&self, cert: &Certificate, response: &[u8], kind: RevocationKind) -> bool {
            cert.attach_revocation_response(kind, response.to_vec());
            true
        }
        fn is_time_valid_response(&self, _: &[u8], _: RevocationKind) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct MapCache(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl RevocationCache for MapCache {
        async fn time_valid_response(&self, url: &str, _: RevocationKind) -> Option<Vec<u8>> {
            self.0.get(url).cloned()
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        urls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RevocationFetcher for CountingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(request.url.clone());
            Ok(FetchResponse::network(b"fetched".to_vec()))
        }
    }

    fn cert(subject: &str, issuer: &str) -> Arc<Certificate> {
        Arc::new(Certificate::new(
            subject.as_bytes().to_vec(),
            SpkiHash::of_spki(subject.as_bytes()),
            subject,
            issuer,
        ))
    }

    fn coordinator(
        config: &AugmentConfig,
        store: Arc<ChainStore>,
        cache: MapCache,
    ) -> (RevocationDownloadCoordinator, Arc<CountingFetcher>) {
        let coordinator = RevocationDownloadCoordinator::new(config, store, Arc::new(cache)).unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        coordinator.install_fetcher(fetcher.clone());
        (coordinator, fetcher)
    }

    fn params() -> VerifyParams {
        VerifyParams::new(
            "a.example.com",
            vec![cert("leaf", "inter"), cert("inter", "root"), cert("root", "root")],
        )
    }

    #[tokio::test]
    async fn test_skips_when_already_checked_or_disabled() {
        let store = Arc::new(ChainStore::default());
        let (enabled, _) = coordinator(&AugmentConfig::default(), Arc::clone(&store), MapCache::default());
        let mut checked = params();
        checked.did_revocation_check = true;
        assert!(enabled.maybe_augment(&checked).await.is_none());

        let (disabled, _) = coordinator(&AugmentConfig::disabled(), store, MapCache::default());
        assert!(disabled.maybe_augment(&params()).await.is_none());
    }

    #[tokio::test]
    async fn test_skips_excepted_host() {
        let config = AugmentConfig {
            fetcher_exceptions: vec!["*.example.com".to_string()],
            ..AugmentConfig::default()
        };
        let (coordinator, fetcher) = coordinator(&config, Arc::new(ChainStore::default()), MapCache::default());

        assert!(coordinator.maybe_augment(&params()).await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetches_every_non_root_certificate() {
        let store = Arc::new(ChainStore::default());
        let (coordinator, fetcher) = coordinator(&AugmentConfig::default(), Arc::clone(&store), MapCache::default());
        let params = params();

        let downloads = coordinator.maybe_augment(&params).await.unwrap();
        assert_eq!(downloads.len(), 2);
        // Root handle is released up front
        assert_eq!(store.ledger.outstanding(), 2);

        let summary = downloads.run().await;
        assert_eq!(
            summary,
            DownloadSummary {
                completed: 2,
                written: 2,
                no_data: 0
            }
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.ledger.outstanding(), 0);
        assert!(params.chain[0].revocation_response(RevocationKind::Ocsp).is_some());
        assert!(params.chain[2].revocation_response(RevocationKind::Ocsp).is_none());
    }

    #[tokio::test]
    async fn test_chain_without_root_fetches_its_last_certificate() {
        let store = Arc::new(ChainStore::default());
        let (coordinator, fetcher) = coordinator(&AugmentConfig::default(), Arc::clone(&store), MapCache::default());
        let params = VerifyParams::new("a.example.com", vec![cert("leaf", "inter"), cert("inter", "elsewhere")]);

        let downloads = coordinator.maybe_augment(&params).await.unwrap();
        assert_eq!(downloads.len(), 2);
        downloads.run().await;

        // No issuer to build an OCSP request against, so CRL only
        let mut urls = fetcher.urls.lock().clone();
        urls.sort();
        assert_eq!(urls, vec!["http://crl/inter", "http://ocsp/leaf"]);
        assert_eq!(store.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_intermediate_under_unpresented_root_is_fetched() {
        use crate::testing::{issue, params, root, with_crl};

        let root = root("Store Root");
        let inter = issue(with_crl(params("Issuing CA", true), "http://crl.test/root.crl"), &root);
        let leaf = issue(with_crl(params("leaf.example.com", false), "http://crl.test/inter.crl"), &inter);

        let mut roots = rustls::RootCertStore::empty();
        roots.add(root.cert.der().clone()).unwrap();
        let store = Arc::new(X509CertificateStore::default().with_trust_anchors(&roots.roots));

        let coordinator = RevocationDownloadCoordinator::new(
            &AugmentConfig::default(),
            store.clone(),
            Arc::new(MapCache::default()),
        )
        .unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        coordinator.install_fetcher(fetcher.clone());

        let chain = vec![
            Arc::new(Certificate::from_der(&leaf.der()).unwrap()),
            Arc::new(Certificate::from_der(&inter.der()).unwrap()),
        ];
        let downloads = coordinator
            .maybe_augment(&VerifyParams::new("leaf.example.com", chain))
            .await
            .unwrap();
        assert_eq!(downloads.len(), 2);
        assert_eq!(store.ledger().outstanding(), 2);

        downloads.run().await;
        let mut urls = fetcher.urls.lock().clone();
        urls.sort();
        assert_eq!(urls, vec!["http://crl.test/inter.crl", "http://crl.test/root.crl"]);
        assert_eq!(store.ledger().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cache_hits_complete_synchronously() {
        let store = Arc::new(ChainStore::default());
        let cache = MapCache(HashMap::from([
            ("http://ocsp/leaf".to_string(), b"cached".to_vec()),
            ("http://ocsp/inter".to_string(), b"cached".to_vec()),
        ]));
        let (coordinator, fetcher) = coordinator(&AugmentConfig::default(), Arc::clone(&store), cache);
        let params = params();

        let downloads = coordinator.maybe_augment(&params).await.unwrap();
        assert!(downloads.is_empty());
        assert_eq!(downloads.cache_satisfied(), 2);
        assert_eq!(store.ledger.outstanding(), 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            params.chain[1].revocation_response(RevocationKind::Ocsp),
            Some(b"cached".to_vec())
        );
    }

    #[tokio::test]
    async fn test_certificates_without_urls_are_skipped() {
        let store = Arc::new(ChainStore {
            no_urls: vec!["leaf".to_string(), "inter".to_string()],
            ..ChainStore::default()
        });
        let (coordinator, _) = coordinator(&AugmentConfig::default(), Arc::clone(&store), MapCache::default());

        let downloads = coordinator.maybe_augment(&params()).await.unwrap();
        assert!(downloads.is_empty());
        assert_eq!(downloads.cache_satisfied(), 0);
        assert_eq!(store.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropping_downloads_releases_handles() {
        let store = Arc::new(ChainStore::default());
        let (coordinator, _) = coordinator(&AugmentConfig::default(), Arc::clone(&store), MapCache::default());

        let downloads = coordinator.maybe_augment(&params()).await.unwrap();
        assert_eq!(store.ledger.outstanding(), 2);
        drop(downloads);
        assert_eq!(store.ledger.outstanding(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "no fetcher is installed")]
    async fn test_missing_fetcher_panics() {
        let coordinator = RevocationDownloadCoordinator::new(
            &AugmentConfig::default(),
            Arc::new(ChainStore::default()),
            Arc::new(MapCache::default()),
        )
        .unwrap();
        let _ = coordinator.maybe_augment(&params()).await;
    }

    #[tokio::test]
    async fn test_shutdown_fetcher() {
        let (coordinator, _) = coordinator(
            &AugmentConfig::default(),
            Arc::new(ChainStore::default()),
            MapCache::default(),
        );
        assert!(coordinator.has_fetcher());
        assert!(coordinator.shutdown_fetcher().is_some());
        assert!(!coordinator.has_fetcher());
    }
}
