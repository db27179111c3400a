//! Per-certificate revocation fetch
//!
//! A [`RevocationFetch`] owns one certificate handle and drives it through
//!
//! ```text
//! CheckingCache ──hit──────────────────────────────► Done(Written)
//!      │ miss
//!      ▼
//! Fetching(PreferCache) ──stale cached body──► Fetching(Bypass)
//!      │ ok + accepted ───────────────────────────► Done(Written)
//!      │ error / rejected / stale network body
//!      ▼
//! Retrying ──next URL──► CheckingCache
//!      │ exhausted, kind == OCSP, CRL URLs known
//!      ▼
//! FallingBack ──kind = CRL, index 0──► CheckingCache
//! ```
//!
//! Each URL costs at most one network request per kind, so a certificate
//! never sees more than `len(ocsp) + len(crl)` of them. Exhausting every
//! URL ends in `Done(NoData)`, which is not an error.
//! Dropping the fetch at any await point cancels the in-flight request and
//! releases the handle; nothing runs afterwards.

use super::cache::RevocationCache;
use super::fetch::{CacheMode, FetchError, FetchRequest, FetchResponse, RevocationFetcher};
use crate::cert::{CertHandle, RevocationKind};
use crate::store::CertificateStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Terminal result of a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A response was attached to the certificate
    Written {
        kind: RevocationKind,
        from_cache: bool,
    },
    /// Nothing was attached
    NoData,
}

impl FetchOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, FetchOutcome::Written { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    CheckingCache,
    Fetching(CacheMode),
    Retrying,
    FallingBack,
    Done(FetchOutcome),
}

/// Size and time limits applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_ocsp_bytes: usize,
    pub max_crl_bytes: usize,
}

impl FetchLimits {
    fn max_bytes(&self, kind: RevocationKind) -> usize {
        match kind {
            RevocationKind::Ocsp => self.max_ocsp_bytes,
            RevocationKind::Crl => self.max_crl_bytes,
        }
    }
}

type SharedFetch = Arc<OnceCell<Result<FetchResponse, FetchError>>>;

/// Collapses identical `(url, kind, cache mode)` fetches into one request
#[derive(Debug, Default)]
pub struct FetchDedup {
    inflight: Mutex<HashMap<(String, RevocationKind, CacheMode), SharedFetch>>,
}

impl FetchDedup {
    fn slot(&self, request: &FetchRequest) -> SharedFetch {
        let key = (request.url.clone(), request.kind, request.cache_mode);
        Arc::clone(self.inflight.lock().entry(key).or_default())
    }

    /// Fetch through `fetcher`, or wait on the identical fetch already issued
    ///
    /// If the fetch that got there first is dropped mid-flight, the next
    /// waiter issues it instead.
    pub async fn fetch(
        &self,
        fetcher: &dyn RevocationFetcher,
        request: &FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        let slot = self.slot(request);
        slot.get_or_init(|| fetcher.fetch(request)).await.clone()
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collaborators shared by every fetch of one coordinator run
pub struct FetchContext {
    pub store: Arc<dyn CertificateStore>,
    pub cache: Arc<dyn RevocationCache>,
    pub fetcher: Arc<dyn RevocationFetcher>,
    pub dedup: FetchDedup,
    pub limits: FetchLimits,
}

/// OCSP and CRL URLs for one certificate, in preference order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationUrls {
    pub ocsp: Vec<String>,
    pub crl: Vec<String>,
}

impl RevocationUrls {
    pub fn is_empty(&self) -> bool {
        self.ocsp.is_empty() && self.crl.is_empty()
    }
}

/// State machine fetching revocation data for one certificate
pub struct RevocationFetch {
    handle: CertHandle,
    kind: RevocationKind,
    urls: Vec<String>,
    crl_fallback: Vec<String>,
    url_index: usize,
    from_cache: bool,
    attempts: usize,
    state: FetchState,
    ctx: Arc<FetchContext>,
}

impl RevocationFetch {
    /// OCSP is preferred when any responder is known; with no URLs at all
    /// the fetch is already done
    pub fn new(handle: CertHandle, urls: RevocationUrls, ctx: Arc<FetchContext>) -> Self {
        let RevocationUrls { ocsp, crl } = urls;
        let (kind, urls, crl_fallback, state) = if !ocsp.is_empty() {
            (RevocationKind::Ocsp, ocsp, crl, FetchState::CheckingCache)
        } else if !crl.is_empty() {
            (RevocationKind::Crl, crl, vec![], FetchState::CheckingCache)
        } else {
            (
                RevocationKind::Crl,
                vec![],
                vec![],
                FetchState::Done(FetchOutcome::NoData),
            )
        };

        Self {
            handle,
            kind,
            urls,
            crl_fallback,
            url_index: 0,
            from_cache: false,
            attempts: 0,
            state,
            ctx,
        }
    }

    /// Skip the cache check for the current URL; the caller has already
    /// done it and missed
    pub fn after_cache_miss(mut self) -> Self {
        if self.state == FetchState::CheckingCache {
            self.state = FetchState::Fetching(CacheMode::PreferCache);
        }
        self
    }

    pub fn kind(&self) -> RevocationKind {
        self.kind
    }

    /// URL the next step will use, if any remain
    pub fn current_url(&self) -> Option<&str> {
        self.urls.get(self.url_index).map(String::as_str)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, FetchState::Done(_))
    }

    pub fn handle(&self) -> &CertHandle {
        &self.handle
    }

    /// Drive the state machine to completion
    pub async fn run(mut self) -> FetchOutcome {
        loop {
            let next = match self.state {
                FetchState::Done(outcome) => {
                    debug!(
                        subject = self.handle.subject(),
                        ?outcome,
                        attempts = self.attempts,
                        from_cache = self.from_cache,
                        "Revocation fetch finished"
                    );
                    return outcome;
                }
                FetchState::CheckingCache => self.check_cache().await,
                FetchState::Fetching(mode) => self.fetch(mode).await,
                FetchState::Retrying => self.retry(),
                FetchState::FallingBack => self.fall_back(),
            };
            self.state = next;
        }
    }

    async fn check_cache(&mut self) -> FetchState {
        let Some(url) = self.current_url() else {
            return FetchState::Retrying;
        };

        match self.ctx.cache.time_valid_response(url, self.kind).await {
            Some(cached) => {
                if self.write(&cached) {
                    debug!(url, kind = %self.kind, "Revocation cache hit");
                    self.from_cache = true;
                    FetchState::Done(FetchOutcome::Written {
                        kind: self.kind,
                        from_cache: true,
                    })
                } else {
                    FetchState::Fetching(CacheMode::PreferCache)
                }
            }
            None => FetchState::Fetching(CacheMode::PreferCache),
        }
    }

    async fn fetch(&mut self, mode: CacheMode) -> FetchState {
        let Some(url) = self.current_url() else {
            return FetchState::Retrying;
        };
        let request = FetchRequest {
            url: url.to_string(),
            kind: self.kind,
            timeout: self.ctx.limits.timeout,
            max_bytes: self.ctx.limits.max_bytes(self.kind),
            cache_mode: mode,
        };

        self.attempts += 1;
        let ctx = Arc::clone(&self.ctx);
        let result = ctx.dedup.fetch(ctx.fetcher.as_ref(), &request).await;

        match result {
            Ok(response) => {
                if !self.ctx.store.is_time_valid_response(&response.body, self.kind) {
                    if response.from_cache && mode == CacheMode::PreferCache {
                        debug!(url = %request.url, kind = %self.kind, "Stale cached response, bypassing cache");
                        return FetchState::Fetching(CacheMode::Bypass);
                    }
                    debug!(url = %request.url, kind = %self.kind, "Stale response from network");
                    return FetchState::Retrying;
                }
                if self.write(&response.body) {
                    FetchState::Done(FetchOutcome::Written {
                        kind: self.kind,
                        from_cache: false,
                    })
                } else {
                    debug!(url = %request.url, kind = %self.kind, "Revocation response rejected");
                    FetchState::Retrying
                }
            }
            Err(FetchError::CacheMiss) if mode == CacheMode::Bypass => {
                debug!(url = %request.url, "Cache miss after bypass, giving up");
                FetchState::Done(FetchOutcome::NoData)
            }
            Err(e) => {
                debug!(url = %request.url, kind = %self.kind, error = %e, "Revocation fetch attempt failed");
                FetchState::Retrying
            }
        }
    }

    fn retry(&mut self) -> FetchState {
        self.url_index += 1;
        if self.url_index < self.urls.len() {
            return FetchState::CheckingCache;
        }
        if self.kind == RevocationKind::Ocsp && !self.crl_fallback.is_empty() {
            return FetchState::FallingBack;
        }

        warn!(
            subject = self.handle.subject(),
            kind = %self.kind,
            attempts = self.attempts,
            "No revocation data obtained"
        );
        FetchState::Done(FetchOutcome::NoData)
    }

    fn fall_back(&mut self) -> FetchState {
        debug!(subject = self.handle.subject(), "OCSP exhausted, falling back to CRL");
        self.kind = RevocationKind::Crl;
        self.urls = std::mem::take(&mut self.crl_fallback);
        self.url_index = 0;
        FetchState::CheckingCache
    }

    fn write(&self, response: &[u8]) -> bool {
        self.ctx
            .store
            .set_revocation_response(&self.handle, response, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{Certificate, HandleLedger, RevocationCheckChain, SpkiHash, VerifyParams};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts any response except `b"bad"`; `b"stale"` is never time-valid
    struct TestStore;

    impl CertificateStore for TestStore {
        fn build_revocation_check_chains(&self, _: &VerifyParams, _: bool) -> Vec<RevocationCheckChain> {
            vec![]
        }
        fn ocsp_urls(&self, _: &Certificate, _: &Certificate) -> Vec<String> {
            vec![]
        }
        fn crl_urls(&self, _: &Certificate) -> Vec<String> {
            vec![]
        }
        fn set_revocation_response(&self, cert: &Certificate, response: &[u8], kind: RevocationKind) -> bool {
            if response == b"bad" || response == b"stale" {
                return false;
            }
            cert.attach_revocation_response(kind, response.to_vec());
            true
        }
        fn is_time_valid_response(&self, response: &[u8], _: RevocationKind) -> bool {
            response != b"stale"
        }
    }

    struct MapCache(HashMap<(String, RevocationKind), Vec<u8>>);

    #[async_trait]
    impl RevocationCache for MapCache {
        async fn time_valid_response(&self, url: &str, kind: RevocationKind) -> Option<Vec<u8>> {
            self.0.get(&(url.to_string(), kind)).cloned()
        }
    }

    /// Responds per `(url, mode)`; unknown URLs fail with a 500
    #[derive(Default)]
    struct ScriptedFetcher {
        responses: HashMap<(String, CacheMode), Result<FetchResponse, FetchError>>,
        calls: AtomicUsize,
        log: Mutex<Vec<(String, CacheMode)>>,
    }

    impl ScriptedFetcher {
        /// Answer from the network
        fn respond(mut self, url: &str, mode: CacheMode, result: Result<&[u8], FetchError>) -> Self {
            self.responses.insert(
                (url.to_string(), mode),
                result.map(|b| FetchResponse::network(b.to_vec())),
            );
            self
        }

        /// Answer a `PreferCache` fetch from the fetcher's own cache
        fn respond_cached(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(
                (url.to_string(), CacheMode::PreferCache),
                Ok(FetchResponse::cached(body.to_vec())),
            );
            self
        }
    }

    #[async_trait]
    impl RevocationFetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push((request.url.clone(), request.cache_mode));
            self.responses
                .get(&(request.url.clone(), request.cache_mode))
                .cloned()
                .unwrap_or(Err(FetchError::Status(500)))
        }
    }

    fn context(cache: MapCache, fetcher: Arc<ScriptedFetcher>) -> Arc<FetchContext> {
        Arc::new(FetchContext {
            store: Arc::new(TestStore),
            cache: Arc::new(cache),
            fetcher,
            dedup: FetchDedup::default(),
            limits: FetchLimits {
                timeout: Duration::from_secs(1),
                max_ocsp_bytes: 1024,
                max_crl_bytes: 1024,
            },
        })
    }

    fn leaf(ledger: &HandleLedger) -> (Arc<Certificate>, CertHandle) {
        let cert = Arc::new(Certificate::new(
            b"leaf".to_vec(),
            SpkiHash::of_spki(b"leaf"),
            "CN=leaf",
            "CN=inter",
        ));
        let handle = ledger.lease(Arc::clone(&cert));
        (cert, handle)
    }

    fn urls(ocsp: &[&str], crl: &[&str]) -> RevocationUrls {
        RevocationUrls {
            ocsp: ocsp.iter().map(|s| s.to_string()).collect(),
            crl: crl.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_no_urls_is_trivially_done() {
        let ledger = HandleLedger::new();
        let (_, handle) = leaf(&ledger);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let fetch = RevocationFetch::new(handle, RevocationUrls::default(), context(MapCache(HashMap::new()), Arc::clone(&fetcher)));

        assert!(fetch.is_done());
        assert_eq!(fetch.run().await, FetchOutcome::NoData);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_writes_without_fetching() {
        let ledger = HandleLedger::new();
        let (cert, handle) = leaf(&ledger);
        let cache = MapCache(HashMap::from([(
            ("http://ocsp/1".to_string(), RevocationKind::Ocsp),
            b"cached".to_vec(),
        )]));
        let fetcher = Arc::new(ScriptedFetcher::default());
        let fetch = RevocationFetch::new(handle, urls(&["http://ocsp/1"], &[]), context(cache, Arc::clone(&fetcher)));

        assert_eq!(
            fetch.run().await,
            FetchOutcome::Written {
                kind: RevocationKind::Ocsp,
                from_cache: true
            }
        );
        assert_eq!(cert.revocation_response(RevocationKind::Ocsp), Some(b"cached".to_vec()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stale_cached_body_is_refetched_from_network() {
        let ledger = HandleLedger::new();
        let (cert, handle) = leaf(&ledger);
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .respond_cached("http://ocsp/1", b"stale")
                .respond("http://ocsp/1", CacheMode::Bypass, Ok(b"fresh")),
        );
        let fetch = RevocationFetch::new(handle, urls(&["http://ocsp/1"], &[]), context(MapCache(HashMap::new()), Arc::clone(&fetcher)));

        assert!(fetch.run().await.is_written());
        assert_eq!(cert.revocation_response(RevocationKind::Ocsp), Some(b"fresh".to_vec()));
        assert_eq!(
            *fetcher.log.lock(),
            vec![
                ("http://ocsp/1".to_string(), CacheMode::PreferCache),
                ("http://ocsp/1".to_string(), CacheMode::Bypass),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_network_body_moves_to_next_url() {
        let ocsp = ["http://ocsp/1", "http://ocsp/2"];
        let crl = ["http://crl/1", "http://crl/2"];
        let mut fetcher = ScriptedFetcher::default();
        for url in ocsp.iter().chain(&crl) {
            fetcher = fetcher
                .respond(url, CacheMode::PreferCache, Ok(b"stale"))
                .respond(url, CacheMode::Bypass, Ok(b"stale"));
        }
        let fetcher = Arc::new(fetcher);

        let ledger = HandleLedger::new();
        let (_, handle) = leaf(&ledger);
        let fetch = RevocationFetch::new(
            handle,
            urls(&ocsp, &crl),
            context(MapCache(HashMap::new()), Arc::clone(&fetcher)),
        );

        assert_eq!(fetch.run().await, FetchOutcome::NoData);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), ocsp.len() + crl.len());
        assert!(fetcher
            .log
            .lock()
            .iter()
            .all(|(_, mode)| *mode == CacheMode::PreferCache));
    }

    #[tokio::test]
    async fn test_retries_next_url_then_falls_back_to_crl() {
        let ledger = HandleLedger::new();
        let (cert, handle) = leaf(&ledger);
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .respond("http://ocsp/2", CacheMode::PreferCache, Ok(b"bad"))
                .respond("http://crl/2", CacheMode::PreferCache, Ok(b"crl")),
        );
        let fetch = RevocationFetch::new(
            handle,
            urls(&["http://ocsp/1", "http://ocsp/2"], &["http://crl/1", "http://crl/2"]),
            context(MapCache(HashMap::new()), Arc::clone(&fetcher)),
        );

        assert_eq!(
            fetch.run().await,
            FetchOutcome::Written {
                kind: RevocationKind::Crl,
                from_cache: false
            }
        );
        assert_eq!(cert.revocation_response(RevocationKind::Crl), Some(b"crl".to_vec()));
        assert!(cert.revocation_response(RevocationKind::Ocsp).is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhausted_crl_is_no_data() {
        let ledger = HandleLedger::new();
        let (cert, handle) = leaf(&ledger);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let fetch = RevocationFetch::new(
            handle,
            urls(&[], &["http://crl/1", "http://crl/2"]),
            context(MapCache(HashMap::new()), Arc::clone(&fetcher)),
        );

        assert_eq!(fetch.run().await, FetchOutcome::NoData);
        assert!(cert.revocation_response(RevocationKind::Crl).is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_after_bypass_is_terminal() {
        let ledger = HandleLedger::new();
        let (_, handle) = leaf(&ledger);
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .respond_cached("http://ocsp/1", b"stale")
                .respond("http://ocsp/1", CacheMode::Bypass, Err(FetchError::CacheMiss)),
        );
        let fetch = RevocationFetch::new(
            handle,
            urls(&["http://ocsp/1", "http://ocsp/2"], &["http://crl/1"]),
            context(MapCache(HashMap::new()), Arc::clone(&fetcher)),
        );

        assert_eq!(fetch.run().await, FetchOutcome::NoData);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dedup_shares_one_fetch() {
        let fetcher = Arc::new(
            ScriptedFetcher::default().respond("http://crl/1", CacheMode::PreferCache, Ok(b"crl")),
        );
        let ctx = context(MapCache(HashMap::new()), Arc::clone(&fetcher));
        let ledger = HandleLedger::new();

        let (a_cert, a) = leaf(&ledger);
        let (b_cert, b) = leaf(&ledger);
        let a = RevocationFetch::new(a, urls(&[], &["http://crl/1"]), Arc::clone(&ctx)).after_cache_miss();
        let b = RevocationFetch::new(b, urls(&[], &["http://crl/1"]), Arc::clone(&ctx)).after_cache_miss();

        let (ra, rb) = tokio::join!(a.run(), b.run());
        assert!(ra.is_written() && rb.is_written());
        assert_eq!(a_cert.revocation_response(RevocationKind::Crl), Some(b"crl".to_vec()));
        assert_eq!(b_cert.revocation_response(RevocationKind::Crl), Some(b"crl".to_vec()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.dedup.len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_fetch_releases_handle() {
        struct NeverFetcher;

        #[async_trait]
        impl RevocationFetcher for NeverFetcher {
            async fn fetch(&self, _: &FetchRequest) -> Result<FetchResponse, FetchError> {
                std::future::pending().await
            }
        }

        let ledger = HandleLedger::new();
        let (_, handle) = leaf(&ledger);
        let ctx = Arc::new(FetchContext {
            store: Arc::new(TestStore),
            cache: Arc::new(MapCache(HashMap::new())),
            fetcher: Arc::new(NeverFetcher),
            dedup: FetchDedup::default(),
            limits: FetchLimits {
                timeout: Duration::from_secs(1),
                max_ocsp_bytes: 1024,
                max_crl_bytes: 1024,
            },
        });
        let fetch = RevocationFetch::new(handle, urls(&["http://ocsp/1"], &[]), ctx);

        let mut run = Box::pin(fetch.run());
        assert!(futures::poll!(run.as_mut()).is_pending());
        assert_eq!(ledger.outstanding(), 1);

        drop(run);
        assert_eq!(ledger.outstanding(), 0);
    }
}
