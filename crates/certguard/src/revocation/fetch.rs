//! Revocation data fetching
//!
//! [`RevocationFetcher`] is the network seam. [`HttpRevocationFetcher`]
//! does async HTTP GETs with reqwest, enforcing a per-request timeout and a
//! streamed size cap, and optionally serves cache-preferring requests from
//! a shared [`MemoryRevocationCache`].

use super::cache::MemoryRevocationCache;
use crate::cert::RevocationKind;
use crate::config::AugmentConfig;
use crate::error::GuardError;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How a fetch may use cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// Serve from cache when present, whatever its age
    PreferCache,
    /// Always go to the network
    Bypass,
}

/// One revocation fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub kind: RevocationKind,
    pub timeout: Duration,
    pub max_bytes: usize,
    pub cache_mode: CacheMode,
}

/// Body of a successful fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub body: Vec<u8>,

    /// Served from a local cache rather than the network
    pub from_cache: bool,
}

impl FetchResponse {
    pub fn network(body: Vec<u8>) -> Self {
        Self {
            body,
            from_cache: false,
        }
    }

    pub fn cached(body: Vec<u8>) -> Self {
        Self {
            body,
            from_cache: true,
        }
    }
}

/// Fetch failure
///
/// `Clone` so one outcome can be handed to every waiter on a shared fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Non-success HTTP status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Request exceeded its timeout
    #[error("Request timed out")]
    Timeout,

    /// Body larger than allowed
    #[error("Response too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),

    /// No cached copy and the network may not be used
    #[error("Not in cache")]
    CacheMiss,
}

/// Network fetch primitive for OCSP responses and CRLs
#[async_trait]
pub trait RevocationFetcher: Send + Sync {
    /// `PreferCache` may be answered from a cache; the response says so
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpRevocationFetcher {
    client: reqwest::Client,
    cache: Option<Arc<MemoryRevocationCache>>,
    offline: bool,
}

impl HttpRevocationFetcher {
    pub fn new(config: &AugmentConfig) -> Result<Self, GuardError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .user_agent(concat!("certguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GuardError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            cache: None,
            offline: false,
        })
    }

    /// Serve `PreferCache` requests from `cache` and store successful bodies in it
    pub fn with_cache(mut self, cache: Arc<MemoryRevocationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Never touch the network; requests not satisfiable from cache fail
    /// with [`FetchError::CacheMiss`]
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    async fn get(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
        let accept = match request.kind {
            RevocationKind::Ocsp => "application/ocsp-response",
            RevocationKind::Crl => "application/pkix-crl",
        };

        let mut response = self
            .client
            .get(&request.url)
            .header(ACCEPT, accept)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(length) = response.content_length() {
            let length = usize::try_from(length).unwrap_or(usize::MAX);
            if length > request.max_bytes {
                return Err(FetchError::TooLarge(length, request.max_bytes));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if body.len() + chunk.len() > request.max_bytes {
                return Err(FetchError::TooLarge(body.len() + chunk.len(), request.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl RevocationFetcher for HttpRevocationFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if request.cache_mode == CacheMode::PreferCache || self.offline {
            if let Some(cached) = self.cache.as_ref().and_then(|c| c.peek(&request.url, request.kind)) {
                debug!(url = %request.url, kind = %request.kind, "Serving revocation fetch from cache");
                return Ok(FetchResponse::cached(cached));
            }
        }
        if self.offline {
            return Err(FetchError::CacheMiss);
        }

        match self.get(request).await {
            Ok(body) => {
                debug!(url = %request.url, kind = %request.kind, bytes = body.len(), "Fetched revocation data");
                if let Some(cache) = &self.cache {
                    cache.insert(&request.url, request.kind, body.clone());
                }
                Ok(FetchResponse::network(body))
            }
            Err(e) => {
                warn!(url = %request.url, kind = %request.kind, error = %e, "Revocation fetch failed");
                Err(e)
            }
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(e.to_string())
    }
}
