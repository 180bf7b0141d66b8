use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::SymbolMatch;

/// Opaque per-symbol quote payload as served to clients.
pub type QuoteFields = Map<String, Value>;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    /// Upstream answered 429; eligible for stale fallback.
    #[error("rate_limited")]
    RateLimited,
    #[error("{0}")]
    Upstream(String),
}

/// Upstream quote source; object-safe so tests can substitute a counting
/// double.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<QuoteFields, ProviderError>;
    async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, ProviderError>;
}

#[derive(Clone, Debug)]
pub struct QuoteConfig {
    /// Cache entries older than this are stale.
    pub ttl: Duration,
    /// Minimum spacing between upstream calls, process-wide.
    pub min_interval: Duration,
    /// Cache cap; the oldest entry is evicted past this.
    pub max_symbols: usize,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            min_interval: Duration::from_secs(10),
            max_symbols: 1024,
        }
    }
}

impl QuoteConfig {
    pub fn from_env() -> Self {
        fn secs_env(name: &str, default: u64) -> Duration {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        }
        Self {
            ttl: secs_env("QUOTE_CACHE_TTL_SECS", 60),
            min_interval: secs_env("QUOTE_MIN_INTERVAL_SECS", 10),
            ..Self::default()
        }
    }
}

struct CachedQuote {
    data: QuoteFields,
    fetched_at: Instant,
}

/// TTL cache + global throttle in front of a quote provider.
///
/// The throttle timestamp is advanced under the mutex *before* the upstream
/// call (check-and-reserve), so two concurrent requests can never both pass
/// the gate. A failed call therefore still consumes the window, which is the
/// behavior we want when the upstream is already rate-limiting us.
pub struct QuoteService {
    provider: Arc<dyn QuoteProvider>,
    cache: DashMap<String, CachedQuote>,
    last_call: Mutex<Option<Instant>>,
    cfg: QuoteConfig,
}

impl QuoteService {
    pub fn new(provider: Arc<dyn QuoteProvider>, cfg: QuoteConfig) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            last_call: Mutex::new(None),
            cfg,
        }
    }

    /// Resolve a comma-separated symbol list into per-symbol outcomes.
    ///
    /// Every symbol yields an entry: the quote payload (with `"stale": true`
    /// when served past TTL under throttle), or `{"error": ...}`. The result
    /// map itself never fails.
    pub async fn get_quotes(&self, symbols: &str) -> Map<String, Value> {
        let mut result = Map::new();
        for key in normalize_symbols(symbols) {
            if result.contains_key(&key) {
                continue; // deduped
            }
            let outcome = self.resolve(&key).await;
            result.insert(key, outcome);
        }
        result
    }

    async fn resolve(&self, key: &str) -> Value {
        // Copy out of the map so no shard lock is held across the await.
        let cached = self
            .cache
            .get(key)
            .map(|e| (e.data.clone(), e.fetched_at.elapsed() < self.cfg.ttl));

        if let Some((data, true)) = &cached {
            return Value::Object(data.clone());
        }

        if !self.reserve_upstream_slot() {
            // throttled: serve stale if we have anything, else report it
            return match cached {
                Some((mut data, _)) => {
                    log::warn!("serving stale quote for {key} (throttled)");
                    data.insert("stale".into(), Value::Bool(true));
                    Value::Object(data)
                }
                None => error_value("rate_limited"),
            };
        }

        match self.provider.quote(key).await {
            Ok(data) => {
                self.store(key, data.clone());
                Value::Object(data)
            }
            Err(ProviderError::RateLimited) => match cached {
                Some((mut data, _)) => {
                    log::warn!("upstream rate-limited; serving stale quote for {key}");
                    data.insert("stale".into(), Value::Bool(true));
                    Value::Object(data)
                }
                None => error_value("rate_limited"),
            },
            Err(ProviderError::Upstream(msg)) => {
                log::error!("quote fetch failed for {key}: {msg}");
                error_value(&msg)
            }
        }
    }

    /// Check-and-reserve on the shared throttle timestamp. Returns whether
    /// this caller may hit the upstream; if so the window is already claimed.
    fn reserve_upstream_slot(&self) -> bool {
        let mut last = self.last_call.lock().unwrap();
        match *last {
            Some(t) if t.elapsed() < self.cfg.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    fn store(&self, key: &str, data: QuoteFields) {
        if !self.cache.contains_key(key) && self.cache.len() >= self.cfg.max_symbols {
            // evict the oldest symbol; O(n) scan is fine at this cap
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.value().fetched_at)
                .map(|e| e.key().clone());
            if let Some(k) = oldest {
                self.cache.remove(&k);
            }
        }
        self.cache.insert(
            key.to_string(),
            CachedQuote {
                data,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Direct passthrough to the provider's symbol search. No cache, no
    /// throttle; failures surface as a single gateway error.
    pub async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, ProviderError> {
        self.provider.search(query).await
    }
}

/// Trim, uppercase and drop empty tokens; storage and lookup keys must agree.
fn normalize_symbols(symbols: &str) -> Vec<String> {
    symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn error_value(msg: &str) -> Value {
    let mut m = Map::new();
    m.insert("error".into(), Value::String(msg.to_string()));
    Value::Object(m)
}

// ---------------- Finnhub-backed provider ----------------

const DEFAULT_API_BASE: &str = "https://finnhub.io/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Thin reqwest client for the Finnhub REST API. The base URL is injectable
/// so tests can point it at a mock server.
pub struct FinnhubClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl FinnhubClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    pub fn from_env() -> Self {
        let base = std::env::var("FINNHUB_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into());
        let key = std::env::var("FINNHUB_API_KEY").unwrap_or_default();
        let timeout = std::env::var("UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Self::new(base, key, Duration::from_secs(timeout))
    }
}

#[derive(serde::Deserialize)]
struct FinnhubSearchResponse {
    #[serde(default)]
    result: Vec<SymbolMatch>,
}

#[async_trait]
impl QuoteProvider for FinnhubClient {
    async fn quote(&self, symbol: &str) -> Result<QuoteFields, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/quote", self.base_url))
            .timeout(self.timeout)
            .query(&[("symbol", symbol), ("token", &self.api_key)])
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(ProviderError::Upstream(format!(
                "finnhub returned {}",
                resp.status()
            )));
        }

        let body: Map<String, Value> = resp
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        // Finnhub returns c, d, dp, h, l, o, pc, t; keep the three the
        // dashboard renders.
        let mut quote = QuoteFields::new();
        for (from, to) in [("c", "price"), ("d", "change"), ("dp", "changePct")] {
            quote.insert(to.into(), body.get(from).cloned().unwrap_or(Value::Null));
        }
        Ok(quote)
    }

    async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/search", self.base_url))
            .timeout(self.timeout)
            .query(&[("q", query), ("token", &self.api_key)])
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ProviderError::Upstream(format!(
                "finnhub returned {}",
                resp.status()
            )));
        }

        let body: FinnhubSearchResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;
        Ok(body.result)
    }
}
