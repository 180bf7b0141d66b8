use async_trait::async_trait;
use bullionx::models::SymbolMatch;
use bullionx::quotes::{ProviderError, QuoteConfig, QuoteFields, QuoteProvider, QuoteService};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counting test double: returns a payload carrying the symbol and the call
/// number, so cache hits are distinguishable from fresh fetches.
#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
    fail_with: Option<ProviderError>,
}

impl CountingProvider {
    fn rate_limited() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(ProviderError::RateLimited),
        }
    }
    fn failing(msg: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(ProviderError::Upstream(msg.into())),
        }
    }
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteProvider for CountingProvider {
    async fn quote(&self, symbol: &str) -> Result<QuoteFields, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.fail_with {
            Some(ProviderError::RateLimited) => Err(ProviderError::RateLimited),
            Some(ProviderError::Upstream(m)) => Err(ProviderError::Upstream(m.clone())),
            None => {
                let mut q = QuoteFields::new();
                q.insert("price".into(), json!(100.0 + n as f64));
                q.insert("symbol".into(), json!(symbol));
                Ok(q)
            }
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, ProviderError> {
        if let Some(ProviderError::Upstream(m)) = &self.fail_with {
            return Err(ProviderError::Upstream(m.clone()));
        }
        Ok(vec![SymbolMatch {
            symbol: query.to_uppercase(),
            description: format!("{query} inc"),
        }])
    }
}

fn service(provider: Arc<CountingProvider>, ttl_ms: u64, interval_ms: u64) -> QuoteService {
    QuoteService::new(
        provider,
        QuoteConfig {
            ttl: Duration::from_millis(ttl_ms),
            min_interval: Duration::from_millis(interval_ms),
            max_symbols: 1024,
        },
    )
}

#[tokio::test]
async fn fresh_cache_hit_suppresses_second_upstream_call() {
    let provider = Arc::new(CountingProvider::default());
    let svc = service(provider.clone(), 60_000, 0);

    let first = svc.get_quotes("AAPL").await;
    let second = svc.get_quotes("AAPL").await;

    assert_eq!(provider.calls(), 1);
    // bit-identical cached payload
    assert_eq!(first["AAPL"], second["AAPL"]);
    assert_eq!(first["AAPL"]["price"], json!(101.0));
}

#[tokio::test]
async fn symbol_identity_is_case_insensitive() {
    let provider = Arc::new(CountingProvider::default());
    let svc = service(provider.clone(), 60_000, 0);

    let result = svc.get_quotes("AAPL,aapl, Aapl ").await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(result.len(), 1);
    assert!(result.contains_key("AAPL"));

    // lookups normalize the same way as storage
    let again = svc.get_quotes("aapl").await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(again["AAPL"], result["AAPL"]);
}

#[tokio::test]
async fn empty_and_whitespace_tokens_are_skipped() {
    let provider = Arc::new(CountingProvider::default());
    let svc = service(provider.clone(), 60_000, 0);

    let result = svc.get_quotes(" , ,, ").await;
    assert!(result.is_empty());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn throttled_symbol_without_cache_reports_rate_limited() {
    let provider = Arc::new(CountingProvider::default());
    let svc = service(provider.clone(), 60_000, 10_000);

    // first call claims the upstream window
    svc.get_quotes("AAPL").await;
    assert_eq!(provider.calls(), 1);

    // uncached symbol inside the window: throttled, no upstream call
    let result = svc.get_quotes("MSFT").await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(result["MSFT"], json!({"error": "rate_limited"}));
}

#[tokio::test]
async fn stale_entry_is_served_under_throttle_with_marker() {
    let provider = Arc::new(CountingProvider::default());
    // entries go stale almost immediately; window stays closed
    let svc = service(provider.clone(), 30, 60_000);

    let fresh = svc.get_quotes("AAPL").await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let stale = svc.get_quotes("AAPL").await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(stale["AAPL"]["price"], fresh["AAPL"]["price"]);
    assert_eq!(stale["AAPL"]["stale"], json!(true));
    // the fresh payload itself carries no marker
    assert!(fresh["AAPL"].get("stale").is_none());
}

#[tokio::test]
async fn throttle_window_is_global_across_symbols_and_requests() {
    // TTL 600ms, throttle 100ms: a scaled-down version of the 60s/10s pair.
    let provider = Arc::new(CountingProvider::default());
    let svc = service(provider.clone(), 600, 100);

    // t=0: fetch AAPL (call #1, cached)
    svc.get_quotes("AAPL").await;
    assert_eq!(provider.calls(), 1);

    // t≈50ms: cache hit, no call
    tokio::time::sleep(Duration::from_millis(50)).await;
    svc.get_quotes("AAPL").await;
    assert_eq!(provider.calls(), 1);

    // t≈650ms: AAPL stale and window elapsed -> call #2
    tokio::time::sleep(Duration::from_millis(600)).await;
    svc.get_quotes("AAPL").await;
    assert_eq!(provider.calls(), 2);

    // immediately after: MSFT has no cache and the window is closed again
    let result = svc.get_quotes("MSFT").await;
    assert_eq!(provider.calls(), 2);
    assert_eq!(result["MSFT"], json!({"error": "rate_limited"}));
}

#[tokio::test]
async fn upstream_429_falls_back_to_stale_or_error() {
    // no cache yet: 429 surfaces as rate_limited
    let provider = Arc::new(CountingProvider::rate_limited());
    let svc = service(provider.clone(), 60_000, 0);
    let result = svc.get_quotes("AAPL").await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(result["AAPL"], json!({"error": "rate_limited"}));
}

#[tokio::test]
async fn upstream_error_message_passes_through_per_symbol() {
    let provider = Arc::new(CountingProvider::failing("connection reset"));
    let svc = service(provider.clone(), 60_000, 0);

    let result = svc.get_quotes("AAPL").await;
    assert_eq!(result["AAPL"], json!({"error": "connection reset"}));
}

#[tokio::test]
async fn failed_fetch_is_not_cached() {
    let provider = Arc::new(CountingProvider::failing("boom"));
    let svc = service(provider.clone(), 60_000, 0);

    svc.get_quotes("AAPL").await;
    svc.get_quotes("AAPL").await;
    // no cache entry was created, so both attempts hit the provider
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn search_bypasses_cache_and_throttle() {
    let provider = Arc::new(CountingProvider::default());
    // window fully closed by a prior quote call
    let svc = service(provider.clone(), 60_000, 60_000);
    svc.get_quotes("AAPL").await;

    let matches = svc.search("apple").await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].symbol, "APPLE");
    // quote counter untouched by search
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn cache_is_bounded_with_oldest_first_eviction() {
    let provider = Arc::new(CountingProvider::default());
    let svc = QuoteService::new(
        provider.clone(),
        QuoteConfig {
            ttl: Duration::from_secs(60),
            min_interval: Duration::ZERO,
            max_symbols: 2,
        },
    );

    svc.get_quotes("AAA").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    svc.get_quotes("BBB").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    svc.get_quotes("CCC").await; // evicts AAA
    assert_eq!(provider.calls(), 3);

    // BBB and CCC still cached
    svc.get_quotes("BBB,CCC").await;
    assert_eq!(provider.calls(), 3);

    // AAA was evicted and must be refetched
    svc.get_quotes("AAA").await;
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn two_concurrent_requests_cannot_both_claim_the_window() {
    let provider = Arc::new(CountingProvider::default());
    let svc = Arc::new(service(provider.clone(), 60_000, 10_000));

    let a = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.get_quotes("AAPL").await })
    };
    let b = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.get_quotes("MSFT").await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    // exactly one slipped through; the other was throttled
    assert_eq!(provider.calls(), 1);
    let throttled = [&a["AAPL"], &b["MSFT"]]
        .iter()
        .filter(|v| ***v == json!({"error": "rate_limited"}))
        .count();
    assert_eq!(throttled, 1);
}

#[tokio::test]
async fn quote_value_is_opaque_to_the_cache() {
    // whatever fields the provider returns are stored and served verbatim
    let provider = Arc::new(CountingProvider::default());
    let svc = service(provider.clone(), 60_000, 0);

    let result = svc.get_quotes("TSLA").await;
    let obj = result["TSLA"].as_object().unwrap();
    assert_eq!(obj.get("symbol"), Some(&Value::String("TSLA".into())));
}
