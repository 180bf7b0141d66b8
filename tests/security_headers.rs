#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use async_trait::async_trait;
use bullionx::models::SymbolMatch;
use bullionx::quotes::{ProviderError, QuoteConfig, QuoteFields, QuoteProvider, QuoteService};
use bullionx::repo::inmem::InMemRepo;
use bullionx::{config, AppState, SecurityHeaders};
use std::sync::Arc;

struct NoopProvider;

#[async_trait]
impl QuoteProvider for NoopProvider {
    async fn quote(&self, _symbol: &str) -> Result<QuoteFields, ProviderError> {
        Ok(QuoteFields::new())
    }
    async fn search(&self, _query: &str) -> Result<Vec<SymbolMatch>, ProviderError> {
        Ok(vec![])
    }
}

fn state() -> AppState {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("BULLIONX_DATA_DIR", tmp.path().to_str().unwrap());
    std::mem::forget(tmp);
    AppState {
        repo: Arc::new(InMemRepo::new()),
        quotes: Arc::new(QuoteService::new(
            Arc::new(NoopProvider),
            QuoteConfig::default(),
        )),
    }
}

#[actix_web::test]
#[serial_test::serial]
async fn baseline_headers_present_without_hsts() {
    std::env::remove_var("ENABLE_HSTS");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/auth/register")
        .set_json(serde_json::json!({
            "firstName": "Ada", "lastName": "Lovelace",
            "email": "headers@example.com", "password": "longenough1"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let headers = resp.headers();
    assert!(headers.get("content-security-policy").is_some());
    assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert!(headers.get("strict-transport-security").is_none()); // not enabled
}

#[actix_web::test]
#[serial_test::serial]
async fn env_var_enables_hsts() {
    std::env::set_var("ENABLE_HSTS", "1");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/auth/register")
        .set_json(serde_json::json!({
            "firstName": "Ada", "lastName": "Lovelace",
            "email": "hsts@example.com", "password": "longenough1"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert!(
        resp.headers().get("strict-transport-security").is_some(),
        "HSTS header missing"
    );
    std::env::remove_var("ENABLE_HSTS");
}
