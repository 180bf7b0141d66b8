use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use utoipa_swagger_ui::SwaggerUi;

use bullionx::openapi::ApiDoc;
use bullionx::quotes::{FinnhubClient, QuoteConfig, QuoteService};
use bullionx::routes::{config, AppState};
use bullionx::security::SecurityHeaders;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables must be set externally (shell, systemd, Docker, etc.)
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping BullionX backend");

    let quote_cfg = QuoteConfig::from_env();
    info!(
        "Quote cache TTL {:?}, upstream min interval {:?}",
        quote_cfg.ttl, quote_cfg.min_interval
    );

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = bullionx::repo::inmem::InMemRepo::new();
    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    info!("Using in-memory user store");

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        info!("Using Postgres user store");
        bullionx::repo::pg::PgRepo::new(pool)
    };

    let quotes = Arc::new(QuoteService::new(
        Arc::new(FinnhubClient::from_env()),
        quote_cfg,
    ));
    let openapi = ApiDoc::openapi();

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // Angular dev server
                .allowed_origin("http://localhost:4200")
                .allowed_origin("http://127.0.0.1:4200")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi.clone()))
            .app_data(web::Data::new(AppState {
                repo: Arc::new(repo.clone()),
                quotes: quotes.clone(),
            }))
    })
    .bind(("0.0.0.0", 8080))?;

    info!("Listening on http://0.0.0.0:8080");

    server.run().await
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    if env::var("JWT_SECRET").is_err() {
        eprintln!("Missing required environment variable JWT_SECRET");
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }

    if env::var("FINNHUB_API_KEY").is_err() {
        eprintln!("Warning: FINNHUB_API_KEY not set; upstream quote calls will fail");
    }
}
