use heliograph::auth::AuthConfig;
use heliograph::db::init_db;
use heliograph::logging::{setup_panic_hook, turn_id_middleware};
use heliograph::registry::SessionRegistry;
use heliograph::upstream::ProviderConfig;
use heliograph::{accounts, health, push, relay, AppState, Args};

use axum::http::{header, HeaderValue, Method};
use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "heliograph=debug,tower_http=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "heliograph.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    setup_panic_hook();

    let args = Arc::new(Args::parse());

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let provider = match ProviderConfig::from_env() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Upstream provider is not configured: {}", e);
            eprintln!("Set UPSTREAM_API_URL, UPSTREAM_API_KEY and UPSTREAM_MODEL in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let auth = match AuthConfig::from_env() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Auth is not configured: {}", e);
            eprintln!("Set JWT_SECRET in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let cors_origin = match args.cors_origin.parse::<HeaderValue>() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Invalid --cors-origin {}: {}", args.cors_origin, e);
            std::process::exit(1);
        }
    };
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let state = Arc::new(AppState {
        client,
        provider,
        auth,
        db,
        registry: Arc::new(SessionRegistry::new()),
        args: args.clone(),
    });

    let app = Router::new()
        .route("/", get(root))
        .route("/auth/register", post(accounts::register))
        .route("/auth/login", post(accounts::login))
        .route("/chat/stream", get(push::chat_stream))
        .route("/chat/message", post(relay::chat_message))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(cors)
        .layer(middleware::from_fn(turn_id_middleware))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Heliograph listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "heliograph chat relay running",
        "status": "active",
    }))
}
