use crate::auth::AuthConfig;
use crate::db::DbPool;
use crate::registry::SessionRegistry;
use crate::upstream::ProviderConfig;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "heliograph.db")]
    pub database: String,
    #[arg(long, default_value_t = 20)]
    pub heartbeat_interval_secs: u64,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value = "http://localhost:3001")]
    pub cors_origin: String,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub provider: ProviderConfig,
    pub auth: AuthConfig,
    pub db: DbPool,
    pub registry: Arc<SessionRegistry>,
    pub args: Arc<Args>,
}
