mod api;
mod config;
mod decorator;
mod dom;
mod error;
mod finder;
mod poller;
mod rates;
mod session;
mod settings;
mod state;
mod supervisor;
mod types;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::config::{Config, RATE_FETCH_TIMEOUT_MS};
use crate::dom::{fixture, Dom, MemoryDom};
use crate::error::Result;
use crate::rates::HttpRateRelay;
use crate::session::PageSession;
use crate::settings::SqliteSettingsStore;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Settings store ---
    let settings = Arc::new(SqliteSettingsStore::open(&cfg.db_path).await?);
    info!("Settings store ready at {}", cfg.db_path);

    // --- Host page ---
    let dom: Arc<dyn Dom> = match &cfg.page_fixture {
        Some(path) => Arc::new(fixture::load_page(path)?),
        None => {
            warn!("PAGE_FIXTURE not set, starting on an empty page");
            Arc::new(MemoryDom::new())
        }
    };

    // --- Rate relay ---
    let relay = Arc::new(HttpRateRelay::new(
        cfg.relay_url.clone(),
        Duration::from_millis(RATE_FETCH_TIMEOUT_MS),
    )?);

    // --- Session ---
    let session = Arc::new(PageSession::start(&cfg, dom, settings, relay).await?);

    // --- HTTP API server ---
    let app = router(ApiState { session: Arc::clone(&session) });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    session.shutdown();
    Ok(())
}
