//! Atlas entry station server
//!
//! Serves the scanning REST API on top of the local Sled store:
//! - Offline validation: Ed25519-signed compact QR codes, cached revocations
//! - Online validation and event sync when ATLAS_BACKEND_URL is set
//!
//! Usage:
//!   cargo run --bin issue_sample      # print a key pair and a signed code
//!   cargo run --bin atlas_entry       # start the station

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use atlas_entry::auth::TokenIssuer;
use atlas_entry::backend::HttpBackend;
use atlas_entry::config::Config;
use atlas_entry::entry::EntryService;
use atlas_entry::rest::create_router;
use atlas_entry::storage::Storage;
use atlas_entry::telemetry::init_logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let _log_guard = init_logging(&config)?;
    if config.uses_dev_jwt_secret() {
        warn!("ATLAS_JWT_SECRET not set, using development secret");
    }

    let keys = config.key_ring()?;
    if keys.is_empty() {
        warn!("no QR verification keys configured; every offline scan will be INVALID");
    }

    let storage = Storage::open(&config.data_dir)?;
    let mut entry = EntryService::new(storage.clone(), keys, config.max_clock_skew_minutes)
        .with_event_retention(chrono::Duration::days(config.event_retention_days.into()));
    if let Some(url) = &config.backend_url {
        let backend = HttpBackend::new(url, config.backend_token.clone(), config.backend_timeout)?;
        entry = entry.with_backend(Arc::new(backend));
        if let Err(e) = entry.refresh_revocations().await {
            warn!(error = %e, "could not refresh revocations at startup, using cached list");
        }
    } else {
        info!("no backend configured, running offline only");
    }

    let tokens = TokenIssuer::new(config.jwt_secret.as_bytes(), config.token_ttl_secs);
    let app = create_router(entry, tokens);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, data_dir = %config.data_dir, "Atlas entry station listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Shutting down...");
        })
        .await?;

    storage.flush().await?;
    Ok(())
}
