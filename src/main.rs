use anyhow::{Context, Result};
use cloud_drive::{
    config, db, gateway,
    routes::{self, AppState},
    services::{FileService, QuotaService, UploadService, reaper},
};
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cloud_drive=info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting cloud-drive with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url, 5).await?;
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let gateway = gateway::from_config(&cfg.storage)
        .await
        .context("initializing object storage")?;
    tracing::info!(backend = gateway.backend_name(), "object storage ready");

    let quota = QuotaService::new(db.clone(), cfg.default_quota_bytes);
    let uploads = UploadService::new(
        db.clone(),
        gateway.clone(),
        quota.clone(),
        cfg.upload_settings(),
    );
    let files = FileService::new(
        db.clone(),
        gateway.clone(),
        quota.clone(),
        cfg.max_small_upload,
        cfg.provider_timeout,
    );

    let reaper = reaper::spawn_reaper(uploads.clone(), cfg.reap_interval);

    // --- Build router ---
    let app = routes::app(AppState {
        db,
        uploads,
        files,
        quota,
        gateway,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app).await;
    reaper.abort();
    served?;

    Ok(())
}
