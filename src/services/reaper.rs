//! Background sweep of expired upload sessions.

use super::upload_service::UploadService;
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn a task that calls [`UploadService::reap_expired`] every `interval`.
/// Abort the returned handle to stop it.
pub fn spawn_reaper(service: UploadService, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(err) = service.reap_expired(Utc::now()).await {
                tracing::warn!(error = %err, "upload session reaper pass failed");
            }
        }
    })
}
