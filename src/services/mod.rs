//! Upload core: session store, dedup, quota, file records and the
//! session manager that ties them to the object gateway.

pub mod dedup;
pub mod error;
pub mod file_service;
pub mod file_writer;
pub mod quota;
pub mod reaper;
pub mod session_store;
pub mod upload_service;

use crate::gateway::{GatewayError, GatewayResult};
use std::{future::Future, time::Duration};

pub use error::{UploadError, UploadResult};
pub use file_service::FileService;
pub use quota::QuotaService;
pub use upload_service::UploadService;

/// Run a gateway call, failing with `GatewayError::Timeout` after `after`.
pub(crate) async fn bounded<T, F>(after: Duration, operation: &'static str, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout { operation, after }),
    }
}
