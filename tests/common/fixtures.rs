//! A full upload stack over a temporary SQLite database and filesystem gateway.

use super::gateway::ScriptedGateway;
use bytes::Bytes;
use cloud_drive::{
    db,
    gateway::{FilesystemGateway, ObjectGateway},
    hashing::sha256_hex,
    routes::{self, AppState},
    services::{
        FileService, QuotaService, UploadService,
        upload_service::{CreateOutcome, CreateSessionRequest, SessionTicket, UploadSettings},
    },
};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use uuid::Uuid;

pub const MIB: u64 = 1024 * 1024;

/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestDrive {
    pub db: SqlitePool,
    pub gateway: Arc<ScriptedGateway>,
    pub uploads: UploadService,
    pub files: FileService,
    pub quota: QuotaService,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestDrive {
    pub async fn new() -> Self {
        Self::with(10 * 1024 * MIB, UploadSettings::default()).await
    }

    pub async fn with(quota_total: u64, settings: UploadSettings) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let url = format!("sqlite://{}", temp_dir.path().join("meta/drive.db").display());
        let db = db::connect(&url, 5).await.expect("Failed to open database");
        db::run_migrations(&db).await.expect("Failed to migrate");

        let inner = FilesystemGateway::new(temp_dir.path().join("objects"))
            .await
            .expect("Failed to create filesystem gateway");
        let gateway = Arc::new(ScriptedGateway::new(inner));
        let dyn_gateway: Arc<dyn ObjectGateway> = gateway.clone();

        let quota = QuotaService::new(db.clone(), quota_total);
        let files = FileService::new(
            db.clone(),
            dyn_gateway.clone(),
            quota.clone(),
            8 * MIB,
            settings.provider_timeout,
        );
        let uploads = UploadService::new(db.clone(), dyn_gateway, quota.clone(), settings);

        Self {
            db,
            gateway,
            uploads,
            files,
            quota,
            _temp_dir: temp_dir,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            uploads: self.uploads.clone(),
            files: self.files.clone(),
            quota: self.quota.clone(),
            gateway: self.gateway.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        routes::app(self.state())
    }

    /// Open a session for `data` and return its ticket. Panics on instant uploads.
    pub async fn open(&self, owner_id: Uuid, name: &str, data: &[u8], chunk_size: u64) -> SessionTicket {
        match self
            .uploads
            .create(create_request(owner_id, name, data, chunk_size))
            .await
            .expect("create session")
        {
            CreateOutcome::Created(ticket) => ticket,
            CreateOutcome::Instant(record) => panic!("unexpected instant upload: {record:?}"),
        }
    }

    /// Send every chunk of `data` for `ticket`.
    pub async fn send_all(&self, owner_id: Uuid, ticket: &SessionTicket, data: &[u8]) {
        for (index, chunk) in split_into_chunks(data, ticket.chunk_size).into_iter().enumerate() {
            let hash = sha256_hex(&chunk);
            self.uploads
                .accept_chunk(owner_id, ticket.session_id, index as u32, chunk, &hash)
                .await
                .expect("accept chunk");
        }
    }

    pub async fn live_file_count(&self, owner_id: Uuid) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE owner_id = ? AND is_deleted = 0")
            .bind(owner_id)
            .fetch_one(&self.db)
            .await
            .unwrap()
    }

    pub async fn used_bytes(&self, owner_id: Uuid) -> u64 {
        self.quota
            .get_ledger(owner_id)
            .await
            .unwrap()
            .map(|ledger| ledger.used())
            .unwrap_or(0)
    }

    /// Sum of live file sizes, which the ledger must always match.
    pub async fn live_bytes(&self, owner_id: Uuid) -> u64 {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM files WHERE owner_id = ? AND is_deleted = 0",
        )
        .bind(owner_id)
        .fetch_one(&self.db)
        .await
        .unwrap();
        sum as u64
    }
}

#[allow(dead_code)]
pub fn create_request(owner_id: Uuid, name: &str, data: &[u8], chunk_size: u64) -> CreateSessionRequest {
    CreateSessionRequest {
        owner_id,
        file_name: name.to_string(),
        total_size: data.len() as u64,
        content_hash: whole_file_hash(data, chunk_size),
        chunk_size,
        parent_id: None,
    }
}

/// Hash the file the way a client streaming it in chunks would.
#[allow(dead_code)]
pub fn whole_file_hash(data: &[u8], chunk_size: u64) -> String {
    let mut hasher = Sha256::new();
    for chunk in split_into_chunks(data, chunk_size) {
        hasher.update(&chunk);
    }
    format!("{:x}", hasher.finalize())
}

#[allow(dead_code)]
pub fn split_into_chunks(data: &[u8], chunk_size: u64) -> Vec<Bytes> {
    data.chunks(chunk_size as usize)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Deterministic, non-repeating-per-seed test content.
#[allow(dead_code)]
pub fn test_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i >> 8) as u8))
        .collect()
}

#[allow(dead_code)]
pub fn quick_settings() -> UploadSettings {
    UploadSettings {
        provider_timeout: Duration::from_millis(500),
        ..UploadSettings::default()
    }
}
