//! Per-owner quota ledger.
//!
//! The pre-upload check is advisory. The binding check is the bounded
//! `UPDATE` in [`QuotaService::apply_delta`], which runs inside the same
//! transaction as the file-record write or the soft delete.

use super::error::{UploadError, UploadResult};
use crate::models::QuotaLedger;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct QuotaService {
    db: SqlitePool,
    default_total: u64,
}

impl QuotaService {
    pub fn new(db: SqlitePool, default_total: u64) -> Self {
        Self { db, default_total }
    }

    /// Create the owner's ledger with the default quota if it is missing.
    pub async fn ensure_ledger(&self, owner_id: Uuid) -> UploadResult<QuotaLedger> {
        let now = Utc::now();
        let total = i64::try_from(self.default_total).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO quota_ledgers (owner_id, total_bytes, used_bytes, created_at, updated_at)
             VALUES (?, ?, 0, ?, ?)
             ON CONFLICT (owner_id) DO NOTHING",
        )
        .bind(owner_id)
        .bind(total)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await
        .map_err(|err| {
            UploadError::Configuration(format!("cannot create quota ledger for {owner_id}: {err}"))
        })?;

        self.get_ledger(owner_id)
            .await?
            .ok_or_else(|| UploadError::Configuration(format!("quota ledger for {owner_id} is missing")))
    }

    pub async fn get_ledger(&self, owner_id: Uuid) -> UploadResult<Option<QuotaLedger>> {
        let ledger = sqlx::query_as::<_, QuotaLedger>(
            "SELECT owner_id, total_bytes, used_bytes, created_at, updated_at
             FROM quota_ledgers WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(ledger)
    }

    /// `total - used`, never negative.
    pub async fn available_space(&self, owner_id: Uuid) -> UploadResult<u64> {
        Ok(self.ensure_ledger(owner_id).await?.available())
    }

    /// Read-only check; nothing is held for the caller.
    pub async fn reserve_if_fits(&self, owner_id: Uuid, size: u64) -> UploadResult<bool> {
        Ok(size <= self.available_space(owner_id).await?)
    }

    /// Add `delta` to `used` on the caller's transaction.
    ///
    /// Growth beyond `total` fails with `QuotaExceeded` and writes nothing.
    /// Shrinking below zero clamps at zero.
    pub async fn apply_delta(
        &self,
        conn: &mut SqliteConnection,
        owner_id: Uuid,
        delta: i64,
        now: DateTime<Utc>,
    ) -> UploadResult<()> {
        if delta == 0 {
            return Ok(());
        }

        let result = if delta > 0 {
            sqlx::query(
                "UPDATE quota_ledgers
                 SET used_bytes = used_bytes + ?, updated_at = ?
                 WHERE owner_id = ? AND used_bytes + ? <= total_bytes",
            )
            .bind(delta)
            .bind(now)
            .bind(owner_id)
            .bind(delta)
            .execute(&mut *conn)
            .await?
        } else {
            sqlx::query(
                "UPDATE quota_ledgers
                 SET used_bytes = MAX(used_bytes + ?, 0), updated_at = ?
                 WHERE owner_id = ?",
            )
            .bind(delta)
            .bind(now)
            .bind(owner_id)
            .execute(&mut *conn)
            .await?
        };

        if result.rows_affected() == 1 {
            debug!(owner_id = %owner_id, delta, "quota delta applied");
            return Ok(());
        }

        let ledger = sqlx::query_as::<_, QuotaLedger>(
            "SELECT owner_id, total_bytes, used_bytes, created_at, updated_at
             FROM quota_ledgers WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_optional(&mut *conn)
        .await?;

        match ledger {
            None => Err(UploadError::Configuration(format!(
                "quota ledger for {owner_id} is missing"
            ))),
            Some(ledger) => {
                warn!(
                    owner_id = %owner_id,
                    requested = delta,
                    available = ledger.available(),
                    "quota delta rejected"
                );
                Err(UploadError::QuotaExceeded {
                    requested: delta.unsigned_abs(),
                    available: ledger.available(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn quota(total: u64) -> (tempfile::TempDir, SqlitePool, QuotaService) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("drive.db").display());
        let pool = db::connect(&url, 2).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let service = QuotaService::new(pool.clone(), total);
        (dir, pool, service)
    }

    #[tokio::test]
    async fn ledger_is_created_once_with_default_total() {
        let (_dir, _pool, quota) = quota(100).await;
        let owner = Uuid::new_v4();

        let first = quota.ensure_ledger(owner).await.unwrap();
        let second = quota.ensure_ledger(owner).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total(), 100);
        assert_eq!(quota.available_space(owner).await.unwrap(), 100);
        assert!(quota.reserve_if_fits(owner, 100).await.unwrap());
        assert!(!quota.reserve_if_fits(owner, 101).await.unwrap());
    }

    #[tokio::test]
    async fn positive_delta_is_bounded_by_total() {
        let (_dir, pool, quota) = quota(100).await;
        let owner = Uuid::new_v4();
        quota.ensure_ledger(owner).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        quota.apply_delta(&mut tx, owner, 60, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let err = quota.apply_delta(&mut tx, owner, 41, Utc::now()).await.unwrap_err();
        assert!(matches!(err, UploadError::QuotaExceeded { requested: 41, available: 40 }));
        tx.rollback().await.unwrap();

        assert_eq!(quota.get_ledger(owner).await.unwrap().unwrap().used(), 60);
    }

    #[tokio::test]
    async fn negative_delta_clamps_at_zero() {
        let (_dir, pool, quota) = quota(100).await;
        let owner = Uuid::new_v4();
        quota.ensure_ledger(owner).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        quota.apply_delta(&mut tx, owner, 10, Utc::now()).await.unwrap();
        quota.apply_delta(&mut tx, owner, -25, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let ledger = quota.get_ledger(owner).await.unwrap().unwrap();
        assert_eq!(ledger.used(), 0);
        assert_eq!(ledger.available(), 100);
    }

    #[tokio::test]
    async fn missing_ledger_is_a_configuration_error() {
        let (_dir, pool, quota) = quota(100).await;
        let mut tx = pool.begin().await.unwrap();
        let err = quota
            .apply_delta(&mut tx, Uuid::new_v4(), -5, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Configuration(_)));
    }
}
