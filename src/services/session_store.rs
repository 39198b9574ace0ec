//! Durable upload-session state in SQLite.
//!
//! Every state change is a conditional `UPDATE ... WHERE status IN (...)`,
//! so concurrent requests (and concurrent instances) race on the database
//! rather than on in-process locks. Inside a transaction the guarded write is
//! always the first statement, which takes SQLite's write lock up front.

use super::error::{UploadError, UploadResult, is_unique_violation};
use crate::models::{ReceivedPart, SessionStatus, UploadSession};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::collections::BTreeMap;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "session_id, owner_id, target_name, parent_id, total_size, \
     content_hash, chunk_size, chunk_count, object_key, provider_upload_id, status, \
     created_at, updated_at, expires_at";

#[derive(Clone)]
pub struct SessionStore {
    db: SqlitePool,
}

impl SessionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Persist a new session. A concurrent open session for the same owner
    /// and content surfaces as `DuplicateSession`.
    pub async fn insert(&self, session: &UploadSession) -> UploadResult<()> {
        let result = sqlx::query(
            "INSERT INTO upload_sessions (
                session_id, owner_id, target_name, parent_id, total_size, content_hash,
                chunk_size, chunk_count, object_key, provider_upload_id, status,
                created_at, updated_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.session_id)
        .bind(session.owner_id)
        .bind(&session.target_name)
        .bind(session.parent_id)
        .bind(to_i64(session.total_size)?)
        .bind(&session.content_hash)
        .bind(to_i64(session.chunk_size)?)
        .bind(i64::from(session.chunk_count))
        .bind(&session.object_key)
        .bind(&session.provider_upload_id)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                match self
                    .find_open(session.owner_id, &session.content_hash)
                    .await?
                {
                    Some(open) => Err(UploadError::DuplicateSession {
                        session_id: open.session_id,
                    }),
                    None => Err(UploadError::Database(err)),
                }
            }
            Err(err) => Err(UploadError::Database(err)),
        }
    }

    /// Load a session together with its received parts.
    pub async fn get(&self, session_id: Uuid) -> UploadResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.db)
        .await?;

        match session {
            Some(session) => Ok(Some(self.with_parts(session).await?)),
            None => Ok(None),
        }
    }

    /// The open (pending, uploading or completing) session for this content, if any.
    pub async fn find_open(
        &self,
        owner_id: Uuid,
        content_hash: &str,
    ) -> UploadResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions
             WHERE owner_id = ? AND content_hash = ?
               AND status IN ('pending', 'uploading', 'completing')
             ORDER BY julianday(created_at) DESC
             LIMIT 1"
        ))
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(&self.db)
        .await?;

        match session {
            Some(session) => Ok(Some(self.with_parts(session).await?)),
            None => Ok(None),
        }
    }

    /// Sessions whose expiry lies before `now`, oldest first.
    pub async fn expired(&self, now: DateTime<Utc>, limit: u32) -> UploadResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions
             WHERE julianday(expires_at) < julianday(?)
             ORDER BY julianday(expires_at) ASC
             LIMIT ?"
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;
        Ok(sessions)
    }

    async fn with_parts(&self, mut session: UploadSession) -> UploadResult<UploadSession> {
        let rows = sqlx::query(
            "SELECT chunk_index, part_tag, chunk_hash, size_bytes, received_at
             FROM upload_parts WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(session.session_id)
        .fetch_all(&self.db)
        .await?;

        let mut parts = BTreeMap::new();
        for row in rows {
            let index: i64 = row.try_get("chunk_index")?;
            let size: i64 = row.try_get("size_bytes")?;
            let Ok(index) = u32::try_from(index) else {
                continue;
            };
            parts.insert(
                index,
                ReceivedPart {
                    part_tag: row.try_get("part_tag")?,
                    chunk_hash: row.try_get("chunk_hash")?,
                    size_bytes: size.max(0) as u64,
                    received_at: row.try_get("received_at")?,
                },
            );
        }
        session.received_parts = parts;
        Ok(session)
    }

    /// Record an acknowledged chunk, moving the session to `Uploading` and
    /// pushing its expiry out. Returns false when the session no longer
    /// accepts chunks (cancelled, completing, expired or gone).
    pub async fn record_part(
        &self,
        session_id: Uuid,
        index: u32,
        part: &ReceivedPart,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let mut tx = self.db.begin().await?;

        if !Self::extend_open(&mut tx, session_id, now, expires_at).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        // Same index overwrites its tag; the collection never grows past the plan.
        sqlx::query(
            "INSERT INTO upload_parts (session_id, chunk_index, part_tag, size_bytes, chunk_hash, received_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (session_id, chunk_index) DO UPDATE SET
                part_tag = excluded.part_tag,
                size_bytes = excluded.size_bytes,
                chunk_hash = excluded.chunk_hash,
                received_at = excluded.received_at",
        )
        .bind(session_id)
        .bind(i64::from(index))
        .bind(&part.part_tag)
        .bind(to_i64(part.size_bytes)?)
        .bind(&part.chunk_hash)
        .bind(part.received_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Refresh expiry without recording anything. Same guard as `record_part`.
    pub async fn touch(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let mut conn = self.db.acquire().await?;
        Self::extend_open(&mut conn, session_id, now, expires_at).await
    }

    async fn extend_open(
        conn: &mut SqliteConnection,
        session_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET status = 'uploading', updated_at = ?, expires_at = ?
             WHERE session_id = ?
               AND status IN ('pending', 'uploading')
               AND julianday(expires_at) >= julianday(?)",
        )
        .bind(now)
        .bind(expires_at)
        .bind(session_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `Uploading -> Completing` for a session that has not expired, holding
    /// it until `lease_until` so the reaper leaves a running completion alone.
    pub async fn begin_completion(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET status = 'completing', updated_at = ?, expires_at = ?
             WHERE session_id = ?
               AND status = 'uploading'
               AND julianday(expires_at) >= julianday(?)",
        )
        .bind(now)
        .bind(lease_until)
        .bind(session_id)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Take over a `Completing` session whose lease ran out before `now`.
    /// Only one caller wins.
    pub async fn reclaim_completion(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET updated_at = ?, expires_at = ?
             WHERE session_id = ?
               AND status = 'completing'
               AND julianday(expires_at) < julianday(?)",
        )
        .bind(now)
        .bind(lease_until)
        .bind(session_id)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `Completing -> Uploading` with a fresh expiry, after a completion
    /// attempt that left nothing assembled.
    pub async fn reopen(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET status = 'uploading', updated_at = ?, expires_at = ?
             WHERE session_id = ? AND status = 'completing'",
        )
        .bind(now)
        .bind(expires_at)
        .bind(session_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set the status. Returns false if the session was not in
    /// one of the `from` states.
    pub async fn transition(
        &self,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let mut conn = self.db.acquire().await?;
        Self::transition_on(&mut conn, session_id, from, to, now).await
    }

    /// `transition` against a caller-supplied connection or transaction.
    pub async fn transition_on(
        conn: &mut SqliteConnection,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> UploadResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE upload_sessions SET status = ");
        builder.push_bind(to.as_str());
        builder.push(", updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE session_id = ");
        builder.push_bind(session_id);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in from {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Forget parts the provider no longer vouches for.
    pub async fn remove_parts(&self, session_id: Uuid, indices: &[u32]) -> UploadResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new("DELETE FROM upload_parts WHERE session_id = ");
        builder.push_bind(session_id);
        builder.push(" AND chunk_index IN (");
        let mut separated = builder.separated(", ");
        for index in indices {
            separated.push_bind(i64::from(*index));
        }
        separated.push_unseparated(")");
        builder.build().execute(&self.db).await?;
        Ok(())
    }

    /// Remove a session and its parts.
    pub async fn delete(&self, session_id: Uuid) -> UploadResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_parts WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub(crate) fn to_i64(value: u64) -> UploadResult<i64> {
    i64::try_from(value)
        .map_err(|_| UploadError::Validation(format!("value {value} is out of range")))
}
