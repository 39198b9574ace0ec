//! Per-owner storage accounting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// One row per owner: granted and consumed bytes.
#[derive(Clone, FromRow, Debug, PartialEq, Eq)]
pub struct QuotaLedger {
    pub owner_id: Uuid,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaLedger {
    pub fn total(&self) -> u64 {
        self.total_bytes.max(0) as u64
    }

    pub fn used(&self) -> u64 {
        self.used_bytes.max(0) as u64
    }

    /// `total - used`, floored at zero.
    pub fn available(&self) -> u64 {
        self.total().saturating_sub(self.used())
    }

    pub fn report(&self) -> QuotaReport {
        QuotaReport {
            owner_id: self.owner_id,
            total: self.total(),
            used: self.used(),
            available: self.available(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub owner_id: Uuid,
    pub total: u64,
    pub used: u64,
    pub available: u64,
}
