//! Core data models for the upload subsystem.
//!
//! Rows map to database tables via `sqlx::FromRow` and serialize as JSON
//! via `serde` for the HTTP layer.

pub mod file;
pub mod quota;
pub mod session;

pub use file::{FileRecord, NewFileRecord};
pub use quota::{QuotaLedger, QuotaReport};
pub use session::{ChunkPlan, ReceivedPart, SessionStatus, UploadProgress, UploadSession};
