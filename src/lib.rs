//! Personal cloud storage backend: resumable, deduplicating chunked uploads
//! over SQLite metadata and a pluggable object store.

pub mod config;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod hashing;
pub mod models;
pub mod routes;
pub mod services;
