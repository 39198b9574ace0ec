use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::gateway::StorageConfig;
use crate::services::upload_service::UploadSettings;

/// Default per-owner quota for lazily created ledgers (10 GiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageConfig,
    pub session_ttl: Duration,
    pub reap_interval: Duration,
    pub provider_timeout: Duration,
    pub default_quota_bytes: u64,
    pub max_chunk_size: u64,
    pub max_small_upload: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    Filesystem,
    S3,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "s3" => Ok(Self::S3),
            other => Err(format!("unknown storage backend `{other}`")),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Personal cloud storage backend")]
pub struct Args {
    /// Host to bind to (overrides CLOUD_DRIVE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLOUD_DRIVE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides CLOUD_DRIVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object storage backend (overrides CLOUD_DRIVE_STORAGE_BACKEND)
    #[arg(long, value_enum)]
    pub storage_backend: Option<StorageBackend>,

    /// Root directory of the filesystem backend (overrides CLOUD_DRIVE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// S3 bucket (overrides CLOUD_DRIVE_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 endpoint, e.g. `minio:9000` (overrides CLOUD_DRIVE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 region (overrides CLOUD_DRIVE_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Key prefix inside the bucket (overrides CLOUD_DRIVE_S3_PREFIX)
    #[arg(long)]
    pub s3_prefix: Option<String>,

    /// Use path-style addressing (overrides CLOUD_DRIVE_S3_FORCE_PATH_STYLE)
    #[arg(long)]
    pub s3_force_path_style: Option<bool>,

    /// Lifetime of an idle upload session in seconds (overrides CLOUD_DRIVE_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Interval between expired-session sweeps (overrides CLOUD_DRIVE_REAP_INTERVAL_SECS)
    #[arg(long)]
    pub reap_interval_secs: Option<u64>,

    /// Upper bound for a single object-storage call (overrides CLOUD_DRIVE_PROVIDER_TIMEOUT_SECS)
    #[arg(long)]
    pub provider_timeout_secs: Option<u64>,

    /// Quota granted to new owners (overrides CLOUD_DRIVE_DEFAULT_QUOTA_BYTES)
    #[arg(long)]
    pub default_quota_bytes: Option<u64>,

    /// Largest accepted chunk (overrides CLOUD_DRIVE_MAX_CHUNK_SIZE)
    #[arg(long)]
    pub max_chunk_size: Option<u64>,

    /// Largest file accepted by the single-shot upload path (overrides CLOUD_DRIVE_MAX_SMALL_UPLOAD)
    #[arg(long)]
    pub max_small_upload: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge already-parsed arguments over the environment.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("CLOUD_DRIVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed("CLOUD_DRIVE_PORT", 3000u16)?;
        let env_db = env::var("CLOUD_DRIVE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/cloud_drive.db".into());
        let env_backend = env_parsed("CLOUD_DRIVE_STORAGE_BACKEND", StorageBackend::Filesystem)?;
        let env_storage =
            env::var("CLOUD_DRIVE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());

        let backend = args.storage_backend.unwrap_or(env_backend);
        let storage = match backend {
            StorageBackend::Filesystem => StorageConfig::Filesystem {
                root: PathBuf::from(args.storage_dir.unwrap_or(env_storage)),
            },
            StorageBackend::S3 => StorageConfig::S3 {
                bucket: args
                    .s3_bucket
                    .or_else(|| env::var("CLOUD_DRIVE_S3_BUCKET").ok())
                    .unwrap_or_default(),
                endpoint: args
                    .s3_endpoint
                    .or_else(|| env::var("CLOUD_DRIVE_S3_ENDPOINT").ok()),
                region: args
                    .s3_region
                    .or_else(|| env::var("CLOUD_DRIVE_S3_REGION").ok()),
                prefix: args
                    .s3_prefix
                    .or_else(|| env::var("CLOUD_DRIVE_S3_PREFIX").ok()),
                access_key_id: env::var("CLOUD_DRIVE_S3_ACCESS_KEY_ID").ok(),
                secret_access_key: env::var("CLOUD_DRIVE_S3_SECRET_ACCESS_KEY").ok(),
                force_path_style: match args.s3_force_path_style {
                    Some(value) => value,
                    None => env_parsed("CLOUD_DRIVE_S3_FORCE_PATH_STYLE", false)?,
                },
            },
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            storage,
            session_ttl: Duration::from_secs(merged(
                args.session_ttl_secs,
                "CLOUD_DRIVE_SESSION_TTL_SECS",
                24 * 60 * 60,
            )?),
            reap_interval: Duration::from_secs(merged(
                args.reap_interval_secs,
                "CLOUD_DRIVE_REAP_INTERVAL_SECS",
                300,
            )?),
            provider_timeout: Duration::from_secs(merged(
                args.provider_timeout_secs,
                "CLOUD_DRIVE_PROVIDER_TIMEOUT_SECS",
                30,
            )?),
            default_quota_bytes: merged(
                args.default_quota_bytes,
                "CLOUD_DRIVE_DEFAULT_QUOTA_BYTES",
                DEFAULT_QUOTA_BYTES,
            )?,
            max_chunk_size: merged(
                args.max_chunk_size,
                "CLOUD_DRIVE_MAX_CHUNK_SIZE",
                64 * 1024 * 1024,
            )?,
            max_small_upload: merged(
                args.max_small_upload,
                "CLOUD_DRIVE_MAX_SMALL_UPLOAD",
                32 * 1024 * 1024,
            )?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl.is_zero() {
            bail!("session TTL must be greater than zero");
        }
        if self.reap_interval.is_zero() {
            bail!("reap interval must be greater than zero");
        }
        if self.provider_timeout.is_zero() {
            bail!("provider timeout must be greater than zero");
        }
        if self.max_chunk_size == 0 {
            bail!("max chunk size must be greater than zero");
        }
        self.storage.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings handed to the upload session manager.
    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            session_ttl: self.session_ttl,
            provider_timeout: self.provider_timeout,
            max_chunk_size: self.max_chunk_size,
            ..UploadSettings::default()
        }
    }
}

fn merged(arg: Option<u64>, var: &str, default: u64) -> Result<u64> {
    match arg {
        Some(value) => Ok(value),
        None => env_parsed(var, default),
    }
}

fn env_parsed<T>(var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}
