use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr};

const MIB: u64 = 1024 * 1024;

/// Smallest part S3 accepts for every part but the last.
pub const S3_MIN_PART_SIZE: u64 = 5 * MIB;

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL clients use to reach this service (local-mode part/read URLs).
    pub public_url: String,
    pub attachments_enabled: bool,
    pub max_file_size: u64,
    pub chunk_size: u64,
    pub part_url_ttl_secs: u64,
    pub short_url_ttl_secs: u64,
    pub verify_delete: bool,
    /// `None` selects the local-disk fallback.
    pub s3: Option<S3Settings>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "EZTest attachment upload service")]
pub struct Args {
    /// Host to bind to (overrides EZTEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EZTEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for local-mode objects and staging (overrides EZTEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides EZTEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL of this service (overrides EZTEST_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Enable or disable attachments (overrides EZTEST_ATTACHMENTS_ENABLED)
    #[arg(long, action = clap::ArgAction::Set)]
    pub attachments_enabled: Option<bool>,

    /// Largest accepted file in bytes (overrides EZTEST_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Part size in bytes (overrides EZTEST_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// S3 bucket; when unset attachments are stored on local disk (overrides EZTEST_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 region (overrides EZTEST_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint, e.g. MinIO (overrides EZTEST_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values found through `lookup` (the environment in
    /// production), then validate.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = args
            .host
            .or_else(|| lookup("EZTEST_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&lookup, "EZTEST_PORT", 3000)?,
        };
        let public_url = args
            .public_url
            .or_else(|| lookup("EZTEST_PUBLIC_URL"))
            .unwrap_or_else(|| format!("http://{}:{}", host, port));

        let s3 = match args.s3_bucket.or_else(|| lookup("EZTEST_S3_BUCKET")) {
            Some(bucket) if !bucket.is_empty() => Some(S3Settings {
                bucket,
                region: args
                    .s3_region
                    .or_else(|| lookup("EZTEST_S3_REGION"))
                    .unwrap_or_else(|| "us-east-1".into()),
                endpoint: args.s3_endpoint.or_else(|| lookup("EZTEST_S3_ENDPOINT")),
                access_key_id: lookup("EZTEST_S3_ACCESS_KEY_ID"),
                secret_access_key: lookup("EZTEST_S3_SECRET_ACCESS_KEY"),
                force_path_style: parse_var(&lookup, "EZTEST_S3_FORCE_PATH_STYLE", false)?,
            }),
            _ => None,
        };

        let cfg = Self {
            host,
            port,
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("EZTEST_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/attachments".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("EZTEST_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/eztest.db".into()),
            public_url,
            attachments_enabled: match args.attachments_enabled {
                Some(v) => v,
                None => parse_var(&lookup, "EZTEST_ATTACHMENTS_ENABLED", true)?,
            },
            max_file_size: match args.max_file_size {
                Some(v) => v,
                None => parse_var(&lookup, "EZTEST_MAX_FILE_SIZE", 500 * MIB)?,
            },
            chunk_size: match args.chunk_size {
                Some(v) => v,
                None => parse_var(&lookup, "EZTEST_CHUNK_SIZE", 10 * MIB)?,
            },
            part_url_ttl_secs: parse_var(&lookup, "EZTEST_PART_URL_TTL_SECS", 3600)?,
            short_url_ttl_secs: parse_var(&lookup, "EZTEST_SHORT_URL_TTL_SECS", 300)?,
            verify_delete: parse_var(&lookup, "EZTEST_VERIFY_DELETE", true)?,
            s3,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            bail!("max file size must be greater than zero");
        }
        if self.chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }
        if self.s3.is_some() && self.chunk_size < S3_MIN_PART_SIZE {
            bail!(
                "chunk size {} is below the S3 minimum part size of {} bytes",
                self.chunk_size,
                S3_MIN_PART_SIZE
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}
