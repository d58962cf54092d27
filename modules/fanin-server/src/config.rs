use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fanin_engine::Retention;
use fanin_store::CorruptStatePolicy;

use crate::data::MergeMode;

pub const DEFAULT_MESSAGE: &str = "boring default msg, change me with env[MESSAGE]";

/// Where barrier state lives.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Postgres {
        database_url: String,
        retired_key_ttl: Duration,
    },
    File {
        state_dir: PathBuf,
        lock_timeout: Duration,
        lock_stale_after: Duration,
    },
}

/// Aggregator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub message: String,
    pub type_override: Option<String>,

    // Barrier
    pub number_of_funcs: i64,
    pub default_run_id: String,
    pub merge_mode: MergeMode,
    pub merge_separator: String,
    pub retention: Retention,

    // Store
    pub backend: StoreBackend,
    pub corrupt_state: CorruptStatePolicy,

    // Server
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let number_of_funcs: i64 = lookup("NUMBER_OF_FUNCS")
            .or_else(|| lookup("NumberOfFuncs"))
            .context("NUMBER_OF_FUNCS is required")?
            .trim()
            .parse()
            .context("NUMBER_OF_FUNCS must be an integer")?;
        if number_of_funcs < 1 {
            bail!("NUMBER_OF_FUNCS must be at least 1, got {number_of_funcs}");
        }

        let backend = match lookup("STORE_BACKEND")
            .unwrap_or_else(|| "postgres".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres {
                database_url: lookup("DATABASE_URL")
                    .context("DATABASE_URL is required for the postgres backend")?,
                retired_key_ttl: Duration::from_secs(
                    lookup("RETIRED_KEY_TTL_SECS")
                        .unwrap_or_else(|| "86400".to_string())
                        .parse()
                        .context("RETIRED_KEY_TTL_SECS must be a number")?,
                ),
            },
            "file" => StoreBackend::File {
                state_dir: lookup("STATE_DIR")
                    .unwrap_or_else(|| "/etc/config".to_string())
                    .into(),
                lock_timeout: Duration::from_millis(
                    lookup("LOCK_TIMEOUT_MS")
                        .unwrap_or_else(|| "5000".to_string())
                        .parse()
                        .context("LOCK_TIMEOUT_MS must be a number")?,
                ),
                lock_stale_after: Duration::from_millis(
                    lookup("LOCK_STALE_MS")
                        .unwrap_or_else(|| "30000".to_string())
                        .parse()
                        .context("LOCK_STALE_MS must be a number")?,
                ),
            },
            other => bail!("unknown STORE_BACKEND {other:?} (expected postgres or file)"),
        };

        let merge_mode = match lookup("MERGE_MODE") {
            Some(v) => MergeMode::parse(&v)
                .with_context(|| format!("unknown MERGE_MODE {v:?} (expected message or payload)"))?,
            None => MergeMode::default(),
        };

        let merge_separator = lookup("MERGE_SEPARATOR").unwrap_or_else(|| match &backend {
            StoreBackend::Postgres { .. } => String::new(),
            StoreBackend::File { .. } => " ".to_string(),
        });

        let retention = match lookup("RETENTION").as_deref().map(str::trim) {
            None | Some("delete") => Retention::Delete,
            Some("retain") => Retention::Retain,
            Some(other) => bail!("unknown RETENTION {other:?} (expected delete or retain)"),
        };

        let corrupt_state = match lookup("CORRUPT_STATE").as_deref().map(str::trim) {
            None | Some("reset") => CorruptStatePolicy::Reset,
            Some("fail") => CorruptStatePolicy::Fail,
            Some(other) => bail!("unknown CORRUPT_STATE {other:?} (expected reset or fail)"),
        };

        Ok(Self {
            message: lookup("MESSAGE").unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            type_override: lookup("TYPE").filter(|t| !t.is_empty()),
            number_of_funcs,
            default_run_id: lookup("DEFAULT_RUN_ID").unwrap_or_else(|| "event".to_string()),
            merge_mode,
            merge_separator,
            retention,
            backend,
            corrupt_state,
            port: parse_port(&lookup)?,
        })
    }
}

/// Stage function configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub message: String,
    pub func_name: String,
    pub type_override: Option<String>,
    pub port: u16,
}

impl StageConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            message: lookup("MESSAGE").unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            func_name: lookup("FUNC_NAME").unwrap_or_else(|| "current-func-name".to_string()),
            type_override: lookup("TYPE").filter(|t| !t.is_empty()),
            port: parse_port(&lookup)?,
        })
    }
}

fn parse_port(lookup: &impl Fn(&str) -> Option<String>) -> Result<u16> {
    lookup("PORT")
        .unwrap_or_else(|| "8080".to_string())
        .parse()
        .context("PORT must be a number")
}
