//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "hearing-sync.toml",
    "./config/config.toml",
    "/etc/hearing-sync/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching defaults");
        }

        if let Ok(path) = env::var("HEARING_SYNC_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(val) = lookup(key) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %val, "Ignoring unparseable environment override"),
        }
    }
}

fn set_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(val) = lookup(key) {
        *target = val;
    }
}

/// Apply `HS_*` overrides read through `lookup`
pub(crate) fn apply_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    set_string(&lookup, "HS_DEPLOYMENT_ID", &mut config.deployment_id);

    // Database
    set_string(&lookup, "HS_DATABASE_URL", &mut config.database.url);
    set_parsed(&lookup, "HS_DATABASE_MAX_CONNECTIONS", &mut config.database.max_connections);

    // Queue
    set_string(&lookup, "HS_QUEUE_TYPE", &mut config.queue.queue_type);
    set_string(&lookup, "HS_QUEUE_INBOUND", &mut config.queue.inbound);
    set_string(&lookup, "HS_QUEUE_OUTBOUND", &mut config.queue.outbound);
    set_string(&lookup, "HS_QUEUE_DEAD_LETTER", &mut config.queue.dead_letter);
    set_string(&lookup, "HS_QUEUE_REGION", &mut config.queue.region);
    set_parsed(&lookup, "HS_QUEUE_WORKERS", &mut config.queue.workers);
    set_parsed(&lookup, "HS_MAX_DELIVERY_COUNT", &mut config.queue.max_delivery_count);

    // Downstream
    set_string(&lookup, "HS_DOWNSTREAM_BASE_URL", &mut config.downstream.base_url);
    set_string(&lookup, "HS_DOWNSTREAM_TOKEN_URL", &mut config.downstream.token_url);
    set_string(&lookup, "HS_DOWNSTREAM_CLIENT_ID", &mut config.downstream.client_id);
    set_string(&lookup, "HS_DOWNSTREAM_CLIENT_SECRET", &mut config.downstream.client_secret);
    set_string(&lookup, "HS_DOWNSTREAM_SCOPE", &mut config.downstream.scope);
    set_parsed(&lookup, "HS_DOWNSTREAM_TIMEOUT_SECS", &mut config.downstream.timeout_secs);

    // Pending request windows
    set_parsed(
        &lookup,
        "HS_PENDING_WAIT_INTERVAL_MINUTES",
        &mut config.pending.pending_wait_interval_minutes,
    );
    set_parsed(
        &lookup,
        "HS_ESCALATION_WAIT_INTERVAL_DAYS",
        &mut config.pending.escalation_wait_interval_days,
    );
    set_parsed(
        &lookup,
        "HS_DELETION_WAIT_INTERVAL_DAYS",
        &mut config.pending.deletion_wait_interval_days,
    );
    set_parsed(
        &lookup,
        "HS_EXCEPTION_LIMIT_IN_HOURS",
        &mut config.pending.exception_limit_in_hours,
    );
    set_parsed(
        &lookup,
        "HS_PROCESSING_RECLAIM_MINUTES",
        &mut config.pending.processing_reclaim_minutes,
    );

    // Scheduler
    set_parsed(&lookup, "HS_SCHEDULER_ENABLED", &mut config.scheduler.enabled);
    set_parsed(
        &lookup,
        "HS_SCHEDULER_RUN_INTERVAL_SECS",
        &mut config.scheduler.run_interval_secs,
    );
}
