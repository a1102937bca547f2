//! Configuration loaded from defaults, a TOML file and `TAGVAULT_*`
//! environment variables, in that order of precedence.

use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{VaultError, VaultResult};
use crate::sync::relations::HASH_RECORD_WIDTH;
use crate::sync::sorter::DEFAULT_BUFFER_BYTES;

pub const ENV_PREFIX: &str = "TAGVAULT_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the tag repository.
    pub repo_addr: String,
    /// Pre-shared key sent when requesting a session.
    pub service_key: String,
    /// Namespace of the resume counter, one per repository.
    pub source: String,
    /// Skip TLS certificate verification for the repository only.
    pub accept_invalid_certs: bool,

    pub db_path: PathBuf,
    /// Parent directory for external-sort runs; system temp when unset.
    pub temp_dir: Option<PathBuf>,

    pub sort_buffer_bytes: usize,
    pub commit_batch_size: usize,
    pub fetch_window: usize,
    /// Fetch threads; 0 picks `max(2 * cores, 8)`.
    pub fetch_workers: usize,
    /// Records reconciled per acquisition of the tag index lock.
    pub reconcile_batch_size: usize,

    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_addr: "https://hydrus.no-ip.org:45871".to_string(),
            service_key: String::new(),
            source: "default".to_string(),
            accept_invalid_certs: true,
            db_path: base_dir().join("db.sqlite"),
            temp_dir: None,
            sort_buffer_bytes: DEFAULT_BUFFER_BYTES,
            commit_batch_size: 100_000,
            fetch_window: 30,
            fetch_workers: 0,
            reconcile_batch_size: 64,
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 100,
        }
    }
}

impl Config {
    /// Load the global config file (created with defaults when missing), or
    /// `path` when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> VaultResult<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => ensure_global_config(),
        };
        Self::figment(&config_path)
            .extract()
            .map_err(|e| VaultError::Config(e.to_string()))
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).lowercase(true))
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.repo_addr.trim().is_empty() {
            return Err(VaultError::Config("repo_addr is empty".into()));
        }
        if self.service_key.trim().is_empty() {
            return Err(VaultError::Config(format!(
                "service_key is empty; set it in {} or {ENV_PREFIX}SERVICE_KEY",
                config_file_path().display()
            )));
        }
        if self.source.is_empty() {
            return Err(VaultError::Config("source is empty".into()));
        }
        for (name, value) in [
            ("commit_batch_size", self.commit_batch_size),
            ("fetch_window", self.fetch_window),
            ("reconcile_batch_size", self.reconcile_batch_size),
        ] {
            if value == 0 {
                return Err(VaultError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.sort_buffer_bytes < HASH_RECORD_WIDTH {
            return Err(VaultError::Config(format!(
                "sort_buffer_bytes {} is smaller than one record ({HASH_RECORD_WIDTH} bytes)",
                self.sort_buffer_bytes
            )));
        }
        Ok(())
    }

    /// Fetch thread count with `0` resolved to the default.
    pub fn effective_fetch_workers(&self) -> usize {
        if self.fetch_workers == 0 {
            (num_cpus::get() * 2).max(8)
        } else {
            self.fetch_workers
        }
    }

    pub fn counter_key(&self) -> String {
        format!("repo_counter:{}", self.source)
    }

    fn create_default_config(path: &Path) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(&Self::default())
            .map_err(|e| VaultError::Config(format!("cannot render default config: {e}")))?;
        fs::write(path, toml)?;
        Ok(())
    }
}

/// Directory holding the config file and, by default, the database.
pub fn base_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().join(".tagvault"))
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".tagvault")))
        .unwrap_or_else(|| PathBuf::from(".tagvault"))
}

pub fn config_file_path() -> PathBuf {
    base_dir().join("config.toml")
}

fn ensure_global_config() -> PathBuf {
    let path = config_file_path();
    if !path.exists() {
        if let Err(e) = Config::create_default_config(&path) {
            warn!(path = %path.display(), error = %e, "could not write default config, using defaults");
        }
    }
    path
}
