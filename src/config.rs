//! Configuration loading and persistence.
//!
//! Reads `config.json` from the bridge configuration directory and layers
//! `WALLET_BRIDGE_*` environment overrides on top. Every field has a default,
//! so a missing or partial file is fine.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    CHANNEL_HARD_LIMIT, DEFAULT_CHUNK_OVERHEAD, DEFAULT_CHUNK_THRESHOLD,
    DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_CONNECT_RETRIES, DEFAULT_CONNECT_RETRY_BASE_MS,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_STALE_CHUNK_TIMEOUT_SECS, SOCKET_FILE_NAME,
};
use crate::transport::TransportConfig;

/// Configuration for the bridge processes (native host, worker, debug client).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Unix socket the background worker listens on.
    pub socket_path: PathBuf,
    /// Largest serialized message sent as a single frame.
    pub chunk_threshold: usize,
    /// Bytes reserved per chunk frame for envelope metadata.
    pub chunk_overhead: usize,
    /// Inbound frames declaring more bytes than this are skipped.
    pub max_frame_size: usize,
    /// Seconds without activity before an incomplete chunk set is evicted.
    pub stale_chunk_timeout_secs: u64,
    /// Seconds between reassembler cleanup passes.
    pub cleanup_interval_secs: u64,
    /// Caller-side timeout for RPC calls. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
    /// Connect attempts made by the native host before giving up.
    pub connect_retries: u32,
    /// Linear backoff step between connect attempts.
    pub connect_retry_base_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_overhead: DEFAULT_CHUNK_OVERHEAD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stale_chunk_timeout_secs: DEFAULT_STALE_CHUNK_TIMEOUT_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            call_timeout_secs: None,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_retry_base_ms: DEFAULT_CONNECT_RETRY_BASE_MS,
        }
    }
}

/// Runtime dir when the platform has one (Linux), else the config dir, else /tmp.
fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(|| dirs::config_dir().map(|d| d.join("wallet-bridge")))
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_FILE_NAME)
}

impl BridgeConfig {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `WALLET_BRIDGE_CONFIG_DIR` wins; otherwise the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("WALLET_BRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("wallet-bridge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("[Config] Using defaults: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parse {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `WALLET_BRIDGE_*` overrides using `lookup` as the variable source.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup("WALLET_BRIDGE_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }

        if let Some(threshold) = lookup("WALLET_BRIDGE_CHUNK_THRESHOLD") {
            match threshold.parse::<usize>() {
                Ok(value) => self.chunk_threshold = value,
                Err(e) => log::warn!("[Config] Ignoring WALLET_BRIDGE_CHUNK_THRESHOLD={threshold}: {e}"),
            }
        }

        if let Some(timeout) = lookup("WALLET_BRIDGE_CALL_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(0) => self.call_timeout_secs = None,
                Ok(value) => self.call_timeout_secs = Some(value),
                Err(e) => log::warn!("[Config] Ignoring WALLET_BRIDGE_CALL_TIMEOUT={timeout}: {e}"),
            }
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_threshold <= self.chunk_overhead {
            bail!(
                "chunk_threshold ({}) must be larger than chunk_overhead ({})",
                self.chunk_threshold,
                self.chunk_overhead
            );
        }
        if self.chunk_threshold > CHANNEL_HARD_LIMIT {
            bail!(
                "chunk_threshold ({}) exceeds the browser message limit ({CHANNEL_HARD_LIMIT})",
                self.chunk_threshold
            );
        }
        if self.max_frame_size < self.chunk_threshold {
            bail!(
                "max_frame_size ({}) must be at least chunk_threshold ({})",
                self.max_frame_size,
                self.chunk_threshold
            );
        }
        Ok(())
    }

    /// Persists the current configuration to disk (owner read/write only).
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Transport settings derived from this config.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            chunk_threshold: self.chunk_threshold,
            chunk_overhead: self.chunk_overhead,
            max_frame_size: self.max_frame_size,
            stale_chunk_timeout: Duration::from_secs(self.stale_chunk_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
        }
    }

    /// Caller-side call timeout, if configured.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}
