use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Daemon settings: optional TOML file named by `GUVNOR_CONFIG`, then
/// `GUVNOR_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub app_dir: PathBuf,
    /// Response deadline for bounded process calls.
    pub timeout_ms: u64,
    /// Handshake deadline for process channels. 0 waits indefinitely.
    pub rpc_timeout_ms: u64,
    /// Bearer token required by the HTTP API. Unset leaves it open.
    pub remote_token: Option<String>,
    /// Bearer token presented to supervised processes.
    pub process_token: Option<String>,
    pub git: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8057)),
            app_dir: PathBuf::from("./apps"),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            rpc_timeout_ms: 0,
            remote_token: None,
            process_token: None,
            git: PathBuf::from("git"),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("GUVNOR_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(raw)?;
        cfg.timeout_ms = cfg.timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        Ok(cfg)
    }

    /// Applies `GUVNOR_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("GUVNOR_LISTEN") {
            self.listen = v.parse().with_context(|| format!("GUVNOR_LISTEN={v}"))?;
        }
        if let Some(v) = var("GUVNOR_APP_DIR") {
            self.app_dir = PathBuf::from(v);
        }
        if let Some(ms) = var("GUVNOR_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.timeout_ms = ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        }
        if let Some(ms) = var("GUVNOR_RPC_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.rpc_timeout_ms = ms.min(MAX_TIMEOUT_MS);
        }
        if let Some(v) = var("GUVNOR_REMOTE_TOKEN") {
            self.remote_token = Some(v);
        }
        if let Some(v) = var("GUVNOR_PROCESS_TOKEN") {
            self.process_token = Some(v);
        }
        if let Some(v) = var("GUVNOR_GIT") {
            self.git = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS))
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        (self.rpc_timeout_ms > 0).then(|| Duration::from_millis(self.rpc_timeout_ms))
    }
}
