use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::instance::ProxyConfig;
use crate::protocol::channel::DEFAULT_BACKOFF;

/// Default location of the configuration file, overridable via `SSMANAGER_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "config/ssmanager.toml";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// How to launch and talk to the external proxy server.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ManagerConfig {
    /// Control endpoint created by the server.
    pub manager_address: PathBuf,
    /// Endpoint this manager binds.
    pub client_address: PathBuf,
    pub ss_bin: PathBuf,
    /// Let the server inherit our stdout/stderr instead of discarding them.
    pub print_ss_log: bool,
    pub connect_backoff_ms: Vec<u64>,
    /// 0 waits for acknowledgments forever.
    pub ack_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_address: PathBuf::from("/tmp/manager.sock"),
            client_address: PathBuf::from("/tmp/manager-client.sock"),
            ss_bin: PathBuf::from("/usr/bin/ssserver"),
            print_ss_log: true,
            connect_backoff_ms: DEFAULT_BACKOFF.iter().map(|d| d.as_millis() as u64).collect(),
            ack_timeout_ms: 5000,
        }
    }
}

impl ManagerConfig {
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.connect_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        match self.ack_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// One `[[servers]]` table: a listener to register at startup.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerEntry {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl GlobalConfig {
    /// Load from `path`. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {:?} does not exist, using defaults", path);
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Self::parse(&s).map_err(|e| anyhow::anyhow!("Invalid config {:?}: {}", path, e))
    }

    pub fn parse(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
