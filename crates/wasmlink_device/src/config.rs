use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;
use wasmlink_core::EngineConfig;

/// Returns the ~/.wasmlink directory, creating it if needed.
/// Falls back to a local `.wasmlink` directory if the home directory cannot be determined.
pub fn data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(mut path) => {
            path.push(".wasmlink");
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(error = %e, "Could not create ~/.wasmlink, falling back to local .wasmlink");
                return local_dir();
            }
            path
        }
        None => {
            warn!("Could not determine home directory, falling back to local .wasmlink");
            local_dir()
        }
    }
}

fn local_dir() -> PathBuf {
    let fallback = PathBuf::from(".wasmlink");
    let _ = fs::create_dir_all(&fallback);
    fallback
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Max level: "error", "warn", "info", "debug" or "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default = "default_json")]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_json() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: default_json(),
        }
    }
}

/// How the loopback client paces itself against the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// MTU the client negotiates on connect
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// How long to wait for a worker notification, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_mtu() -> u16 {
    247
}
fn default_timeout_ms() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    pub fn get_config_path() -> PathBuf {
        let mut path = data_dir();
        path.push("config.toml");
        path
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::get_config_path();

        if !path.exists() {
            // First run: persist the defaults so they can be edited.
            let config = Config::default();
            config.save()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::get_config_path();
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }
}
