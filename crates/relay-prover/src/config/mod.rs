use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use relay_types::ChainId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::prover::ProverConfig;
use crate::queue::QueueConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The local HTTP listen address for the admin API.
    pub http_address: String,

    /// Beacon node REST endpoint used to observe light client updates.
    pub beacon_rpc: String,

    /// Seconds between two polls of the beacon node.
    pub poll_interval_secs: u64,

    /// Trusted slot the first observed update chains after.
    /// If None and no proof is stored yet, the first observed update is treated as genesis.
    pub checkpoint_slot: Option<u64>,

    /// The proof chain this service writes.
    pub chain: ChainId,

    /// Settings shared by the update and proof queues.
    pub queue: QueueConfig,

    /// Settings for the proving backend.
    pub prover: ProverConfig,

    /// Number of concurrent proof workers.
    pub workers: usize,

    /// Milliseconds a job waits before retrying when its predecessor proof is not stored yet.
    pub defer_delay_ms: u64,

    /// Capacity of the queue event broadcast buffer.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_address: "127.0.0.1:8080".into(),
            beacon_rpc: "http://localhost:5052".into(),
            poll_interval_secs: 12,
            checkpoint_slot: None,
            chain: ChainId::new(0, 1),
            queue: QueueConfig::default(),
            prover: ProverConfig::default(),
            workers: 1,
            defer_delay_ms: 5_000,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// The default service home directory.
    pub const APP_HOME: &str = ".relay-prover";
    /// The default configuration directory.
    pub const CONFIG_DIR: &str = "config";
    /// The default configuration file in YAML format.
    pub const CONFIG_FILE: &str = "config.yaml";
    /// The default data directory.
    pub const DATA_DIR: &str = "data";

    /// Initializes the local configuration directory and writes the default config if missing.
    pub fn init() -> Result<()> {
        let config_dir = Self::home()?.join(Self::CONFIG_DIR);
        fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join(Self::CONFIG_FILE);
        if !config_path.exists() {
            info!("Creating default config at {config_path:?}");
            let yaml = serde_yaml::to_string(&Config::default())?;
            fs::write(&config_path, yaml)?;
        } else {
            info!("Config file already exists at {config_path:?}");
        }

        fs::create_dir_all(Self::storage_path()?)?;
        Ok(())
    }

    fn home() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow!("cannot find home directory"))?
            .join(Self::APP_HOME))
    }

    /// Returns the default application config path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home()?.join(Self::CONFIG_DIR).join(Self::CONFIG_FILE))
    }

    pub fn storage_path() -> Result<PathBuf> {
        Ok(Self::home()?.join(Self::DATA_DIR))
    }

    /// Loads the application config from the service home directory.
    pub fn load() -> Result<Self> {
        let config_path = Config::config_path()?;
        if !config_path.exists() {
            return Err(anyhow!("config file not found at {}", config_path.display()));
        }

        info!("Reading config file at {}", config_path.display());
        let config_yaml = fs::read_to_string(&config_path).context("Failed to read config file from path")?;
        let config: Config = serde_yaml::from_str(&config_yaml)?;
        config.validate()?;

        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        if self.prover.prove_timeout() >= self.queue.visibility_timeout() {
            bail!(
                "prover.prove_timeout_secs ({}) must be shorter than queue.visibility_timeout_secs ({})",
                self.prover.prove_timeout_secs,
                self.queue.visibility_timeout_secs
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn defer_delay(&self) -> Duration {
        Duration::from_millis(self.defer_delay_ms)
    }
}
