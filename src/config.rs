use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage controller subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage heap configuration (permanent + temp chunk capacities).
    pub storage: StorageConfig,
    /// Cryptographic pipeline configuration.
    pub crypto: CryptoConfig,
    /// Protocol timing configuration.
    pub protocol: ProtocolConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default capacity, in bytes, given to a chunk created by `InitStorages`.
    pub default_chunk_capacity: u64,
    /// Permanent data directory.
    pub data_dir: PathBuf,
    /// Scratch directory for in-flight replicas and Merkle sidecar files.
    pub temp_data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// RSA modulus size in bits. The codec's block size `B` is `rsa_bits / 8`.
    pub rsa_bits: usize,
    /// AES key length in bytes (32 for AES-256).
    pub aes_key_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// This node's own advertised keeper rate (price per byte, arbitrary unit).
    pub my_rate: u64,
    /// This node's own advertised maximum acceptable block gap.
    pub my_max_blocks_gap: u64,
    /// Local connected-peer count above which a proposal triggers socket shedding.
    pub max_peers_before_shedding: usize,
    /// Announcement age, in seconds, after which listening stops and keeper
    /// selection is triggered by the background worker.
    pub keeper_selection_delay_secs: u64,
    /// Background worker tick interval.
    pub background_tick: Duration,
    /// How old our own external address may get before a `ping` refresh broadcast.
    pub address_refresh_interval: Duration,
    /// Maximum dial attempts when locating a peer that isn't currently connected.
    pub dial_max_attempts: usize,
    /// Delay between dial attempts.
    pub dial_retry_delay: Duration,
    /// How long `AcceptProposal` waits for a `request-replica` echo.
    pub handshake_echo_timeout: Duration,
    /// Poll interval while waiting for the handshake echo.
    pub handshake_echo_poll: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "storagecontroller=debug".
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                default_chunk_capacity: 10 * 1024 * 1024 * 1024, // 10 GiB
                data_dir: PathBuf::from("./dfs-data"),
                temp_data_dir: PathBuf::from("./dfs-temp"),
            },
            crypto: CryptoConfig {
                rsa_bits: 2048,
                aes_key_len: 32,
            },
            protocol: ProtocolConfig {
                my_rate: 1,
                my_max_blocks_gap: 100,
                max_peers_before_shedding: 5,
                keeper_selection_delay_secs: 60,
                background_tick: Duration::from_secs(1),
                address_refresh_interval: Duration::from_secs(3600),
                dial_max_attempts: 100,
                dial_retry_delay: Duration::from_millis(500),
                handshake_echo_timeout: Duration::from_secs(30),
                handshake_echo_poll: Duration::from_millis(100),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults if the
    /// path is absent.
    pub fn load_or_default(config_path: Option<PathBuf>) -> crate::error::StorageResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&config_str)?;
                tracing::info!("loaded storage controller configuration from {:?}", path);
                return Ok(config);
            }
        }

        tracing::info!("using default storage controller configuration");
        Ok(Config::default())
    }

    /// Serialize configuration to a TOML file, creating parent directories as needed.
    pub fn save(&self, config_path: &PathBuf) -> crate::error::StorageResult<()> {
        let config_str = toml::to_string_pretty(self)?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("configuration saved to {:?}", config_path);
        Ok(())
    }

    /// The codec's block size `B`, in bytes: the RSA modulus size.
    pub fn block_size(&self) -> usize {
        self.crypto.rsa_bits / 8
    }
}
