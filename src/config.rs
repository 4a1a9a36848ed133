//! Configuration management for cardvault

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default Argon2 memory cost: 64 MiB
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 64 * 1024;

/// Default number of concurrent per-item operations in a sync pass
pub const DEFAULT_SYNC_CONCURRENCY: usize = 4;

/// Default per-item timeout in a sync pass (milliseconds)
pub const DEFAULT_ITEM_TIMEOUT_MS: u64 = 30_000;

/// Default minimum passphrase length
pub const DEFAULT_MIN_PASSPHRASE_LENGTH: usize = 12;

/// Lowest non-zero request rate accepted for a store
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Key derivation configuration
    pub encryption: EncryptionConfig,

    /// Remote store configuration
    pub storage: StorageConfig,

    /// Reconciliation configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Passphrase strength policy
    #[serde(default)]
    pub passphrase: PassphrasePolicyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory
    #[serde(skip)]
    pub data_dir: PathBuf,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (generated at vault setup when empty)
    #[serde(with = "hex_serde", default)]
    pub salt: Vec<u8>,
}

/// Which remote store provider to use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// In-process store, contents lost when the process exits
    Memory,

    /// Directory tree, typically inside a folder synced by a cloud client
    Directory { root: PathBuf },
}

/// Remote store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Provider selection
    pub backend: BackendConfig,

    /// Maximum concurrent provider requests
    pub max_concurrent_requests: usize,

    /// Maximum provider requests per second (0 = unlimited)
    pub requests_per_second: f64,

    /// Retry attempts for transient failures
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,

    /// Page size when listing remote objects
    pub list_page_size: usize,

    /// Optional storage quota, used for utilization reporting
    pub quota_bytes: Option<u64>,
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Concurrent per-item operations within one pass
    pub max_concurrency: usize,

    /// Timeout for a single item (ms); a stalled item fails alone
    pub item_timeout_ms: u64,
}

/// Passphrase strength policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassphrasePolicyConfig {
    pub min_length: usize,
    pub require_lowercase: bool,
    pub require_uppercase: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            encryption: EncryptionConfig::default(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            passphrase: PassphrasePolicyConfig::default(),
            logging: LoggingConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: BackendConfig::Memory,
            max_concurrent_requests: 4,
            requests_per_second: 0.0,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            list_page_size: 100,
            quota_bytes: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_concurrency: DEFAULT_SYNC_CONCURRENCY,
            item_timeout_ms: DEFAULT_ITEM_TIMEOUT_MS,
        }
    }
}

impl Default for PassphrasePolicyConfig {
    fn default() -> Self {
        PassphrasePolicyConfig {
            min_length: DEFAULT_MIN_PASSPHRASE_LENGTH,
            require_lowercase: true,
            require_uppercase: true,
            require_digit: true,
            require_symbol: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cardvault")
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl VaultConfig {
    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content)?;

        let mut config: VaultConfig = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        if config.data_dir == PathBuf::new() {
            config.data_dir = default_data_dir();
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Substitute `${VAR_NAME}` references with environment values.
    /// Unset variables are left as written.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| Error::Internal(format!("Invalid substitution pattern: {}", e)))?;

        let mut result = content.to_string();
        for cap in re.captures_iter(content) {
            if let Ok(value) = std::env::var(&cap[1]) {
                result = result.replace(&cap[0], &value);
            }
        }

        Ok(result)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CARDVAULT_STORE_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.storage.backend = BackendConfig::Directory {
                    root: PathBuf::from(dir),
                };
            }
        }

        if let Ok(concurrency) = std::env::var("CARDVAULT_SYNC_CONCURRENCY") {
            if let Ok(n) = concurrency.trim().parse::<usize>() {
                self.sync.max_concurrency = n;
            }
        }

        if let Ok(level) = std::env::var("CARDVAULT_LOG_LEVEL") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to JSON: {}", e)))?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.encryption.argon2_memory_kib < 8 * self.encryption.argon2_parallelism.max(1) {
            return Err(Error::InvalidConfig(
                "Argon2 memory must be at least 8 KiB per lane".to_string(),
            ));
        }

        if self.encryption.argon2_iterations == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 iterations must be greater than 0".to_string(),
            ));
        }

        if self.encryption.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 parallelism must be greater than 0".to_string(),
            ));
        }

        if self.storage.max_concurrent_requests == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }

        if self.storage.list_page_size == 0 {
            return Err(Error::InvalidConfig(
                "list_page_size must be greater than 0".to_string(),
            ));
        }

        let rate = self.storage.requests_per_second;
        if !rate.is_finite() || rate < 0.0 {
            return Err(Error::InvalidConfig(
                "requests_per_second must be a finite, non-negative number".to_string(),
            ));
        }

        if rate > 0.0 && rate < MIN_REQUESTS_PER_SECOND {
            return Err(Error::InvalidConfig(format!(
                "requests_per_second must be 0 (unlimited) or at least {}",
                MIN_REQUESTS_PER_SECOND
            )));
        }

        if self.sync.max_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "sync max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.passphrase.min_length == 0 {
            return Err(Error::InvalidConfig(
                "Minimum passphrase length must be greater than 0".to_string(),
            ));
        }

        if let BackendConfig::Directory { root } = &self.storage.backend {
            if root.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(
                    "Directory backend requires a root path".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let BackendConfig::Directory { root } = &self.storage.backend {
            std::fs::create_dir_all(root)?;
        }
        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
