//! Configuration management
//!
//! Non-secret settings live in a TOML file. Secrets are read from the
//! environment only and never written anywhere.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::keys::generator::{DEFAULT_KEY_PASSPHRASE, MIN_KEY_BITS};
use crate::domain::keys::{MasterKey, RotationPolicy, SecureString};
use crate::error::Error;
use crate::storage::{default_database_path, DatabaseConfig};

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "KEYSMITH_CONFIG_DIR";

/// Environment variable holding the master key (64 hex chars or base64)
pub const MASTER_KEY_ENV: &str = "KEYSMITH_MASTER_KEY";

/// Environment variable holding the private key passphrase
pub const KEY_PASSPHRASE_ENV: &str = "KEYSMITH_KEY_PASSPHRASE";

/// Keysmith configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub keys: KeySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Falls back to the platform data directory when unset
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    pub bits: usize,
    pub max_attempts: u32,
    pub operation_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for KeySettings {
    fn default() -> Self {
        let policy = RotationPolicy::default();
        Self {
            bits: 4096,
            max_attempts: policy.max_attempts,
            operation_timeout_ms: policy.operation_timeout.as_millis() as u64,
        }
    }
}

const KEYS: &[&str] = &[
    "database.path",
    "database.max_connections",
    "database.busy_timeout_ms",
    "keys.bits",
    "keys.max_attempts",
    "keys.operation_timeout_ms",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("keysmith")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        let problem = if self.keys.bits < MIN_KEY_BITS {
            format!(
                "keys.bits must be at least {}, got {}",
                MIN_KEY_BITS, self.keys.bits
            )
        } else if self.keys.max_attempts == 0 {
            "keys.max_attempts must be at least 1".to_string()
        } else if self.keys.operation_timeout_ms == 0 {
            "keys.operation_timeout_ms must be greater than 0".to_string()
        } else if self.database.max_connections == 0 {
            "database.max_connections must be at least 1".to_string()
        } else {
            return Ok(());
        };
        Err(Error::ConfigError(problem))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    /// Database settings, with `override_path` taking precedence over the file
    pub fn database_config(&self, override_path: Option<&Path>) -> DatabaseConfig {
        let path = override_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.database_path());

        DatabaseConfig::with_path(path)
            .max_connections(self.database.max_connections)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_attempts: self.keys.max_attempts,
            operation_timeout: Duration::from_millis(self.keys.operation_timeout_ms),
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "database.path" => Ok(self.database_path().display().to_string()),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "database.busy_timeout_ms" => Ok(self.database.busy_timeout_ms.to_string()),

            "keys.bits" => Ok(self.keys.bits.to_string()),
            "keys.max_attempts" => Ok(self.keys.max_attempts.to_string()),
            "keys.operation_timeout_ms" => Ok(self.keys.operation_timeout_ms.to_string()),

            // Secrets are reported as present or absent, never shown
            "secrets.master_key" => Ok(secret_state(MASTER_KEY_ENV, "not set")),
            "secrets.key_passphrase" => Ok(secret_state(KEY_PASSPHRASE_ENV, "built-in default")),

            _ => Err(Error::InvalidInput(format!(
                "Unknown configuration key: {}. Use `keysmith config show` to see available keys.",
                key
            ))
            .into()),
        }
    }

    /// List all non-secret configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

fn secret_state(var: &str, absent: &str) -> String {
    match env::var(var) {
        Ok(value) if !value.is_empty() => format!("(set via {})", var),
        _ => format!("({} - set {})", absent, var),
    }
}

/// Process-wide secrets, read once at startup
pub struct Secrets {
    pub master_key: MasterKey,
    pub key_passphrase: SecureString,
}

impl Secrets {
    /// Read secrets from the process environment
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read secrets through `lookup`; a missing master key is fatal
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let encoded = lookup(MASTER_KEY_ENV)
            .filter(|v| !v.trim().is_empty())
            .ok_or(Error::MissingSecret(MASTER_KEY_ENV))?;

        let master_key = MasterKey::parse(encoded.trim()).map_err(|e| Error::InvalidSecret {
            name: MASTER_KEY_ENV,
            reason: e.to_string(),
        })?;

        let key_passphrase = lookup(KEY_PASSPHRASE_ENV)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_PASSPHRASE.to_string());

        Ok(Self {
            master_key,
            key_passphrase: SecureString::new(key_passphrase),
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("master_key", &"[REDACTED]")
            .field("key_passphrase", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.keys.bits, 4096);
        assert_eq!(config.keys.max_attempts, 3);
        assert_eq!(config.rotation_policy(), RotationPolicy::default());
    }

    #[test]
    fn test_validate_rejects_weak_settings() {
        let mut config = Config::default();
        config.keys.bits = 1024;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.keys.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.keys.operation_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[database]\npath = \"/var/lib/keysmith/keys.db\"\n\n[keys]\nbits = 3072\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.keys.bits, 3072);
        assert_eq!(config.keys.max_attempts, 3);
        assert_eq!(config.get("database.path").unwrap(), "/var/lib/keysmith/keys.db");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[keys]\nbits = 512\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        let err = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(err, Error::ConfigError(msg) if msg.contains("keys.bits")));
        assert_eq!(err.code(), "E600");
        assert_eq!(err.suggestion(), Some("keysmith config path".to_string()));

        fs::write(&path, "[keys\nbits = ").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConfigError(_))));
    }

    #[test]
    fn test_database_config_override() {
        let config = Config::default();
        let db = config.database_config(Some(Path::new("/tmp/override.db")));
        assert_eq!(db.path, PathBuf::from("/tmp/override.db"));
        assert_eq!(db.busy_timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn test_get_unknown_key() {
        let err = Config::default().get("llm.model").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
        assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("E800"));
    }

    #[test]
    fn test_list_covers_settings() {
        let list = Config::default().list().unwrap();
        assert_eq!(list.len(), KEYS.len());
        assert!(list.iter().any(|(k, v)| k == "keys.bits" && v == "4096"));
    }

    #[test]
    fn test_secrets_require_master_key() {
        let err = Secrets::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, Error::MissingSecret(MASTER_KEY_ENV)));

        let err = Secrets::from_lookup(lookup_from(&[(MASTER_KEY_ENV, "  ")])).unwrap_err();
        assert!(matches!(err, Error::MissingSecret(_)));
    }

    #[test]
    fn test_secrets_reject_malformed_master_key() {
        let err = Secrets::from_lookup(lookup_from(&[(MASTER_KEY_ENV, "not-a-key")])).unwrap_err();
        assert!(matches!(err, Error::InvalidSecret { name: MASTER_KEY_ENV, .. }));
    }

    #[test]
    fn test_secrets_default_passphrase() {
        let hex_key = "11".repeat(32);
        let secrets = Secrets::from_lookup(lookup_from(&[(MASTER_KEY_ENV, hex_key.as_str())])).unwrap();
        assert_eq!(secrets.key_passphrase.as_str(), DEFAULT_KEY_PASSPHRASE);

        let secrets = Secrets::from_lookup(lookup_from(&[
            (MASTER_KEY_ENV, hex_key.as_str()),
            (KEY_PASSPHRASE_ENV, "correct horse"),
        ]))
        .unwrap();
        assert_eq!(secrets.key_passphrase.as_str(), "correct horse");
    }

    #[test]
    fn test_secrets_debug_redacted() {
        let hex_key = "ab".repeat(32);
        let secrets = Secrets::from_lookup(lookup_from(&[(MASTER_KEY_ENV, hex_key.as_str())])).unwrap();
        let debug = format!("{:?}", secrets);
        assert!(!debug.contains(&hex_key));
        assert!(debug.contains("[REDACTED]"));
    }
}
