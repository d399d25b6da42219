use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::digest::Algorithm;

const ENV_CONFIG_PATH: &str = "OSFSYNC_CONFIG_PATH";
const ENV_API_BASE: &str = "OSFSYNC_API_BASE";
const ENV_HASH: &str = "OSFSYNC_HASH";
const ENV_CHUNK_SIZE: &str = "OSFSYNC_CHUNK_SIZE";
const ENV_DATA_DIR: &str = "OSFSYNC_DATA_DIR";

const DEFAULT_API_BASE: &str = "https://api.osf.io/v2";
const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

/// All-optional mirror of [`Config`], used while layering flag/env/file
/// values before a single validated `Config` is produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialConfig {
    pub api_base: Option<String>,
    pub hash_algorithm: Option<Algorithm>,
    pub chunk_size: Option<u64>,
    pub data_dir: Option<PathBuf>,
}

/// Flags the CLI can supply, overriding env and file values.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_base: Option<String>,
    pub hash_algorithm: Option<Algorithm>,
    pub chunk_size: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

/// Fully resolved, validated configuration for one process run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_base: String,
    pub hash_algorithm: Algorithm,
    pub chunk_size: u64,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
}

/// Shape written to disk under `data_dir/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash_algorithm: Option<Algorithm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn default_data_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".osfsync")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}

pub fn default_log_file_path() -> PathBuf {
    default_data_dir().join("osfsync.log")
}

/// Resolves which file to load config from: explicit override, then
/// `OSFSYNC_CONFIG_PATH`, then the default path under `~/.osfsync/`.
pub fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(p) = flag {
        return p.to_path_buf();
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }
    default_config_path()
}

fn read_env_config() -> PartialConfig {
    PartialConfig {
        api_base: std::env::var(ENV_API_BASE).ok().filter(|s| !s.is_empty()),
        hash_algorithm: std::env::var(ENV_HASH).ok().and_then(|s| s.parse().ok()),
        chunk_size: std::env::var(ENV_CHUNK_SIZE).ok().and_then(|s| s.parse().ok()),
        data_dir: std::env::var(ENV_DATA_DIR).ok().map(PathBuf::from),
    }
}

fn load_file_only(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        return Ok(PartialConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let persisted: PersistedConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file {}", path.display()))?;
    Ok(PartialConfig {
        api_base: persisted.api_base,
        hash_algorithm: persisted.hash_algorithm,
        chunk_size: persisted.chunk_size,
        data_dir: None,
    })
}

impl Config {
    /// Loads config honoring flag > env > file > default precedence.
    pub fn load_with_overrides(overrides: &ConfigOverrides) -> Result<Config> {
        let config_path = resolve_config_path(overrides.config_path.as_deref());
        let from_file = load_file_only(&config_path)?;
        let from_env = read_env_config();

        let api_base = overrides
            .api_base
            .clone()
            .or(from_env.api_base)
            .or(from_file.api_base)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let hash_algorithm = overrides
            .hash_algorithm
            .or(from_env.hash_algorithm)
            .or(from_file.hash_algorithm)
            .unwrap_or_default();

        let chunk_size = overrides
            .chunk_size
            .or(from_env.chunk_size)
            .or(from_file.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);

        let data_dir = overrides
            .data_dir
            .clone()
            .or(from_env.data_dir)
            .unwrap_or_else(default_data_dir);

        let config = Config {
            api_base,
            hash_algorithm,
            chunk_size,
            data_dir,
            config_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base.is_empty() {
            anyhow::bail!("api_base must not be empty");
        }
        url::Url::parse(&self.api_base)
            .with_context(|| format!("api_base {:?} is not a valid URL", self.api_base))?;
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let persisted = PersistedConfig {
            api_base: Some(self.api_base.clone()),
            hash_algorithm: Some(self.hash_algorithm),
            chunk_size: Some(self.chunk_size),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        let tmp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes)
            .with_context(|| format!("write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.config_path)
            .with_context(|| format!("rename into {}", self.config_path.display()))?;
        Ok(())
    }

    pub fn token_store_path(&self) -> PathBuf {
        self.data_dir.join("token_store.json")
    }

    /// Per-project persisted sync state (`{root_path, project_id,
    /// account_id, name, index}`), one file per remote project id.
    pub fn project_file_path(&self, project_id: &str) -> PathBuf {
        self.data_dir.join("projects").join(format!("{project_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        keys: Vec<&'static str>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(keys: Vec<&'static str>) -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            for key in &keys {
                std::env::remove_var(key);
            }
            Self { keys, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in &self.keys {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn default_config_uses_osf_api_base() {
        let _guard = EnvGuard::new(vec![ENV_API_BASE, ENV_HASH, ENV_CHUNK_SIZE, ENV_CONFIG_PATH]);
        let tmp = tempfile::tempdir().unwrap();
        let overrides = ConfigOverrides {
            config_path: Some(tmp.path().join("config.json")),
            data_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&overrides).unwrap();
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.hash_algorithm, Algorithm::Md5);
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn flag_overrides_env_overrides_file() {
        let _guard = EnvGuard::new(vec![ENV_API_BASE, ENV_HASH, ENV_CHUNK_SIZE, ENV_CONFIG_PATH]);
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"api_base":"https://file.example/v2","hash_algorithm":"md5"}"#,
        )
        .unwrap();
        std::env::set_var(ENV_API_BASE, "https://env.example/v2");

        let overrides = ConfigOverrides {
            config_path: Some(config_path),
            data_dir: Some(tmp.path().to_path_buf()),
            api_base: Some("https://flag.example/v2".to_string()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&overrides).unwrap();
        assert_eq!(cfg.api_base, "https://flag.example/v2");
    }

    #[test]
    fn validate_rejects_empty_api_base() {
        let cfg = Config {
            api_base: String::new(),
            hash_algorithm: Algorithm::Md5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            data_dir: PathBuf::from("/tmp"),
            config_path: PathBuf::from("/tmp/config.json"),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let _guard = EnvGuard::new(vec![ENV_API_BASE, ENV_HASH, ENV_CHUNK_SIZE, ENV_CONFIG_PATH]);
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.json");
        let cfg = Config {
            api_base: "https://api.osf.io/v2".to_string(),
            hash_algorithm: Algorithm::Sha256,
            chunk_size: 32 * 1024,
            data_dir: tmp.path().to_path_buf(),
            config_path: config_path.clone(),
        };
        cfg.save().unwrap();

        let overrides = ConfigOverrides {
            config_path: Some(config_path),
            data_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let reloaded = Config::load_with_overrides(&overrides).unwrap();
        assert_eq!(reloaded.hash_algorithm, Algorithm::Sha256);
        assert_eq!(reloaded.chunk_size, 32 * 1024);
    }
}
