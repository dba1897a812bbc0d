use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Lowest concurrency the settings editor accepts.
pub const MIN_CONCURRENCY: usize = 1;

/// Highest concurrency the settings editor accepts.
pub const MAX_CONCURRENCY: usize = 20;

/// Largest page the posts endpoint serves; a larger request is silently capped.
pub const MAX_PAGE_SIZE: usize = 200;

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Auth {
    pub username: String,
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Query {
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub score_threshold: i64,
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Paths {
    pub save_path: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Network {
    #[serde(default)]
    pub proxy_host: String,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub page_size: usize,
    pub max_pages: u32,
    pub retry_delay_ms: u64,
    pub primary_retries: usize,
    pub retry_wave_retries: usize,
    pub user_agent: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Files {
    pub naming: String, // "timestamp" or "id"
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub auth: Auth,
    pub query: Query,
    pub paths: Paths,
    pub network: Network,
    pub files: Files,
    pub logging: Logging,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth: Auth {
                username: "your_username".to_string(),
                api_key: String::new(),
            },
            query: Query {
                tags: Vec::new(),
                exclude_tags: Vec::new(),
                score_threshold: 0,
                limit: 10,
            },
            paths: Paths {
                save_path: "./danbooru_images".to_string(),
                log_directory: "./logs".to_string(),
            },
            network: Network {
                proxy_host: String::new(),
                proxy_port: None,
                concurrency: 5,
                timeout_secs: 30,
                page_size: 200,
                max_pages: 1000,
                retry_delay_ms: 1000,
                primary_retries: 5,
                retry_wave_retries: 10,
                user_agent: format!("danbooru_downloader/{}", env!("CARGO_PKG_VERSION")),
            },
            files: Files {
                naming: "timestamp".to_string(),
                allowed_extensions: vec![
                    "jpg".to_string(),
                    "jpeg".to_string(),
                    "png".to_string(),
                    "gif".to_string(),
                ],
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "text".to_string(),
                log_to_file: true,
            },
        }
    }
}

impl AppConfig {
    /// Returns a normalized copy: trimmed tags, lowercase extensions, clamped numbers.
    pub fn validated(&self) -> Self {
        let mut config = self.clone();

        config.query.tags = normalize_tokens(&config.query.tags);
        config.query.exclude_tags = normalize_tokens(&config.query.exclude_tags);
        config.query.limit = config.query.limit.max(1);

        config.network.concurrency = config.network.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        config.network.page_size = config.network.page_size.clamp(1, MAX_PAGE_SIZE);
        config.network.max_pages = config.network.max_pages.max(1);
        config.network.proxy_host = config.network.proxy_host.trim().to_string();

        config.files.allowed_extensions = config
            .files
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        config
    }

    /// Proxy URL in the form the HTTP client expects, if a proxy host is set.
    pub fn proxy_url(&self) -> Option<String> {
        let host = self.network.proxy_host.trim();
        if host.is_empty() {
            return None;
        }

        match self.network.proxy_port {
            Some(port) => Some(format!("http://{}:{}", host, port)),
            None => Some(format!("http://{}", host)),
        }
    }

    /// Whether the login fields hold something other than the placeholders.
    pub fn has_credentials(&self) -> bool {
        !self.auth.username.is_empty()
            && !self.auth.api_key.is_empty()
            && self.auth.username != "your_username"
    }
}

/// Tag lists accept both list entries and comma separated strings inside an entry.
fn normalize_tokens(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// How the settings file was obtained at startup.
///
/// Loading happens before the subscriber is installed, so the manager records what
/// happened and the caller reports it once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLoad {
    Existing,
    CreatedDefaults,
    RecoveredDefaults {
        reason: String,
        backup: Option<PathBuf>,
    },
}

impl ConfigLoad {
    pub fn log(&self, config_path: &Path) {
        match self {
            ConfigLoad::Existing => info!("Loaded settings from {}", config_path.display()),
            ConfigLoad::CreatedDefaults => {
                warn!("Config file not found, wrote defaults: {}", config_path.display())
            }
            ConfigLoad::RecoveredDefaults { reason, backup } => {
                error!("Failed to parse {}: {}", config_path.display(), reason);
                match backup {
                    Some(backup) => info!("Old config backed up to {}, defaults written", backup.display()),
                    None => warn!("Failed to back up old config, defaults written"),
                }
            }
        }
    }
}

/// Owns the settings file and hands out immutable snapshots to each run.
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
    load: ConfigLoad,
}

impl ConfigManager {
    pub fn new(config_path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();

        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let (config, load) = Self::load(&config_path)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            load,
        })
    }

    fn load(config_path: &Path) -> ConfigResult<(AppConfig, ConfigLoad)> {
        if !config_path.exists() {
            let default_config = AppConfig::default();
            write_config(config_path, &default_config)?;
            return Ok((default_config, ConfigLoad::CreatedDefaults));
        }

        let content = fs::read_to_string(config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok((config, ConfigLoad::Existing)),
            Err(e) => {
                let backup_path = config_path.with_extension("toml.backup");
                let backup = fs::rename(config_path, &backup_path).ok().map(|_| backup_path);

                let default_config = AppConfig::default();
                write_config(config_path, &default_config)?;
                Ok((
                    default_config,
                    ConfigLoad::RecoveredDefaults {
                        reason: e.to_string(),
                        backup,
                    },
                ))
            }
        }
    }

    /// What happened while reading the settings file.
    pub fn load_outcome(&self) -> &ConfigLoad {
        &self.load
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Immutable copy of the current settings, normalized for a pipeline run.
    pub fn snapshot(&self) -> ConfigResult<AppConfig> {
        self.config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.validated())
    }

    /// Persists `config` and makes it the current settings.
    pub fn save(&self, config: &AppConfig) -> ConfigResult<()> {
        write_config(&self.config_path, config)?;

        let mut current = self
            .config
            .write()
            .map_err(|e| ConfigError::LockError(e.to_string()))?;
        *current = config.clone();

        info!("Configuration updated successfully");
        Ok(())
    }

    /// Applies `edit` to the current settings and persists the result.
    pub fn update<F>(&self, edit: F) -> ConfigResult<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self
            .config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))?
            .clone();
        edit(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

fn write_config(path: &Path, config: &AppConfig) -> ConfigResult<()> {
    let toml_string = toml::to_string_pretty(config).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
    fs::write(path, toml_string)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings").join("danbooru.toml");

        let manager = ConfigManager::new(&path).unwrap();

        assert!(path.exists());
        assert_eq!(manager.load_outcome(), &ConfigLoad::CreatedDefaults);
        assert_eq!(manager.snapshot().unwrap(), AppConfig::default().validated());
        assert_eq!(ConfigManager::new(&path).unwrap().load_outcome(), &ConfigLoad::Existing);
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("danbooru.toml");
        fs::write(&path, "this is = = not toml").unwrap();

        let manager = ConfigManager::new(&path).unwrap();

        let backup = dir.path().join("danbooru.toml.backup");
        assert!(backup.exists());
        assert!(matches!(
            manager.load_outcome(),
            ConfigLoad::RecoveredDefaults { backup: Some(saved), .. } if *saved == backup
        ));
        assert_eq!(manager.snapshot().unwrap().query.limit, 10);
    }

    #[test]
    fn test_update_persists_between_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("danbooru.toml");

        let manager = ConfigManager::new(&path).unwrap();
        manager
            .update(|config| {
                config.query.tags = vec!["1girl".to_string()];
                config.query.limit = 42;
            })
            .unwrap();

        let reloaded = ConfigManager::new(&path).unwrap().snapshot().unwrap();
        assert_eq!(reloaded.query.tags, vec!["1girl".to_string()]);
        assert_eq!(reloaded.query.limit, 42);
    }

    #[test]
    fn test_validated_normalizes_values() {
        let mut config = AppConfig::default();
        config.query.tags = vec!["solo, long_hair".to_string(), "  ".to_string()];
        config.network.concurrency = 64;
        config.network.page_size = 1000;
        config.query.limit = 0;
        config.files.allowed_extensions = vec![".PNG".to_string(), "Jpg".to_string()];

        let config = config.validated();

        assert_eq!(config.query.tags, vec!["solo".to_string(), "long_hair".to_string()]);
        assert_eq!(config.network.concurrency, MAX_CONCURRENCY);
        assert_eq!(config.network.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.query.limit, 1);
        assert_eq!(config.files.allowed_extensions, vec!["png".to_string(), "jpg".to_string()]);
    }

    #[test]
    fn test_proxy_url() {
        let mut config = AppConfig::default();
        assert_eq!(config.proxy_url(), None);

        config.network.proxy_host = "127.0.0.1".to_string();
        config.network.proxy_port = Some(7897);
        assert_eq!(config.proxy_url(), Some("http://127.0.0.1:7897".to_string()));
    }
}
