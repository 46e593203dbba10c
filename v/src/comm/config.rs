use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 环境变量前缀 / Environment variable prefix
pub const ENV_PREFIX: &str = "V";
/// 环境变量层级分隔符 / Environment nesting separator (`V_SERVER__WS_PORT` -> `server.ws_port`)
pub const ENV_SEPARATOR: &str = "__";

/// 配置错误类型 / Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置文件不存在 / config file not found: {path}")]
    FileNotFound { path: String },
    #[error("配置项不存在 / config key not found: '{key}'")]
    KeyNotFound { key: String },
    #[error("配置项类型转换失败 / config key '{key}' has wrong type: {message}")]
    TypeConversion { key: String, message: String },
    #[error("配置初始化失败 / config initialization failed: {message}")]
    Initialization { message: String },
}

/// 配置数据源信息 / Config source info
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置源类型 / Config source kind
pub enum ConfigSource {
    /// 文件配置源 / File source
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 环境变量配置源 / Environment source
    Env {
        prefix: String,
        separator: &'static str,
    },
    /// 内存配置源 / In-memory source
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源 / Inline string source
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    fn describe(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => (
                "File",
                format!("文件 / file: {} (required={})", path, required),
            ),
            ConfigSource::Env { prefix, separator } => (
                "Environment",
                format!("环境变量 / env: prefix={} separator={}", prefix, separator),
            ),
            ConfigSource::Memory(map) => ("Memory", format!("内存 / memory: {} keys", map.len())),
            ConfigSource::String { .. } => ("String", "字符串 / inline string".to_string()),
        };
        ConfigSourceInfo {
            source_type: source_type.to_string(),
            description,
            priority,
            loaded: false,
        }
    }

    fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("_")
                    .separator(separator)
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let json = serde_json::to_string(&map)
                    .map_err(|e| anyhow!("序列化内存配置失败 / serialize memory config: {}", e))?;
                Ok(builder.add_source(File::from_str(&json, FileFormat::Json)))
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

/// 配置管理器 / Configuration manager
///
/// 优先级从低到高 / Priority low to high:
/// `config/default.toml` < `config/production.toml` < 调用方配置源 / caller sources < 环境变量 / env
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 仅使用默认配置源 / Default sources only
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用指定的配置源创建配置管理器 / Build with extra sources
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        let defaults = vec![
            ConfigSource::File {
                path: "config/default.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/production.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
        ];
        let env = ConfigSource::Env {
            prefix: ENV_PREFIX.to_string(),
            separator: ENV_SEPARATOR,
        };

        let mut builder = Config::builder();
        let mut sources_info = Vec::new();
        for (index, source) in defaults
            .into_iter()
            .chain(sources)
            .chain(std::iter::once(env))
            .enumerate()
        {
            let mut info = source.describe(index as u8 + 1);
            if let ConfigSource::File { path, required, .. } = &source {
                if !std::path::Path::new(path).exists() {
                    if *required {
                        return Err(ConfigError::FileNotFound { path: path.clone() }.into());
                    }
                    sources_info.push(info);
                    continue;
                }
            }
            builder = source.add_to_builder(builder)?;
            info.loaded = true;
            sources_info.push(info);
        }

        let config = builder
            .build()
            .map_err(|e| ConfigError::Initialization { message: e.to_string() })?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 获取指定 key 的配置值 / Read a typed value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败 / read config '{}': {}", key, key, e))
    }

    /// 获取配置值，不存在则返回默认值 / Read a typed value or fall back to a default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 区分“不存在”与“类型错误” / Distinguish missing keys from wrong types
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound {
                key: key.to_string(),
            },
            other => ConfigError::TypeConversion {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// 以毫秒数读取时长 / Read a duration expressed in milliseconds
    pub fn get_duration_ms(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.get_or(key, default_ms))
    }

    /// 检查配置项是否存在 / Whether a key is present
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }

    /// 获取所有配置源信息 / All configured sources
    pub fn sources_info(&self) -> &[ConfigSourceInfo] {
        &self.sources_info
    }

    /// 记录配置源加载情况 / Log which sources were loaded
    pub fn log_sources(&self) {
        for info in &self.sources_info {
            tracing::info!(
                priority = info.priority,
                loaded = info.loaded,
                "🔧 config source {}: {}",
                info.source_type,
                info.description
            );
        }
    }
}

/// 以指定文件初始化全局配置管理器 / Initialise the global manager with a required file
pub fn init_global_config_with_file(path: &str) -> Result<Arc<ConfigManager>> {
    let manager = Arc::new(ConfigManager::with_sources(vec![ConfigSource::File {
        path: path.to_string(),
        format: None,
        required: true,
    }])?);
    let mut slot = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置写锁失败 / global config lock poisoned: {}", e))?;
    *slot = Some(manager.clone());
    Ok(manager)
}

/// 获取全局配置管理器实例（单例）/ Get the global manager, creating a default one if needed
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let slot = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("读取全局配置锁失败 / global config lock poisoned: {}", e))?;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }
    }
    let mut slot = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置写锁失败 / global config lock poisoned: {}", e))?;
    match slot.as_ref() {
        Some(manager) => Ok(manager.clone()),
        None => {
            let manager = Arc::new(ConfigManager::new()?);
            *slot = Some(manager.clone());
            Ok(manager)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConfigManager, ConfigSource};
    use config::FileFormat;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_config_from_string() {
        let source = ConfigSource::String {
            content: "[server]\nws_port = 5300\n[worker]\nflush_interval_ms = 250".to_string(),
            format: FileFormat::Toml,
        };
        let manager = ConfigManager::with_sources(vec![source]).unwrap();
        assert_eq!(manager.get::<i64>("server.ws_port").unwrap(), 5300);
        assert_eq!(
            manager.get_duration_ms("worker.flush_interval_ms", 500),
            Duration::from_millis(250)
        );
        assert_eq!(manager.get_duration_ms("worker.read_block_ms", 1000), Duration::from_secs(1));
    }

    #[test]
    fn test_config_from_memory() {
        let mut map = HashMap::new();
        map.insert("redis".to_string(), serde_json::json!({ "url": "redis://cache:6379" }));
        let manager = ConfigManager::with_sources(vec![ConfigSource::Memory(map)]).unwrap();
        assert_eq!(manager.get::<String>("redis.url").unwrap(), "redis://cache:6379");
        assert!(manager.exists("redis.url"));
        assert!(!manager.exists("redis.password"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        std::env::set_var("V_ENVTEST__BATCH_SIZE", "42");
        let source = ConfigSource::String {
            content: "[envtest]\nbatch_size = 7".to_string(),
            format: FileFormat::Toml,
        };
        let manager = ConfigManager::with_sources(vec![source]).unwrap();
        assert_eq!(manager.get::<i64>("envtest.batch_size").unwrap(), 42);
        std::env::remove_var("V_ENVTEST__BATCH_SIZE");
    }

    #[test]
    fn test_missing_key_and_required_file() {
        let manager = ConfigManager::with_sources(vec![]).unwrap();
        assert!(matches!(
            manager.get_safe::<String>("nope.missing"),
            Err(ConfigError::KeyNotFound { .. })
        ));
        assert_eq!(manager.get_or("nope.missing", 3_i64), 3);

        let required = ConfigSource::File {
            path: "does/not/exist.toml".to_string(),
            format: None,
            required: true,
        };
        assert!(ConfigManager::with_sources(vec![required]).is_err());
    }
}
