use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub decoder: DecoderConfig,
    pub notify: NotifyConfig,
    /// 校验通过的流，不完整或重复的条目已被跳过
    pub streams: Vec<StreamConfig>,
}

/// 配置文件的原始结构，流定义逐条校验
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    decoder: DecoderConfig,
    #[serde(default)]
    notify: NotifyConfig,
    #[serde(default)]
    streams: Vec<serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// 管理接口监听地址，不配置则不启动 HTTP 服务
    #[serde(default)]
    pub listen: Option<String>,

    /// 定期轮换重启间隔 (秒)
    #[serde(default = "default_restart_interval")]
    pub restart_interval_secs: u64,

    /// 单个解码器优雅停止的超时时间 (毫秒)，超时后强制终止
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// 重启时使用启动时冻结的配置，还是按标识重新读取配置源
    #[serde(default)]
    pub restart_config: RestartConfigMode,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartConfigMode {
    #[default]
    Frozen,
    Reload,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    #[serde(default = "default_decoder_binary")]
    pub binary: String,

    /// 解码器参数模板，支持 {url} {loudness} {silence_timeout} 占位符
    #[serde(default = "default_decoder_args")]
    pub args: Vec<String>,

    /// 可用内存低于此值 (KB) 时拒绝启动新进程
    #[serde(default = "default_min_free_memory")]
    pub min_free_memory_kb: u64,

    /// 启动后观察进程是否立即退出的时间 (毫秒)
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StreamConfig {
    pub url: String,
    pub identifier: String,
    pub user_key: String,
    pub app_token: String,
    #[serde(default = "default_loudness")]
    pub loudness_db: f64,
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            restart_interval_secs: default_restart_interval(),
            stop_timeout_ms: default_stop_timeout(),
            restart_config: RestartConfigMode::default(),
        }
    }
}

impl ServerConfig {
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            binary: default_decoder_binary(),
            args: default_decoder_args(),
            min_free_memory_kb: default_min_free_memory(),
            startup_grace_ms: default_startup_grace(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

fn default_restart_interval() -> u64 {
    3600
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_decoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_decoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-nostdin",
        "-nostats",
        "-i",
        "{url}",
        "-af",
        "silencedetect=n={loudness}dB:d={silence_timeout}",
        "-f",
        "null",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_free_memory() -> u64 {
    5120
}

fn default_startup_grace() -> u64 {
    250
}

fn default_api_base() -> String {
    "https://api.pushover.net".to_string()
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_loudness() -> f64 {
    -30.0
}

fn default_silence_timeout() -> f64 {
    5.0
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        let raw: RawConfig = serde_yaml::from_str(&content)?;
        let candidates = raw.streams.into_iter().enumerate().map(|(i, value)| {
            let stream = serde_yaml::from_value::<StreamConfig>(value).map_err(ConfigError::from);
            (i + 1, stream)
        });

        let config = AppConfig {
            server: raw.server,
            decoder: raw.decoder,
            notify: raw.notify,
            streams: usable_streams(candidates),
        };
        config.validate()?;
        Ok(config)
    }

    /// 从编号环境变量读取流定义 (URL1, ID1, USER_KEY1, APP_TOKEN1, ...)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let streams = streams_from_lookup(lookup)?;
        let candidates = streams.into_iter().enumerate().map(|(i, s)| (i + 1, Ok(s)));
        let config = AppConfig {
            streams: usable_streams(candidates),
            ..AppConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn find_stream(&self, identifier: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.identifier == identifier)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.restart_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "server.restart_interval_secs",
                reason: "must be greater than zero",
            });
        }
        // 只有一路可用的流都没有时才致命
        if self.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }
        Ok(())
    }
}

/// 逐条检查流定义：无法解析、缺少必填字段或标识重复的条目记录后跳过
///
/// 标识重复时保留第一次出现的条目。
fn usable_streams<I>(candidates: I) -> Vec<StreamConfig>
where
    I: IntoIterator<Item = (usize, Result<StreamConfig, ConfigError>)>,
{
    let mut seen = HashSet::new();
    let mut streams = Vec::new();

    for (index, candidate) in candidates {
        let checked = candidate.and_then(|stream| {
            for (field, value) in [
                ("url", &stream.url),
                ("identifier", &stream.identifier),
                ("user_key", &stream.user_key),
                ("app_token", &stream.app_token),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::MissingField { index, field });
                }
            }
            if seen.contains(&stream.identifier) {
                return Err(ConfigError::DuplicateIdentifier(stream.identifier.clone()));
            }
            Ok(stream)
        });

        match checked {
            Ok(stream) => {
                seen.insert(stream.identifier.clone());
                streams.push(stream);
            }
            Err(e) => error!("Skipping stream #{}: {}", index, e),
        }
    }

    streams
}

/// 编号从 1 开始连续读取，遇到第一个不完整的条目即结束
fn streams_from_lookup<F>(lookup: F) -> Result<Vec<StreamConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut streams = Vec::new();
    let mut index = 1;

    loop {
        let get = |name: &str| lookup(&format!("{name}{index}")).filter(|v| !v.is_empty());

        let (Some(url), Some(identifier), Some(user_key), Some(app_token)) = (
            get("URL"),
            get("ID"),
            get("USER_KEY"),
            get("APP_TOKEN"),
        ) else {
            if index == 1 {
                error!("No streams found in the environment!");
            }
            break;
        };

        let loudness_db = parse_number(index, "LOUDNESS", get("LOUDNESS"), default_loudness());
        let silence_timeout_secs = parse_number(
            index,
            "SILENCE_TIMEOUT",
            get("SILENCE_TIMEOUT"),
            default_silence_timeout(),
        );

        match (loudness_db, silence_timeout_secs) {
            (Ok(loudness_db), Ok(silence_timeout_secs)) => {
                info!(
                    "Stream {} added with URL {}, Loudness {}, Silence Timeout {}",
                    identifier, url, loudness_db, silence_timeout_secs
                );
                streams.push(StreamConfig {
                    url,
                    identifier,
                    user_key,
                    app_token,
                    loudness_db,
                    silence_timeout_secs,
                });
            }
            (Err(e), _) | (_, Err(e)) => {
                // 条目完整但数值非法：跳过该流，不截断后续列表
                error!("Skipping stream #{}: {}", index, e);
            }
        }
        index += 1;
    }

    Ok(streams)
}

fn parse_number(
    index: usize,
    field: &'static str,
    raw: Option<String>,
    default: f64,
) -> Result<f64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<f64>().ok().filter(|v| v.is_finite());
            parsed.ok_or(ConfigError::InvalidValue {
                index,
                field,
                value,
            })
        }
    }
}

/// 读取 .env 文件补充进程环境变量，已存在的变量不会被覆盖
///
/// 文件不存在时返回 `Ok(false)`。
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    match dotenvy::from_path(path) {
        Ok(()) => {
            info!("Loaded environment from {}", path.display());
            Ok(true)
        }
        Err(e) if e.not_found() => Ok(false),
        Err(source) => Err(ConfigError::EnvFile {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// 配置来源，用于启动加载以及重启时按标识重新解析
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Env,
}

impl ConfigSource {
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        match self {
            ConfigSource::File(path) => AppConfig::load(path),
            ConfigSource::Env => AppConfig::from_env(),
        }
    }

    pub fn resolve(&self, identifier: &str) -> Result<Option<StreamConfig>, ConfigError> {
        let config = self.load()?;
        Ok(config.find_stream(identifier).cloned())
    }
}
