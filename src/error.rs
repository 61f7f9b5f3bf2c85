use std::time::Duration;
use thiserror::Error;

/// 配置加载与校验错误，仅在启动阶段致命
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to load env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },

    #[error("no streams found (stream definition at index 1 is missing or incomplete)")]
    NoStreams,

    #[error("stream #{index} is missing field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("stream #{index}: invalid value for `{field}`: {value}")]
    InvalidValue {
        index: usize,
        field: &'static str,
        value: String,
    },

    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting {
        field: &'static str,
        reason: &'static str,
    },

    #[error("duplicate stream identifier `{0}`")]
    DuplicateIdentifier(String),
}

/// 解码器进程启动失败，只影响对应的流
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch decoder `{binary}`: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("decoder exited immediately ({status})")]
    ExitedEarly { status: String },

    #[error("decoder stderr was not captured")]
    NoStderr,

    #[error("insufficient system memory ({available_kb} KB available)")]
    LowMemory { available_kb: u64 },
}

/// 推送服务不可达或拒绝请求，记录后丢弃
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("paging service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("paging service rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("invalid paging service address `{base}`: {reason}")]
    InvalidBase { base: String, reason: String },
}

/// 优雅停止超时，已升级为强制终止
#[derive(Debug, Error)]
#[error("decoder (pid {pid:?}) ignored SIGTERM for {timeout:?}, killed")]
pub struct StopTimeoutError {
    pub pid: Option<u32>,
    pub timeout: Duration,
}

/// 注册表操作错误
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream `{0}` is already registered")]
    AlreadyRunning(String),

    #[error("stream `{0}` is not registered")]
    NotFound(String),

    #[error("stream `{0}` has no configuration")]
    NotConfigured(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}
