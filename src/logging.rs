use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 日志目录下的日志文件名
pub const LOG_FILE_NAME: &str = "silence-watch.log";

/// 控制台输出，指定目录时同时追加写入日志文件
///
/// 默认 info 级别，可通过 RUST_LOG 覆盖。返回的 guard 在退出前必须保持存活，
/// 否则文件中最后的日志可能丢失。
fn subscriber(
    log_dir: Option<&Path>,
) -> std::io::Result<(impl Subscriber + Send + Sync, Option<WorkerGuard>)> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer);
    Ok((subscriber, guard))
}

/// 安装全局日志订阅者
pub fn init(log_dir: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let (subscriber, guard) = subscriber(log_dir)?;
    subscriber.init();
    Ok(guard)
}
