mod config;
mod decoder;
mod error;
mod logging;
mod notify;
mod parser;
mod registry;
mod scheduler;
mod supervisor;
mod web;

use clap::Parser;
use config::ConfigSource;
use notify::PushoverClient;
use registry::FleetRegistry;
use scheduler::FleetScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::SupervisorContext;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Silence Watch - 直播流静音监测
/// 为每路流启动解码器监测静音，静音时推送告警，并定期轮换重启所有解码器
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "silence-watch.yaml")]
    config: PathBuf,

    /// 从编号环境变量 (URL1, ID1, USER_KEY1, APP_TOKEN1, ...) 读取流定义
    #[arg(long)]
    env: bool,

    /// 环境变量模式下额外读取的 .env 文件，不存在时忽略
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// 日志目录，指定后同时写入该目录下的 silence-watch.log
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志系统，guard 需要存活到进程退出
    let _log_guard = logging::init(args.log_dir.as_deref())?;
    info!("Starting Silence Watch with automatic restarts...");

    // 加载配置，没有任何可用的流时直接退出
    let source = if args.env {
        if let Err(e) = config::load_env_file(&args.env_file) {
            warn!("{}", e);
        }
        ConfigSource::Env
    } else {
        ConfigSource::File(args.config)
    };
    let config = source.load().map_err(|e| {
        error!("No valid streams were found. Exiting. ({})", e);
        e
    })?;

    // 初始化注册表和调度器
    let notifier = Arc::new(PushoverClient::new(&config.notify)?);
    let ctx = SupervisorContext {
        decoder: config.decoder.clone(),
        notifier,
        stop_timeout: config.server.stop_timeout(),
    };
    let registry = Arc::new(FleetRegistry::new(ctx));
    let scheduler = Arc::new(FleetScheduler::new(registry, source, &config.server));

    if scheduler.start_all(&config.streams).await == 0 {
        error!("No stream could be started. Exiting.");
        anyhow::bail!("all {} streams failed to start", config.streams.len());
    }

    let shutdown = CancellationToken::new();

    // 启动定期轮换重启任务
    let restart_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    // 启动管理接口 (可选)
    let admin_task = match &config.server.listen {
        Some(listen) => {
            info!("Admin API listening on {}", listen);
            let listener = tokio::net::TcpListener::bind(listen).await?;
            let app = web::admin::router(scheduler.clone());
            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    shutdown_signal().await;
    info!("Shutdown signal received, stopping all streams...");
    shutdown.cancel();

    if let Err(e) = restart_task.await {
        error!("Restart scheduler task failed: {}", e);
    }
    if let Some(task) = admin_task {
        match task.await {
            Ok(Err(e)) => error!("Admin API error: {}", e),
            Err(e) => error!("Admin API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    scheduler.shutdown().await;

    info!("Silence Watch stopped.");
    Ok(())
}

/// 等待关闭信号 (SIGTERM 或 SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
