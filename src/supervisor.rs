use crate::config::{DecoderConfig, StreamConfig};
use crate::decoder::{Decoder, DecoderHandle, LineStream};
use crate::error::SpawnError;
use crate::notify::{cancel_soft, send_soft, Credentials, Notification, Notifier};
use crate::parser::{SilenceEvent, SilenceParser, StreamState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 所有流共享的监督参数
#[derive(Clone)]
pub struct SupervisorContext {
    pub decoder: DecoderConfig,
    pub notifier: Arc<dyn Notifier>,
    /// 停止解码器以及等待读取任务结束的超时时间
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Stopped,
    Starting,
    Running,
    /// 解码器已自行退出，等待下一轮重启
    Exited,
    Stopping,
}

/// 监控任务对外发布的状态
#[derive(Debug, Clone, Copy, Default)]
struct MonitorStatus {
    state: StreamState,
    decoder_exited: bool,
}

/// 单路流的运行快照 (用于管理接口)
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub identifier: String,
    pub url: String,
    pub phase: SupervisorPhase,
    pub state: StreamState,
    pub pid: Option<u32>,
    pub uptime_seconds: u64,
    pub restarts: u32,
}

/// 单路流的完整生命周期：解码器进程 + 输出监控任务 + 告警状态
pub struct StreamSupervisor {
    config: StreamConfig,
    ctx: SupervisorContext,
    phase: SupervisorPhase,
    decoder: Option<DecoderHandle>,
    monitor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    status_rx: watch::Receiver<MonitorStatus>,
    restarts: u32,
}

impl StreamSupervisor {
    pub fn new(config: StreamConfig, ctx: SupervisorContext) -> Self {
        let (_, status_rx) = watch::channel(MonitorStatus::default());
        Self {
            config,
            ctx,
            phase: SupervisorPhase::Stopped,
            decoder: None,
            monitor: None,
            cancel: CancellationToken::new(),
            status_rx,
            restarts: 0,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn phase(&self) -> SupervisorPhase {
        if self.phase == SupervisorPhase::Running && self.status_rx.borrow().decoder_exited {
            return SupervisorPhase::Exited;
        }
        self.phase
    }

    pub fn state(&self) -> StreamState {
        self.status_rx.borrow().state
    }

    /// 存活解码器的 PID，已退出的进程在此被回收
    pub fn pid(&mut self) -> Option<u32> {
        self.decoder.as_mut().and_then(|d| d.pid())
    }

    pub fn snapshot(&mut self) -> StreamSnapshot {
        StreamSnapshot {
            identifier: self.config.identifier.clone(),
            url: self.config.url.clone(),
            phase: self.phase(),
            state: self.state(),
            pid: self.pid(),
            uptime_seconds: self.decoder.as_ref().map_or(0, |d| d.uptime().as_secs()),
            restarts: self.restarts,
        }
    }

    /// 启动解码器和输出监控任务
    ///
    /// 已在运行时直接返回。启动失败时回到 Stopped。
    pub async fn start(&mut self) -> Result<(), SpawnError> {
        if self.phase != SupervisorPhase::Stopped {
            return Ok(());
        }
        self.phase = SupervisorPhase::Starting;

        let (handle, lines) = match Decoder::start(&self.config, &self.ctx.decoder).await {
            Ok(started) => started,
            Err(e) => {
                self.phase = SupervisorPhase::Stopped;
                return Err(e);
            }
        };

        let (status_tx, status_rx) = watch::channel(MonitorStatus::default());
        self.cancel = CancellationToken::new();
        self.status_rx = status_rx;
        self.decoder = Some(handle);
        self.monitor = Some(tokio::spawn(monitor(
            lines,
            self.config.clone(),
            self.ctx.notifier.clone(),
            self.cancel.clone(),
            status_tx,
        )));
        self.phase = SupervisorPhase::Running;

        info!("Stream [{}] started.", self.config.identifier);
        Ok(())
    }

    /// 停止解码器并等待监控任务结束
    ///
    /// 任何阶段调用都是安全的；从未启动成功的流直接返回。
    pub async fn stop(&mut self) {
        if self.phase == SupervisorPhase::Stopped && self.decoder.is_none() {
            return;
        }
        self.phase = SupervisorPhase::Stopping;
        // 先取消，停止过程中读到的事件不再触发告警
        self.cancel.cancel();

        if let Some(mut decoder) = self.decoder.take() {
            if let Err(e) = decoder.stop(self.ctx.stop_timeout).await {
                warn!("Stream [{}]: {}", self.config.identifier, e);
            }
        }

        if let Some(mut monitor) = self.monitor.take() {
            // 进程退出后读取端会看到 EOF，任务自行结束
            if tokio::time::timeout(self.ctx.stop_timeout, &mut monitor)
                .await
                .is_err()
            {
                warn!(
                    "Monitor task for [{}] did not finish in {:?}, aborting",
                    self.config.identifier, self.ctx.stop_timeout
                );
                monitor.abort();
            }
        }

        self.phase = SupervisorPhase::Stopped;
        info!("Stream [{}] stopped.", self.config.identifier);
    }

    /// 先停止再用给定配置启动，期间不会同时存在两个解码器
    pub async fn restart(&mut self, config: StreamConfig) -> Result<(), SpawnError> {
        self.stop().await;
        if config != self.config {
            info!("Stream [{}] picked up new configuration.", config.identifier);
        }
        self.config = config;
        self.restarts += 1;
        self.start().await
    }
}

/// 逐行读取解码器输出，驱动静音状态机并发送告警
///
/// 静音状态只由本任务持有和修改，对外仅通过 watch 通道发布。
async fn monitor(
    mut lines: LineStream,
    cfg: StreamConfig,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    status_tx: watch::Sender<MonitorStatus>,
) {
    info!("Monitoring decoder output for {}", cfg.identifier);
    let credentials = Credentials::from(&cfg);
    let mut parser = SilenceParser::new(&cfg.identifier);

    while let Some(line) = lines.next_line().await {
        let Some(event) = parser.feed(&line) else {
            continue;
        };
        status_tx.send_modify(|status| status.state = parser.state());

        if cancel.is_cancelled() {
            debug!("Stream [{}] stopping, dropping {:?}", cfg.identifier, event);
            continue;
        }

        match event {
            SilenceEvent::SilenceStarted { identifier, at } => {
                warn!("Silence started for {}", identifier);
                send_soft(notifier.as_ref(), &Notification::silence_started(&cfg, at)).await;
            }
            SilenceEvent::SilenceEnded { identifier, at } => {
                info!("Silence ended for {}", identifier);
                cancel_soft(notifier.as_ref(), &identifier, &credentials).await;
                send_soft(notifier.as_ref(), &Notification::audio_resumed(&cfg, at)).await;
            }
        }
    }

    status_tx.send_modify(|status| status.decoder_exited = true);

    if cancel.is_cancelled() {
        debug!("Monitor for {} finished.", cfg.identifier);
    } else {
        // 不在此处重启，由定期轮换接管
        error!(
            "Decoder for {} exited unexpectedly; stream is unmonitored until the next restart cycle",
            cfg.identifier
        );
    }
}
