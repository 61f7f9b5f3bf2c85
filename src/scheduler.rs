use crate::config::{ConfigSource, RestartConfigMode, ServerConfig, StreamConfig};
use crate::error::RegistryError;
use crate::registry::SharedRegistry;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 一轮轮换重启的结果统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub restarted: usize,
    pub failed: usize,
    pub removed: usize,
}

/// 持有注册表并负责定期轮换重启
pub struct FleetScheduler {
    registry: SharedRegistry,
    source: ConfigSource,
    mode: RestartConfigMode,
    interval: Duration,
}

impl FleetScheduler {
    pub fn new(registry: SharedRegistry, source: ConfigSource, server: &ServerConfig) -> Self {
        Self {
            registry,
            source,
            mode: server.restart_config,
            interval: server.restart_interval(),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// 为每个配置启动一路流，单路失败只记录并跳过
    pub async fn start_all(&self, configs: &[StreamConfig]) -> usize {
        let mut started = 0;
        for cfg in configs {
            let identifier = cfg.identifier.clone();
            match self.registry.start(cfg.clone()).await {
                Ok(()) => started += 1,
                Err(e) => error!("Failed to start stream [{}]: {}", identifier, e),
            }
        }
        info!("{}/{} streams started.", started, configs.len());
        started
    }

    /// 按标识从配置源解析后启动 (管理接口使用)
    pub async fn start_one(&self, identifier: &str) -> Result<(), RegistryError> {
        let cfg = self
            .source
            .resolve(identifier)
            .map_err(|e| {
                error!("Failed to read configuration: {}", e);
                RegistryError::NotConfigured(identifier.to_string())
            })?
            .ok_or_else(|| RegistryError::NotConfigured(identifier.to_string()))?;
        self.registry.start(cfg).await
    }

    /// 按重启配置模式重启单路流
    ///
    /// reload 模式下若配置源中已不存在该标识，则停止并移除该流。
    pub async fn restart_one(&self, identifier: &str) -> Result<(), RegistryError> {
        let cfg = match self.mode {
            RestartConfigMode::Frozen => None,
            RestartConfigMode::Reload => match self.source.resolve(identifier) {
                Ok(Some(cfg)) => Some(cfg),
                Ok(None) => {
                    warn!(
                        "Stream [{}] no longer configured, removing it.",
                        identifier
                    );
                    self.registry.stop(identifier).await;
                    return Err(RegistryError::NotConfigured(identifier.to_string()));
                }
                Err(e) => {
                    // 配置源暂时不可读时沿用当前配置
                    error!(
                        "Failed to reload configuration for [{}], keeping current: {}",
                        identifier, e
                    );
                    None
                }
            },
        };
        self.registry.restart(identifier, cfg).await
    }

    /// 依次重启所有已注册的流，同一时刻最多只有一路解码器处于停机状态
    pub async fn restart_sweep(&self, shutdown: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();
        for identifier in self.registry.identifiers().await {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, abandoning restart cycle.");
                break;
            }
            match self.restart_one(&identifier).await {
                Ok(()) => report.restarted += 1,
                Err(RegistryError::NotConfigured(_)) => report.removed += 1,
                // 轮换过程中被手动停止
                Err(RegistryError::NotFound(_)) => {
                    debug!("Stream [{}] vanished during restart cycle.", identifier)
                }
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// 定期轮换重启，直到收到关闭信号
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    info!("Restarting all decoder processes to ensure performance.");
                    let report = self.restart_sweep(&shutdown).await;
                    info!(
                        "Restart cycle finished: {} restarted, {} failed, {} removed.",
                        report.restarted, report.failed, report.removed
                    );
                }
            }
        }
        debug!("Restart scheduler exited.");
    }

    /// 停止所有流，等待解码器和监控任务全部结束
    pub async fn shutdown(&self) {
        self.registry.stop_all().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::decoder::testing::{sh_decoder, stream};
    use crate::notify::testing::{Call, RecordingNotifier};
    use crate::registry::FleetRegistry;
    use crate::supervisor::testing::{context, eventually, process_alive};
    use std::io::Write;
    use std::sync::Arc;

    fn scheduler(
        decoder: DecoderConfig,
        notifier: Arc<RecordingNotifier>,
        source: ConfigSource,
        server: ServerConfig,
    ) -> FleetScheduler {
        let registry = Arc::new(FleetRegistry::new(context(decoder, notifier)));
        FleetScheduler::new(registry, source, &server)
    }

    fn alerts_for(notifier: &RecordingNotifier, identifier: &str) -> usize {
        notifier
            .calls_for(identifier)
            .iter()
            .filter(|c| matches!(c, Call::Send(n) if n.priority == 2))
            .count()
    }

    #[tokio::test]
    async fn start_all_skips_failed_streams() {
        let notifier = Arc::new(RecordingNotifier::default());
        let s = scheduler(
            sh_decoder("[ \"$0\" = bad ] && exit 1; exec sleep 30"),
            notifier,
            ConfigSource::Env,
            ServerConfig::default(),
        );

        let mut broken = stream("B");
        broken.url = "bad".to_string();
        let started = s.start_all(&[stream("A"), broken, stream("C")]).await;

        assert_eq!(started, 2);
        assert_eq!(s.registry().identifiers().await, ["A", "C"]);
        s.shutdown().await;
        assert!(s.registry().identifiers().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_restarts_streams_sequentially() {
        let notifier = Arc::new(RecordingNotifier::default());
        // 每次启动都会输出一次 silence_start
        let s = scheduler(
            sh_decoder("echo 'silence_start: 0' >&2; exec sleep 30"),
            notifier.clone(),
            ConfigSource::Env,
            ServerConfig::default(),
        );
        s.start_all(&[stream("A"), stream("B")]).await;
        assert!(eventually(|| alerts_for(&notifier, "A") == 1 && alerts_for(&notifier, "B") == 1).await);

        let old: Vec<_> = s.registry().snapshots().await.iter().map(|x| x.pid.unwrap()).collect();
        let report = s.restart_sweep(&CancellationToken::new()).await;
        assert_eq!(report.restarted, 2);
        assert_eq!(report.failed, 0);

        let snapshots = s.registry().snapshots().await;
        for (snapshot, old_pid) in snapshots.iter().zip(&old) {
            assert_eq!(snapshot.restarts, 1);
            assert_ne!(snapshot.pid.unwrap(), *old_pid);
            assert!(!process_alive(*old_pid));
        }

        // 重启后两路流都重新开始产生事件
        assert!(eventually(|| alerts_for(&notifier, "A") == 2 && alerts_for(&notifier, "B") == 2).await);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_replaces_one_stream_at_a_time() {
        let log = tempfile::NamedTempFile::new().unwrap();
        let path = log.path().display().to_string();
        let script = format!(
            "echo \"start $0\" >> '{path}'; \
             trap 'echo \"stop $0\" >> \"{path}\"; exit 0' TERM; \
             while :; do sleep 0.05; done"
        );
        let decoder = DecoderConfig {
            startup_grace_ms: 200,
            ..sh_decoder(&script)
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let s = scheduler(decoder, notifier, ConfigSource::Env, ServerConfig::default());

        s.start_all(&[stream("A"), stream("B")]).await;
        let report = s.restart_sweep(&CancellationToken::new()).await;
        assert_eq!(report.restarted, 2);

        let events = std::fs::read_to_string(log.path()).unwrap();
        let events: Vec<&str> = events.lines().collect();
        let (a, b) = ("http://radio.example/A", "http://radio.example/B");
        assert_eq!(
            events,
            [
                format!("start {a}"),
                format!("start {b}"),
                format!("stop {a}"),
                format!("start {a}"),
                format!("stop {b}"),
                format!("start {b}"),
            ]
        );

        // 每路流任何时刻至多一个解码器，且同一时刻至多一路流在重启
        let mut live: std::collections::HashMap<&str, i32> = Default::default();
        for event in &events[2..] {
            let (kind, url) = event.split_once(' ').unwrap();
            *live.entry(url).or_default() += if kind == "start" { 1 } else { -1 };
            let counts: Vec<i32> = [a, b].iter().map(|u| *live.get(u).unwrap_or(&0)).collect();
            assert!(counts.iter().all(|c| (-1..=0).contains(c)), "{events:?}");
            assert!(counts.iter().sum::<i32>() >= -1, "{events:?}");
        }

        s.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_stops_after_shutdown_requested() {
        let notifier = Arc::new(RecordingNotifier::default());
        let s = scheduler(
            sh_decoder("exec sleep 30"),
            notifier,
            ConfigSource::Env,
            ServerConfig::default(),
        );
        s.start_all(&[stream("A"), stream("B")]).await;

        let token = CancellationToken::new();
        token.cancel();
        let report = s.restart_sweep(&token).await;
        assert_eq!(report, SweepReport::default());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn reload_mode_picks_up_changes_and_drops_removed_streams() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
streams:
  - {{ url: http://new-a, identifier: A, user_key: u, app_token: t, loudness_db: -50 }}
"#
        )
        .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let server = ServerConfig {
            restart_config: RestartConfigMode::Reload,
            ..ServerConfig::default()
        };
        let s = scheduler(
            sh_decoder("exec sleep 30"),
            notifier,
            ConfigSource::File(file.path().to_path_buf()),
            server,
        );
        s.start_all(&[stream("A"), stream("B")]).await;

        let report = s.restart_sweep(&CancellationToken::new()).await;
        assert_eq!(report.restarted, 1);
        assert_eq!(report.removed, 1);

        let snapshots = s.registry().snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].identifier, "A");
        assert_eq!(snapshots[0].url, "http://new-a");
        s.shutdown().await;
    }

    #[tokio::test]
    async fn frozen_mode_reuses_startup_config() {
        let notifier = Arc::new(RecordingNotifier::default());
        // 配置源不可读，frozen 模式不受影响
        let s = scheduler(
            sh_decoder("exec sleep 30"),
            notifier,
            ConfigSource::File("/nonexistent/silence-watch.yaml".into()),
            ServerConfig::default(),
        );
        s.start_all(&[stream("A")]).await;

        let report = s.restart_sweep(&CancellationToken::new()).await;
        assert_eq!(report.restarted, 1);
        assert_eq!(s.registry().snapshots().await[0].url, "http://radio.example/A");
        s.shutdown().await;
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let notifier = Arc::new(RecordingNotifier::default());
        let s = Arc::new(scheduler(
            sh_decoder("exec sleep 30"),
            notifier,
            ConfigSource::Env,
            ServerConfig::default(),
        ));

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let s = s.clone();
            let token = token.clone();
            async move { s.run(token).await }
        });

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler did not exit")
            .unwrap();
    }
}
