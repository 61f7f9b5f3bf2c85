use crate::config::StreamConfig;
use crate::error::RegistryError;
use crate::supervisor::{StreamSnapshot, StreamSupervisor, SupervisorContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// 全局流注册表 (Identifier -> Supervisor)
///
/// 所有增删和重启都在持有同一把锁的情况下完成，
/// 定期轮换与手动启停同一路流不会交错执行。
pub struct FleetRegistry {
    ctx: SupervisorContext,
    streams: Mutex<HashMap<String, StreamSupervisor>>,
}

pub type SharedRegistry = Arc<FleetRegistry>;

impl FleetRegistry {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            ctx,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// 启动并注册一路流；启动失败不会留下注册项
    pub async fn start(&self, cfg: StreamConfig) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&cfg.identifier) {
            return Err(RegistryError::AlreadyRunning(cfg.identifier));
        }

        let mut supervisor = StreamSupervisor::new(cfg, self.ctx.clone());
        supervisor.start().await?;
        streams.insert(supervisor.identifier().to_string(), supervisor);
        Ok(())
    }

    /// 停止并移除一路流，返回是否存在该流
    pub async fn stop(&self, identifier: &str) -> bool {
        let mut streams = self.streams.lock().await;
        match streams.remove(identifier) {
            Some(mut supervisor) => {
                supervisor.stop().await;
                true
            }
            None => false,
        }
    }

    /// 原地重启一路流，`cfg` 为 None 时沿用当前配置
    ///
    /// 重新启动失败时保留注册项 (Stopped)，下一轮轮换会再次尝试。
    pub async fn restart(
        &self,
        identifier: &str,
        cfg: Option<StreamConfig>,
    ) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().await;
        let supervisor = streams
            .get_mut(identifier)
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;

        let cfg = cfg.unwrap_or_else(|| supervisor.config().clone());
        if let Err(e) = supervisor.restart(cfg).await {
            error!("Restart failed [{}]: {}", identifier, e);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn identifiers(&self) -> Vec<String> {
        let streams = self.streams.lock().await;
        let mut ids: Vec<_> = streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn contains(&self, identifier: &str) -> bool {
        self.streams.lock().await.contains_key(identifier)
    }

    pub async fn snapshots(&self) -> Vec<StreamSnapshot> {
        let mut streams = self.streams.lock().await;
        let mut result: Vec<_> = streams.values_mut().map(|s| s.snapshot()).collect();
        result.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        result
    }

    /// 停止所有流并清空注册表
    pub async fn stop_all(&self) {
        let mut streams = self.streams.lock().await;
        let count = streams.len();
        for (identifier, mut supervisor) in streams.drain() {
            supervisor.stop().await;
            info!("Stream [{}] shut down.", identifier);
        }
        if count > 0 {
            info!("All {} streams stopped.", count);
        } else {
            warn!("Shutdown requested with no registered streams.");
        }
    }
}
