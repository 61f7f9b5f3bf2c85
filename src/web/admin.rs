use crate::error::RegistryError;
use crate::scheduler::FleetScheduler;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

pub type SharedScheduler = Arc<FleetScheduler>;

/// 注册管理接口路由
pub fn router(scheduler: SharedScheduler) -> Router {
    Router::new()
        .route("/streams", get(list_streams)) // 获取流列表
        .route("/streams/:name/start", post(handle_start)) // 启动流
        .route("/streams/:name/stop", post(handle_stop)) // 停止流
        .route("/streams/:name/restart", post(handle_restart)) // 重启流
        .with_state(scheduler)
}

/// 获取流列表 API
/// 返回所有已注册流的阶段、静音状态、进程号和运行时长
pub async fn list_streams(State(scheduler): State<SharedScheduler>) -> Json<serde_json::Value> {
    let streams = scheduler.registry().snapshots().await;
    Json(serde_json::json!({ "streams": streams }))
}

/// 手动启动流 API
pub async fn handle_start(
    State(scheduler): State<SharedScheduler>,
    Path(name): Path<String>,
) -> String {
    match scheduler.start_one(&name).await {
        Ok(_) => format!("Stream [{}] started", name),
        Err(RegistryError::AlreadyRunning(_)) => format!("Stream [{}] is already active", name),
        Err(e) => format!("Error: {}", e),
    }
}

/// 手动停止流 API
pub async fn handle_stop(
    State(scheduler): State<SharedScheduler>,
    Path(name): Path<String>,
) -> String {
    if scheduler.registry().stop(&name).await {
        format!("Stream [{}] stopped", name)
    } else {
        format!("Stream [{}] is not running", name)
    }
}

/// 手动重启流 API
pub async fn handle_restart(
    State(scheduler): State<SharedScheduler>,
    Path(name): Path<String>,
) -> String {
    match scheduler.restart_one(&name).await {
        Ok(_) => format!("Stream [{}] restarted", name),
        Err(e) => format!("Error: {}", e),
    }
}
