//! 推送服务客户端
//!
//! 投递只做一次：失败返回给调用方，由调用方记录后丢弃。
//! 紧急告警的重复提醒和过期由推送服务负责，本地不重试。

use crate::config::{NotifyConfig, StreamConfig};
use crate::error::NotificationError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

/// 紧急优先级，确认或取消前持续提醒
pub const PRIORITY_EMERGENCY: i32 = 2;
/// 高优先级，只投递一次
pub const PRIORITY_HIGH: i32 = 1;

/// 紧急告警的重复间隔与过期时间 (秒)
pub const ALERT_RETRY_SECS: u32 = 60;
pub const ALERT_EXPIRE_SECS: u32 = 3600;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_key: String,
    pub app_token: String,
}

impl From<&StreamConfig> for Credentials {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            user_key: cfg.user_key.clone(),
            app_token: cfg.app_token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub identifier: String,
    pub message: String,
    pub url: String,
    pub priority: i32,
    pub expire: u32,
    pub retry: u32,
    pub credentials: Credentials,
}

impl Notification {
    pub fn silence_started(cfg: &StreamConfig, at: DateTime<Local>) -> Self {
        Self {
            identifier: cfg.identifier.clone(),
            message: format!(
                "Silence started for {} at {}",
                cfg.identifier,
                at.format(TIMESTAMP_FORMAT)
            ),
            url: cfg.url.clone(),
            priority: PRIORITY_EMERGENCY,
            expire: ALERT_EXPIRE_SECS,
            retry: ALERT_RETRY_SECS,
            credentials: cfg.into(),
        }
    }

    pub fn audio_resumed(cfg: &StreamConfig, at: DateTime<Local>) -> Self {
        Self {
            identifier: cfg.identifier.clone(),
            message: format!(
                "Audio started for {} at {}",
                cfg.identifier,
                at.format(TIMESTAMP_FORMAT)
            ),
            url: cfg.url.clone(),
            priority: PRIORITY_HIGH,
            expire: 0,
            retry: 0,
            credentials: cfg.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;

    async fn cancel_by_tag(
        &self,
        identifier: &str,
        credentials: &Credentials,
    ) -> Result<(), NotificationError>;
}

#[derive(Serialize)]
struct MessageForm<'a> {
    token: &'a str,
    user: &'a str,
    message: &'a str,
    url: &'a str,
    priority: i32,
    expire: u32,
    retry: u32,
    tags: &'a str,
}

#[derive(Serialize)]
struct CancelForm<'a> {
    token: &'a str,
    user: &'a str,
}

pub struct PushoverClient {
    client: Client,
    api_base: Url,
}

impl PushoverClient {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotificationError> {
        let invalid = |reason: String| NotificationError::InvalidBase {
            base: config.api_base.clone(),
            reason,
        };
        let api_base = Url::parse(&config.api_base).map_err(|e| invalid(e.to_string()))?;
        if api_base.cannot_be_a_base() {
            return Err(invalid("not a hierarchical URL".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, api_base })
    }

    /// 在服务地址后追加路径段，每段单独转义
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post_form<T: Serialize + ?Sized>(
        &self,
        url: Url,
        form: &T,
    ) -> Result<(), NotificationError> {
        let response = self.client.post(url).form(form).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotificationError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl Notifier for PushoverClient {
    async fn send(&self, n: &Notification) -> Result<(), NotificationError> {
        let form = MessageForm {
            token: &n.credentials.app_token,
            user: &n.credentials.user_key,
            message: &n.message,
            url: &n.url,
            priority: n.priority,
            expire: n.expire,
            retry: n.retry,
            tags: &n.identifier,
        };
        let url = self.endpoint(&["1", "messages.json"]);
        self.post_form(url, &form).await
    }

    async fn cancel_by_tag(
        &self,
        identifier: &str,
        credentials: &Credentials,
    ) -> Result<(), NotificationError> {
        let form = CancelForm {
            token: &credentials.app_token,
            user: &credentials.user_key,
        };
        let tag = format!("{identifier}.json");
        let url = self.endpoint(&["1", "receipts", "cancel_by_tag", &tag]);
        self.post_form(url, &form).await
    }
}

/// 发送通知，失败只记录日志
pub async fn send_soft(notifier: &dyn Notifier, notification: &Notification) {
    match notifier.send(notification).await {
        Ok(()) => info!(
            "Notification sent: {} for {}",
            notification.message, notification.identifier
        ),
        Err(e) => error!(
            "Failed to send notification for {}: {}",
            notification.identifier, e
        ),
    }
}

/// 按标签取消仍在重复提醒的告警，失败只记录日志
pub async fn cancel_soft(notifier: &dyn Notifier, identifier: &str, credentials: &Credentials) {
    match notifier.cancel_by_tag(identifier, credentials).await {
        Ok(()) => info!("Notification canceled for {}", identifier),
        Err(e) => error!("Failed to cancel notification for {}: {}", identifier, e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Form, Path, State},
        http::StatusCode,
        routing::post,
        Router,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, HashMap<String, String>)>>>;

    fn stream() -> StreamConfig {
        StreamConfig {
            url: "http://radio.example/live".into(),
            identifier: "ID1".into(),
            user_key: "user-abc".into(),
            app_token: "token-xyz".into(),
            loudness_db: -30.0,
            silence_timeout_secs: 5.0,
        }
    }

    /// 在本地端口启动一个模拟的推送服务
    async fn mock_service(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();

        async fn messages(
            State((seen, status)): State<(Seen, StatusCode)>,
            Form(form): Form<HashMap<String, String>>,
        ) -> StatusCode {
            seen.lock().unwrap().push(("messages".into(), form));
            status
        }

        async fn cancel(
            State((seen, status)): State<(Seen, StatusCode)>,
            Path(tag): Path<String>,
            Form(form): Form<HashMap<String, String>>,
        ) -> StatusCode {
            seen.lock().unwrap().push((format!("cancel:{tag}"), form));
            status
        }

        let app = Router::new()
            .route("/1/messages.json", post(messages))
            .route("/1/receipts/cancel_by_tag/:tag", post(cancel))
            .with_state((seen.clone(), status));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), seen)
    }

    fn client(api_base: String) -> PushoverClient {
        PushoverClient::new(&NotifyConfig {
            api_base,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn silence_alert_uses_emergency_priority() {
        let n = Notification::silence_started(&stream(), Local::now());
        assert_eq!(n.priority, 2);
        assert_eq!(n.retry, 60);
        assert_eq!(n.expire, 3600);
        assert!(n.message.starts_with("Silence started for ID1 at "));

        let n = Notification::audio_resumed(&stream(), Local::now());
        assert_eq!(n.priority, 1);
        assert_eq!(n.retry, 0);
        assert!(n.message.starts_with("Audio started for ID1 at "));
    }

    #[tokio::test]
    async fn send_posts_form_fields() {
        let (base, seen) = mock_service(StatusCode::OK).await;
        let client = client(base);

        let n = Notification::silence_started(&stream(), Local::now());
        client.send(&n).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (endpoint, form) = &seen[0];
        assert_eq!(endpoint, "messages");
        assert_eq!(form["token"], "token-xyz");
        assert_eq!(form["user"], "user-abc");
        assert_eq!(form["url"], "http://radio.example/live");
        assert_eq!(form["priority"], "2");
        assert_eq!(form["expire"], "3600");
        assert_eq!(form["retry"], "60");
        assert_eq!(form["tags"], "ID1");
    }

    #[tokio::test]
    async fn cancel_posts_to_tag_endpoint() {
        let (base, seen) = mock_service(StatusCode::OK).await;
        let client = client(base);

        client
            .cancel_by_tag("ID1", &Credentials::from(&stream()))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let (endpoint, form) = &seen[0];
        assert_eq!(endpoint, "cancel:ID1.json");
        assert_eq!(form["token"], "token-xyz");
        assert_eq!(form["user"], "user-abc");
    }

    #[tokio::test]
    async fn cancel_escapes_identifier_in_path() {
        let (base, seen) = mock_service(StatusCode::OK).await;
        // 结尾的斜杠不影响拼接
        let client = client(format!("{base}/"));

        client
            .cancel_by_tag("studio 1/b?x", &Credentials::from(&stream()))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "cancel:studio 1/b?x.json");
    }

    #[test]
    fn endpoint_encodes_each_segment() {
        let client = client("https://api.pushover.net".to_string());
        let url = client.endpoint(&["1", "receipts", "cancel_by_tag", "a/b c.json"]);
        assert_eq!(
            url.as_str(),
            "https://api.pushover.net/1/receipts/cancel_by_tag/a%2Fb%20c.json"
        );
    }

    #[test]
    fn invalid_api_base_is_rejected() {
        let result = PushoverClient::new(&NotifyConfig {
            api_base: "not a url".to_string(),
            timeout_secs: 5,
        });
        assert!(matches!(
            result,
            Err(NotificationError::InvalidBase { .. })
        ));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (base, _seen) = mock_service(StatusCode::BAD_REQUEST).await;
        let client = client(base);

        let n = Notification::audio_resumed(&stream(), Local::now());
        let err = client.send(&n).await.unwrap_err();
        assert!(matches!(err, NotificationError::Rejected { status: 400 }));
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        // 绑定后立即释放端口，保证连接被拒绝
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(format!("http://{addr}"));
        let err = client
            .cancel_by_tag("ID1", &Credentials::from(&stream()))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Transport(_)));
    }

    #[tokio::test]
    async fn soft_helpers_swallow_failures() {
        let notifier = testing::RecordingNotifier::failing();
        let n = Notification::audio_resumed(&stream(), Local::now());
        send_soft(&notifier, &n).await;
        cancel_soft(&notifier, "ID1", &n.credentials).await;
        assert_eq!(notifier.calls().len(), 2);
    }
}
