//! Push notification delivery
//!
//! The escalation engine never talks to a gateway directly. It enqueues
//! [`Notification`]s on an in-process [`Outbox`] and a background
//! [`NotificationDispatcher`] delivers them, so a slow or failing push
//! provider cannot hold up a chat reply. Failures are logged, not retried;
//! the alert stays in the ledger for human review.

use crate::config::NotifyConfig;
use crate::db::AlertId;
use crate::state_machine::NotifyTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Push request failed: {0}")]
    Transport(String),
    #[error("Push provider rejected notification: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Outbox closed")]
    OutboxClosed,
    #[error("Failed to build push client: {0}")]
    Client(String),
}

/// Gateway acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub success: bool,
    pub message_id: String,
}

/// Fire-and-forget push delivery
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, target: &str, title: &str, body: &str) -> Result<Delivery, NotifyError>;
}

#[async_trait]
impl<T: NotificationGateway + ?Sized> NotificationGateway for Arc<T> {
    async fn send(&self, target: &str, title: &str, body: &str) -> Result<Delivery, NotifyError> {
        (**self).send(target, title, body).await
    }
}

/// Posts notifications as JSON to a push webhook
pub struct WebhookGateway {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    target: &'a str,
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookReply {
    message_id: Option<String>,
}

impl WebhookGateway {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl NotificationGateway for WebhookGateway {
    async fn send(&self, target: &str, title: &str, body: &str) -> Result<Delivery, NotifyError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&WebhookPayload {
                target,
                title,
                body,
            });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::Transport(format!("Request timeout: {e}"))
            } else {
                NotifyError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NotifyError::Transport(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let message_id = serde_json::from_str::<WebhookReply>(&text)
            .ok()
            .and_then(|r| r.message_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Delivery {
            success: true,
            message_id,
        })
    }
}

/// Writes notifications to the log instead of sending them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyGateway;

#[async_trait]
impl NotificationGateway for LogOnlyGateway {
    async fn send(&self, target: &str, title: &str, body: &str) -> Result<Delivery, NotifyError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(to = %target, %title, %body, %message_id, "Push notification (log only)");
        Ok(Delivery {
            success: true,
            message_id,
        })
    }
}

/// Pick the gateway for the configured environment
pub fn gateway_from_config(config: &NotifyConfig) -> Result<Arc<dyn NotificationGateway>, NotifyError> {
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(WebhookGateway::new(
            endpoint.clone(),
            config.api_key.clone(),
            config.timeout,
        )?)),
        None => {
            tracing::warn!("GYEOT_PUSH_ENDPOINT not set, notifications will only be logged");
            Ok(Arc::new(LogOnlyGateway))
        }
    }
}

/// A notification waiting on the outbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub alert_id: AlertId,
    pub target: NotifyTarget,
    pub title: String,
    pub body: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Sending half of the in-process notification queue
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Outbox {
    pub fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx
            .send(notification)
            .map_err(|_| NotifyError::OutboxClosed)
    }
}

/// Create a connected outbox and its receiving end
pub fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, rx)
}

/// Drains the outbox into a gateway
pub struct NotificationDispatcher<G> {
    gateway: G,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl<G: NotificationGateway> NotificationDispatcher<G> {
    pub fn new(gateway: G, rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self { gateway, rx }
    }

    /// Deliver until cancelled or every outbox sender is gone.
    ///
    /// On cancellation, notifications already queued are still delivered.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Notification dispatcher started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.rx.close();
                    while let Some(notification) = self.rx.recv().await {
                        self.deliver(&notification).await;
                    }
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(notification) => {
                        self.deliver(&notification).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }

    /// Deliver one notification; failures are logged
    pub async fn deliver(&self, notification: &Notification) -> Option<Delivery> {
        let target = notification.target.address();
        match self
            .gateway
            .send(target, &notification.title, &notification.body)
            .await
        {
            Ok(delivery) => {
                tracing::info!(
                    alert_id = %notification.alert_id,
                    to = %notification.target,
                    message_id = %delivery.message_id,
                    "Notification delivered"
                );
                Some(delivery)
            }
            Err(e) => {
                tracing::error!(
                    alert_id = %notification.alert_id,
                    to = %notification.target,
                    error = %e,
                    "Notification delivery failed"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::RecordingGateway;

    fn notification(alert: i64, target: NotifyTarget) -> Notification {
        Notification {
            alert_id: AlertId(alert),
            target,
            title: "어머니 상태 주의 필요".to_string(),
            body: "사유: test".to_string(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order() {
        let gateway = Arc::new(RecordingGateway::new());
        let (outbox, rx) = outbox();
        let dispatcher = NotificationDispatcher::new(gateway.clone(), rx);

        outbox
            .enqueue(notification(1, NotifyTarget::Guardian("010-1234-5678".into())))
            .unwrap();
        outbox
            .enqueue(notification(2, NotifyTarget::Agency("agency_admin".into())))
            .unwrap();
        drop(outbox);

        dispatcher.run(CancellationToken::new()).await;

        let sent = gateway.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].target, "010-1234-5678");
        assert_eq!(sent[1].target, "agency_admin");
    }

    #[tokio::test]
    async fn test_dispatcher_drains_on_cancel() {
        let gateway = Arc::new(RecordingGateway::new());
        let (outbox, rx) = outbox();
        let dispatcher = NotificationDispatcher::new(gateway.clone(), rx);
        let cancel = CancellationToken::new();

        outbox
            .enqueue(notification(1, NotifyTarget::Agency("agency_admin".into())))
            .unwrap();
        cancel.cancel();
        dispatcher.run(cancel).await;

        assert_eq!(gateway.sent().len(), 1);
        assert!(outbox
            .enqueue(notification(2, NotifyTarget::Agency("agency_admin".into())))
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_swallowed() {
        let gateway = Arc::new(RecordingGateway::failing());
        let (_outbox, rx) = outbox();
        let dispatcher = NotificationDispatcher::new(gateway.clone(), rx);

        let result = dispatcher
            .deliver(&notification(1, NotifyTarget::Agency("agency_admin".into())))
            .await;
        assert!(result.is_none());
        assert_eq!(gateway.attempts(), 1);
    }

    #[tokio::test]
    async fn test_log_only_gateway_succeeds() {
        let delivery = LogOnlyGateway.send("agency_admin", "t", "b").await.unwrap();
        assert!(delivery.success);
        assert!(!delivery.message_id.is_empty());
    }

    #[test]
    fn test_gateway_selection() {
        assert!(gateway_from_config(&NotifyConfig::default()).is_ok());
        let config = NotifyConfig {
            endpoint: Some("http://127.0.0.1:9/push".to_string()),
            ..NotifyConfig::default()
        };
        assert!(gateway_from_config(&config).is_ok());
    }
}
