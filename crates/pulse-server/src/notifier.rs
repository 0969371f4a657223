//! Push fallback for recipients without a live socket.
//!
//! Notifications are fire-and-forget: `notify` never blocks the caller and
//! delivery failures are only logged.

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_shared::types::{CallId, CallType, ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushKind {
    Message {
        conversation_id: ConversationId,
        message_id: MessageId,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
    },
    IncomingCall {
        call_id: CallId,
        call_type: CallType,
    },
    MissedCall {
        call_id: CallId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushNotification {
    pub recipients: Vec<UserId>,
    pub sender_id: UserId,
    #[serde(flatten)]
    pub kind: PushKind,
}

/// Longest message body carried in a push preview, in characters.
const PREVIEW_CHARS: usize = 120;

impl PushNotification {
    pub fn message(
        recipients: Vec<UserId>,
        sender_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        body: Option<&str>,
    ) -> Self {
        Self {
            recipients,
            sender_id,
            kind: PushKind::Message {
                conversation_id,
                message_id,
                preview: body.map(|b| b.chars().take(PREVIEW_CHARS).collect()),
            },
        }
    }
}

pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: PushNotification);
}

/// Logs notifications. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: PushNotification) {
        info!(
            recipients = notification.recipients.len(),
            sender = %notification.sender_id,
            kind = ?notification.kind,
            "Push notification (log only)"
        );
    }
}

/// POSTs each notification as JSON to a webhook from a spawned task.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Spawn the POST for one notification. `None` when there is no one to
    /// notify.
    fn dispatch(&self, notification: PushNotification) -> Option<JoinHandle<()>> {
        if notification.recipients.is_empty() {
            return None;
        }

        let client = self.client.clone();
        let url = self.url.clone();
        Some(tokio::spawn(async move {
            let recipients = notification.recipients.len();
            match client.post(&url).json(&notification).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(recipients, "Push notification delivered to webhook");
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), recipients, "Push webhook rejected notification");
                }
                Err(e) => {
                    warn!(error = %e, recipients, "Push webhook unreachable");
                }
            }
        }))
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: PushNotification) {
        self.dispatch(notification);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let user = UserId::new();
        let notification = PushNotification::message(
            vec![user],
            UserId::new(),
            ConversationId::new(),
            MessageId::new(),
            Some("hello"),
        );
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["preview"], "hello");
        assert_eq!(value["recipients"][0], user.to_string());
    }

    #[test]
    fn test_preview_is_truncated() {
        let body = "é".repeat(500);
        let notification = PushNotification::message(
            vec![],
            UserId::new(),
            ConversationId::new(),
            MessageId::new(),
            Some(&body),
        );
        match notification.kind {
            PushKind::Message { preview, .. } => {
                assert_eq!(preview.unwrap().chars().count(), PREVIEW_CHARS)
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    fn missed_call(recipients: Vec<UserId>) -> PushNotification {
        PushNotification {
            recipients,
            sender_id: UserId::new(),
            kind: PushKind::MissedCall { call_id: CallId::new() },
        }
    }

    #[tokio::test]
    async fn test_webhook_skips_empty_recipient_list() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/push");
        assert!(notifier.dispatch(missed_call(vec![])).is_none());
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notifier = WebhookNotifier::new(format!("http://{addr}/push"));

        let request = notifier.dispatch(missed_call(vec![UserId::new()])).unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&received).contains("missed_call") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the body arrived");
            received.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        request.await.unwrap();

        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("POST /push"));
        assert!(text.to_ascii_lowercase().contains("content-type: application/json"));
    }
}
