//! Transport fabric seam.
//!
//! The engine treats the transport as a black box that can broadcast a
//! request to a set of named endpoints and collect replies. Individual
//! endpoint failures are reported in the result, never raised: state
//! broadcasts must reach whoever is reachable.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::message::{Channel, Message};

/// One endpoint's reply (or failure) within a broadcast.
#[derive(Debug)]
pub struct BroadcastReply {
    pub target: String,
    pub reply: Option<Message>,
    pub error: Option<String>,
}

/// Fabric capability the coordination engine talks through.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to every target on `channel`/`topic` and wait up to
    /// `timeout` for replies. When `optional` is set, delivery failures are
    /// expected (targets may be gone) and logged at debug level only.
    async fn broadcast_request(
        &self,
        channel: Channel,
        topic: &str,
        request: Message,
        targets: &[String],
        timeout: Duration,
        optional: bool,
    ) -> Vec<BroadcastReply>;
}

/// In-process transport that records broadcasts and answers with a fixed
/// reply. Used by non-networked deployments and tests.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<(Channel, String, Vec<String>)>>,
    reply: Option<Message>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(reply: Message) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reply: Some(reply),
        }
    }

    /// Broadcasts observed so far: (channel, topic, targets).
    pub async fn sent(&self) -> Vec<(Channel, String, Vec<String>)> {
        let sent = self.sent.lock().await;
        sent.clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn broadcast_request(
        &self,
        channel: Channel,
        topic: &str,
        _request: Message,
        targets: &[String],
        _timeout: Duration,
        optional: bool,
    ) -> Vec<BroadcastReply> {
        {
            let mut sent = self.sent.lock().await;
            sent.push((channel, topic.to_string(), targets.to_vec()));
        }
        targets
            .iter()
            .map(|target| match &self.reply {
                Some(reply) => BroadcastReply {
                    target: target.clone(),
                    reply: Some(reply.clone()),
                    error: None,
                },
                None => {
                    if optional {
                        tracing::debug!("no receiver for optional broadcast to {}", target);
                    } else {
                        tracing::warn!("no receiver for broadcast to {}", target);
                    }
                    BroadcastReply {
                        target: target.clone(),
                        reply: None,
                        error: Some("no receiver".to_string()),
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ok_reply, Payload};

    #[tokio::test]
    async fn test_loopback_records_broadcasts() {
        let transport = LoopbackTransport::with_reply(ok_reply(Payload::Text("ok".to_string())));
        let replies = transport
            .broadcast_request(
                Channel::ServerCommand,
                "server_state",
                Message::default(),
                &["server.job-1".to_string(), "server.job-2".to_string()],
                Duration::from_secs(5),
                true,
            )
            .await;
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.reply.is_some()));

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "server_state");
        assert_eq!(sent[0].2.len(), 2);
    }

    #[tokio::test]
    async fn test_loopback_without_reply_reports_errors() {
        let transport = LoopbackTransport::new();
        let replies = transport
            .broadcast_request(
                Channel::ServerCommand,
                "server_state",
                Message::default(),
                &["server.job-1".to_string()],
                Duration::from_secs(1),
                true,
            )
            .await;
        assert!(replies[0].reply.is_none());
        assert!(replies[0].error.is_some());
    }
}
