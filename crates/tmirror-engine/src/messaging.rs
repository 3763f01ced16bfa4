//! Asynchronous notification channel used to chain backfill invocations.
//!
//! The continuation token travels only inside messages: the coordinator
//! publishes at most one [`ContinuationMessage`] per page, and the absence of
//! a publish ends the walk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Message attribute carrying the continuation token.
pub const NEXT_TOKEN_ATTRIBUTE: &str = "NextToken";

/// Body of every continuation message.
pub const BACKFILL_MESSAGE_BODY: &str = "Backfill existing instances";

/// Where a backfill walk stands: the topic that re-invokes the coordinator
/// and the token to resume from (absent at the start).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub topic: String,
    pub next_token: Option<String>,
}

impl Continuation {
    pub fn new(topic: impl Into<String>, next_token: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            next_token,
        }
    }
}

/// An outbound message on the backfill topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationMessage {
    pub topic: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

impl ContinuationMessage {
    pub fn new(topic: impl Into<String>, next_token: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(NEXT_TOKEN_ATTRIBUTE.to_string(), next_token.into());
        Self {
            topic: topic.into(),
            body: BACKFILL_MESSAGE_BODY.to_string(),
            attributes,
        }
    }

    pub fn next_token(&self) -> Option<&str> {
        self.attributes.get(NEXT_TOKEN_ATTRIBUTE).map(String::as_str)
    }

    /// The continuation this message asks the next invocation to run.
    pub fn continuation(&self) -> Continuation {
        Continuation::new(self.topic.clone(), self.next_token().map(str::to_string))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("Topic {topic} is unavailable: {message}")]
    Unavailable { topic: String, message: String },
}

/// Outbound messaging boundary.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: ContinuationMessage) -> Result<(), PublishError>;
}

/// [`Publisher`] backed by an unbounded tokio channel.
///
/// The receiving half stands in for the message bus: a local host drains it
/// and re-invokes the coordinator with each message.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<ContinuationMessage>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContinuationMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, message: ContinuationMessage) -> Result<(), PublishError> {
        let topic = message.topic.clone();
        self.tx.send(message).map_err(|_| PublishError::Unavailable {
            topic,
            message: "receiver dropped".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_carries_token() {
        let msg = ContinuationMessage::new("arn:topic", "400");
        assert_eq!(msg.body, BACKFILL_MESSAGE_BODY);
        assert_eq!(msg.next_token(), Some("400"));
        assert_eq!(
            msg.continuation(),
            Continuation::new("arn:topic", Some("400".to_string()))
        );
    }

    #[tokio::test]
    async fn test_channel_publisher_delivers() {
        let (publisher, mut rx) = ChannelPublisher::new();
        publisher
            .publish(ContinuationMessage::new("arn:topic", "200"))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.next_token(), Some("200"));
    }

    #[tokio::test]
    async fn test_channel_publisher_reports_closed_channel() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);
        let err = publisher
            .publish(ContinuationMessage::new("arn:topic", "200"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unavailable { .. }));
    }
}
