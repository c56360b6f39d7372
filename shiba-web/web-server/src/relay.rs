//! Server side pub/sub used to reach every socket subscribed to a room, regardless of which
//! server process holds it.
//!
//! Topics are dot separated. In subscription patterns `*` matches exactly one segment and a
//! trailing `>` matches one or more segments.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use common::config::RelayConfig;
use futures::{StreamExt, future::ready, stream::BoxStream};
use log::{info, warn};
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

const LOCAL_RELAY_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait Relay: Send + Sync {
    async fn publish(&self, topic: &str, message: String) -> Result<(), RelayError>;

    /// Every message published to a topic matching `pattern` after this call returns
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, String>, RelayError>;
}

pub async fn create_relay(config: &RelayConfig) -> Result<Arc<dyn Relay>, RelayError> {
    match config {
        RelayConfig::Local => {
            info!("[Relay]: using the in-process relay");
            Ok(Arc::new(LocalRelay::new()))
        }
        RelayConfig::Redis { url } => {
            info!("[Relay]: connecting to redis");
            Ok(Arc::new(RedisRelay::connect(url).await?))
        }
    }
}

pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut topic_segments = topic.split('.');

    for segment in pattern.split('.') {
        match segment {
            ">" => return topic_segments.next().is_some(),
            "*" => {
                if topic_segments.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_segments.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    topic_segments.next().is_none()
}

// -- Local

pub struct LocalRelay {
    sender: broadcast::Sender<(String, String)>,
}

impl LocalRelay {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_RELAY_CAPACITY);

        Self { sender }
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn publish(&self, topic: &str, message: String) -> Result<(), RelayError> {
        // An error only means nobody is subscribed
        let _ = self.sender.send((topic.to_string(), message));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, String>, RelayError> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        Ok(stream! {
            loop {
                match receiver.recv().await {
                    Ok((topic, message)) => {
                        if topic_matches(&pattern, &topic) {
                            yield message;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[Relay]: subscription {pattern} skipped {skipped} messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .boxed())
    }
}

// -- Redis

pub struct RedisRelay {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisRelay {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        Ok(Self { client, publisher })
    }
}

/// Redis globs match across dots, which is looser than our segment matching
fn redis_pattern(pattern: &str) -> String {
    pattern.replace('>', "*")
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, topic: &str, message: String) -> Result<(), RelayError> {
        let mut publisher = self.publisher.clone();
        publisher.publish::<_, _, ()>(topic, message).await?;

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, String>, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;

        let is_pattern = pattern.contains(['*', '>']);
        if is_pattern {
            pubsub.psubscribe(redis_pattern(pattern)).await?;
        } else {
            pubsub.subscribe(pattern).await?;
        }

        let pattern = pattern.to_string();
        Ok(pubsub
            .into_on_message()
            .filter_map(move |message| {
                let channel = message.get_channel_name().to_string();

                let payload = match message.get_payload::<String>() {
                    Ok(payload) if topic_matches(&pattern, &channel) => Some(payload),
                    Ok(_) => None,
                    Err(err) => {
                        warn!("[Relay]: dropping undecodable message on {channel}: {err}");
                        None
                    }
                };

                ready(payload)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("chatrooms.r1", "chatrooms.r1"));
        assert!(!topic_matches("chatrooms.r1", "chatrooms.r2"));
        assert!(!topic_matches("chatrooms.r1", "chatrooms.r1.extra"));

        assert!(topic_matches("webrtc.*.r1", "webrtc.offer.r1"));
        assert!(topic_matches("webrtc.*.r1", "webrtc.ice.r1"));
        assert!(!topic_matches("webrtc.*.r1", "webrtc.offer.r10"));
        assert!(!topic_matches("webrtc.*.r1", "webrtc.r1"));

        assert!(topic_matches("webrtc.>", "webrtc.offer.r1"));
        assert!(!topic_matches("webrtc.>", "webrtc"));
    }

    #[test]
    fn test_redis_pattern() {
        assert_eq!(redis_pattern("webrtc.*.r1"), "webrtc.*.r1");
        assert_eq!(redis_pattern("webrtc.>"), "webrtc.*");
    }

    async fn next(stream: &mut BoxStream<'static, String>) -> Option<String> {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("message")
    }

    #[tokio::test]
    async fn test_local_relay_filters_by_pattern() {
        let relay = LocalRelay::new();

        let mut chat = relay.subscribe("chatrooms.r1").await.expect("subscribe");
        let mut webrtc = relay.subscribe("webrtc.*.r1").await.expect("subscribe");

        relay
            .publish("chatrooms.r2", "other room".to_string())
            .await
            .expect("publish");
        relay
            .publish("webrtc.offer.r1", "offer".to_string())
            .await
            .expect("publish");
        relay
            .publish("chatrooms.r1", "hello".to_string())
            .await
            .expect("publish");

        assert_eq!(next(&mut chat).await.as_deref(), Some("hello"));
        assert_eq!(next(&mut webrtc).await.as_deref(), Some("offer"));
    }

    #[tokio::test]
    async fn test_local_relay_publish_without_subscribers() {
        let relay = LocalRelay::new();

        assert!(relay.publish("chatrooms.r1", "nobody".to_string()).await.is_ok());
    }
}
