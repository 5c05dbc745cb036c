//! Fire-and-forget progress publishing, scoped per session.
//!
//! Failures are logged and swallowed: a lost progress event must never fail
//! a scan.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::{json, Value};

use crate::errors::AppError;

pub const EVENT_TESTER_PROGRESS: &str = "testerProgress";
pub const EVENT_TESTER_MESSAGE: &str = "testerMessage";

#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(&self, session_id: &str, payload: Value, event: &str);
}

/// Publishes to Redis channel `app-<sessionId>`.
pub struct RedisPublisher {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url).map_err(|e| AppError::RemoteUnreachable {
            service: "Redis".to_string(),
            detail: e.to_string(),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::RemoteUnreachable {
                service: "Redis".to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self { conn })
    }
}

pub fn channel_for(session_id: &str) -> String {
    format!("app-{session_id}")
}

#[async_trait]
impl ProgressPublisher for RedisPublisher {
    async fn publish(&self, session_id: &str, payload: Value, event: &str) {
        let message = json!({ "id": session_id, "event": event, "data": payload }).to_string();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn.publish(channel_for(session_id), message).await;
        if let Err(e) = result {
            tracing::warn!(session_id, event, error = %e, "Failed to publish progress event");
        }
    }
}

/// Writes events to the log only; used when no Redis is configured.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl ProgressPublisher for LogPublisher {
    async fn publish(&self, session_id: &str, payload: Value, event: &str) {
        tracing::info!(session_id, event, %payload, "Tester event");
    }
}

/// Connect to Redis when a URL is configured, falling back to log-only publishing.
pub async fn from_config(redis_url: Option<&str>) -> Box<dyn ProgressPublisher> {
    match redis_url {
        Some(url) => match RedisPublisher::connect(url).await {
            Ok(publisher) => Box::new(publisher),
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, progress events will only be logged");
                Box::new(LogPublisher)
            }
        },
        None => Box::new(LogPublisher),
    }
}
