//! Change-notification payloads and the broker queue envelope.
//!
//! The store emits `task_created` / `task_updated` on commit; the bridge
//! republishes the task id onto the broker queue. Queue elements are either
//! a bare uuid or a JSON envelope carrying a `traceparent` for propagation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::TaskStatus;

pub const CHANNEL_TASK_CREATED: &str = "task_created";
pub const CHANNEL_TASK_UPDATED: &str = "task_updated";

/// Payload of a `task_created` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub assignee_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// Payload of a `task_updated` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdatedPayload {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
}

/// A parsed change-feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification {
    Created(TaskCreatedPayload),
    Updated(TaskUpdatedPayload),
}

impl ChangeNotification {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Created(p) => p.task_id,
            Self::Updated(p) => p.task_id,
        }
    }

    /// Parse a raw NOTIFY payload from the named channel.
    pub fn parse(channel: &str, payload: &str) -> DomainResult<Self> {
        match channel {
            CHANNEL_TASK_CREATED => Ok(Self::Created(serde_json::from_str(payload)?)),
            CHANNEL_TASK_UPDATED => Ok(Self::Updated(serde_json::from_str(payload)?)),
            other => Err(DomainError::Serialization(format!(
                "unknown notification channel: {other}"
            ))),
        }
    }
}

/// Element pushed onto the broker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

impl QueueMessage {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            traceparent: None,
        }
    }

    pub fn with_traceparent(mut self, traceparent: impl Into<String>) -> Self {
        self.traceparent = Some(traceparent.into());
        self
    }

    /// Bare uuid when there is no trace context, JSON envelope otherwise.
    pub fn encode(&self) -> String {
        if self.traceparent.is_none() {
            self.task_id.to_string()
        } else {
            serde_json::to_string(self).unwrap_or_else(|_| self.task_id.to_string())
        }
    }

    /// Accept both encodings; dispatchers must tolerate payloads from older
    /// bridges.
    pub fn decode(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            return Ok(serde_json::from_str(trimmed)?);
        }
        let task_id = Uuid::parse_str(trimmed).map_err(|_| {
            DomainError::Serialization(format!("queue payload is not a task id: {trimmed}"))
        })?;
        Ok(Self::new(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_uuid_round_trip() {
        let message = QueueMessage::new(Uuid::new_v4());
        let encoded = message.encode();
        assert!(!encoded.starts_with('{'));
        assert_eq!(QueueMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_envelope_round_trip() {
        let message = QueueMessage::new(Uuid::new_v4())
            .with_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");
        let encoded = message.encode();
        assert!(encoded.starts_with('{'));
        assert_eq!(QueueMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(QueueMessage::decode("not-a-uuid").is_err());
    }

    #[test]
    fn test_parse_notification_channels() {
        let task_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "task_id": task_id,
            "status": "PENDING",
            "updated_at": Utc::now(),
        })
        .to_string();

        let parsed = ChangeNotification::parse(CHANNEL_TASK_UPDATED, &payload).unwrap();
        assert_eq!(parsed.task_id(), task_id);

        assert!(ChangeNotification::parse("vacuum_done", &payload).is_err());
    }
}
