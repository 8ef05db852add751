//! Task envelope wire format.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when an envelope cannot be encoded or decoded.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("payload serialization error: {0}")]
    Payload(#[source] serde_json::Error),
}

/// The serialized unit of work placed on the broker.
///
/// On the wire this is `{"type": "...", "payload": ..., "executeCount": n}`,
/// where `executeCount` is omitted until the first retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(
        rename = "executeCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub execute_count: Option<u32>,
}

impl TaskEnvelope {
    /// Wrap a typed payload for its first publish.
    pub fn new<T: Serialize>(task_type: &str, payload: &T) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(payload).map_err(EnvelopeError::Payload)?;
        Ok(Self {
            task_type: task_type.to_string(),
            payload,
            execute_count: None,
        })
    }

    /// Number of retries this envelope has already been through.
    pub fn attempts(&self) -> u32 {
        self.execute_count.unwrap_or(0)
    }

    /// Copy of this envelope with the retry counter incremented.
    pub fn next_attempt(&self) -> Self {
        Self {
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            execute_count: Some(self.attempts().saturating_add(1)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_publish_omits_execute_count() {
        let envelope = TaskEnvelope::new("crawl", &json!({"project": 7})).unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(wire, json!({"type": "crawl", "payload": {"project": 7}}));
    }

    #[test]
    fn test_next_attempt_increments_counter() {
        let envelope = TaskEnvelope::new("crawl", &json!(1)).unwrap();
        assert_eq!(envelope.attempts(), 0);

        let retried = envelope.next_attempt().next_attempt();
        assert_eq!(retried.execute_count, Some(2));
        assert_eq!(retried.payload, envelope.payload);

        let wire: serde_json::Value = serde_json::from_slice(&retried.encode().unwrap()).unwrap();
        assert_eq!(wire["executeCount"], 2);
    }

    #[test]
    fn test_decode_accepts_missing_payload() {
        let envelope = TaskEnvelope::decode(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.task_type, "ping");
        assert!(envelope.payload.is_null());
        assert_eq!(envelope.execute_count, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            TaskEnvelope::decode(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            TaskEnvelope::decode(br#"{"payload": 1}"#),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
