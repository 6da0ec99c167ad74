use chrono::{DateTime, Utc};
use hive_core::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CommError;

/// Whether a message expects, or is, an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Fire-and-forget.
    Event,
    /// The receiver answers with a [`MessageKind::Reply`] carrying the same
    /// correlation id.
    Request,
    Reply,
}

/// Wire-format message envelope for inter-component communication.
///
/// Payloads are serialized with MessagePack. The `correlation_id` pairs a
/// reply with its request and doubles as a trace id in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Operation name, e.g. `task-finished`; used for logging only.
    pub op: String,

    pub kind: MessageKind,

    /// Endpoint that produced the message.
    pub sender: Address,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create an event message, serializing the payload with MessagePack.
    pub fn new<T: Serialize + ?Sized>(
        op: impl Into<String>,
        sender: &Address,
        payload: &T,
    ) -> Result<Self, CommError> {
        Self::build(op, MessageKind::Event, sender, payload, Uuid::new_v4())
    }

    /// Create a request with a fresh correlation id.
    pub fn request<T: Serialize + ?Sized>(
        op: impl Into<String>,
        sender: &Address,
        payload: &T,
    ) -> Result<Self, CommError> {
        Self::build(op, MessageKind::Request, sender, payload, Uuid::new_v4())
    }

    /// Create the reply to a request, reusing its correlation id.
    pub fn reply<T: Serialize + ?Sized>(
        correlation_id: Uuid,
        sender: &Address,
        payload: &T,
    ) -> Result<Self, CommError> {
        Self::build("reply", MessageKind::Reply, sender, payload, correlation_id)
    }

    fn build<T: Serialize + ?Sized>(
        op: impl Into<String>,
        kind: MessageKind,
        sender: &Address,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, CommError> {
        Ok(Self {
            op: op.into(),
            kind,
            sender: sender.clone(),
            payload: rmp_serde::to_vec_named(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            version: 1,
        })
    }

    /// Build a reply on the blocking pool when the payload is large.
    ///
    /// Encoding a multi-megabyte value would otherwise stall the calling
    /// control loop.
    pub async fn reply_offloaded<T>(
        correlation_id: Uuid,
        sender: &Address,
        payload: T,
        size_hint: usize,
        threshold: usize,
    ) -> Result<Self, CommError>
    where
        T: Serialize + Send + 'static,
    {
        if size_hint <= threshold {
            return Self::reply(correlation_id, sender, &payload);
        }
        let sender = sender.clone();
        tokio::task::spawn_blocking(move || Self::reply(correlation_id, &sender, &payload))
            .await
            .map_err(|e| CommError::Offload(e.to_string()))?
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CommError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn is_reply(&self) -> bool {
        self.kind == MessageKind::Reply
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hive_core::protocol::{DataResponse, ToScheduler};
    use hive_core::{TaskError, TaskKey};

    use super::*;

    fn me() -> Address {
        Address::inproc("test")
    }

    #[test]
    fn protocol_enum_survives_messagepack() {
        let payload = ToScheduler::TaskErred {
            key: TaskKey::new("div-1"),
            error: TaskError::new("ZeroDivisionError", "one").with_traceback("line 3"),
            stimulus_id: "s-1".into(),
        };
        let msg = Message::new(payload.op(), &me(), &payload).unwrap();
        assert_eq!(msg.op, "task-erred");
        assert_eq!(msg.decode::<ToScheduler>().unwrap(), payload);
    }

    #[test]
    fn json_values_survive_messagepack() {
        let mut data = BTreeMap::new();
        data.insert(TaskKey::new("a"), serde_json::json!({"x": [1, -2, 3.5], "y": null}));
        data.insert(TaskKey::new("b"), serde_json::json!("text"));
        let resp = DataResponse {
            data,
            missing: vec![TaskKey::new("c")],
        };
        let msg = Message::reply(Uuid::new_v4(), &me(), &resp).unwrap();
        assert!(msg.is_reply());
        assert_eq!(msg.decode::<DataResponse>().unwrap(), resp);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offloaded_reply_matches_inline() {
        let id = Uuid::new_v4();
        let payload = vec![7u32; 1024];
        let inline = Message::reply(id, &me(), &payload).unwrap();
        let offloaded = Message::reply_offloaded(id, &me(), payload.clone(), 4096, 1)
            .await
            .unwrap();
        assert_eq!(inline.payload, offloaded.payload);
        assert_eq!(offloaded.correlation_id, id);
    }
}
