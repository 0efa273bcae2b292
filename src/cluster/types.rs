//! Raft type configuration and the replicated command envelope.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the Raft cluster.
pub type NodeId = u64;

/// The openraft `Raft` instance parameterized with our [`TypeConfig`].
pub type Raft = openraft::Raft<TypeConfig>;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
);

/// Operation tag for an insert command.
pub const OP_INSERT: &str = "insert";
/// Operation tag for a remove command.
pub const OP_REMOVE: &str = "remove";

/// The envelope every write travels in through the replicated log.
///
/// `payload` is the client's HTTP request body carried verbatim: the leader
/// validates but does not re-encode it, and each replica's state machine
/// re-parses it at apply time. `op` is self-describing; a tag no replica
/// recognizes means the cluster is running mixed protocol versions and is
/// handled as fatal at apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub op: String,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn insert(payload: Vec<u8>) -> Self {
        Self {
            op: OP_INSERT.to_string(),
            payload,
        }
    }

    pub fn remove(payload: Vec<u8>) -> Self {
        Self {
            op: OP_REMOVE.to_string(),
            payload,
        }
    }
}

/// Result of applying a [`Command`] to the state machine.
///
/// `id` carries the assigned vector id back to the leader's insert handler;
/// removes return `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: Option<u64>,
}

impl CommandResponse {
    pub fn inserted(id: u64) -> Self {
        Self { id: Some(id) }
    }

    pub fn empty() -> Self {
        Self { id: None }
    }
}

/// Payload shape of an insert command (and of `POST /insert`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertPayload {
    pub vector: Vec<f64>,
}

/// Payload shape of a remove command (and of `POST /remove`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovePayload {
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip_preserves_payload_bytes() {
        let body = br#"{"vector":[1.0,0.5]}"#.to_vec();
        let cmd = Command::insert(body.clone());
        let wire = serde_json::to_vec(&cmd).unwrap();
        let back: Command = serde_json::from_slice(&wire).unwrap();
        assert_eq!(back.op, OP_INSERT);
        assert_eq!(back.payload, body);
    }

    #[test]
    fn test_insert_payload_parses_from_envelope() {
        let cmd = Command::insert(br#"{"vector":[1.0,2.0,3.0]}"#.to_vec());
        let payload: InsertPayload = serde_json::from_slice(&cmd.payload).unwrap();
        assert_eq!(payload.vector, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_remove_payload_rejects_garbage() {
        let cmd = Command::remove(b"not json".to_vec());
        assert!(serde_json::from_slice::<RemovePayload>(&cmd.payload).is_err());
    }

    #[test]
    fn test_op_tag_survives_unknown_values() {
        // The codec itself accepts any tag; recognition happens at apply.
        let raw = br#"{"op":"compact","payload":[]}"#;
        let cmd: Command = serde_json::from_slice(raw).unwrap();
        assert_eq!(cmd.op, "compact");
    }
}
