//! Replicated operations
//!
//! The unit of replication. An operation's `hash` is SHA-256 over the
//! canonical JSON form (fixed key order, `hash` itself excluded), which is
//! what lets a replica reject tampered entries during merge.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use lib_crypto::hashing::hash_sha256_hex;

use crate::clock::VectorClock;
use crate::identity::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Set,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub node_id: NodeId,
    pub timestamp: u64,
    pub lamport_clock: u64,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub vector_clock: VectorClock,
    pub hash: String,
}

impl Operation {
    /// Compose and hash a new operation.
    pub fn new(
        node_id: NodeId,
        timestamp: u64,
        lamport_clock: u64,
        kind: OpKind,
        key: String,
        value: Option<Value>,
        vector_clock: VectorClock,
    ) -> Self {
        let mut op = Self {
            node_id,
            timestamp,
            lamport_clock,
            kind,
            key,
            value,
            vector_clock,
            hash: String::new(),
        };
        op.hash = op.compute_hash();
        op
    }

    /// Canonical JSON form: keys in the fixed order
    /// `nodeId, timestamp, lamportClock, type, key, value, vectorClock`,
    /// with `value` omitted when absent. UTF-8 of this string is what gets
    /// hashed.
    pub fn canonical_json(&self) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("nodeId".into(), json!(self.node_id));
        obj.insert("timestamp".into(), json!(self.timestamp));
        obj.insert("lamportClock".into(), json!(self.lamport_clock));
        obj.insert("type".into(), json!(self.kind));
        obj.insert("key".into(), json!(self.key));
        if let Some(value) = &self.value {
            obj.insert("value".into(), value.clone());
        }
        obj.insert("vectorClock".into(), json!(self.vector_clock));
        Value::Object(obj).to_string()
    }

    pub fn compute_hash(&self) -> String {
        hash_sha256_hex(self.canonical_json().as_bytes())
    }

    /// Whether the stored hash matches the canonical form.
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// The originator's Lamport component, used by the conflict tie-break.
    pub fn writer_lamport(&self) -> u64 {
        self.lamport_clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(c: char) -> NodeId {
        NodeId::normalize(&c.to_string().repeat(64)).unwrap()
    }

    fn sample_op() -> Operation {
        let mut vc = VectorClock::new();
        vc.set(node('a'), 1);
        Operation::new(
            node('a'),
            1_700_000_000_000,
            1,
            OpKind::Set,
            "doc/title".into(),
            Some(json!("hello")),
            vc,
        )
    }

    #[test]
    fn canonical_form_has_fixed_key_order() {
        let op = sample_op();
        let canonical = op.canonical_json();
        let node_pos = canonical.find("nodeId").unwrap();
        let ts_pos = canonical.find("timestamp").unwrap();
        let lamport_pos = canonical.find("lamportClock").unwrap();
        let type_pos = canonical.find("\"type\"").unwrap();
        let key_pos = canonical.find("\"key\"").unwrap();
        let value_pos = canonical.find("\"value\"").unwrap();
        let vc_pos = canonical.find("vectorClock").unwrap();
        assert!(node_pos < ts_pos && ts_pos < lamport_pos && lamport_pos < type_pos);
        assert!(type_pos < key_pos && key_pos < value_pos && value_pos < vc_pos);
    }

    #[test]
    fn hash_is_stable_and_verifies() {
        let op = sample_op();
        assert!(op.verify_hash());
        assert_eq!(op.hash, op.compute_hash());
    }

    #[test]
    fn tampered_value_fails_verification() {
        let mut op = sample_op();
        op.value = Some(json!("evil"));
        assert!(!op.verify_hash());
    }

    #[test]
    fn delete_omits_value_from_canonical_form() {
        let mut vc = VectorClock::new();
        vc.set(node('a'), 2);
        let op = Operation::new(
            node('a'),
            1_700_000_000_001,
            2,
            OpKind::Delete,
            "doc/title".into(),
            None,
            vc,
        );
        assert!(!op.canonical_json().contains("\"value\""));
        assert!(op.verify_hash());
    }

    #[test]
    fn wire_roundtrip_preserves_hash() {
        let op = sample_op();
        let encoded = serde_json::to_string(&op).unwrap();
        let decoded: Operation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, op);
        assert!(decoded.verify_hash());
    }
}
