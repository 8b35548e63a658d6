//! Peer wire envelope
//!
//! Every frame between nodes travels as one JSON envelope. Outbound
//! envelopes are signed when a keypair is loaded; the signature covers the
//! serialized envelope with the signature field absent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use lib_crdt::{NodeId, VectorClock};
use lib_crypto::CryptoProvider;

use crate::error::NetworkError;
use crate::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Handshake,
    Heartbeat,
    Sync,
    SyncResponse,
    CrdtOp,
    Data,
    Query,
    PeerDiscovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from_node_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_node_id: Option<NodeId>,
    /// Wall-clock millis at the sender.
    pub timestamp: u64,
    /// UUID, unique per frame.
    pub nonce: String,
    pub data: Value,
    /// Base64 signature over the envelope minus this field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
}

impl PeerEnvelope {
    pub fn new(kind: MessageType, from: NodeId, data: Value) -> Self {
        Self {
            kind,
            from_node_id: from,
            to_node_id: None,
            timestamp: now_millis(),
            nonce: Uuid::new_v4().to_string(),
            data,
            signature: None,
            vector_clock: None,
        }
    }

    pub fn to(mut self, to: NodeId) -> Self {
        self.to_node_id = Some(to);
        self
    }

    pub fn with_vector_clock(mut self, vc: VectorClock) -> Self {
        self.vector_clock = Some(vc);
        self
    }

    /// The bytes a signature covers: this envelope serialized with the
    /// signature field cleared.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn sign(&mut self, provider: &CryptoProvider, signing_key: &[u8]) -> Result<(), NetworkError> {
        let bytes = self.signable_bytes()?;
        let signature = provider.sign(&bytes, signing_key)?;
        self.signature = Some(BASE64.encode(signature));
        Ok(())
    }

    /// Verify against the sender's public key. An unsigned envelope
    /// verifies as false.
    pub fn verify(&self, provider: &CryptoProvider, verify_key: &[u8]) -> Result<bool, NetworkError> {
        let Some(encoded) = &self.signature else {
            return Ok(false);
        };
        // Malformed base64 can never verify
        let Ok(signature) = BASE64.decode(encoded) else {
            return Ok(false);
        };
        let bytes = self.signable_bytes()?;
        Ok(provider.verify(&bytes, &signature, verify_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(c: char) -> NodeId {
        NodeId::normalize(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn wire_form_uses_spec_field_names() {
        let env = PeerEnvelope::new(MessageType::CrdtOp, node('a'), json!({"ops": []})).to(node('b'));
        let wire = serde_json::to_value(&env).unwrap();

        assert_eq!(wire["type"], "CRDT_OP");
        assert!(wire.get("fromNodeId").is_some());
        assert!(wire.get("toNodeId").is_some());
        assert!(wire.get("nonce").is_some());
        // Cleared optionals stay off the wire
        assert!(wire.get("signature").is_none());
        assert!(wire.get("vectorClock").is_none());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let provider = CryptoProvider::classical_fallback();
        let (pk, sk) = provider.signature().generate_keypair().unwrap();

        let mut env = PeerEnvelope::new(MessageType::Data, node('a'), json!({"k": 1}));
        env.sign(&provider, &sk).unwrap();
        assert!(env.verify(&provider, &pk).unwrap());
    }

    #[test]
    fn tampered_envelope_fails_verification() {
        let provider = CryptoProvider::classical_fallback();
        let (pk, sk) = provider.signature().generate_keypair().unwrap();

        let mut env = PeerEnvelope::new(MessageType::Data, node('a'), json!({"k": 1}));
        env.sign(&provider, &sk).unwrap();
        env.data = json!({"k": 2});
        assert!(!env.verify(&provider, &pk).unwrap());
    }

    #[test]
    fn unsigned_envelope_never_verifies() {
        let provider = CryptoProvider::classical_fallback();
        let (pk, _) = provider.signature().generate_keypair().unwrap();
        let env = PeerEnvelope::new(MessageType::Heartbeat, node('a'), json!({}));
        assert!(!env.verify(&provider, &pk).unwrap());
    }

    #[test]
    fn nonces_are_unique_per_envelope() {
        let a = PeerEnvelope::new(MessageType::Heartbeat, node('a'), json!({}));
        let b = PeerEnvelope::new(MessageType::Heartbeat, node('a'), json!({}));
        assert_ne!(a.nonce, b.nonce);
    }
}
