//! Node identity: ed25519 keys and self-certifying agent identifiers
//!
//! An [`AgentId`] is the lowercase hex encoding of the first 20 bytes of the
//! SHA-256 digest of an agent's ed25519 public key. Anyone holding the public
//! key can check the id, so records and withdrawals are verifiable without a
//! central directory.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Number of digest bytes kept in an agent id
const AGENT_ID_BYTES: usize = 20;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid agent id '{0}': expected 40 lowercase hex characters")]
    InvalidAgentId(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("Signature verification failed for agent {0}")]
    BadSignature(AgentId),
    #[error("Agent id {claimed} does not match its public key (derived {derived})")]
    IdMismatch { claimed: AgentId, derived: AgentId },
    #[error("Key file error: {0}")]
    KeyFile(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Self-certifying agent identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Derive the id for a public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(hex::encode(&digest[..AGENT_ID_BYTES]))
    }

    /// Parse an id string, checking its shape
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let valid = raw.len() == AGENT_ID_BYTES * 2
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(IdentityError::InvalidAgentId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AgentId::parse(&value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// Decode a hex public key
pub fn decode_public_key(hex_key: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = hex::decode(hex_key).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidPublicKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
}

/// Check that `claimed` is the id of `public_key_hex` and that `signature_hex`
/// signs `message` under that key.
pub fn verify_signed(
    claimed: &AgentId,
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), IdentityError> {
    let key = decode_public_key(public_key_hex)?;
    let derived = AgentId::from_public_key(&key);
    if &derived != claimed {
        return Err(IdentityError::IdMismatch {
            claimed: claimed.clone(),
            derived,
        });
    }

    let sig_bytes =
        hex::decode(signature_hex).map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature("expected 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    key.verify(message, &signature)
        .map_err(|_| IdentityError::BadSignature(claimed.clone()))
}

/// A node's signing identity
pub struct NodeIdentity {
    signing_key: SigningKey,
    agent_id: AgentId,
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("agent_id", &self.agent_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl NodeIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic identity from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let agent_id = AgentId::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            agent_id,
        }
    }

    /// Load the hex-encoded secret key at `path`, or generate one and write it
    /// there (owner-only permissions on unix).
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let bytes = hex::decode(raw.trim())
                .map_err(|e| IdentityError::KeyFile(format!("invalid hex: {e}")))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| IdentityError::KeyFile("expected a 32-byte secret key".to_string()))?;
            let identity = Self::from_seed(&seed);
            info!(agent_id = %identity.agent_id, path = %path.display(), "Loaded node key");
            return Ok(identity);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, hex::encode(identity.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        info!(agent_id = %identity.agent_id, path = %path.display(), "Generated new node key");
        Ok(identity)
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign a message, returning the hex signature
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_agent_id_is_derived_from_key() {
        let a = NodeIdentity::from_seed(&[1u8; 32]);
        let b = NodeIdentity::from_seed(&[1u8; 32]);
        let c = NodeIdentity::from_seed(&[2u8; 32]);

        assert_eq!(a.agent_id(), b.agent_id());
        assert_ne!(a.agent_id(), c.agent_id());
        assert_eq!(a.agent_id().as_str().len(), 40);
        assert!(AgentId::parse(a.agent_id().as_str()).is_ok());
    }

    #[test]
    fn test_agent_id_parse_rejects_bad_shapes() {
        assert!(AgentId::parse("").is_err());
        assert!(AgentId::parse("xyz").is_err());
        assert!(AgentId::parse(&"A".repeat(40)).is_err());
        assert!(AgentId::parse(&"0".repeat(41)).is_err());
        assert!(AgentId::parse(&"0f".repeat(20)).is_ok());
    }

    #[test]
    fn test_agent_id_serde_validates() {
        let ok: Result<AgentId, _> = serde_json::from_str(&format!("\"{}\"", "ab".repeat(20)));
        assert!(ok.is_ok());
        let bad: Result<AgentId, _> = serde_json::from_str("\"not-an-id\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = NodeIdentity::from_seed(&[7u8; 32]);
        let message = b"hello elmnet";
        let signature = identity.sign(message);

        assert!(verify_signed(
            identity.agent_id(),
            &identity.public_key_hex(),
            message,
            &signature
        )
        .is_ok());

        let tampered = verify_signed(
            identity.agent_id(),
            &identity.public_key_hex(),
            b"hello elmnet!",
            &signature,
        );
        assert!(matches!(tampered, Err(IdentityError::BadSignature(_))));
    }

    #[test]
    fn test_verify_rejects_foreign_key() {
        let owner = NodeIdentity::from_seed(&[3u8; 32]);
        let impostor = NodeIdentity::from_seed(&[4u8; 32]);
        let signature = impostor.sign(b"msg");

        let result = verify_signed(
            owner.agent_id(),
            &impostor.public_key_hex(),
            b"msg",
            &signature,
        );
        assert!(matches!(result, Err(IdentityError::IdMismatch { .. })));
    }

    #[test]
    fn test_load_or_generate_persists_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = NodeIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = NodeIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.agent_id(), second.agent_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_rejects_corrupt_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(matches!(
            NodeIdentity::load_or_generate(&path),
            Err(IdentityError::KeyFile(_))
        ));
    }
}
