//! Cryptographic provenance for the config audit trail
//!
//! Every audit record gets:
//! - SHA-256 content hash
//! - Ed25519 signature
//! - Chain link to the previous record for the same config
//!
//! Editing or deleting a stored record breaks the chain and is reported by
//! `verify_audit_chain`.

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::types::{AuditRecord, FieldChange};

/// Hash content with SHA-256, hex encoded
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Provenance manager for cryptographic operations
pub struct Provenance {
    signing_key: SigningKey,
}

impl Provenance {
    /// Create or load provenance keys
    pub fn init(key_path: &Path) -> Result<Self> {
        let signing_key = if key_path.exists() {
            Self::load_key(key_path)?
        } else {
            let key = Self::generate_key();
            Self::save_key(&key, key_path)?;
            key
        };

        Ok(Self { signing_key })
    }

    /// Throwaway key, for tests and embedded use without a data dir
    pub fn ephemeral() -> Self {
        Self {
            signing_key: Self::generate_key(),
        }
    }

    fn generate_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn load_key(path: &Path) -> Result<SigningKey> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read key from {:?}", path))?;

        if bytes.len() != 32 {
            anyhow::bail!("Invalid key length: expected 32 bytes, got {}", bytes.len());
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);

        Ok(SigningKey::from_bytes(&key_bytes))
    }

    fn save_key(key: &SigningKey, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, key.to_bytes())
            .with_context(|| format!("Failed to write key to {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn sign(&self, content: &[u8]) -> String {
        hex::encode(self.signing_key.sign(content).to_bytes())
    }

    /// Verify a signature against an arbitrary public key
    pub fn verify(content: &[u8], signature_hex: &str, pubkey_hex: &str) -> Result<bool> {
        let sig_bytes = hex::decode(signature_hex).context("Invalid signature hex")?;
        let pubkey_bytes = hex::decode(pubkey_hex).context("Invalid public key hex")?;

        if sig_bytes.len() != 64 {
            anyhow::bail!("Invalid signature length");
        }
        if pubkey_bytes.len() != 32 {
            anyhow::bail!("Invalid public key length");
        }

        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(&sig_bytes);
        let signature = Signature::from_bytes(&sig_arr);

        let mut pubkey_arr = [0u8; 32];
        pubkey_arr.copy_from_slice(&pubkey_bytes);
        let verifying_key = VerifyingKey::from_bytes(&pubkey_arr).context("Invalid public key")?;

        Ok(verifying_key.verify(content, &signature).is_ok())
    }

    /// Fill in hash, signature and signer of a record whose `previous_hash` is set
    pub fn seal(&self, record: &mut AuditRecord) {
        let content = audit_content(record);
        record.content_hash = content_hash(&content);
        record.signature = self.sign(&content);
        record.agent_pubkey = self.public_key_hex();
    }
}

/// The signed portion of an audit record
#[derive(Serialize)]
struct AuditContent<'a> {
    config_id: &'a str,
    user_id: &'a str,
    action: &'a str,
    previous_version: Option<u32>,
    new_version: u32,
    diff: &'a [FieldChange],
    reason: Option<&'a str>,
    created_at: String,
    previous_hash: Option<&'a str>,
}

pub fn audit_content(record: &AuditRecord) -> Vec<u8> {
    let content = AuditContent {
        config_id: &record.config_id,
        user_id: &record.user_id,
        action: record.action.as_str(),
        previous_version: record.previous_version,
        new_version: record.new_version,
        diff: &record.diff,
        reason: record.reason.as_deref(),
        created_at: record.created_at.to_rfc3339(),
        previous_hash: record.previous_hash.as_deref(),
    };
    // Serializing plain structs and serde_json::Value cannot fail
    serde_json::to_vec(&content).unwrap_or_default()
}

/// Result of chain verification
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub errors: Vec<String>,
    pub chain_length: usize,
}

/// Verify an audit chain (oldest first)
pub fn verify_audit_chain(chain: &[AuditRecord]) -> ChainVerification {
    let mut errors = Vec::new();
    let mut prev_hash: Option<&str> = None;

    for (i, record) in chain.iter().enumerate() {
        if record.previous_hash.as_deref() != prev_hash {
            errors.push(format!(
                "Chain break at position {}: expected prev_hash {:?}, got {:?}",
                i, prev_hash, record.previous_hash
            ));
        }

        let content = audit_content(record);
        let computed_hash = content_hash(&content);
        if computed_hash != record.content_hash {
            errors.push(format!(
                "Hash mismatch at position {}: computed {}, stored {}",
                i, computed_hash, record.content_hash
            ));
        }

        match Provenance::verify(&content, &record.signature, &record.agent_pubkey) {
            Ok(true) => {}
            Ok(false) => errors.push(format!("Invalid signature at position {}", i)),
            Err(e) => errors.push(format!(
                "Signature verification error at position {}: {}",
                i, e
            )),
        }

        prev_hash = Some(&record.content_hash);
    }

    ChainVerification {
        valid: errors.is_empty(),
        errors,
        chain_length: chain.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuditAction;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(prov: &Provenance, previous_hash: Option<String>, new_version: u32) -> AuditRecord {
        let mut rec = AuditRecord {
            seq: new_version as i64,
            config_id: "cfg-1".into(),
            user_id: "alice".into(),
            action: if new_version == 1 {
                AuditAction::Create
            } else {
                AuditAction::Update
            },
            previous_version: new_version.checked_sub(1).filter(|v| *v > 0),
            new_version,
            diff: vec![FieldChange {
                field: "enabled".into(),
                before: serde_json::Value::Null,
                after: serde_json::Value::Bool(true),
            }],
            reason: None,
            created_at: Utc::now(),
            content_hash: String::new(),
            previous_hash,
            signature: String::new(),
            agent_pubkey: String::new(),
        };
        prov.seal(&mut rec);
        rec
    }

    #[test]
    fn test_key_persistence() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("persist.key");

        let prov1 = Provenance::init(&key_path).unwrap();
        let prov2 = Provenance::init(&key_path).unwrap();

        assert_eq!(prov1.public_key_hex(), prov2.public_key_hex());
    }

    #[test]
    fn test_hash_deterministic_known_value() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let prov = Provenance::ephemeral();
        let sig = prov.sign(b"content");
        assert!(Provenance::verify(b"content", &sig, &prov.public_key_hex()).unwrap());
        assert!(!Provenance::verify(b"tampered", &sig, &prov.public_key_hex()).unwrap());
        assert!(Provenance::verify(b"content", "not-hex!", &prov.public_key_hex()).is_err());
    }

    #[test]
    fn test_verify_chain_valid() {
        let prov = Provenance::ephemeral();
        let first = record(&prov, None, 1);
        let second = record(&prov, Some(first.content_hash.clone()), 2);

        let result = verify_audit_chain(&[first, second]);
        assert!(result.valid, "Chain should be valid: {:?}", result.errors);
        assert_eq!(result.chain_length, 2);
    }

    #[test]
    fn test_verify_chain_detects_tampering() {
        let prov = Provenance::ephemeral();
        let first = record(&prov, None, 1);
        let mut second = record(&prov, Some(first.content_hash.clone()), 2);
        second.user_id = "mallory".into();

        let result = verify_audit_chain(&[first, second]);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("Hash mismatch")));
    }

    #[test]
    fn test_verify_chain_detects_missing_link() {
        let prov = Provenance::ephemeral();
        let first = record(&prov, None, 1);
        let second = record(&prov, Some(first.content_hash.clone()), 2);
        let third = record(&prov, Some(second.content_hash.clone()), 3);

        // Dropping the middle record breaks the chain
        let result = verify_audit_chain(&[first, third]);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("Chain break")));
    }

    #[test]
    fn test_verify_chain_empty() {
        let result = verify_audit_chain(&[]);
        assert!(result.valid);
        assert_eq!(result.chain_length, 0);
    }
}
