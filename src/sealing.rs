//! Scoped sealed-input envelope encryption (§4.B).
//!
//! Every payload is sealed under a key derived from the process-level
//! master key and the (sessionId, agentId) pair it belongs to — a leaked
//! scoped key only ever exposes one agent's context in one session.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Env;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("missing_sealing_key")]
    MissingSealingKey,
    #[error("malformed sealing key material")]
    BadKeyMaterial,
    #[error("seal operation failed")]
    SealFailed,
    #[error("unseal operation failed: ciphertext or tag invalid")]
    UnsealFailed,
    #[error("stored envelope is malformed")]
    MalformedEnvelope,
}

/// A sealed envelope as persisted: every field is base64 (iv/tag/ciphertext)
/// or plain hex (keyId).
#[derive(Clone, Debug)]
pub struct Envelope {
    pub key_id: String,
    pub iv: String,
    pub auth_tag: String,
    pub cipher_text: String,
}

const DEV_MASTER_KEY_SEED: &str = "molt-negotiation-server:development-master-key";

/// Parse operator-supplied master key material into raw 32 bytes, or fall
/// back (outside production) to a fixed, clearly-labeled development key.
fn resolve_master_key(raw: &Option<String>, env: Env) -> Result<[u8; 32], SealError> {
    match raw {
        Some(s) => parse_master_key(s),
        None if env.is_production() => Err(SealError::MissingSealingKey),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(DEV_MASTER_KEY_SEED.as_bytes());
            Ok(hasher.finalize().into())
        }
    }
}

fn parse_master_key(raw: &str) -> Result<[u8; 32], SealError> {
    let bytes = if let Some(hex_part) = raw.strip_prefix("hex:") {
        hex::decode(hex_part).map_err(|_| SealError::BadKeyMaterial)?
    } else if let Some(b64_part) = raw.strip_prefix("base64:") {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64_part)
            .map_err(|_| SealError::BadKeyMaterial)?
    } else if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|_| SealError::BadKeyMaterial)?
    } else {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw)
            .map_err(|_| SealError::BadKeyMaterial)?
    };
    if bytes.len() != 32 {
        return Err(SealError::BadKeyMaterial);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn derive_scoped_key(master: &[u8; 32], session_id: &str, agent_id: &str) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(master).expect("hmac accepts any key length");
    mac.update(b"sealed:");
    mac.update(session_id.as_bytes());
    mac.update(b":");
    mac.update(agent_id.as_bytes());
    mac.finalize().into_bytes().into()
}

fn derive_key_id(scoped_key: &[u8; 32], session_id: &str, agent_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scoped_key);
    hasher.update(session_id.as_bytes());
    hasher.update(agent_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..24].to_string()
}

/// Seal `plaintext_json` (already-serialized JSON bytes) for `(session_id,
/// agent_id)` under the configured master key.
pub fn seal(
    master_key: &Option<String>,
    env: Env,
    session_id: &str,
    agent_id: &str,
    plaintext_json: &[u8],
) -> Result<Envelope, SealError> {
    let master = resolve_master_key(master_key, env)?;
    let scoped = derive_scoped_key(&master, session_id, agent_id);
    let key_id = derive_key_id(&scoped, session_id, agent_id);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&scoped));
    let mut iv_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext_json)
        .map_err(|_| SealError::SealFailed)?;
    // AES-GCM output is ciphertext || 16-byte tag; split so the two are
    // stored the way the spec shape describes them.
    let tag_start = sealed.len().saturating_sub(16);
    let (cipher_bytes, tag_bytes) = sealed.split_at(tag_start);

    Ok(Envelope {
        key_id,
        iv: b64(&iv_bytes),
        auth_tag: b64(tag_bytes),
        cipher_text: b64(cipher_bytes),
    })
}

/// Unseal a previously sealed envelope back to plaintext JSON bytes.
pub fn unseal(
    master_key: &Option<String>,
    env: Env,
    session_id: &str,
    agent_id: &str,
    envelope: &Envelope,
) -> Result<Vec<u8>, SealError> {
    let master = resolve_master_key(master_key, env)?;
    let scoped = derive_scoped_key(&master, session_id, agent_id);

    let iv = unb64(&envelope.iv)?;
    let tag = unb64(&envelope.auth_tag)?;
    let ct = unb64(&envelope.cipher_text)?;
    if iv.len() != 12 {
        return Err(SealError::MalformedEnvelope);
    }

    let mut combined = Vec::with_capacity(ct.len() + tag.len());
    combined.extend_from_slice(&ct);
    combined.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&scoped));
    let nonce = Nonce::from_slice(&iv);
    cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| SealError::UnsealFailed)
}

fn b64(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

fn unb64(s: &str) -> Result<Vec<u8>, SealError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
        .map_err(|_| SealError::MalformedEnvelope)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seal_then_unseal_roundtrips() {
        let key = Some("a".repeat(64));
        let plaintext = br#"{"role":"buyer","reservation":120}"#;
        let env = seal(&key, Env::Development, "sess-1", "agent-a", plaintext).unwrap();
        let out = unseal(&key, Env::Development, "sess-1", "agent-a", &env).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn wrong_scope_fails_to_unseal() {
        let key = Some("a".repeat(64));
        let plaintext = b"secret";
        let env = seal(&key, Env::Development, "sess-1", "agent-a", plaintext).unwrap();
        let result = unseal(&key, Env::Development, "sess-1", "agent-b", &env);
        assert!(result.is_err());
    }

    #[test]
    fn missing_key_in_production_fails() {
        let result = seal(&None, Env::Production, "sess-1", "agent-a", b"x");
        assert!(matches!(result, Err(SealError::MissingSealingKey)));
    }

    #[test]
    fn missing_key_in_development_uses_fallback_and_roundtrips() {
        let plaintext = b"hello";
        let env = seal(&None, Env::Development, "sess-1", "agent-a", plaintext).unwrap();
        let out = unseal(&None, Env::Development, "sess-1", "agent-a", &env).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn key_id_is_24_hex_chars() {
        let key = Some("a".repeat(64));
        let env = seal(&key, Env::Development, "sess-1", "agent-a", b"x").unwrap();
        assert_eq!(env.key_id.len(), 24);
        assert!(env.key_id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn hex_prefixed_and_base64_prefixed_keys_parse() {
        let raw_hex = "b".repeat(64);
        let hex_key = Some(format!("hex:{raw_hex}"));
        let bytes = hex::decode(&raw_hex).unwrap();
        let b64_key = Some(format!(
            "base64:{}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes)
        ));
        let e1 = seal(&hex_key, Env::Development, "s", "a", b"x").unwrap();
        let e2 = seal(&b64_key, Env::Development, "s", "a", b"x").unwrap();
        assert_eq!(e1.key_id, e2.key_id);
    }
}
