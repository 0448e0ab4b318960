//! ERC-191 personal-message signing and secp256k1 signature recovery.
//!
//! This is the one externally observable cryptographic dependency of the
//! wire protocol: both turn proofs and session attestations are ECDSA
//! signatures over the ERC-191 "Ethereum Signed Message" digest of some
//! prior hash, recoverable to a 20-byte address the same way any Ethereum
//! client would recover them.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed private key")]
    BadPrivateKey,
    #[error("malformed signature")]
    BadSignature,
    #[error("signature recovery failed")]
    RecoveryFailed,
}

/// keccak256(message)
pub fn keccak256(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(message);
    hasher.finalize().into()
}

/// The ERC-191 "personal_sign" digest: `keccak256("\x19Ethereum Signed
/// Message:\n" + len(message) + message)`.
pub fn eth_signed_message_digest(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Ethereum-style address derived from a secp256k1 verifying key: the
/// lower 20 bytes of keccak256 of the uncompressed public key (sans the
/// 0x04 prefix byte), hex-encoded with a `0x` prefix, lowercase.
pub fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let encoded = key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// A 65-byte recoverable ECDSA signature: `r || s || v`, where `v` is
/// either `0/1` or the Ethereum-convention `27/28`.
#[derive(Clone, Copy, Debug)]
pub struct RecoverableSignature {
    pub r_s: [u8; 64],
    pub v: u8,
}

impl RecoverableSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 65 {
            return Err(CryptoError::BadSignature);
        }
        let mut r_s = [0u8; 64];
        r_s.copy_from_slice(&bytes[..64]);
        Ok(Self { r_s, v: bytes[64] })
    }

    pub fn to_bytes(self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&self.r_s);
        out[64] = self.v;
        out
    }

    fn recovery_id(self) -> Result<RecoveryId, CryptoError> {
        let normalized = match self.v {
            0 | 1 => self.v,
            27 | 28 => self.v - 27,
            _ => return Err(CryptoError::BadSignature),
        };
        RecoveryId::from_byte(normalized).ok_or(CryptoError::BadSignature)
    }
}

/// A secp256k1 signing key together with the Ethereum-style address it
/// corresponds to.
pub struct Signer {
    key: SigningKey,
    pub address: String,
}

impl Signer {
    /// Load a signer from a 32-byte private key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| CryptoError::BadPrivateKey)?;
        let address = address_from_verifying_key(key.verifying_key());
        Ok(Self { key, address })
    }

    /// Sign the ERC-191 personal-message digest of `message`, returning a
    /// 65-byte recoverable signature.
    pub fn sign_eth_message(&self, message: &[u8]) -> RecoverableSignature {
        let digest = eth_signed_message_digest(message);
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(&digest)
            .expect("signing a 32-byte digest cannot fail");
        let mut r_s = [0u8; 64];
        r_s.copy_from_slice(&sig.to_bytes());
        RecoverableSignature {
            r_s,
            v: recid.to_byte(),
        }
    }
}

/// Recover the Ethereum-style address that produced `signature` over the
/// ERC-191 personal-message digest of `message`.
pub fn recover_eth_message_signer(
    message: &[u8],
    signature: RecoverableSignature,
) -> Result<String, CryptoError> {
    let digest = eth_signed_message_digest(message);
    let sig = Signature::from_slice(&signature.r_s).map_err(|_| CryptoError::BadSignature)?;
    let recid = signature.recovery_id()?;
    let verifying_key = VerifyingKey::recover_from_prehash(&digest, &sig, recid)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Ok(address_from_verifying_key(&verifying_key))
}

/// Constant-time byte comparison, used for comparing recovered/declared
/// signer addresses and other integrity-sensitive byte strings.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod test {
    use super::*;

    fn dev_key() -> Signer {
        // Fixed 32-byte seed; used only in tests.
        Signer::from_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn sign_then_recover_roundtrips() {
        let signer = dev_key();
        let message = b"hello negotiation";
        let sig = signer.sign_eth_message(message);
        let recovered = recover_eth_message_signer(message, sig).unwrap();
        assert_eq!(recovered, signer.address);
    }

    #[test]
    fn tampered_message_recovers_different_signer() {
        let signer = dev_key();
        let sig = signer.sign_eth_message(b"original");
        let recovered = recover_eth_message_signer(b"tampered", sig).unwrap();
        assert_ne!(recovered, signer.address);
    }

    #[test]
    fn address_is_lowercase_hex_with_prefix() {
        let signer = dev_key();
        assert!(signer.address.starts_with("0x"));
        assert_eq!(signer.address.len(), 42);
        assert_eq!(signer.address, signer.address.to_lowercase());
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
