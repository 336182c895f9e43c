//! Peer identity as established by the secure channel.
//!
//! The handshake already verified the remote's certificate chain. This
//! module only decodes the identity out of it; it performs no new
//! cryptographic verification.

use crate::UpgradeError;

use ed25519_dalek::VerifyingKey;
use libp2p::{identity, PeerId};
use webpki_types::CertificateDer;

/// A remote peer's public key.
pub type PublicKey = VerifyingKey;

/// DER header of an Ed25519 SubjectPublicKeyInfo (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, // SEQUENCE, 42 bytes
    0x30, 0x05, // SEQUENCE, 5 bytes
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112
    0x03, 0x21, 0x00, // BIT STRING, 33 bytes, no unused bits
];
const ED25519_SPKI_LEN: usize = ED25519_SPKI_PREFIX.len() + 32;

/// Derive the identity of the holder of `key`.
pub fn peer_id_from_public_key(key: &PublicKey) -> Result<PeerId, UpgradeError> {
    let key = identity::ed25519::PublicKey::try_from_bytes(key.as_bytes())
        .map_err(|e| UpgradeError::Certificate(format!("invalid Ed25519 key: {e}")))?;
    Ok(identity::PublicKey::from(key).to_peer_id())
}

/// Extract the remote public key from an already-verified certificate chain.
///
/// ToM peers authenticate with raw public keys (RFC 7250), so the chain is a
/// single Ed25519 SubjectPublicKeyInfo.
pub fn public_key_from_cert_chain(chain: &[CertificateDer<'_>]) -> Result<PublicKey, UpgradeError> {
    let spki = match chain {
        [] => return Err(UpgradeError::Certificate("empty certificate chain".into())),
        [only] => only.as_ref(),
        _ => {
            return Err(UpgradeError::Certificate(format!(
                "expected a single raw public key, got {} certificates",
                chain.len()
            )))
        }
    };

    if spki.len() != ED25519_SPKI_LEN || !spki.starts_with(&ED25519_SPKI_PREFIX) {
        return Err(UpgradeError::Certificate(
            "not an Ed25519 SubjectPublicKeyInfo".into(),
        ));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&spki[ED25519_SPKI_PREFIX.len()..]);
    VerifyingKey::from_bytes(&key)
        .map_err(|e| UpgradeError::Certificate(format!("invalid Ed25519 key: {e}")))
}

/// Encode `key` as the single-entry chain a raw-public-key handshake presents.
pub fn cert_chain_for(key: &PublicKey) -> Vec<CertificateDer<'static>> {
    let mut spki = Vec::with_capacity(ED25519_SPKI_LEN);
    spki.extend_from_slice(&ED25519_SPKI_PREFIX);
    spki.extend_from_slice(key.as_bytes());
    vec![CertificateDer::from(spki)]
}
