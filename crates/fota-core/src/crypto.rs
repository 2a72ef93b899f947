//! Session key material and crypto primitives for secure transfers.
//!
//! Curve is NIST P-256. Public keys travel as 64 raw bytes (X ‖ Y) without
//! the SEC1 tag byte; signatures as 64 raw bytes (r ‖ s).

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Raw public key length (X ‖ Y).
pub const PUBLIC_KEY_LEN: usize = 64;
/// Private scalar length.
pub const SECRET_KEY_LEN: usize = 32;
/// Raw signature length (r ‖ s).
pub const SIGNATURE_LEN: usize = 64;
/// Coordinate length used to normalize shared secrets.
pub const COORDINATE_LEN: usize = 32;
/// Keystream key length.
pub const XOR_KEY_LEN: usize = 32;

/// Root private key used to authenticate session keys.
pub const ROOT_SK: [u8; SECRET_KEY_LEN] = [
    0x5c, 0x77, 0x17, 0x11, 0x67, 0xd6, 0x40, 0xa3, 0x36, 0x0d, 0xe2, 0x69, 0xfe, 0x0b, 0xb7, 0x8f,
    0x5e, 0x94, 0xd8, 0xf2, 0xf4, 0x80, 0x94, 0x0a, 0xc2, 0xf2, 0x6e, 0x43, 0xbb, 0x69, 0x5f, 0xa7,
];

/// Public half of [`ROOT_SK`].
pub const ROOT_PK: [u8; PUBLIC_KEY_LEN] = [
    0x14, 0x1b, 0x0b, 0x28, 0x46, 0xc4, 0xaf, 0x97, 0x41, 0x59, 0x97, 0x4f, 0x17, 0x52, 0xe0, 0x1c,
    0x9a, 0xea, 0x21, 0xc7, 0xc6, 0xe3, 0x04, 0x30, 0x4f, 0x8d, 0x9c, 0xf0, 0x7f, 0x1d, 0x1f, 0x0a,
    0x83, 0xaf, 0x76, 0xe0, 0x4d, 0xc1, 0xcc, 0x96, 0xb4, 0xb8, 0x3f, 0xbb, 0x73, 0x6c, 0x66, 0x3f,
    0x0b, 0xdf, 0x52, 0x86, 0xbf, 0x60, 0xe8, 0x91, 0x27, 0x00, 0x85, 0xc8, 0xbf, 0x55, 0xa8, 0x96,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Public key must be 64 bytes, got {0}")]
    PublicKeyLength(usize),
    #[error("Public key is not a point on P-256")]
    InvalidPublicKey,
    #[error("Invalid private key")]
    InvalidSecretKey,
    #[error("Malformed signature")]
    InvalidSignature,
    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Per-session key material. Created fresh for every session, never shared.
pub struct SessionKeys {
    session_sk: [u8; SECRET_KEY_LEN],
    session_pk: [u8; PUBLIC_KEY_LEN],
    pub peer_pk: Option<[u8; PUBLIC_KEY_LEN]>,
    pub shared_secret: Option<[u8; COORDINATE_LEN]>,
    pub xor_key: Option<[u8; XOR_KEY_LEN]>,
    pub is_secure: bool,
}

impl SessionKeys {
    /// Generate an ephemeral keypair.
    pub fn generate() -> Self {
        let sk = SecretKey::random(&mut OsRng);
        let mut session_sk = [0u8; SECRET_KEY_LEN];
        session_sk.copy_from_slice(&sk.to_bytes());
        Self {
            session_sk,
            session_pk: raw_public_key(&sk.public_key()),
            peer_pk: None,
            shared_secret: None,
            xor_key: None,
            is_secure: false,
        }
    }

    pub fn session_sk(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.session_sk
    }

    pub fn session_pk(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.session_pk
    }

    /// Agree on a secret with the peer and switch to the encrypted path.
    pub fn establish(&mut self, peer_pk: &[u8]) -> Result<(), CryptoError> {
        let secret = derive_shared_secret(&self.session_sk, peer_pk)?;
        let mut peer = [0u8; PUBLIC_KEY_LEN];
        peer.copy_from_slice(peer_pk);

        self.peer_pk = Some(peer);
        self.xor_key = Some(sha256(&secret));
        self.shared_secret = Some(secret);
        self.is_secure = true;
        Ok(())
    }

    /// Sign with the session private key.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        sign(&self.session_sk, data)
    }

    /// Encrypt in place with the agreed keystream. No-op before [`establish`](Self::establish).
    pub fn encrypt(&self, data: &mut [u8]) {
        if let Some(key) = &self.xor_key {
            keystream_encrypt(data, key);
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_pk", &self.session_pk)
            .field("is_secure", &self.is_secure)
            .finish_non_exhaustive()
    }
}

/// Strip the SEC1 tag from an uncompressed point.
pub fn raw_public_key(pk: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = pk.to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

/// Parse a raw 64-byte X ‖ Y public key.
pub fn parse_public_key(raw: &[u8]) -> Result<PublicKey, CryptoError> {
    if raw.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::PublicKeyLength(raw.len()));
    }
    let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Public key of a raw private scalar.
pub fn public_key_of(sk: &[u8]) -> Result<[u8; PUBLIC_KEY_LEN], CryptoError> {
    let sk = SecretKey::from_slice(sk).map_err(|_| CryptoError::InvalidSecretKey)?;
    Ok(raw_public_key(&sk.public_key()))
}

/// ECDSA P-256 over SHA-256(data). Returns r ‖ s, each 32 bytes big-endian.
pub fn sign(sk: &[u8], data: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
    let key = SigningKey::from_slice(sk).map_err(|_| CryptoError::InvalidSecretKey)?;
    let sig: Signature = key.sign(data);
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&sig.to_bytes());
    Ok(out)
}

/// Verify an r ‖ s signature over SHA-256(data).
pub fn verify(pk: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from(parse_public_key(pk)?);
    let sig = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(data, &sig).map_err(|_| CryptoError::VerificationFailed)
}

/// ECDH agreement. P-256 has cofactor 1, so this matches cofactor DH.
///
/// Returns the X coordinate of the shared point left-padded to 32 bytes.
pub fn derive_shared_secret(
    sk: &[u8],
    peer_pk: &[u8],
) -> Result<[u8; COORDINATE_LEN], CryptoError> {
    let sk = SecretKey::from_slice(sk).map_err(|_| CryptoError::InvalidSecretKey)?;
    let peer = parse_public_key(peer_pk)?;
    let shared = p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), peer.as_affine());
    Ok(normalize_secret(shared.raw_secret_bytes()))
}

/// Left-pad (or keep the low-order bytes of) a big-endian magnitude.
pub fn normalize_secret(magnitude: &[u8]) -> [u8; COORDINATE_LEN] {
    let mut out = [0u8; COORDINATE_LEN];
    let take = magnitude.len().min(COORDINATE_LEN);
    out[COORDINATE_LEN - take..].copy_from_slice(&magnitude[magnitude.len() - take..]);
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// XOR `data[i]` with `key[i % 32]`. Applying it twice restores the input.
pub fn keystream_encrypt(data: &mut [u8], key: &[u8; XOR_KEY_LEN]) {
    for (b, k) in data.iter_mut().zip(key.iter().cycle()) {
        *b ^= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_keypair_matches() {
        assert_eq!(public_key_of(&ROOT_SK).unwrap(), ROOT_PK);
    }

    #[test]
    fn test_session_keys_are_fresh() {
        let a = SessionKeys::generate();
        let b = SessionKeys::generate();
        assert_ne!(a.session_pk(), b.session_pk());
        assert!(!a.is_secure);
        assert_eq!(public_key_of(a.session_sk()).unwrap(), *a.session_pk());
    }

    #[test]
    fn test_sign_and_verify() {
        let sig = sign(&ROOT_SK, b"payload").unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify(&ROOT_PK, b"payload", &sig).is_ok());
        assert_eq!(
            verify(&ROOT_PK, b"tampered", &sig),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn test_shared_secret_agrees() {
        let mut host = SessionKeys::generate();
        let mut device = SessionKeys::generate();
        let host_pk = *host.session_pk();
        let device_pk = *device.session_pk();

        host.establish(&device_pk).unwrap();
        device.establish(&host_pk).unwrap();
        assert_eq!(host.shared_secret, device.shared_secret);
        assert_eq!(host.xor_key, device.xor_key);
        assert!(host.is_secure);
    }

    #[test]
    fn test_bad_peer_key() {
        let keys = SessionKeys::generate();
        assert_eq!(
            derive_shared_secret(keys.session_sk(), &[0u8; 63]),
            Err(CryptoError::PublicKeyLength(63))
        );
        assert_eq!(
            derive_shared_secret(keys.session_sk(), &[1u8; 64]),
            Err(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_normalize_secret() {
        let short = normalize_secret(&[1, 2, 3]);
        assert_eq!(&short[..29], &[0u8; 29]);
        assert_eq!(&short[29..], &[1, 2, 3]);

        let mut signed = vec![0u8];
        signed.extend_from_slice(&[0xFF; 32]);
        assert_eq!(normalize_secret(&signed), [0xFF; 32]);
    }

    #[test]
    fn test_sha256() {
        assert_eq!(sha256(b"abc")[..4], [0xba, 0x78, 0x16, 0xbf]);
    }

    #[test]
    fn test_keystream_involution() {
        let key: [u8; 32] = core::array::from_fn(|i| (i as u8).wrapping_mul(37) ^ 0x5A);
        let original: Vec<u8> = (0..100u8).collect();
        let mut data = original.clone();
        keystream_encrypt(&mut data, &key);
        assert_ne!(data, original);
        assert_eq!(data[33], original[33] ^ key[1]);
        keystream_encrypt(&mut data, &key);
        assert_eq!(data, original);
    }
}
