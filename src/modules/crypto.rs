//! Key agreement and the encrypted message envelope

use std::fmt;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::ErrorKind;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Derived session key length (AES-256)
pub const SESSION_KEY_LEN: usize = 32;
/// CBC initialisation vector length
pub const IV_LEN: usize = 16;
/// AES block size
pub const BLOCK_LEN: usize = 16;
/// Compressed SEC1 P-256 public key length
pub const COMPRESSED_PUBLIC_KEY_LEN: usize = 33;

/// Cipher and key agreement errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Invalid base64 envelope: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Per-connection symmetric key. Never persisted, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Short non-reversible identifier for debug logs
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Ephemeral P-256 key pair, one per connection
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        EphemeralKeyPair { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Compressed SEC1 encoding sent to the peer
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Agree on a session key with the peer's encoded public key
    pub fn derive_session_key(&self, peer_public_key: &[u8]) -> Result<SessionKey, CryptoError> {
        let peer = parse_public_key(peer_public_key)?;
        let shared_secret = custom_ecdh(&self.secret, &peer)?;
        derive_session_key(&shared_secret)
    }
}

/// Parse a SEC1 encoded P-256 public key (compressed or uncompressed)
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|e| {
        CryptoError::InvalidPublicKey(format!("{} ({} bytes)", e, bytes.len()))
    })
}

/// Performs ECDH key agreement and returns x-coordinate as shared secret
///
/// # Arguments
/// * `private_key` - The local private key
/// * `public_key` - The remote public key
///
/// # Returns
/// The x-coordinate of the shared point (32 bytes for P-256)
pub fn custom_ecdh(private_key: &SecretKey, public_key: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    use elliptic_curve::point::AffineCoordinates;
    let scalar = private_key.to_nonzero_scalar();
    let public_key_point = public_key.to_projective();
    let shared_point = (public_key_point * *scalar).to_affine();
    let x_coordinate = shared_point.x();
    Ok(x_coordinate.to_vec())
}

/// HKDF-SHA256 over the raw shared secret, no salt and empty info
pub fn derive_session_key(shared_secret: &[u8]) -> Result<SessionKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut derived_key = [0u8; SESSION_KEY_LEN];
    hkdf.expand(&[], &mut derived_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(SessionKey(derived_key))
}

/// Encrypt a payload into the wire envelope `base64(iv || AES-256-CBC(pkcs7(payload)))`
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(envelope).into_bytes())
}

/// Reverse of [`encrypt`]. Any malformed envelope is a protocol error.
pub fn decrypt(key: &SessionKey, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let raw = STANDARD.decode(envelope)?;
    if raw.len() < IV_LEN + BLOCK_LEN || (raw.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(CryptoError::Decrypt(format!(
            "envelope of {} bytes is not iv plus whole blocks",
            raw.len()
        )));
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);

    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt("bad padding".to_string()))
}

/// First eight bytes of SHA-256, hex encoded
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}
