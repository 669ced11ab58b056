//! NIP-44 v2 conversation encryption.
//!
//! Both envelope layers of the tunnel encrypt with this scheme:
//! - ECDH over secp256k1 to derive a shared secret
//! - HKDF-SHA256 to derive the conversation key and per-message keys
//! - ChaCha20 for the ciphertext, HMAC-SHA256 for authentication
//!
//! The conversation key is symmetric in the pair: the key derived from
//! `(a_secret, b_public)` equals the one derived from `(b_secret,
//! a_public)`, which is what lets the destination decrypt a payload it
//! never exchanged keys for.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Payload format version
pub const VERSION: u8 = 2;

/// Maximum plaintext length (65535 bytes)
pub const MAX_PLAINTEXT_LEN: usize = 65535;

/// Minimum padded message size
const MIN_PADDED_LEN: usize = 32;

/// Nonce size prepended to the ciphertext
const NONCE_SIZE: usize = 32;

/// HMAC-SHA256 output size
const MAC_SIZE: usize = 32;

/// HKDF salt for the conversation key
const HKDF_SALT: &[u8] = b"nip44-v2";

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during encryption or decryption.
#[derive(Debug, Error)]
pub enum Nip44Error {
    #[error("plaintext too short (minimum 1 byte)")]
    PlaintextTooShort,

    #[error("plaintext too long (maximum {MAX_PLAINTEXT_LEN} bytes)")]
    PlaintextTooLong,

    #[error("invalid payload structure")]
    InvalidPayload,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("mac verification failed")]
    MacVerificationFailed,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// Derive the 32-byte conversation key between a secret key and a peer's
/// x-only public key (64 hex chars).
///
/// ECDH produces the shared point; the x coordinate is run through
/// HKDF-extract with the salt `nip44-v2`.
pub fn conversation_key(
    secret_key: &[u8; 32],
    peer_public_key_hex: &str,
) -> Result<[u8; 32], Nip44Error> {
    let sk = SecretKey::from_slice(secret_key).map_err(|_| Nip44Error::InvalidSecretKey)?;

    // x-only keys lift to the even-parity point
    let peer_bytes = hex::decode(peer_public_key_hex)
        .map_err(|e| Nip44Error::InvalidPublicKey(e.to_string()))?;
    let mut compressed = Vec::with_capacity(33);
    compressed.push(0x02);
    compressed.extend_from_slice(&peer_bytes);
    let pk = PublicKey::from_slice(&compressed)
        .map_err(|e| Nip44Error::InvalidPublicKey(e.to_string()))?;

    let shared_point = ecdh::shared_secret_point(&pk, &sk);
    let shared_x = &shared_point[..32];

    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_x);
    let mut key = [0u8; 32];
    hkdf.expand(&[], &mut key)
        .map_err(|_| Nip44Error::InvalidPayload)?;
    Ok(key)
}

/// Derive per-message keys from the conversation key and nonce:
/// ChaCha20 key, ChaCha20 nonce, HMAC key.
fn derive_message_keys(
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
) -> Result<([u8; 32], [u8; 12], [u8; 32]), Nip44Error> {
    let hkdf = Hkdf::<Sha256>::new(Some(conversation_key), &[]);
    let mut output = [0u8; 76];
    hkdf.expand(nonce, &mut output)
        .map_err(|_| Nip44Error::InvalidPayload)?;

    let mut chacha_key = [0u8; 32];
    let mut chacha_nonce = [0u8; 12];
    let mut hmac_key = [0u8; 32];
    chacha_key.copy_from_slice(&output[0..32]);
    chacha_nonce.copy_from_slice(&output[32..44]);
    hmac_key.copy_from_slice(&output[44..76]);
    Ok((chacha_key, chacha_nonce, hmac_key))
}

/// Padded length: powers of two up to 256, then multiples of 32.
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        32
    } else if unpadded_len <= 256 {
        unpadded_len.next_power_of_two()
    } else {
        unpadded_len.div_ceil(32) * 32
    }
}

/// Pad: `[len: u16 be][plaintext][zeros]`.
fn pad(plaintext: &str) -> Result<Vec<u8>, Nip44Error> {
    let bytes = plaintext.as_bytes();
    if bytes.is_empty() {
        return Err(Nip44Error::PlaintextTooShort);
    }
    if bytes.len() > MAX_PLAINTEXT_LEN {
        return Err(Nip44Error::PlaintextTooLong);
    }

    let padded_len = calc_padded_len(2 + bytes.len());
    let mut padded = vec![0u8; padded_len];
    padded[0] = ((bytes.len() >> 8) & 0xff) as u8;
    padded[1] = (bytes.len() & 0xff) as u8;
    padded[2..2 + bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<String, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }
    let len = ((padded[0] as usize) << 8) | (padded[1] as usize);
    if len == 0 || len > MAX_PLAINTEXT_LEN {
        return Err(Nip44Error::InvalidPadding);
    }
    let unpadded_len = 2 + len;
    if padded.len() != calc_padded_len(unpadded_len) || padded.len() < unpadded_len {
        return Err(Nip44Error::InvalidPadding);
    }
    if padded[unpadded_len..].iter().any(|&b| b != 0) {
        return Err(Nip44Error::InvalidPadding);
    }
    String::from_utf8(padded[2..unpadded_len].to_vec()).map_err(|_| Nip44Error::InvalidPadding)
}

/// Encrypt a plaintext under a conversation key.
///
/// Returns the base64 payload `version || nonce || ciphertext || mac`.
pub fn encrypt(conversation_key: &[u8; 32], plaintext: &str) -> Result<String, Nip44Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let (chacha_key, chacha_nonce, hmac_key) = derive_message_keys(conversation_key, &nonce)?;

    let mut ciphertext = pad(plaintext)?;
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut ciphertext);

    let mut mac = HmacSha256::new_from_slice(&hmac_key).map_err(|_| Nip44Error::InvalidPayload)?;
    mac.update(&nonce);
    mac.update(&ciphertext);
    let mac_bytes = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac_bytes);
    Ok(BASE64_STANDARD.encode(&payload))
}

/// Decrypt a payload under the complementary conversation key.
pub fn decrypt(conversation_key: &[u8; 32], payload: &str) -> Result<String, Nip44Error> {
    let decoded = BASE64_STANDARD.decode(payload)?;
    if decoded.len() < 1 + NONCE_SIZE + MIN_PADDED_LEN + MAC_SIZE {
        return Err(Nip44Error::InvalidPayload);
    }

    let version = decoded[0];
    if version != VERSION {
        return Err(Nip44Error::UnsupportedVersion(version));
    }

    let nonce: [u8; 32] = decoded[1..1 + NONCE_SIZE]
        .try_into()
        .map_err(|_| Nip44Error::InvalidPayload)?;
    let ciphertext = &decoded[1 + NONCE_SIZE..decoded.len() - MAC_SIZE];
    let mac_received = &decoded[decoded.len() - MAC_SIZE..];

    let (chacha_key, chacha_nonce, hmac_key) = derive_message_keys(conversation_key, &nonce)?;

    let mut mac = HmacSha256::new_from_slice(&hmac_key).map_err(|_| Nip44Error::InvalidPayload)?;
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(mac_received)
        .map_err(|_| Nip44Error::MacVerificationFailed)?;

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut plaintext);

    unpad(&plaintext)
}
