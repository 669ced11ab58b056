//! The proxy's long-lived identity.
//!
//! Holds the secret key and its derived x-only public key. The public
//! key is what destinations address responses to and what every relay
//! subscription filters on.

use crate::event::{generate_secret_key, get_public_key};
use crate::nip19::{self, Nip19Entity, Nip19Error};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading or persisting the identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bech32 error: {0}")]
    Nip19(#[from] Nip19Error),

    #[error("key file does not contain an nsec entity")]
    NotASecretKey,

    #[error("invalid secret key")]
    InvalidSecretKey,
}

/// Secret key plus cached derived public key.
#[derive(Clone)]
pub struct Identity {
    secret: [u8; 32],
    public_key: [u8; 32],
    public_key_hex: String,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        loop {
            if let Ok(identity) = Self::from_secret(generate_secret_key()) {
                return identity;
            }
        }
    }

    /// Build an identity from raw secret bytes.
    pub fn from_secret(secret: [u8; 32]) -> Result<Self, IdentityError> {
        let public_key =
            get_public_key(&secret).map_err(|_| IdentityError::InvalidSecretKey)?;
        Ok(Self {
            secret,
            public_key,
            public_key_hex: hex::encode(public_key),
        })
    }

    /// Parse a bech32 `nsec…` string.
    pub fn from_nsec(encoded: &str) -> Result<Self, IdentityError> {
        match nip19::decode(encoded)? {
            Nip19Entity::Secret(secret) => Self::from_secret(secret),
            _ => Err(IdentityError::NotASecretKey),
        }
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// The x-only public key, 64 lowercase hex chars.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Display form of the public key.
    pub fn npub(&self) -> Result<String, Nip19Error> {
        nip19::encode_npub(&self.public_key)
    }

    /// Persistable form of the secret key.
    pub fn nsec(&self) -> Result<String, Nip19Error> {
        nip19::encode_nsec(&self.secret)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("Identity")
            .field("public_key_hex", &self.public_key_hex)
            .finish()
    }
}

/// Load the identity from an nsec file, or generate one.
///
/// When the file exists its trimmed contents must decode as `nsec…`;
/// anything else is fatal. When it does not exist and `save_if_absent`
/// is set, the generated key is written back (creating parent
/// directories first).
pub fn load_or_generate(
    path: Option<&Path>,
    save_if_absent: bool,
) -> Result<Identity, IdentityError> {
    let Some(path) = path else {
        return Ok(Identity::generate());
    };

    if path.exists() {
        let contents = fs::read_to_string(path)?;
        return Identity::from_nsec(contents.trim());
    }

    let identity = Identity::generate();
    if save_if_absent {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, identity.nsec()?)?;
    }
    Ok(identity)
}
