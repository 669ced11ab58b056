//! The three-layer envelope: inner event → seal → gift wrap.
//!
//! A seal (kind 13) is signed by the real author and carries the
//! encrypted, stringified inner event; its timestamp is drawn uniformly
//! from the last 48 hours so publish times cannot be correlated. The
//! gift wrap (kind 21059) is signed by a fresh one-shot key and carries
//! the encrypted, stringified seal; the one-shot key is dropped as soon
//! as the wrap is signed, so outer pubkeys cannot link two requests.
//!
//! Short-circuiting any layer (signing the inner event directly, or
//! reusing the wrap key) breaks the metadata privacy this exists for.

use crate::event::{
    Event, EventTemplate, KIND_GIFT_WRAP, KIND_SEAL, UnsignedEvent, finalize_event,
    generate_secret_key, get_event_hash, verify_event,
};
use crate::nip44;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seal timestamps are randomized within this many seconds of the past.
pub const SEAL_WINDOW_SECS: u64 = 48 * 60 * 60;

/// Errors that can occur while building or opening envelopes.
#[derive(Debug, Error)]
pub enum WrapError {
    #[error("invalid kind: expected {expected}, got {got}")]
    InvalidKind { expected: u16, got: u16 },

    #[error("seal signature verification failed")]
    BadSealSignature,

    #[error("inner author {inner} does not match seal author {seal}")]
    AuthorMismatch { inner: String, seal: String },

    #[error("encryption error: {0}")]
    Nip44(#[from] nip44::Nip44Error),

    #[error("event error: {0}")]
    Event(#[from] crate::event::EventError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// An inner event as it travels inside a seal: it carries an id (the
/// cross-relay dedup key) but no signature, so it stays deniable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Rumor {
    /// Hash an unsigned event into a rumor.
    pub fn new(unsigned: UnsignedEvent) -> Self {
        let id = get_event_hash(&unsigned);
        Self {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
        }
    }
}

/// Seal an inner event for a recipient.
///
/// The seal is signed by `sender_secret` with `created_at` drawn from
/// `[now − 48 h, now]` and empty tags.
pub fn create_seal(
    inner: &Rumor,
    sender_secret: &[u8; 32],
    recipient_pubkey: &str,
    now: u64,
) -> Result<Event, WrapError> {
    let inner_json =
        serde_json::to_string(inner).map_err(|e| WrapError::Serialization(e.to_string()))?;

    let key = nip44::conversation_key(sender_secret, recipient_pubkey)?;
    let content = nip44::encrypt(&key, &inner_json)?;

    let offset: u64 = rand::rng().random_range(0..=SEAL_WINDOW_SECS);
    let template = EventTemplate {
        created_at: now.saturating_sub(offset),
        kind: KIND_SEAL,
        tags: vec![],
        content,
    };
    Ok(finalize_event(&template, sender_secret)?)
}

/// Wrap a seal for a recipient under a fresh one-shot key.
///
/// `tags` is supplied by the caller (the `p` tag with an optional relay
/// hint, plus an optional `relays` tag). The wrap's `created_at` is the
/// caller's `now` — only the seal hides its timestamp.
pub fn create_gift_wrap(
    seal: &Event,
    recipient_pubkey: &str,
    tags: Vec<Vec<String>>,
    now: u64,
) -> Result<Event, WrapError> {
    let seal_json =
        serde_json::to_string(seal).map_err(|e| WrapError::Serialization(e.to_string()))?;

    let ephemeral = generate_secret_key();
    let key = nip44::conversation_key(&ephemeral, recipient_pubkey)?;
    let content = nip44::encrypt(&key, &seal_json)?;

    let template = EventTemplate {
        created_at: now,
        kind: KIND_GIFT_WRAP,
        tags,
        content,
    };
    // The ephemeral key goes out of scope here and is never stored.
    Ok(finalize_event(&template, &ephemeral)?)
}

/// Open a gift wrap addressed to `recipient_secret`, yielding the seal.
///
/// Only the kind is enforced at this layer; the seal inside carries the
/// author identity worth verifying.
pub fn unwrap_gift_wrap(wrap: &Event, recipient_secret: &[u8; 32]) -> Result<Event, WrapError> {
    if wrap.kind != KIND_GIFT_WRAP {
        return Err(WrapError::InvalidKind {
            expected: KIND_GIFT_WRAP,
            got: wrap.kind,
        });
    }

    let key = nip44::conversation_key(recipient_secret, &wrap.pubkey)?;
    let seal_json = nip44::decrypt(&key, &wrap.content)?;
    let seal: Event =
        serde_json::from_str(&seal_json).map_err(|e| WrapError::Serialization(e.to_string()))?;

    if seal.kind != KIND_SEAL {
        return Err(WrapError::InvalidKind {
            expected: KIND_SEAL,
            got: seal.kind,
        });
    }
    Ok(seal)
}

/// Verify and open a seal, yielding the inner event.
///
/// The seal's Schnorr signature is checked against its own pubkey, and
/// the decrypted inner event must claim the same author — otherwise a
/// third party could stuff someone else's sealed response inside its
/// own envelope.
pub fn unwrap_seal(seal: &Event, recipient_secret: &[u8; 32]) -> Result<Rumor, WrapError> {
    if seal.kind != KIND_SEAL {
        return Err(WrapError::InvalidKind {
            expected: KIND_SEAL,
            got: seal.kind,
        });
    }
    if !verify_event(seal)? {
        return Err(WrapError::BadSealSignature);
    }

    let key = nip44::conversation_key(recipient_secret, &seal.pubkey)?;
    let inner_json = nip44::decrypt(&key, &seal.content)?;
    let inner: Rumor =
        serde_json::from_str(&inner_json).map_err(|e| WrapError::Serialization(e.to_string()))?;

    if inner.pubkey != seal.pubkey {
        return Err(WrapError::AuthorMismatch {
            inner: inner.pubkey,
            seal: seal.pubkey.clone(),
        });
    }
    Ok(inner)
}
