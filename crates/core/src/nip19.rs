//! NIP-19 bech32 entities.
//!
//! The tunnel uses three of them: `nsec` (the persisted secret key),
//! `npub` (a bare destination public key) and `nprofile` (a destination
//! public key plus relay hints, TLV-encoded).

use bech32::{Bech32, Hrp};
use thiserror::Error;

const HRP_SECRET: &str = "nsec";
const HRP_PUBKEY: &str = "npub";
const HRP_PROFILE: &str = "nprofile";

/// TLV type for the 32-byte special payload (pubkey)
const TLV_SPECIAL: u8 = 0;
/// TLV type for a relay URL (repeatable)
const TLV_RELAY: u8 = 1;

/// Errors that can occur when encoding or decoding entities.
#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 error: {0}")]
    Bech32(String),

    #[error("unknown prefix: {0}")]
    UnknownPrefix(String),

    #[error("invalid payload length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid TLV structure")]
    InvalidTlv,

    #[error("missing pubkey in profile")]
    MissingPubkey,
}

/// A destination public key with relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePointer {
    pub pubkey: [u8; 32],
    pub relays: Vec<String>,
}

/// A decoded bech32 entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nip19Entity {
    Pubkey([u8; 32]),
    Secret([u8; 32]),
    Profile(ProfilePointer),
}

fn encode_raw(hrp: &str, data: &[u8]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip19Error::Bech32(e.to_string()))
}

/// Encode a public key as `npub…`.
pub fn encode_npub(pubkey: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_raw(HRP_PUBKEY, pubkey)
}

/// Encode a secret key as `nsec…`.
pub fn encode_nsec(secret: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_raw(HRP_SECRET, secret)
}

/// Encode a profile pointer as `nprofile…` (TLV: pubkey + relays).
pub fn encode_nprofile(profile: &ProfilePointer) -> Result<String, Nip19Error> {
    let mut data = Vec::with_capacity(34 + profile.relays.iter().map(|r| r.len() + 2).sum::<usize>());
    data.push(TLV_SPECIAL);
    data.push(32);
    data.extend_from_slice(&profile.pubkey);
    for relay in &profile.relays {
        let bytes = relay.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(Nip19Error::InvalidTlv);
        }
        data.push(TLV_RELAY);
        data.push(bytes.len() as u8);
        data.extend_from_slice(bytes);
    }
    encode_raw(HRP_PROFILE, &data)
}

fn take32(data: &[u8]) -> Result<[u8; 32], Nip19Error> {
    data.try_into()
        .map_err(|_| Nip19Error::InvalidLength(data.len()))
}

fn decode_profile_tlv(data: &[u8]) -> Result<ProfilePointer, Nip19Error> {
    let mut pubkey: Option<[u8; 32]> = None;
    let mut relays = Vec::new();

    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(Nip19Error::InvalidTlv);
        }
        let (tlv_type, len) = (rest[0], rest[1] as usize);
        if rest.len() < 2 + len {
            return Err(Nip19Error::InvalidTlv);
        }
        let value = &rest[2..2 + len];
        match tlv_type {
            TLV_SPECIAL => pubkey = Some(take32(value)?),
            TLV_RELAY => {
                relays.push(String::from_utf8(value.to_vec()).map_err(|_| Nip19Error::InvalidTlv)?)
            }
            // Unknown TLV types are skipped for forward compatibility.
            _ => {}
        }
        rest = &rest[2 + len..];
    }

    Ok(ProfilePointer {
        pubkey: pubkey.ok_or(Nip19Error::MissingPubkey)?,
        relays,
    })
}

/// Decode any supported bech32 entity.
pub fn decode(encoded: &str) -> Result<Nip19Entity, Nip19Error> {
    let (hrp, data) =
        bech32::decode(encoded.trim()).map_err(|e| Nip19Error::Bech32(e.to_string()))?;

    match hrp.to_string().to_lowercase().as_str() {
        HRP_PUBKEY => Ok(Nip19Entity::Pubkey(take32(&data)?)),
        HRP_SECRET => Ok(Nip19Entity::Secret(take32(&data)?)),
        HRP_PROFILE => Ok(Nip19Entity::Profile(decode_profile_tlv(&data)?)),
        other => Err(Nip19Error::UnknownPrefix(other.to_string())),
    }
}
