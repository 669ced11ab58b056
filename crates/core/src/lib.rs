//! Protocol codec for the hornet tunnel.
//!
//! This crate provides everything needed to turn an HTTP round trip into
//! encrypted events and back:
//! - Event primitives: canonical serialization, id hashing, BIP-340
//!   signing and verification
//! - NIP-19 bech32 entities (`nsec`, `npub`, `nprofile`)
//! - NIP-44 v2 conversation encryption
//! - The three-layer gift-wrap envelope (inner → seal → wrap)
//! - Request/response part messages and body segmentation
//! - The long-lived proxy identity

pub mod event;
pub mod identity;
pub mod message;
pub mod nip19;
pub mod nip44;
pub mod wrap;

pub use event::{
    Event, EventError, EventTemplate, UnsignedEvent, KIND_GIFT_WRAP, KIND_HTTP_REQUEST,
    KIND_HTTP_RESPONSE, KIND_SEAL, finalize_event, generate_secret_key, get_event_hash,
    get_public_key, get_public_key_hex, serialize_event, verify_event,
};
pub use identity::{Identity, IdentityError, load_or_generate};
pub use message::{
    MessageError, RequestMessage, ResponseMessage, PART_SIZE, assemble_body, segment_body,
};
pub use nip19::{
    Nip19Entity, Nip19Error, ProfilePointer, encode_nprofile, encode_npub, encode_nsec,
};
pub use nip44::{Nip44Error, conversation_key};
pub use wrap::{
    Rumor, SEAL_WINDOW_SECS, WrapError, create_gift_wrap, create_seal, unwrap_gift_wrap,
    unwrap_seal,
};
