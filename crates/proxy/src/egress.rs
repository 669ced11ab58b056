//! The outbound path: segment, wrap, publish.
//!
//! Each request becomes one or more inner kind-80 events (one per body
//! part), each sealed under the proxy identity and gift-wrapped under a
//! one-shot key, then fanned out to every initial and cached hint
//! relay. Publish failures are logged per relay and never retried — the
//! relay fan-out is the redundancy, and the response timeout is the
//! only failure the client ever sees from here.

use crate::windows::unix_now;
use hornet_core::{
    Event, Identity, KIND_HTTP_REQUEST, RequestMessage, Rumor, UnsignedEvent, WrapError,
    create_gift_wrap, create_seal, segment_body,
};
use hornet_client::RelayPool;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Errors that abort request submission before anything is published.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("envelope error: {0}")]
    Wrap(#[from] WrapError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything egress needs to submit one request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub request_id: String,
    pub destination_pubkey: String,
    /// Hint relays for this request, already normalized and touched
    pub hint_relays: Vec<String>,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Relays safe to advertise to the recipient: no credentials, no query.
fn safe_relays(initial: &[String], hints: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for url in initial.iter().chain(hints.iter()) {
        if seen.contains(url) {
            continue;
        }
        if is_safe_relay(url) {
            seen.push(url.clone());
        } else {
            debug!(relay = %url, "excluded from advertised relays");
        }
    }
    seen
}

fn is_safe_relay(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            parsed.username().is_empty() && parsed.password().is_none() && parsed.query().is_none()
        }
        Err(_) => false,
    }
}

/// Tags for a gift wrap: `["p", dest, first_relay?]` and, when more
/// relays remain, `["relays", rest…]`.
fn wrap_tags(destination: &str, advertised: &[String]) -> Vec<Vec<String>> {
    let mut p_tag = vec!["p".to_string(), destination.to_string()];
    if let Some(first) = advertised.first() {
        p_tag.push(first.clone());
    }
    let mut tags = vec![p_tag];
    if advertised.len() > 1 {
        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(advertised[1..].iter().cloned());
        tags.push(relays_tag);
    }
    tags
}

/// Build the gift-wrapped events for one request, one per body part.
///
/// `advertised` is the safe-relay list that ends up in the wrap tags.
pub fn build_request_events(
    identity: &Identity,
    request: &OutboundRequest,
    advertised: &[String],
) -> Result<Vec<Event>, EgressError> {
    let chunks = segment_body(&request.body);
    let parts = chunks.len() as u64;
    let tags = wrap_tags(&request.destination_pubkey, advertised);

    let mut events = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.into_iter().enumerate() {
        let part_index = index as u64;
        let message = RequestMessage {
            id: request.request_id.clone(),
            part_index,
            parts,
            body_base64: chunk,
            method: (part_index == 0).then(|| request.method.clone()),
            url: (part_index == 0).then(|| request.url.clone()),
            headers: (part_index == 0).then(|| request.headers.clone()),
        };

        let now = unix_now();
        let rumor = Rumor::new(UnsignedEvent {
            pubkey: identity.public_key_hex().to_string(),
            created_at: now,
            kind: KIND_HTTP_REQUEST,
            tags: vec![],
            content: serde_json::to_string(&message)?,
        });
        let seal = create_seal(&rumor, identity.secret(), &request.destination_pubkey, now)?;
        events.push(create_gift_wrap(
            &seal,
            &request.destination_pubkey,
            tags.clone(),
            now,
        )?);
    }
    Ok(events)
}

/// Segment, wrap and publish one request across the pool.
///
/// Parts go out in index order. The publish phase cannot fail the
/// request: zero accepted publishes simply leaves the pending entry to
/// its timeout.
pub async fn send(
    identity: &Identity,
    pool: &RelayPool,
    request: &OutboundRequest,
) -> Result<(), EgressError> {
    let advertised = safe_relays(&pool.initial_urls(), &request.hint_relays);
    let events = build_request_events(identity, request, &advertised)?;

    for (part_index, wrap) in events.into_iter().enumerate() {
        let accepted = pool.publish(&wrap).await;
        if accepted == 0 {
            warn!(
                request_id = %request.request_id,
                part = part_index,
                "no relay accepted the publish"
            );
        } else {
            debug!(
                request_id = %request.request_id,
                part = part_index,
                relays = accepted,
                "published request part"
            );
        }
    }
    Ok(())
}
