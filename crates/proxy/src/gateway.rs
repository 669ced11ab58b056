//! The local HTTP gateway.
//!
//! Accepts any method and path, resolves the destination public key
//! (fixed via `--destination` or per request via the
//! `X-Nostr-Destination` header), registers the pending entry, drives
//! egress, and then waits for the reassembled response. The
//! destination header is always consumed and never forwarded.

use crate::egress::{self, OutboundRequest};
use crate::pending::{PendingKey, PendingOutcome, PendingTable};
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use hornet_core::{Identity, Nip19Entity, nip19};
use hornet_client::{RelayPool, normalize_relay_url};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const DESTINATION_HEADER: &str = "x-nostr-destination";

/// A resolved destination: public key plus relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub pubkey: String,
    pub relays: Vec<String>,
}

/// Parse an `npub…` or `nprofile…` destination string.
pub fn parse_destination(value: &str) -> Result<Destination, String> {
    match nip19::decode(value) {
        Ok(Nip19Entity::Pubkey(pubkey)) => Ok(Destination {
            pubkey: hex::encode(pubkey),
            relays: Vec::new(),
        }),
        Ok(Nip19Entity::Profile(profile)) => Ok(Destination {
            pubkey: hex::encode(profile.pubkey),
            relays: profile.relays,
        }),
        Ok(Nip19Entity::Secret(_)) => Err("expected npub or nprofile, got nsec".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Shared state behind every request handler.
#[derive(Clone)]
pub struct GatewayState {
    pub identity: Arc<Identity>,
    pub pool: Arc<RelayPool>,
    pub pending: Arc<PendingTable>,
    pub destination: Option<Destination>,
    pub keep_host: bool,
    pub timeout: Duration,
}

/// Build the router: every method and path lands in the same handler.
pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Removes the pending entry when the handler future is dropped before
/// resolving (client disconnect). Removal is idempotent, so the normal
/// completion paths make this a no-op.
struct PendingGuard {
    pending: Arc<PendingTable>,
    key: PendingKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let pending = Arc::clone(&self.pending);
        let key = self.key.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pending.remove(&key).await;
            });
        }
    }
}

/// Copy request headers into the tunneled map.
///
/// Returns the map and the consumed destination header. Header names
/// arrive lowercased; `host` is dropped unless configured otherwise.
fn collect_headers(
    headers: &axum::http::HeaderMap,
    keep_host: bool,
) -> (BTreeMap<String, String>, Option<String>) {
    let mut collected = BTreeMap::new();
    let mut destination = None;
    for (name, value) in headers {
        let name = name.as_str();
        let Ok(value) = value.to_str() else {
            debug!(header = name, "skipping non-utf8 header");
            continue;
        };
        if name == DESTINATION_HEADER {
            destination = Some(value.to_string());
            continue;
        }
        if name == "host" && !keep_host {
            continue;
        }
        collected.insert(name.to_string(), value.to_string());
    }
    (collected, destination)
}

fn text_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

/// Turn an assembled tunneled response into the HTTP response,
/// propagating status, headers and body verbatim.
fn tunneled_response(assembled: crate::pending::AssembledResponse) -> Response {
    let mut response = Response::new(Body::from(assembled.body));
    *response.status_mut() =
        StatusCode::from_u16(assembled.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in assembled.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "skipping invalid tunneled header"),
        }
    }
    response
}

async fn handle(State(state): State<GatewayState>, request: Request) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let url = parts.uri.to_string();

    let (headers, destination_header) = collect_headers(&parts.headers, state.keep_host);

    // Resolve the destination and its hint set.
    let destination = match (&state.destination, destination_header) {
        (Some(fixed), _) => fixed.clone(),
        (None, None) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                "Missing X-Nostr-Destination header",
            );
        }
        (None, Some(value)) => match parse_destination(value.trim()) {
            Ok(destination) => destination,
            Err(e) => {
                debug!(error = %e, "bad destination header");
                return text_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Invalid X-Nostr-Destination header: {e}"),
                );
            }
        },
    };

    let mut hints = Vec::new();
    for relay in &destination.relays {
        match normalize_relay_url(relay) {
            Ok(normalized) => {
                if !state.pool.is_initial(&normalized) && !hints.contains(&normalized) {
                    hints.push(normalized);
                }
            }
            Err(e) => warn!(relay = %relay, error = %e, "ignoring malformed relay hint"),
        }
    }

    if state.pool.initial_urls().is_empty() && hints.is_empty() {
        return text_response(
            StatusCode::BAD_REQUEST,
            "No relays to publish to: configure --relays or use an nprofile destination carrying relay hints",
        );
    }

    // Pin hint relays before anything is published so they cannot be
    // evicted under this request.
    for hint in &hints {
        if let Err(e) = state.pool.touch_hint(hint, &request_id).await {
            warn!(relay = %hint, error = %e, "failed to open hint relay");
        }
    }

    let key: PendingKey = (request_id.clone(), destination.pubkey.clone());
    let receiver = state.pending.insert(key.clone(), state.timeout);
    let _guard = PendingGuard {
        pending: Arc::clone(&state.pending),
        key: key.clone(),
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            error!(request_id = %request_id, error = %e, "failed to read request body");
            state.pending.remove(&key).await;
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed");
        }
    };

    let outbound = OutboundRequest {
        request_id: request_id.clone(),
        destination_pubkey: destination.pubkey.clone(),
        hint_relays: hints,
        method,
        url,
        headers,
        body,
    };
    if let Err(e) = egress::send(&state.identity, &state.pool, &outbound).await {
        error!(request_id = %request_id, error = %e, "egress failed");
        state.pending.remove(&key).await;
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed");
    }

    match receiver.await {
        Ok(PendingOutcome::Completed(assembled)) => tunneled_response(assembled),
        Ok(PendingOutcome::TimedOut) => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Timed out")
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn test_parse_destination_npub() {
        let npub = hornet_core::encode_npub(&[3u8; 32]).unwrap();
        let destination = parse_destination(&npub).unwrap();
        assert_eq!(destination.pubkey, hex::encode([3u8; 32]));
        assert!(destination.relays.is_empty());
    }

    #[test]
    fn test_parse_destination_nprofile() {
        let profile = hornet_core::ProfilePointer {
            pubkey: [4u8; 32],
            relays: vec!["wss://b.example".to_string()],
        };
        let encoded = hornet_core::encode_nprofile(&profile).unwrap();
        let destination = parse_destination(&encoded).unwrap();
        assert_eq!(destination.pubkey, hex::encode([4u8; 32]));
        assert_eq!(destination.relays, vec!["wss://b.example"]);
    }

    #[test]
    fn test_parse_destination_rejects_nsec_and_garbage() {
        let nsec = hornet_core::encode_nsec(&[5u8; 32]).unwrap();
        assert!(parse_destination(&nsec).is_err());
        assert!(parse_destination("hello").is_err());
    }

    #[test]
    fn test_collect_headers_strips_host_and_destination() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "foo".parse().unwrap());
        headers.insert("accept", "text/plain".parse().unwrap());
        headers.insert("x-nostr-destination", "npub1abc".parse().unwrap());

        let (collected, destination) = collect_headers(&headers, false);
        assert_eq!(destination.as_deref(), Some("npub1abc"));
        assert!(!collected.contains_key("host"));
        assert!(!collected.contains_key("x-nostr-destination"));
        assert_eq!(collected.get("accept"), Some(&"text/plain".to_string()));
    }

    #[test]
    fn test_collect_headers_keep_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "foo".parse().unwrap());
        let (collected, _) = collect_headers(&headers, true);
        assert_eq!(collected.get("host"), Some(&"foo".to_string()));
    }

    #[test]
    fn test_tunneled_response_skips_invalid_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        headers.insert("bad header name".to_string(), "x".to_string());
        let response = tunneled_response(crate::pending::AssembledResponse {
            status: 200,
            headers,
            body: b"hi".to_vec(),
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(response.headers().len(), 1);
    }
}
