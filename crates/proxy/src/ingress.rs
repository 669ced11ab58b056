//! The inbound event pipeline.
//!
//! Every event delivered by any relay subscription runs through the
//! same sequence: outer dedup, unwrap, seal verification, inner shape
//! and replay-window checks, inner dedup, response-message parsing,
//! and finally routing into the pending table. Failures at any step
//! drop that event with a log line and never disturb neighbouring
//! events or requests.

use crate::pending::{InsertOutcome, PendingTable};
use crate::windows::{FUTURE_DRIFT_SECS, unix_now};
use hornet_core::{Identity, KIND_HTTP_RESPONSE, ResponseMessage, unwrap_gift_wrap, unwrap_seal};
use hornet_client::{DedupHook, IncomingEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Maximum accepted length of an inner event id.
const MAX_INNER_ID_LEN: usize = 100;

/// Consumes subscription events and routes response parts.
pub struct Ingress {
    identity: Arc<Identity>,
    pending: Arc<PendingTable>,
    /// outer event id → created_at; stops reprocessing across
    /// reconnections and overlapping relays
    handled_events: Mutex<HashMap<String, u64>>,
    /// inner event id → created_at; cross-relay dedup of the plaintext
    handled_responses: Mutex<HashMap<String, u64>>,
    /// Oldest accepted inner `created_at`; advanced by the reap timer
    oldest_time: AtomicU64,
}

impl Ingress {
    pub fn new(identity: Arc<Identity>, pending: Arc<PendingTable>, now: u64) -> Self {
        Self {
            identity,
            pending,
            handled_events: Mutex::new(HashMap::new()),
            handled_responses: Mutex::new(HashMap::new()),
            oldest_time: AtomicU64::new(now.saturating_sub(60)),
        }
    }

    /// Read-only check used by connections before forwarding an event.
    pub fn already_handled(&self, event_id: &str) -> bool {
        self.handled_events
            .lock()
            .map(|map| map.contains_key(event_id))
            .unwrap_or(false)
    }

    /// The per-connection pre-check hook.
    pub fn dedup_hook(self: &Arc<Self>) -> DedupHook {
        let ingress = Arc::clone(self);
        Arc::new(move |event_id: &str| ingress.already_handled(event_id))
    }

    pub fn set_oldest_time(&self, oldest: u64) {
        self.oldest_time.store(oldest, Ordering::Relaxed);
    }

    pub fn oldest_time(&self) -> u64 {
        self.oldest_time.load(Ordering::Relaxed)
    }

    /// Drop handled-response entries older than `oldest`.
    pub fn reap_responses(&self, oldest: u64) {
        if let Ok(mut map) = self.handled_responses.lock() {
            let before = map.len();
            map.retain(|_, created_at| *created_at >= oldest);
            if map.len() != before {
                debug!(reaped = before - map.len(), "reaped handled response ids");
            }
        }
    }

    /// Drop handled-event entries older than the subscription `since`.
    pub fn reap_events(&self, since: u64) {
        if let Ok(mut map) = self.handled_events.lock() {
            let before = map.len();
            map.retain(|_, created_at| *created_at >= since);
            if map.len() != before {
                debug!(reaped = before - map.len(), "reaped handled event ids");
            }
        }
    }

    /// Spawn the consumer task over the pool's event stream.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<IncomingEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                self.handle_event(incoming).await;
            }
            info!("ingress stream ended");
        })
    }

    /// Run one event through the pipeline. Never propagates failures.
    pub async fn handle_event(&self, incoming: IncomingEvent) {
        let event = incoming.event;
        let relay = incoming.relay_url;

        // Outer dedup: record unconditionally, drop repeats.
        {
            let Ok(mut map) = self.handled_events.lock() else {
                return;
            };
            if map.insert(event.id.clone(), event.created_at).is_some() {
                debug!(%relay, id = %event.id, "duplicate outer event");
                return;
            }
        }

        let seal = match unwrap_gift_wrap(&event, self.identity.secret()) {
            Ok(seal) => seal,
            Err(e) => {
                debug!(%relay, id = %event.id, error = %e, "failed to unwrap gift wrap");
                return;
            }
        };

        // Verifies the seal signature, decrypts, and checks that the
        // inner event claims the seal's author.
        let inner = match unwrap_seal(&seal, self.identity.secret()) {
            Ok(inner) => inner,
            Err(e) => {
                debug!(%relay, id = %event.id, error = %e, "failed to open seal");
                return;
            }
        };

        if inner.kind != KIND_HTTP_RESPONSE {
            debug!(%relay, kind = inner.kind, "inner event is not a response");
            return;
        }
        if inner.id.is_empty() || inner.id.len() > MAX_INNER_ID_LEN {
            debug!(%relay, "inner event id has invalid length");
            return;
        }

        // Replay window.
        let oldest = self.oldest_time();
        let newest = unix_now() + FUTURE_DRIFT_SECS;
        if inner.created_at < oldest || inner.created_at > newest {
            debug!(
                %relay,
                created_at = inner.created_at,
                oldest,
                newest,
                "inner event outside replay window"
            );
            return;
        }

        // Inner dedup: the same plaintext response may arrive via
        // several relays under different wraps.
        {
            let Ok(mut map) = self.handled_responses.lock() else {
                return;
            };
            if map.insert(inner.id.clone(), inner.created_at).is_some() {
                debug!(%relay, inner_id = %inner.id, "duplicate inner response");
                return;
            }
        }

        let message: ResponseMessage = match serde_json::from_str(&inner.content) {
            Ok(message) => message,
            Err(e) => {
                debug!(%relay, error = %e, "inner content is not a response message");
                return;
            }
        };
        if let Err(e) = message.validate() {
            debug!(%relay, error = %e, "invalid response message");
            return;
        }

        let key = (message.id.clone(), seal.pubkey.clone());
        match self.pending.insert_part(&key, message).await {
            InsertOutcome::NoPending => {
                debug!(%relay, request_id = %key.0, "no pending request for response")
            }
            InsertOutcome::Duplicate => {
                debug!(%relay, request_id = %key.0, "duplicate part index")
            }
            InsertOutcome::OutOfRange => {
                debug!(%relay, request_id = %key.0, "part index out of range")
            }
            InsertOutcome::Stored => {}
            InsertOutcome::Completed => {
                info!(%relay, request_id = %key.0, "request completed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{PendingOutcome, PendingTable};
    use hornet_core::{
        Event, KIND_GIFT_WRAP, Rumor, UnsignedEvent, create_gift_wrap, create_seal,
        generate_secret_key, get_public_key_hex,
    };
    use hornet_client::{PoolConfig, RelayPool};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        ingress: Arc<Ingress>,
        pending: Arc<PendingTable>,
        destination_secret: [u8; 32],
        destination_pubkey: String,
        proxy_pubkey: String,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(Identity::generate());
        let destination_secret = generate_secret_key();
        let destination_pubkey = get_public_key_hex(&destination_secret).unwrap();
        let proxy_pubkey = identity.public_key_hex().to_string();
        let pool = Arc::new(
            RelayPool::new(&[], &proxy_pubkey, PoolConfig::default()).unwrap(),
        );
        let pending = Arc::new(PendingTable::new(pool));
        let ingress = Arc::new(Ingress::new(identity, Arc::clone(&pending), unix_now()));
        Fixture {
            ingress,
            pending,
            destination_secret,
            destination_pubkey,
            proxy_pubkey,
        }
    }

    fn response_json(id: &str, part_index: u64, parts: u64, body: &str) -> String {
        let mut message = ResponseMessage {
            id: id.to_string(),
            part_index,
            parts,
            body_base64: body.to_string(),
            status: None,
            headers: None,
        };
        if part_index == 0 {
            message.status = Some(200);
            let mut headers = BTreeMap::new();
            headers.insert("content-type".to_string(), "text/plain".to_string());
            message.headers = Some(headers);
        }
        serde_json::to_string(&message).unwrap()
    }

    fn wrap_response(fixture: &Fixture, content: String, created_at: u64) -> Event {
        let rumor = Rumor::new(UnsignedEvent {
            pubkey: fixture.destination_pubkey.clone(),
            created_at,
            kind: KIND_HTTP_RESPONSE,
            tags: vec![],
            content,
        });
        let seal = create_seal(
            &rumor,
            &fixture.destination_secret,
            &fixture.proxy_pubkey,
            created_at,
        )
        .unwrap();
        let tags = vec![vec!["p".to_string(), fixture.proxy_pubkey.clone()]];
        create_gift_wrap(&seal, &fixture.proxy_pubkey, tags, created_at).unwrap()
    }

    fn incoming(event: Event) -> IncomingEvent {
        IncomingEvent {
            relay_url: "wss://r.example".to_string(),
            event,
        }
    }

    #[tokio::test]
    async fn test_valid_response_completes_request() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let rx = fixture.pending.insert(key, Duration::from_secs(30));

        let wrap = wrap_response(&fixture, response_json("r1", 0, 1, "aGk="), unix_now());
        fixture.ingress.handle_event(incoming(wrap)).await;

        match rx.await.unwrap() {
            PendingOutcome::Completed(response) => {
                assert_eq!(response.status, 200);
                assert_eq!(response.body, b"hi");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_kind_is_dropped() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let _rx = fixture.pending.insert(key.clone(), Duration::from_secs(30));

        let mut wrap = wrap_response(&fixture, response_json("r1", 0, 1, ""), unix_now());
        wrap.kind = 1;
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key));
    }

    #[tokio::test]
    async fn test_duplicate_outer_event_is_dropped() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let _rx = fixture.pending.insert(key.clone(), Duration::from_secs(30));

        let wrap = wrap_response(&fixture, response_json("r1", 0, 2, ""), unix_now());
        assert!(!fixture.ingress.already_handled(&wrap.id));
        fixture.ingress.handle_event(incoming(wrap.clone())).await;
        assert!(fixture.ingress.already_handled(&wrap.id));

        // Same wrap again: outer dedup drops it before any state changes.
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key));
    }

    #[tokio::test]
    async fn test_replay_window_bounds() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let _rx = fixture.pending.insert(key.clone(), Duration::from_secs(30));

        // Too far in the future.
        let wrap = wrap_response(
            &fixture,
            response_json("r1", 0, 1, ""),
            unix_now() + FUTURE_DRIFT_SECS + 1,
        );
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key));

        // Older than the oldest accepted timestamp.
        let wrap = wrap_response(
            &fixture,
            response_json("r1", 0, 1, ""),
            fixture.ingress.oldest_time() - 1,
        );
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key));
    }

    #[tokio::test]
    async fn test_duplicate_inner_id_is_dropped_across_wraps() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let rx = fixture.pending.insert(key.clone(), Duration::from_secs(30));

        let now = unix_now();
        let wrap = wrap_response(&fixture, response_json("r1", 0, 1, "aGk="), now);
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(matches!(rx.await, Ok(PendingOutcome::Completed(_))));

        // The same inner event arrives again under a fresh wrap (e.g. from
        // another relay); the inner dedup map drops it without touching
        // anything.
        let key2 = ("r1".to_string(), fixture.destination_pubkey.clone());
        let _rx2 = fixture.pending.insert(key2.clone(), Duration::from_secs(30));
        let wrap = wrap_response(&fixture, response_json("r1", 0, 1, "aGk="), now);
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key2));
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_dropped() {
        let fixture = fixture();
        let wrap = wrap_response(&fixture, response_json("nobody", 0, 1, ""), unix_now());
        // No pending entry; nothing to assert beyond "does not panic",
        // but the inner id must still be recorded for dedup.
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_content_is_swallowed() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let _rx = fixture.pending.insert(key.clone(), Duration::from_secs(30));

        let wrap = wrap_response(&fixture, "not json at all".to_string(), unix_now());
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key));
    }

    #[tokio::test]
    async fn test_bad_status_shape_is_rejected() {
        let fixture = fixture();
        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let _rx = fixture.pending.insert(key.clone(), Duration::from_secs(30));

        let content = r#"{"id":"r1","partIndex":0,"parts":1,"bodyBase64":"","status":99,"headers":{}}"#;
        let wrap = wrap_response(&fixture, content.to_string(), unix_now());
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(fixture.pending.contains(&key));
    }

    #[tokio::test]
    async fn test_reaping_respects_thresholds() {
        let fixture = fixture();
        let now = unix_now();

        let key = ("r1".to_string(), fixture.destination_pubkey.clone());
        let rx = fixture.pending.insert(key, Duration::from_secs(30));
        let wrap = wrap_response(&fixture, response_json("r1", 0, 1, ""), now);
        let wrap_id = wrap.id.clone();
        fixture.ingress.handle_event(incoming(wrap)).await;
        assert!(matches!(rx.await, Ok(PendingOutcome::Completed(_))));

        fixture.ingress.reap_events(now.saturating_sub(10));
        assert!(fixture.ingress.already_handled(&wrap_id));

        fixture.ingress.reap_events(now + 10);
        assert!(!fixture.ingress.already_handled(&wrap_id));
    }

    #[test]
    fn test_gift_wrap_kind_constant() {
        assert_eq!(KIND_GIFT_WRAP, 21059);
    }
}
