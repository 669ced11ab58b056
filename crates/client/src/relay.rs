//! Single relay connection management.
//!
//! One [`RelayConnection`] owns one WebSocket: connecting with bounded
//! exponential backoff, the open subscription, publishing, and the set
//! of in-flight request ids that pin the connection against eviction.
//!
//! Incoming events stream into an injected sink after an
//! already-handled pre-check, so reconnections and overlapping
//! subscriptions never reprocess an event the consumer has seen.

use crate::error::{ClientError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hornet_core::Event;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

static SUB_SEQ: AtomicU64 = AtomicU64::new(1);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect in progress
    Connecting,
    /// Connected; subscriptions and publishes are accepted
    Open,
    /// Close requested
    Closing,
    /// Closed (never connected, read error, or closed)
    Closed,
}

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Connect attempts before giving up
    pub max_connect_attempts: u32,
    /// First retry delay; doubles per attempt
    pub initial_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// The one subscription filter this system ever sends.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u16>,
    #[serde(rename = "#p")]
    pub p_tags: Vec<String>,
    pub since: u64,
}

/// An event delivered by some relay's subscription.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub relay_url: String,
    pub event: Event,
}

/// Where subscription events go.
pub type EventSink = mpsc::UnboundedSender<IncomingEvent>;

/// Pre-check invoked with the event id before forwarding; returning
/// `true` drops the event at the connection.
pub type DedupHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Normalize a relay URL: lowercase scheme/host, strip a default port,
/// strip the trailing slash of an empty path.
pub fn normalize_relay_url(input: &str) -> Result<String> {
    let url = Url::parse(input.trim())
        .map_err(|e| ClientError::InvalidUrl(format!("{input}: {e}")))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "{input}: scheme must be ws or wss"
        )));
    }
    let mut normalized = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        normalized.pop();
    }
    Ok(normalized)
}

/// One WebSocket to one relay.
pub struct RelayConnection {
    url: String,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<WsSink>>>,
    subscription: Arc<Mutex<Option<String>>>,
    pins: StdMutex<HashSet<String>>,
}

impl RelayConnection {
    /// Create a connection for a (normalized) relay URL. Does not connect.
    pub fn new(url: &str, config: RelayConfig) -> Result<Self> {
        Ok(Self {
            url: normalize_relay_url(url)?,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Closed)),
            writer: Arc::new(Mutex::new(None)),
            subscription: Arc::new(Mutex::new(None)),
            pins: StdMutex::new(HashSet::new()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Connect with bounded exponential backoff, then spawn the reader.
    ///
    /// Events pass `dedup` first and then go to `sink`. A connection
    /// that never reaches `Open` surfaces the last connect error.
    pub async fn connect(&self, sink: EventSink, dedup: DedupHook) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Closed {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        let mut backoff = self.config.initial_backoff;
        let mut last_err = ClientError::Timeout("no connect attempts".to_string());
        for attempt in 1..=self.config.max_connect_attempts {
            match timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(Ok((stream, _response))) => {
                    let (ws_tx, ws_rx) = stream.split();
                    *self.writer.lock().await = Some(ws_tx);
                    *self.state.write().await = ConnectionState::Open;
                    self.spawn_reader(ws_rx, sink, dedup);
                    info!(relay = %self.url, "connected");
                    return Ok(());
                }
                Ok(Err(e)) => last_err = ClientError::WebSocket(e.to_string()),
                Err(_) => {
                    last_err = ClientError::Timeout(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    ))
                }
            }
            debug!(relay = %self.url, attempt, error = %last_err, "connect attempt failed");
            if attempt < self.config.max_connect_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }

        *self.state.write().await = ConnectionState::Closed;
        Err(last_err)
    }

    fn spawn_reader(&self, mut ws_rx: SplitStream<WsStream>, sink: EventSink, dedup: DedupHook) {
        let url = self.url.clone();
        let state = Arc::clone(&self.state);
        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            loop {
                let msg = match ws_rx.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(relay = %url, error = %e, "read error");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if let Some((sub_id, event)) = parse_event_message(&text) {
                            if dedup(&event.id) {
                                debug!(relay = %url, id = %event.id, "already handled, dropping");
                                continue;
                            }
                            debug!(relay = %url, sub = %sub_id, id = %event.id, "event");
                            if sink
                                .send(IncomingEvent {
                                    relay_url: url.clone(),
                                    event,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let mut writer = writer.lock().await;
                        if let Some(ws_tx) = writer.as_mut() {
                            let _ = ws_tx.send(Message::Pong(payload)).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Closed;
            debug!(relay = %url, "reader finished");
        });
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open().await {
            return Err(ClientError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(ws_tx) => ws_tx
                .send(Message::Text(text))
                .await
                .map_err(|e| ClientError::WebSocket(e.to_string())),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Publish an event: `["EVENT", event]`. Fails fast when not Open.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let msg = serde_json::to_string(&json!(["EVENT", event]))?;
        self.send_text(msg).await
    }

    /// Open a subscription with `filter`, replacing any previous one.
    ///
    /// The new REQ goes out before the old CLOSE so there is no gap in
    /// coverage across a rewind.
    pub async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<()> {
        let sub_id = format!("sub{}", SUB_SEQ.fetch_add(1, Ordering::Relaxed));
        let req = serde_json::to_string(&json!(["REQ", sub_id, filter]))?;
        self.send_text(req).await?;

        let previous = {
            let mut current = self.subscription.lock().await;
            current.replace(sub_id)
        };
        if let Some(old_id) = previous {
            let close = serde_json::to_string(&json!(["CLOSE", old_id]))?;
            // A failed CLOSE only leaks a server-side subscription.
            if let Err(e) = self.send_text(close).await {
                debug!(relay = %self.url, error = %e, "failed to close old subscription");
            }
        }
        Ok(())
    }

    /// Close the WebSocket.
    pub async fn close(&self) {
        *self.state.write().await = ConnectionState::Closing;
        let mut writer = self.writer.lock().await;
        if let Some(mut ws_tx) = writer.take() {
            let _ = ws_tx.send(Message::Close(None)).await;
            let _ = ws_tx.close().await;
        }
        drop(writer);
        *self.state.write().await = ConnectionState::Closed;
        info!(relay = %self.url, "closed");
    }

    /// Pin an in-flight request id to this connection.
    pub fn pin(&self, request_id: &str) {
        if let Ok(mut pins) = self.pins.lock() {
            pins.insert(request_id.to_string());
        }
    }

    /// Remove a pin. Returns whether it was present.
    pub fn unpin(&self, request_id: &str) -> bool {
        self.pins
            .lock()
            .map(|mut pins| pins.remove(request_id))
            .unwrap_or(false)
    }

    pub fn pinned_count(&self) -> usize {
        self.pins.lock().map(|pins| pins.len()).unwrap_or(0)
    }
}

/// Parse `["EVENT", sub_id, event]`; other relay messages are ignored.
fn parse_event_message(text: &str) -> Option<(String, Event)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    match arr.first()?.as_str()? {
        "EVENT" if arr.len() >= 3 => {
            let sub_id = arr[1].as_str()?.to_string();
            let event: Event = serde_json::from_value(arr[2].clone()).ok()?;
            Some((sub_id, event))
        }
        "NOTICE" => {
            debug!(notice = ?arr.get(1), "relay notice");
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_strips_default_port() {
        assert_eq!(
            normalize_relay_url("WSS://Relay.Example.COM:443/").unwrap(),
            "wss://relay.example.com"
        );
        assert_eq!(
            normalize_relay_url("ws://relay.example.com:80").unwrap(),
            "ws://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_keeps_nondefault_port_and_path() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:7777").unwrap(),
            "wss://relay.example.com:7777"
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/inbox").unwrap(),
            "wss://relay.example.com/inbox"
        );
    }

    #[test]
    fn test_normalize_rejects_non_websocket_scheme() {
        assert!(normalize_relay_url("https://relay.example.com").is_err());
        assert!(normalize_relay_url("not a url").is_err());
    }

    #[test]
    fn test_filter_serialization() {
        let filter = SubscriptionFilter {
            kinds: vec![21059],
            p_tags: vec!["ab".repeat(32)],
            since: 123,
        };
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"kinds\":[21059]"));
        assert!(json.contains("\"#p\":["));
        assert!(json.contains("\"since\":123"));
    }

    #[test]
    fn test_parse_event_message() {
        let text = r#"["EVENT","sub1",{"id":"abc","pubkey":"def","created_at":123,"kind":21059,"tags":[],"content":"x","sig":"00"}]"#;
        let (sub_id, event) = parse_event_message(text).unwrap();
        assert_eq!(sub_id, "sub1");
        assert_eq!(event.kind, 21059);
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        assert!(parse_event_message(r#"["EOSE","sub1"]"#).is_none());
        assert!(parse_event_message(r#"["NOTICE","slow down"]"#).is_none());
        assert!(parse_event_message("not json").is_none());
    }

    #[test]
    fn test_pins() {
        let conn = RelayConnection::new("wss://relay.example.com", RelayConfig::default()).unwrap();
        assert_eq!(conn.pinned_count(), 0);
        conn.pin("r1");
        conn.pin("r2");
        conn.pin("r1");
        assert_eq!(conn.pinned_count(), 2);
        assert!(conn.unpin("r1"));
        assert!(!conn.unpin("r1"));
        assert_eq!(conn.pinned_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_fast_when_closed() {
        let conn = RelayConnection::new("wss://relay.example.com", RelayConfig::default()).unwrap();
        let event = Event {
            id: "0".repeat(64),
            pubkey: "0".repeat(64),
            created_at: 0,
            kind: 21059,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        };
        assert!(matches!(
            conn.publish(&event).await,
            Err(ClientError::NotConnected)
        ));
    }
}
