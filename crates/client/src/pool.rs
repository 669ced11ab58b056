//! Relay pool: the fixed initial set plus a bounded LRU of hint relays.
//!
//! `nprofile` destinations carry relay hints that are often the only
//! relays the destination actually reads, so the pool connects to them
//! opportunistically and keeps the connection warm for later requests.
//! Each hint entry is pinned by the request ids currently using it; an
//! entry is evictable only when its pin set is empty, so the list may
//! temporarily exceed the configured bound.

use crate::error::Result;
use crate::relay::{
    DedupHook, EventSink, RelayConfig, RelayConnection, SubscriptionFilter, normalize_relay_url,
};
use hornet_core::{Event, KIND_GIFT_WRAP};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hint-relay LRU capacity
    pub max_cached_relays: usize,
    /// Per-connection settings
    pub relay: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_cached_relays: 10,
            relay: RelayConfig::default(),
        }
    }
}

/// The set of relay connections this proxy talks to.
pub struct RelayPool {
    proxy_pubkey: String,
    config: PoolConfig,
    initial: Vec<Arc<RelayConnection>>,
    initial_urls: HashSet<String>,
    /// MRU at the tail
    hints: Mutex<Vec<Arc<RelayConnection>>>,
    /// `since` used for any newly opened subscription
    since: AtomicU64,
    /// Sink + dedup hook shared by every connection, set by `subscribe_ingest`
    ingest: StdMutex<Option<(EventSink, DedupHook)>>,
}

impl RelayPool {
    /// Build the pool around the initial relay set. Does not connect.
    pub fn new(initial_urls: &[String], proxy_pubkey: &str, config: PoolConfig) -> Result<Self> {
        let mut initial = Vec::with_capacity(initial_urls.len());
        let mut seen = HashSet::new();
        for url in initial_urls {
            let normalized = normalize_relay_url(url)?;
            if seen.insert(normalized.clone()) {
                initial.push(Arc::new(RelayConnection::new(
                    &normalized,
                    config.relay.clone(),
                )?));
            }
        }
        Ok(Self {
            proxy_pubkey: proxy_pubkey.to_string(),
            config,
            initial,
            initial_urls: seen,
            hints: Mutex::new(Vec::new()),
            since: AtomicU64::new(0),
            ingest: StdMutex::new(None),
        })
    }

    fn filter(&self, since: u64) -> SubscriptionFilter {
        SubscriptionFilter {
            kinds: vec![KIND_GIFT_WRAP],
            p_tags: vec![self.proxy_pubkey.clone()],
            since,
        }
    }

    fn ingest_handles(&self) -> Option<(EventSink, DedupHook)> {
        self.ingest.lock().ok().and_then(|guard| guard.clone())
    }

    /// Connect every initial relay and open the shared subscription.
    ///
    /// Per-relay failures are logged, not fatal; the caller decides
    /// whether enough connections came up.
    pub async fn subscribe_ingest(&self, sink: EventSink, dedup: DedupHook, since: u64) {
        self.since.store(since, Ordering::Relaxed);
        if let Ok(mut guard) = self.ingest.lock() {
            *guard = Some((sink.clone(), Arc::clone(&dedup)));
        }
        let filter = self.filter(since);
        for conn in &self.initial {
            if let Err(e) = conn.connect(sink.clone(), Arc::clone(&dedup)).await {
                warn!(relay = %conn.url(), error = %e, "initial relay connect failed");
                continue;
            }
            if let Err(e) = conn.subscribe(&filter).await {
                warn!(relay = %conn.url(), error = %e, "initial relay subscribe failed");
            }
        }
    }

    /// Fan out a publish to every initial and cached hint relay.
    ///
    /// Returns how many publishes succeeded; failures are logged per
    /// relay and never retried.
    pub async fn publish(&self, event: &Event) -> usize {
        let mut targets: Vec<Arc<RelayConnection>> = self.initial.clone();
        targets.extend(self.hints.lock().await.iter().cloned());

        let mut ok = 0;
        for conn in targets {
            match conn.publish(event).await {
                Ok(()) => ok += 1,
                Err(e) => warn!(relay = %conn.url(), error = %e, "publish failed"),
            }
        }
        ok
    }

    /// Mark a hint relay as used by `request_id`, opening it if needed.
    ///
    /// An existing entry moves to most-recently-used; a new entry is
    /// connected, subscribed, inserted at MRU and pinned before any
    /// eviction can consider it.
    pub async fn touch_hint(&self, url: &str, request_id: &str) -> Result<()> {
        let normalized = normalize_relay_url(url)?;
        if self.initial_urls.contains(&normalized) {
            return Ok(());
        }

        {
            let mut hints = self.hints.lock().await;
            if let Some(pos) = hints.iter().position(|c| c.url() == normalized) {
                let conn = hints.remove(pos);
                conn.pin(request_id);
                hints.push(conn);
                return Ok(());
            }
        }

        let conn = Arc::new(RelayConnection::new(&normalized, self.config.relay.clone())?);
        if let Some((sink, dedup)) = self.ingest_handles() {
            // A hint that fails to connect is still cached and pinned so
            // unpin accounting stays uniform; publishes to it fail fast.
            match conn.connect(sink, dedup).await {
                Ok(()) => {
                    let since = self.since.load(Ordering::Relaxed);
                    if let Err(e) = conn.subscribe(&self.filter(since)).await {
                        warn!(relay = %normalized, error = %e, "hint relay subscribe failed");
                    }
                }
                Err(e) => warn!(relay = %normalized, error = %e, "hint relay connect failed"),
            }
        }

        let to_close = {
            let mut hints = self.hints.lock().await;
            // Re-check: a concurrent request may have inserted this URL
            // while we were connecting.
            if let Some(pos) = hints.iter().position(|c| c.url() == normalized) {
                let existing = hints.remove(pos);
                existing.pin(request_id);
                hints.push(existing);
                vec![conn]
            } else {
                conn.pin(request_id);
                hints.push(conn);
                info!(relay = %normalized, "cached hint relay");
                Self::evict_locked(&mut hints, self.config.max_cached_relays)
            }
        };
        for conn in to_close {
            conn.close().await;
        }
        Ok(())
    }

    /// Drop `request_id` from every pin set, then evict.
    pub async fn unpin(&self, request_id: &str) {
        let to_close = {
            let mut hints = self.hints.lock().await;
            for conn in hints.iter() {
                if conn.unpin(request_id) {
                    debug!(relay = %conn.url(), request_id, "unpinned");
                }
            }
            Self::evict_locked(&mut hints, self.config.max_cached_relays)
        };
        for conn in to_close {
            conn.close().await;
        }
    }

    /// Evict least-recently-used unpinned entries over capacity.
    pub async fn evict(&self) {
        let to_close = {
            let mut hints = self.hints.lock().await;
            Self::evict_locked(&mut hints, self.config.max_cached_relays)
        };
        for conn in to_close {
            conn.close().await;
        }
    }

    fn evict_locked(
        hints: &mut Vec<Arc<RelayConnection>>,
        max: usize,
    ) -> Vec<Arc<RelayConnection>> {
        let mut removed = Vec::new();
        while hints.len() > max {
            match hints.iter().position(|c| c.pinned_count() == 0) {
                Some(pos) => {
                    let conn = hints.remove(pos);
                    info!(relay = %conn.url(), "evicting hint relay");
                    removed.push(conn);
                }
                // Everything is pinned; the list stays over budget for now.
                None => break,
            }
        }
        removed
    }

    /// Re-open every subscription (initial and hints) with a new `since`.
    pub async fn rewind(&self, since: u64) {
        self.since.store(since, Ordering::Relaxed);
        let filter = self.filter(since);
        let mut targets: Vec<Arc<RelayConnection>> = self.initial.clone();
        targets.extend(self.hints.lock().await.iter().cloned());
        for conn in targets {
            if !conn.is_open().await {
                continue;
            }
            if let Err(e) = conn.subscribe(&filter).await {
                warn!(relay = %conn.url(), error = %e, "rewind subscribe failed");
            }
        }
    }

    /// Number of initial relays currently Open.
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for conn in &self.initial {
            if conn.is_open().await {
                count += 1;
            }
        }
        count
    }

    /// Initial relay URLs, in configuration order.
    pub fn initial_urls(&self) -> Vec<String> {
        self.initial.iter().map(|c| c.url().to_string()).collect()
    }

    /// Currently cached hint URLs, LRU first.
    pub async fn cached_urls(&self) -> Vec<String> {
        self.hints
            .lock()
            .await
            .iter()
            .map(|c| c.url().to_string())
            .collect()
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        for conn in &self.initial {
            conn.close().await;
        }
        let hints: Vec<_> = self.hints.lock().await.drain(..).collect();
        for conn in hints {
            conn.close().await;
        }
    }

    /// Whether this URL (normalized) is one of the initial relays.
    pub fn is_initial(&self, url: &str) -> bool {
        normalize_relay_url(url)
            .map(|normalized| self.initial_urls.contains(&normalized))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("initial", &self.initial_urls)
            .field("max_cached_relays", &self.config.max_cached_relays)
            .finish()
    }
}
