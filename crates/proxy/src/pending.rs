//! The pending-response table.
//!
//! One entry per in-flight request, keyed by `(request id, destination
//! public key)`. Ingress inserts response parts; when the stored count
//! reaches the expected total the entry is removed, the body assembled
//! and the waiting HTTP handler resolved. Every removal path — the
//! timeout timer, completion, client disconnect, shutdown — runs the
//! unpin hook exactly once, because only the path that actually takes
//! the entry out of the map runs it.

use hornet_core::{ResponseMessage, assemble_body};
use hornet_client::RelayPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// `(request id, destination public key)`
pub type PendingKey = (String, String);

/// A fully reassembled tunneled response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// How a pending request resolved.
#[derive(Debug)]
pub enum PendingOutcome {
    Completed(AssembledResponse),
    TimedOut,
}

/// What happened to an inserted part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// No entry for this key; the part was dropped
    NoPending,
    /// Stored, more parts expected
    Stored,
    /// This index was already present; dropped
    Duplicate,
    /// The part index was not valid for the expected part count
    OutOfRange,
    /// Last part arrived; the response was assembled and delivered
    Completed,
}

struct PendingEntry {
    messages: BTreeMap<u64, ResponseMessage>,
    /// Expected part count, fixed by the first part to arrive
    parts: Option<u64>,
    responder: oneshot::Sender<PendingOutcome>,
    /// Armed right after insertion; absent only in that window
    timer: Option<JoinHandle<()>>,
}

impl PendingEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Table of requests still waiting on their responses.
pub struct PendingTable {
    entries: Mutex<HashMap<PendingKey, PendingEntry>>,
    pool: Arc<RelayPool>,
}

impl PendingTable {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pool,
        }
    }

    /// Register a request and arm its timeout.
    ///
    /// The returned receiver resolves with the assembled response or
    /// [`PendingOutcome::TimedOut`]; it is dropped without a value when
    /// the entry is removed for any other reason.
    pub fn insert(self: &Arc<Self>, key: PendingKey, timeout: Duration) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();

        let entry = PendingEntry {
            messages: BTreeMap::new(),
            parts: None,
            responder: tx,
            timer: None,
        };
        let replaced = self
            .entries
            .lock()
            .map(|mut entries| entries.insert(key.clone(), entry))
            .ok()
            .flatten();
        if let Some(mut old) = replaced {
            // A uuid collision would be astonishing; drop the old waiter.
            warn!(request_id = %key.0, "replaced existing pending entry");
            old.cancel_timer();
        }

        // Arm the timeout only once the entry is visible, so an
        // immediate expiry cannot race past a not-yet-inserted entry.
        let table = Arc::clone(self);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(&timer_key).await;
        });
        if let Ok(mut entries) = self.entries.lock() {
            match entries.get_mut(&key) {
                Some(entry) => entry.timer = Some(timer),
                None => timer.abort(),
            }
        }
        rx
    }

    /// Insert one response part; completes the request when the stored
    /// count reaches the expected total. Idempotent per part index.
    pub async fn insert_part(&self, key: &PendingKey, message: ResponseMessage) -> InsertOutcome {
        let completed = {
            let Ok(mut entries) = self.entries.lock() else {
                return InsertOutcome::NoPending;
            };
            let Some(entry) = entries.get_mut(key) else {
                return InsertOutcome::NoPending;
            };

            let parts = *entry.parts.get_or_insert(message.parts);
            if message.part_index >= parts {
                return InsertOutcome::OutOfRange;
            }
            if entry.messages.contains_key(&message.part_index) {
                return InsertOutcome::Duplicate;
            }
            entry.messages.insert(message.part_index, message);
            if entry.messages.len() as u64 != parts {
                return InsertOutcome::Stored;
            }
            entries.remove(key)
        };

        if let Some(mut entry) = completed {
            entry.cancel_timer();
            self.pool.unpin(&key.0).await;
            match assemble(entry.messages) {
                Some(response) => {
                    debug!(request_id = %key.0, status = response.status, "response complete");
                    let _ = entry.responder.send(PendingOutcome::Completed(response));
                }
                // Dropping the responder surfaces as an internal failure
                // on the HTTP side.
                None => error!(request_id = %key.0, "failed to assemble response"),
            }
            return InsertOutcome::Completed;
        }
        InsertOutcome::Stored
    }

    /// Timer path: resolve the request as timed out.
    async fn expire(&self, key: &PendingKey) {
        let entry = self
            .entries
            .lock()
            .map(|mut entries| entries.remove(key))
            .ok()
            .flatten();
        if let Some(entry) = entry {
            self.pool.unpin(&key.0).await;
            warn!(request_id = %key.0, "request timed out");
            let _ = entry.responder.send(PendingOutcome::TimedOut);
        }
    }

    /// Remove an entry without resolving it (client disconnect, shutdown).
    pub async fn remove(&self, key: &PendingKey) {
        let entry = self
            .entries
            .lock()
            .map(|mut entries| entries.remove(key))
            .ok()
            .flatten();
        if let Some(mut entry) = entry {
            entry.cancel_timer();
            self.pool.unpin(&key.0).await;
            debug!(request_id = %key.0, "pending entry removed");
        }
    }

    /// Whether an entry exists for this key.
    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concatenate parts in index order, decode the body, and lift part 0's
/// status and headers.
fn assemble(messages: BTreeMap<u64, ResponseMessage>) -> Option<AssembledResponse> {
    let first = messages.get(&0)?;
    let status = u16::try_from(first.status?).ok()?;
    let headers = first.headers.clone()?;

    let bodies: Vec<String> = messages.values().map(|m| m.body_base64.clone()).collect();
    let body = assemble_body(&bodies).ok()?;
    Some(AssembledResponse {
        status,
        headers,
        body,
    })
}
