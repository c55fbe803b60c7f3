// ABOUTME: Correlation registry mapping session keys to pending reply waiters.
// ABOUTME: Map and expiry queue share one mutex so they are always updated in lock-step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::expiry::{ExpiryHandle, ExpiryQueue};
use crate::session::SessionKey;

/// Reply produced by the flow engine for a waiting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// The user is expected to answer; the session stays open.
    pub expects_response: bool,
}

/// One in-flight "waiting for a reply" slot.
#[derive(Debug)]
pub struct Correlation {
    id: u64,
    key: SessionKey,
    request: String,
    opened_at: Instant,
    reply_tx: mpsc::Sender<Reply>,
    reply_rx: tokio::sync::Mutex<mpsc::Receiver<Reply>>,
}

impl Correlation {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Raw text of the request that opened the session.
    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Wait for the next reply. Concurrent waiters on the same session queue
    /// up on the receiver and are served one reply each.
    pub async fn recv(&self) -> Option<Reply> {
        self.reply_rx.lock().await.recv().await
    }

    /// Take a reply that is already buffered, without waiting.
    pub fn try_recv(&self) -> Option<Reply> {
        self.reply_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Drop replies buffered before a new turn started. Skipped while another
    /// request is waiting, since those replies belong to it.
    pub fn discard_stale(&self) -> usize {
        let Ok(mut rx) = self.reply_rx.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Result of delivering a reply to the registry.
#[derive(Debug)]
pub enum Delivery {
    Delivered(Arc<Correlation>),
    NoSession,
    BufferFull,
}

/// Counts of registry entries and scheduled expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: usize,
    pub scheduled: usize,
}

struct Entry {
    correlation: Arc<Correlation>,
    handle: ExpiryHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<SessionKey, Entry>,
    expiry: ExpiryQueue<SessionKey>,
    next_id: u64,
}

impl State {
    fn remove_entry(&mut self, key: &SessionKey) -> Option<Arc<Correlation>> {
        let entry = self.entries.remove(key)?;
        self.expiry.remove(entry.handle);
        Some(entry.correlation)
    }
}

/// Session key → pending correlation, with expiry tracking.
///
/// Every operation takes the single state lock for its whole duration and
/// never holds it across an await point.
pub struct CorrelationRegistry {
    state: Mutex<State>,
    reply_buffer: usize,
}

impl CorrelationRegistry {
    /// `reply_buffer` is the per-session reply capacity; zero is raised to one.
    pub fn new(reply_buffer: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            reply_buffer: reply_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the existing correlation for `key`, or register a new one
    /// expiring at `expires_at`. The boolean is true when it was created.
    ///
    /// An existing entry keeps its schedule; callers extend it with
    /// [`CorrelationRegistry::reschedule`].
    pub fn get_or_create(
        &self,
        key: &SessionKey,
        request: &str,
        expires_at: Instant,
    ) -> (Arc<Correlation>, bool) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get(key) {
            return (Arc::clone(&entry.correlation), false);
        }

        let (reply_tx, reply_rx) = mpsc::channel(self.reply_buffer);
        let id = state.next_id;
        state.next_id += 1;
        let correlation = Arc::new(Correlation {
            id,
            key: key.clone(),
            request: request.to_string(),
            opened_at: Instant::now(),
            reply_tx,
            reply_rx: tokio::sync::Mutex::new(reply_rx),
        });
        let handle = state.expiry.push(key.clone(), expires_at);
        state.entries.insert(
            key.clone(),
            Entry {
                correlation: Arc::clone(&correlation),
                handle,
            },
        );
        (correlation, true)
    }

    /// Extend the expiry of `key`. Expiry never moves backwards.
    pub fn reschedule(&self, key: &SessionKey, expires_at: Instant) -> bool {
        let mut state = self.lock();
        let Some(handle) = state.entries.get(key).map(|e| e.handle) else {
            return false;
        };
        match state.expiry.expires_at(handle) {
            Some(current) if current >= expires_at => true,
            Some(_) => state.expiry.reschedule(handle, expires_at),
            None => false,
        }
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<Correlation>> {
        self.lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.correlation))
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn expires_at(&self, key: &SessionKey) -> Option<Instant> {
        let state = self.lock();
        let handle = state.entries.get(key)?.handle;
        state.expiry.expires_at(handle)
    }

    /// Remove `key` from both the map and the expiry queue.
    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Correlation>> {
        self.lock().remove_entry(key)
    }

    /// Remove `correlation` only if it is still the one registered for its
    /// key, so a finished request never evicts a successor session.
    pub fn remove_if_current(&self, correlation: &Correlation) -> bool {
        let mut state = self.lock();
        let current = state
            .entries
            .get(&correlation.key)
            .is_some_and(|entry| entry.correlation.id == correlation.id);
        if current {
            state.remove_entry(&correlation.key);
        }
        current
    }

    /// Hand a reply to the waiter for `key` without ever blocking.
    ///
    /// The send happens under the registry lock, so once a waiter has removed
    /// its entry no further reply can land in its buffer.
    pub fn deliver(&self, key: &SessionKey, reply: Reply) -> Delivery {
        let state = self.lock();
        let Some(entry) = state.entries.get(key) else {
            return Delivery::NoSession;
        };
        match entry.correlation.reply_tx.try_send(reply) {
            Ok(()) => Delivery::Delivered(Arc::clone(&entry.correlation)),
            Err(TrySendError::Full(_)) => Delivery::BufferFull,
            // The receiver lives inside the correlation, so this only happens
            // if the entry is being torn down concurrently.
            Err(TrySendError::Closed(_)) => Delivery::NoSession,
        }
    }

    /// Pop every entry whose expiry is at or before `now` and unregister it.
    pub fn sweep(&self, now: Instant) -> Vec<SessionKey> {
        let mut state = self.lock();
        let mut evicted = Vec::new();
        while let Some(key) = state.expiry.pop_expired(now) {
            state.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of both structures, taken under one lock acquisition.
    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        RegistryStats {
            registered: state.entries.len(),
            scheduled: state.expiry.len(),
        }
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("CorrelationRegistry")
            .field("registered", &stats.registered)
            .field("scheduled", &stats.scheduled)
            .field("reply_buffer", &self.reply_buffer)
            .finish()
    }
}
