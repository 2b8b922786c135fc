//! Per-process table of in-flight request cancellation tokens.
//!
//! The registry maps a request id to the [`CancellationToken`] governing its
//! generation. It is fed from two directions: the request consumer registers a
//! token when it starts working on a request, and the cancellation consumer
//! cancels (or pre-cancels) tokens as broadcasts arrive. Either side may come
//! first.
//!
//! ## Eviction
//!
//! Every insertion is stamped with a monotonic sequence number and a
//! monotonic timestamp, both taken while the lock is held, and appended to an
//! insertion-ordered log. The sweep walks that log from the oldest stamp and
//! stops at the first one younger than the configured lifetime, so a sweep
//! costs only what it evicts. A stamp whose sequence number no longer matches
//! the live entry (the id was released or overwritten since) is discarded
//! without touching the newer entry.
//!
//! Eviction is silent: an evicted token is dropped from the table but is not
//! cancelled.

use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

pub struct CancellationRegistry {
    lifetime: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<Stamp>,
    next_seq: u64,
}

struct Entry {
    token: CancellationToken,
    seq: u64,
}

struct Stamp {
    seq: u64,
    key: String,
    created_at: Instant,
}

impl Inner {
    fn insert(&mut self, key: &str, token: CancellationToken) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key.to_owned(), Entry { token, seq });
        self.order.push_back(Stamp {
            seq,
            key: key.to_owned(),
            created_at: Instant::now(),
        });
        seq
    }
}

/// Outcome of [`CancellationRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// This call inserted the token; hand the ticket back to
    /// [`CancellationRegistry::release`] when the request is done.
    Fresh(Ticket),
    /// An entry already existed: either a cancellation arrived first or the
    /// same request is being handled elsewhere in this process.
    Existing(CancellationToken),
}

/// Proof of a successful [`CancellationRegistry::register`].
#[derive(Debug)]
pub struct Ticket {
    key: String,
    seq: u64,
    token: CancellationToken,
}

impl Ticket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn request_id(&self) -> &str {
        &self.key
    }
}

impl CancellationRegistry {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Insert `token` under `id`, replacing any existing entry.
    pub fn put(&self, id: &str, token: CancellationToken) {
        self.inner.lock().insert(id, token);
    }

    pub fn get(&self, id: &str) -> Option<CancellationToken> {
        self.inner.lock().entries.get(id).map(|e| e.token.clone())
    }

    /// Insert a child of `parent` under `id` unless an entry already exists.
    pub fn register(&self, id: &str, parent: &CancellationToken) -> Registration {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(id) {
            return Registration::Existing(entry.token.clone());
        }

        let token = parent.child_token();
        let seq = inner.insert(id, token.clone());
        Registration::Fresh(Ticket {
            key: id.to_owned(),
            seq,
            token,
        })
    }

    /// Cancel the token registered under `id`. When there is none yet, a
    /// pre-cancelled token is left behind so a later [`Self::register`] sees
    /// it. Returns whether a token was already registered.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(id) {
            entry.token.cancel();
            return true;
        }

        let token = CancellationToken::new();
        token.cancel();
        inner.insert(id, token);
        false
    }

    /// Remove the entry created by `ticket`, unless it has been replaced since.
    pub fn release(&self, ticket: &Ticket) {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .get(&ticket.key)
            .is_some_and(|e| e.seq == ticket.seq)
        {
            inner.entries.remove(&ticket.key);
        }
    }

    pub fn remove(&self, id: &str) -> Option<CancellationToken> {
        self.inner.lock().entries.remove(id).map(|e| e.token)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every entry at least `lifetime` old as of `now`. Returns the
    /// number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;

        while let Some(stamp) = inner.order.front() {
            if now.saturating_duration_since(stamp.created_at) < self.lifetime {
                break;
            }
            let Some(stamp) = inner.order.pop_front() else {
                break;
            };
            if inner
                .entries
                .get(&stamp.key)
                .is_some_and(|e| e.seq == stamp.seq)
            {
                inner.entries.remove(&stamp.key);
                evicted += 1;
            }
        }

        evicted
    }

    /// Run [`Self::sweep`] every `tick` until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, tick: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = registry.sweep(Instant::now());
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = registry.len(), "Swept expired cancellation tokens");
                        }
                    }
                }
            }

            tracing::trace!("Cancellation sweeper stopped");
        })
    }
}
