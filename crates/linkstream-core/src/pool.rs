//! Pool of authenticated upstream connections
//!
//! Every configured credential becomes one [`ClientHandle`] owned by the
//! pool. Requests borrow a handle through a [`ClientLease`], which only keeps
//! a weak reference to the connection: shutting the pool down invalidates
//! leases that are still in flight.

use crate::{CoreError, Result};
use linkstream_upstream::{Credential, UpstreamClient};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pool tuning
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Concurrent streams a single client may serve (at least 1)
    pub max_streams_per_client: usize,
    /// First delay when waiting on a blocked pool
    pub backoff_base: Duration,
    /// Upper bound for the wait delay
    pub backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_streams_per_client: 16,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

/// Selection state of a handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Available,
    FloodWaited { until: Instant },
    Disabled,
}

/// Capacity changes reported to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    FloodWaited { client_id: usize, seconds: u64 },
    Recovered { client_id: usize },
    Disabled { client_id: usize, remaining: usize },
    Exhausted,
}

/// Why `acquire` could not hand out a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Every usable client is flood-waited or at its stream cap
    Blocked { retry_after: Option<Duration> },
    /// No usable client is left (all disabled, or the pool was shut down)
    Exhausted,
}

struct ClientHandle {
    id: usize,
    credential: Credential,
    dc_id: u32,
    state: HandleState,
    last_used_at: Option<Instant>,
    active_streams: usize,
    client: Option<Arc<dyn UpstreamClient>>,
}

impl ClientHandle {
    fn is_usable(&self) -> bool {
        self.client.is_some() && self.state != HandleState::Disabled
    }
}

struct PoolShared {
    handles: Mutex<Vec<ClientHandle>>,
    released: Notify,
    events: broadcast::Sender<PoolEvent>,
    config: PoolConfig,
}

impl PoolShared {
    fn release_slot(&self, id: usize) {
        {
            let mut handles = self.handles.lock();
            if let Some(handle) = handles.get_mut(id) {
                handle.active_streams = handle.active_streams.saturating_sub(1);
                debug!(client_id = id, active = handle.active_streams, "client released");
            }
        }
        self.released.notify_waiters();
    }

    fn emit(&self, event: PoolEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Point-in-time view of one handle, for status reporting
#[derive(Clone, Debug, Serialize)]
pub struct ClientSnapshot {
    pub id: usize,
    pub credential: String,
    pub dc_id: u32,
    pub state: &'static str,
    pub flood_wait_remaining_secs: Option<u64>,
    pub active_streams: usize,
}

/// Shared pool of upstream clients
#[derive(Clone)]
pub struct ClientPool {
    shared: Arc<PoolShared>,
}

impl ClientPool {
    /// Build a pool with one handle per connection
    pub fn new(config: PoolConfig, clients: Vec<(Credential, Arc<dyn UpstreamClient>)>) -> Self {
        let config = PoolConfig {
            max_streams_per_client: config.max_streams_per_client.max(1),
            ..config
        };
        let handles: Vec<_> = clients
            .into_iter()
            .enumerate()
            .map(|(id, (credential, client))| ClientHandle {
                id,
                dc_id: client.dc_id(),
                credential,
                state: HandleState::Available,
                last_used_at: None,
                active_streams: 0,
                client: Some(client),
            })
            .collect();

        info!(
            clients = handles.len(),
            max_streams_per_client = config.max_streams_per_client,
            "client pool initialized"
        );

        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(PoolShared {
                handles: Mutex::new(handles),
                released: Notify::new(),
                events,
                config,
            }),
        }
    }

    /// Total number of handles, usable or not
    pub fn len(&self) -> usize {
        self.shared.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles that are neither disabled nor shut down
    pub fn usable_count(&self) -> usize {
        self.shared.handles.lock().iter().filter(|h| h.is_usable()).count()
    }

    /// True when no handle can ever be selected again
    pub fn is_exhausted(&self) -> bool {
        self.usable_count() == 0
    }

    /// Subscribe to capacity events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Select a client for a new request.
    ///
    /// Prefers `preferred_dc` when a matching client is free, otherwise any
    /// free client. Among candidates the one with the fewest active streams
    /// wins, ties going to the least recently used.
    pub fn acquire(&self, preferred_dc: Option<u32>) -> std::result::Result<ClientLease, AcquireError> {
        let now = Instant::now();
        let cap = self.shared.config.max_streams_per_client;
        let mut handles = self.shared.handles.lock();

        if !handles.iter().any(ClientHandle::is_usable) {
            return Err(AcquireError::Exhausted);
        }

        for handle in handles.iter_mut() {
            if let HandleState::FloodWaited { until } = handle.state {
                if until <= now {
                    handle.state = HandleState::Available;
                    info!(client_id = handle.id, "flood wait expired, client eligible again");
                    self.shared.emit(PoolEvent::Recovered { client_id: handle.id });
                }
            }
        }

        let pick = |dc: Option<u32>| {
            handles
                .iter()
                .filter(|h| h.is_usable() && h.state == HandleState::Available)
                .filter(|h| h.active_streams < cap)
                .filter(|h| dc.map_or(true, |dc| h.dc_id == dc))
                .min_by_key(|h| (h.active_streams, h.last_used_at))
                .map(|h| h.id)
        };

        let Some(id) = preferred_dc.and_then(|dc| pick(Some(dc))).or_else(|| pick(None)) else {
            let retry_after = handles
                .iter()
                .filter_map(|h| match h.state {
                    HandleState::FloodWaited { until } if h.client.is_some() => {
                        Some(until.saturating_duration_since(now))
                    }
                    _ => None,
                })
                .min();
            return Err(AcquireError::Blocked { retry_after });
        };

        let handle = &mut handles[id];
        let Some(client) = handle.client.as_ref().map(Arc::downgrade) else {
            return Err(AcquireError::Exhausted);
        };
        handle.active_streams += 1;
        handle.last_used_at = Some(now);
        debug!(
            client_id = id,
            dc_id = handle.dc_id,
            preferred_dc = ?preferred_dc,
            active = handle.active_streams,
            "client acquired"
        );

        Ok(ClientLease {
            pool: Arc::clone(&self.shared),
            id,
            dc_id: handle.dc_id,
            client,
            released: false,
        })
    }

    /// Acquire, waiting out a blocked pool for at most `budget`.
    ///
    /// Sleeps until the earliest flood-wait expiry or a release, bounded by an
    /// exponential backoff. Gives up with `ClientUnavailable`.
    pub async fn acquire_wait(&self, preferred_dc: Option<u32>, budget: Duration) -> Result<ClientLease> {
        let deadline = Instant::now() + budget;
        let mut backoff = self.shared.config.backoff_base;

        loop {
            // register interest before trying so a release in between is not lost
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.acquire(preferred_dc) {
                Ok(lease) => return Ok(lease),
                Err(AcquireError::Exhausted) => {
                    return Err(CoreError::ClientUnavailable(
                        "every upstream client is disabled".into(),
                    ))
                }
                Err(AcquireError::Blocked { retry_after }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoreError::ClientUnavailable(
                            "all upstream clients are busy or flood-waited".into(),
                        ));
                    }
                    let delay = retry_after
                        .map_or(backoff, |d| d.min(backoff))
                        .min(deadline - now)
                        .max(Duration::from_millis(1));
                    debug!(delay_ms = delay.as_millis() as u64, "pool blocked, waiting");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = released => {}
                    }
                    backoff = (backoff * 2).min(self.shared.config.backoff_max);
                }
            }
        }
    }

    /// Give a lease back; a lease that was already released is ignored
    pub fn release(&self, mut lease: ClientLease) {
        lease.release();
    }

    /// Put a client into cooldown for `wait`; it heals on its own afterwards
    pub fn mark_flood_wait(&self, client_id: usize, wait: Duration) {
        let until = Instant::now() + wait;
        let mut handles = self.shared.handles.lock();
        let Some(handle) = handles.get_mut(client_id) else {
            return;
        };
        match handle.state {
            HandleState::Disabled => return,
            HandleState::FloodWaited { until: current } if current >= until => return,
            _ => handle.state = HandleState::FloodWaited { until },
        }
        warn!(
            client_id,
            credential = %handle.credential.label(),
            seconds = wait.as_secs(),
            "client flood-waited"
        );
        self.shared.emit(PoolEvent::FloodWaited {
            client_id,
            seconds: wait.as_secs(),
        });
    }

    /// Permanently remove a client from selection (credential revoked)
    pub fn mark_disabled(&self, client_id: usize, reason: &str) {
        let remaining = {
            let mut handles = self.shared.handles.lock();
            let Some(handle) = handles.get_mut(client_id) else {
                return;
            };
            if handle.state == HandleState::Disabled {
                return;
            }
            handle.state = HandleState::Disabled;
            handles.iter().filter(|h| h.is_usable()).count()
        };

        warn!(client_id, remaining, reason, "client disabled, pool capacity degraded");
        self.shared.emit(PoolEvent::Disabled {
            client_id,
            remaining,
        });
        if remaining == 0 {
            error!("every upstream client is disabled, gateway unavailable");
            self.shared.emit(PoolEvent::Exhausted);
        }
        self.shared.released.notify_waiters();
    }

    /// Drop every connection. Outstanding leases fail on their next use.
    pub fn shutdown(&self) {
        let dropped = {
            let mut handles = self.shared.handles.lock();
            handles.iter_mut().filter_map(|h| h.client.take()).count()
        };
        info!(dropped, "client pool shut down");
        self.shared.emit(PoolEvent::Exhausted);
        self.shared.released.notify_waiters();
    }

    /// Status view of every handle
    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let now = Instant::now();
        self.shared
            .handles
            .lock()
            .iter()
            .map(|h| {
                let (state, remaining) = match h.state {
                    _ if h.client.is_none() => ("shut_down", None),
                    HandleState::Disabled => ("disabled", None),
                    HandleState::FloodWaited { until } if until > now => {
                        ("flood_waited", Some(until.saturating_duration_since(now).as_secs()))
                    }
                    _ => ("available", None),
                };
                ClientSnapshot {
                    id: h.id,
                    credential: h.credential.label(),
                    dc_id: h.dc_id,
                    state,
                    flood_wait_remaining_secs: remaining,
                    active_streams: h.active_streams,
                }
            })
            .collect()
    }

    /// Active streams on one client
    pub fn active_streams(&self, client_id: usize) -> Option<usize> {
        self.shared
            .handles
            .lock()
            .get(client_id)
            .map(|h| h.active_streams)
    }

    /// Current state of one client
    pub fn handle_state(&self, client_id: usize) -> Option<HandleState> {
        self.shared.handles.lock().get(client_id).map(|h| h.state)
    }
}

/// A client borrowed from the pool for one request.
///
/// Dropping the lease releases it.
pub struct ClientLease {
    pool: Arc<PoolShared>,
    id: usize,
    dc_id: u32,
    client: Weak<dyn UpstreamClient>,
    released: bool,
}

impl ClientLease {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn dc_id(&self) -> u32 {
        self.dc_id
    }

    /// Weak handle to the connection, for work that outlives a borrow
    pub fn weak_client(&self) -> Weak<dyn UpstreamClient> {
        Weak::clone(&self.client)
    }

    /// The connection, unless the pool has been shut down
    pub fn client(&self) -> Result<Arc<dyn UpstreamClient>> {
        self.client.upgrade().ok_or_else(|| {
            CoreError::ClientUnavailable(format!("client {} was shut down", self.id))
        })
    }

    /// Release the slot; later calls are no-ops
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_slot(self.id);
        }
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease")
            .field("id", &self.id)
            .field("dc_id", &self.dc_id)
            .field("released", &self.released)
            .finish()
    }
}
