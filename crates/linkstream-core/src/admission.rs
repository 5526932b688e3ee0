//! Admission control
//!
//! Every non-owner request is counted against a per-user sliding window and a
//! global one. Requests that find no headroom wait in a bounded FIFO queue for
//! their priority class until a drain pass admits them. Drain passes run on
//! every `admit`, on `drain_now`, and from the background task started by
//! [`AdmissionController::spawn_drain`], which wakes when the next window
//! event expires.
//!
//! There is no aging: `regular` entries wait as long as `authorized` traffic
//! keeps consuming the global window.

use crate::error::RejectReason;
use crate::window::SlidingWindow;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const GLOBAL_PERIOD: Duration = Duration::from_secs(60);

/// Admission precedence, highest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Bypasses every limit
    Owner,
    Authorized,
    Regular,
}

impl PriorityClass {
    /// Drain order
    pub const ALL: [PriorityClass; 3] = [Self::Owner, Self::Authorized, Self::Regular];

    fn index(self) -> usize {
        match self {
            Self::Owner => 0,
            Self::Authorized => 1,
            Self::Regular => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Authorized => "authorized",
            Self::Regular => "regular",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limiter knobs
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub enabled: bool,
    /// Per-user requests allowed within `period`
    pub max_files_per_period: usize,
    pub period: Duration,
    /// Requests per minute across all users, 0 for no global limit
    pub max_global_per_minute: usize,
    /// Per-user limit multiplier for the `authorized` class
    pub authorized_multiplier: usize,
    /// Entries allowed in each class queue
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
    /// Upper bound between background drain passes
    pub drain_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_files_per_period: 20,
            period: Duration::from_secs(60),
            max_global_per_minute: 600,
            authorized_multiplier: 2,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(120),
            drain_interval: Duration::from_secs(1),
        }
    }
}

impl AdmissionConfig {
    /// Disable limiting when a knob makes it meaningless
    pub fn validate(mut self) -> Self {
        if self.enabled {
            let problem = if self.max_files_per_period == 0 {
                Some("max_files_per_period is 0")
            } else if self.period.is_zero() {
                Some("period is 0")
            } else if self.max_queue_size == 0 {
                Some("max_queue_size is 0")
            } else {
                None
            };
            if let Some(problem) = problem {
                warn!(problem, "invalid rate limit configuration, rate limiting disabled");
                self.enabled = false;
            }
        }
        self.authorized_multiplier = self.authorized_multiplier.max(1);
        self.drain_interval = self.drain_interval.max(Duration::from_millis(10));
        self
    }

    fn user_limit(&self, class: PriorityClass) -> usize {
        match class {
            PriorityClass::Authorized => self.max_files_per_period.saturating_mul(self.authorized_multiplier),
            _ => self.max_files_per_period,
        }
    }
}

/// Outcome of [`AdmissionController::admit`]
#[derive(Debug)]
pub enum Admission {
    Admitted,
    Queued(QueueTicket),
    Rejected(RejectReason),
}

type Verdict = std::result::Result<Instant, RejectReason>;

struct QueueEntry {
    id: u64,
    user_id: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<Verdict>,
}

struct LimiterState {
    users: HashMap<String, SlidingWindow>,
    global: SlidingWindow,
    queues: [VecDeque<QueueEntry>; 3],
    next_id: u64,
    closed: bool,
    last_cleanup: Instant,
}

/// Queue depth and window usage, for status reporting
#[derive(Clone, Debug, Serialize)]
pub struct AdmissionSnapshot {
    pub enabled: bool,
    pub queued_owner: usize,
    pub queued_authorized: usize,
    pub queued_regular: usize,
    pub tracked_users: usize,
    pub global_in_window: usize,
}

/// Per-process admission controller, shared by reference
pub struct AdmissionController {
    config: AdmissionConfig,
    state: Mutex<LimiterState>,
    wakeup: Notify,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Arc<Self> {
        let config = config.validate();
        info!(
            enabled = config.enabled,
            max_files_per_period = config.max_files_per_period,
            period_secs = config.period.as_secs(),
            max_global_per_minute = config.max_global_per_minute,
            max_queue_size = config.max_queue_size,
            "admission controller initialized"
        );
        Arc::new(Self {
            config,
            state: Mutex::new(LimiterState {
                users: HashMap::new(),
                global: SlidingWindow::new(GLOBAL_PERIOD),
                queues: Default::default(),
                next_id: 0,
                closed: false,
                last_cleanup: Instant::now(),
            }),
            wakeup: Notify::new(),
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Decide whether `user_id` may start a request now
    pub fn admit(self: &Arc<Self>, user_id: &str, class: PriorityClass) -> Admission {
        if class == PriorityClass::Owner || !self.config.enabled {
            return Admission::Admitted;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        if state.closed {
            return Admission::Rejected(RejectReason::ShuttingDown);
        }

        // queued entries get the freed headroom before newcomers
        self.drain_locked(&mut state, now);

        if self.try_count(&mut state, user_id, class, now) {
            debug!(user_id, class = %class, "request admitted");
            return Admission::Admitted;
        }

        let id = state.next_id;
        let queue = &mut state.queues[class.index()];
        if queue.len() >= self.config.max_queue_size {
            warn!(user_id, class = %class, queued = queue.len(), "admission queue full, rejecting");
            return Admission::Rejected(RejectReason::QueueFull);
        }

        let (tx, rx) = oneshot::channel();
        queue.push_back(QueueEntry {
            id,
            user_id: user_id.to_string(),
            enqueued_at: now,
            tx,
        });
        let position = queue.len();
        state.next_id += 1;
        drop(state);

        info!(user_id, class = %class, position, "request queued");
        self.wakeup.notify_one();

        Admission::Queued(QueueTicket {
            id,
            class,
            user_id: user_id.to_string(),
            position,
            rx,
            controller: Arc::clone(self),
            resolved: false,
        })
    }

    /// Count one request if both windows have headroom
    fn try_count(&self, state: &mut LimiterState, user_id: &str, class: PriorityClass, now: Instant) -> bool {
        let LimiterState { users, global, .. } = state;
        let global_limit = self.config.max_global_per_minute;
        if global_limit > 0 && !global.has_headroom(now, global_limit) {
            return false;
        }
        let window = users
            .entry(user_id.to_string())
            .or_insert_with(|| SlidingWindow::new(self.config.period));
        if !window.has_headroom(now, self.config.user_limit(class)) {
            return false;
        }
        window.record(now);
        global.record(now);
        true
    }

    /// Expire stale entries and admit queued ones while headroom exists.
    /// Returns the number admitted.
    fn drain_locked(&self, state: &mut LimiterState, now: Instant) -> usize {
        let timeout = self.config.queue_timeout;
        for queue in state.queues.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.tx.is_closed() {
                    continue;
                }
                if now.saturating_duration_since(entry.enqueued_at) >= timeout {
                    info!(user_id = %entry.user_id, "queued request timed out");
                    let _ = entry.tx.send(Err(RejectReason::QueueTimeout));
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }

        let global_limit = self.config.max_global_per_minute;
        let mut admitted = 0;

        'classes: for class in PriorityClass::ALL {
            let limit = self.config.user_limit(class);
            let mut i = 0;
            while i < state.queues[class.index()].len() {
                let LimiterState {
                    users,
                    global,
                    queues,
                    ..
                } = &mut *state;

                if global_limit > 0 && !global.has_headroom(now, global_limit) {
                    break 'classes;
                }

                let queue = &mut queues[class.index()];
                let user_id = queue[i].user_id.clone();
                let window = users
                    .entry(user_id)
                    .or_insert_with(|| SlidingWindow::new(self.config.period));
                if !window.has_headroom(now, limit) {
                    i += 1;
                    continue;
                }

                let Some(entry) = queue.remove(i) else {
                    break;
                };
                window.record(now);
                global.record(now);

                let waited_ms = now.saturating_duration_since(entry.enqueued_at).as_millis() as u64;
                if entry.tx.send(Ok(now)).is_err() {
                    window.undo();
                    global.undo();
                } else {
                    debug!(user_id = %entry.user_id, class = %class, waited_ms, "queued request admitted");
                    admitted += 1;
                }
            }
        }

        if now.saturating_duration_since(state.last_cleanup) >= self.config.period {
            let before = state.users.len();
            state.users.retain(|_, window| !window.is_idle(now));
            state.last_cleanup = now;
            debug!(dropped = before - state.users.len(), "idle user windows dropped");
        }

        admitted
    }

    /// Run one drain pass immediately
    pub fn drain_now(&self) -> usize {
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }
        self.drain_locked(&mut state, Instant::now())
    }

    /// When the next drain pass could change anything
    fn next_wakeup(&self, state: &LimiterState, now: Instant) -> Instant {
        let mut at = now + self.config.drain_interval;
        let queued = state.queues.iter().flatten();
        for entry in queued {
            at = at.min(entry.enqueued_at + self.config.queue_timeout);
            if let Some(expiry) = state.users.get(&entry.user_id).and_then(SlidingWindow::next_expiry) {
                at = at.min(expiry);
            }
            if let Some(expiry) = state.global.next_expiry() {
                at = at.min(expiry);
            }
        }
        at.max(now + Duration::from_millis(1))
    }

    /// Start the background drain task. It stops after `shutdown`.
    pub fn spawn_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let notified = controller.wakeup.notified();
                let deadline = {
                    let mut state = controller.state.lock();
                    if state.closed {
                        break;
                    }
                    let now = Instant::now();
                    controller.drain_locked(&mut state, now);
                    controller.next_wakeup(&state, now)
                };
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = notified => {}
                }
            }
            debug!("admission drain task stopped");
        })
    }

    /// Reject every waiter and refuse new requests
    pub fn shutdown(&self) {
        let rejected = {
            let mut state = self.state.lock();
            state.closed = true;
            let mut rejected = 0;
            for queue in state.queues.iter_mut() {
                for entry in queue.drain(..) {
                    if entry.tx.send(Err(RejectReason::ShuttingDown)).is_ok() {
                        rejected += 1;
                    }
                }
            }
            rejected
        };
        info!(rejected, "admission controller shut down");
        self.wakeup.notify_one();
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let mut state = self.state.lock();
        let now = Instant::now();
        let global_in_window = state.global.count(now);
        AdmissionSnapshot {
            enabled: self.config.enabled,
            queued_owner: state.queues[0].len(),
            queued_authorized: state.queues[1].len(),
            queued_regular: state.queues[2].len(),
            tracked_users: state.users.len(),
            global_in_window,
        }
    }

    /// Requests `user_id` has in its window right now
    pub fn user_usage(&self, user_id: &str) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.users.get_mut(user_id).map_or(0, |w| w.count(now))
    }

    /// Remove a ticket that is no longer awaited. An admission that was sent
    /// but never observed is refunded.
    fn cancel(&self, ticket: &mut QueueTicket) {
        let mut state = self.state.lock();
        let queue = &mut state.queues[ticket.class.index()];
        if let Some(index) = queue.iter().position(|e| e.id == ticket.id) {
            queue.remove(index);
            debug!(user_id = %ticket.user_id, "queued request cancelled");
            return;
        }

        if let Ok(Ok(admitted_at)) = ticket.rx.try_recv() {
            let LimiterState { users, global, .. } = &mut *state;
            if let Some(window) = users.get_mut(&ticket.user_id) {
                window.forget(admitted_at);
            }
            global.forget(admitted_at);
            debug!(user_id = %ticket.user_id, "unused admission refunded");
        }
    }
}

/// A parked request. Await [`QueueTicket::wait`] for the verdict; dropping
/// the ticket removes the request from its queue.
pub struct QueueTicket {
    id: u64,
    class: PriorityClass,
    user_id: String,
    position: usize,
    rx: oneshot::Receiver<Verdict>,
    controller: Arc<AdmissionController>,
    resolved: bool,
}

impl QueueTicket {
    /// 1-based position within the class queue at enqueue time
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn class(&self) -> PriorityClass {
        self.class
    }

    /// Wait until the request is admitted or rejected
    pub async fn wait(mut self) -> std::result::Result<(), RejectReason> {
        let verdict = (&mut self.rx)
            .await
            .unwrap_or(Err(RejectReason::ShuttingDown));
        self.resolved = true;
        verdict.map(|_| ())
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.resolved {
            let controller = Arc::clone(&self.controller);
            controller.cancel(self);
        }
    }
}

impl fmt::Debug for QueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueTicket")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("user_id", &self.user_id)
            .field("position", &self.position)
            .finish()
    }
}
