//! Per-channel outbound queues.
//!
//! A channel's queue stays closed until the server confirms the join with
//! both a NAMES reply (353) and end of NAMES (366). After that, writes are
//! admitted up to the flood-control cap.

use crate::throttle::DecayingWindow;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use twirc_protocol::command::{RPL_ENDOFNAMES, RPL_NAMREPLY};
use twirc_protocol::Message;

/// Name of the reserved queue for protocol control lines.
pub const SYSTEM_CHANNEL: &str = "SYS";

/// Result of offering a message to a channel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Join handshake (353 + 366) not complete yet.
    NotJoined,
    /// Flood-control cap reached within the window.
    FloodControl,
    /// Queue at capacity.
    QueueFull,
}

impl Enqueued {
    pub fn is_accepted(self) -> bool {
        self == Enqueued::Accepted
    }
}

/// Per-channel counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub accepted_total: AtomicU64,
    pub sent_total: AtomicU64,
    pub flood_dropped_total: AtomicU64,
    pub full_dropped_total: AtomicU64,
}

/// Join handshake progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinState {
    pub names_received: bool,
    pub end_of_names_received: bool,
}

impl JoinState {
    fn joined() -> Self {
        Self {
            names_received: true,
            end_of_names_received: true,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.names_received && self.end_of_names_received
    }
}

struct ChannelInner {
    queue: VecDeque<Message>,
    throttle: DecayingWindow,
    join_state: JoinState,
}

/// Bounded FIFO of outbound messages for one channel.
pub struct ChannelQueue {
    name: String,
    capacity: usize,
    /// System queues are never flood-controlled.
    system: bool,
    flood_max_messages: usize,
    inner: Mutex<ChannelInner>,
    stats: ChannelStats,
}

impl ChannelQueue {
    /// Creates a queue for a channel that still has to be joined.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        flood_window: Duration,
        flood_max_messages: usize,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            system: false,
            flood_max_messages,
            inner: Mutex::new(ChannelInner {
                queue: VecDeque::new(),
                throttle: DecayingWindow::new(flood_window),
                join_state: JoinState::default(),
            }),
            stats: ChannelStats::default(),
        }
    }

    /// Creates the always-open, unthrottled system queue.
    pub fn system(capacity: usize) -> Self {
        Self {
            name: SYSTEM_CHANNEL.to_string(),
            capacity,
            system: true,
            flood_max_messages: usize::MAX,
            inner: Mutex::new(ChannelInner {
                queue: VecDeque::new(),
                throttle: DecayingWindow::new(Duration::ZERO),
                join_state: JoinState::joined(),
            }),
            stats: ChannelStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages admitted per flood window; unlimited for the system queue.
    pub fn flood_max_messages(&self) -> usize {
        self.flood_max_messages
    }

    pub fn is_joined(&self) -> bool {
        self.inner.lock().join_state.is_joined()
    }

    pub fn join_state(&self) -> JoinState {
        self.inner.lock().join_state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Queues a message, returning whether it was accepted.
    pub fn enqueue(&self, message: Message) -> bool {
        self.try_enqueue(message).is_accepted()
    }

    /// Queues a message, reporting why it was rejected.
    ///
    /// Rejections never block: a full queue drops the new message.
    pub fn try_enqueue(&self, message: Message) -> Enqueued {
        let mut inner = self.inner.lock();

        if !inner.join_state.is_joined() {
            tracing::debug!("{}: not joined yet, dropping '{}'", self.name, message);
            return Enqueued::NotJoined;
        }

        if inner.queue.len() >= self.capacity {
            self.stats.full_dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "{}: queue full ({} messages), dropping '{}'",
                self.name,
                self.capacity,
                message
            );
            return Enqueued::QueueFull;
        }

        if !self.system
            && !inner
                .throttle
                .increment_if_under(&self.name, self.flood_max_messages)
        {
            self.stats.flood_dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Flood control on {}, dropping '{}'", self.name, message);
            return Enqueued::FloodControl;
        }

        inner.queue.push_back(message);
        self.stats.accepted_total.fetch_add(1, Ordering::Relaxed);
        Enqueued::Accepted
    }

    /// Pops the head of the queue without waiting.
    pub fn dequeue_next(&self) -> Option<Message> {
        self.inner.lock().queue.pop_front()
    }

    /// Updates join state from an inbound message addressed to this channel.
    pub fn on_inbound_message(&self, message: &Message) {
        let mut inner = self.inner.lock();
        let was_joined = inner.join_state.is_joined();

        match message.command() {
            RPL_NAMREPLY => inner.join_state.names_received = true,
            RPL_ENDOFNAMES => inner.join_state.end_of_names_received = true,
            _ => return,
        }

        if !was_joined && inner.join_state.is_joined() {
            tracing::info!("Joined {}", self.name);
        }
    }

    pub(crate) fn record_sent(&self) {
        self.stats.sent_total.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ChannelQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChannelQueue")
            .field("name", &self.name)
            .field("system", &self.system)
            .field("queued", &inner.queue.len())
            .field("join_state", &inner.join_state)
            .finish()
    }
}
