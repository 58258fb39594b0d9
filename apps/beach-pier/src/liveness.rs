use std::collections::VecDeque;
use std::time::Duration;

use metrics::counter;
use pier_proto::WireMessage;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fraction of the heartbeat interval, in halves, after which a silent link is overdue.
const OVERDUE_HALF_INTERVALS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            queue_capacity: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: WireMessage,
    pub enqueued_at: Instant,
    pub delivery_attempts: u32,
    pub priority: Priority,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("message queue is full of high-priority entries")]
pub struct QueueFull;

/// Bounded outbound queue held while a link is disconnected.
///
/// High-priority entries sit ahead of every normal entry, in arrival order.
/// Overflow evicts the oldest normal entry; with none left, a high entry
/// replaces the oldest high one and a normal entry is refused.
#[derive(Debug)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry evicted to make room, if any.
    pub fn push(&mut self, entry: QueuedMessage) -> Result<Option<QueuedMessage>, QueueFull> {
        if self.capacity == 0 {
            return Err(QueueFull);
        }
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            let first_normal = self
                .entries
                .iter()
                .position(|queued| queued.priority == Priority::Normal);
            match (first_normal, entry.priority) {
                (Some(index), _) => evicted = self.entries.remove(index),
                (None, Priority::High) => evicted = self.entries.pop_front(),
                (None, Priority::Normal) => return Err(QueueFull),
            }
        }

        match entry.priority {
            Priority::Normal => self.entries.push_back(entry),
            Priority::High => {
                let index = self
                    .entries
                    .iter()
                    .position(|queued| queued.priority == Priority::Normal)
                    .unwrap_or(self.entries.len());
                self.entries.insert(index, entry);
            }
        }
        Ok(evicted)
    }

    /// Puts entries back ahead of newer ones of the same priority.
    ///
    /// Over capacity the oldest normal entries go first, then the oldest high
    /// ones. Returns what was evicted.
    pub fn requeue_front(&mut self, entries: Vec<QueuedMessage>) -> Vec<QueuedMessage> {
        let (high, normal): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|entry| entry.priority == Priority::High);
        let split = self
            .entries
            .iter()
            .position(|queued| queued.priority == Priority::Normal)
            .unwrap_or(self.entries.len());
        let queued_normal = self.entries.split_off(split);
        let queued_high = std::mem::take(&mut self.entries);
        self.entries = high
            .into_iter()
            .chain(queued_high)
            .chain(normal)
            .chain(queued_normal)
            .collect();

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let index = self
                .entries
                .iter()
                .position(|queued| queued.priority == Priority::Normal)
                .unwrap_or(0);
            match self.entries.remove(index) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.entries.drain(..).collect()
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disconnect {
    Reconnect { attempt: u32, delay: Duration },
    Failed,
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessAction {
    SendPing,
    Redial,
}

/// Connection state machine for one backend link.
///
/// Timers are stored as deadlines; the owning loop asks for
/// [`LivenessManager::next_deadline`] and calls [`LivenessManager::poll`] when it passes.
#[derive(Debug)]
pub struct LivenessManager {
    config: LivenessConfig,
    state: LinkState,
    attempts: u32,
    next_heartbeat: Option<Instant>,
    last_pong: Option<Instant>,
    reconnect_at: Option<Instant>,
    queue: MessageQueue,
}

impl LivenessManager {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            state: LinkState::Disconnected,
            attempts: 0,
            next_heartbeat: None,
            last_pong: None,
            reconnect_at: None,
            queue: MessageQueue::new(config.queue_capacity),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn begin_connect(&mut self) {
        self.state = LinkState::Connecting;
        self.reconnect_at = None;
    }

    /// Moves to connected and hands back the queue, priority first then by age.
    pub fn on_connected(&mut self, now: Instant) -> Vec<QueuedMessage> {
        self.state = LinkState::Connected;
        self.attempts = 0;
        self.reconnect_at = None;
        self.last_pong = Some(now);
        self.next_heartbeat = Some(now + self.config.heartbeat_interval);
        let mut drained = self.queue.drain();
        for entry in &mut drained {
            entry.delivery_attempts += 1;
        }
        drained
    }

    pub fn on_disconnect(&mut self, now: Instant) -> Disconnect {
        self.next_heartbeat = None;
        self.last_pong = None;
        if matches!(self.state, LinkState::Disconnected | LinkState::Failed) {
            return Disconnect::Ignored;
        }
        if self.attempts >= self.config.max_reconnect_attempts {
            self.state = LinkState::Failed;
            self.reconnect_at = None;
            warn!(
                attempts = self.attempts,
                "reconnect attempts exhausted; link failed"
            );
            return Disconnect::Failed;
        }
        self.attempts += 1;
        let delay = reconnect_delay(
            self.attempts,
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        );
        self.state = LinkState::Reconnecting;
        self.reconnect_at = Some(now + delay);
        counter!("pier_reconnects_total", 1);
        debug!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduled reconnect"
        );
        Disconnect::Reconnect {
            attempt: self.attempts,
            delay,
        }
    }

    /// Leaves a terminal state so the link can dial again from a clean counter.
    pub fn restart(&mut self) {
        self.attempts = 0;
        self.reconnect_at = None;
        self.next_heartbeat = None;
        self.state = LinkState::Connecting;
    }

    /// Stops everything; the link will not reconnect.
    pub fn close(&mut self) {
        self.state = LinkState::Disconnected;
        self.next_heartbeat = None;
        self.reconnect_at = None;
        self.last_pong = None;
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = Some(now);
    }

    pub fn heartbeat_overdue(&self, now: Instant) -> bool {
        if self.state != LinkState::Connected {
            return false;
        }
        let limit = self.config.heartbeat_interval * OVERDUE_HALF_INTERVALS / 2;
        self.last_pong
            .map(|seen| now.saturating_duration_since(seen) > limit)
            .unwrap_or(false)
    }

    pub fn queue_message(
        &mut self,
        message: WireMessage,
        priority: Priority,
        now: Instant,
    ) -> Result<(), QueueFull> {
        let evicted = self.queue.push(QueuedMessage {
            message,
            enqueued_at: now,
            delivery_attempts: 0,
            priority,
        })?;
        if let Some(evicted) = evicted {
            counter!("pier_queue_evictions_total", 1);
            debug!(
                age_ms = now.saturating_duration_since(evicted.enqueued_at).as_millis() as u64,
                "evicted oldest queued message"
            );
        }
        Ok(())
    }

    pub fn requeue_front(&mut self, entries: Vec<QueuedMessage>, now: Instant) {
        let evicted = self.queue.requeue_front(entries);
        if let Some(oldest) = evicted.first() {
            let age = now.saturating_duration_since(oldest.enqueued_at);
            counter!("pier_queue_evictions_total", evicted.len() as u64);
            warn!(
                evicted = evicted.len(),
                oldest_age_ms = age.as_millis() as u64,
                "queue full while requeueing; evicted oldest entries"
            );
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_heartbeat, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll(&mut self, now: Instant) -> Vec<LivenessAction> {
        let mut actions = Vec::new();
        if let Some(due) = self.next_heartbeat {
            if due <= now && self.state == LinkState::Connected {
                actions.push(LivenessAction::SendPing);
                self.next_heartbeat = Some(now + self.config.heartbeat_interval);
            }
        }
        if let Some(due) = self.reconnect_at {
            if due <= now && self.state == LinkState::Reconnecting {
                self.reconnect_at = None;
                actions.push(LivenessAction::Redial);
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(label: &str) -> WireMessage {
        WireMessage::Text(label.to_string())
    }

    fn labels(entries: &[QueuedMessage]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| match &entry.message {
                WireMessage::Text(text) => text.clone(),
                WireMessage::Binary(_) => "<binary>".into(),
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn reconnect_delay_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (1..=8)
            .map(|k| reconnect_delay(k, base, max).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        let mut previous = Duration::ZERO;
        for attempt in 1..=200 {
            let delay = reconnect_delay(attempt, base, max);
            let expected = if attempt <= 31 {
                base.checked_mul(1 << (attempt - 1)).unwrap_or(max).min(max)
            } else {
                max
            };
            assert_eq!(delay, expected, "attempt {attempt}");
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test_timeout::timeout]
    fn flush_orders_high_then_normal_by_age() {
        let mut liveness = LivenessManager::new(LivenessConfig::default());
        let now = Instant::now();
        let high_at = [1, 4, 8];
        for i in 0..10 {
            let priority = if high_at.contains(&i) {
                Priority::High
            } else {
                Priority::Normal
            };
            liveness
                .queue_message(text(&format!("m{i}")), priority, now)
                .expect("queue has room");
        }
        let flushed = liveness.on_connected(now);
        assert_eq!(
            labels(&flushed),
            vec!["m1", "m4", "m8", "m0", "m2", "m3", "m5", "m6", "m7", "m9"]
        );
        assert!(flushed.iter().all(|entry| entry.delivery_attempts == 1));
        assert_eq!(liveness.queued(), 0);
    }

    #[test_timeout::timeout]
    fn overflow_evicts_oldest_normal_and_keeps_newest_high() {
        let mut queue = MessageQueue::new(3);
        let now = Instant::now();
        let entry = |label: &str, priority| QueuedMessage {
            message: text(label),
            enqueued_at: now,
            delivery_attempts: 0,
            priority,
        };
        queue.push(entry("n0", Priority::Normal)).expect("room");
        queue.push(entry("h0", Priority::High)).expect("room");
        queue.push(entry("n1", Priority::Normal)).expect("room");

        let evicted = queue.push(entry("h1", Priority::High)).expect("evicts");
        assert_eq!(evicted.map(|e| e.message), Some(text("n0")));
        assert_eq!(queue.len(), 3);

        let evicted = queue.push(entry("h2", Priority::High)).expect("evicts");
        assert_eq!(evicted.map(|e| e.message), Some(text("n1")));

        // only high entries left: a new high replaces the oldest high
        let evicted = queue.push(entry("h3", Priority::High)).expect("evicts");
        assert_eq!(evicted.map(|e| e.message), Some(text("h0")));
        assert_eq!(queue.push(entry("n2", Priority::Normal)), Err(QueueFull));

        assert_eq!(labels(&queue.drain()), vec!["h1", "h2", "h3"]);
    }

    #[test_timeout::timeout]
    fn requeue_keeps_priority_order_and_evicts_at_capacity() {
        let mut queue = MessageQueue::new(4);
        let now = Instant::now();
        let entry = |label: &str, priority| QueuedMessage {
            message: text(label),
            enqueued_at: now,
            delivery_attempts: 1,
            priority,
        };
        queue.push(entry("h-new", Priority::High)).expect("room");
        queue.push(entry("n-new0", Priority::Normal)).expect("room");
        queue.push(entry("n-new1", Priority::Normal)).expect("room");

        let evicted = queue.requeue_front(vec![
            entry("h-old", Priority::High),
            entry("n-old0", Priority::Normal),
            entry("n-old1", Priority::Normal),
        ]);
        assert_eq!(labels(&evicted), vec!["n-old0", "n-old1"]);
        assert_eq!(queue.len(), 4);
        assert_eq!(
            labels(&queue.drain()),
            vec!["h-old", "h-new", "n-new0", "n-new1"]
        );
    }

    #[test_timeout::timeout]
    fn interrupted_flush_requeues_up_to_capacity() {
        let config = LivenessConfig {
            queue_capacity: 3,
            ..LivenessConfig::default()
        };
        let mut liveness = LivenessManager::new(config);
        let now = Instant::now();
        for label in ["a", "b", "c"] {
            liveness
                .queue_message(text(label), Priority::Normal, now)
                .expect("room");
        }
        liveness.begin_connect();
        let flushed = liveness.on_connected(now);
        assert_eq!(liveness.queued(), 0);

        // two new messages land before the failed flush is put back
        liveness
            .queue_message(text("d"), Priority::High, now)
            .expect("room");
        liveness
            .queue_message(text("e"), Priority::Normal, now)
            .expect("room");
        liveness.requeue_front(flushed[1..].to_vec(), now);

        assert_eq!(liveness.queued(), 3);
        assert_eq!(labels(&liveness.on_connected(now)), vec!["d", "c", "e"]);
    }

    #[test_timeout::timeout]
    fn queue_never_exceeds_capacity() {
        let mut queue = MessageQueue::new(5);
        let now = Instant::now();
        for i in 0..50u32 {
            let priority = if i % 3 == 0 { Priority::High } else { Priority::Normal };
            let _ = queue.push(QueuedMessage {
                message: text(&i.to_string()),
                enqueued_at: now,
                delivery_attempts: 0,
                priority,
            });
            assert!(queue.len() <= 5);
        }
    }

    #[test_timeout::timeout]
    fn disconnects_back_off_until_failed() {
        let mut liveness = LivenessManager::new(LivenessConfig {
            max_reconnect_attempts: 3,
            ..LivenessConfig::default()
        });
        let now = Instant::now();
        liveness.begin_connect();
        liveness.on_connected(now);

        let mut delays = Vec::new();
        for _ in 0..3 {
            match liveness.on_disconnect(now) {
                Disconnect::Reconnect { delay, .. } => delays.push(delay.as_secs()),
                other => panic!("expected reconnect, got {other:?}"),
            }
            assert_eq!(liveness.state(), LinkState::Reconnecting);
            liveness.begin_connect();
        }
        assert_eq!(delays, vec![1, 2, 4]);
        assert_eq!(liveness.on_disconnect(now), Disconnect::Failed);
        assert_eq!(liveness.state(), LinkState::Failed);
        assert_eq!(liveness.on_disconnect(now), Disconnect::Ignored);

        liveness.restart();
        assert_eq!(liveness.state(), LinkState::Connecting);
        assert_eq!(liveness.attempts(), 0);
    }

    #[test_timeout::timeout]
    fn connecting_resets_attempts() {
        let mut liveness = LivenessManager::new(LivenessConfig::default());
        let now = Instant::now();
        liveness.begin_connect();
        liveness.on_disconnect(now);
        liveness.begin_connect();
        liveness.on_disconnect(now);
        assert_eq!(liveness.attempts(), 2);
        liveness.begin_connect();
        liveness.on_connected(now);
        assert_eq!(liveness.attempts(), 0);
        assert_eq!(liveness.state(), LinkState::Connected);
    }

    #[test_timeout::timeout]
    fn heartbeat_schedule_and_overdue() {
        let interval = Duration::from_secs(30);
        let mut liveness = LivenessManager::new(LivenessConfig::default());
        let start = Instant::now();
        liveness.begin_connect();
        liveness.on_connected(start);
        assert_eq!(liveness.next_deadline(), Some(start + interval));
        assert!(liveness.poll(start + Duration::from_secs(10)).is_empty());

        let first = start + interval;
        assert_eq!(liveness.poll(first), vec![LivenessAction::SendPing]);
        assert_eq!(liveness.next_deadline(), Some(first + interval));

        assert!(!liveness.heartbeat_overdue(start + Duration::from_secs(75)));
        assert!(liveness.heartbeat_overdue(start + Duration::from_secs(76)));
        liveness.record_pong(start + Duration::from_secs(70));
        assert!(!liveness.heartbeat_overdue(start + Duration::from_secs(76)));
    }

    #[test_timeout::timeout]
    fn reconnect_deadline_yields_redial() {
        let mut liveness = LivenessManager::new(LivenessConfig::default());
        let now = Instant::now();
        liveness.begin_connect();
        liveness.on_connected(now);
        liveness.on_disconnect(now);
        assert_eq!(liveness.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(liveness.poll(now).is_empty());
        assert_eq!(
            liveness.poll(now + Duration::from_secs(1)),
            vec![LivenessAction::Redial]
        );
        assert_eq!(liveness.next_deadline(), None);
    }
}
