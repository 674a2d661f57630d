//! Reliable Event Stream
//!
//! Imposes one global order on every published payload and delivers it
//! at-least-once, in order, to each logical subscriber.
//!
//! ## Delivery
//!
//! Subscriber bookkeeping (`pending`, `last_ack`) is keyed by subscriber id and
//! outlives any single connection. Each connection owns a bounded channel plus
//! a flush task:
//!
//! - `publish` pushes live with `try_send` only when the subscriber is caught
//!   up (its delivery cursor equals the new sequence and no flush is running).
//! - Otherwise the flush task is woken; it copies envelopes from the cursor
//!   onward and sends them with back-pressure, racing cancellation.
//! - The cursor only moves under the stream lock, so a connection never sees
//!   a gap or a reordering.
//!
//! Acks must name the head of `pending`. A reconnect replays every retained
//! sequence above `last_ack`.

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::envelope::{Envelope, EventKind, EventPayload};
use super::telemetry::{CombatTelemetry, GameEvent, GameEventType, RadarContact};
use crate::core::{CancelHandle, Context};
use crate::state::WorldDiff;

/// Metadata key carrying the spawn shield duration on respawn events.
pub const SPAWN_SHIELD_METADATA_KEY: &str = "spawn_shield_ms";

/// Default number of retained envelopes.
pub const DEFAULT_RETENTION: usize = 512;

/// Default per-subscription channel capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// Default spawn shield duration.
pub const DEFAULT_SPAWN_SHIELD: Duration = Duration::from_millis(1500);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What a publish does when a caught-up subscriber's channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Skip the live push; the flush task delivers it once there is room.
    #[default]
    DropLive,
    /// Close the slow subscriber's channel; it must resubscribe and replay.
    Deactivate,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_live" | "drop-live" | "droplive" => Ok(OverflowPolicy::DropLive),
            "deactivate" => Ok(OverflowPolicy::Deactivate),
            other => Err(format!("unknown overflow policy {:?}", other)),
        }
    }
}

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Envelopes kept for replay (0 = default)
    pub retention: usize,
    /// Channel capacity used when `subscribe` is called with 0 (0 = default)
    pub subscriber_buffer: usize,
    /// Shield duration stamped on respawn events
    pub spawn_shield: Duration,
    /// Full-channel behaviour
    pub overflow_policy: OverflowPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            spawn_shield: DEFAULT_SPAWN_SHIELD,
            overflow_policy: OverflowPolicy::DropLive,
        }
    }
}

impl StreamConfig {
    /// Config with the given retention and defaults elsewhere.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention,
            ..Default::default()
        }
    }

    fn normalized(mut self) -> Self {
        if self.retention == 0 {
            self.retention = DEFAULT_RETENTION;
        }
        if self.subscriber_buffer == 0 {
            self.subscriber_buffer = DEFAULT_SUBSCRIBER_BUFFER;
        }
        self
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Stream errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Subscriber ids must be non-empty.
    #[error("subscriber id must not be empty")]
    EmptySubscriberId,

    /// Ack for a subscriber that never subscribed.
    #[error("unknown subscriber {0:?}")]
    UnknownSubscriber(String),

    /// Ack that does not name the head of the pending queue.
    #[error("ack sequence {received} does not match the next pending event {expected:?}")]
    OutOfOrderAck {
        /// Head of the pending queue, if any
        expected: Option<u64>,
        /// Sequence the subscriber tried to ack
        received: u64,
    },

    /// Game event type not accepted on this channel.
    #[error("{kind:?} does not accept {event_type:?} events")]
    UnsupportedEventType {
        /// Channel the event was published on
        kind: EventKind,
        /// Rejected type
        event_type: GameEventType,
    },

    /// Payload that carries nothing to deliver.
    #[error("{0:?} payload is empty")]
    MissingPayload(EventKind),
}

// =============================================================================
// STATE
// =============================================================================

/// Point-in-time stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StreamStats {
    /// Last assigned sequence (0 before the first publish)
    pub last_sequence: u64,
    /// Envelopes currently retained
    pub retained: usize,
    /// Oldest retained sequence
    pub oldest_retained: Option<u64>,
    /// Known subscriber ids
    pub subscribers: usize,
    /// Subscribers with a live connection
    pub active_subscribers: usize,
}

#[derive(Debug, Default)]
struct SubscriberState {
    pending: VecDeque<u64>,
    last_ack: u64,
    active: bool,
    sender: Option<mpsc::Sender<Envelope>>,
    /// Next sequence to hand to the current channel.
    cursor: u64,
    flushing: bool,
    generation: u64,
    wake: Arc<Notify>,
    halt: Option<CancelHandle>,
}

impl SubscriberState {
    fn deactivate(&mut self) {
        self.active = false;
        self.flushing = false;
        self.sender = None;
        if let Some(halt) = self.halt.take() {
            halt.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct StreamInner {
    next_seq: u64,
    /// Contiguous ascending sequences.
    log: VecDeque<Envelope>,
    subscribers: BTreeMap<String, SubscriberState>,
}

impl StreamInner {
    fn envelopes_from(&self, from: u64) -> Vec<Envelope> {
        let Some(front) = self.log.front() else {
            return Vec::new();
        };
        let start = from.saturating_sub(front.sequence) as usize;
        self.log.iter().skip(start).cloned().collect()
    }

    /// Drop the oldest envelopes beyond `retention` that every subscriber acked.
    fn compact(&mut self, retention: usize) {
        let floor = self
            .subscribers
            .values()
            .map(|sub| sub.last_ack)
            .min()
            .unwrap_or(self.next_seq);

        while self.log.len() > retention {
            match self.log.front() {
                Some(front) if front.sequence <= floor => {
                    self.log.pop_front();
                }
                _ => break,
            }
        }
    }
}

/// Sequenced, replayable event stream.
///
/// Shared behind an `Arc`; `subscribe` spawns a flush task and must run inside
/// a tokio runtime.
#[derive(Debug)]
pub struct ReliableEventStream {
    config: StreamConfig,
    inner: Mutex<StreamInner>,
}

impl Default for ReliableEventStream {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

impl ReliableEventStream {
    /// Create a stream.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config: config.normalized(),
            inner: Mutex::new(StreamInner::default()),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Sequence `payload` and deliver it to every subscriber.
    ///
    /// Validation failures consume no sequence number.
    pub fn publish(&self, payload: EventPayload) -> Result<u64, StreamError> {
        let payload = self.prepare(payload)?;
        let policy = self.config.overflow_policy;
        let mut wakes = Vec::new();

        let sequence = {
            let mut inner = self.inner.lock();
            inner.next_seq += 1;
            let sequence = inner.next_seq;
            let envelope = Envelope { sequence, payload };

            for (id, sub) in inner.subscribers.iter_mut() {
                sub.pending.push_back(sequence);
                if !sub.active {
                    continue;
                }
                if sub.flushing || sub.cursor != sequence {
                    wakes.push(sub.wake.clone());
                    continue;
                }
                let Some(sender) = sub.sender.as_ref() else {
                    continue;
                };
                match sender.try_send(envelope.clone()) {
                    Ok(()) => sub.cursor = sequence + 1,
                    Err(TrySendError::Full(_)) => match policy {
                        OverflowPolicy::DropLive => {
                            debug!(subscriber = %id, sequence, "Subscriber channel full, deferring to flush");
                            wakes.push(sub.wake.clone());
                        }
                        OverflowPolicy::Deactivate => {
                            warn!(subscriber = %id, sequence, "Subscriber channel full, deactivating");
                            sub.deactivate();
                        }
                    },
                    Err(TrySendError::Closed(_)) => {
                        debug!(subscriber = %id, "Subscriber channel closed");
                        sub.deactivate();
                    }
                }
            }

            inner.log.push_back(envelope);
            inner.compact(self.config.retention);
            sequence
        };

        for wake in wakes {
            wake.notify_one();
        }
        Ok(sequence)
    }

    /// Publish a world diff.
    pub fn publish_diff(&self, diff: &WorldDiff) -> Result<u64, StreamError> {
        self.publish(EventPayload::Diff(diff.clone()))
    }

    /// Publish combat telemetry.
    pub fn publish_combat(&self, telemetry: &CombatTelemetry) -> Result<u64, StreamError> {
        self.publish(EventPayload::Combat(telemetry.to_event()))
    }

    /// Publish a radar sweep.
    pub fn publish_radar(&self, contact: &RadarContact) -> Result<u64, StreamError> {
        self.publish(EventPayload::Radar(contact.clone()))
    }

    /// Publish a respawn. Only `Spawned` events are accepted.
    pub fn publish_respawn(&self, event: &GameEvent) -> Result<u64, StreamError> {
        self.publish(EventPayload::Respawn(event.clone()))
    }

    /// Publish a lifecycle transition (destroyed, objective captured, score update).
    pub fn publish_lifecycle(&self, event: &GameEvent) -> Result<u64, StreamError> {
        self.publish(EventPayload::Lifecycle(event.clone()))
    }

    fn prepare(&self, payload: EventPayload) -> Result<EventPayload, StreamError> {
        match payload {
            EventPayload::Diff(diff) => {
                if !diff.diff.has_changes() {
                    return Err(StreamError::MissingPayload(EventKind::Diff));
                }
                Ok(EventPayload::Diff(diff))
            }
            EventPayload::Combat(mut event) => {
                event.metadata.retain(|key, _| !key.is_empty());
                Ok(EventPayload::Combat(event))
            }
            EventPayload::Radar(contact) => Ok(EventPayload::Radar(contact)),
            EventPayload::Respawn(mut event) => {
                if event.event_type != GameEventType::Spawned {
                    return Err(StreamError::UnsupportedEventType {
                        kind: EventKind::Respawn,
                        event_type: event.event_type,
                    });
                }
                event.metadata.insert(
                    SPAWN_SHIELD_METADATA_KEY.to_string(),
                    self.config.spawn_shield.as_millis().to_string(),
                );
                Ok(EventPayload::Respawn(event))
            }
            EventPayload::Lifecycle(event) => {
                if !event.event_type.is_lifecycle() {
                    return Err(StreamError::UnsupportedEventType {
                        kind: EventKind::Lifecycle,
                        event_type: event.event_type,
                    });
                }
                Ok(EventPayload::Lifecycle(event))
            }
        }
    }

    // =========================================================================
    // SUBSCRIBE / ACK
    // =========================================================================

    /// Attach a connection for `subscriber_id` and replay everything after its
    /// last ack.
    ///
    /// `buffer == 0` uses the configured default. A second subscribe with the
    /// same id supersedes the previous connection, whose channel is closed.
    pub fn subscribe(
        self: &Arc<Self>,
        ctx: &Context,
        subscriber_id: &str,
        buffer: usize,
    ) -> Result<Subscription, StreamError> {
        if subscriber_id.is_empty() {
            return Err(StreamError::EmptySubscriberId);
        }
        let capacity = if buffer == 0 {
            self.config.subscriber_buffer
        } else {
            buffer
        };

        let (sender, events) = mpsc::channel(capacity);
        let (halt_ctx, halt) = Context::with_cancel();
        let wake = Arc::new(Notify::new());

        let (generation, replay, last_ack) = {
            let mut inner = self.inner.lock();
            let StreamInner {
                next_seq,
                log,
                subscribers,
            } = &mut *inner;

            let sub = subscribers.entry(subscriber_id.to_string()).or_default();
            if sub.active {
                debug!(subscriber = %subscriber_id, "Superseding previous connection");
                sub.deactivate();
            }

            let replay: VecDeque<u64> = log
                .iter()
                .map(|envelope| envelope.sequence)
                .filter(|sequence| *sequence > sub.last_ack)
                .collect();
            if sub.last_ack > 0 {
                if let Some(first) = replay.front() {
                    if *first > sub.last_ack + 1 {
                        warn!(
                            subscriber = %subscriber_id,
                            last_ack = sub.last_ack,
                            first_retained = *first,
                            "Replay gap: sequences evicted before reconnect"
                        );
                    }
                }
            }

            sub.cursor = replay.front().copied().unwrap_or(*next_seq + 1);
            sub.pending = replay;
            sub.generation += 1;
            sub.active = true;
            sub.flushing = false;
            sub.sender = Some(sender.clone());
            sub.wake = wake.clone();
            sub.halt = Some(halt);

            (sub.generation, sub.pending.len(), sub.last_ack)
        };

        info!(
            subscriber = %subscriber_id,
            generation,
            replay,
            last_ack,
            "Subscriber attached"
        );

        tokio::spawn(flush_loop(
            self.clone(),
            subscriber_id.to_string(),
            generation,
            ctx.clone(),
            halt_ctx,
            sender,
            wake,
        ));

        Ok(Subscription {
            id: subscriber_id.to_string(),
            generation,
            stream: self.clone(),
            events,
            closed: false,
        })
    }

    /// Acknowledge `sequence` for `subscriber_id`.
    ///
    /// Only the head of the pending queue may be acked. Re-acking at or below
    /// the last ack with nothing pending is accepted as a duplicate.
    pub fn ack(&self, subscriber_id: &str, sequence: u64) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        let sub = inner
            .subscribers
            .get_mut(subscriber_id)
            .ok_or_else(|| StreamError::UnknownSubscriber(subscriber_id.to_string()))?;

        match sub.pending.front().copied() {
            None if sequence <= sub.last_ack => return Ok(()),
            Some(head) if head == sequence => {}
            expected => {
                return Err(StreamError::OutOfOrderAck {
                    expected,
                    received: sequence,
                })
            }
        }

        sub.pending.pop_front();
        sub.last_ack = sequence;
        sub.cursor = sub.cursor.max(sequence + 1);
        inner.compact(self.config.retention);
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> StreamStats {
        let inner = self.inner.lock();
        StreamStats {
            last_sequence: inner.next_seq,
            retained: inner.log.len(),
            oldest_retained: inner.log.front().map(|envelope| envelope.sequence),
            subscribers: inner.subscribers.len(),
            active_subscribers: inner.subscribers.values().filter(|sub| sub.active).count(),
        }
    }

    /// Pending sequences of a subscriber, oldest first.
    pub fn pending(&self, subscriber_id: &str) -> Option<Vec<u64>> {
        let inner = self.inner.lock();
        inner
            .subscribers
            .get(subscriber_id)
            .map(|sub| sub.pending.iter().copied().collect())
    }

    /// Last acked sequence of a subscriber.
    pub fn last_ack(&self, subscriber_id: &str) -> Option<u64> {
        self.inner
            .lock()
            .subscribers
            .get(subscriber_id)
            .map(|sub| sub.last_ack)
    }

    /// Deactivate a connection if it is still the current one.
    fn deactivate(&self, subscriber_id: &str, generation: u64) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner.subscribers.get_mut(subscriber_id) {
            if sub.generation == generation && sub.active {
                sub.deactivate();
                debug!(subscriber = %subscriber_id, generation, "Subscriber detached");
            }
        }
    }

    /// Take the envelopes a connection still has to deliver and advance its cursor.
    ///
    /// `None` means the connection is gone.
    fn take_flush_batch(&self, subscriber_id: &str, generation: u64) -> Option<Vec<Envelope>> {
        let mut inner = self.inner.lock();
        let cursor = match inner.subscribers.get(subscriber_id) {
            Some(sub) if sub.generation == generation && sub.active => sub.cursor,
            _ => return None,
        };
        let batch = inner.envelopes_from(cursor);
        let sub = inner.subscribers.get_mut(subscriber_id)?;
        match batch.last() {
            Some(last) => {
                sub.cursor = last.sequence + 1;
                sub.flushing = true;
            }
            None => sub.flushing = false,
        }
        Some(batch)
    }
}

/// Per-connection flush task: replays history, then catches up whenever a
/// live push was skipped.
async fn flush_loop(
    stream: Arc<ReliableEventStream>,
    subscriber_id: String,
    generation: u64,
    ctx: Context,
    halt: Context,
    sender: mpsc::Sender<Envelope>,
    wake: Arc<Notify>,
) {
    loop {
        let Some(batch) = stream.take_flush_batch(&subscriber_id, generation) else {
            return;
        };

        if batch.is_empty() {
            tokio::select! {
                _ = wake.notified() => continue,
                _ = halt.cancelled() => return,
                reason = ctx.cancelled() => {
                    debug!(subscriber = %subscriber_id, %reason, "Subscription context ended");
                    stream.deactivate(&subscriber_id, generation);
                    return;
                }
                _ = sender.closed() => {
                    stream.deactivate(&subscriber_id, generation);
                    return;
                }
            }
        }

        for envelope in batch {
            tokio::select! {
                sent = sender.send(envelope) => {
                    if sent.is_err() {
                        stream.deactivate(&subscriber_id, generation);
                        return;
                    }
                }
                _ = halt.cancelled() => return,
                reason = ctx.cancelled() => {
                    debug!(subscriber = %subscriber_id, %reason, "Subscription context ended");
                    stream.deactivate(&subscriber_id, generation);
                    return;
                }
            }
        }
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// One connection's view of a subscriber.
///
/// Dropping the handle closes it.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    generation: u64,
    stream: Arc<ReliableEventStream>,
    events: mpsc::Receiver<Envelope>,
    closed: bool,
}

impl Subscription {
    /// Subscriber id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next envelope, or `None` once the connection is closed and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    /// Next envelope without waiting.
    pub fn try_recv(&mut self) -> Result<Envelope, TryRecvError> {
        self.events.try_recv()
    }

    /// Acknowledge a processed sequence.
    pub fn ack(&self, sequence: u64) -> Result<(), StreamError> {
        self.stream.ack(&self.id, sequence)
    }

    /// Detach this connection, keeping pending and last-ack for a later
    /// subscribe. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stream.deactivate(&self.id, self.generation);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// TESTS
// =============================================================================
