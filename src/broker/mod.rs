//! Broker
//!
//! Owns the authoritative world, the reliable event stream and the intent
//! ledger. The simulation loop advances the world at a fixed rate and
//! publishes the accumulated diff every `ticks_per_publish` steps, so the
//! diff feed never outpaces the clients' outbound rate. Transport bridges
//! consume the stream through [`DiffSource`] and feed intents back through
//! [`IntentSink`].

pub mod intent;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

pub use intent::{ControlRanges, IntentError, IntentLedger, IntentPayload, LedgerConfig, Range};

use crate::config::BrokerConfig;
use crate::core::Context;
use crate::events::{ReliableEventStream, StreamError};
use crate::network::{
    BridgeError, DiffEvent, DiffSource, DiffSubscription, IntentSink, IntentSubmission,
    IntentVerdict,
};
use crate::state::{WorldDiff, WorldState};

/// The authoritative broker.
#[derive(Debug)]
pub struct Broker {
    world: WorldState,
    stream: Arc<ReliableEventStream>,
    ledger: IntentLedger,
    tick: AtomicU64,
    tick_period: Duration,
    ticks_per_publish: u32,
    subscriber_buffer: usize,
}

impl Broker {
    /// Create a broker from configuration.
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            world: WorldState::new(),
            stream: Arc::new(ReliableEventStream::new(config.stream_config())),
            ledger: IntentLedger::new(LedgerConfig {
                max_strikes: config.max_intent_strikes,
                ..Default::default()
            }),
            tick: AtomicU64::new(0),
            tick_period: config.tick_period(),
            ticks_per_publish: config.ticks_per_publish(),
            subscriber_buffer: config.subscriber_buffer,
        }
    }

    /// World containers.
    pub fn world(&self) -> &WorldState {
        &self.world
    }

    /// Reliable event stream.
    pub fn stream(&self) -> &Arc<ReliableEventStream> {
        &self.stream
    }

    /// Intent ledger.
    pub fn ledger(&self) -> &IntentLedger {
        &self.ledger
    }

    /// Last tick that produced a diff.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Acknowledge a delivered sequence on behalf of a client.
    pub fn ack(&self, client_id: &str, sequence: u64) -> Result<(), StreamError> {
        self.stream.ack(client_id, sequence)
    }

    /// Advance the world by `step` and publish its diff.
    ///
    /// Returns the published sequence, or `None` when nothing changed.
    pub fn advance_simulation(&self, step: Duration) -> Option<u64> {
        self.world.step(step);
        self.publish_pending()
    }

    /// Publish everything the world accumulated since the last publish.
    ///
    /// Returns the published sequence, or `None` when nothing changed.
    pub fn publish_pending(&self) -> Option<u64> {
        let diff = self.world.consume_diff();
        if !diff.has_changes() {
            return None;
        }

        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        match self.stream.publish_diff(&WorldDiff { tick, diff }) {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                warn!(tick, error = %e, "Failed to publish world diff");
                None
            }
        }
    }

    /// Run the fixed-rate simulation loop until `ctx` ends.
    #[instrument(skip(self, ctx))]
    pub async fn run_simulation(&self, ctx: Context) {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            period_ms = self.tick_period.as_millis() as u64,
            ticks_per_publish = self.ticks_per_publish,
            "Simulation started"
        );
        let mut steps: u64 = 0;

        loop {
            tokio::select! {
                reason = ctx.cancelled() => {
                    info!(%reason, tick = self.current_tick(), "Simulation stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.world.step(self.tick_period);
                    steps += 1;
                    if steps % u64::from(self.ticks_per_publish) != 0 {
                        continue;
                    }
                    if let Some(sequence) = self.publish_pending() {
                        debug!(sequence, steps, "Published world diff");
                    }
                }
            }
        }
    }
}

impl DiffSource for Broker {
    fn subscribe_state_diffs(&self, ctx: &Context, client_id: &str) -> Result<DiffSubscription, BridgeError> {
        let mut subscription = self
            .stream
            .subscribe(ctx, client_id, self.subscriber_buffer)
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(self.stream.config().subscriber_buffer);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let client_id = client_id.to_string();

        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = &mut stop_rx => break,
                    envelope = subscription.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let payload = match envelope.to_json_bytes() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(client = %client_id, sequence = envelope.sequence, error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                let event = DiffEvent {
                    sequence: envelope.sequence,
                    payload,
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
            subscription.close();
            debug!(client = %client_id, "Diff forwarder stopped");
        });

        Ok(DiffSubscription::with_cancel(events_rx, move || {
            let _ = stop_tx.send(());
        }))
    }
}

impl IntentSink for Broker {
    fn process_intent(&self, submission: IntentSubmission) -> impl Future<Output = IntentVerdict> + Send {
        std::future::ready(self.ledger.submit(&submission.client_id, &submission.payload))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Vector3;
    use crate::events::{Envelope, EventPayload, GameEvent, GameEventType};
    use crate::network::{
        BridgeConfig, Compressor, DiffFrame, GzipCompressor, IntentFrame, IntentStreamAck,
        TransportBridge,
    };
    use crate::state::EntityState;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(&BrokerConfig::default()))
    }

    #[test]
    fn test_advance_publishes_only_changes() {
        let broker = broker();
        assert_eq!(broker.advance_simulation(Duration::from_millis(16)), None);
        assert_eq!(broker.current_tick(), 0);

        broker
            .world()
            .vehicles
            .upsert(&EntityState::new("car-1", Vector3::ZERO, Vector3::new(10.0, 0.0, 0.0)))
            .unwrap();
        assert_eq!(broker.advance_simulation(Duration::from_millis(100)), Some(1));
        assert_eq!(broker.current_tick(), 1);

        // Moving entities keep producing diffs
        assert_eq!(broker.advance_simulation(Duration::from_millis(100)), Some(2));
        assert_eq!(broker.stream().stats().last_sequence, 2);
    }

    #[tokio::test]
    async fn test_publish_pending_folds_steps() {
        let broker = broker();
        broker
            .world()
            .vehicles
            .upsert(&EntityState::new("car-1", Vector3::ZERO, Vector3::new(10.0, 0.0, 0.0)))
            .unwrap();

        for _ in 0..3 {
            broker.world().step(Duration::from_millis(100));
        }
        assert_eq!(broker.publish_pending(), Some(1));
        assert_eq!(broker.publish_pending(), None);

        let mut subscription = broker
            .stream()
            .subscribe(&Context::background(), "bot-a", 0)
            .unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.sequence, 1);
        match envelope.payload {
            EventPayload::Diff(diff) => {
                assert_eq!(diff.diff.vehicles.updated.len(), 1);
                assert!((diff.diff.vehicles.updated[0].position.x - 3.0).abs() < 1e-9);
            }
            other => panic!("Wrong payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_diff_source_forwards_json_envelopes() {
        let broker = broker();
        broker
            .world()
            .events
            .add(&GameEvent::new("evt-1", GameEventType::ScoreUpdate));
        broker.advance_simulation(Duration::from_millis(16));

        let mut subscription = broker
            .subscribe_state_diffs(&Context::background(), "bot-a")
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), subscription.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sequence, 1);

        let envelope = Envelope::from_json_bytes(&event.payload).unwrap();
        match envelope.payload {
            EventPayload::Diff(diff) => {
                assert_eq!(diff.tick, 1);
                assert_eq!(diff.diff.events[0].event_id, "evt-1");
            }
            other => panic!("Wrong payload: {:?}", other),
        }
        broker.ack("bot-a", 1).unwrap();
        assert_eq!(broker.stream().last_ack("bot-a"), Some(1));
    }

    #[tokio::test]
    async fn test_dropping_subscription_detaches() {
        let broker = broker();
        let subscription = broker
            .subscribe_state_diffs(&Context::background(), "bot-a")
            .unwrap();
        assert_eq!(broker.stream().stats().active_subscribers, 1);

        drop(subscription);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.stream().stats().active_subscribers, 0);
        // Bookkeeping survives for a later reconnect
        assert_eq!(broker.stream().stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_subscribe_empty_client_fails() {
        let err = broker()
            .subscribe_state_diffs(&Context::background(), "")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Subscribe(_)));
    }

    #[tokio::test]
    async fn test_intent_sink_uses_ledger() {
        let broker = broker();
        let payload = br#"{"schema_version":"1","sequence_id":1,"throttle":0.4}"#.to_vec();
        let verdict = broker
            .process_intent(IntentSubmission {
                client_id: "bot-a".to_string(),
                payload,
            })
            .await;
        assert_eq!(verdict, IntentVerdict::Accepted);
        assert_eq!(broker.ledger().latest("bot-a").unwrap().throttle, 0.4);
    }

    #[tokio::test]
    async fn test_simulation_lag_stays_bounded() {
        let config = BrokerConfig::default();
        let broker = Arc::new(Broker::new(&config));
        // Stationary, but still dirty every step
        broker
            .world()
            .vehicles
            .upsert(&EntityState::new("car-1", Vector3::ZERO, Vector3::ZERO))
            .unwrap();

        let bridge = Arc::new(TransportBridge::new(broker.clone(), config.bridge_config()));
        let (ctx, cancel) = Context::with_cancel();
        let (sink, mut frames) = mpsc::channel::<DiffFrame>(8);
        let outbound = {
            let bridge = bridge.clone();
            let ctx = ctx.clone();
            let mut sink = sink;
            tokio::spawn(async move { bridge.stream_state_diffs(&ctx, "bot-a", &mut sink).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let last_sent = Arc::new(AtomicU64::new(0));
        let collector = {
            let broker = broker.clone();
            let last_sent = last_sent.clone();
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    broker.ack("bot-a", frame.sequence).unwrap();
                    last_sent.store(frame.sequence, Ordering::Release);
                }
            })
        };
        let simulation = {
            let broker = broker.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { broker.run_simulation(ctx).await })
        };

        let mut lags = Vec::new();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let published = broker.stream().stats().last_sequence;
            lags.push(published.saturating_sub(last_sent.load(Ordering::Acquire)));
        }
        cancel.cancel();
        simulation.await.unwrap();
        assert!(matches!(outbound.await.unwrap(), Err(BridgeError::Canceled)));
        collector.await.unwrap();

        // 60 Hz steps fold into 20 Hz diffs, matching the 20 Hz outbound pace
        assert!(broker.stream().stats().last_sequence >= 20);
        assert!(lags.iter().all(|lag| *lag <= 5), "lag grew: {:?}", lags);
    }

    #[tokio::test]
    async fn test_bridge_end_to_end() {
        let broker = broker();
        let codec = GzipCompressor::new();
        let config = BridgeConfig {
            outbound_rate_hz: 200,
            ..Default::default()
        };
        let bridge = Arc::new(TransportBridge::new(broker.clone(), config));
        let (ctx, cancel) = Context::with_cancel();

        let (sink, mut frames) = mpsc::channel::<DiffFrame>(8);
        let outbound = {
            let bridge = bridge.clone();
            let ctx = ctx.clone();
            let mut sink = sink;
            tokio::spawn(async move { bridge.stream_state_diffs(&ctx, "bot-a", &mut sink).await })
        };

        let (intent_tx, mut intent_rx) = mpsc::channel::<IntentFrame>(4);
        intent_tx
            .send(IntentFrame {
                client_id: "bot-a".to_string(),
                encoding: "gzip".to_string(),
                payload: codec
                    .compress(br#"{"schema_version":"1","controller_id":"car-1","sequence_id":1}"#)
                    .unwrap(),
            })
            .await
            .unwrap();
        drop(intent_tx);
        let ack = bridge.publish_intents(&ctx, &mut intent_rx).await.unwrap();
        assert_eq!(ack, IntentStreamAck { accepted: 1, rejected: 0 });

        // Give the bridge time to subscribe before the first publish
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .world()
            .vehicles
            .upsert(&EntityState::new("car-1", Vector3::ZERO, Vector3::ZERO))
            .unwrap();
        let sequence = broker.advance_simulation(Duration::from_millis(16)).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.sequence, sequence);
        let envelope = Envelope::from_json_bytes(&codec.decompress(&frame.payload).unwrap()).unwrap();
        assert_eq!(envelope.sequence, sequence);

        cancel.cancel();
        let result = outbound.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Canceled)));
    }
}
