//! Transport Bridge
//!
//! One bridge per connected client. Outbound, it subscribes to the broker's
//! diff source, buffers arriving events and releases at most one compressed
//! frame per ticker period. The buffer is bounded: once it is full the bridge
//! stops reading, and back-pressure reaches the upstream channel. An optional
//! [`BandwidthRegulator`] holds a frame back until the client's byte budget
//! allows it. Inbound, it decompresses client intents and hands each to the
//! broker under a short deadline.
//!
//! ## Outbound state machine
//!
//! ```text
//! Idle -> Subscribed -> Draining -> Closed
//!             |            |
//!             +------------+--> Cancelled | Error
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::bandwidth::BandwidthRegulator;
use super::compress::{CompressionError, Compressor, GzipCompressor};
use super::protocol::{DiffFrame, ErrorCode, IntentFrame, IntentStreamAck};
use crate::core::{CancelReason, Context};

/// Default outbound frame rate.
pub const DEFAULT_OUTBOUND_RATE_HZ: u32 = 20;

/// Default number of events buffered ahead of the ticker.
pub const DEFAULT_MAX_BUFFERED: usize = 8;

/// Default per-intent processing deadline.
pub const DEFAULT_INTENT_TIMEOUT: Duration = Duration::from_millis(40);

// =============================================================================
// BROKER SEAMS
// =============================================================================

/// Serialized update handed to a bridge by its diff source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEvent {
    /// Stream sequence
    pub sequence: u64,
    /// Uncompressed payload
    pub payload: Vec<u8>,
}

/// Upstream feed of a bridge. Dropping it releases the upstream subscription.
pub struct DiffSubscription {
    /// Ordered events; closing means the upstream is done.
    pub events: mpsc::Receiver<DiffEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl DiffSubscription {
    /// Subscription with nothing to release.
    pub fn new(events: mpsc::Receiver<DiffEvent>) -> Self {
        Self { events, cancel: None }
    }

    /// Subscription that runs `cancel` when dropped.
    pub fn with_cancel(events: mpsc::Receiver<DiffEvent>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for DiffSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for DiffSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffSubscription")
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Produces the outbound feed for one client.
pub trait DiffSource: Send + Sync {
    /// Subscribe `client_id` to state diffs for the life of `ctx`.
    fn subscribe_state_diffs(&self, ctx: &Context, client_id: &str) -> Result<DiffSubscription, BridgeError>;
}

/// Decoded intent on its way into the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentSubmission {
    /// Sending client
    pub client_id: String,
    /// Decompressed intent bytes
    pub payload: Vec<u8>,
}

/// Broker decision on one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentVerdict {
    /// Applied.
    Accepted,
    /// Dropped; the stream continues.
    Rejected {
        /// Why
        reason: String,
    },
    /// Dropped, and the client must be disconnected.
    Disconnect {
        /// Why
        reason: String,
    },
}

/// Consumes client intents.
pub trait IntentSink: Send + Sync {
    /// Validate and apply one intent.
    fn process_intent(&self, submission: IntentSubmission) -> impl Future<Output = IntentVerdict> + Send;
}

// =============================================================================
// TRANSPORT SEAMS
// =============================================================================

/// Outbound half of a client transport.
pub trait FrameSink: Send {
    /// Transmit one frame.
    fn send(&mut self, frame: DiffFrame) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

/// Inbound half of a client transport. `None` ends the intent stream.
pub trait IntentSource: Send {
    /// Next client frame.
    fn recv(&mut self) -> impl Future<Output = Option<Result<IntentFrame, BridgeError>>> + Send;
}

impl FrameSink for mpsc::Sender<DiffFrame> {
    fn send(&mut self, frame: DiffFrame) -> impl Future<Output = Result<(), BridgeError>> + Send {
        async move {
            mpsc::Sender::send(self, frame)
                .await
                .map_err(|_| BridgeError::Transport("frame receiver dropped".to_string()))
        }
    }
}

impl IntentSource for mpsc::Receiver<IntentFrame> {
    fn recv(&mut self) -> impl Future<Output = Option<Result<IntentFrame, BridgeError>>> + Send {
        async move { mpsc::Receiver::recv(self).await.map(Ok) }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Bridge errors. Each maps to a client-visible [`ErrorCode`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The diff source refused the subscription.
    #[error("subscribe diffs: {0}")]
    Subscribe(String),

    /// The context was cancelled.
    #[error("stream cancelled")]
    Canceled,

    /// The context deadline passed.
    #[error("stream deadline exceeded")]
    DeadlineExceeded,

    /// Intent frame encoded with a codec this bridge does not speak.
    #[error("unsupported encoding {0:?}")]
    UnsupportedEncoding(String),

    /// The broker asked for the client to be disconnected.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Compressing an outbound frame failed.
    #[error("compress diff: {0}")]
    Compress(#[from] CompressionError),

    /// The client transport failed.
    #[error("transport: {0}")]
    Transport(String),

    /// The pacing ticker ended.
    #[error("ticker stopped")]
    TickerStopped,
}

impl BridgeError {
    /// Client-visible code.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Subscribe(_) | BridgeError::Compress(_) | BridgeError::TickerStopped => {
                ErrorCode::InternalError
            }
            BridgeError::Canceled => ErrorCode::Canceled,
            BridgeError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            BridgeError::UnsupportedEncoding(_) => ErrorCode::InvalidArgument,
            BridgeError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            BridgeError::Transport(_) => ErrorCode::Unavailable,
        }
    }
}

impl From<CancelReason> for BridgeError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Canceled => BridgeError::Canceled,
            CancelReason::DeadlineExceeded => BridgeError::DeadlineExceeded,
        }
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Outbound lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not streaming yet
    Idle,
    /// Streaming from a live source
    Subscribed,
    /// Source closed; flushing the buffer
    Draining,
    /// Source closed and buffer empty
    Closed,
    /// Context cancelled or expired
    Cancelled,
    /// Terminal failure
    Error,
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Outbound frames per second
    pub outbound_rate_hz: u32,
    /// Deadline for one intent
    pub intent_timeout: Duration,
    /// Capacity hint for the per-client stream subscription (0 = stream default)
    pub subscriber_buffer: usize,
    /// Events read ahead of the ticker, including a held frame (min 1)
    pub max_buffered: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            outbound_rate_hz: DEFAULT_OUTBOUND_RATE_HZ,
            intent_timeout: DEFAULT_INTENT_TIMEOUT,
            subscriber_buffer: 0,
            max_buffered: DEFAULT_MAX_BUFFERED,
        }
    }
}

impl BridgeConfig {
    /// Ticker period for the configured rate.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.outbound_rate_hz.max(1)))
    }
}

/// Builds the pacing ticker for a given period.
pub type TickerFactory = Arc<dyn Fn(Duration) -> BoxStream<'static, Instant> + Send + Sync>;

/// Ticker backed by `tokio::time::interval`, skipping missed ticks.
pub fn interval_ticker() -> TickerFactory {
    Arc::new(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        stream::unfold(interval, |mut interval| async move {
            let instant = interval.tick().await;
            Some((instant, interval))
        })
        .boxed()
    })
}

/// Counters of a finished outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboundReport {
    /// Frames transmitted
    pub frames_sent: u64,
    /// Compressed bytes transmitted
    pub bytes_sent: u64,
    /// Ticks on which the byte budget held a frame back
    pub frames_deferred: u64,
}

/// Per-client transport bridge.
pub struct TransportBridge<B> {
    broker: Arc<B>,
    compressor: Arc<dyn Compressor>,
    ticker: TickerFactory,
    config: BridgeConfig,
    bandwidth: Option<Arc<BandwidthRegulator>>,
    state: Mutex<BridgeState>,
}

impl<B> TransportBridge<B>
where
    B: DiffSource + IntentSink,
{
    /// Create a bridge with gzip and a wall-clock ticker.
    pub fn new(broker: Arc<B>, config: BridgeConfig) -> Self {
        Self {
            broker,
            compressor: Arc::new(GzipCompressor::new()),
            ticker: interval_ticker(),
            config,
            bandwidth: None,
            state: Mutex::new(BridgeState::Idle),
        }
    }

    /// Replace the codec.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Replace the pacing ticker.
    pub fn with_ticker(mut self, ticker: TickerFactory) -> Self {
        self.ticker = ticker;
        self
    }

    /// Charge outbound frames against a per-client byte budget.
    pub fn with_bandwidth(mut self, regulator: Arc<BandwidthRegulator>) -> Self {
        self.bandwidth = Some(regulator);
        self
    }

    /// Current outbound state.
    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    /// Codec name used on both directions.
    pub fn encoding(&self) -> &'static str {
        self.compressor.name()
    }

    /// Configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "Bridge state");
            *state = next;
        }
    }

    fn fail(&self, error: BridgeError) -> BridgeError {
        match error {
            BridgeError::Canceled | BridgeError::DeadlineExceeded => self.set_state(BridgeState::Cancelled),
            _ => self.set_state(BridgeState::Error),
        }
        error
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Stream paced, compressed diffs to `sink` until the source closes and
    /// the buffer drains, or `ctx` ends.
    ///
    /// A frame refused by the byte budget is kept and retried on the next
    /// tick ahead of everything else.
    #[instrument(skip(self, ctx, sink))]
    pub async fn stream_state_diffs<S: FrameSink>(
        &self,
        ctx: &Context,
        client_id: &str,
        sink: &mut S,
    ) -> Result<OutboundReport, BridgeError> {
        let mut subscription = self
            .broker
            .subscribe_state_diffs(ctx, client_id)
            .map_err(|e| self.fail(e))?;
        self.set_state(BridgeState::Subscribed);

        let mut ticker = (self.ticker)(self.config.tick_period());
        let capacity = self.config.max_buffered.max(1);
        let mut buffer: VecDeque<DiffEvent> = VecDeque::with_capacity(capacity);
        let mut held: Option<DiffFrame> = None;
        let mut source_open = true;
        let mut report = OutboundReport::default();

        loop {
            if !source_open && buffer.is_empty() && held.is_none() {
                self.set_state(BridgeState::Closed);
                info!(
                    frames = report.frames_sent,
                    bytes = report.bytes_sent,
                    deferred = report.frames_deferred,
                    "Diff stream drained"
                );
                return Ok(report);
            }

            tokio::select! {
                biased;

                reason = ctx.cancelled() => {
                    return Err(self.fail(reason.into()));
                }

                event = subscription.events.recv(),
                    if source_open && buffer.len() + usize::from(held.is_some()) < capacity => match event {
                    Some(event) => buffer.push_back(event),
                    None => {
                        source_open = false;
                        self.set_state(BridgeState::Draining);
                    }
                },

                tick = ticker.next() => {
                    if tick.is_none() {
                        return Err(self.fail(BridgeError::TickerStopped));
                    }
                    let frame = match held.take() {
                        Some(frame) => frame,
                        None => {
                            let Some(event) = buffer.pop_front() else {
                                continue;
                            };
                            let payload = self
                                .compressor
                                .compress(&event.payload)
                                .map_err(|e| self.fail(e.into()))?;
                            DiffFrame {
                                sequence: event.sequence,
                                encoding: self.compressor.name().to_string(),
                                payload,
                            }
                        }
                    };
                    let bytes = frame.payload.len() as u64;

                    if let Some(regulator) = &self.bandwidth {
                        if !regulator.allow(client_id, frame.payload.len()) {
                            debug!(sequence = frame.sequence, bytes, "Byte budget exhausted, deferring frame");
                            report.frames_deferred += 1;
                            held = Some(frame);
                            continue;
                        }
                    }

                    tokio::select! {
                        reason = ctx.cancelled() => return Err(self.fail(reason.into())),
                        sent = sink.send(frame) => sent.map_err(|e| self.fail(e))?,
                    }
                    report.frames_sent += 1;
                    report.bytes_sent += bytes;
                }
            }
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Forward client intents to the broker until `source` ends.
    ///
    /// Undecodable or oversized frames and timeouts count as rejected. A codec
    /// mismatch or a disconnect verdict ends the stream with an error.
    #[instrument(skip(self, ctx, source))]
    pub async fn publish_intents<I: IntentSource>(
        &self,
        ctx: &Context,
        source: &mut I,
    ) -> Result<IntentStreamAck, BridgeError> {
        let mut ack = IntentStreamAck::default();

        loop {
            let next = tokio::select! {
                reason = ctx.cancelled() => return Err(reason.into()),
                next = source.recv() => next,
            };
            let frame = match next {
                None => {
                    debug!(accepted = ack.accepted, rejected = ack.rejected, "Intent stream closed");
                    return Ok(ack);
                }
                Some(frame) => frame?,
            };

            if frame.encoding != self.compressor.name() {
                warn!(encoding = %frame.encoding, "Unsupported intent encoding");
                return Err(BridgeError::UnsupportedEncoding(frame.encoding));
            }

            let payload = match self.compressor.decompress(&frame.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(client = %frame.client_id, error = %e, "Dropping undecodable intent");
                    ack.rejected += 1;
                    continue;
                }
            };

            let submission = IntentSubmission {
                client_id: frame.client_id,
                payload,
            };
            let verdict = tokio::select! {
                reason = ctx.cancelled() => return Err(reason.into()),
                verdict = tokio::time::timeout(
                    self.config.intent_timeout,
                    self.broker.process_intent(submission),
                ) => verdict,
            };

            match verdict {
                Err(_) => {
                    warn!(timeout_ms = self.config.intent_timeout.as_millis() as u64, "Intent processing timed out");
                    ack.rejected += 1;
                }
                Ok(IntentVerdict::Accepted) => ack.accepted += 1,
                Ok(IntentVerdict::Rejected { reason }) => {
                    debug!(%reason, "Intent rejected");
                    ack.rejected += 1;
                }
                Ok(IntentVerdict::Disconnect { reason }) => {
                    warn!(%reason, "Intent sink requested disconnect");
                    return Err(BridgeError::PermissionDenied(reason));
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::bandwidth::Clock;
    use crate::network::compress::DEFAULT_MAX_DECODED_BYTES;

    struct StubBroker {
        events: Mutex<Option<mpsc::Receiver<DiffEvent>>>,
        subscribe_error: Option<String>,
        verdicts: Mutex<VecDeque<IntentVerdict>>,
        submissions: Mutex<Vec<IntentSubmission>>,
        delay: Option<Duration>,
    }

    impl StubBroker {
        fn with_events(events: mpsc::Receiver<DiffEvent>) -> Self {
            Self {
                events: Mutex::new(Some(events)),
                subscribe_error: None,
                verdicts: Mutex::new(VecDeque::new()),
                submissions: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn closed_with(events: Vec<DiffEvent>) -> Self {
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                tx.try_send(event).unwrap();
            }
            Self::with_events(rx)
        }

        fn with_verdicts(verdicts: Vec<IntentVerdict>) -> Self {
            let broker = Self::closed_with(Vec::new());
            *broker.verdicts.lock() = verdicts.into();
            broker
        }
    }

    impl DiffSource for StubBroker {
        fn subscribe_state_diffs(&self, _ctx: &Context, _client_id: &str) -> Result<DiffSubscription, BridgeError> {
            if let Some(reason) = &self.subscribe_error {
                return Err(BridgeError::Subscribe(reason.clone()));
            }
            let events = self
                .events
                .lock()
                .take()
                .ok_or_else(|| BridgeError::Subscribe("already subscribed".to_string()))?;
            Ok(DiffSubscription::new(events))
        }
    }

    impl IntentSink for StubBroker {
        fn process_intent(&self, submission: IntentSubmission) -> impl Future<Output = IntentVerdict> + Send {
            self.submissions.lock().push(submission);
            let verdict = self.verdicts.lock().pop_front().unwrap_or(IntentVerdict::Accepted);
            let delay = self.delay;
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                verdict
            }
        }
    }

    fn manual_ticker() -> (mpsc::UnboundedSender<()>, TickerFactory) {
        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let slot = Arc::new(Mutex::new(Some(rx)));
        let factory: TickerFactory = Arc::new(move |_period| {
            let rx = slot.lock().take();
            stream::unfold(rx, |rx| async move {
                let mut rx = rx?;
                rx.recv().await?;
                Some((Instant::now(), Some(rx)))
            })
            .boxed()
        });
        (tx, factory)
    }

    fn event(sequence: u64, payload: &[u8]) -> DiffEvent {
        DiffEvent {
            sequence,
            payload: payload.to_vec(),
        }
    }

    fn intent(codec: &GzipCompressor, payload: &[u8]) -> IntentFrame {
        IntentFrame {
            client_id: "bot-a".to_string(),
            encoding: codec.name().to_string(),
            payload: codec.compress(payload).unwrap(),
        }
    }

    fn intents(frames: Vec<IntentFrame>) -> mpsc::Receiver<IntentFrame> {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            tx.try_send(frame).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_stream_single_frame() {
        let codec = GzipCompressor::new();
        let broker = Arc::new(StubBroker::closed_with(vec![event(42, b"diff-json")]));
        let (ticks, ticker) = manual_ticker();
        let bridge = TransportBridge::new(broker, BridgeConfig::default()).with_ticker(ticker);
        assert_eq!(bridge.state(), BridgeState::Idle);

        ticks.send(()).unwrap();
        ticks.send(()).unwrap();

        let (mut sink, mut frames) = mpsc::channel::<DiffFrame>(8);
        let report = bridge
            .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
            .await
            .unwrap();

        assert_eq!(report.frames_sent, 1);
        assert_eq!(bridge.state(), BridgeState::Closed);

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.encoding, "gzip");
        assert_eq!(codec.decompress(&frame.payload).unwrap(), b"diff-json");
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_subscribe_error() {
        let mut broker = StubBroker::closed_with(Vec::new());
        broker.subscribe_error = Some("subscribe failed".to_string());
        let bridge = TransportBridge::new(Arc::new(broker), BridgeConfig::default());

        let (mut sink, _frames) = mpsc::channel::<DiffFrame>(1);
        let err = bridge
            .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Subscribe(_)));
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(bridge.state(), BridgeState::Error);
    }

    #[tokio::test]
    async fn test_stream_one_frame_per_tick_in_order() {
        let codec = GzipCompressor::new();
        let (upstream, events) = mpsc::channel::<DiffEvent>(4);
        let broker = Arc::new(StubBroker::with_events(events));
        let (ticks, ticker) = manual_ticker();
        let bridge = Arc::new(TransportBridge::new(broker, BridgeConfig::default()).with_ticker(ticker));

        for sequence in 1..=3 {
            upstream.send(event(sequence, b"ordered")).await.unwrap();
        }
        drop(upstream);

        let (sink, mut frames) = mpsc::channel::<DiffFrame>(8);
        let task = {
            let bridge = bridge.clone();
            let mut sink = sink;
            tokio::spawn(async move {
                bridge
                    .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
                    .await
            })
        };

        ticks.send(()).unwrap();
        ticks.send(()).unwrap();
        let first = frames.recv().await.unwrap();
        let second = frames.recv().await.unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));

        // Two ticks, two frames: the third waits for the next tick
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(frames.try_recv().is_err());
        assert_eq!(bridge.state(), BridgeState::Draining);

        ticks.send(()).unwrap();
        let third = frames.recv().await.unwrap();
        assert_eq!(third.sequence, 3);
        assert_eq!(codec.decompress(&third.payload).unwrap(), b"ordered");

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.frames_sent, 3);
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_stream_cancelled() {
        let (_upstream, events) = mpsc::channel::<DiffEvent>(1);
        let broker = Arc::new(StubBroker::with_events(events));
        let (_ticks, ticker) = manual_ticker();
        let bridge = Arc::new(TransportBridge::new(broker, BridgeConfig::default()).with_ticker(ticker));
        let (ctx, cancel) = Context::with_cancel();

        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let (mut sink, _frames) = mpsc::channel::<DiffFrame>(1);
                bridge.stream_state_diffs(&ctx, "bot-a", &mut sink).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Canceled));
        assert_eq!(err.code(), ErrorCode::Canceled);
        assert_eq!(bridge.state(), BridgeState::Cancelled);
    }

    #[tokio::test]
    async fn test_stream_deadline_exceeded() {
        let (_upstream, events) = mpsc::channel::<DiffEvent>(1);
        let broker = Arc::new(StubBroker::with_events(events));
        let (_ticks, ticker) = manual_ticker();
        let bridge = TransportBridge::new(broker, BridgeConfig::default()).with_ticker(ticker);
        let (ctx, _cancel) = Context::with_timeout(Duration::from_millis(20));

        let (mut sink, _frames) = mpsc::channel::<DiffFrame>(1);
        let err = bridge.stream_state_diffs(&ctx, "bot-a", &mut sink).await.unwrap_err();
        assert!(matches!(err, BridgeError::DeadlineExceeded));
        assert_eq!(bridge.state(), BridgeState::Cancelled);
    }

    #[tokio::test]
    async fn test_stream_ticker_stopped() {
        let broker = Arc::new(StubBroker::closed_with(vec![event(1, b"x")]));
        let (ticks, ticker) = manual_ticker();
        drop(ticks);
        let bridge = TransportBridge::new(broker, BridgeConfig::default()).with_ticker(ticker);

        let (mut sink, _frames) = mpsc::channel::<DiffFrame>(1);
        let err = bridge
            .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TickerStopped));
        assert_eq!(bridge.state(), BridgeState::Error);
    }

    #[tokio::test]
    async fn test_stream_with_interval_ticker() {
        let broker = Arc::new(StubBroker::closed_with(vec![event(1, b"a"), event(2, b"b")]));
        let config = BridgeConfig {
            outbound_rate_hz: 200,
            ..Default::default()
        };
        let bridge = TransportBridge::new(broker, config);

        let (mut sink, mut frames) = mpsc::channel::<DiffFrame>(4);
        let report = bridge
            .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
            .await
            .unwrap();
        assert_eq!(report.frames_sent, 2);
        assert_eq!(frames.recv().await.unwrap().sequence, 1);
        assert_eq!(frames.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_stream_buffer_is_bounded() {
        let (upstream, events) = mpsc::channel::<DiffEvent>(16);
        for sequence in 1..=10 {
            upstream.send(event(sequence, b"backlog")).await.unwrap();
        }
        let broker = Arc::new(StubBroker::with_events(events));
        let (ticks, ticker) = manual_ticker();
        let config = BridgeConfig {
            max_buffered: 2,
            ..Default::default()
        };
        let bridge = Arc::new(TransportBridge::new(broker, config).with_ticker(ticker));

        let (sink, mut frames) = mpsc::channel::<DiffFrame>(16);
        let task = {
            let bridge = bridge.clone();
            let mut sink = sink;
            tokio::spawn(async move {
                bridge
                    .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
                    .await
            })
        };

        // No ticks yet: the bridge reads two events and leaves the rest upstream
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(upstream.capacity(), 16 - 8);

        ticks.send(()).unwrap();
        assert_eq!(frames.recv().await.unwrap().sequence, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(upstream.capacity(), 16 - 7);

        drop(upstream);
        for _ in 0..9 {
            ticks.send(()).unwrap();
        }
        for sequence in 2..=10 {
            assert_eq!(frames.recv().await.unwrap().sequence, sequence);
        }
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.frames_sent, 10);
    }

    #[tokio::test]
    async fn test_stream_defers_frames_over_byte_budget() {
        let codec = GzipCompressor::new();
        let payload = b"steady diff payload".to_vec();
        let frame_len = codec.compress(&payload).unwrap().len();

        let now = Arc::new(Mutex::new(Instant::now()));
        let clock: Clock = {
            let now = now.clone();
            Arc::new(move || *now.lock())
        };
        // Budget of exactly one frame per second
        let regulator = Arc::new(BandwidthRegulator::with_clock(frame_len as u64, clock));

        let broker = Arc::new(StubBroker::closed_with(vec![
            event(1, &payload),
            event(2, &payload),
            event(3, &payload),
        ]));
        let (ticks, ticker) = manual_ticker();
        let bridge = Arc::new(
            TransportBridge::new(broker, BridgeConfig::default())
                .with_ticker(ticker)
                .with_bandwidth(regulator.clone()),
        );

        let (sink, mut frames) = mpsc::channel::<DiffFrame>(8);
        let task = {
            let bridge = bridge.clone();
            let mut sink = sink;
            tokio::spawn(async move {
                bridge
                    .stream_state_diffs(&Context::background(), "bot-a", &mut sink)
                    .await
            })
        };

        ticks.send(()).unwrap();
        assert_eq!(frames.recv().await.unwrap().sequence, 1);

        // Budget spent: the tick passes without a frame
        ticks.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(frames.try_recv().is_err());
        assert_eq!(regulator.snapshot_usage()["bot-a"].denied, 1);

        *now.lock() += Duration::from_secs(1);
        ticks.send(()).unwrap();
        assert_eq!(frames.recv().await.unwrap().sequence, 2);

        ticks.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(frames.try_recv().is_err());

        *now.lock() += Duration::from_secs(1);
        ticks.send(()).unwrap();
        let last = frames.recv().await.unwrap();
        assert_eq!(last.sequence, 3);
        assert_eq!(codec.decompress(&last.payload).unwrap(), payload);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.frames_deferred, 2);
        assert_eq!(report.bytes_sent, 3 * frame_len as u64);
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_publish_intents_counts() {
        let codec = GzipCompressor::new();
        let broker = Arc::new(StubBroker::with_verdicts(vec![
            IntentVerdict::Accepted,
            IntentVerdict::Rejected {
                reason: "rejected".to_string(),
            },
        ]));
        let bridge = TransportBridge::new(broker.clone(), BridgeConfig::default());

        let mut source = intents(vec![intent(&codec, b"intent-one"), intent(&codec, b"intent-two")]);
        let ack = bridge
            .publish_intents(&Context::background(), &mut source)
            .await
            .unwrap();

        assert_eq!(ack, IntentStreamAck { accepted: 1, rejected: 1 });
        let submissions = broker.submissions.lock();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].payload, b"intent-one");
        assert_eq!(submissions[1].payload, b"intent-two");
        assert_eq!(submissions[0].client_id, "bot-a");
    }

    #[tokio::test]
    async fn test_publish_intents_disconnect() {
        let codec = GzipCompressor::new();
        let broker = Arc::new(StubBroker::with_verdicts(vec![IntentVerdict::Disconnect {
            reason: "fatal".to_string(),
        }]));
        let bridge = TransportBridge::new(broker, BridgeConfig::default());

        let mut source = intents(vec![intent(&codec, b"intent"), intent(&codec, b"never")]);
        let err = bridge
            .publish_intents(&Context::background(), &mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(ref reason) if reason == "fatal"));
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_publish_intents_unsupported_encoding() {
        let broker = Arc::new(StubBroker::with_verdicts(Vec::new()));
        let bridge = TransportBridge::new(broker.clone(), BridgeConfig::default());

        let mut source = intents(vec![IntentFrame {
            client_id: "bot-a".to_string(),
            encoding: "zstd".to_string(),
            payload: b"raw".to_vec(),
        }]);
        let err = bridge
            .publish_intents(&Context::background(), &mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedEncoding(ref e) if e == "zstd"));
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(broker.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_intents_decompress_failure_is_soft() {
        let codec = GzipCompressor::new();
        let broker = Arc::new(StubBroker::with_verdicts(Vec::new()));
        let bridge = TransportBridge::new(broker.clone(), BridgeConfig::default());

        let corrupt = IntentFrame {
            client_id: "bot-a".to_string(),
            encoding: "gzip".to_string(),
            payload: b"not gzip".to_vec(),
        };
        let empty = IntentFrame {
            payload: Vec::new(),
            ..corrupt.clone()
        };
        let mut source = intents(vec![corrupt, empty, intent(&codec, b"good")]);

        let ack = bridge
            .publish_intents(&Context::background(), &mut source)
            .await
            .unwrap();
        assert_eq!(ack, IntentStreamAck { accepted: 1, rejected: 2 });
        assert_eq!(broker.submissions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_intents_oversized_is_soft() {
        let codec = GzipCompressor::new();
        let broker = Arc::new(StubBroker::with_verdicts(Vec::new()));
        let bridge = TransportBridge::new(broker.clone(), BridgeConfig::default());

        // Highly compressible: a few KiB on the wire, past the cap once inflated
        let inflated = vec![b' '; 2 * DEFAULT_MAX_DECODED_BYTES];
        let mut source = intents(vec![intent(&codec, &inflated), intent(&codec, b"good")]);

        let ack = bridge
            .publish_intents(&Context::background(), &mut source)
            .await
            .unwrap();
        assert_eq!(ack, IntentStreamAck { accepted: 1, rejected: 1 });
        let submissions = broker.submissions.lock();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].payload, b"good");
    }

    #[tokio::test]
    async fn test_publish_intents_timeout_counts_rejected() {
        let codec = GzipCompressor::new();
        let mut broker = StubBroker::with_verdicts(Vec::new());
        broker.delay = Some(Duration::from_millis(250));
        let config = BridgeConfig {
            intent_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        let bridge = TransportBridge::new(Arc::new(broker), config);

        let mut source = intents(vec![intent(&codec, b"slow")]);
        let started = Instant::now();
        let ack = bridge
            .publish_intents(&Context::background(), &mut source)
            .await
            .unwrap();
        assert_eq!(ack, IntentStreamAck { accepted: 0, rejected: 1 });
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_publish_intents_cancelled() {
        let broker = Arc::new(StubBroker::with_verdicts(Vec::new()));
        let bridge = TransportBridge::new(broker, BridgeConfig::default());
        let (_client, mut source) = mpsc::channel::<IntentFrame>(1);
        let (ctx, cancel) = Context::with_cancel();
        cancel.cancel();

        let err = bridge.publish_intents(&ctx, &mut source).await.unwrap_err();
        assert!(matches!(err, BridgeError::Canceled));
    }

    #[test]
    fn test_tick_period() {
        assert_eq!(BridgeConfig::default().tick_period(), Duration::from_millis(50));
        let zero = BridgeConfig {
            outbound_rate_hz: 0,
            ..Default::default()
        };
        assert_eq!(zero.tick_period(), Duration::from_secs(1));
    }
}
