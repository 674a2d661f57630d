//! Network Layer
//!
//! Everything between the broker and its clients: wire messages, payload
//! codecs, per-client byte budgets, the transport bridge, handshake auth and
//! the WebSocket server.

pub mod auth;
pub mod bandwidth;
pub mod bridge;
pub mod compress;
pub mod protocol;
pub mod server;

pub use auth::{issue_token, validate_token, validate_token_at, AuthConfig, AuthError, TokenClaims};
pub use bandwidth::{BandwidthRegulator, BandwidthUsage, DEFAULT_BANDWIDTH_BYTES_PER_SEC};
pub use bridge::{
    interval_ticker, BridgeConfig, BridgeError, BridgeState, DiffEvent, DiffSource,
    DiffSubscription, FrameSink, IntentSink, IntentSource, IntentSubmission, IntentVerdict,
    OutboundReport, TickerFactory, TransportBridge,
};
pub use compress::{CompressionError, Compressor, GzipCompressor, DEFAULT_MAX_DECODED_BYTES};
pub use protocol::{
    ClientMessage, DiffFrame, ErrorCode, ErrorInfo, HelloRequest, IntentFrame, IntentStreamAck,
    ServerMessage, WelcomeInfo,
};
pub use server::{authenticate, BrokerServer, ServerError};
