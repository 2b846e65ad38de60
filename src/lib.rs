//! # Aequitas real-time client
//!
//! One persistent WebSocket to the trading server, many logical subscriptions
//! (per-instrument market data, the per-user notification feed) multiplexed
//! over it, with automatic reconnection and resubscription.
//!
//! ## Architecture
//!
//! The crate is organized in layers:
//!
//! 1. **Core**: Channel newtype, wire messages, config (always available)
//! 2. **Auth**: `CredentialProvider` consumed on every connection attempt
//! 3. **Registry**: channel → subscriber sets, fan-out, resubscribe frames
//! 4. **Connection**: sans-IO state machine, reconnect policy, outbound queue
//! 5. **Native driver**: `WsClient` on `tokio-tungstenite` (`ws-native` feature)
//!
//! ## Delivery guarantees
//!
//! At-most-once. Within one connected session payloads arrive in transport
//! order; across a reconnect anything in flight or published during the outage
//! is lost. Consumers should treat each channel as "best effort since the last
//! successful connection" and watch [`ws::ConnectionState`] to show gaps.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use aequitas_realtime::prelude::*;
//!
//! let creds = SessionCredentials::with_token(jwt);
//! let client = WsClient::try_new(WsConfig::from_env()?, creds)?;
//!
//! let chart = FnSubscriber::new(|candle| println!("candle: {candle}"));
//! client.subscribe("RELIANCE", chart.clone());
//! client.connect();
//! // ...
//! client.unsubscribe("RELIANCE", &chart);
//! client.disconnect();
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Shared newtypes.
pub mod shared;

/// Unified error types.
pub mod error;

/// Network URL constants.
pub mod network;

// ── Layer 2: Auth ────────────────────────────────────────────────────────────

/// Credential provider consumed by the WebSocket client.
pub mod auth;

// ── Layers 3-5: WebSocket ────────────────────────────────────────────────────

/// WebSocket client: messages, registry, connection state machine, driver.
pub mod ws;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    pub use crate::shared::Channel;

    // Errors
    pub use crate::error::{ClientError, ConfigError, WsError};

    // Network
    pub use crate::network::{DEFAULT_API_URL, DEFAULT_WS_URL};

    // Auth
    pub use crate::auth::{CredentialProvider, SessionCredentials};

    // WebSocket types
    pub use crate::ws::{
        ConnectionState, FnSubscriber, MessageIn, MessageOut, ReconnectPolicy, Subscriber,
        SubscriberRef, WsConfig,
    };

    #[cfg(feature = "ws-native")]
    pub use crate::ws::native::WsClient;
    #[cfg(feature = "ws-native")]
    pub use crate::ws::ChannelSubscriber;
}
