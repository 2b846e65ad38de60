//! WebSocket layer: wire messages, connection state, configuration.
//!
//! - [`subscriptions`]: channel registry and payload fan-out
//! - [`connection`]: sans-IO connection state machine, reconnect policy, outbound queue
//! - `native` (`ws-native` feature): `tokio-tungstenite` driver exposing [`native::WsClient`]
//!
//! Delivery is at-most-once: a channel's stream is "best effort since the last
//! successful connection". Frames in flight when the socket drops, and anything
//! the server publishes during an outage, are not replayed.

pub mod connection;
pub mod subscriptions;

#[cfg(feature = "ws-native")]
pub mod native;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, WsError};
use crate::shared::Channel;

pub use connection::{ConnectionManager, ReconnectPolicy};
pub use subscriptions::{FnSubscriber, Subscriber, SubscriberRef, SubscriptionRegistry};

#[cfg(feature = "ws-native")]
pub use subscriptions::ChannelSubscriber;

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Control frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageOut {
    Subscribe { channel: Channel },
    Unsubscribe { channel: Channel },
}

impl MessageOut {
    pub fn subscribe(channel: impl Into<Channel>) -> Self {
        Self::Subscribe {
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<Channel>) -> Self {
        Self::Unsubscribe {
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &Channel {
        match self {
            Self::Subscribe { channel } | Self::Unsubscribe { channel } => channel,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for MessageOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { channel } => write!(f, "subscribe({})", channel),
            Self::Unsubscribe { channel } => write!(f, "unsubscribe({})", channel),
        }
    }
}

// ─── Inbound messages ────────────────────────────────────────────────────────

/// Parsed inbound frame from the server.
///
/// The payload of a data frame is opaque to the client and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawFrame")]
pub enum MessageIn {
    Data { channel: Channel, payload: Value },
    Error { detail: Value },
}

impl MessageIn {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, WsError> {
        serde_json::from_str(text).map_err(|e| WsError::DeserializationError(e.to_string()))
    }
}

/// Loose shape accepted off the wire before validation.
///
/// Besides the canonical `data`/`error` frames the backend also emits
/// `candle` frames (channel in `data.instrumentId`) and `notification` frames
/// (implicitly on the notification channel), both carrying their body in `data`.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "symbol")]
    channel: Option<Channel>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    detail: Option<Value>,
}

impl TryFrom<RawFrame> for MessageIn {
    type Error = String;

    fn try_from(raw: RawFrame) -> Result<Self, String> {
        match raw.kind.as_str() {
            "data" => {
                let channel = raw.channel.ok_or("data frame without channel")?;
                let payload = raw.payload.or(raw.data).unwrap_or(Value::Null);
                Ok(MessageIn::Data { channel, payload })
            }
            "candle" => {
                let payload = raw.data.or(raw.payload).unwrap_or(Value::Null);
                let channel = raw
                    .channel
                    .or_else(|| {
                        payload
                            .get("instrumentId")
                            .and_then(Value::as_str)
                            .map(Channel::from)
                    })
                    .ok_or("candle frame without instrumentId")?;
                Ok(MessageIn::Data { channel, payload })
            }
            "notification" => Ok(MessageIn::Data {
                channel: Channel::notifications(),
                payload: raw.data.or(raw.payload).unwrap_or(Value::Null),
            }),
            "error" => Ok(MessageIn::Error {
                detail: raw.detail.or(raw.data).unwrap_or(Value::Null),
            }),
            other => Err(format!("unknown frame type: {}", other)),
        }
    }
}

// ─── Connection state ────────────────────────────────────────────────────────

/// Observable state of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect budget spent. Only an explicit `connect()` leaves this state.
    Exhausted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Configuration for the WS client.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    /// Consecutive failed attempts after which the client gives up.
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u64,
    /// Multiplier applied to the delay for every further failed attempt.
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_delay_ms: u64,
    /// Upper bound of the random delay added to each scheduled reconnect.
    pub reconnect_jitter_ms: u64,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: crate::network::DEFAULT_WS_URL.to_string(),
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 2000,
            reconnect_backoff_factor: 2.0,
            max_reconnect_delay_ms: 30_000,
            reconnect_jitter_ms: 500,
            connect_timeout_ms: 30_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
        }
    }
}

const ENV_WS_URL: &str = "AEQUITAS_WS_URL";
const ENV_API_URL: &str = "AEQUITAS_API_URL";
const ENV_MAX_ATTEMPTS: &str = "AEQUITAS_WS_MAX_RECONNECT_ATTEMPTS";
const ENV_RECONNECT_DELAY: &str = "AEQUITAS_WS_RECONNECT_DELAY_MS";

impl WsConfig {
    /// Default config pointed at the WebSocket endpoint of a REST API base URL.
    pub fn from_api_url(api_url: &str) -> Self {
        Self {
            url: crate::network::ws_url_from_api_url(api_url),
            ..Default::default()
        }
    }

    /// Build a config from the process environment.
    ///
    /// `AEQUITAS_WS_URL` wins over `AEQUITAS_API_URL`; the reconnect budget and
    /// base delay can be overridden with `AEQUITAS_WS_MAX_RECONNECT_ATTEMPTS` and
    /// `AEQUITAS_WS_RECONNECT_DELAY_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match (lookup(ENV_WS_URL), lookup(ENV_API_URL)) {
            (Some(url), _) => Self {
                url,
                ..Default::default()
            },
            (None, Some(api_url)) => Self::from_api_url(&api_url),
            (None, None) => Self::default(),
        };

        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            config.max_reconnect_attempts = parse_env(ENV_MAX_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RECONNECT_DELAY) {
            config.base_reconnect_delay_ms = parse_env(ENV_RECONNECT_DELAY, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the config for values the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::ZeroReconnectAttempts);
        }
        if self.pong_timeout_ms == 0 {
            return Err(ConfigError::ZeroPongTimeout);
        }
        let factor = self.reconnect_backoff_factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(ConfigError::InvalidBackoffFactor(factor.to_string()));
        }
        Ok(())
    }

    /// The reconnect policy described by this config.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: std::time::Duration::from_millis(self.base_reconnect_delay_ms),
            backoff_factor: self.reconnect_backoff_factor,
            max_delay: std::time::Duration::from_millis(self.max_reconnect_delay_ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_subscribe_frame_wire_format() {
        let json = MessageOut::subscribe("RELIANCE").to_json().unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, json!({"type": "subscribe", "channel": "RELIANCE"}));
    }

    #[test]
    fn test_unsubscribe_frame_wire_format() {
        let json = MessageOut::unsubscribe(Channel::notifications()).to_json().unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "unsubscribe");
        assert_eq!(parsed["channel"], "notifications");
    }

    #[test]
    fn test_decode_data_frame() {
        let msg =
            MessageIn::decode(r#"{"type":"data","channel":"RELIANCE","payload":{"ltp":100}}"#)
                .unwrap();
        assert_eq!(
            msg,
            MessageIn::Data {
                channel: Channel::new("RELIANCE"),
                payload: json!({"ltp": 100}),
            }
        );
    }

    #[test]
    fn test_decode_data_frame_without_channel_fails() {
        let err = MessageIn::decode(r#"{"type":"data","payload":{"ltp":100}}"#).unwrap_err();
        assert!(matches!(err, WsError::DeserializationError(_)));
    }

    #[test]
    fn test_decode_error_frame() {
        let msg = MessageIn::decode(r#"{"type":"error","detail":"Invalid message format"}"#)
            .unwrap();
        assert_eq!(
            msg,
            MessageIn::Error {
                detail: json!("Invalid message format")
            }
        );
    }

    #[test]
    fn test_decode_candle_frame_routes_by_instrument() {
        let msg = MessageIn::decode(
            r#"{"type":"candle","data":{"instrumentId":"TCS","close":3400.5}}"#,
        )
        .unwrap();
        match msg {
            MessageIn::Data { channel, payload } => {
                assert_eq!(channel.as_str(), "TCS");
                assert_eq!(payload["close"], 3400.5);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification_frame() {
        let msg = MessageIn::decode(r#"{"type":"notification","data":{"title":"Order filled"}}"#)
            .unwrap();
        match msg {
            MessageIn::Data { channel, payload } => {
                assert!(channel.is_notifications());
                assert_eq!(payload["title"], "Order filled");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage_and_unknown_types() {
        assert!(MessageIn::decode("not json").is_err());
        assert!(MessageIn::decode(r#"{"channel":"X"}"#).is_err());
        assert!(MessageIn::decode(r#"{"type":"bogus","channel":"X"}"#).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.base_reconnect_delay_ms, 2000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_url = WsConfig {
            url: "http://localhost/ws".into(),
            ..Default::default()
        };
        assert!(matches!(bad_url.validate(), Err(ConfigError::InvalidUrl(_))));

        let zero = WsConfig {
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroReconnectAttempts));

        let no_pong_grace = WsConfig {
            pong_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(no_pong_grace.validate(), Err(ConfigError::ZeroPongTimeout));

        let shrinking = WsConfig {
            reconnect_backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            shrinking.validate(),
            Err(ConfigError::InvalidBackoffFactor(_))
        ));
    }

    #[test]
    fn test_from_lookup_prefers_ws_url() {
        let vars: HashMap<&str, &str> = [
            (ENV_WS_URL, "wss://stream.example.com/ws"),
            (ENV_API_URL, "http://ignored/api"),
            (ENV_MAX_ATTEMPTS, "8"),
        ]
        .into_iter()
        .collect();
        let config = WsConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.url, "wss://stream.example.com/ws");
        assert_eq!(config.max_reconnect_attempts, 8);
    }

    #[test]
    fn test_from_lookup_derives_from_api_url() {
        let config = WsConfig::from_lookup(|k| {
            (k == ENV_API_URL).then(|| "https://trade.example.com/api".to_string())
        })
        .unwrap();
        assert_eq!(config.url, "wss://trade.example.com/ws");
    }

    #[test]
    fn test_from_lookup_rejects_non_numeric_override() {
        let err = WsConfig::from_lookup(|k| {
            (k == ENV_RECONNECT_DELAY).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
