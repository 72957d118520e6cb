//! Public types for the stream-subscriber crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::ErrorResponse;

/// Wire format identifier for JSON payloads.
pub const FORMAT_JSON: &str = "application/json";
/// Wire format identifier for protobuf payloads.
pub const FORMAT_PROTOBUF: &str = "application/x-protobuf";

pub(crate) const DEFAULT_REFRESH_RATE_MS: u64 = 1000;
pub(crate) const MIN_REFRESH_RATE_MS: u64 = 100;

/// Whether an update carries the full state or an incremental change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Snapshot,
    Delta,
}

/// Events emitted by a [`Subscription`](crate::Subscription).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Decoded data for the subscription. Deltas carry the whole push message
    /// (`ReferenceId`, `Data`, optional `SchemaName`) with `Data` decoded.
    Update { data: serde_json::Value, kind: UpdateKind },
    /// The server confirmed the subscription.
    Created,
    /// The server rejected a request and no queued intent superseded it.
    Error(ErrorResponse),
    /// A subscribe request got no response; a retry has been scheduled.
    NetworkError,
    /// The subscription was removed and may be dropped by its owner.
    ReadyToRemove,
    /// The action queue drained with nothing left to do.
    QueueEmpty,
}

/// A payload as it arrives from the push channel or a control response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Already-decoded JSON, or a text payload (base64 protobuf / JSON text).
    Json(serde_json::Value),
    /// Raw bytes straight off a binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(serde_json::Value::Null) => true,
            Payload::Json(serde_json::Value::String(s)) => s.is_empty(),
            Payload::Json(_) => false,
            Payload::Binary(bytes) => bytes.is_empty(),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// A message received on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingMessage {
    pub reference_id: String,
    pub data: Payload,
    pub schema_name: Option<String>,
}

impl StreamingMessage {
    pub fn new(reference_id: impl Into<String>, data: impl Into<Payload>) -> Self {
        Self {
            reference_id: reference_id.into(),
            data: data.into(),
            schema_name: None,
        }
    }

    /// Render the message with its data replaced by the decoded value.
    pub(crate) fn to_update(&self, decoded: serde_json::Value) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "ReferenceId".to_string(),
            serde_json::Value::String(self.reference_id.clone()),
        );
        obj.insert("Data".to_string(), decoded);
        if let Some(ref name) = self.schema_name {
            obj.insert(
                "SchemaName".to_string(),
                serde_json::Value::String(name.clone()),
            );
        }
        serde_json::Value::Object(obj)
    }
}

/// What happened to a push message handed to
/// [`Subscription::on_streaming_data`](crate::Subscription::on_streaming_data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingOutcome {
    /// Decoded and emitted as a delta.
    Delivered,
    /// Held until the snapshot arrives.
    Buffered,
    /// Discarded; the subscription is going away.
    Dropped,
    /// The subscription is not subscribed; the caller may route the message elsewhere.
    NotSubscribed,
}

/// How a modification should be applied by
/// [`Subscription::on_modify`](crate::Subscription::on_modify).
#[derive(Debug, Clone, Default)]
pub struct ModifyOptions {
    /// Send only `patch_delta` to the existing subscription.
    pub is_patch: bool,
    /// Swap the subscription server-side in one request.
    pub is_replace: bool,
    /// The argument changes sent with a patch.
    pub patch_delta: serde_json::Value,
}

/// Subscription parameters sent with every subscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SubscriptionData {
    pub format: Option<String>,
    pub arguments: serde_json::Value,
    /// Milliseconds between updates. Clamped to at least 100.
    pub refresh_rate: u64,
    pub top: Option<u32>,
    pub tag: Option<String>,
}

impl Default for SubscriptionData {
    fn default() -> Self {
        Self {
            format: None,
            arguments: serde_json::Value::Null,
            refresh_rate: DEFAULT_REFRESH_RATE_MS,
            top: None,
            tag: None,
        }
    }
}

impl SubscriptionData {
    pub(crate) fn normalize(&mut self) {
        if self.refresh_rate < MIN_REFRESH_RATE_MS {
            tracing::warn!(
                refresh_rate = self.refresh_rate,
                "Refresh rate below minimum, using {MIN_REFRESH_RATE_MS}ms"
            );
            self.refresh_rate = MIN_REFRESH_RATE_MS;
        }
    }
}

/// Timers used by the subscription state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before re-subscribing after a network error.
    pub network_retry_delay_ms: u64,
    /// Window in which `reset_burst` resets arm the suppression timer.
    pub reset_window_ms: u64,
    /// How long resets are suppressed once a burst is detected.
    pub reset_suppression_ms: u64,
    /// Number of recent resets considered a burst.
    pub reset_burst: usize,
    /// Events buffered for [`Subscription::next`](crate::Subscription::next)
    /// before new ones are dropped.
    pub event_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            network_retry_delay_ms: 5_000,
            reset_window_ms: 60_000,
            reset_suppression_ms: 60_000,
            reset_burst: 3,
            event_channel_capacity: 256,
        }
    }
}

impl TimingConfig {
    pub fn network_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network_retry_delay_ms)
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_millis(self.reset_window_ms)
    }

    pub fn reset_suppression(&self) -> Duration {
        Duration::from_millis(self.reset_suppression_ms)
    }
}

/// Configuration for [`Subscription::new`](crate::Subscription::new).
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Service group the endpoint belongs to (e.g. `"trade"`).
    pub service_path: String,
    /// Endpoint path, relative to the service path (e.g. `"v1/prices/subscriptions"`).
    pub url: String,
    /// Push-channel context the deltas will arrive on.
    pub streaming_context_id: String,
    pub data: SubscriptionData,
    /// Timer overrides. Defaults to [`TimingConfig::default`].
    pub timing: Option<TimingConfig>,
}

impl SubscriptionConfig {
    pub fn new(
        service_path: impl Into<String>,
        url: impl Into<String>,
        streaming_context_id: impl Into<String>,
        data: SubscriptionData,
    ) -> Self {
        Self {
            service_path: service_path.into(),
            url: url.into(),
            streaming_context_id: streaming_context_id.into(),
            data,
            timing: None,
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid action: {0:#04x}")]
    InvalidAction(u8),

    #[error("subscription has been disposed")]
    Disposed,

    #[error("schema parsing failed: {0}")]
    SchemaParsingFailed(String),

    #[error("parsing failed: {0}")]
    ParsingFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
