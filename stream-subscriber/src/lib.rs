//! Client-side engine for server-push streaming subscriptions.
//!
//! A [`Subscription`] creates, patches, replaces and deletes one server-side
//! subscription over a request/response [`Transport`], and decodes the
//! snapshot and the deltas that arrive on a separate push channel.
//!
//! # Features
//! - Intents are serialized: at most one control request is in flight and
//!   later intents are queued and collapsed
//! - Stale responses from superseded requests are ignored
//! - JSON and protobuf payloads, with automatic fallback to JSON when an
//!   endpoint rejects protobuf or a payload cannot be decoded
//! - Delta-compressed protobuf messages have null and emptied fields restored
//! - Orphan detection based on the server's inactivity timeout
//! - Suppression of reset storms while a publisher is down
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), stream_subscriber::Error> {
//! use std::sync::Arc;
//! use stream_subscriber::{
//!     Event, HttpTransport, HttpTransportConfig, Runtime, Subscription, SubscriptionConfig,
//!     SubscriptionData,
//! };
//!
//! let transport = HttpTransport::new(HttpTransportConfig {
//!     base_url: "https://gateway.example.com/openapi/".to_string(),
//!     auth_token: Some("token".to_string()),
//!     ..Default::default()
//! })?;
//! let runtime = Runtime::new(Arc::new(transport));
//!
//! let data = SubscriptionData {
//!     arguments: serde_json::json!({"Uic": 21, "AssetType": "FxSpot"}),
//!     ..Default::default()
//! };
//! let config = SubscriptionConfig::new("trade", "v1/infoprices/subscriptions", "ctx-1", data);
//! let mut sub = Subscription::new(config, &runtime);
//! sub.on_subscribe()?;
//!
//! while let Some(event) = sub.next().await {
//!     match event {
//!         Event::Update { data, .. } => println!("got: {data}"),
//!         Event::Error(err) => eprintln!("rejected: {:?}", err.error_code()),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod http;
pub mod parser;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod subscription;
pub mod transport;
mod types;

pub use action::{Action, QueuedItem};
pub use http::{HttpTransport, HttpTransportConfig};
pub use parser::{JsonParser, Parser, ParserFactory, Parsers};
#[cfg(feature = "protobuf")]
pub use parser::ProtobufParser;
pub use protocol::ErrorResponse;
pub use queue::ActionQueue;
pub use scheduler::{ReferenceIds, Runtime, Scheduler, TokioScheduler};
pub use state::SubscriptionState;
pub use subscription::Subscription;
pub use transport::{RequestOptions, Response, Transport, TransportError};
pub use types::{
    Error, Event, FORMAT_JSON, FORMAT_PROTOBUF, ModifyOptions, Payload, Result,
    StreamingMessage, StreamingOutcome, SubscriptionConfig, SubscriptionData, TimingConfig,
    UpdateKind,
};
