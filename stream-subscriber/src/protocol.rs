//! Control-channel request and response bodies, and error classification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;
use crate::types::SubscriptionData;

// ---------------------------------------------------------------------------
// Server error codes
// ---------------------------------------------------------------------------

pub mod error_code {
    /// The server cannot stream in the requested format.
    pub const UNSUPPORTED_FORMAT: &str = "UnsupportedSubscriptionFormat";
    /// A subscription with the same context and reference id already exists.
    pub const DUPLICATE_KEY: &str = "SubscriptionKeyAlreadyInUse";
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Body of a create-subscription request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeRequest {
    pub context_id: String,
    pub reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub arguments: serde_json::Value,
    pub refresh_rate: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub known_schemas: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_reference_id: Option<String>,
}

impl SubscribeRequest {
    pub fn new(
        context_id: &str,
        reference_id: &str,
        data: &SubscriptionData,
        known_schemas: Vec<String>,
        replace_reference_id: Option<String>,
    ) -> Self {
        Self {
            context_id: context_id.to_string(),
            reference_id: reference_id.to_string(),
            format: data.format.clone(),
            arguments: data.arguments.clone(),
            refresh_rate: data.refresh_rate,
            tag: data.tag.clone(),
            known_schemas,
            replace_reference_id,
        }
    }
}

/// Body of a successful create-subscription response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SubscribeResponse {
    pub state: Option<String>,
    pub format: Option<String>,
    pub context_id: Option<String>,
    pub reference_id: Option<String>,
    /// Seconds without activity before the subscription counts as orphaned.
    pub inactivity_timeout: u64,
    pub refresh_rate: Option<u64>,
    pub snapshot: Option<serde_json::Value>,
    pub schema: Option<String>,
    pub schema_name: Option<String>,
}

/// A rejected control request as reported to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub status: u16,
    pub response: serde_json::Value,
}

impl ErrorResponse {
    pub fn error_code(&self) -> Option<&str> {
        self.response.get("ErrorCode")?.as_str()
    }

    pub fn message(&self) -> Option<&str> {
        self.response.get("Message")?.as_str()
    }
}

// ---------------------------------------------------------------------------
// URL templates
// ---------------------------------------------------------------------------

/// URL template for creating a subscription, with `$top` as a query suffix.
pub fn subscribe_url(url: &str, top: Option<u32>) -> String {
    match top {
        Some(n) => format!("{url}?$top={n}"),
        None => url.to_string(),
    }
}

/// URL template addressing one existing subscription.
pub fn subscription_url(url: &str) -> String {
    format!("{url}/{{contextId}}/{{referenceId}}")
}

pub fn subscription_args(context_id: &str, reference_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("contextId".to_string(), context_id.to_string()),
        ("referenceId".to_string(), reference_id.to_string()),
    ])
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Why a create-subscription request failed, as far as recovery is concerned.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SubscribeFailure {
    /// No response at all.
    Network,
    /// Stale server-side state under our reference id.
    DuplicateKey,
    /// The server rejected the negotiated wire format.
    UnsupportedFormat,
    Server(ErrorResponse),
}

impl SubscribeFailure {
    pub(crate) fn classify(err: TransportError) -> Self {
        match err {
            TransportError::Network(_) => SubscribeFailure::Network,
            TransportError::Status { status, response } => {
                let err = ErrorResponse { status, response };
                match err.error_code() {
                    Some(error_code::DUPLICATE_KEY) => SubscribeFailure::DuplicateKey,
                    Some(error_code::UNSUPPORTED_FORMAT) => SubscribeFailure::UnsupportedFormat,
                    _ => SubscribeFailure::Server(err),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
