//! The control-channel seam.
//!
//! A [`Subscription`](crate::Subscription) issues every control request
//! through a [`Transport`]. Batching, auth and backoff live behind this trait.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// Body and extra headers for one control request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub body: Option<serde_json::Value>,
    pub headers: BTreeMap<String, String>,
}

impl RequestOptions {
    pub fn with_body(body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            headers: BTreeMap::new(),
        }
    }
}

/// A successful control response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub response: serde_json::Value,
}

/// A failed control request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("request rejected with status {status}")]
    Status {
        status: u16,
        response: serde_json::Value,
    },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),
}

/// Issues control requests against a service.
///
/// `url_template` may contain `{name}` placeholders filled from
/// `template_args`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> Result<Response, TransportError>;

    async fn delete(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> Result<Response, TransportError>;

    async fn patch(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> Result<Response, TransportError>;
}

/// Fill `{name}` placeholders in `template` from `args`. Unknown
/// placeholders are left in place.
pub fn expand_template(template: &str, args: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let (head, tail) = rest.split_at(open);
        out.push_str(head);
        match tail.find('}') {
            Some(close) => {
                let name = tail.get(1..close).unwrap_or_default();
                match args.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(tail.get(..=close).unwrap_or_default()),
                }
                rest = tail.get(close + 1..).unwrap_or_default();
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_placeholders() {
        assert_eq!(
            expand_template(
                "v1/prices/subscriptions/{contextId}/{referenceId}",
                &args(&[("contextId", "ctx"), ("referenceId", "12")])
            ),
            "v1/prices/subscriptions/ctx/12"
        );
    }

    #[test]
    fn leaves_unknown_and_unterminated_placeholders() {
        assert_eq!(
            expand_template("a/{missing}/b", &args(&[])),
            "a/{missing}/b"
        );
        assert_eq!(expand_template("a/{open", &args(&[])), "a/{open");
        assert_eq!(expand_template("plain", &args(&[("x", "y")])), "plain");
    }

    #[test]
    fn status_error_display() {
        let err = TransportError::Status {
            status: 404,
            response: serde_json::Value::Null,
        };
        assert_eq!(err.to_string(), "request rejected with status 404");
    }
}
