//! A single-request [`Transport`] over HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};

use crate::transport::{RequestOptions, Response, Transport, TransportError, expand_template};
use crate::types::Result;

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Base URL that service paths are appended to (e.g. `https://gateway.example/api`).
    pub base_url: String,
    /// Sent as a bearer token on every request when set.
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_token: None,
            timeout_ms: 10_000,
        }
    }
}

/// Issues each control request as one HTTP call with a JSON body.
/// Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    base_url: url::Url,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let mut base = config.base_url;
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = url::Url::parse(&base)?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        tracing::info!(
            base_url = %base_url,
            auth = config.auth_token.is_some(),
            "http transport initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                auth_token: config.auth_token,
            }),
        })
    }

    fn url(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
    ) -> std::result::Result<url::Url, TransportError> {
        let path = format!(
            "{}/{}",
            service_path.trim_matches('/'),
            expand_template(url_template, template_args).trim_start_matches('/')
        );
        self.inner
            .base_url
            .join(&path)
            .map_err(|e| TransportError::Network(format!("invalid url {path}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> std::result::Result<Response, TransportError> {
        let url = self.url(service_path, url_template, template_args)?;
        tracing::debug!(method = %method, url = %url, "control request");

        let mut req = self.inner.client.request(method, url);
        if let Some(token) = &self.inner.auth_token {
            req = req.bearer_auth(token);
        }
        for (name, value) in &options.headers {
            req = req.header(name, value);
        }
        if let Some(body) = &options.body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        if status.is_success() {
            Ok(Response {
                status: status.as_u16(),
                response,
            })
        } else {
            tracing::warn!(status = status.as_u16(), "control request rejected");
            Err(TransportError::Status {
                status: status.as_u16(),
                response,
            })
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> std::result::Result<Response, TransportError> {
        self.send(Method::POST, service_path, url_template, template_args, options)
            .await
    }

    async fn delete(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> std::result::Result<Response, TransportError> {
        self.send(Method::DELETE, service_path, url_template, template_args, options)
            .await
    }

    async fn patch(
        &self,
        service_path: &str,
        url_template: &str,
        template_args: &BTreeMap<String, String>,
        options: RequestOptions,
    ) -> std::result::Result<Response, TransportError> {
        self.send(Method::PATCH, service_path, url_template, template_args, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::PATCH;
    use httpmock::prelude::*;

    fn transport(server: &MockServer) -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            base_url: server.base_url(),
            auth_token: Some("tok".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn post_sends_json_body_and_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/trade/v1/prices/subscriptions")
                .header("authorization", "Bearer tok")
                .json_body(serde_json::json!({"ContextId": "ctx", "ReferenceId": "1"}));
            then.status(201)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"InactivityTimeout": 30}));
        });

        let resp = transport(&server)
            .post(
                "trade",
                "v1/prices/subscriptions",
                &BTreeMap::new(),
                RequestOptions::with_body(
                    serde_json::json!({"ContextId": "ctx", "ReferenceId": "1"}),
                ),
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.response["InactivityTimeout"], 30);
    }

    #[tokio::test]
    async fn delete_expands_template() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(DELETE)
                .path("/trade/v1/prices/subscriptions/ctx/7");
            then.status(202);
        });

        let resp = transport(&server)
            .delete(
                "trade",
                "v1/prices/subscriptions/{contextId}/{referenceId}",
                &args(&[("contextId", "ctx"), ("referenceId", "7")]),
                RequestOptions::default(),
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(resp.status, 202);
        assert!(resp.response.is_null());
    }

    #[tokio::test]
    async fn top_suffix_becomes_query() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/trade/v1/orders/subscriptions")
                .query_param("$top", "5");
            then.status(201).json_body(serde_json::json!({}));
        });

        transport(&server)
            .post(
                "trade",
                &crate::protocol::subscribe_url("v1/orders/subscriptions", Some(5)),
                &BTreeMap::new(),
                RequestOptions::with_body(serde_json::json!({})),
            )
            .await
            .unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn error_status_maps_to_status_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PATCH);
            then.status(409)
                .json_body(serde_json::json!({"ErrorCode": "SubscriptionKeyAlreadyInUse"}));
        });

        let err = transport(&server)
            .patch(
                "trade",
                "v1/prices/subscriptions/{contextId}/{referenceId}",
                &args(&[("contextId", "ctx"), ("referenceId", "7")]),
                RequestOptions::with_body(serde_json::json!({"Amount": 2})),
            )
            .await
            .unwrap_err();

        match err {
            TransportError::Status { status, response } => {
                assert_eq!(status, 409);
                assert_eq!(response["ErrorCode"], "SubscriptionKeyAlreadyInUse");
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let transport = HttpTransport::new(HttpTransportConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_ms: 500,
            ..Default::default()
        })
        .unwrap();

        let err = transport
            .post("trade", "v1/x", &BTreeMap::new(), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}
