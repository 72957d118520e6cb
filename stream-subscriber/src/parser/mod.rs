//! Payload parsers and the per-endpoint parser registry.

mod json;
#[cfg(feature = "protobuf")]
mod meta;
#[cfg(feature = "protobuf")]
mod protobuf;
mod schema;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::types::{FORMAT_JSON, Payload, Result};

pub use json::JsonParser;
#[cfg(feature = "protobuf")]
pub use meta::{Envelope, META_EMPTY, META_NULLS};
#[cfg(feature = "protobuf")]
pub use protobuf::ProtobufParser;
pub use schema::{ROOT_TYPE_OPTION, extract_root_type};

/// Encodes and decodes one message payload against a named schema.
pub trait Parser: Send + Sync {
    /// Wire format identifier, e.g. [`FORMAT_JSON`].
    fn format(&self) -> &str;

    /// Decode `data`. Returns `Ok(None)` for an empty payload.
    fn parse(&self, data: &Payload, schema_name: Option<&str>)
    -> Result<Option<serde_json::Value>>;

    /// Encode `data` as the text form of this format.
    fn stringify(&self, data: &serde_json::Value, schema_name: Option<&str>) -> Option<String>;

    /// Register `source` under `name`. Adding a name twice keeps the first.
    fn add_schema(&self, source: &str, name: &str) -> Result<bool>;

    fn schema_names(&self) -> Vec<String>;

    /// Root type of the named schema.
    fn schema_type(&self, schema_name: &str) -> Option<String>;

    /// Name of the schema whose root is `type_name`.
    fn schema_name_for(&self, type_name: &str) -> Option<String>;
}

/// Creates a parser instance for one endpoint.
pub type ParserFactory = Arc<dyn Fn() -> Arc<dyn Parser> + Send + Sync>;

/// Hands out parsers by format.
///
/// JSON carries no schemas and is shared by every endpoint. Other formats
/// keep a schema cache per endpoint, so one instance exists per
/// `(format, service_path, url)`.
pub struct Parsers {
    json: Arc<dyn Parser>,
    factories: RwLock<HashMap<String, ParserFactory>>,
    instances: Mutex<HashMap<(String, String, String), Arc<dyn Parser>>>,
}

impl Default for Parsers {
    fn default() -> Self {
        Self::new()
    }
}

impl Parsers {
    pub fn new() -> Self {
        let parsers = Self {
            json: Arc::new(JsonParser),
            factories: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        };
        #[cfg(feature = "protobuf")]
        parsers.add_parser(
            crate::types::FORMAT_PROTOBUF,
            Arc::new(|| Arc::new(ProtobufParser::new()) as Arc<dyn Parser>),
        );
        parsers
    }

    /// Register a factory for `format`, replacing any earlier one.
    pub fn add_parser(&self, format: &str, factory: ParserFactory) {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(format.to_string(), factory);
    }

    pub fn is_supported(&self, format: &str) -> bool {
        format == FORMAT_JSON
            || self
                .factories
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(format)
    }

    pub fn json(&self) -> Arc<dyn Parser> {
        self.json.clone()
    }

    /// Parser for `format` on the given endpoint. `None` and unknown formats
    /// resolve to JSON.
    pub fn get_parser(
        &self,
        format: Option<&str>,
        service_path: &str,
        url: &str,
    ) -> Arc<dyn Parser> {
        let format = match format {
            None => return self.json(),
            Some(f) if f == FORMAT_JSON => return self.json(),
            Some(f) => f,
        };

        let key = (format.to_string(), service_path.to_string(), url.to_string());
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parser) = instances.get(&key) {
            return parser.clone();
        }

        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(format)
            .cloned();
        match factory {
            Some(factory) => {
                let parser = factory();
                instances.insert(key, parser.clone());
                parser
            }
            None => {
                tracing::warn!(format, "Unsupported format, falling back to JSON");
                self.json()
            }
        }
    }
}
