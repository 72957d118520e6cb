use std::collections::HashMap;
use std::sync::RwLock;

use base64::Engine as _;

use crate::types::{Error, FORMAT_PROTOBUF, Payload, Result};

use super::Parser;
use super::meta::{self, Envelope};
use super::schema::{CompiledSchema, compile};

/// Decodes protobuf payloads against schemas supplied by the server.
pub struct ProtobufParser {
    schemas: RwLock<HashMap<String, CompiledSchema>>,
    envelopes: RwLock<HashMap<String, Envelope>>,
}

impl Default for ProtobufParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtobufParser {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            envelopes: RwLock::new(meta::default_envelopes()),
        }
    }

    /// Unwrap messages whose root is `type_name` with `envelope` before
    /// returning them from [`Parser::parse`].
    pub fn register_envelope(&self, type_name: &str, envelope: Envelope) {
        self.envelopes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_name.to_string(), envelope);
    }

    fn schema(&self, schema_name: Option<&str>) -> Result<CompiledSchema> {
        let name =
            schema_name.ok_or_else(|| Error::ParsingFailed("no schema name given".to_string()))?;
        self.schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ParsingFailed(format!("unknown schema {name}")))
    }

    fn bytes(data: &Payload) -> Result<Vec<u8>> {
        match data {
            Payload::Binary(bytes) => Ok(bytes.clone()),
            Payload::Json(serde_json::Value::String(text)) => {
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map_err(|e| Error::ParsingFailed(format!("invalid base64 payload: {e}")))
            }
            Payload::Json(other) => Err(Error::ParsingFailed(format!(
                "expected binary payload, got {other}"
            ))),
        }
    }
}

impl Parser for ProtobufParser {
    fn format(&self) -> &str {
        FORMAT_PROTOBUF
    }

    fn parse(
        &self,
        data: &Payload,
        schema_name: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        if data.is_empty() {
            return Ok(None);
        }
        let schema = self.schema(schema_name)?;
        let bytes = Self::bytes(data)?;
        let message = schema
            .root
            .parse_from_bytes(&bytes)
            .map_err(|e| Error::ParsingFailed(format!("{}: {e}", schema.root.full_name())))?;

        let value = meta::project(&*message);
        let envelope = self
            .envelopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(schema.root.full_name())
            .copied();
        Ok(Some(match envelope {
            Some(unwrap) => unwrap(value),
            None => value,
        }))
    }

    fn stringify(&self, data: &serde_json::Value, schema_name: Option<&str>) -> Option<String> {
        let schema = self.schema(schema_name).ok()?;
        let text = serde_json::to_string(data).ok()?;
        let message = match protobuf_json_mapping::parse_dyn_from_str(&schema.root, &text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(schema = ?schema_name, error = %e, "Cannot encode value");
                return None;
            }
        };
        let bytes = message.write_to_bytes_dyn().ok()?;
        Some(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    fn add_schema(&self, source: &str, name: &str) -> Result<bool> {
        if self
            .schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
        {
            return Ok(true);
        }

        let compiled = compile(source)?;
        tracing::debug!(
            schema = name,
            root = compiled.root.full_name(),
            "Schema added"
        );
        self.schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert(compiled);
        Ok(true)
    }

    fn schema_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn schema_type(&self, schema_name: &str) -> Option<String> {
        self.schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(schema_name)
            .map(|s| s.root.name().to_string())
    }

    fn schema_name_for(&self, type_name: &str) -> Option<String> {
        self.schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, s)| s.root.name() == type_name || s.root.full_name() == type_name)
            .map(|(name, _)| name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{META_EMPTY, META_NULLS};

    const QUOTE_SCHEMA: &str = r#"
        syntax = "proto2";
        option root_type = "PriceResponse";

        enum PriceType {
            Indicative = 0;
            Tradable = 1;
        }

        message Quote {
            optional double bid = 1;
            optional double ask = 2;
            optional PriceType price_type = 3;
            repeated int32 meta_nulls = 190;
        }

        message PriceResponse {
            optional string symbol = 1;
            optional Quote quote = 2;
            repeated string venues = 3;
            optional bytes token = 4;
            map<string, int64> sizes = 5;
            optional string comment = 6;
            repeated int32 meta_nulls = 190;
            repeated int32 meta_empty = 191;
        }
    "#;

    /// Minimal protobuf wire encoder for building test payloads.
    #[derive(Default)]
    struct Wire(Vec<u8>);

    impl Wire {
        fn varint(&mut self, mut v: u64) -> &mut Self {
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    self.0.push(byte);
                    return self;
                }
                self.0.push(byte | 0x80);
            }
        }

        fn tag(&mut self, field: u32, wire_type: u8) -> &mut Self {
            self.varint(u64::from(field << 3 | u32::from(wire_type)))
        }

        fn int(&mut self, field: u32, v: u64) -> &mut Self {
            self.tag(field, 0).varint(v)
        }

        fn double(&mut self, field: u32, v: f64) -> &mut Self {
            self.tag(field, 1);
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn bytes(&mut self, field: u32, v: &[u8]) -> &mut Self {
            self.tag(field, 2).varint(v.len() as u64);
            self.0.extend_from_slice(v);
            self
        }

        fn finish(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.0)
        }
    }

    fn parser() -> ProtobufParser {
        let parser = ProtobufParser::new();
        assert!(parser.add_schema(QUOTE_SCHEMA, "Prices").unwrap());
        parser
    }

    #[test]
    fn decodes_full_message() {
        let quote = Wire::default()
            .double(1, 1.25)
            .double(2, 1.5)
            .int(3, 1)
            .finish();
        let entry = Wire::default().bytes(1, b"lot").int(2, 1_000_000).finish();
        let payload = Wire::default()
            .bytes(1, b"EURUSD")
            .bytes(2, &quote)
            .bytes(3, b"XLON")
            .bytes(3, b"XPAR")
            .bytes(4, &[0xde, 0xad])
            .bytes(5, &entry)
            .finish();

        let value = parser()
            .parse(&Payload::Binary(payload), Some("Prices"))
            .unwrap()
            .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "symbol": "EURUSD",
                "quote": {"bid": 1.25, "ask": 1.5, "price_type": "Tradable"},
                "venues": ["XLON", "XPAR"],
                "token": "3q0=",
                "sizes": {"lot": 1_000_000},
            })
        );
    }

    #[test]
    fn restores_meta_listed_fields_at_every_level() {
        let quote = Wire::default().double(1, 1.25).int(190, 2).finish();
        let payload = Wire::default()
            .bytes(2, &quote)
            .int(190, 6)
            .int(191, 3)
            .finish();

        let value = parser()
            .parse(&Payload::Binary(payload), Some("Prices"))
            .unwrap()
            .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "quote": {"bid": 1.25, "ask": null},
                "comment": null,
                "venues": [],
            })
        );
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key(META_NULLS));
        assert!(!obj.contains_key(META_EMPTY));
    }

    #[test]
    fn meta_reference_to_unknown_number_is_ignored() {
        let payload = Wire::default().bytes(1, b"X").int(190, 99).finish();
        let value = parser()
            .parse(&Payload::Binary(payload), Some("Prices"))
            .unwrap()
            .unwrap();
        assert_eq!(value, serde_json::json!({"symbol": "X"}));
    }

    #[test]
    fn accepts_base64_text() {
        let payload = Wire::default().bytes(1, b"GBPUSD").finish();
        let text = base64::engine::general_purpose::STANDARD.encode(payload);
        let value = parser()
            .parse(&Payload::Json(serde_json::Value::String(text)), Some("Prices"))
            .unwrap()
            .unwrap();
        assert_eq!(value["symbol"], "GBPUSD");
    }

    #[test]
    fn empty_payload_is_none() {
        assert_eq!(
            parser().parse(&Payload::Binary(Vec::new()), Some("Prices")).unwrap(),
            None
        );
    }

    #[test]
    fn parse_failures() {
        let parser = parser();
        let payload = Payload::Binary(Wire::default().bytes(1, b"X").finish());
        assert!(matches!(
            parser.parse(&payload, Some("Missing")),
            Err(Error::ParsingFailed(_))
        ));
        assert!(matches!(
            parser.parse(&payload, None),
            Err(Error::ParsingFailed(_))
        ));
        // truncated length-delimited field
        assert!(matches!(
            parser.parse(&Payload::Binary(vec![0x0a, 0x05, b'a']), Some("Prices")),
            Err(Error::ParsingFailed(_))
        ));
        assert!(matches!(
            parser.parse(&Payload::Json(serde_json::json!("!!!")), Some("Prices")),
            Err(Error::ParsingFailed(_))
        ));
    }

    #[test]
    fn accepts_schema_with_declared_root_option() {
        let parser = ProtobufParser::new();
        let added = parser.add_schema(
            r#"
            syntax = "proto2";
            import "google/protobuf/descriptor.proto";
            extend google.protobuf.FileOptions { optional string root_type = 50001; }
            option (root_type) = "Quote";
            message Quote { optional string symbol = 1; optional double bid = 2; }
            "#,
            "Quotes",
        );
        assert!(added.unwrap());
        assert_eq!(parser.schema_type("Quotes").as_deref(), Some("Quote"));

        let payload = Wire::default().bytes(1, b"EURUSD").double(2, 1.5).finish();
        let value = parser
            .parse(&Payload::Binary(payload), Some("Quotes"))
            .unwrap();
        assert_eq!(value, Some(serde_json::json!({"symbol": "EURUSD", "bid": 1.5})));
    }

    #[test]
    fn schema_registry() {
        let parser = parser();
        assert!(parser.add_schema("not even proto", "Prices").unwrap());
        assert_eq!(parser.schema_names(), vec!["Prices".to_string()]);
        assert_eq!(parser.schema_type("Prices").as_deref(), Some("PriceResponse"));
        assert_eq!(parser.schema_name_for("PriceResponse").as_deref(), Some("Prices"));
        assert_eq!(parser.schema_name_for("Quote"), None);
        assert!(matches!(
            parser.add_schema("message {", "Broken"),
            Err(Error::SchemaParsingFailed(_))
        ));
        assert_eq!(parser.schema_names().len(), 1);
    }

    #[test]
    fn stringify_round_trips_through_parse() {
        let parser = parser();
        let text = parser
            .stringify(
                &serde_json::json!({"symbol": "EURUSD", "venues": ["XLON"]}),
                Some("Prices"),
            )
            .unwrap();
        let value = parser
            .parse(&Payload::Json(serde_json::Value::String(text)), Some("Prices"))
            .unwrap()
            .unwrap();
        assert_eq!(value, serde_json::json!({"symbol": "EURUSD", "venues": ["XLON"]}));
        assert_eq!(parser.stringify(&serde_json::json!({}), Some("Missing")), None);
    }

    #[test]
    fn adapts_well_known_types() {
        let parser = ProtobufParser::new();
        parser
            .add_schema(
                r#"
                syntax = "proto3";
                import "google/protobuf/timestamp.proto";
                import "google/protobuf/wrappers.proto";
                option root_type = "Trade";
                message Trade {
                    google.protobuf.Timestamp executed_at = 1;
                    google.protobuf.DoubleValue price = 2;
                }
                "#,
                "Trades",
            )
            .unwrap();

        let time = Wire::default().int(1, 1_700_000_000).int(2, 500_000_000).finish();
        let price = Wire::default().double(1, 99.5).finish();
        let payload = Wire::default().bytes(1, &time).bytes(2, &price).finish();

        let value = parser
            .parse(&Payload::Binary(payload), Some("Trades"))
            .unwrap()
            .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "executed_at": "2023-11-14T22:13:20.500Z",
                "price": 99.5,
            })
        );
    }

    #[test]
    fn envelopes_unwrap_top_level() {
        let parser = ProtobufParser::new();
        parser
            .add_schema(
                r#"
                syntax = "proto2";
                option root_type = "Envelope";
                message Envelope { optional string payload = 1; }
                "#,
                "Wrapped",
            )
            .unwrap();
        fn payload_of(value: serde_json::Value) -> serde_json::Value {
            value.get("payload").cloned().unwrap_or_default()
        }
        parser.register_envelope("Envelope", payload_of);

        let payload = Wire::default().bytes(1, b"inner").finish();
        let value = parser
            .parse(&Payload::Binary(payload), Some("Wrapped"))
            .unwrap()
            .unwrap();
        assert_eq!(value, serde_json::json!("inner"));
    }
}
