use crate::types::{Error, FORMAT_JSON, Payload, Result};

use super::Parser;

/// Pass-through parser for JSON payloads. JSON values, strings included, are
/// returned unchanged; raw bytes are decoded as a UTF-8 JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonParser;

impl Parser for JsonParser {
    fn format(&self) -> &str {
        FORMAT_JSON
    }

    fn parse(
        &self,
        data: &Payload,
        _schema_name: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        if data.is_empty() {
            return Ok(None);
        }
        let value = match data {
            Payload::Json(value) => value.clone(),
            Payload::Binary(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| Error::ParsingFailed(format!("invalid JSON bytes: {e}")))?,
        };
        Ok(Some(value))
    }

    fn stringify(&self, data: &serde_json::Value, _schema_name: Option<&str>) -> Option<String> {
        serde_json::to_string(data).ok()
    }

    fn add_schema(&self, _source: &str, _name: &str) -> Result<bool> {
        Ok(true)
    }

    fn schema_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn schema_type(&self, _schema_name: &str) -> Option<String> {
        None
    }

    fn schema_name_for(&self, _type_name: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_values_pass_through() {
        let value = serde_json::json!({"Quote": {"Bid": 1.1}});
        let parsed = JsonParser
            .parse(&Payload::Json(value.clone()), None)
            .unwrap();
        assert_eq!(parsed, Some(value));
    }

    #[test]
    fn strings_are_values_not_documents() {
        for text in ["EURUSD", "42", r#"{"a":1}"#] {
            let parsed = JsonParser
                .parse(&Payload::Json(serde_json::json!(text)), None)
                .unwrap();
            assert_eq!(parsed, Some(serde_json::json!(text)));
        }
    }

    #[test]
    fn bytes_are_decoded() {
        let parsed = JsonParser
            .parse(&Payload::Binary(br#"[1,2]"#.to_vec()), None)
            .unwrap();
        assert_eq!(parsed, Some(serde_json::json!([1, 2])));
    }

    #[test]
    fn empty_payload_is_none() {
        assert_eq!(
            JsonParser
                .parse(&Payload::Json(serde_json::Value::Null), None)
                .unwrap(),
            None
        );
        assert_eq!(
            JsonParser.parse(&Payload::Binary(Vec::new()), None).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_bytes_fail() {
        let err = JsonParser
            .parse(&Payload::Binary(b"{not json".to_vec()), None)
            .unwrap_err();
        assert!(matches!(err, Error::ParsingFailed(_)));
    }

    #[test]
    fn stringify_and_schemas() {
        assert_eq!(
            JsonParser.stringify(&serde_json::json!({"a": [1]}), None),
            Some(r#"{"a":[1]}"#.to_string())
        );
        assert!(JsonParser.add_schema("anything", "Quotes").unwrap());
        assert!(JsonParser.schema_names().is_empty());
        assert_eq!(JsonParser.schema_type("Quotes"), None);
    }
}
