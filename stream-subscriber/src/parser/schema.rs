//! Schema text handling: the root type option and, with the `protobuf`
//! feature, compilation of proto source into descriptors.

/// File-level option naming the message a schema decodes into.
pub const ROOT_TYPE_OPTION: &str = "root_type";

/// Split a bare `option root_type = "...";` statement out of `source`.
///
/// Returns the named root type (if any) and the source with the statement
/// removed, since proto compilers reject options they don't know. Schemas
/// that declare `root_type` as a `FileOptions` extension and set it with
/// `option (root_type) = "...";` compile as-is and are left untouched.
pub fn extract_root_type(source: &str) -> (Option<String>, String) {
    let mut stripped = String::with_capacity(source.len());
    let mut root = None;
    let mut rest = source;

    while let Some(pos) = rest.find("option") {
        let (head, tail) = rest.split_at(pos);
        stripped.push_str(head);

        let starts_word = !head
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let ends_word = tail
            .get("option".len()..)
            .and_then(|t| t.chars().next())
            .is_some_and(char::is_whitespace);
        let statement_len = tail.find(';').map(|end| end + 1);

        match statement_len {
            Some(len) if starts_word && ends_word => {
                let statement = tail.get(..len).unwrap_or_default();
                match parse_root_option(statement) {
                    Some(name) if root.is_none() => root = Some(name),
                    _ => stripped.push_str(statement),
                }
                rest = tail.get(len..).unwrap_or_default();
            }
            _ => {
                stripped.push_str("option");
                rest = tail.get("option".len()..).unwrap_or_default();
            }
        }
    }
    stripped.push_str(rest);
    (root, stripped)
}

fn parse_root_option(statement: &str) -> Option<String> {
    let body = statement.strip_prefix("option")?.trim_end_matches(';');
    let (name, value) = body.split_once('=')?;
    if name.trim() != ROOT_TYPE_OPTION {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))?;
    Some(value.to_string())
}

#[cfg(feature = "protobuf")]
pub(crate) use compile::{CompiledSchema, compile};

#[cfg(feature = "protobuf")]
mod compile {
    use std::collections::HashMap;

    use protobuf::UnknownValueRef;
    use protobuf::descriptor::FileDescriptorProto;
    use protobuf::reflect::{FileDescriptor, MessageDescriptor};

    use crate::types::{Error, Result};

    const SCHEMA_FILE: &str = "schema.proto";
    const FILE_OPTIONS: &str = "google.protobuf.FileOptions";

    /// A parsed schema ready for decoding.
    #[derive(Clone, Debug)]
    pub(crate) struct CompiledSchema {
        pub root: MessageDescriptor,
    }

    /// Compile proto `source` and locate its root message.
    pub(crate) fn compile(source: &str) -> Result<CompiledSchema> {
        let (bare_root, source) = super::extract_root_type(source);

        let protos = parse_source(&source)?;
        let root_type = bare_root
            .or_else(|| {
                protos
                    .iter()
                    .find(|p| p.name() == SCHEMA_FILE)
                    .and_then(declared_root_type)
            })
            .ok_or_else(|| {
                Error::SchemaParsingFailed(format!("missing {} option", super::ROOT_TYPE_OPTION))
            })?;

        let files = link(protos)?;
        let file = files
            .get(SCHEMA_FILE)
            .ok_or_else(|| Error::SchemaParsingFailed("schema file not compiled".to_string()))?;

        let root = find_message(file, &root_type).ok_or_else(|| {
            Error::SchemaParsingFailed(format!("root type {root_type} not found in schema"))
        })?;
        Ok(CompiledSchema { root })
    }

    fn parse_source(source: &str) -> Result<Vec<FileDescriptorProto>> {
        let dir = tempfile::tempdir()
            .map_err(|e| Error::SchemaParsingFailed(format!("temp dir: {e}")))?;
        let path = dir.path().join(SCHEMA_FILE);
        std::fs::write(&path, source)
            .map_err(|e| Error::SchemaParsingFailed(format!("write schema: {e}")))?;

        let parsed = protobuf_parse::Parser::new()
            .pure()
            .include(dir.path())
            .input(&path)
            .parse_and_typecheck()
            .map_err(|e| Error::SchemaParsingFailed(e.to_string()))?;
        Ok(parsed.file_descriptors)
    }

    /// Value of `option (root_type) = "...";`, set through a `FileOptions`
    /// extension declared in the schema. Custom options stay in the
    /// options' unknown fields under the extension's number.
    fn declared_root_type(file: &FileDescriptorProto) -> Option<String> {
        let options = file.options.as_ref()?;
        file.extension
            .iter()
            .filter(|ext| ext.extendee().trim_start_matches('.') == FILE_OPTIONS)
            .filter(|ext| ext.name() == super::ROOT_TYPE_OPTION)
            .find_map(|ext| {
                let number = u32::try_from(ext.number()).ok()?;
                match options.special_fields.unknown_fields().get(number)? {
                    UnknownValueRef::LengthDelimited(bytes) => {
                        String::from_utf8(bytes.to_vec()).ok()
                    }
                    _ => None,
                }
            })
    }

    /// Build dynamic descriptors, dependencies first.
    fn link(mut pending: Vec<FileDescriptorProto>) -> Result<HashMap<String, FileDescriptor>> {
        let mut built: HashMap<String, FileDescriptor> = HashMap::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for proto in pending {
                let deps: Option<Vec<FileDescriptor>> = proto
                    .dependency
                    .iter()
                    .map(|name| built.get(name).cloned().or_else(|| well_known(name)))
                    .collect();
                match deps {
                    Some(deps) => {
                        let name = proto.name().to_string();
                        let file = FileDescriptor::new_dynamic(proto, &deps)
                            .map_err(|e| Error::SchemaParsingFailed(e.to_string()))?;
                        built.insert(name, file);
                    }
                    None => waiting.push(proto),
                }
            }
            if waiting.len() == before {
                let missing: Vec<_> = waiting.iter().map(|p| p.name().to_string()).collect();
                return Err(Error::SchemaParsingFailed(format!(
                    "unresolved imports in {}",
                    missing.join(", ")
                )));
            }
            pending = waiting;
        }
        Ok(built)
    }

    fn well_known(name: &str) -> Option<FileDescriptor> {
        use protobuf::well_known_types as wkt;
        match name {
            "google/protobuf/timestamp.proto" => Some(wkt::timestamp::file_descriptor().clone()),
            "google/protobuf/wrappers.proto" => Some(wkt::wrappers::file_descriptor().clone()),
            "google/protobuf/duration.proto" => Some(wkt::duration::file_descriptor().clone()),
            "google/protobuf/empty.proto" => Some(wkt::empty::file_descriptor().clone()),
            "google/protobuf/struct.proto" => Some(wkt::struct_::file_descriptor().clone()),
            "google/protobuf/descriptor.proto" => {
                Some(protobuf::descriptor::file_descriptor().clone())
            }
            _ => None,
        }
    }

    fn find_message(file: &FileDescriptor, type_name: &str) -> Option<MessageDescriptor> {
        let mut stack: Vec<MessageDescriptor> = file.messages().collect();
        while let Some(message) = stack.pop() {
            if message.name() == type_name || message.full_name() == type_name {
                return Some(message);
            }
            stack.extend(message.nested_messages());
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn compiles_schema_and_finds_root() {
            let schema = compile(
                r#"
                syntax = "proto2";
                option root_type = "Quote";
                message Price { optional double bid = 1; }
                message Quote {
                    optional string symbol = 1;
                    optional Price price = 2;
                }
                "#,
            )
            .unwrap();
            assert_eq!(schema.root.name(), "Quote");
            assert!(schema.root.field_by_name("price").is_some());
        }

        #[test]
        fn finds_nested_root() {
            for root in ["Inner", "Outer.Inner"] {
                let schema = compile(&format!(
                    r#"
                    syntax = "proto2";
                    option root_type = "{root}";
                    message Outer {{ message Inner {{ optional int32 x = 1; }} }}
                    "#
                ))
                .unwrap();
                assert_eq!(schema.root.full_name(), "Outer.Inner");
            }
        }

        #[test]
        fn reads_root_from_declared_file_option() {
            let schema = compile(
                r#"
                syntax = "proto2";
                import "google/protobuf/descriptor.proto";
                extend google.protobuf.FileOptions {
                    optional string root_type = 50001;
                }
                option (root_type) = "Quote";
                message Price { optional double bid = 1; }
                message Quote { optional Price price = 1; }
                "#,
            )
            .unwrap();
            assert_eq!(schema.root.name(), "Quote");
        }

        #[test]
        fn declared_option_must_be_set() {
            let err = compile(
                r#"
                syntax = "proto3";
                import "google/protobuf/descriptor.proto";
                extend google.protobuf.FileOptions { string root_type = 50001; }
                message Quote { double bid = 1; }
                "#,
            )
            .unwrap_err();
            assert!(matches!(err, Error::SchemaParsingFailed(_)));
        }

        #[test]
        fn resolves_well_known_imports() {
            let schema = compile(
                r#"
                syntax = "proto3";
                import "google/protobuf/timestamp.proto";
                option root_type = "Trade";
                message Trade { google.protobuf.Timestamp time = 1; }
                "#,
            )
            .unwrap();
            assert!(schema.root.field_by_name("time").is_some());
        }

        #[test]
        fn rejects_malformed_source() {
            let err = compile("option root_type = \"A\"; message A { int32 }").unwrap_err();
            assert!(matches!(err, Error::SchemaParsingFailed(_)));
        }

        #[test]
        fn rejects_missing_root() {
            let err = compile("syntax = \"proto2\"; message A { optional int32 x = 1; }")
                .unwrap_err();
            assert!(matches!(err, Error::SchemaParsingFailed(_)));

            let err = compile(
                "syntax = \"proto2\"; option root_type = \"B\"; message A { optional int32 x = 1; }",
            )
            .unwrap_err();
            assert!(matches!(err, Error::SchemaParsingFailed(_)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_strips_root_option() {
        let (root, stripped) = extract_root_type(
            "syntax = \"proto3\";\noption root_type = \"Quote\";\nmessage Quote {}\n",
        );
        assert_eq!(root.as_deref(), Some("Quote"));
        assert_eq!(stripped, "syntax = \"proto3\";\n\nmessage Quote {}\n");
    }

    #[test]
    fn keeps_other_options() {
        let source = "option java_package = \"a.b\";\noption root_type='Q';\nmessage Q {}";
        let (root, stripped) = extract_root_type(source);
        assert_eq!(root.as_deref(), Some("Q"));
        assert!(stripped.contains("option java_package = \"a.b\";"));
        assert!(!stripped.contains("root_type"));
    }

    #[test]
    fn leaves_custom_option_syntax_to_the_compiler() {
        let source = "extend google.protobuf.FileOptions { optional string root_type = 50001; }\n\
                      option (root_type) = \"Q\";\nmessage Q {}";
        let (root, stripped) = extract_root_type(source);
        assert_eq!(root, None);
        assert_eq!(stripped, source);
    }

    #[test]
    fn ignores_option_inside_words() {
        let source = "message Q { optional int32 options = 1; }\noption root_type = \"Q\";";
        let (root, stripped) = extract_root_type(source);
        assert_eq!(root.as_deref(), Some("Q"));
        assert_eq!(stripped, "message Q { optional int32 options = 1; }\n");
    }

    #[test]
    fn no_root_option() {
        let (root, stripped) = extract_root_type("message Q {}");
        assert_eq!(root, None);
        assert_eq!(stripped, "message Q {}");
    }
}
