//! Projection of decoded protobuf messages into JSON values.
//!
//! Delta-compressed messages omit fields that became null and repeated
//! fields that became empty. The publisher lists the numbers of those
//! fields in two reserved repeated fields, [`META_NULLS`] and
//! [`META_EMPTY`]. The projection writes them back as `null` and `[]` in
//! the same pass that converts the message, and never emits the reserved
//! fields themselves.

use std::collections::HashMap;

use base64::Engine as _;
use protobuf::MessageDyn;
use protobuf::reflect::{MessageDescriptor, ReflectFieldRef, ReflectValueRef};
use serde_json::{Map, Value};

/// Reserved field listing numbers of fields that are now null.
pub const META_NULLS: &str = "meta_nulls";
/// Reserved field listing numbers of repeated fields that are now empty.
pub const META_EMPTY: &str = "meta_empty";

const TIMESTAMP: &str = "google.protobuf.Timestamp";

/// Extracts the payload from an envelope message at the top level.
pub type Envelope = fn(Value) -> Value;

const WRAPPERS: [&str; 9] = [
    "google.protobuf.DoubleValue",
    "google.protobuf.FloatValue",
    "google.protobuf.Int64Value",
    "google.protobuf.UInt64Value",
    "google.protobuf.Int32Value",
    "google.protobuf.UInt32Value",
    "google.protobuf.BoolValue",
    "google.protobuf.StringValue",
    "google.protobuf.BytesValue",
];

fn wrapper_value(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => obj.remove("value").unwrap_or(Value::Null),
        other => other,
    }
}

/// Envelopes every parser starts with: wrapper types at the top level
/// unwrap to their scalar.
pub(crate) fn default_envelopes() -> HashMap<String, Envelope> {
    WRAPPERS
        .iter()
        .map(|name| (name.to_string(), wrapper_value as Envelope))
        .collect()
}

/// Convert `message` into a JSON value, restoring meta-listed fields.
pub(crate) fn project(message: &dyn MessageDyn) -> Value {
    Value::Object(project_fields(message))
}

fn project_fields(message: &dyn MessageDyn) -> Map<String, Value> {
    let descriptor = message.descriptor_dyn();
    let mut obj = Map::new();
    let mut nulls = Vec::new();
    let mut empties = Vec::new();

    for field in descriptor.fields() {
        let name = field.name();
        match field.get_reflect(message) {
            ReflectFieldRef::Optional(value) => {
                if let Some(value) = value.value() {
                    obj.insert(name.to_string(), project_value(value));
                }
            }
            ReflectFieldRef::Repeated(values) => {
                if name == META_NULLS || name == META_EMPTY {
                    let target = if name == META_NULLS {
                        &mut nulls
                    } else {
                        &mut empties
                    };
                    for i in 0..values.len() {
                        if let Some(number) = field_number(values.get(i)) {
                            target.push(number);
                        }
                    }
                    continue;
                }
                if !values.is_empty() {
                    let items = (0..values.len())
                        .map(|i| project_value(values.get(i)))
                        .collect();
                    obj.insert(name.to_string(), Value::Array(items));
                }
            }
            ReflectFieldRef::Map(entries) => {
                if !entries.is_empty() {
                    let map = (&entries)
                        .into_iter()
                        .map(|(k, v)| (map_key(k), project_value(v)))
                        .collect();
                    obj.insert(name.to_string(), Value::Object(map));
                }
            }
        }
    }

    restore(&descriptor, &mut obj, &nulls, Value::Null);
    restore(&descriptor, &mut obj, &empties, Value::Array(Vec::new()));
    obj
}

fn restore(descriptor: &MessageDescriptor, obj: &mut Map<String, Value>, numbers: &[i32], value: Value) {
    for &number in numbers {
        match descriptor
            .fields()
            .find(|f| f.proto().number() == number)
        {
            Some(field) => {
                obj.insert(field.name().to_string(), value.clone());
            }
            None => tracing::debug!(
                message = descriptor.full_name(),
                number,
                "meta field references unknown field"
            ),
        }
    }
}

fn field_number(value: ReflectValueRef<'_>) -> Option<i32> {
    match value {
        ReflectValueRef::I32(n) => Some(n),
        ReflectValueRef::U32(n) => i32::try_from(n).ok(),
        ReflectValueRef::I64(n) => i32::try_from(n).ok(),
        ReflectValueRef::U64(n) => i32::try_from(n).ok(),
        _ => None,
    }
}

fn map_key(key: ReflectValueRef<'_>) -> String {
    match key {
        ReflectValueRef::String(s) => s.to_string(),
        ReflectValueRef::I32(n) => n.to_string(),
        ReflectValueRef::I64(n) => n.to_string(),
        ReflectValueRef::U32(n) => n.to_string(),
        ReflectValueRef::U64(n) => n.to_string(),
        ReflectValueRef::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

fn project_value(value: ReflectValueRef<'_>) -> Value {
    match value {
        ReflectValueRef::U32(n) => Value::from(n),
        ReflectValueRef::U64(n) => Value::from(n),
        ReflectValueRef::I32(n) => Value::from(n),
        ReflectValueRef::I64(n) => Value::from(n),
        ReflectValueRef::F32(n) => Value::from(f64::from(n)),
        ReflectValueRef::F64(n) => Value::from(n),
        ReflectValueRef::Bool(b) => Value::Bool(b),
        ReflectValueRef::String(s) => Value::String(s.to_string()),
        ReflectValueRef::Bytes(b) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        ReflectValueRef::Enum(descriptor, number) => match descriptor.value_by_number(number) {
            Some(v) => Value::String(v.name().to_string()),
            None => Value::from(number),
        },
        ReflectValueRef::Message(message) => project_message(&*message),
    }
}

fn project_message(message: &dyn MessageDyn) -> Value {
    let descriptor = message.descriptor_dyn();
    let full_name = descriptor.full_name();
    if full_name == TIMESTAMP {
        return timestamp(message, &descriptor);
    }
    let fields = project_fields(message);
    if WRAPPERS.contains(&full_name) {
        return wrapper_value(Value::Object(fields));
    }
    Value::Object(fields)
}

fn timestamp(message: &dyn MessageDyn, descriptor: &MessageDescriptor) -> Value {
    let seconds = descriptor
        .field_by_name("seconds")
        .map(|f| f.get_singular_field_or_default(message));
    let nanos = descriptor
        .field_by_name("nanos")
        .map(|f| f.get_singular_field_or_default(message));
    let (Some(ReflectValueRef::I64(seconds)), Some(ReflectValueRef::I32(nanos))) = (seconds, nanos)
    else {
        return Value::Null;
    };
    let nanos = u32::try_from(nanos).unwrap_or_default();
    match chrono::DateTime::from_timestamp(seconds, nanos) {
        Some(time) => Value::String(time.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
        None => Value::Null,
    }
}
