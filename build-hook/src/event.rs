//! Decoding of the registry's build-success webhook payload.
//!
//! The payload is an external, evolving contract. Every field is optional on
//! the wire and falls back to its empty value, unknown fields are ignored, and
//! a field with the wrong type only loses that field. A malformed body is not
//! fatal to the request (see [`decode_event_lenient`]).
use crate::metrics_defs::DECODE_FAILURES;
use http::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use shared::counter;

/// A completed container image build, as reported by the registry.
///
/// Missing or `null` fields decode to the empty string / empty list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildEvent {
    /// `namespace/name`. Informational only.
    #[serde(deserialize_with = "null_as_default")]
    pub repository: String,
    #[serde(deserialize_with = "null_as_default")]
    pub namespace: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    /// Registry-qualified image location, e.g. `quay.io/org/app`.
    #[serde(deserialize_with = "null_as_default")]
    pub docker_url: String,
    /// Tags published by this build, in the order the registry sent them.
    #[serde(deserialize_with = "null_as_default")]
    pub docker_tags: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub homepage: String,
    #[serde(deserialize_with = "null_as_default")]
    pub visibility: String,
    /// Content identifier of the built image. Not sent by every payload variant.
    #[serde(deserialize_with = "null_as_default")]
    pub image_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub build_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub build_name: String,
    /// Absent for manually started builds.
    #[serde(deserialize_with = "null_as_default")]
    pub trigger_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub trigger_kind: String,
    /// Source-control details attached by the trigger (ref, commit sha, commit
    /// info). Kept opaque and only carried through to the audit record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_metadata: Option<serde_json::Value>,
}

impl BuildEvent {
    /// Populates an event field by field from a decoded JSON object.
    ///
    /// A field holding a value of the wrong type keeps its empty value while
    /// the remaining fields are still read. The first such failure is returned
    /// alongside the event.
    pub fn from_json_map(mut map: Map<String, Value>) -> (BuildEvent, Option<DecodeError>) {
        let mut error = None;

        let event = BuildEvent {
            repository: take_field(&mut map, "repository", &mut error),
            namespace: take_field(&mut map, "namespace", &mut error),
            name: take_field(&mut map, "name", &mut error),
            docker_url: take_field(&mut map, "docker_url", &mut error),
            docker_tags: take_tags(&mut map, &mut error),
            homepage: take_field(&mut map, "homepage", &mut error),
            visibility: take_field(&mut map, "visibility", &mut error),
            image_id: take_field(&mut map, "image_id", &mut error),
            build_id: take_field(&mut map, "build_id", &mut error),
            build_name: take_field(&mut map, "build_name", &mut error),
            trigger_id: take_field(&mut map, "trigger_id", &mut error),
            trigger_kind: take_field(&mut map, "trigger_kind", &mut error),
            trigger_metadata: match map.remove("trigger_metadata") {
                None | Some(Value::Null) => None,
                Some(value) => Some(value),
            },
        };

        (event, error)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn decode_or_default<T>(value: Value, field: &'static str, error: &mut Option<DecodeError>) -> T
where
    T: Default + DeserializeOwned,
{
    serde_json::from_value(value).unwrap_or_else(|source| {
        if error.is_none() {
            *error = Some(DecodeError::InvalidField { field, source });
        }
        T::default()
    })
}

fn take_field<T>(map: &mut Map<String, Value>, field: &'static str, error: &mut Option<DecodeError>) -> T
where
    T: Default + DeserializeOwned,
{
    match map.remove(field) {
        None | Some(Value::Null) => T::default(),
        Some(value) => decode_or_default(value, field, error),
    }
}

// Tags are read one by one so a single bad element does not cost the others.
fn take_tags(map: &mut Map<String, Value>, error: &mut Option<DecodeError>) -> Vec<String> {
    match map.remove("docker_tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Null => String::new(),
                item => decode_or_default(item, "docker_tags", error),
            })
            .collect(),
        Some(value) => decode_or_default(value, "docker_tags", error),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("request body is empty")]
    EmptyBody,
    #[error("malformed build event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("build event must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("invalid value for field {field}: {source}")]
    InvalidField {
        field: &'static str,
        source: serde_json::Error,
    },
}

/// Only create/update requests declaring a JSON body are decoded.
pub fn carries_json_body(method: &Method, content_type: Option<&str>) -> bool {
    if method != Method::POST && method != Method::PUT {
        return false;
    }

    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false)
}

/// Decodes a build event from a request body.
///
/// Requests that do not carry a JSON body yield the default event without
/// looking at `body`. Only the first JSON value of the body is read; anything
/// after it is ignored.
///
/// The returned event is always usable. On a syntax error or a body that is
/// not an object it is the default event; when only some fields are mistyped
/// it holds every field that could be read. The error, if any, is returned
/// next to it.
pub fn decode_event(
    method: &Method,
    content_type: Option<&str>,
    body: &[u8],
) -> (BuildEvent, Option<DecodeError>) {
    if !carries_json_body(method, content_type) {
        return (BuildEvent::default(), None);
    }

    let mut values = serde_json::Deserializer::from_slice(body).into_iter::<Value>();
    let value = match values.next() {
        Some(Ok(value)) => value,
        Some(Err(e)) => return (BuildEvent::default(), Some(e.into())),
        None => return (BuildEvent::default(), Some(DecodeError::EmptyBody)),
    };

    match value {
        Value::Object(map) => BuildEvent::from_json_map(map),
        Value::Null => (BuildEvent::default(), None),
        Value::Bool(_) => (BuildEvent::default(), Some(DecodeError::NotAnObject("boolean"))),
        Value::Number(_) => (BuildEvent::default(), Some(DecodeError::NotAnObject("number"))),
        Value::String(_) => (BuildEvent::default(), Some(DecodeError::NotAnObject("string"))),
        Value::Array(_) => (BuildEvent::default(), Some(DecodeError::NotAnObject("array"))),
    }
}

/// Decodes a build event, continuing with whatever could be read when the
/// body is partly or entirely undecodable. The failure is logged and counted
/// but never returned.
pub fn decode_event_lenient(method: &Method, content_type: Option<&str>, body: &[u8]) -> BuildEvent {
    let (event, error) = decode_event(method, content_type, body);
    if let Some(e) = error {
        counter!(DECODE_FAILURES).increment(1);
        tracing::warn!(error = %e, body_len = body.len(), "Could not fully decode build event, continuing with the fields that were read");
    }
    event
}
