//! Request identification and construction.
//!
//! A [`Request`] describes *what* to fetch. Two requests with the same
//! [`RequestId`] are the same logical request: they share one in-flight task,
//! one cache entry and one set of subscribers.
//!
//! Ids are either supplied by the caller or derived from the request input by
//! [`canonical_json`], which sorts object keys at every nesting level while
//! keeping array order. Reordering keys never changes the id; reordering array
//! elements always does.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::RequestError;

/// Field that carries a caller-supplied id inside the request input.
pub const ID_FIELD: &str = "id";

/// Fields reserved for the engine. Inputs must never set them.
pub const RESERVED_FIELDS: [&str; 2] = ["type", "kind"];

/// Deduplication and cache key of a request.
///
/// `RequestId` is a cheap-to-clone newtype over a shared string.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings
/// - `From::from()`: no validation (for ids produced by the engine itself)
///
/// # Examples
///
/// ```
/// use composable_query_core::request::RequestId;
///
/// let id: RequestId = "users-page-1".parse().unwrap();
/// assert_eq!(id.as_str(), "users-page-1");
/// assert!("".parse::<RequestId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RequestError::EmptyId);
        }
        Ok(Self(Arc::from(s)))
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How the handler's outcome is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// At most one value, delivered as a single `complete`.
    SingleShot,
    /// Zero or more values delivered as `buffer`s, then one `complete`.
    Stream,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleShot => f.write_str("single_shot"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// A normalized description of what to fetch.
///
/// Cloning is cheap: the id and params are shared.
///
/// # Examples
///
/// ```
/// use composable_query_core::request::{Request, RequestKind};
/// use serde_json::json;
///
/// let a = Request::single(json!({ "query": "users", "vars": { "a": 1, "b": 2 } })).unwrap();
/// let b = Request::single(json!({ "vars": { "b": 2, "a": 1 }, "query": "users" })).unwrap();
/// assert_eq!(a.id(), b.id());
/// assert_eq!(a.kind(), RequestKind::SingleShot);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    params: Arc<Value>,
}

impl Request {
    /// Build a request from caller input.
    ///
    /// The input's `id` field, when present, must be a non-empty string or
    /// `null`. Without a usable id one is derived from the rest of the input.
    ///
    /// # Errors
    ///
    /// - [`RequestError::KindPreset`] if the input sets `type` or `kind`
    /// - [`RequestError::InvalidId`] if `id` is not a string or `null`
    /// - [`RequestError::EmptyId`] if `id` is an empty string
    pub fn build(input: Value, kind: RequestKind) -> Result<Self, RequestError> {
        let (explicit, params) = match input {
            Value::Object(mut fields) => {
                if let Some(field) = RESERVED_FIELDS.iter().find(|f| fields.contains_key(**f)) {
                    return Err(RequestError::KindPreset {
                        field: (*field).to_string(),
                    });
                }
                let explicit = match fields.remove(ID_FIELD) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(id)) => Some(id.parse::<RequestId>()?),
                    Some(other) => return Err(RequestError::InvalidId(type_name(&other))),
                };
                (explicit, Value::Object(fields))
            }
            other => (None, other),
        };

        let id = explicit.unwrap_or_else(|| RequestId::from(canonical_json(&params)));
        tracing::trace!(request_id = %id, %kind, "Built request");

        Ok(Self {
            id,
            kind,
            params: Arc::new(params),
        })
    }

    /// Build a [`RequestKind::SingleShot`] request.
    ///
    /// # Errors
    ///
    /// See [`Request::build`].
    pub fn single(input: Value) -> Result<Self, RequestError> {
        Self::build(input, RequestKind::SingleShot)
    }

    /// Build a [`RequestKind::Stream`] request.
    ///
    /// # Errors
    ///
    /// See [`Request::build`].
    pub fn stream(input: Value) -> Result<Self, RequestError> {
        Self::build(input, RequestKind::Stream)
    }

    /// Build a request with an explicit id. The id is never re-derived.
    #[must_use]
    pub fn with_id(id: RequestId, kind: RequestKind, params: Value) -> Self {
        Self {
            id,
            kind,
            params: Arc::new(params),
        }
    }

    /// The request's deduplication and cache key.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Single-shot or stream.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Whether this is a stream request.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.kind == RequestKind::Stream
    }

    /// The request input without its `id` field.
    #[must_use]
    pub fn params(&self) -> &Value {
        &self.params
    }
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Serialize a value with object keys sorted at every level.
///
/// Array element order is kept. The output is valid JSON and does not depend
/// on `serde_json`'s map ordering features.
///
/// # Examples
///
/// ```
/// use composable_query_core::request::canonical_json;
/// use serde_json::json;
///
/// assert_eq!(canonical_json(&json!({ "b": [2, 1], "a": null })), r#"{"a":null,"b":[2,1]}"#);
/// ```
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(fields) => write_object(fields, out),
        // Scalars serialize infallibly
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(fields: &Map<String, Value>, out: &mut String) {
    write_entries(fields.iter().map(|(k, v)| (k.as_str(), v)).collect(), out);
}

/// Write object entries sorted by key, whatever order they come in.
fn write_entries(mut entries: Vec<(&str, &Value)>, out: &mut String) {
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.to_string()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn rejects_preset_type() {
        let err = Request::single(json!({ "type": "anything" })).unwrap_err();
        assert!(matches!(err, RequestError::KindPreset { ref field } if field == "type"));

        let err = Request::single(json!({ "kind": "stream" })).unwrap_err();
        assert!(matches!(err, RequestError::KindPreset { ref field } if field == "kind"));
    }

    #[test]
    fn accepts_missing_or_null_id() {
        assert!(Request::single(json!({})).is_ok());
        assert!(Request::single(json!({ "id": null })).is_ok());
    }

    #[test]
    fn rejects_invalid_ids() {
        for bad in [json!(1), json!(true), json!(false), json!({}), json!([])] {
            let err = Request::single(json!({ "id": bad })).unwrap_err();
            assert!(matches!(err, RequestError::InvalidId(_)), "{bad} should be rejected");
        }
        assert_eq!(
            Request::single(json!({ "id": "" })).unwrap_err(),
            RequestError::EmptyId
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = Request::single(json!({
            "query": "test",
            "url": "/api/url",
            "variables": { "a": 1, "b": 2 },
            "array": [1, 2],
        }))
        .unwrap();
        let b = Request::single(json!({
            "url": "/api/url",
            "query": "test",
            "variables": { "b": 2, "a": 1 },
            "array": [1, 2],
        }))
        .unwrap();
        assert_eq!(a.id(), b.id());

        let c = Request::single(json!({
            "url": "/api/url",
            "query": "test",
            "variables": { "b": 2, "a": 1 },
            "array": [2, 1],
        }))
        .unwrap();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn derived_id_is_the_canonical_input() {
        let req = Request::single(json!({ "query": "test", "variables": [1, 2] })).unwrap();
        let parsed: Value = serde_json::from_str(req.id().as_str()).unwrap();
        assert_eq!(parsed, json!({ "query": "test", "variables": [1, 2] }));

        let req = Request::single(json!({ "query": "test", "variables": {} })).unwrap();
        let parsed: Value = serde_json::from_str(req.id().as_str()).unwrap();
        assert_eq!(parsed, json!({ "query": "test", "variables": {} }));
    }

    #[test]
    fn explicit_id_is_kept_and_stripped_from_params() {
        let req = Request::single(json!({ "id": "__id__", "query": "test" })).unwrap();
        assert_eq!(req.id().as_str(), "__id__");
        assert_eq!(req.params(), &json!({ "query": "test" }));
    }

    #[test]
    fn kind_does_not_change_the_id() {
        let single = Request::single(json!({ "q": 1 })).unwrap();
        let stream = Request::stream(json!({ "q": 1 })).unwrap();
        assert_eq!(single.id(), stream.id());
        assert!(stream.is_stream());
        assert!(!single.is_stream());
    }

    #[test]
    fn canonical_json_escapes_keys_and_strings() {
        let value = json!({ "quo\"te": "line\nbreak" });
        assert_eq!(canonical_json(&value), r#"{"quo\"te":"line\nbreak"}"#);
    }

    fn entries_json(entries: &[(String, Value)]) -> String {
        let mut out = String::new();
        write_entries(entries.iter().map(|(k, v)| (k.as_str(), v)).collect(), &mut out);
        out
    }

    #[test]
    fn entries_are_sorted_whatever_their_order() {
        let reversed = [
            ("variables".to_string(), json!({ "b": 2, "a": 1 })),
            ("url".to_string(), json!("/api/url")),
            ("query".to_string(), json!("test")),
        ];
        assert_eq!(
            entries_json(&reversed),
            r#"{"query":"test","url":"/api/url","variables":{"a":1,"b":2}}"#
        );

        let mut forward = reversed.clone();
        forward.reverse();
        assert_eq!(entries_json(&forward), entries_json(&reversed));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,6}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_json_round_trips(value in arb_json()) {
            let text = canonical_json(&value);
            let parsed: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(parsed, value);
        }

        #[test]
        fn entry_order_never_changes_the_output(
            shuffled in prop::collection::btree_map("[a-z]{1,5}", any::<i32>(), 1..8)
                .prop_map(|m| m.into_iter().map(|(k, v)| (k, json!(v))).collect::<Vec<_>>())
                .prop_shuffle()
        ) {
            let sorted: Map<String, Value> = shuffled.iter().cloned().collect();
            prop_assert_eq!(entries_json(&shuffled), canonical_json(&Value::Object(sorted)));
        }
    }
}
