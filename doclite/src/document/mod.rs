// Document payload processing and read-side snapshots.

use crate::error::{DocError, Result};
use crate::reference::DocumentRef;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::OnceLock;

const SENTINEL_KEY: &str = "_methodName";
const SERVER_TIMESTAMP: &str = "serverTimestamp";

/// Placeholder replaced with the write time when a document is stored.
pub fn server_timestamp() -> Value {
    let mut marker = Map::new();
    marker.insert(SENTINEL_KEY.into(), Value::String(SERVER_TIMESTAMP.into()));
    Value::Object(marker)
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .get(SENTINEL_KEY)
        .and_then(Value::as_str)
        .map(|name| name == SERVER_TIMESTAMP)
        .unwrap_or(false)
}

/// Timestamp encoding used for resolved sentinels: RFC 3339, UTC,
/// millisecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Turn caller data into the payload that gets stored: top-level sentinels
/// resolved to `now`, then dotted keys expanded into nested objects.
pub fn prepare_write(data: Value, now: DateTime<Utc>) -> Result<Map<String, Value>> {
    let map = match data {
        Value::Object(map) => map,
        other => {
            return Err(DocError::Validation(format!(
                "Document data must be an object, got {}",
                type_name(&other)
            )))
        }
    };
    Ok(expand_dot_notation(resolve_sentinels(map, now)))
}

/// Replace top-level `server_timestamp()` markers. Nested markers are left
/// untouched.
pub fn resolve_sentinels(mut data: Map<String, Value>, now: DateTime<Utc>) -> Map<String, Value> {
    for value in data.values_mut() {
        if is_server_timestamp(value) {
            *value = Value::String(format_timestamp(now));
        }
    }
    data
}

/// `{"a.b": 1, "c": 2}` becomes `{"a": {"b": 1}, "c": 2}`. A non-object
/// value standing in the way of a dotted key is replaced by an object.
pub fn expand_dot_notation(data: Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, value) in data {
        let parts: Vec<&str> = key.split('.').collect();
        let (last, parents) = match parts.split_last() {
            Some(split) => split,
            None => continue,
        };

        let mut current = &mut result;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        current.insert(last.to_string(), value);
    }
    result
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").expect("timestamp pattern is valid")
    })
}

/// Date revival heuristic: strings starting with an ISO-8601 date-time.
pub fn looks_like_timestamp(s: &str) -> bool {
    timestamp_pattern().is_match(s)
}

/// Parse a revivable string. Offsets are honored; strings without one are
/// read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if !looks_like_timestamp(s) {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Dotted paths of every revivable timestamp string, depth first. Array
/// elements use their index as the segment.
pub fn timestamp_fields(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_timestamps(value, &mut Vec::new(), &mut found);
    found
}

fn collect_timestamps(value: &Value, path: &mut Vec<String>, found: &mut Vec<String>) {
    match value {
        Value::String(s) if parse_timestamp(s).is_some() && !path.is_empty() => {
            found.push(path.join("."));
        }
        Value::Object(map) => {
            for (key, child) in map {
                path.push(key.clone());
                collect_timestamps(child, path, found);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(i.to_string());
                collect_timestamps(child, path, found);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Follow a dotted field path through nested objects.
pub fn get_field<'a>(data: &'a Value, field_path: &str) -> Option<&'a Value> {
    field_path
        .split('.')
        .try_fold(data, |current, part| current.get(part))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result of reading one document. `data` is `None` when it does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    reference: DocumentRef,
    data: Option<Value>,
}

impl DocumentSnapshot {
    pub fn new(reference: DocumentRef, data: Option<Value>) -> Self {
        DocumentSnapshot { reference, data }
    }

    pub fn id(&self) -> &str {
        self.reference.id()
    }

    pub fn reference(&self) -> &DocumentRef {
        &self.reference
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Value> {
        self.data
    }

    pub fn get(&self, field_path: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| get_field(d, field_path))
    }

    /// Deserialize into a typed struct; `DateTime` fields revive from their
    /// stored strings.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.data {
            Some(data) => Ok(Some(serde_json::from_value(data.clone())?)),
            None => Ok(None),
        }
    }

    pub fn get_timestamp(&self, field_path: &str) -> Option<DateTime<Utc>> {
        self.get(field_path)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    pub fn timestamp_fields(&self) -> Vec<String> {
        self.data.as_ref().map(timestamp_fields).unwrap_or_default()
    }
}

/// One document from a query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryDocumentSnapshot {
    pub collection_id: String,
    pub id: String,
    pub data: Value,
}

impl QueryDocumentSnapshot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn get(&self, field_path: &str) -> Option<&Value> {
        get_field(&self.data, field_path)
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn get_timestamp(&self, field_path: &str) -> Option<DateTime<Utc>> {
        self.get(field_path)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    pub fn reference(&self) -> Result<DocumentRef> {
        DocumentRef::new(&format!("{}/{}", self.collection_id, self.id))
    }
}

/// Ordered result of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySnapshot {
    docs: Vec<QueryDocumentSnapshot>,
}

impl QuerySnapshot {
    pub fn new(docs: Vec<QueryDocumentSnapshot>) -> Self {
        QuerySnapshot { docs }
    }

    pub fn docs(&self) -> &[QueryDocumentSnapshot] {
        &self.docs
    }

    pub fn into_docs(self) -> Vec<QueryDocumentSnapshot> {
        self.docs
    }

    pub fn size(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDocumentSnapshot> {
        self.docs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 13, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_server_timestamp_resolved() {
        let prepared = prepare_write(
            json!({ "title": "Hello", "created": server_timestamp() }),
            fixed_now(),
        )
        .unwrap();
        assert_eq!(prepared["created"], json!("2026-02-13T09:30:00.000Z"));
        assert_eq!(prepared["title"], json!("Hello"));
    }

    #[test]
    fn test_nested_sentinel_left_alone() {
        let prepared = prepare_write(
            json!({ "meta": { "at": server_timestamp() } }),
            fixed_now(),
        )
        .unwrap();
        assert!(is_server_timestamp(&prepared["meta"]["at"]));
    }

    #[test]
    fn test_dot_expansion() {
        let prepared = prepare_write(
            json!({ "address.city": "Oslo", "address.zip": "0150", "name": "Kari" }),
            fixed_now(),
        )
        .unwrap();
        assert_eq!(
            Value::Object(prepared),
            json!({ "address": { "city": "Oslo", "zip": "0150" }, "name": "Kari" })
        );
    }

    #[test]
    fn test_dot_expansion_replaces_scalar_parent() {
        let mut data = Map::new();
        data.insert("a".into(), json!(1));
        data.insert("a.b".into(), json!(2));
        let expanded = expand_dot_notation(data);
        assert_eq!(Value::Object(expanded), json!({ "a": { "b": 2 } }));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = prepare_write(json!([1, 2]), fixed_now()).unwrap_err();
        assert!(matches!(err, DocError::Validation(_)));
    }

    #[test]
    fn test_timestamp_detection() {
        assert!(looks_like_timestamp("2026-02-13T09:30:00.000Z"));
        assert!(looks_like_timestamp("2026-02-13T09:30:00"));
        assert!(!looks_like_timestamp("2026-02-13"));
        assert!(!looks_like_timestamp("meeting at 2026-02-13T09:30:00"));
        assert_eq!(parse_timestamp("2026-02-13T09:30:00.000Z"), Some(fixed_now()));
        assert_eq!(parse_timestamp("2026-02-13T10:30:00+01:00"), Some(fixed_now()));
        assert_eq!(parse_timestamp("2026-02-13T09:30:00"), Some(fixed_now()));
    }

    #[test]
    fn test_timestamp_fields_recurse() {
        let data = json!({
            "created": "2026-02-13T09:30:00.000Z",
            "title": "plain",
            "meta": { "edited": "2026-02-14T00:00:00Z" },
            "history": ["2026-01-01T00:00:00Z", "draft"]
        });
        let mut fields = timestamp_fields(&data);
        fields.sort();
        assert_eq!(fields, vec!["created", "history.0", "meta.edited"]);
    }

    #[test]
    fn test_snapshot_accessors() {
        #[derive(Deserialize)]
        struct Post {
            title: String,
            created: DateTime<Utc>,
        }

        let reference = DocumentRef::new("posts/p1").unwrap();
        let snap = DocumentSnapshot::new(
            reference.clone(),
            Some(json!({ "title": "Hi", "created": "2026-02-13T09:30:00.000Z", "meta": { "n": 1 } })),
        );
        assert!(snap.exists());
        assert_eq!(snap.id(), "p1");
        assert_eq!(snap.get("meta.n"), Some(&json!(1)));
        assert_eq!(snap.get_timestamp("created"), Some(fixed_now()));
        assert_eq!(snap.get_timestamp("title"), None);

        let post: Post = snap.data_as().unwrap().unwrap();
        assert_eq!(post.title, "Hi");
        assert_eq!(post.created, fixed_now());

        let missing = DocumentSnapshot::new(reference, None);
        assert!(!missing.exists());
        assert!(missing.data_as::<Post>().unwrap().is_none());
        assert!(missing.timestamp_fields().is_empty());
    }
}
