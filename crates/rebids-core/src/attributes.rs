//! Normalized attribute values and the per-recording attribute cache

use crate::recording::Recording;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// A source metadata value after normalization.
///
/// Format readers coerce vendor-specific types into this closed set
/// before values reach the matcher or the resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    /// Duration, exported as total seconds
    Duration(chrono::Duration),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Build a value from a JSON scalar or array. Objects are not
    /// representable; nested objects are addressed by path before
    /// conversion.
    pub fn from_json(value: &serde_json::Value) -> Option<AttrValue> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(AttrValue::Str(b.to_string())),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(AttrValue::Int(i))
                } else {
                    n.as_f64().map(AttrValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(AttrValue::Str(s.clone())),
            serde_json::Value::Array(items) => Some(AttrValue::List(
                items.iter().filter_map(AttrValue::from_json).collect(),
            )),
            serde_json::Value::Object(_) => None,
        }
    }

    /// Export the value for a JSON sidecar, preserving the native type
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Str(s) => serde_json::Value::String(s.clone()),
            AttrValue::Int(i) => serde_json::Value::from(*i),
            AttrValue::Float(f) => serde_json::Value::from(*f),
            AttrValue::Date(d) => serde_json::Value::String(d.to_string()),
            AttrValue::Time(t) => serde_json::Value::String(t.to_string()),
            AttrValue::DateTime(dt) => serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            AttrValue::Duration(d) => serde_json::Value::from(duration_seconds(d)),
            AttrValue::List(items) => {
                serde_json::Value::Array(items.iter().map(AttrValue::as_json).collect())
            }
        }
    }

    /// Trim surrounding whitespace of string values, as retrieved
    /// metadata is compared and displayed stripped
    pub fn trimmed(self) -> AttrValue {
        match self {
            AttrValue::Str(s) => AttrValue::Str(s.trim().to_string()),
            other => other,
        }
    }
}

fn duration_seconds(d: &chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "{s}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Date(d) => write!(f, "{d}"),
            AttrValue::Time(t) => write!(f, "{t}"),
            AttrValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            AttrValue::Duration(d) => write!(f, "{}", duration_seconds(d)),
            AttrValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

/// Separator used to address nested values and list indices in
/// attribute keys, e.g. `ImageType/0`
pub const KEY_SEPARATOR: char = '/';

/// Lazy per-recording cache of extracted attribute values.
///
/// Values are extracted once per (file, key) and stay stable until the
/// recording's cursor advances to a different file, at which point the
/// whole cache is invalidated.
#[derive(Debug, Default)]
pub struct AttributeStore {
    file: Option<PathBuf>,
    cache: HashMap<String, Option<AttrValue>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve an attribute through the cache, triggering lazy
    /// extraction from the recording on first access
    pub fn get(&mut self, rec: &dyn Recording, key: &str) -> Option<AttrValue> {
        self.sync(rec);
        if let Some(cached) = self.cache.get(key) {
            return cached.clone();
        }
        let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        let value = rec.get_field(&parts).map(AttrValue::trimmed);
        self.cache.insert(key.to_string(), value.clone());
        value
    }

    /// Override a cached attribute value
    pub fn set(&mut self, key: &str, value: AttrValue) {
        self.cache.insert(key.to_string(), Some(value));
    }

    /// Drop a single cached attribute, forcing re-extraction
    pub fn reset(&mut self, key: &str) {
        self.cache.remove(key);
    }

    /// Clear the whole cache
    pub fn clear(&mut self) {
        self.cache.clear();
        self.file = None;
    }

    /// All attributes cached for the current file, keyed by attribute
    /// name. Used to build unknown-bucket runs.
    pub fn snapshot(&self) -> impl Iterator<Item = (&String, &Option<AttrValue>)> {
        self.cache.iter()
    }

    fn sync(&mut self, rec: &dyn Recording) {
        let current = rec.current_file().map(|p| p.to_path_buf());
        if self.file != current {
            self.cache.clear();
            self.file = current;
        }
    }
}
