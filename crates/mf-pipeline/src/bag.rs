//! Per-file data bag.
//!
//! Fields are keyed `"<namespace>.<field>"`. The executor seeds the `input`
//! namespace and hands each step a [`StepBag`] that can read every field but
//! write only under the step's own name, so two steps can never clobber each
//! other's output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A typed value stored in the bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Path(PathBuf),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Floats, or integers widened to float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            FieldValue::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FieldValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<u32> for FieldValue {
    fn from(n: u32) -> Self {
        FieldValue::Integer(i64::from(n))
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<PathBuf> for FieldValue {
    fn from(p: PathBuf) -> Self {
        FieldValue::Path(p)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(v: serde_json::Value) -> Self {
        FieldValue::Json(v)
    }
}

/// The mutable per-file record steps read from and write to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag {
    fields: BTreeMap<String, FieldValue>,
}

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_text)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_integer)
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(FieldValue::as_float)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(FieldValue::as_bool)
    }

    pub fn path(&self, key: &str) -> Option<&Path> {
        self.get(key).and_then(FieldValue::as_path)
    }

    pub fn json(&self, key: &str) -> Option<&serde_json::Value> {
        self.get(key).and_then(FieldValue::as_json)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys under `namespace`, in sorted order.
    pub fn keys_in(&self, namespace: &str) -> Vec<&str> {
        let prefix = format!("{namespace}.");
        self.fields
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(String::as_str)
            .collect()
    }

    /// A write handle restricted to `namespace`.
    pub fn scoped<'a>(&'a mut self, namespace: &'a str) -> StepBag<'a> {
        StepBag {
            bag: self,
            namespace,
        }
    }

    pub(crate) fn insert(&mut self, key: String, value: FieldValue) {
        self.fields.insert(key, value);
    }

    /// Drop every field under `namespace`.
    pub(crate) fn clear_namespace(&mut self, namespace: &str) {
        let prefix = format!("{namespace}.");
        self.fields.retain(|k, _| !k.starts_with(&prefix));
    }
}

/// A step's view of the bag: reads anywhere, writes under its own namespace.
#[derive(Debug)]
pub struct StepBag<'a> {
    bag: &'a mut DataBag,
    namespace: &'a str,
}

impl StepBag<'_> {
    pub fn namespace(&self) -> &str {
        self.namespace
    }

    /// Write `<namespace>.<field>`.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.bag
            .insert(format!("{}.{field}", self.namespace), value.into());
    }

    /// Write `<namespace>.<field>` when `value` is present.
    pub fn set_opt<V: Into<FieldValue>>(&mut self, field: &str, value: Option<V>) {
        if let Some(v) = value {
            self.set(field, v);
        }
    }

    /// Read one of this step's own fields.
    pub fn own(&self, field: &str) -> Option<&FieldValue> {
        self.bag.get(&format!("{}.{field}", self.namespace))
    }
}

impl std::ops::Deref for StepBag<'_> {
    type Target = DataBag;

    fn deref(&self) -> &DataBag {
        self.bag
    }
}
