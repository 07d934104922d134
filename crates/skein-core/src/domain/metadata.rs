//! Thread metadata and its merge rules.
//!
//! Values are `serde_json::Value`, which already is a tagged union of every
//! shape a metadata entry can take. Merging two maps resolves key conflicts by
//! a [`MergeStrategy`], optionally overridden per key.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Key/value map attached to a thread or message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, Value>);

/// How a conflicting key is resolved during a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// The receiver's value wins.
    KeepExisting,
    /// The incoming value wins.
    #[default]
    KeepNew,
    /// Type-directed combination; see [`combine`].
    Combine,
    /// Conflicting keys are left out of the merge.
    Skip,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::KeepExisting => "keep_existing",
            MergeStrategy::KeepNew => "keep_new",
            MergeStrategy::Combine => "combine",
            MergeStrategy::Skip => "skip",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown merge strategy '{0}'")]
pub struct UnknownStrategy(pub String);

impl FromStr for MergeStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").to_ascii_lowercase().as_str() {
            "keep_existing" => Ok(MergeStrategy::KeepExisting),
            "keep_new" | "overwrite" => Ok(MergeStrategy::KeepNew),
            "combine" => Ok(MergeStrategy::Combine),
            "skip" => Ok(MergeStrategy::Skip),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// Custom conflict resolver: `(existing, incoming) -> merged`.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Strategy plus per-key overrides.
#[derive(Clone, Default)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    per_key: HashMap<String, MergeFn>,
}

impl MergeOptions {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            per_key: HashMap::new(),
        }
    }

    /// Resolve conflicts on `key` with `f` instead of the strategy.
    pub fn with_key<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.per_key.insert(key.into(), Arc::new(f));
        self
    }
}

impl From<MergeStrategy> for MergeOptions {
    fn from(strategy: MergeStrategy) -> Self {
        Self::new(strategy)
    }
}

impl fmt::Debug for MergeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.per_key.keys().collect();
        keys.sort();
        f.debug_struct("MergeOptions")
            .field("strategy", &self.strategy)
            .field("per_key", &keys)
            .finish()
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Sorted key list, handy for stable log output.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.0.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Merge `incoming` into `self`.
    ///
    /// Keys absent from `self` are always added. Conflicts go to the per-key
    /// function when one is registered, otherwise to the strategy.
    pub fn merge(&mut self, incoming: &Metadata, options: &MergeOptions) {
        for (key, new_value) in incoming.iter() {
            let Some(existing) = self.0.get(key) else {
                self.0.insert(key.clone(), new_value.clone());
                continue;
            };

            if let Some(f) = options.per_key.get(key) {
                let merged = f(existing, new_value);
                self.0.insert(key.clone(), merged);
                continue;
            }

            match options.strategy {
                MergeStrategy::KeepExisting => {}
                MergeStrategy::KeepNew => {
                    self.0.insert(key.clone(), new_value.clone());
                }
                MergeStrategy::Combine => {
                    let merged = combine(existing, new_value);
                    self.0.insert(key.clone(), merged);
                }
                MergeStrategy::Skip => {
                    tracing::debug!(key = %key, "metadata merge skipped conflicting key");
                }
            }
        }
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<HashMap<String, Value>> for Metadata {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

/// Type-directed combination of two values.
///
/// - array + array: receiver elements followed by incoming elements
/// - object + object: shallow merge, incoming wins per field
/// - string + string: concatenation
/// - integer + integer, float + float: sum
///
/// Every other pair returns `incoming` unchanged. That includes integer vs
/// float and integer sums that overflow.
pub fn combine(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Array(a), Value::Array(b)) => {
            let mut out = Vec::with_capacity(a.len() + b.len());
            out.extend(a.iter().cloned());
            out.extend(b.iter().cloned());
            Value::Array(out)
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        (Value::String(a), Value::String(b)) => Value::String(format!("{a}{b}")),
        (Value::Number(a), Value::Number(b)) => {
            add_numbers(a, b).unwrap_or_else(|| incoming.clone())
        }
        _ => incoming.clone(),
    }
}

fn add_numbers(a: &Number, b: &Number) -> Option<Value> {
    match (a.is_f64(), b.is_f64()) {
        (false, false) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return x.checked_add(y).map(Value::from);
            }
            let (x, y) = (a.as_u64()?, b.as_u64()?);
            x.checked_add(y).map(Value::from)
        }
        (true, true) => {
            let sum = a.as_f64()? + b.as_f64()?;
            Number::from_f64(sum).map(Value::Number)
        }
        _ => None,
    }
}
