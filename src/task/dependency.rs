//! Worker eligibility predicates.
//!
//! A dependency is evaluated against a worker's property map. Evaluation
//! never fails: a panicking closure or a requirement whose value has the
//! wrong type simply means "not eligible here".

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque properties a worker advertises at registration.
pub type Properties = serde_json::Map<String, Value>;

/// Signature of a closure dependency.
pub type PredicateFn = dyn Fn(&Properties) -> bool + Send + Sync;

/// Comparison applied by a [`Requirement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// String contains substring, array contains element, or object has key.
    Contains,
    /// Key is present; the requirement's value is ignored.
    Exists,
}

/// A serializable `property <op> value` constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub op: Comparison,
    #[serde(default)]
    pub value: Value,
}

impl Requirement {
    pub fn new(key: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate against a property map. Missing keys never match.
    pub fn matches(&self, properties: &Properties) -> bool {
        let Some(actual) = properties.get(&self.key) else {
            return false;
        };

        match self.op {
            Comparison::Exists => true,
            Comparison::Eq => values_equal(actual, &self.value),
            Comparison::Ne => !values_equal(actual, &self.value),
            Comparison::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            Comparison::Le => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            Comparison::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            Comparison::Ge => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            Comparison::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Value::Array(items), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                _ => false,
            },
        }
    }
}

/// Numbers compare by value so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Decides whether a task may run on a given worker.
#[derive(Clone, Default)]
pub enum Dependency {
    /// Eligible on every worker.
    #[default]
    Always,
    /// Arbitrary closure over the worker's properties.
    Predicate(Arc<PredicateFn>),
    /// Structured constraint that can cross a process boundary.
    Requirement(Requirement),
    /// Every member must hold.
    All(Vec<Dependency>),
    /// At least one member must hold.
    Any(Vec<Dependency>),
}

impl Dependency {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Properties) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn require(key: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Self::Requirement(Requirement::new(key, op, value))
    }

    /// Evaluate against a worker's properties.
    pub fn is_satisfied_by(&self, properties: &Properties) -> bool {
        match self {
            Self::Always => true,
            Self::Predicate(f) => {
                match panic::catch_unwind(AssertUnwindSafe(|| f(properties))) {
                    Ok(eligible) => eligible,
                    Err(_) => {
                        tracing::warn!(
                            "Dependency predicate panicked; treating worker as ineligible"
                        );
                        false
                    }
                }
            }
            Self::Requirement(req) => req.matches(properties),
            Self::All(deps) => deps.iter().all(|d| d.is_satisfied_by(properties)),
            Self::Any(deps) => deps.iter().any(|d| d.is_satisfied_by(properties)),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Predicate(_) => f.write_str("Predicate(<fn>)"),
            Self::Requirement(req) => f.debug_tuple("Requirement").field(req).finish(),
            Self::All(deps) => f.debug_tuple("All").field(deps).finish(),
            Self::Any(deps) => f.debug_tuple("Any").field(deps).finish(),
        }
    }
}

impl From<Requirement> for Dependency {
    fn from(req: Requirement) -> Self {
        Self::Requirement(req)
    }
}
