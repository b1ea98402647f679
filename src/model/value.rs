//! Property values and output references.
//!
//! Values are a small closed set of JSON-like variants. A string of the exact
//! form `${resource.output}` is parsed as a [`Value::Reference`] to another
//! resource's output, both from YAML declarations and from JSON state.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Rendering of a value that is only known once its dependency is applied.
const UNKNOWN_MARKER: &str = "(known after apply)";

/// A resource's property bag.
pub type Properties = BTreeMap<String, Value>;

/// Desired properties after reference resolution at plan time.
pub type PlannedProperties = BTreeMap<String, PlannedValue>;

/// Reference to a named output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Logical name of the referenced resource.
    pub resource: String,
    /// Output name on that resource (e.g. `id`, `address`).
    pub output: String,
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Unresolved reference to another resource's output.
    Reference(OutputRef),
    /// String literal.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Nested object.
    Map(BTreeMap<String, Value>),
}

/// A desired value whose references may not be known until apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedValue {
    /// Fully resolved value.
    Known(Value),
    /// Depends on an output that only exists after apply.
    Unknown,
}

impl OutputRef {
    /// Creates a new output reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Parses `${resource.output}`.
    ///
    /// Returns `None` for any other string.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text.strip_prefix("${")?.strip_suffix('}')?;
        let (resource, output) = inner.split_once('.')?;
        if resource.is_empty() || output.is_empty() || output.contains('.') {
            return None;
        }
        Some(Self::new(resource, output))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

impl Serialize for OutputRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OutputRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).ok_or_else(|| D::Error::custom(format!("not an output reference: {text}")))
    }
}

impl Value {
    /// Returns a short name for the variant, used in schema errors.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Reference(_) => "reference",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Returns true if the value is a string or a reference to one.
    #[must_use]
    pub const fn is_stringish(&self) -> bool {
        matches!(self, Self::String(_) | Self::Reference(_))
    }

    /// Appends every reference contained in this value, depth first.
    pub fn collect_references(&self, out: &mut Vec<OutputRef>) {
        match self {
            Self::Reference(r) => out.push(r.clone()),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            Self::Bool(_) | Self::Integer(_) | Self::String(_) => {}
        }
    }

    /// Substitutes references using `lookup`.
    ///
    /// Returns `None` if any reference cannot be resolved.
    pub fn resolve<F>(&self, lookup: &F) -> Option<Self>
    where
        F: Fn(&OutputRef) -> Option<String>,
    {
        match self {
            Self::Reference(r) => lookup(r).map(Self::String),
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Self::Map),
            Self::Bool(_) | Self::Integer(_) | Self::String(_) => Some(self.clone()),
        }
    }

    /// Returns the contained string, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Reference(r) => write!(f, "{r}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(_) | Self::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

impl Serialize for PlannedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => v.serialize(serializer),
            Self::Unknown => serializer.serialize_str(UNKNOWN_MARKER),
        }
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => f.write_str(UNKNOWN_MARKER),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        OutputRef::parse(s).map_or_else(|| Self::String(s.to_string()), Self::Reference)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<OutputRef> for Value {
    fn from(r: OutputRef) -> Self {
        Self::Reference(r)
    }
}
