//! Cache key construction and prefix matching.
//!
//! A [`CacheKey`] is a tagged product of a resource name and a normalized
//! filter map. Equality, ordering and hashing all go through the canonical
//! serialized form `["resource",{filter}]`, whose filter object always has
//! sorted fields, so two filters built in a different field order produce the
//! same key.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Normalized filter: sorted field names, scalar or scalar-array values.
pub type Filter = BTreeMap<String, Value>;

/// Canonical, immutable cache key.
///
/// # Example
///
/// ```
/// use swr_kit::key::CacheKey;
/// use serde_json::json;
///
/// # fn main() -> swr_kit::Result<()> {
/// let a = CacheKey::build("controls", &json!({ "page": 1, "status": "open" }))?;
/// let b = CacheKey::build("controls", &json!({ "status": "open", "page": 1 }))?;
/// assert_eq!(a, b);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CacheKey {
    resource: String,
    filter: Filter,
    canonical: String,
}

impl CacheKey {
    /// Build a key from a resource name and any serializable filter.
    ///
    /// The filter must serialize to a map (or to `null`/unit for "no filter").
    /// Null fields are dropped.
    ///
    /// Numbers compare by value: a float with no fractional part becomes an
    /// integer, so `1.0` and `1` build the same key. serde_json serializes
    /// NaN and the infinities as `null`, so a non-finite float field is
    /// dropped like any other null field.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigError`: empty resource name
    /// - `Error::SerializationError`: filter is not a map, contains nested
    ///   maps or nested arrays, or fails to serialize
    pub fn build<F: Serialize + ?Sized>(resource: &str, filter: &F) -> Result<Self> {
        let filter = normalize_filter(filter)?;
        Self::from_parts(resource, filter)
    }

    /// Key for a resource without any filter.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an empty resource name.
    pub fn resource(resource: &str) -> Result<Self> {
        Self::from_parts(resource, Filter::new())
    }

    fn from_parts(resource: &str, filter: Filter) -> Result<Self> {
        validate_resource(resource)?;
        let canonical = serde_json::to_string(&(resource, &filter))?;
        Ok(CacheKey {
            resource: resource.to_string(),
            filter,
            canonical,
        })
    }

    /// Resource name this key belongs to.
    pub fn resource_name(&self) -> &str {
        &self.resource
    }

    /// Normalized filter map.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Canonical serialized form. Two keys are equal iff these bytes are equal.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filter.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            // Serializing a map of JSON values cannot fail.
            let filter = serde_json::to_string(&self.filter).unwrap_or_default();
            write!(f, "{}:{}", self.resource, filter)
        }
    }
}

/// Partial key used to address a group of entries at once.
///
/// Matching is resource-tag equality plus sub-map containment, never a
/// string prefix test: `KeyPrefix::resource("risk")` does not match a key of
/// resource `"risks"`. [`KeyPrefix::exact`] (also `From<&CacheKey>`) matches
/// one key only.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPrefix {
    resource: String,
    filter: Option<Filter>,
    exact: bool,
}

impl KeyPrefix {
    /// Prefix matching every key of a resource.
    pub fn resource(resource: &str) -> Self {
        KeyPrefix {
            resource: resource.to_string(),
            filter: None,
            exact: false,
        }
    }

    /// Prefix matching the keys of a resource whose filter contains every
    /// field of `filter` with an equal value.
    ///
    /// # Errors
    ///
    /// Same as [`CacheKey::build`].
    pub fn build<F: Serialize + ?Sized>(resource: &str, filter: &F) -> Result<Self> {
        validate_resource(resource)?;
        Ok(KeyPrefix {
            resource: resource.to_string(),
            filter: Some(normalize_filter(filter)?),
            exact: false,
        })
    }

    /// Prefix matching `key` and nothing else: a key whose filter has extra
    /// fields is not covered.
    pub fn exact(key: &CacheKey) -> Self {
        KeyPrefix {
            resource: key.resource.clone(),
            filter: Some(key.filter.clone()),
            exact: true,
        }
    }

    /// Whether this prefix addresses a single key.
    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Resource this prefix addresses.
    pub fn resource_name(&self) -> &str {
        &self.resource
    }

    /// Whether `key` falls under this prefix.
    pub fn matches(&self, key: &CacheKey) -> bool {
        if self.resource != key.resource {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) if self.exact => *filter == key.filter,
            Some(partial) => partial
                .iter()
                .all(|(field, value)| key.filter.get(field) == Some(value)),
        }
    }
}

impl From<&CacheKey> for KeyPrefix {
    fn from(key: &CacheKey) -> Self {
        KeyPrefix::exact(key)
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wildcard = if self.exact { "" } else { "*" };
        match &self.filter {
            Some(filter) if !filter.is_empty() => {
                let filter = serde_json::to_string(filter).unwrap_or_default();
                write!(f, "{}:{}{}", self.resource, filter, wildcard)
            }
            _ => write!(f, "{}{}", self.resource, wildcard),
        }
    }
}

fn validate_resource(resource: &str) -> Result<()> {
    if resource.trim().is_empty() {
        return Err(Error::ConfigError(
            "resource name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn normalize_filter<F: Serialize + ?Sized>(filter: &F) -> Result<Filter> {
    let fields = match serde_json::to_value(filter)? {
        Value::Null => return Ok(Filter::new()),
        Value::Object(fields) => fields,
        other => {
            return Err(Error::SerializationError(format!(
                "filter must be a map of scalars, got {}",
                kind_of(&other)
            )))
        }
    };

    let mut normalized = Filter::new();
    for (field, value) in fields {
        match value {
            Value::Null => continue,
            Value::Object(_) => {
                return Err(Error::SerializationError(format!(
                    "filter field '{}' is a nested map",
                    field
                )))
            }
            Value::Array(items) => {
                if let Some(bad) = items.iter().find(|item| !is_scalar(item)) {
                    return Err(Error::SerializationError(format!(
                        "filter field '{}' contains a nested {}",
                        field,
                        kind_of(bad)
                    )));
                }
                let items = items.into_iter().map(integral_number).collect();
                normalized.insert(field, Value::Array(items));
            }
            scalar => {
                normalized.insert(field, integral_number(scalar));
            }
        }
    }
    Ok(normalized)
}

/// Whole floats (`2.0`) as integers (`2`).
fn integral_number(value: Value) -> Value {
    let whole = match &value {
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64),
        _ => None,
    };
    match whole {
        Some(f) => Value::from(f as i64),
        None => value,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
