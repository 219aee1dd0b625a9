//! Resource property values with secret tracking.
//!
//! Inputs and outputs are maps of [`PropertyValue`]s, where any node of the
//! value tree may be wrapped as secret. Secret wrapping survives
//! serialization so that snapshots persisted to the coordination service
//! keep the distinction; on the wire a secret is encoded as a single-key
//! object `{"__secret": <value>}`.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire marker key for secret-wrapped values. Plain objects must not use
/// this key.
pub const SECRET_MARKER: &str = "__secret";

/// Ordered property map; `BTreeMap` keeps serialization deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A resource property value: arbitrary JSON, optionally wrapped secret.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// An ordinary JSON value.
    Plain(serde_json::Value),
    /// A value that must be treated as sensitive.
    Secret(Box<PropertyValue>),
}

impl PropertyValue {
    /// Construct a plain value from anything JSON-serializable.
    ///
    /// # Panics
    ///
    /// Panics if `value` cannot be represented as JSON (e.g. a map with
    /// non-string keys).
    #[must_use]
    pub fn plain(value: impl Serialize) -> Self {
        Self::Plain(serde_json::to_value(value).expect("value representable as JSON"))
    }

    /// Wrap a value as secret. Wrapping an already-secret value is a no-op.
    #[must_use]
    pub fn secret(value: PropertyValue) -> Self {
        if value.is_secret() {
            value
        } else {
            Self::Secret(Box::new(value))
        }
    }

    /// Whether this value is wrapped secret.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }

    /// Wrap `self` as secret in place.
    pub fn make_secret(&mut self) {
        if !self.is_secret() {
            let inner = std::mem::replace(self, Self::Plain(serde_json::Value::Null));
            *self = Self::Secret(Box::new(inner));
        }
    }

    /// The innermost plain JSON value, looking through secret wrapping.
    #[must_use]
    pub fn unwrap_secrets(&self) -> &serde_json::Value {
        match self {
            Self::Plain(v) => v,
            Self::Secret(inner) => inner.unwrap_secrets(),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Plain(v) => v.serialize(serializer),
            Self::Secret(inner) => {
                let mut map = BTreeMap::new();
                map.insert(SECRET_MARKER, inner.as_ref());
                map.serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        from_json(value).map_err(D::Error::custom)
    }
}

fn from_json(value: serde_json::Value) -> Result<PropertyValue, String> {
    match value {
        serde_json::Value::Object(mut map)
            if map.len() == 1 && map.contains_key(SECRET_MARKER) =>
        {
            let inner = map.remove(SECRET_MARKER).ok_or("missing secret payload")?;
            Ok(PropertyValue::Secret(Box::new(from_json(inner)?)))
        }
        other => Ok(PropertyValue::Plain(other)),
    }
}
