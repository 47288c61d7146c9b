use std::fmt;

use serde::Serialize;

/// Deterministic cache key: a namespace plus the serialized fetch parameters.
///
/// Identical parameters always produce the identical key. Parameters are
/// serialized with serde_json, so use structs, tuples, sequences or
/// `BTreeMap` (never `HashMap`) for multi-field parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    namespace: String,
    id: String,
    full: String,
}

impl CacheKey {
    pub fn new<P: Serialize + ?Sized>(namespace: &str, params: &P) -> serde_json::Result<Self> {
        let id = serde_json::to_string(params)?;
        Ok(Self::from_id(namespace, id))
    }

    /// Key for a plain logical id, e.g. a sheet name.
    pub fn from_id(namespace: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        let full = format!("{}:{}", namespace, id);
        Self {
            namespace: namespace.to_string(),
            id,
            full,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Logical id within the namespace; also the durable record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Prefix shared by every key in `namespace`.
    pub fn namespace_prefix(namespace: &str) -> String {
        format!("{}:", namespace)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.full
    }
}
