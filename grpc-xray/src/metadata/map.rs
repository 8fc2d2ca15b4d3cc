use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::InvalidMetadata;

/// The key-value metadata bag of a call.
///
/// Backed by a [`HeaderMap`], so keys are ASCII case-insensitive, values keep their insertion
/// order and a key may carry several values.
#[derive(Clone, Debug, Default)]
pub struct MetadataMap {
    headers: HeaderMap,
}

impl MetadataMap {
    /// Create an empty `MetadataMap`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of values stored in the map.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns true if the map contains at least one value for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Returns the first value associated with `key`.
    ///
    /// Values that are not visible ASCII are treated as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Returns all the values associated with `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .get_all(key)
            .into_iter()
            .filter_map(|v| v.to_str().ok())
    }

    /// Sets `key` to `value`, replacing any previous values.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), InvalidMetadata> {
        let (name, value) = parse_entry(key, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Adds `value` to the values of `key`.
    pub fn append(&mut self, key: &str, value: &str) -> Result<(), InvalidMetadata> {
        let (name, value) = parse_entry(key, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Iterates over all `(key, value)` pairs. Keys are returned in their normalized lowercase
    /// form.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
    }
}

fn parse_entry(key: &str, value: &str) -> Result<(HeaderName, HeaderValue), InvalidMetadata> {
    let name =
        HeaderName::from_bytes(key.as_bytes()).map_err(|_| InvalidMetadata::Key(key.to_owned()))?;
    let value = HeaderValue::from_str(value).map_err(|_| InvalidMetadata::Value(key.to_owned()))?;
    Ok((name, value))
}
