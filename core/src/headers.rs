use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Case-insensitive HTTP header multi-map.
///
/// Keys are stored lowercased in a sorted map so that serialized requests
/// are byte-stable across round-trips, which the queue serializer relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    inner: BTreeMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values for a header.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.inner
            .insert(name.as_ref().to_ascii_lowercase(), vec![value.into()]);
    }

    /// Append a value, keeping any existing ones.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.inner
            .entry(name.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// First value for a header, if present.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.inner
            .get(&name.as_ref().to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values for a header.
    pub fn get_all(&self, name: impl AsRef<str>) -> &[String] {
        self.inner
            .get(&name.as_ref().to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.inner.contains_key(&name.as_ref().to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<Vec<String>> {
        self.inner.remove(&name.as_ref().to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Iterate over (lowercased name, value) pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k.into(), v.into());
        }
        headers
    }
}
