use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Prefix and suffix marking a reserved routing-hint key, e.g. `__table__`.
const HINT_MARKER: &str = "__";

/// An item produced by a parser.
///
/// Items are opaque to the engine: a flat map of fields. Keys wrapped in
/// double underscores (`__table__`, `__db__`, ...) are routing hints for
/// pipelines; they are exposed through [`Item::routing_hints`] and must be
/// stripped by pipelines before persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Pipeline routing hints parsed from an item's reserved keys, with the
/// `__` markers removed: `__table__` becomes `table`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingHints {
    hints: BTreeMap<String, serde_json::Value>,
}

impl RoutingHints {
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.hints.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.hints.get(name).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn is_hint_key(key: &str) -> bool {
        key.len() > 2 * HINT_MARKER.len()
            && key.starts_with(HINT_MARKER)
            && key.ends_with(HINT_MARKER)
    }

    /// Routing hints carried by this item's reserved keys.
    pub fn routing_hints(&self) -> RoutingHints {
        let hints = self
            .fields
            .iter()
            .filter(|(k, _)| Self::is_hint_key(k))
            .map(|(k, v)| {
                let name = k[HINT_MARKER.len()..k.len() - HINT_MARKER.len()].to_string();
                (name, v.clone())
            })
            .collect();
        RoutingHints { hints }
    }

    /// Remove all routing-hint keys; pipelines call this before persisting.
    pub fn strip_hints(&mut self) {
        self.fields.retain(|k, _| !Self::is_hint_key(k));
    }
}
