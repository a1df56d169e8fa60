#![forbid(unsafe_code)]

use serde_json::{Map as JsonMap, Value as JsonValue};

/// Concrete hyperparameter values for one run, in search-space order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunArgs(Vec<(String, JsonValue)>);

impl RunArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: JsonValue) {
        let name = name.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json_map(&self) -> JsonMap<String, JsonValue> {
        self.0.iter().cloned().collect()
    }

    /// Stable text key, used to compare argument sets.
    pub fn fingerprint(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<(String, JsonValue)> for RunArgs {
    fn from_iter<T: IntoIterator<Item = (String, JsonValue)>>(iter: T) -> Self {
        let mut out = RunArgs::new();
        for (k, v) in iter {
            out.push(k, v);
        }
        out
    }
}
