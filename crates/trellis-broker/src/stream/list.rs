// Cached state of one upstream `list` stream.
use serde_json::{Value, json};
use trellis_wire::{Response, StreamStatus};

pub(crate) const DISCONNECTED_TS: &str = "$disconnectedTs";

/// Node listing as last reported upstream: ordered `(name, value)` pairs plus
/// the latest stream status.
#[derive(Debug, Default)]
pub struct ListStream {
    entries: Vec<(String, Value)>,
    status: Option<StreamStatus>,
    // Set while the cache only holds the disconnect marker.
    stale: bool,
}

impl ListStream {
    pub fn status(&self) -> Option<StreamStatus> {
        self.status
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Fold an upstream response into the cache and return the updates to
    /// forward downstream.
    pub fn apply(&mut self, response: &Response) -> Vec<Value> {
        let mut forwarded = Vec::with_capacity(response.updates.len() + 1);
        if self.stale && !response.updates.is_empty() {
            self.stale = false;
            self.entries.clear();
            forwarded.push(json!({"name": DISCONNECTED_TS, "change": "remove"}));
        }
        if response.stream.is_some() {
            self.status = response.stream;
        }
        for update in &response.updates {
            self.apply_update(update);
            forwarded.push(update.clone());
        }
        forwarded
    }

    fn apply_update(&mut self, update: &Value) {
        match update {
            Value::Array(items) => {
                let Some(name) = items.first().and_then(Value::as_str) else {
                    return;
                };
                let value = items.get(1).cloned().unwrap_or(Value::Null);
                self.upsert(name, value);
            }
            Value::Object(fields) => {
                let Some(name) = fields.get("name").and_then(Value::as_str) else {
                    return;
                };
                if fields.get("change").and_then(Value::as_str) == Some("remove") {
                    self.entries.retain(|(existing, _)| existing != name);
                } else if let Some(value) = fields.get("value") {
                    self.upsert(name, value.clone());
                }
            }
            _ => {}
        }
    }

    fn upsert(&mut self, name: &str, value: Value) {
        match self.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Updates a listener joining now needs to catch up, or `None` if
    /// nothing has been received yet.
    pub fn replay(&self) -> Option<(Option<StreamStatus>, Vec<Value>)> {
        if self.status.is_none() && self.entries.is_empty() {
            return None;
        }
        let updates = self
            .entries
            .iter()
            .map(|(name, value)| json!([name, value]))
            .collect();
        Some((self.status, updates))
    }

    /// Forget everything and keep only the disconnect marker. Returns the
    /// update to broadcast.
    pub fn disconnect(&mut self, ts: &str) -> Value {
        self.entries.clear();
        self.entries
            .push((DISCONNECTED_TS.to_string(), Value::String(ts.to_string())));
        self.stale = true;
        json!([DISCONNECTED_TS, ts])
    }
}
