// Cached state of one upstream subscription.
use serde_json::{Value, json};

#[derive(Debug, Default)]
pub struct SubStream {
    last: Option<Value>,
    qos: Option<u8>,
}

impl SubStream {
    pub fn new(qos: Option<u8>) -> Self {
        Self { last: None, qos }
    }

    pub fn qos(&self) -> Option<u8> {
        self.qos
    }

    pub fn last(&self) -> Option<&Value> {
        self.last.as_ref()
    }

    pub fn apply(&mut self, update: Value) {
        self.last = Some(update);
    }

    /// Synthesized value telling listeners the responder went away.
    pub fn disconnect(&mut self, sid: u64, ts: &str) -> Value {
        let update = json!({
            "sid": sid,
            "value": Value::Null,
            "ts": ts,
            "status": "disconnected",
        });
        self.last = Some(update.clone());
        update
    }
}

/// The sid carried by a value update, in either array or object form.
pub fn update_sid(update: &Value) -> Option<u64> {
    match update {
        Value::Array(items) => items.first().and_then(Value::as_u64),
        Value::Object(fields) => fields.get("sid").and_then(Value::as_u64),
        _ => None,
    }
}

/// Copy of `update` addressed to `sid`.
pub fn with_sid(update: &Value, sid: u64) -> Value {
    let mut update = update.clone();
    match &mut update {
        Value::Array(items) if !items.is_empty() => items[0] = Value::from(sid),
        Value::Object(fields) => {
            fields.insert("sid".to_string(), Value::from(sid));
        }
        _ => {}
    }
    update
}
