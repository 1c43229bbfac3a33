//! Records and the change messages that carry them.
//!
//! A [`Record`] is an opaque bag of fields with a stable `id`. Change messages
//! arrive from remote subscriptions in batches; control messages (heartbeats,
//! up-to-date markers) travel on the same stream and are never applied.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::Error;

/// A domain entity keyed by a stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), fields: Map::new() }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of a field, if present and textual.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Overlay every field of `patch` onto this record.
    pub fn merge(&mut self, patch: &Record) {
        for (field, value) in &patch.fields {
            self.fields.insert(field.clone(), value.clone());
        }
    }

    /// Build a record from a JSON object carrying an `id` member.
    ///
    /// Numeric ids are accepted and stringified.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(mut fields) = value else {
            return Err(Error::Apply("record must be a JSON object".into()));
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(Error::Apply("record is missing a non-empty id".into())),
        };
        Ok(Self { id, fields })
    }

    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("id".into(), Value::String(self.id.clone()));
        Value::Object(fields)
    }
}

/// Operation tag carried by a change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Non-data messages interleaved with changes on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMessage {
    /// The initial snapshot has been fully delivered.
    UpToDate,
    /// The server asks the client to discard and refetch the shape.
    MustRefetch,
    Heartbeat,
}

/// One message on a subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeMessage {
    Change { operation: Operation, value: Record },
    Control { control: ControlMessage },
}

impl ChangeMessage {
    pub fn insert(value: Record) -> Self {
        ChangeMessage::Change { operation: Operation::Insert, value }
    }

    pub fn update(value: Record) -> Self {
        ChangeMessage::Change { operation: Operation::Update, value }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        ChangeMessage::Change { operation: Operation::Delete, value: Record::new(id) }
    }

    pub fn control(control: ControlMessage) -> Self {
        ChangeMessage::Control { control }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, ChangeMessage::Control { .. })
    }
}

/// A batch of messages delivered together by a subscription.
pub type ChangeBatch = Vec<ChangeMessage>;

/// Number of data-carrying messages in a batch.
pub fn change_count(batch: &[ChangeMessage]) -> usize {
    batch.iter().filter(|msg| !msg.is_control()).count()
}

/// Coerce the listed fields of `record` to JSON numbers.
///
/// Strings that parse as numbers (thousands separators allowed) become numbers;
/// anything else becomes `null`. With `fill_missing`, absent fields are set to
/// `null` too, which is what a full insert wants and a partial update does not.
pub fn coerce_numeric(record: &mut Record, fields: &[String], fill_missing: bool) {
    for field in fields {
        match record.fields.get_mut(field) {
            Some(value) => *value = coerce_value(value),
            None if fill_missing => {
                record.fields.insert(field.clone(), Value::Null);
            }
            None => {}
        }
    }
}

fn coerce_value(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(n.clone()),
        Value::String(s) => parse_number(s).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(int) = cleaned.parse::<i64>() {
        return Some(Value::Number(int.into()));
    }
    cleaned.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_id() {
        assert!(Record::from_value(json!({"name": "x"})).is_err());
        assert!(Record::from_value(json!({"id": "  "})).is_err());
        assert!(Record::from_value(json!([1, 2])).is_err());

        let record = Record::from_value(json!({"id": 42, "name": "acme"})).unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.text("name"), Some("acme"));
        assert!(record.get("id").is_none());
    }

    #[test]
    fn test_change_message_wire_shape() {
        let msg: ChangeMessage =
            serde_json::from_value(json!({"operation": "insert", "value": {"id": "c1", "fine": "10"}})).unwrap();
        assert_eq!(msg, ChangeMessage::insert(Record::new("c1").with("fine", "10")));

        let ctl: ChangeMessage = serde_json::from_value(json!({"control": "up-to-date"})).unwrap();
        assert!(ctl.is_control());
    }

    #[test]
    fn test_change_count_ignores_control() {
        let batch = vec![
            ChangeMessage::insert(Record::new("a")),
            ChangeMessage::control(ControlMessage::Heartbeat),
            ChangeMessage::delete("b"),
        ];
        assert_eq!(change_count(&batch), 2);
    }

    #[test]
    fn test_coerce_numeric() {
        let fields = vec!["fine".to_string(), "costs".to_string(), "compensation".to_string(), "missing".to_string()];
        let mut record = Record::new("c1")
            .with("fine", " 1,250 ")
            .with("costs", "12.5")
            .with("compensation", "n/a")
            .with("name", "42");

        coerce_numeric(&mut record, &fields, true);

        assert_eq!(record.get("fine"), Some(&json!(1250)));
        assert_eq!(record.get("costs"), Some(&json!(12.5)));
        assert_eq!(record.get("compensation"), Some(&Value::Null));
        assert_eq!(record.get("missing"), Some(&Value::Null));
        assert_eq!(record.get("name"), Some(&json!("42")));
    }

    #[test]
    fn test_coerce_numeric_partial_patch() {
        let fields = vec!["fine".to_string(), "costs".to_string()];
        let mut patch = Record::new("c1").with("fine", "300");
        coerce_numeric(&mut patch, &fields, false);
        assert_eq!(patch.get("fine"), Some(&json!(300)));
        assert!(patch.get("costs").is_none());
    }
}
