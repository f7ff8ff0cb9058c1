use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ID_FIELD: &str = "id";
pub const RECEIVED_AT_FIELD: &str = "receivedAt";

/// One captured data item.
///
/// The producer's fields are kept as-is and in their original order. `id` and
/// `receivedAt` are added on capture and always serialize last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub id: i64,
    #[serde(default, rename = "receivedAt")]
    pub received_at: String,
}

impl Record {
    /// Build a record from a producer's mapping. Any `id`/`receivedAt` the
    /// producer sent is replaced by the system values.
    pub fn capture(mut fields: Map<String, Value>, id: i64, received_at: DateTime<Utc>) -> Self {
        fields.remove(ID_FIELD);
        fields.remove(RECEIVED_AT_FIELD);
        Self {
            fields,
            id,
            received_at: received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn received_at_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.received_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Summary returned by `CapturePoller::get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_consultas: usize,
    pub with_telefone: usize,
    pub last_consulta: Option<Record>,
}

/// Truthiness the producer's fields were written against: null, false, zero,
/// NaN and the empty string are false, everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_capture_overrides_system_fields() {
        let now = Utc::now();
        let record = Record::capture(
            fields(json!({"id": "spoofed", "cpf": "123", "receivedAt": "yesterday", "nome": "Ana"})),
            42,
            now,
        );

        assert_eq!(record.id, 42);
        assert_eq!(record.get("cpf"), Some(&json!("123")));
        assert!(record.get("id").is_none());
        assert!(record.received_at.ends_with('Z'));
        let parsed = record.received_at_time().unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_serialized_field_order() {
        let record = Record::capture(
            fields(json!({"nome": "Ana", "cpf": "123"})),
            7,
            Utc::now(),
        );
        let json = serde_json::to_string(&record).unwrap();
        let nome = json.find("\"nome\"").unwrap();
        let cpf = json.find("\"cpf\"").unwrap();
        let id = json.find("\"id\"").unwrap();
        let received = json.find("\"receivedAt\"").unwrap();
        assert!(nome < cpf && cpf < id && id < received);

        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let stats = Stats {
            total_consultas: 0,
            with_telefone: 0,
            last_consulta: None,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            value,
            json!({"totalConsultas": 0, "withTelefone": 0, "lastConsulta": null})
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!(12)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }
}
