use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;
use crate::history::History;

/// Header and source field of each CSV column, in output order.
pub const CSV_COLUMNS: [(&str, &str); 6] = [
    ("CPF", "cpf"),
    ("Nome", "nome"),
    ("Nascimento", "nascimento"),
    ("Idade", "idade"),
    ("Telefone", "telefone"),
    ("Data Consulta", "dataConsulta"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(CaptureError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
        }
    }
}

pub fn to_json(history: &History) -> crate::Result<String> {
    Ok(serde_json::to_string_pretty(history)?)
}

/// Fixed six-column table with a header row. Empty history yields an empty
/// string rather than a lone header.
pub fn to_csv(history: &History) -> String {
    if history.is_empty() {
        return String::new();
    }

    let header = CSV_COLUMNS
        .iter()
        .map(|(title, _)| quote_cell(title))
        .collect::<Vec<_>>()
        .join(",");

    let rows = history.iter().map(|record| {
        CSV_COLUMNS
            .iter()
            .map(|(_, field)| quote_cell(&display_value(record.get(field))))
            .collect::<Vec<_>>()
            .join(",")
    });

    std::iter::once(header)
        .chain(rows)
        .collect::<Vec<_>>()
        .join("\n")
}

fn quote_cell(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Text form of a field as the producer's page would print it. A missing
/// field is `undefined`, `null` stays `null`, arrays join their elements with
/// commas and objects collapse to `[object Object]`.
pub fn display_value(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                display_float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => display_value(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

fn display_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        let text = if f > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if f == 0.0 {
        "0".to_string()
    } else if f.abs() >= 1e21 || f.abs() < 1e-6 {
        // Shortest digits with a signed exponent: 1e+21, -2.5e-7.
        let text = format!("{:e}", f);
        match text.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => text,
        }
    } else {
        f.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn history_of(values: Vec<Value>) -> History {
        let mut history = History::with_capacity(100);
        for (i, value) in values.into_iter().enumerate() {
            let fields: Map<String, Value> = match value {
                Value::Object(map) => map,
                _ => panic!("expected an object"),
            };
            history.push_front(Record::capture(fields, i as i64, Utc::now()));
        }
        history
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(CaptureError::UnsupportedFormat(_))
        ));
        assert_eq!(ExportFormat::default(), ExportFormat::Json);
    }

    #[test]
    fn test_csv_empty_history() {
        assert_eq!(to_csv(&History::with_capacity(10)), "");
    }

    #[test]
    fn test_csv_quoting_and_missing_fields() {
        let history = history_of(vec![json!({
            "cpf": "123",
            "nome": "Ana \"Aninha\" Silva",
            "idade": 34,
            "telefone": null
        })]);

        let csv = to_csv(&history);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#""CPF","Nome","Nascimento","Idade","Telefone","Data Consulta""#
        );
        assert_eq!(
            lines[1],
            r#""123","Ana ""Aninha"" Silva","undefined","34","null","undefined""#
        );
    }

    #[test]
    fn test_display_values() {
        assert_eq!(display_value(Some(&json!(true))), "true");
        assert_eq!(display_value(Some(&json!(2.5))), "2.5");
        assert_eq!(display_value(Some(&json!(3.0))), "3");
        assert_eq!(display_value(Some(&json!(0.000001))), "0.000001");
        assert_eq!(display_value(Some(&json!(1e20))), "100000000000000000000");
        assert_eq!(display_value(Some(&json!(["a", null, 1]))), "a,,1");
        assert_eq!(display_value(Some(&json!({"a": 1}))), "[object Object]");
    }

    #[test]
    fn test_exponent_forms() {
        assert_eq!(display_value(Some(&json!(1e21))), "1e+21");
        assert_eq!(display_value(Some(&json!(-1.5e22))), "-1.5e+22");
        assert_eq!(display_value(Some(&json!(1e-7))), "1e-7");
        assert_eq!(display_value(Some(&json!(2.5e-7))), "2.5e-7");
    }

    #[test]
    fn test_json_is_pretty_array() {
        let history = history_of(vec![json!({"cpf": "1"})]);
        let json = to_json(&history).unwrap();
        assert!(json.starts_with("[\n  {"));
        let parsed: Vec<Record> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, history.to_vec());
    }
}
