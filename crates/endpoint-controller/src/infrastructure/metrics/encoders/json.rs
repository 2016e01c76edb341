use std::collections::BTreeMap;

use serde_json::json;
use serde_json::Value;

use super::FieldValue;
use super::MetricsEncoder;

pub struct JsonEncoder;

impl MetricsEncoder for JsonEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &BTreeMap<&str, &str>,
        fields: &BTreeMap<&str, FieldValue>,
        timestamp: i64,
    ) -> String {
        let fields: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::String(s) => Value::String(s.clone()),
                    FieldValue::Integer(i) => Value::from(*i),
                    FieldValue::UnsignedInteger(u) => Value::from(*u),
                    FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    FieldValue::Boolean(b) => Value::Bool(*b),
                };
                (key.to_string(), value)
            })
            .collect();

        json!({
            "measure": measurement,
            "ts": timestamp,
            "tag": tags,
            "field": fields,
        })
        .to_string()
            + "\n"
    }
}
