use std::collections::BTreeMap;

use influxdb_line_protocol::LineProtocolBuilder;

use super::FieldValue;
use super::MetricsEncoder;

/// InfluxDB line protocol encoder
pub struct InfluxEncoder;

impl MetricsEncoder for InfluxEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &BTreeMap<&str, &str>,
        fields: &BTreeMap<&str, FieldValue>,
        timestamp: i64,
    ) -> String {
        let mut builder = LineProtocolBuilder::new().measurement(measurement);
        for (key, value) in tags {
            builder = builder.tag(key, value);
        }

        // The first field moves the builder into its after-field state.
        let mut entries = fields.iter();
        let bytes = match entries.next() {
            Some((key, value)) => {
                let mut line = match value {
                    FieldValue::String(s) => builder.field(key, s.as_str()),
                    FieldValue::Integer(i) => builder.field(key, *i),
                    FieldValue::UnsignedInteger(u) => builder.field(key, *u),
                    FieldValue::Float(f) => builder.field(key, *f),
                    FieldValue::Boolean(b) => builder.field(key, *b),
                };
                for (key, value) in entries {
                    line = match value {
                        FieldValue::String(s) => line.field(key, s.as_str()),
                        FieldValue::Integer(i) => line.field(key, *i),
                        FieldValue::UnsignedInteger(u) => line.field(key, *u),
                        FieldValue::Float(f) => line.field(key, *f),
                        FieldValue::Boolean(b) => line.field(key, *b),
                    };
                }
                line.timestamp(timestamp).close_line().build()
            }
            None => builder
                .field("_empty", true)
                .timestamp(timestamp)
                .close_line()
                .build(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
