use std::collections::BTreeMap;

use crate::config::MetricsFormat;

pub mod influx;
pub mod json;

/// Sync counters of one controller for one result class.
#[derive(Debug, Clone)]
pub struct SyncMetricsParams<'a> {
    pub controller: &'a str,
    pub result: &'a str,
    pub count: u64,
    pub seconds_total: f64,
    pub timestamp: i64,
}

/// Write counters of one controller for one operation.
#[derive(Debug, Clone)]
pub struct WriteMetricsParams<'a> {
    pub controller: &'a str,
    pub operation: &'a str,
    pub count: u64,
    pub timestamp: i64,
}

/// Desired state size of one Service as last computed by a controller.
#[derive(Debug, Clone)]
pub struct ServiceMetricsParams<'a> {
    pub controller: &'a str,
    pub namespace: &'a str,
    pub service: &'a str,
    pub endpoints: u64,
    pub objects: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

pub trait MetricsEncoder: Send + Sync {
    /// Encodes one point; tags and fields are emitted in key order.
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &BTreeMap<&str, &str>,
        fields: &BTreeMap<&str, FieldValue>,
        timestamp: i64,
    ) -> String;

    fn encode_sync_metrics(&self, params: &SyncMetricsParams) -> String {
        let tags = BTreeMap::from([
            ("controller", params.controller),
            ("result", params.result),
        ]);
        let fields = BTreeMap::from([
            ("count", params.count.into()),
            ("seconds_total", params.seconds_total.into()),
        ]);
        self.encode_metrics("ep_controller_syncs", &tags, &fields, params.timestamp)
    }

    fn encode_write_metrics(&self, params: &WriteMetricsParams) -> String {
        let tags = BTreeMap::from([
            ("controller", params.controller),
            ("operation", params.operation),
        ]);
        let fields = BTreeMap::from([("count", params.count.into())]);
        self.encode_metrics("ep_controller_writes", &tags, &fields, params.timestamp)
    }

    fn encode_service_metrics(&self, params: &ServiceMetricsParams) -> String {
        let tags = BTreeMap::from([
            ("controller", params.controller),
            ("namespace", params.namespace),
            ("service", params.service),
        ]);
        let fields = BTreeMap::from([
            ("desired_endpoints", params.endpoints.into()),
            ("desired_objects", params.objects.into()),
        ]);
        self.encode_metrics("ep_service_desired", &tags, &fields, params.timestamp)
    }
}

pub enum Encoder {
    Json(json::JsonEncoder),
    Influx(influx::InfluxEncoder),
}

impl MetricsEncoder for Encoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &BTreeMap<&str, &str>,
        fields: &BTreeMap<&str, FieldValue>,
        timestamp: i64,
    ) -> String {
        match self {
            Encoder::Json(inner) => inner.encode_metrics(measurement, tags, fields, timestamp),
            Encoder::Influx(inner) => inner.encode_metrics(measurement, tags, fields, timestamp),
        }
    }
}

pub fn create_encoder(format: MetricsFormat) -> Encoder {
    match format {
        MetricsFormat::Json => Encoder::Json(json::JsonEncoder),
        MetricsFormat::Influx => Encoder::Influx(influx::InfluxEncoder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_metrics_carry_controller_and_result() {
        let encoder = create_encoder(MetricsFormat::Influx);
        let line = encoder.encode_sync_metrics(&SyncMetricsParams {
            controller: "endpointslice",
            result: "success",
            count: 12,
            seconds_total: 0.5,
            timestamp: 1234567890,
        });
        assert!(line.starts_with("ep_controller_syncs,controller=endpointslice,result=success "));
        assert!(line.contains("count=12u"));
        assert!(line.contains("seconds_total=0.5"));
    }

    #[test]
    fn service_metrics_as_json() {
        let encoder = create_encoder(MetricsFormat::Json);
        let line = encoder.encode_service_metrics(&ServiceMetricsParams {
            controller: "endpoint",
            namespace: "default",
            service: "svc-a",
            endpoints: 2,
            objects: 1,
            timestamp: 1234567890,
        });
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["measure"], "ep_service_desired");
        assert_eq!(parsed["tag"]["service"], "svc-a");
        assert_eq!(parsed["field"]["desired_endpoints"], 2);
    }
}
