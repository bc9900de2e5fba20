//! Topic parsing and payload decoding into the normalised shape the rest
//! of the ingress pipeline consumes (C5 steps 1-3).

use prost::Message;
use serde_json::{Map, Value};

use crate::error::MantleError;
use crate::sparkplug::payload::{MetricValue as WireValue, Payload};
use crate::validators::normalize_timestamp_ms;
use crate::value::{MetricValue, promote_bigint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    NBirth,
    DBirth,
    NData,
    DData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub group: String,
    pub class: MessageClass,
    pub node: String,
    pub device: String,
}

/// Parses `spBv1.0/{group}/{N|D}{BIRTH|DATA}/{node}/{device?}`.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 4 || parts[0] != "spBv1.0" {
        return None;
    }
    let group = parts[1].to_string();
    let class = match parts[2] {
        "NBIRTH" => MessageClass::NBirth,
        "DBIRTH" => MessageClass::DBirth,
        "NDATA" => MessageClass::NData,
        "DDATA" => MessageClass::DData,
        _ => return None,
    };
    let node = parts[3].to_string();
    let device = match class {
        MessageClass::DBirth | MessageClass::DData => parts.get(4)?.to_string(),
        _ => String::new(),
    };
    Some(ParsedTopic { group, class, node, device })
}

#[derive(Debug, Clone)]
pub struct DecodedMetric {
    pub name: String,
    pub type_name: String,
    pub value: MetricValue,
    pub timestamp_ms: Option<i64>,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct DecodedPayload {
    pub timestamp_ms: Option<i64>,
    pub seq: Option<u64>,
    pub metrics: Vec<DecodedMetric>,
}

/// Sparkplug B datatype codes relevant to persistence routing (tck3_eon_spec
/// §6.4.16). Anything unrecognised decodes as a string.
fn type_name_for_code(code: u32) -> &'static str {
    match code {
        1..=4 => "Int32",
        5..=8 => "UInt64",
        9 => "Float",
        10 => "Double",
        11 => "Boolean",
        12 => "String",
        19 => "Template",
        _ => "String",
    }
}

pub fn decode_payload(bytes: &[u8]) -> Result<DecodedPayload, MantleError> {
    let wire = Payload::decode(bytes).map_err(|e| MantleError::Decode(e.to_string()))?;

    let metrics = wire
        .metrics
        .into_iter()
        .filter_map(|m| {
            let name = m.name?;
            let type_name = type_name_for_code(m.datatype.unwrap_or(12)).to_string();
            let value = match m.value {
                Some(WireValue::IntValue(v)) => MetricValue::Int(v),
                Some(WireValue::LongValue(v)) => MetricValue::Int(promote_bigint(v as i128)),
                Some(WireValue::DoubleValue(v)) => MetricValue::Float(v),
                Some(WireValue::BooleanValue(v)) => MetricValue::Bool(v),
                Some(WireValue::StringValue(v)) => MetricValue::String(v),
                None => MetricValue::Null,
            };
            let mut properties = Map::new();
            for p in m.properties {
                let Some(key) = p.key else { continue };
                if let Some(s) = p.string_value {
                    properties.insert(key, Value::String(s));
                } else if let Some(d) = p.double_value {
                    properties.insert(key, serde_json::json!(d));
                }
            }
            Some(DecodedMetric {
                name,
                type_name,
                value,
                timestamp_ms: m.timestamp.map(|t| normalize_timestamp_ms(t as i64)),
                properties,
            })
        })
        .collect();

    Ok(DecodedPayload {
        timestamp_ms: wire.timestamp.map(|t| normalize_timestamp_ms(t as i64)),
        seq: wire.seq,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_data_topic() {
        let t = parse_topic("spBv1.0/G1/NDATA/N1").unwrap();
        assert_eq!(t.group, "G1");
        assert_eq!(t.class, MessageClass::NData);
        assert_eq!(t.node, "N1");
        assert_eq!(t.device, "");
    }

    #[test]
    fn parses_device_birth_topic_with_device_segment() {
        let t = parse_topic("spBv1.0/G1/DBIRTH/N1/D1").unwrap();
        assert_eq!(t.class, MessageClass::DBirth);
        assert_eq!(t.device, "D1");
    }

    #[test]
    fn rejects_non_sparkplug_prefix() {
        assert!(parse_topic("other/G1/NDATA/N1").is_none());
    }

    #[test]
    fn rejects_unknown_message_class() {
        assert!(parse_topic("spBv1.0/G1/STATE/N1").is_none());
    }

    #[test]
    fn device_birth_without_device_segment_is_rejected() {
        assert!(parse_topic("spBv1.0/G1/DBIRTH/N1").is_none());
    }

    #[test]
    fn round_trips_a_simple_float_metric() {
        use crate::sparkplug::payload::Metric;
        let payload = Payload {
            timestamp: Some(1_700_000_000_000),
            seq: Some(1),
            metrics: vec![Metric {
                name: Some("Temp".into()),
                alias: None,
                timestamp: Some(1_700_000_000_000),
                datatype: Some(10),
                properties: vec![],
                value: Some(WireValue::DoubleValue(72.5)),
            }],
        };
        let bytes = payload.encode_to_vec();
        let decoded = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.metrics.len(), 1);
        assert_eq!(decoded.metrics[0].name, "Temp");
        assert_eq!(decoded.metrics[0].type_name, "Double");
        assert_eq!(decoded.metrics[0].value, MetricValue::Float(72.5));
    }

    #[test]
    fn malformed_bytes_decode_to_an_error_not_a_panic() {
        let garbage = vec![0xFF, 0x01, 0x02];
        assert!(decode_payload(&garbage).is_err());
    }
}
