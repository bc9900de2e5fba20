//! Minimal Sparkplug B `Payload`/`Metric` protobuf messages (tck3_eon_spec
//! §6.4.2), hand-derived with `prost` rather than vendored via a codegen
//! step — the wire schema is small and stable enough not to need a build.rs.
//! Decoding is treated as a black box beyond this shape: consumers only see
//! the normalised [`super::decode::DecodedMetric`] produced from it.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Payload {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<Metric>,
    #[prost(uint64, optional, tag = "3")]
    pub seq: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metric {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub alias: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub datatype: Option<u32>,
    #[prost(message, repeated, tag = "5")]
    pub properties: Vec<PropertyEntry>,

    #[prost(oneof = "MetricValue", tags = "10, 11, 12, 13, 14")]
    pub value: Option<MetricValue>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum MetricValue {
    #[prost(int64, tag = "10")]
    IntValue(i64),
    #[prost(double, tag = "11")]
    DoubleValue(f64),
    #[prost(bool, tag = "12")]
    BooleanValue(bool),
    #[prost(string, tag = "13")]
    StringValue(String),
    #[prost(sint64, tag = "14")]
    LongValue(i64),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PropertyEntry {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub string_value: Option<String>,
    #[prost(double, optional, tag = "3")]
    pub double_value: Option<f64>,
}
