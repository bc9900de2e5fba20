pub mod decode;
pub mod ingress;
pub mod payload;

pub use decode::{DecodedMetric, DecodedPayload, MessageClass, ParsedTopic, decode_payload, parse_topic};
