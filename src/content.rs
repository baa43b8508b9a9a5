// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Content Codec
//!
//! This module converts application payloads to and from wire bytes plus a
//! content-type tag. Structured values travel as JSON, strings as UTF-8 text,
//! and pre-encoded binary passes through untouched. Decoding an unrecognized
//! tag falls back to raw bytes so newer producers never break older consumers.

use crate::errors::AmqpError;
use serde::Serialize;
use serde_json::Value;

/// Content type tag for JSON-encoded payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type tag for plain UTF-8 string payloads
pub const TEXT_CONTENT_TYPE: &str = "string";
/// Content type tag for pre-encoded binary payloads
pub const BINARY_CONTENT_TYPE: &str = "buffer";

/// An application payload in one of the supported shapes.
///
/// The codec guarantees `decode(encode(p)) == p` for every variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A structured value, serialized as JSON on the wire
    Json(Value),
    /// A plain string, sent as its UTF-8 bytes
    Text(String),
    /// Pre-encoded bytes, passed through untouched
    Binary(Vec<u8>),
}

impl Payload {
    /// Builds a JSON payload from any serializable value.
    ///
    /// This is the entry point for callers holding domain types. Serializer
    /// failure is a caller error raised before any network effect.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Payload, AmqpError> {
        match serde_json::to_value(value) {
            Ok(v) => Ok(Payload::Json(v)),
            Err(_) => Err(AmqpError::UnsupportedContentType),
        }
    }

    /// Encodes the payload into wire bytes and its content-type tag.
    pub fn encode(&self) -> Result<(Vec<u8>, &'static str), AmqpError> {
        match self {
            Payload::Json(value) => match serde_json::to_vec(value) {
                Ok(data) => Ok((data, JSON_CONTENT_TYPE)),
                Err(_) => Err(AmqpError::UnsupportedContentType),
            },
            Payload::Text(text) => Ok((text.clone().into_bytes(), TEXT_CONTENT_TYPE)),
            Payload::Binary(data) => Ok((data.clone(), BINARY_CONTENT_TYPE)),
        }
    }

    /// Decodes wire bytes using the content-type tag.
    ///
    /// An absent or unrecognized tag, or a JSON body that fails to parse,
    /// yields the raw bytes as `Payload::Binary`.
    pub fn decode(data: &[u8], content_type: Option<&str>) -> Payload {
        match content_type {
            Some(JSON_CONTENT_TYPE) => match serde_json::from_slice::<Value>(data) {
                Ok(value) => Payload::Json(value),
                Err(_) => Payload::Binary(data.to_vec()),
            },
            Some(TEXT_CONTENT_TYPE) => match std::str::from_utf8(data) {
                Ok(text) => Payload::Text(text.to_owned()),
                Err(_) => Payload::Binary(data.to_vec()),
            },
            _ => Payload::Binary(data.to_vec()),
        }
    }

    /// Returns the structured value when the payload is JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Projects the payload into a JSON value for schema validation.
    ///
    /// Text and binary payloads validate as JSON strings so destinations with
    /// a string schema still work.
    pub(crate) fn to_validation_value(&self) -> Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Binary(data) => Value::String(String::from_utf8_lossy(data).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let payload = Payload::Json(json!({"time": 1234, "tags": ["a", "b"]}));
        let (data, tag) = payload.encode().unwrap();

        assert_eq!(tag, JSON_CONTENT_TYPE);
        assert_eq!(Payload::decode(&data, Some(tag)), payload);
    }

    #[test]
    fn text_round_trip() {
        let payload = Payload::Text("hello broker".to_owned());
        let (data, tag) = payload.encode().unwrap();

        assert_eq!(tag, TEXT_CONTENT_TYPE);
        assert_eq!(Payload::decode(&data, Some(tag)), payload);
    }

    #[test]
    fn text_is_not_reinterpreted_as_json() {
        let payload = Payload::Text("{\"looks\":\"like json\"}".to_owned());
        let (data, tag) = payload.encode().unwrap();

        assert_eq!(Payload::decode(&data, Some(tag)), payload);
    }

    #[test]
    fn binary_round_trip() {
        let payload = Payload::Binary(vec![0xde, 0xad, 0xbe, 0xef]);
        let (data, tag) = payload.encode().unwrap();

        assert_eq!(tag, BINARY_CONTENT_TYPE);
        assert_eq!(Payload::decode(&data, Some(tag)), payload);
    }

    #[test]
    fn unknown_tag_falls_back_to_binary() {
        let decoded = Payload::decode(b"anything", Some("application/x-unknown"));
        assert_eq!(decoded, Payload::Binary(b"anything".to_vec()));

        let decoded = Payload::decode(b"anything", None);
        assert_eq!(decoded, Payload::Binary(b"anything".to_vec()));
    }

    #[test]
    fn malformed_json_falls_back_to_binary() {
        let decoded = Payload::decode(b"{not json", Some(JSON_CONTENT_TYPE));
        assert_eq!(decoded, Payload::Binary(b"{not json".to_vec()));
    }

    #[test]
    fn from_serialize_builds_json() {
        #[derive(serde::Serialize)]
        struct Ping {
            time: u64,
        }

        let payload = Payload::from_serialize(&Ping { time: 42 }).unwrap();
        assert_eq!(payload, Payload::Json(json!({"time": 42})));
    }
}
