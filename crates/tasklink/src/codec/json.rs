//! Plain-text JSON codec.
//!
//! Requests and responses default to `serde_json::Value` key/value trees;
//! any serde type works as long as both ends share the shape.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use super::{CodecError, TaskCodec, trace_decoding, trace_encoded};

pub struct JsonCodec<Req = serde_json::Value, Resp = serde_json::Value> {
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> JsonCodec<Req, Resp> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<Req, Resp> Default for JsonCodec<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for JsonCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<Req, Resp> fmt::Debug for JsonCodec<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<Req, Resp> TaskCodec for JsonCodec<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn encode(&self, request: &Req) -> Result<Bytes, CodecError> {
        let buf = serde_json::to_vec(request).map_err(|e| CodecError::Encode(e.to_string()))?;
        trace_encoded("json", buf.len());
        Ok(Bytes::from(buf))
    }

    fn decode(&self, buf: &[u8]) -> Result<Resp, CodecError> {
        trace_decoding("json", buf.len());
        let text = std::str::from_utf8(buf)
            .map_err(|e| CodecError::Decode(format!("response is not UTF-8: {e}")))?;
        serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_value_tree_as_utf8_text() {
        let codec = JsonCodec::<serde_json::Value, serde_json::Value>::new();
        let bytes = codec
            .encode(&json!({"topic": "général", "text": "hi"}))
            .unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        insta::assert_snapshot!(text, @r#"{"text":"hi","topic":"général"}"#);
    }

    #[test]
    fn decodes_into_reference_value() {
        let codec = JsonCodec::<serde_json::Value, serde_json::Value>::new();
        let decoded = codec.decode(br#"{"ok":true}"#).unwrap();
        assert_eq!(decoded, json!({"ok": true}));
    }

    #[test]
    fn round_trips_reference_tree() {
        let codec = JsonCodec::<serde_json::Value, serde_json::Value>::new();
        let request = json!({
            "text": "hi",
            "tags": ["a", "b"],
            "count": 3,
            "meta": {"ok": true, "note": null}
        });

        let mut meta = serde_json::Map::new();
        meta.insert("ok".into(), serde_json::Value::Bool(true));
        meta.insert("note".into(), serde_json::Value::Null);
        let mut reference = serde_json::Map::new();
        reference.insert("text".into(), serde_json::Value::String("hi".into()));
        reference.insert(
            "tags".into(),
            serde_json::Value::Array(vec!["a".into(), "b".into()]),
        );
        reference.insert("count".into(), serde_json::Value::from(3));
        reference.insert("meta".into(), serde_json::Value::Object(meta));

        let bytes = codec.encode(&request).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, serde_json::Value::Object(reference));
    }

    #[test]
    fn decodes_typed_maps() {
        let codec = JsonCodec::<serde_json::Value, BTreeMap<String, u32>>::new();
        let decoded = codec.decode(br#"{"a":1,"b":2}"#).unwrap();
        assert_eq!(decoded.get("b"), Some(&2));
    }

    #[test]
    fn malformed_text_is_a_decode_error() {
        let codec = JsonCodec::<serde_json::Value, serde_json::Value>::new();
        assert!(matches!(
            codec.decode(br#"{"ok":"#),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let codec = JsonCodec::<serde_json::Value, serde_json::Value>::new();
        let err = codec.decode(&[0xff, 0xfe]).unwrap_err();
        match err {
            CodecError::Decode(msg) => assert!(msg.starts_with("response is not UTF-8")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unserializable_request_is_an_encode_error() {
        // JSON object keys must be strings
        let codec = JsonCodec::<BTreeMap<Vec<u8>, u8>, serde_json::Value>::new();
        let mut req = BTreeMap::new();
        req.insert(vec![1u8], 1u8);
        assert!(matches!(codec.encode(&req), Err(CodecError::Encode(_))));
    }
}
