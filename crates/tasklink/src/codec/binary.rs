//! Compact binary codec.
//!
//! Encodes any serde data model with bincode. Both ends must agree on the
//! schema: a response type that does not match the bytes fails to decode.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use super::{CodecError, TaskCodec, trace_decoding, trace_encoded};

pub struct BinaryCodec<Req, Resp> {
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> BinaryCodec<Req, Resp> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<Req, Resp> Default for BinaryCodec<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for BinaryCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<Req, Resp> fmt::Debug for BinaryCodec<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BinaryCodec")
    }
}

impl<Req, Resp> TaskCodec for BinaryCodec<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn encode(&self, request: &Req) -> Result<Bytes, CodecError> {
        let buf = bincode::serialize(request).map_err(|e| CodecError::Encode(e.to_string()))?;
        trace_encoded("binary", buf.len());
        Ok(Bytes::from(buf))
    }

    fn decode(&self, buf: &[u8]) -> Result<Resp, CodecError> {
        trace_decoding("binary", buf.len());
        bincode::deserialize(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SendMessageRequest {
        access_token: String,
        from: String,
        to: String,
        text: String,
        topic: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SendMessageResponse {
        err_code: i32,
        err_msg: String,
        from: String,
        topic: String,
    }

    #[test]
    fn decodes_reference_message() {
        let codec = BinaryCodec::<SendMessageResponse, SendMessageResponse>::new();
        let reference = SendMessageResponse {
            err_code: 0,
            err_msg: "ok".to_string(),
            from: "alice".to_string(),
            topic: "general".to_string(),
        };

        let bytes = codec.encode(&reference).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(
            decoded,
            SendMessageResponse {
                err_code: 0,
                err_msg: "ok".to_string(),
                from: "alice".to_string(),
                topic: "general".to_string(),
            }
        );
    }

    #[test]
    fn encoding_is_compact() {
        let codec = BinaryCodec::<SendMessageRequest, SendMessageResponse>::new();
        let request = SendMessageRequest {
            access_token: "t".to_string(),
            from: "a".to_string(),
            to: "all".to_string(),
            text: "hi".to_string(),
            topic: "x".to_string(),
        };

        let bytes = codec.encode(&request).unwrap();

        // five u64 length prefixes plus the string contents
        assert_eq!(bytes.len(), 5 * 8 + 1 + 1 + 3 + 2 + 1);
    }

    #[test]
    fn truncated_bytes_are_a_decode_error() {
        let codec = BinaryCodec::<SendMessageRequest, SendMessageResponse>::new();
        let err = codec.decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn schema_mismatch_is_a_decode_error() {
        let codec = BinaryCodec::<u8, SendMessageResponse>::new();
        let bytes = codec.encode(&7u8).unwrap();
        assert!(matches!(codec.decode(&bytes), Err(CodecError::Decode(_))));
    }
}
