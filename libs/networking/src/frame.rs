//! Length-prefixed JSON framing.
//!
//! Wire format:
//! - 4 bytes payload length, big-endian unsigned
//! - payload: compact UTF-8 JSON object
//!
//! Receivers feed arbitrary partial reads into a [`FrameDecoder`]; a frame is
//! extracted only once the whole payload is buffered. Payloads that are not a
//! JSON object are consumed (the stream stays in sync) but never dispatched.
//!
//! An empty object `{}` is a valid frame and is dispatched like any other.
//! It is deliberately not filtered out, unlike older peers that skipped empty
//! objects on receipt.
//!
//! Both directions enforce the same size limit: encoding a payload longer than
//! the limit fails with [`FrameError::TooLarge`] instead of producing a frame
//! the receiver would reject.

use bytes::{Buf, BytesMut};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::FrameError;

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a decoder accepts by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A JSON object payload.
pub type JsonObject = Map<String, Value>;

/// Encode `payload` as a single frame under the default size limit.
pub fn encode_frame(payload: &JsonObject) -> Result<Vec<u8>, FrameError> {
    encode_frame_with_max(payload, DEFAULT_MAX_FRAME_LEN)
}

/// Encode `payload`, failing if the body exceeds `max_frame_len` or `u32::MAX`.
pub fn encode_frame_with_max(
    payload: &JsonObject,
    max_frame_len: usize,
) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(payload)?;
    let max = max_frame_len.min(u32::MAX as usize);
    if body.len() > max {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max,
        });
    }
    let len = body.len() as u32;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Result of extracting one complete frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// A valid JSON object.
    Object(JsonObject),
    /// Complete frame whose payload was not a JSON object.
    Discarded,
}

/// Reassembly buffer for frames arriving over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a decoder that rejects payloads longer than `max_frame_len`.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// A length prefix above the limit is an error: the stream cannot be
    /// resynchronized and the caller should close the connection.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>, FrameError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        let payload = self.buffer.split_to(len);

        match serde_json::from_slice::<Value>(&payload) {
            Ok(Value::Object(obj)) => Ok(Some(DecodedFrame::Object(obj))),
            Ok(_) => {
                trace!(len, "Discarding non-object frame");
                Ok(Some(DecodedFrame::Discarded))
            }
            Err(e) => {
                trace!(len, error = %e, "Discarding malformed frame");
                Ok(Some(DecodedFrame::Discarded))
            }
        }
    }

    /// Extract every complete object, in order, skipping discarded frames.
    pub fn drain_objects(&mut self) -> Result<Vec<JsonObject>, FrameError> {
        let mut objects = Vec::new();
        while let Some(frame) = self.next_frame()? {
            if let DecodedFrame::Object(obj) = frame {
                objects.push(obj);
            }
        }
        Ok(objects)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_encode_is_compact_big_endian() {
        let payload = obj(json!({"type": "reject", "reason": "busy"}));
        let frame = encode_frame(&payload).unwrap();
        let body = &frame[4..];

        assert_eq!(&frame[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(body.len(), r#"{"type":"reject","reason":"busy"}"#.len());
        assert!(!body.contains(&b' '));
        assert_eq!(serde_json::from_slice::<JsonObject>(body).unwrap(), payload);
    }

    #[test]
    fn test_encode_rejects_payload_over_limit() {
        let payload = obj(json!({"blob": "x".repeat(64)}));
        let body_len = serde_json::to_vec(&payload).unwrap().len();

        let err = encode_frame_with_max(&payload, 32).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len, max: 32 } if len == body_len));

        let frame = encode_frame_with_max(&payload, body_len).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + body_len);
    }

    #[test]
    fn test_partial_header_and_payload() {
        let frame = encode_frame(&obj(json!({"cmd": "ping"}))).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..2]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(&frame[2..frame.len() - 1]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(&frame[frame.len() - 1..]);
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(DecodedFrame::Object(obj(json!({"cmd": "ping"}))))
        );
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut bytes = encode_frame(&obj(json!({"n": 1}))).unwrap();
        bytes.extend(encode_frame(&obj(json!({"n": 2}))).unwrap());
        bytes.extend(encode_frame(&obj(json!({"n": 3}))).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let objects = decoder.drain_objects().unwrap();

        assert_eq!(
            objects,
            vec![obj(json!({"n": 1})), obj(json!({"n": 2})), obj(json!({"n": 3}))]
        );
    }

    #[test]
    fn test_malformed_and_non_object_frames_are_consumed() {
        let mut bytes = raw_frame(b"{not json");
        bytes.extend(raw_frame(b"[1,2,3]"));
        bytes.extend(raw_frame(b"\"text\""));
        bytes.extend(encode_frame(&obj(json!({"ok": true}))).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(decoder.next_frame().unwrap(), Some(DecodedFrame::Discarded));
        assert_eq!(decoder.next_frame().unwrap(), Some(DecodedFrame::Discarded));
        assert_eq!(decoder.next_frame().unwrap(), Some(DecodedFrame::Discarded));
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(DecodedFrame::Object(obj(json!({"ok": true}))))
        );
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_empty_object_is_dispatched() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&raw_frame(b"{}"));
        assert_eq!(decoder.drain_objects().unwrap(), vec![JsonObject::new()]);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_len(8);
        decoder.extend(&raw_frame(br#"{"a":"0123456789"}"#));
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { max: 8, .. })
        ));
    }

    fn arb_object() -> impl Strategy<Value = JsonObject> {
        prop::collection::btree_map(
            "[a-z]{1,8}",
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                ".{0,16}".prop_map(Value::from),
            ],
            0..5,
        )
        .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_frames_survive_arbitrary_read_boundaries(
            objects in prop::collection::vec(arb_object(), 1..8),
            chunks in prop::collection::vec(1usize..64, 1..32),
        ) {
            let mut stream = Vec::new();
            for object in &objects {
                stream.extend(encode_frame(object).unwrap());
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            let mut sizes = chunks.iter().cycle();
            while offset < stream.len() {
                let size = (*sizes.next().unwrap()).min(stream.len() - offset);
                decoder.extend(&stream[offset..offset + size]);
                decoded.extend(decoder.drain_objects().unwrap());
                offset += size;
            }

            prop_assert_eq!(decoded, objects);
            prop_assert_eq!(decoder.buffered_len(), 0);
        }
    }
}
