//! Wire encoding: flat string header properties plus a typed, optionally compressed payload.

use crate::error::CodecError;
use crate::message::{Body, ContentType, Head, Message, Meta, Qos};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SENDER: &str = "sender";
pub const RECEIVER: &str = "receiver";
pub const MESSAGE_ID: &str = "messageId";
pub const ECHO_ALLOWED: &str = "echoAllowed";
pub const REF: &str = "ref";
pub const REPLY_TO: &str = "replyTo";
pub const COMPRESS: &str = "compress";
pub const TIMESTAMP: &str = "timestamp";
pub const REVISION: &str = "revision";

/// Largest body, after decompression, a decoder accepts by default.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// A message as handed to and received from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub qos: Qos,
    pub content_type: String,
    pub properties: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

/// Encode a message. Payloads of at least `compression_threshold` bytes are LZ4 compressed.
pub fn encode(message: &Message, compression_threshold: Option<usize>) -> Result<RawMessage, CodecError> {
    let mut payload = encode_body(&message.body)?;
    let compress = compression_threshold.is_some_and(|threshold| payload.len() >= threshold);
    if compress {
        payload = lz4_flex::compress_prepend_size(&payload);
    }

    let head = &message.head;
    let mut properties = BTreeMap::new();
    properties.insert(SENDER.to_string(), head.sender.clone());
    properties.insert(MESSAGE_ID.to_string(), head.message_id.clone());
    properties.insert(TIMESTAMP.to_string(), head.timestamp.to_string());
    properties.insert(REVISION.to_string(), head.revision.clone());
    if let Some(receiver) = &head.receiver {
        properties.insert(RECEIVER.to_string(), receiver.clone());
    }
    if let Some(echo) = head.echo_allowed {
        properties.insert(ECHO_ALLOWED.to_string(), echo.to_string());
    }
    if let Some(reference) = &head.reference {
        properties.insert(REF.to_string(), reference.clone());
    }
    if let Some(reply_to) = &head.reply_to {
        properties.insert(REPLY_TO.to_string(), reply_to.clone());
    }
    if compress {
        properties.insert(COMPRESS.to_string(), true.to_string());
    }

    Ok(RawMessage {
        topic: message.meta.topic.clone(),
        qos: message.meta.qos,
        content_type: message.meta.content_type.as_str().to_string(),
        properties,
        payload,
    })
}

/// Decode a raw transport message, decompressing when flagged.
///
/// Bodies larger than `max_body_size` bytes are rejected; for compressed
/// bodies the announced size is checked before anything is allocated.
pub fn decode(raw: RawMessage, max_body_size: usize) -> Result<Message, CodecError> {
    let content_type: ContentType = raw.content_type.parse()?;
    let mut props = raw.properties;

    let compress = take_bool(&mut props, COMPRESS)?;
    let payload = if compress == Some(true) {
        let announced = announced_size(&raw.payload)?;
        if announced > max_body_size {
            return Err(CodecError::TooLarge {
                size: announced,
                max: max_body_size,
            });
        }
        lz4_flex::decompress_size_prepended(&raw.payload)
            .map_err(|e| CodecError::Decompression(e.to_string()))?
    } else if raw.payload.len() > max_body_size {
        return Err(CodecError::TooLarge {
            size: raw.payload.len(),
            max: max_body_size,
        });
    } else {
        raw.payload
    };

    let timestamp = match props.remove(TIMESTAMP) {
        Some(value) => value.parse().map_err(|_| CodecError::InvalidHeader {
            key: TIMESTAMP.to_string(),
            value,
        })?,
        None => 0,
    };

    let head = Head {
        sender: props.remove(SENDER).ok_or(CodecError::MissingHeader(SENDER))?,
        message_id: props
            .remove(MESSAGE_ID)
            .ok_or(CodecError::MissingHeader(MESSAGE_ID))?,
        receiver: props.remove(RECEIVER),
        echo_allowed: take_bool(&mut props, ECHO_ALLOWED)?,
        reference: props.remove(REF),
        reply_to: props.remove(REPLY_TO),
        compress,
        timestamp,
        revision: props.remove(REVISION).unwrap_or_default(),
    };

    Ok(Message {
        head,
        meta: Meta {
            topic: raw.topic,
            content_type,
            qos: raw.qos,
        },
        body: decode_body(content_type, payload)?,
    })
}

/// The little-endian `u32` size prefix of an LZ4 frame.
fn announced_size(payload: &[u8]) -> Result<usize, CodecError> {
    let prefix: [u8; 4] = payload
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| CodecError::Decompression("missing size prefix".to_string()))?;
    Ok(u32::from_le_bytes(prefix) as usize)
}

fn take_bool(props: &mut BTreeMap<String, String>, key: &str) -> Result<Option<bool>, CodecError> {
    match props.remove(key) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(CodecError::InvalidHeader {
                key: key.to_string(),
                value,
            }),
        },
    }
}

fn encode_body(body: &Body) -> Result<Vec<u8>, CodecError> {
    Ok(match body {
        Body::Undefined => Vec::new(),
        Body::Text(text) => text.as_bytes().to_vec(),
        Body::Binary(bytes) => bytes.clone(),
        Body::Json(value) => serde_json::to_vec(value)?,
    })
}

fn decode_body(content_type: ContentType, payload: Vec<u8>) -> Result<Body, CodecError> {
    match content_type {
        ContentType::Undefined => Ok(Body::Undefined),
        ContentType::Binary => Ok(Body::Binary(payload)),
        ContentType::String => String::from_utf8(payload)
            .map(Body::Text)
            .map_err(|_| CodecError::InvalidUtf8),
        ContentType::Boolean | ContentType::Number | ContentType::Object => {
            let value: Value = serde_json::from_slice(&payload)?;
            Ok(Body::Json(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stamped(body: impl Into<Body>) -> Message {
        let mut message = Message::to("a/b", body)
            .reply_to("a/reply")
            .echo_allowed(true)
            .build();
        message.head.sender = "alice".into();
        message.head.message_id = "m1".into();
        message.head.timestamp = 1_700_000_000_000;
        message.head.revision = "1".into();
        message
    }

    #[test]
    fn test_headers_are_flat_strings() {
        let raw = encode(&stamped("hello"), None).unwrap();
        assert_eq!(raw.properties[SENDER], "alice");
        assert_eq!(raw.properties[ECHO_ALLOWED], "true");
        assert_eq!(raw.properties[REPLY_TO], "a/reply");
        assert_eq!(raw.properties[TIMESTAMP], "1700000000000");
        assert!(!raw.properties.contains_key(COMPRESS));
        assert!(!raw.properties.contains_key(RECEIVER));
        assert_eq!(raw.content_type, "string");
        assert_eq!(raw.payload, b"hello");
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let text = "x".repeat(4096);
        let raw = encode(&stamped(text.as_str()), Some(1024)).unwrap();
        assert_eq!(raw.properties[COMPRESS], "true");
        assert!(raw.payload.len() < 4096);

        let decoded = decode(raw, DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(decoded.head.compress, Some(true));
        assert_eq!(decoded.body.as_text(), Some(text.as_str()));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let raw = encode(&stamped(vec![7u8; 64]), Some(64)).unwrap();
        assert_eq!(raw.properties.get(COMPRESS).map(String::as_str), Some("true"));
        let raw = encode(&stamped(vec![7u8; 63]), Some(64)).unwrap();
        assert!(raw.properties.get(COMPRESS).is_none());
    }

    #[test]
    fn test_json_bodies_keep_their_type() {
        let decoded = decode(encode(&stamped(json!({"n": [1, 2]})), None).unwrap(), DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(decoded.meta.content_type, ContentType::Object);
        assert_eq!(decoded.body, Body::Json(json!({"n": [1, 2]})));

        let decoded = decode(encode(&stamped(false), None).unwrap(), DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(decoded.meta.content_type, ContentType::Boolean);

        let decoded = decode(encode(&stamped(Body::Undefined), None).unwrap(), DEFAULT_MAX_BODY_SIZE).unwrap();
        assert!(decoded.body.is_undefined());
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut raw = encode(&stamped("x"), None).unwrap();
        raw.properties.insert(ECHO_ALLOWED.into(), "maybe".into());
        assert!(matches!(decode(raw, DEFAULT_MAX_BODY_SIZE), Err(CodecError::InvalidHeader { .. })));

        let mut raw = encode(&stamped("x"), None).unwrap();
        raw.properties.remove(SENDER);
        assert_eq!(decode(raw, DEFAULT_MAX_BODY_SIZE), Err(CodecError::MissingHeader(SENDER)));

        let mut raw = encode(&stamped("x"), None).unwrap();
        raw.content_type = "video".into();
        assert!(matches!(decode(raw, DEFAULT_MAX_BODY_SIZE), Err(CodecError::UnknownContentType(_))));
    }

    #[test]
    fn test_oversized_bodies_are_rejected_before_allocation() {
        let raw = encode(&stamped(vec![7u8; 4096]), Some(1024)).unwrap();
        assert_eq!(decode(raw.clone(), 4096).unwrap().body, Body::Binary(vec![7u8; 4096]));
        assert_eq!(
            decode(raw, 1024),
            Err(CodecError::TooLarge { size: 4096, max: 1024 })
        );

        // a frame announcing 4 GiB behind a few bytes of garbage
        let mut raw = encode(&stamped(vec![1u8; 8]), Some(1)).unwrap();
        raw.payload = vec![0xff, 0xff, 0xff, 0xff, 0x00];
        assert!(matches!(
            decode(raw, DEFAULT_MAX_BODY_SIZE),
            Err(CodecError::TooLarge { max: DEFAULT_MAX_BODY_SIZE, .. })
        ));

        let mut raw = encode(&stamped(vec![1u8; 8]), Some(1)).unwrap();
        raw.payload = vec![0x01];
        assert!(matches!(decode(raw, DEFAULT_MAX_BODY_SIZE), Err(CodecError::Decompression(_))));

        let raw = encode(&stamped(vec![1u8; 32]), None).unwrap();
        assert_eq!(decode(raw, 16), Err(CodecError::TooLarge { size: 32, max: 16 }));
    }
}
