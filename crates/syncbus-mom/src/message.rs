//! Message model shared by every participant on the bus.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Delivery guarantee requested from the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Declared type of a message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    String,
    Boolean,
    Number,
    Object,
    Undefined,
    Binary,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::String => "string",
            ContentType::Boolean => "boolean",
            ContentType::Number => "number",
            ContentType::Object => "object",
            ContentType::Undefined => "undefined",
            ContentType::Binary => "binary",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ContentType::String),
            "boolean" => Ok(ContentType::Boolean),
            "number" => Ok(ContentType::Number),
            "object" => Ok(ContentType::Object),
            "undefined" => Ok(ContentType::Undefined),
            "binary" => Ok(ContentType::Binary),
            other => Err(CodecError::UnknownContentType(other.to_string())),
        }
    }
}

/// Message payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    Undefined,
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

impl Body {
    /// Serialize any value into a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Body::Undefined => ContentType::Undefined,
            Body::Text(_) => ContentType::String,
            Body::Binary(_) => ContentType::Binary,
            Body::Json(Value::Bool(_)) => ContentType::Boolean,
            Body::Json(Value::Number(_)) => ContentType::Number,
            Body::Json(_) => ContentType::Object,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Body::Undefined)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Body::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Deserialize a structured body.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Body::Json(value) => Ok(serde_json::from_value(value.clone())?),
            Body::Text(text) => Ok(serde_json::from_str(text)?),
            Body::Undefined => Ok(serde_json::from_value(Value::Null)?),
            Body::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Binary(bytes)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

impl From<bool> for Body {
    fn from(flag: bool) -> Self {
        Body::Json(Value::Bool(flag))
    }
}

impl<T: Into<Body>> From<Option<T>> for Body {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Routing and correlation header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Head {
    pub sender: String,
    pub receiver: Option<String>,
    pub message_id: String,
    pub echo_allowed: Option<bool>,
    /// Message id of the request this message answers.
    pub reference: Option<String>,
    pub reply_to: Option<String>,
    pub compress: Option<bool>,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub revision: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    pub topic: String,
    pub content_type: ContentType,
    pub qos: Qos,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub head: Head,
    pub meta: Meta,
    pub body: Body,
}

impl Message {
    /// Start a message to `topic`.
    pub fn to(topic: impl AsRef<str>, body: impl Into<Body>) -> MessageBuilder {
        MessageBuilder::new(topic, body)
    }

    /// Start a response to `request`, addressed to its sender on its reply topic.
    pub fn reply(request: &Message, body: impl Into<Body>) -> Option<MessageBuilder> {
        let topic = request.head.reply_to.as_ref()?;
        Some(
            MessageBuilder::new(topic, body)
                .receiver(request.head.sender.clone())
                .reference(request.head.message_id.clone()),
        )
    }

    pub fn topic(&self) -> &str {
        &self.meta.topic
    }

    pub fn sender(&self) -> &str {
        &self.head.sender
    }

    pub fn id(&self) -> &str {
        &self.head.message_id
    }
}

/// Builder for outbound messages.
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new(topic: impl AsRef<str>, body: impl Into<Body>) -> Self {
        let body = body.into();
        Self {
            message: Message {
                head: Head::default(),
                meta: Meta {
                    topic: normalize_topic(topic.as_ref()),
                    content_type: body.content_type(),
                    qos: Qos::default(),
                },
                body,
            },
        }
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.message.head.receiver = Some(receiver.into());
        self
    }

    pub fn reply_to(mut self, topic: impl AsRef<str>) -> Self {
        self.message.head.reply_to = Some(normalize_topic(topic.as_ref()));
        self
    }

    pub fn reference(mut self, message_id: impl Into<String>) -> Self {
        self.message.head.reference = Some(message_id.into());
        self
    }

    pub fn echo_allowed(mut self, allowed: bool) -> Self {
        self.message.head.echo_allowed = Some(allowed);
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.message.meta.qos = qos;
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message.head.message_id = id.into();
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

/// Strip leading/trailing separators and collapse empty segments.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join topic segments into a normalized topic.
pub fn join_topic<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = segments
        .into_iter()
        .map(|segment| segment.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("/");
    normalize_topic(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_topic() {
        assert_eq!(normalize_topic("/a/b/"), "a/b");
        assert_eq!(normalize_topic("a//b"), "a/b");
        assert_eq!(join_topic(["/prefix/", "store", "x/update"]), "prefix/store/x/update");
    }

    #[test]
    fn test_content_type_follows_body() {
        assert_eq!(Body::from("hi").content_type(), ContentType::String);
        assert_eq!(Body::from(true).content_type(), ContentType::Boolean);
        assert_eq!(Body::from(json!(4.5)).content_type(), ContentType::Number);
        assert_eq!(Body::from(json!({"a": 1})).content_type(), ContentType::Object);
        assert_eq!(Body::from(vec![1u8, 2]).content_type(), ContentType::Binary);
        assert_eq!(Body::Undefined.content_type(), ContentType::Undefined);
        assert_eq!(Body::from(None::<String>), Body::Undefined);
    }

    #[test]
    fn test_reply_addresses_sender() {
        let mut request = Message::to("req", "ping").reply_to("/resp/a/").build();
        request.head.sender = "alice".into();
        request.head.message_id = "m1".into();

        let response = Message::reply(&request, "pong").unwrap().build();
        assert_eq!(response.topic(), "resp/a");
        assert_eq!(response.head.receiver.as_deref(), Some("alice"));
        assert_eq!(response.head.reference.as_deref(), Some("m1"));
    }

    #[test]
    fn test_reply_without_reply_to() {
        let request = Message::to("req", "ping").build();
        assert!(Message::reply(&request, "pong").is_none());
    }

    #[test]
    fn test_parse_json_body() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Req {
            mutex: String,
        }
        let body = Body::json(&json!({"mutex": "m"})).unwrap();
        assert_eq!(body.parse::<Req>().unwrap(), Req { mutex: "m".into() });
    }
}
