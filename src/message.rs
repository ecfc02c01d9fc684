use std::borrow::Cow;
use std::fmt;

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use serde::de::DeserializeOwned;

use crate::rabbitmq::Result;

/// Header carrying how many times a message has already been retried.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A message delivered to a consumer.
#[derive(Clone, Debug)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
    pub redelivered: bool,
}

impl Message {
    pub fn new(routing_key: &str, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            exchange: String::new(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            properties: BasicProperties::default(),
            redelivered: false,
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.properties = self.properties.with_headers(headers);
        self
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    /// Retry count from the `x-retry-count` header, 0 when absent or unreadable.
    pub fn retry_count(&self) -> u32 {
        self.headers()
            .and_then(|headers| header_u32(headers, RETRY_COUNT_HEADER))
            .unwrap_or(0)
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// What a handler decided about a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Failed; requeue while retries remain, dead-letter afterwards.
    Retry(String),
    /// Failed for good; dead-letter immediately.
    DeadLetter(String),
}

impl<E: fmt::Display> From<std::result::Result<(), E>> for Outcome {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Ack,
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }
}

/// Reads an integer header, accepting any AMQP integer width or a numeric string.
pub fn header_u32(headers: &FieldTable, name: &str) -> Option<u32> {
    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)?;

    let number: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).trim().parse().ok()?,
        _ => return None,
    };

    u32::try_from(number).ok()
}

/// Copies `headers` (if any) and sets the retry count on the copy.
pub fn with_retry_count(headers: Option<&FieldTable>, count: u32) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(i64::from(count)));
    table
}
