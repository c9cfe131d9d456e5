// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Headers
//!
//! A [`Message`] is an immutable payload plus a header map. The retry count
//! travels in the `x-retry-count` header; it is the only state that follows a
//! message through its redelivery lifecycle.

use lapin::types::{AMQPValue, LongString, ShortString};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Header carrying the number of broker-level retries already performed.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A header value. Strings, integers and booleans are typed; any other AMQP
/// field (floats, decimals, byte arrays, timestamps, tables, arrays) is kept
/// as received so republished copies carry it unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    ShortShortInt(i8),
    ShortInt(i16),
    LongInt(i32),
    LongLongInt(i64),
    ShortShortUint(u8),
    ShortUint(u16),
    LongUint(u32),
    Bool(bool),
    Opaque(AMQPValue),
}

impl HeaderValue {
    /// Decodes the value as a non-negative integer, whatever width the broker
    /// client used. Strings holding a decimal number are accepted as well.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            HeaderValue::ShortShortInt(v) => u32::try_from(*v).ok(),
            HeaderValue::ShortInt(v) => u32::try_from(*v).ok(),
            HeaderValue::LongInt(v) => u32::try_from(*v).ok(),
            HeaderValue::LongLongInt(v) => u32::try_from(*v).ok(),
            HeaderValue::ShortShortUint(v) => Some(u32::from(*v)),
            HeaderValue::ShortUint(v) => Some(u32::from(*v)),
            HeaderValue::LongUint(v) => Some(*v),
            HeaderValue::ShortString(v) | HeaderValue::LongString(v) => v.trim().parse().ok(),
            HeaderValue::Bool(_) | HeaderValue::Opaque(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::ShortString(v) | HeaderValue::LongString(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::LongUint(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::ShortShortInt(v) => AMQPValue::ShortShortInt(v),
            HeaderValue::ShortInt(v) => AMQPValue::ShortInt(v),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(v),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(v),
            HeaderValue::ShortShortUint(v) => AMQPValue::ShortShortUInt(v),
            HeaderValue::ShortUint(v) => AMQPValue::ShortUInt(v),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::Opaque(v) => v,
        }
    }
}

impl From<&AMQPValue> for HeaderValue {
    fn from(value: &AMQPValue) -> Self {
        match value {
            AMQPValue::ShortString(v) => HeaderValue::ShortString(v.as_str().to_owned()),
            AMQPValue::LongString(v) => match std::str::from_utf8(v.as_bytes()) {
                Ok(text) => HeaderValue::LongString(text.to_owned()),
                Err(_) => HeaderValue::Opaque(value.clone()),
            },
            AMQPValue::ShortShortInt(v) => HeaderValue::ShortShortInt(*v),
            AMQPValue::ShortInt(v) => HeaderValue::ShortInt(*v),
            AMQPValue::LongInt(v) => HeaderValue::LongInt(*v),
            AMQPValue::LongLongInt(v) => HeaderValue::LongLongInt(*v),
            AMQPValue::ShortShortUInt(v) => HeaderValue::ShortShortUint(*v),
            AMQPValue::ShortUInt(v) => HeaderValue::ShortUint(*v),
            AMQPValue::LongUInt(v) => HeaderValue::LongUint(*v),
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            other => HeaderValue::Opaque(other.clone()),
        }
    }
}

/// Converts AMQP headers into message headers.
pub fn from_amqp_headers(headers: &BTreeMap<ShortString, AMQPValue>) -> BTreeMap<String, HeaderValue> {
    headers
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), HeaderValue::from(value)))
        .collect()
}

/// Converts message headers into an AMQP field map.
pub fn to_amqp_headers(headers: &BTreeMap<String, HeaderValue>) -> BTreeMap<ShortString, AMQPValue> {
    headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), AMQPValue::from(value.clone())))
        .collect()
}

/// A single message: payload, headers and optional identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, HeaderValue>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Builds a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Message::new(serde_json::to_vec(value)?))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Decodes the JSON payload.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Number of broker-level retries this message has gone through.
    ///
    /// Absent, negative or otherwise malformed headers read as 0.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(HeaderValue::as_u32)
            .unwrap_or_default()
    }

    /// Returns a copy of this message carrying `count` as its retry count.
    pub fn with_retry_count(&self, count: u32) -> Message {
        let mut next = self.clone();
        next.headers
            .insert(RETRY_COUNT_HEADER.to_owned(), HeaderValue::LongLongInt(i64::from(count)));
        next
    }
}
