//! Buffered chunks and their MessagePack entry stream
//!
//! A chunk payload is a concatenation of MessagePack values. Each value is one
//! entry, either `[tag, time, record]` or the compact `[time, record]` form
//! that inherits the chunk's tag. Time is an integer or float number of
//! seconds, or the extension type 0 event time (32-bit seconds and 32-bit
//! nanoseconds, big endian).

use std::fmt;

use chrono::{DateTime, Utc};
use rmpv::Value;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

/// MessagePack extension type used for event times
const EVENT_TIME_EXT: i8 = 0;

/// Bytes of an undecodable remainder included in the log line
const MALFORMED_PREVIEW_BYTES: usize = 64;

/// A tagged batch of buffered records
#[derive(Debug, Clone)]
pub struct Chunk {
    tag: String,
    unique_id: Uuid,
    payload: Vec<u8>,
}

impl Chunk {
    pub fn new(tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::with_id(tag, Uuid::new_v4(), payload)
    }

    pub fn with_id(tag: impl Into<String>, unique_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            unique_id,
            payload,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode entries lazily, in order
    pub fn entries(&self) -> ChunkEntries<'_> {
        ChunkEntries {
            tag: &self.tag,
            remaining: &self.payload,
            index: 0,
            done: false,
        }
    }
}

/// Event timestamp with nanosecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventTime {
    pub secs: i64,
    pub nanos: u32,
}

impl EventTime {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos())
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs, self.nanos)
    }

    fn from_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9) as u32;
        Some(Self::new(whole as i64, nanos.min(999_999_999)))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => i.as_i64().map(|secs| Self::new(secs, 0)),
            Value::F32(f) => Self::from_f64(f64::from(*f)),
            Value::F64(f) => Self::from_f64(*f),
            Value::Ext(EVENT_TIME_EXT, data) if data.len() == 8 => {
                let secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                let nanos = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                Some(Self::new(i64::from(secs), nanos))
            }
            _ => None,
        }
    }

    /// Wire form of the time
    ///
    /// The extension type only holds unsigned 32-bit seconds. Times outside
    /// that range are written as plain seconds, exact when there are no
    /// nanoseconds.
    fn to_value(self) -> Value {
        match u32::try_from(self.secs) {
            Ok(secs) => {
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&secs.to_be_bytes());
                data.extend_from_slice(&self.nanos.to_be_bytes());
                Value::Ext(EVENT_TIME_EXT, data)
            }
            Err(_) if self.nanos == 0 => Value::from(self.secs),
            Err(_) => Value::F64(self.secs as f64 + f64::from(self.nanos) / 1e9),
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}.{:09}", self.secs, self.nanos),
        }
    }
}

/// One decoded entry
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    pub tag: String,
    pub time: EventTime,
    pub record: Map<String, JsonValue>,
}

/// An entry that could not be decoded into `(tag, time, record)`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed entry #{index}: {reason}")]
pub struct MalformedRecord {
    /// Position in the chunk, 0-based
    pub index: usize,
    pub reason: String,
    /// The entry as received
    pub content: String,
}

/// Streaming entry decoder, see [`Chunk::entries`]
pub struct ChunkEntries<'a> {
    tag: &'a str,
    remaining: &'a [u8],
    index: usize,
    done: bool,
}

impl ChunkEntries<'_> {
    fn malformed(&self, reason: impl Into<String>, content: String) -> MalformedRecord {
        MalformedRecord {
            index: self.index,
            reason: reason.into(),
            content,
        }
    }

    fn decode_entry(&self, value: Value) -> Result<ChunkEntry, MalformedRecord> {
        let content = value.to_string();
        let items = match value {
            Value::Array(items) => items,
            _ => return Err(self.malformed("entry is not an array", content)),
        };

        let (tag, time, record) = match items.as_slice() {
            [tag, time, record] => match tag.as_str() {
                Some(tag) => (tag.to_string(), time, record),
                None => return Err(self.malformed("tag is not a string", content)),
            },
            [time, record] => (self.tag.to_string(), time, record),
            _ => {
                return Err(self.malformed(
                    format!("expected 2 or 3 elements, got {}", items.len()),
                    content,
                ));
            }
        };

        let time = match EventTime::from_value(time) {
            Some(time) => time,
            None => return Err(self.malformed("invalid event time", content)),
        };

        let record = match msgpack_to_json(record) {
            JsonValue::Object(map) => map,
            _ => return Err(self.malformed("record is not a map", content)),
        };

        Ok(ChunkEntry { tag, time, record })
    }
}

impl Iterator for ChunkEntries<'_> {
    type Item = Result<ChunkEntry, MalformedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining.is_empty() {
            return None;
        }

        let before = self.remaining;
        let item = match rmpv::decode::read_value(&mut self.remaining) {
            Ok(value) => self.decode_entry(value),
            Err(e) => {
                // The stream cannot be resynchronized past a broken value
                self.done = true;
                let preview = &before[..before.len().min(MALFORMED_PREVIEW_BYTES)];
                Err(self.malformed(
                    format!("undecodable data ({} bytes left): {}", before.len(), e),
                    hex(preview),
                ))
            }
        };

        self.index += 1;
        Some(item)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Convert a decoded MessagePack value into JSON
pub fn msgpack_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Nil => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                JsonValue::from(n)
            } else if let Some(n) = i.as_u64() {
                JsonValue::from(n)
            } else {
                JsonValue::Null
            }
        }
        Value::F32(f) => float_to_json(f64::from(*f)),
        Value::F64(f) => float_to_json(*f),
        Value::String(s) => JsonValue::String(
            s.as_str()
                .map(str::to_string)
                .unwrap_or_else(|| String::from_utf8_lossy(s.as_bytes()).into_owned()),
        ),
        Value::Binary(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
        Value::Array(items) => JsonValue::Array(items.iter().map(msgpack_to_json).collect()),
        Value::Map(pairs) => {
            let mut map = Map::with_capacity(pairs.len());
            for (key, value) in pairs {
                let key = match key {
                    Value::String(s) => s
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| String::from_utf8_lossy(s.as_bytes()).into_owned()),
                    other => other.to_string(),
                };
                map.insert(key, msgpack_to_json(value));
            }
            JsonValue::Object(map)
        }
        Value::Ext(..) => match EventTime::from_value(value) {
            Some(time) => float_to_json(time.secs as f64 + f64::from(time.nanos) / 1e9),
            None => JsonValue::Null,
        },
    }
}

fn float_to_json(f: f64) -> JsonValue {
    Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number)
}

/// Convert a JSON value into MessagePack
pub fn json_to_msgpack(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::from(s.as_str()),
        JsonValue::Array(items) => Value::Array(items.iter().map(json_to_msgpack).collect()),
        JsonValue::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::from(k.as_str()), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

/// Encodes entries into a chunk payload
#[derive(Debug)]
pub struct ChunkBuilder {
    tag: String,
    payload: Vec<u8>,
    count: usize,
}

impl ChunkBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            payload: Vec::new(),
            count: 0,
        }
    }

    /// Append a `[tag, time, record]` entry
    pub fn push(&mut self, time: EventTime, record: &Map<String, JsonValue>) -> std::io::Result<()> {
        let entry = Value::Array(vec![
            Value::from(self.tag.as_str()),
            time.to_value(),
            json_to_msgpack(&JsonValue::Object(record.clone())),
        ]);
        self.push_value(&entry)
    }

    /// Append an arbitrary value as one entry
    pub fn push_value(&mut self, value: &Value) -> std::io::Result<()> {
        rmpv::encode::write_value(&mut self.payload, value)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.count += 1;
        Ok(())
    }

    /// Number of entries pushed so far
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn build(self) -> Chunk {
        Chunk::new(self.tag, self.payload)
    }
}
