//! Wire codec and client socket for the booth control message protocol.
//!
//! Messages are address-prefixed, typed-argument packets ("`/avantis/ch/1/mix/fader`
//! with one float arg") sent over UDP. This crate owns the wire format
//! ([`wire`]), the in-memory [`Message`]/[`Value`] types, and [`socket::MessageSocket`],
//! which multiplexes a single UDP socket across every reply destination that has
//! ever sent the hub a datagram.

pub mod socket;
pub mod wire;

pub use socket::MessageSocket;

use serde::{Deserialize, Serialize};

/// A single typed argument carried by a [`Message`].
///
/// The wire format distinguishes `i` (32-bit int), `f` (32-bit float) and `s`
/// (string) as named in the spec, plus a boolean and raw bytes for drivers
/// that need them. Raw numeric/string values from the wire are always
/// wrapped in one of these variants; callers that want to accept either a
/// tagged value or a bare primitive should match loosely with the `as_*`
/// helpers rather than the variant itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i32),
    Float(f32),
    String(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl Value {
    /// Infer `i` for integral numbers and `f` otherwise, per the macro engine's
    /// OSC-sender type inference rule.
    pub fn infer_numeric(n: f64) -> Self {
        if n.fract() == 0.0 && n.abs() < i32::MAX as f64 {
            Value::Int(n as i32)
        } else {
            Value::Float(n as f32)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
            Value::Blob(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i as i64),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            Value::String(s) => s.parse().ok(),
            Value::Blob(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty() && s != "0",
            Value::Blob(b) => !b.is_empty(),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// An address-plus-arguments control packet at the system boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub address: String,
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(address: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// True if `address` equals `prefix` case-insensitively, or is a proper
    /// segment-aligned child of it (`/test/...` but never `/testing`).
    pub fn address_under(address: &str, prefix: &str) -> bool {
        if address.eq_ignore_ascii_case(prefix) {
            return true;
        }
        if address.len() <= prefix.len() {
            return false;
        }
        address[..prefix.len()].eq_ignore_ascii_case(prefix)
            && address.as_bytes()[prefix.len()] == b'/'
    }

    /// The remainder of `address` after stripping `prefix`, lowercased.
    /// Returns `None` if `address` is not under `prefix`.
    pub fn strip_prefix_lower(address: &str, prefix: &str) -> Option<String> {
        if !Self::address_under(address, prefix) {
            return None;
        }
        if address.eq_ignore_ascii_case(prefix) {
            return Some(String::new());
        }
        Some(address[prefix.len()..].to_ascii_lowercase())
    }

    /// Like [`Message::strip_prefix_lower`] but preserves the original case
    /// of the remainder, for drivers that must forward a human-visible
    /// identifier (scene name, source name) on verbatim rather than use it
    /// as a routing key (spec §4.4 scene/name case preservation).
    pub fn strip_prefix(address: &str, prefix: &str) -> Option<String> {
        if !Self::address_under(address, prefix) {
            return None;
        }
        if address.eq_ignore_ascii_case(prefix) {
            return Some(String::new());
        }
        Some(address[prefix.len()..].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_under_is_segment_aligned() {
        assert!(Message::address_under("/test", "/test"));
        assert!(Message::address_under("/test/foo", "/test"));
        assert!(!Message::address_under("/testing", "/test"));
        assert!(!Message::address_under("/tes", "/test"));
    }

    #[test]
    fn address_under_is_case_insensitive() {
        assert!(Message::address_under("/AVANTIS/ch/1", "/avantis"));
    }

    #[test]
    fn strip_prefix_preserves_case_while_strip_prefix_lower_does_not() {
        assert_eq!(
            Message::strip_prefix("/OBS/scene/Main Camera", "/obs"),
            Some("/scene/Main Camera".to_string())
        );
        assert_eq!(
            Message::strip_prefix_lower("/OBS/scene/Main Camera", "/obs"),
            Some("/scene/main camera".to_string())
        );
    }

    #[test]
    fn infer_numeric_picks_int_for_whole_numbers() {
        assert_eq!(Value::infer_numeric(3.0), Value::Int(3));
        assert_eq!(Value::infer_numeric(3.5), Value::Float(3.5));
    }
}
