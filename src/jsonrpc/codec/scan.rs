//! Single forward scan of a message object.
//!
//! Envelope scalars are decoded as soon as their key is seen; every other field
//! is captured as a raw JSON tree in source order and resolved later, once the
//! method name is known. When the input breaks off partway, the fields scanned
//! so far are kept next to the error.

use serde::de::{DeserializeSeed, Deserializer, MapAccess, Visitor};
use serde_json::Value;
use std::fmt;

use super::Dialect;
use crate::jsonrpc::types::MessageId;

#[derive(Debug, Default)]
pub(crate) struct Envelope {
    pub version: Option<String>,
    pub id: Option<MessageId>,
    pub method: Option<String>,
    pub seq: Option<i64>,
    pub request_seq: Option<i64>,
    pub kind: Option<String>,
    pub success: Option<bool>,
    pub message: Option<String>,
    pub fields: Vec<(String, Value)>,
    /// The input was an object; errors after this point are about its content.
    pub in_object: bool,
}

impl Envelope {
    /// Remove a captured payload field; `null` counts as absent.
    pub fn take_field(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(key, _)| key == name)?;
        match self.fields.remove(pos).1 {
            Value::Null => None,
            value => Some(value),
        }
    }
}

enum Slot {
    Version,
    Id,
    Method,
    Seq,
    RequestSeq,
    Kind,
    Success,
    Message,
    Raw,
}

fn slot(dialect: Dialect, key: &str) -> Slot {
    match dialect {
        Dialect::Base => match key {
            "jsonrpc" => Slot::Version,
            "id" => Slot::Id,
            "method" => Slot::Method,
            _ => Slot::Raw,
        },
        Dialect::Debug => match key {
            "seq" => Slot::Seq,
            "request_seq" => Slot::RequestSeq,
            "type" => Slot::Kind,
            "command" | "event" => Slot::Method,
            "success" => Slot::Success,
            "message" => Slot::Message,
            _ => Slot::Raw,
        },
    }
}

struct EnvelopeSeed<'a> {
    dialect: Dialect,
    out: &'a mut Envelope,
}

impl<'de> DeserializeSeed<'de> for EnvelopeSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(EnvelopeVisitor {
            dialect: self.dialect,
            out: self.out,
        })
    }
}

struct EnvelopeVisitor<'a> {
    dialect: Dialect,
    out: &'a mut Envelope,
}

impl<'de> Visitor<'de> for EnvelopeVisitor<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        self.out.in_object = true;
        while let Some(key) = map.next_key::<String>()? {
            match slot(self.dialect, &key) {
                Slot::Version => self.out.version = Some(map.next_value()?),
                Slot::Id => self.out.id = map.next_value::<Option<MessageId>>()?,
                Slot::Method => self.out.method = Some(map.next_value()?),
                Slot::Seq => self.out.seq = Some(map.next_value()?),
                Slot::RequestSeq => self.out.request_seq = Some(map.next_value()?),
                Slot::Kind => self.out.kind = Some(map.next_value()?),
                Slot::Success => self.out.success = Some(map.next_value()?),
                Slot::Message => self.out.message = map.next_value::<Option<String>>()?,
                Slot::Raw => {
                    let value: Value = map.next_value()?;
                    self.out.fields.push((key, value));
                }
            }
        }
        Ok(())
    }
}

/// Scan message text. Returns whatever was captured and the error that stopped the scan, if any.
pub(crate) fn scan_str(dialect: Dialect, text: &str) -> (Envelope, Option<serde_json::Error>) {
    let mut envelope = Envelope::default();
    let mut deserializer = serde_json::Deserializer::from_str(text);
    let result = EnvelopeSeed {
        dialect,
        out: &mut envelope,
    }
    .deserialize(&mut deserializer)
    .and_then(|()| deserializer.end());
    (envelope, result.err())
}

/// Scan an already parsed JSON tree.
pub(crate) fn scan_value(dialect: Dialect, value: Value) -> (Envelope, Option<serde_json::Error>) {
    let mut envelope = Envelope::default();
    let result = EnvelopeSeed {
        dialect,
        out: &mut envelope,
    }
    .deserialize(value);
    (envelope, result.err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_base_envelope() {
        let (mut env, error) = scan_str(
            Dialect::Base,
            r#"{"params":{"a":1},"method":"m","id":"7","jsonrpc":"2.0"}"#,
        );
        assert!(error.is_none());
        assert_eq!(env.version.as_deref(), Some("2.0"));
        assert_eq!(env.id, Some(MessageId::from("7")));
        assert_eq!(env.method.as_deref(), Some("m"));
        assert_eq!(env.take_field("params"), Some(json!({"a": 1})));
        assert!(env.take_field("params").is_none());
    }

    #[test]
    fn test_scan_debug_envelope() {
        let (env, error) = scan_str(
            Dialect::Debug,
            r#"{"body":{"x":true},"request_seq":4,"success":false,"message":"no","type":"response","seq":9,"command":"next"}"#,
        );
        assert!(error.is_none());
        assert_eq!(env.seq, Some(9));
        assert_eq!(env.request_seq, Some(4));
        assert_eq!(env.success, Some(false));
        assert_eq!(env.kind.as_deref(), Some("response"));
        assert_eq!(env.method.as_deref(), Some("next"));
        assert_eq!(env.message.as_deref(), Some("no"));
        assert_eq!(env.fields, vec![("body".to_string(), json!({"x": true}))]);
    }

    #[test]
    fn test_truncated_input_keeps_scanned_fields() {
        let (env, error) = scan_str(Dialect::Debug, r#"{"type":"request","seq":2,"command":"foo""#);
        assert!(error.unwrap().is_eof());
        assert_eq!(env.kind.as_deref(), Some("request"));
        assert_eq!(env.seq, Some(2));
        assert_eq!(env.method.as_deref(), Some("foo"));
    }

    #[test]
    fn test_wrong_scalar_type_stops_scan() {
        let (env, error) = scan_str(Dialect::Debug, r#"{"type":"event","seq":"one","event":"x"}"#);
        assert!(error.unwrap().is_data());
        assert_eq!(env.kind.as_deref(), Some("event"));
        assert!(env.method.is_none());
    }

    #[test]
    fn test_scan_value_and_non_object() {
        let (env, error) = scan_value(Dialect::Base, json!({"method": "exit"}));
        assert!(error.is_none());
        assert_eq!(env.method.as_deref(), Some("exit"));

        let (env, error) = scan_str(Dialect::Base, "[1, 2]");
        assert!(error.is_some());
        assert!(!env.in_object);
    }

    #[test]
    fn test_trailing_garbage_is_an_error() {
        let (env, error) = scan_str(Dialect::Base, r#"{"method":"exit"} x"#);
        assert!(error.is_some());
        assert_eq!(env.method.as_deref(), Some("exit"));
    }
}
