//! Wire envelope shared by every transport.
//!
//! The envelope is a JSON object `{value, key, tabId, timestamp}`. `value`
//! must be present (JSON `null` is a legal payload, an absent field is not);
//! `key` routes within a physical channel; `tabId` names the originating
//! context; `timestamp` is an advisory last-write hint, never used for
//! conflict resolution.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "tabId", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(value: Value, key: &str, tab_id: &str) -> Self {
        Self {
            value,
            key: Some(key.to_owned()),
            tab_id: Some(tab_id.to_owned()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Minimal envelope for a bare payload handed straight to a transport:
    /// no logical key, just value, origin and timestamp.
    pub fn wrap(value: Value, tab_id: &str) -> Value {
        json!({
            "value": value,
            "tabId": tab_id,
            "timestamp": Utc::now().timestamp_millis(),
        })
    }

    /// Validate an untyped wire payload. This is the single ingestion gate:
    /// non-objects and objects without a `value` field are rejected. A
    /// missing `tabId` is kept as `None` and treated as foreign by callers.
    pub fn parse(raw: &Value) -> Option<Envelope> {
        let obj = raw.as_object()?;
        let value = obj.get("value")?.clone();
        let key = obj.get("key").and_then(Value::as_str).map(str::to_owned);
        let tab_id = obj.get("tabId").and_then(Value::as_str).map(str::to_owned);
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_default();

        Some(Envelope {
            value,
            key,
            tab_id,
            timestamp,
        })
    }

    /// True when the envelope originated from the given context identity.
    /// Envelopes without an origin never match anyone.
    pub fn from_origin(&self, identity: &str) -> bool {
        self.tab_id.as_deref() == Some(identity)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_objects() {
        assert!(Envelope::parse(&json!(42)).is_none());
        assert!(Envelope::parse(&json!("text")).is_none());
        assert!(Envelope::parse(&json!([1, 2])).is_none());
    }

    #[test]
    fn rejects_missing_value_field() {
        assert!(Envelope::parse(&json!({"key": "k", "tabId": "t"})).is_none());
    }

    #[test]
    fn null_is_a_legal_payload() {
        let env = Envelope::parse(&json!({"value": null, "tabId": "t"})).unwrap();
        assert_eq!(env.value, Value::Null);
    }

    #[test]
    fn missing_tab_id_is_foreign() {
        let env = Envelope::parse(&json!({"value": 1})).unwrap();
        assert!(!env.from_origin("anyone"));
    }

    #[test]
    fn wire_field_names_round_trip() {
        let env = Envelope::new(json!("v"), "k", "tab-1");
        let raw = env.to_value();
        assert_eq!(raw["tabId"], json!("tab-1"));
        assert_eq!(raw["key"], json!("k"));

        let back = Envelope::parse(&raw).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn wrap_produces_parseable_minimal_envelope() {
        let raw = Envelope::wrap(json!(7), "tab-9");
        let env = Envelope::parse(&raw).unwrap();
        assert_eq!(env.value, json!(7));
        assert_eq!(env.key, None);
        assert!(env.from_origin("tab-9"));
    }
}
