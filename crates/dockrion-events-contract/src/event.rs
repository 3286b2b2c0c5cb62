//! Streaming event model.
//!
//! An [`Event`] is an immutable record of one happening within a run:
//! `{type, run_id, sequence, ts, ...payload}` on the wire. Sequence numbers
//! are dense, strictly increasing and scoped to the run; they are assigned
//! by the producer and are the authoritative ordering everywhere (backends
//! never reorder, and backend-native ids are never trusted for ordering).

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

/// Filterable identity of an event.
///
/// Custom events carry their name; the wire form is `custom:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Progress,
    Checkpoint,
    Token,
    Step,
    Complete,
    Error,
    Cancelled,
    Heartbeat,
    Custom(String),
}

impl EventKind {
    /// Mandatory events are emitted regardless of filter configuration.
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            EventKind::Started | EventKind::Complete | EventKind::Error | EventKind::Cancelled
        )
    }

    /// Terminal events end a run; exactly one is ever stored per run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete | EventKind::Error | EventKind::Cancelled
        )
    }

    /// Wire form of the kind (`custom:<name>` for custom events).
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            EventKind::Started => Cow::Borrowed("started"),
            EventKind::Progress => Cow::Borrowed("progress"),
            EventKind::Checkpoint => Cow::Borrowed("checkpoint"),
            EventKind::Token => Cow::Borrowed("token"),
            EventKind::Step => Cow::Borrowed("step"),
            EventKind::Complete => Cow::Borrowed("complete"),
            EventKind::Error => Cow::Borrowed("error"),
            EventKind::Cancelled => Cow::Borrowed("cancelled"),
            EventKind::Heartbeat => Cow::Borrowed("heartbeat"),
            EventKind::Custom(name) => Cow::Owned(format!("custom:{name}")),
        }
    }

    /// Parse a wire type string. Returns `None` for unknown builtin names
    /// and for a bare `custom` without a name.
    pub fn parse(s: &str) -> Option<EventKind> {
        if let Some(name) = s.strip_prefix("custom:") {
            if name.is_empty() {
                return None;
            }
            return Some(EventKind::Custom(name.to_string()));
        }
        match s {
            "started" => Some(EventKind::Started),
            "progress" => Some(EventKind::Progress),
            "checkpoint" => Some(EventKind::Checkpoint),
            "token" => Some(EventKind::Token),
            "step" => Some(EventKind::Step),
            "complete" => Some(EventKind::Complete),
            "error" => Some(EventKind::Error),
            "cancelled" => Some(EventKind::Cancelled),
            "heartbeat" => Some(EventKind::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Type-specific event payload.
///
/// The serde representation is internally tagged on `type`; the custom
/// variant is re-tagged to `custom:<name>` by [`Event`]'s serde glue so the
/// derived tag never leaks onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framework: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Progress {
        step: String,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Checkpoint {
        name: String,
        data: Value,
    },
    Token {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    Step {
        node_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        input_keys: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        output_keys: Vec<String>,
    },
    Complete {
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_seconds: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Error {
        error: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Heartbeat,
    Custom {
        name: String,
        data: Value,
    },
}

impl EventPayload {
    /// The filterable kind of this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Started { .. } => EventKind::Started,
            EventPayload::Progress { .. } => EventKind::Progress,
            EventPayload::Checkpoint { .. } => EventKind::Checkpoint,
            EventPayload::Token { .. } => EventKind::Token,
            EventPayload::Step { .. } => EventKind::Step,
            EventPayload::Complete { .. } => EventKind::Complete,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::Cancelled { .. } => EventKind::Cancelled,
            EventPayload::Heartbeat => EventKind::Heartbeat,
            EventPayload::Custom { name, .. } => EventKind::Custom(name.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// One immutable event within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Owning run (or client-correlation id for direct streaming).
    pub run_id: String,
    /// Dense, strictly increasing position within the run, starting at 0.
    pub sequence: u64,
    /// Wall-clock at emission, unix milliseconds, monotonic within a run.
    pub ts: u64,
    /// Type-specific fields.
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// Render the event as a Server-Sent-Events record.
    ///
    /// The `id:` line carries the sequence number so compliant clients
    /// reconnect with `Last-Event-ID`, which the HTTP layer maps back to
    /// `from_sequence + 1`.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!(
            "event: {}\nid: {}\ndata: {}\n\n",
            self.kind(),
            self.sequence,
            data
        )
    }
}

impl Serialize for Event {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut obj = match serde_json::to_value(&self.payload) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) => {
                return Err(serde::ser::Error::custom(
                    "event payload must serialize to an object",
                ))
            }
            Err(e) => return Err(serde::ser::Error::custom(e)),
        };
        // The derived tag for custom events is `"type": "custom"` plus a
        // `name` field; the wire format folds both into `custom:<name>`.
        if let EventPayload::Custom { name, .. } = &self.payload {
            obj.insert("type".to_string(), Value::String(format!("custom:{name}")));
            obj.remove("name");
        }
        obj.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        obj.insert("sequence".to_string(), Value::from(self.sequence));
        obj.insert("ts".to_string(), Value::from(self.ts));
        obj.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut obj = serde_json::Map::deserialize(deserializer)?;
        let run_id = match obj.remove("run_id") {
            Some(Value::String(s)) => s,
            _ => return Err(D::Error::missing_field("run_id")),
        };
        let sequence = obj
            .remove("sequence")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| D::Error::missing_field("sequence"))?;
        let ts = obj
            .remove("ts")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| D::Error::missing_field("ts"))?;
        // Undo the custom re-tagging before handing off to the derived impl.
        if let Some(Value::String(ty)) = obj.get("type") {
            if let Some(name) = ty.strip_prefix("custom:") {
                let name = name.to_string();
                obj.insert("type".to_string(), Value::String("custom".to_string()));
                obj.insert("name".to_string(), Value::String(name));
            }
        }
        let payload: EventPayload =
            serde_json::from_value(Value::Object(obj)).map_err(D::Error::custom)?;
        Ok(Event {
            run_id,
            sequence,
            ts,
            payload,
        })
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis().min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(payload: EventPayload) -> Event {
        Event {
            run_id: "run-1".to_string(),
            sequence: 3,
            ts: 1_700_000_000_000,
            payload,
        }
    }

    #[test]
    fn kind_wire_forms_round_trip() {
        for s in [
            "started",
            "progress",
            "checkpoint",
            "token",
            "step",
            "complete",
            "error",
            "cancelled",
            "heartbeat",
            "custom:fraud_check",
        ] {
            let kind = EventKind::parse(s).expect(s);
            assert_eq!(kind.as_str(), s);
        }
        assert_eq!(EventKind::parse("custom:"), None);
        assert_eq!(EventKind::parse("custom"), None);
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn terminal_and_mandatory_sets() {
        assert!(EventKind::Complete.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(EventKind::Cancelled.is_terminal());
        assert!(!EventKind::Started.is_terminal());
        assert!(EventKind::Started.is_mandatory());
        assert!(!EventKind::Heartbeat.is_mandatory());
        assert!(!EventKind::Custom("x".into()).is_mandatory());
    }

    #[test]
    fn builtin_event_json_round_trip() {
        let ev = event(EventPayload::Progress {
            step: "parsing".to_string(),
            progress: 0.5,
            message: Some("halfway".to_string()),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["ts"], 1_700_000_000_000u64);
        assert_eq!(json["step"], "parsing");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn custom_event_wire_tag() {
        let ev = event(EventPayload::Custom {
            name: "fraud_check".to_string(),
            data: json!({"passed": true, "score": 0.02}),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "custom:fraud_check");
        assert!(json.get("name").is_none());
        assert_eq!(json["data"]["passed"], true);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.kind(), EventKind::Custom("fraud_check".to_string()));
    }

    #[test]
    fn heartbeat_round_trip() {
        let ev = event(EventPayload::Heartbeat);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "heartbeat");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn every_payload_variant_round_trips() {
        let payloads = vec![
            EventPayload::Started {
                agent_name: Some("invoice-agent".to_string()),
                framework: Some("langgraph".to_string()),
                metadata: Some(json!({"version": "1.2"})),
            },
            EventPayload::Progress {
                step: "extract".to_string(),
                progress: 0.25,
                message: None,
            },
            EventPayload::Checkpoint {
                name: "parsed_doc".to_string(),
                data: json!({"fields": 15, "confidence": 0.9}),
            },
            EventPayload::Token {
                content: " world".to_string(),
                finish_reason: Some("stop".to_string()),
            },
            EventPayload::Step {
                node_name: "extract_fields".to_string(),
                duration_ms: Some(150),
                input_keys: vec!["document".to_string()],
                output_keys: vec!["fields".to_string()],
            },
            EventPayload::Complete {
                output: json!({"answer": 42}),
                latency_seconds: Some(1.25),
                metadata: Some(json!({"agent": "invoice-agent"})),
            },
            EventPayload::Error {
                error: "boom".to_string(),
                code: "INTERNAL_ERROR".to_string(),
                details: Some(json!({"retryable": false})),
            },
            EventPayload::Cancelled {
                reason: Some("client".to_string()),
            },
            EventPayload::Heartbeat,
            EventPayload::Custom {
                name: "fraud_check".to_string(),
                data: json!({"passed": true}),
            },
        ];
        for (sequence, payload) in payloads.into_iter().enumerate() {
            let ev = Event {
                run_id: "run-rt".to_string(),
                sequence: sequence as u64,
                ts: 1_700_000_000_000 + sequence as u64,
                payload,
            };
            let json = serde_json::to_value(&ev).unwrap();
            assert_eq!(json["type"].as_str().unwrap(), ev.kind().as_str());
            let back: Event = serde_json::from_value(json).unwrap();
            assert_eq!(back, ev);
        }
    }

    #[test]
    fn optional_fields_are_omitted() {
        let ev = event(EventPayload::Token {
            content: "hi".to_string(),
            finish_reason: None,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("finish_reason").is_none());
    }

    #[test]
    fn sse_frame_shape() {
        let ev = event(EventPayload::Complete {
            output: json!({"r": 1}),
            latency_seconds: None,
            metadata: None,
        });
        let frame = ev.to_sse();
        assert!(frame.starts_with("event: complete\nid: 3\ndata: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn missing_required_fields_rejected() {
        let err = serde_json::from_value::<Event>(json!({
            "type": "token",
            "sequence": 0,
            "ts": 1,
            "content": "x"
        }));
        assert!(err.is_err());
    }
}
