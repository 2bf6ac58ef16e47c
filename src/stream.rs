//! Agent Runner event stream: newline-delimited JSON records and the
//! per-session fan-out that feeds observers.
//!
//! Metrics and intervention share one ordered consumer; additional
//! subscribers (checkpointing, logging) get their own channel and see every
//! event exactly once, in stream order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One framed record on a session's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Startup record carrying the prompt handed to the runner.
    Prompt { text: String },
    AssistantText {
        text: String,
    },
    ToolUse {
        tool: String,
        input: Value,
        request_id: String,
    },
    ToolResult {
        request_id: String,
        is_error: bool,
        text: String,
    },
    SystemMessage {
        subtype: String,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        fields: serde_json::Map<String, Value>,
    },
    Error {
        message: String,
    },
    SessionEnd {
        reason: String,
    },
}

impl AgentEvent {
    /// Parse one NDJSON line into an event.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Serialize as a single frame (no trailing newline).
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"kind\":\"error\"}".to_string())
    }

    pub fn is_session_end(&self) -> bool {
        matches!(self, Self::SessionEnd { .. })
    }
}

/// Per-session event spine. Producers (the runner reader and the tool
/// surface) send into one channel; [`SessionEvents::drain`] hands events to
/// the single ordered consumer, which may forward to extra subscribers.
pub struct SessionEvents {
    tx: mpsc::UnboundedSender<AgentEvent>,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    subscribers: Vec<mpsc::UnboundedSender<AgentEvent>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            subscribers: Vec::new(),
        }
    }

    /// Handle for producers; cheap to clone.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Register an additional observer. Must happen before consumption
    /// starts so every subscriber sees the full stream.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Receive the next event in stream order, mirroring it to every
    /// subscriber. Returns `None` when all senders are gone.
    pub async fn drain(&mut self) -> Option<AgentEvent> {
        let event = self.rx.recv().await?;
        self.subscribers
            .retain(|sub| sub.send(event.clone()).is_ok());
        Some(event)
    }

    /// Drain without waiting; used to flush queued events after the
    /// producer finished.
    pub fn try_drain(&mut self) -> Option<AgentEvent> {
        let event = self.rx.try_recv().ok()?;
        self.subscribers
            .retain(|sub| sub.send(event.clone()).is_ok());
        Some(event)
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle onto a session's event spine.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSender {
    /// Append an event; silently dropped after the session loop stops.
    pub fn send(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn system(&self, subtype: &str, fields: serde_json::Map<String, Value>) {
        self.send(AgentEvent::SystemMessage {
            subtype: subtype.to_string(),
            fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_use_event() {
        let line = r#"{"kind":"tool_use","tool":"bash","input":{"command":"npm test"},"request_id":"r1"}"#;
        let event = AgentEvent::parse(line).unwrap();
        match event {
            AgentEvent::ToolUse {
                tool,
                input,
                request_id,
            } => {
                assert_eq!(tool, "bash");
                assert_eq!(input["command"], "npm test");
                assert_eq!(request_id, "r1");
            }
            other => panic!("expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_all_kinds() {
        let lines = [
            r#"{"kind":"prompt","text":"build it"}"#,
            r#"{"kind":"assistant_text","text":"working"}"#,
            r#"{"kind":"tool_result","request_id":"r1","is_error":false,"text":"ok"}"#,
            r#"{"kind":"system_message","subtype":"background_server_warning"}"#,
            r#"{"kind":"error","message":"boom"}"#,
            r#"{"kind":"session_end","reason":"done"}"#,
        ];
        for line in lines {
            AgentEvent::parse(line).unwrap();
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let event = AgentEvent::ToolResult {
            request_id: "r9".into(),
            is_error: true,
            text: "exit 1".into(),
        };
        let frame = event.to_frame();
        let back = AgentEvent::parse(&frame).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_system_message_extra_fields_round_trip() {
        let line = r#"{"kind":"system_message","subtype":"notice","fields":{"project":"p1"}}"#;
        let event = AgentEvent::parse(line).unwrap();
        match &event {
            AgentEvent::SystemMessage { subtype, fields } => {
                assert_eq!(subtype, "notice");
                assert_eq!(fields.get("project").unwrap(), "p1");
            }
            other => panic!("expected SystemMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_line_is_error() {
        assert!(AgentEvent::parse("not json").is_err());
        assert!(AgentEvent::parse(r#"{"kind":"unknown_kind"}"#).is_err());
    }

    #[tokio::test]
    async fn test_fanout_preserves_order_for_all_subscribers() {
        let mut events = SessionEvents::new();
        let sender = events.sender();
        let mut sub_a = events.subscribe();
        let mut sub_b = events.subscribe();

        for i in 0..5 {
            sender.send(AgentEvent::AssistantText {
                text: format!("msg {i}"),
            });
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(events.drain().await.unwrap());
        }

        for i in 0..5 {
            let expected = AgentEvent::AssistantText {
                text: format!("msg {i}"),
            };
            assert_eq!(seen[i], expected);
            assert_eq!(sub_a.recv().await.unwrap(), expected);
            assert_eq!(sub_b.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_session_end_marks_stream_terminal() {
        let mut events = SessionEvents::new();
        let sender = events.sender();
        sender.send(AgentEvent::SessionEnd {
            reason: "done".into(),
        });
        assert!(events.drain().await.unwrap().is_session_end());
        assert!(events.try_drain().is_none());
    }
}
