//! Conversation payload and export metadata types.
//!
//! Pure data layer: no I/O, no async. Everything that crosses the data
//! channel is `Serialize`/`Deserialize`; everything that crosses a task
//! boundary is `Clone`/`Debug`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One message of an exported conversation.
///
/// Only `role` is interpreted here; every other field the source platform
/// attaches rides along untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationMessage {
    pub fn new(role: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: None,
            extra: Map::new(),
        }
    }

    /// A message is usable when it names who produced it.
    pub fn is_valid(&self) -> bool {
        !self.role.trim().is_empty()
    }
}

/// Parse and validate a decompressed export body.
///
/// The body must be a JSON array whose every element is a valid
/// [`ConversationMessage`]. Returns `None` otherwise.
pub fn parse_messages(json: &str) -> Option<Vec<ConversationMessage>> {
    let messages: Vec<ConversationMessage> = serde_json::from_str(json).ok()?;
    messages
        .iter()
        .all(ConversationMessage::is_valid)
        .then_some(messages)
}

/// What the caller knows about an export before it is serialized.
///
/// The transfer manager fills in the id and the size fields to build the
/// full [`ExportMeta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDescriptor {
    pub source_platform: String,
    pub source_session_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub exported_at: DateTime<Utc>,
}

impl ExportDescriptor {
    /// Descriptor stamped with the current time.
    pub fn now(source_platform: impl Into<String>, source_session_id: impl Into<String>) -> Self {
        Self {
            source_platform: source_platform.into(),
            source_session_id: source_session_id.into(),
            plan_id: None,
            exported_at: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }
}

/// Metadata announced once in `export_start` and handed to the receiver's
/// callback together with the reassembled messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMeta {
    pub export_id: Uuid,
    pub total_chunks: u32,
    /// Size of the serialized (uncompressed) message array.
    pub total_bytes: u64,
    /// Size of the compressed buffer that is chunked and digested.
    pub compressed_bytes: u64,
    pub source_platform: String,
    pub source_session_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub exported_at: DateTime<Utc>,
}

impl ExportMeta {
    pub fn new(
        export_id: Uuid,
        descriptor: ExportDescriptor,
        total_chunks: u32,
        total_bytes: u64,
        compressed_bytes: u64,
    ) -> Self {
        Self {
            export_id,
            total_chunks,
            total_bytes,
            compressed_bytes,
            source_platform: descriptor.source_platform,
            source_session_id: descriptor.source_session_id,
            plan_id: descriptor.plan_id,
            exported_at: descriptor.exported_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_keeps_unknown_fields() {
        let raw = json!([{"role": "assistant", "content": "hi", "model": "x", "tokens": 12}]);
        let parsed = parse_messages(&raw.to_string()).unwrap();
        assert_eq!(parsed[0].extra.get("model"), Some(&json!("x")));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse_messages(r#"{"role":"user"}"#).is_none());
        assert!(parse_messages("not json").is_none());
    }

    #[test]
    fn test_parse_rejects_message_without_role() {
        assert!(parse_messages(r#"[{"role":"user","content":"a"},{"content":"b"}]"#).is_none());
        assert!(parse_messages(r#"[{"role":"  ","content":"b"}]"#).is_none());
    }

    #[test]
    fn test_parse_accepts_empty_array() {
        assert_eq!(parse_messages("[]"), Some(vec![]));
    }

    #[test]
    fn test_meta_uses_camel_case_on_the_wire() {
        let meta = ExportMeta::new(
            Uuid::nil(),
            ExportDescriptor::now("desktop", "sess-1").with_plan("plan-7"),
            3,
            100,
            40,
        );
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["totalChunks"], json!(3));
        assert_eq!(value["compressedBytes"], json!(40));
        assert_eq!(value["sourceSessionId"], json!("sess-1"));
        assert_eq!(value["planId"], json!("plan-7"));
    }
}
