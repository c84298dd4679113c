use memory_weave_schemas::{Attachment, ConversationId, RawTurn, Sender, TurnId};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unreadable export document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed export record: {0}")]
    MalformedRecord(String),
}

/// A normalized turn plus the export-level context it came from. The
/// conversation name travels along so the pipeline can keep a human-readable
/// pointer back to the source.
#[derive(Debug, Clone)]
pub struct ExportTurn {
    pub turn: RawTurn,
    pub conversation_name: Option<String>,
}

/// A parsed export document: either a single conversation record or a list
/// of them. Parsing is tolerant by design; only a record missing its
/// identity fields is rejected, and only that record.
pub struct ExportDocument {
    conversations: Vec<Value>,
}

impl ExportDocument {
    pub fn parse(raw: &str) -> Result<Self, ExportError> {
        let value: Value = serde_json::from_str(raw)?;
        let conversations = match value {
            Value::Array(items) => items,
            Value::Object(_) => vec![value],
            _ => {
                return Err(ExportError::MalformedRecord(
                    "expected a conversation object or an array of them".to_string(),
                ))
            }
        };
        Ok(Self { conversations })
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Normalized turns in conversation order, messages oldest first within
    /// each conversation. A malformed record yields one error in place of
    /// its turns; well-formed neighbors are unaffected. The iterator can be
    /// restarted, so one parse serves any number of ingestion passes.
    pub fn turns(&self) -> impl Iterator<Item = Result<ExportTurn, ExportError>> + '_ {
        self.conversations.iter().flat_map(conversation_turns)
    }
}

fn conversation_turns(conversation: &Value) -> Vec<Result<ExportTurn, ExportError>> {
    let Some(conversation_uuid) = str_field(conversation, "uuid") else {
        return vec![Err(ExportError::MalformedRecord(
            "conversation record has no uuid".to_string(),
        ))];
    };
    let conversation_id = ConversationId(conversation_uuid.to_string());
    let conversation_name = str_field(conversation, "name")
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    let mut messages: Vec<&Value> = conversation
        .get("chat_messages")
        .and_then(Value::as_array)
        .map(|items| items.iter().collect())
        .unwrap_or_default();
    messages.sort_by_key(|message| str_field(message, "created_at").unwrap_or("").to_string());

    messages
        .into_iter()
        .map(|message| {
            message_turn(&conversation_id, message).map(|turn| ExportTurn {
                turn,
                conversation_name: conversation_name.clone(),
            })
        })
        .collect()
}

fn message_turn(conversation_id: &ConversationId, message: &Value) -> Result<RawTurn, ExportError> {
    let Some(message_uuid) = str_field(message, "uuid") else {
        return Err(ExportError::MalformedRecord(format!(
            "message without uuid in conversation {}",
            conversation_id
        )));
    };

    Ok(RawTurn {
        conversation_id: conversation_id.clone(),
        turn_id: TurnId(message_uuid.to_string()),
        sender: Sender::parse(str_field(message, "sender").unwrap_or("unknown")),
        text: message_text(message),
        attachments: message_attachments(message),
        created_at: str_field(message, "created_at")
            .unwrap_or("1970-01-01T00:00:00Z")
            .to_string(),
    })
}

/// Message text lives either in a top-level `text` field or in a list of
/// typed content blocks. Non-text blocks are skipped.
fn message_text(message: &Value) -> String {
    if let Some(text) = str_field(message, "text") {
        if !text.is_empty() {
            return text.to_string();
        }
    }

    let mut parts = Vec::new();
    if let Some(blocks) = message.get("content").and_then(Value::as_array) {
        for block in blocks {
            if str_field(block, "type") == Some("text") {
                if let Some(text) = str_field(block, "text") {
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
            }
        }
    }
    parts.join("\n")
}

fn message_attachments(message: &Value) -> Vec<Attachment> {
    let mut attachments = Vec::new();

    if let Some(items) = message.get("attachments").and_then(Value::as_array) {
        for item in items {
            attachments.push(Attachment {
                file_name: str_field(item, "file_name").unwrap_or("unnamed").to_string(),
                media_type: str_field(item, "file_type").map(str::to_string),
                extracted_text: str_field(item, "extracted_content").map(str::to_string),
            });
        }
    }

    // Uploaded files carry no extracted content, only a name
    if let Some(items) = message.get("files").and_then(Value::as_array) {
        for item in items {
            attachments.push(Attachment {
                file_name: str_field(item, "file_name").unwrap_or("unnamed").to_string(),
                media_type: None,
                extracted_text: None,
            });
        }
    }

    attachments
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
