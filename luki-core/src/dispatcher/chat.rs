//! Chat request validation and payload shaping.
//!
//! Conversation turns are forwarded to the agent verbatim: no truncation,
//! reordering or summarization happens here.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

pub const MAX_CONTENT_CHARS: usize = 8192;
pub const MAX_ID_CHARS: usize = 256;

// SAFETY: .expect() on a literal pattern, exercised by test_user_id_rules().
static USER_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9@._-]+$").expect("valid user id pattern"));

const ROLES: [&str; 3] = ["system", "user", "assistant"];

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Inbound chat body shared by the unary and streaming routes.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller-supplied context, merged into the agent payload.
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

impl ChatRequest {
    /// Parse and validate a raw JSON body.
    pub fn parse(body: &[u8]) -> GatewayResult<Self> {
        if body.is_empty() {
            return Err(GatewayError::validation("Request body is required"));
        }
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| GatewayError::validation(format!("Invalid chat request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        let Some(last) = self.messages.last() else {
            return Err(GatewayError::validation("messages must not be empty"));
        };

        for (i, message) in self.messages.iter().enumerate() {
            if !ROLES.contains(&message.role.as_str()) {
                return Err(GatewayError::validation(format!(
                    "messages[{i}].role must be one of system, user, assistant"
                )));
            }
            if message.content.trim().is_empty() {
                return Err(GatewayError::validation(format!(
                    "messages[{i}].content must not be empty"
                )));
            }
            if message.content.chars().count() > MAX_CONTENT_CHARS {
                return Err(GatewayError::validation(format!(
                    "messages[{i}].content exceeds {MAX_CONTENT_CHARS} characters"
                )));
            }
        }

        if last.role != "user" {
            return Err(GatewayError::validation(
                "the last message must have role user",
            ));
        }

        validate_user_id(&self.user_id)?;

        if let Some(session_id) = &self.session_id
            && session_id.chars().count() > MAX_ID_CHARS
        {
            return Err(GatewayError::validation(format!(
                "session_id exceeds {MAX_ID_CHARS} characters"
            )));
        }
        Ok(())
    }

    /// Content of the final (user) turn.
    pub fn latest_message(&self) -> &str {
        self.messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    /// The caller's session id, or a fresh one.
    pub fn resolve_session_id(&self) -> String {
        match &self.session_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    /// Body sent to the agent.
    ///
    /// Caller context keys are kept; `memory_context` is added only when
    /// enrichment produced something.
    pub fn agent_payload(
        &self,
        session_id: &str,
        memory_context: Option<Value>,
        stream: bool,
    ) -> Value {
        let mut context = self.context.clone().unwrap_or_default();
        if let Some(memory) = memory_context {
            context.insert("memory_context".to_string(), memory);
        }

        let mut payload = json!({
            "message": self.latest_message(),
            "messages": self.messages,
            "user_id": self.user_id,
            "session_id": session_id,
            "context": context,
        });
        if stream {
            payload["stream"] = Value::Bool(true);
        }
        payload
    }
}

pub fn validate_user_id(user_id: &str) -> GatewayResult<()> {
    if user_id.is_empty() {
        return Err(GatewayError::validation("user_id is required"));
    }
    if user_id.chars().count() > MAX_ID_CHARS {
        return Err(GatewayError::validation(format!(
            "user_id exceeds {MAX_ID_CHARS} characters"
        )));
    }
    if !USER_ID_PATTERN.is_match(user_id) {
        return Err(GatewayError::validation(
            "user_id may only contain letters, digits and @ . _ -",
        ));
    }
    Ok(())
}

/// Shape the agent's unary answer for the client.
///
/// The reply text comes from `response`, then `content`, then
/// `message.content`. A body with none of them is a bad downstream answer.
pub fn shape_reply(downstream: &str, session_id: &str, body: &Value) -> GatewayResult<Value> {
    let content = body
        .get("response")
        .and_then(Value::as_str)
        .or_else(|| body.get("content").and_then(Value::as_str))
        .or_else(|| body.pointer("/message/content").and_then(Value::as_str))
        .ok_or_else(|| GatewayError::DownstreamError {
            downstream: downstream.to_string(),
            status: 502,
        })?;

    let metadata = body
        .get("metadata")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    Ok(json!({
        "message": { "role": "assistant", "content": content },
        "session_id": session_id,
        "metadata": metadata,
    }))
}

/// Pull the memory items out of a memory service answer.
pub fn memory_results(body: Value) -> Option<Value> {
    match body {
        Value::Null => None,
        Value::Object(mut map) => match map.remove("results") {
            Some(results) => Some(results),
            None => Some(Value::Object(map)),
        },
        other => Some(other),
    }
}
