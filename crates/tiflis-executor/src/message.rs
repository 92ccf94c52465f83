//! Message vocabulary exchanged with a reactive executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiflis_core::{ConversationEntry, Role};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// One message in the executor's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Plain assistant text with no tool calls.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
        }
    }

    /// Assistant message requesting tool calls.
    #[must_use]
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: content.into(),
            reasoning: None,
            tool_calls,
        }
    }

    /// Result of a tool call.
    #[must_use]
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
        }
    }
}

impl From<&ConversationEntry> for Message {
    fn from(entry: &ConversationEntry) -> Self {
        match entry.role {
            Role::User => Self::user(entry.content.clone()),
            Role::Assistant => Self::assistant(entry.content.clone()),
        }
    }
}

/// Messages produced by one executor step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStep {
    pub messages: Vec<Message>,
}

impl ExecutorStep {
    #[must_use]
    pub const fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "u1".into(),
                name: "calc".into(),
                args: serde_json::json!({"expr": "6*7"}),
            }],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["tool_calls"][0]["id"], "u1");
        assert!(json.get("reasoning").is_none());

        let parsed: Message =
            serde_json::from_str(r#"{"role":"tool","tool_call_id":"u1","name":"calc","content":"42"}"#)
                .unwrap();
        assert_eq!(parsed, Message::tool_result("u1", "calc", "42", false));
    }

    #[test]
    fn test_from_conversation_entry() {
        let entry = ConversationEntry::assistant("done");
        assert_eq!(Message::from(&entry), Message::assistant("done"));
    }
}
