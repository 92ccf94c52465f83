//! Streamable output blocks and the algorithms that fold them together.
//!
//! Agents emit [`ContentBlock`]s one at a time while a turn runs. Two folds
//! are defined over them:
//! - [`accumulate`] applies streaming updates in place (text overwrite, tool
//!   result merged into its invocation).
//! - [`merge`] collapses every tool block sharing a `tool_use_id` into one,
//!   once, before persistence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// The tool was invoked and has not reported back.
    Running,
    /// The tool finished successfully.
    Completed,
    /// The tool reported an error.
    Failed,
}

impl ToolStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Failed => 1,
            Self::Completed => 2,
        }
    }

    /// Resolve two observed statuses by priority `completed > failed > running`.
    ///
    /// Commutative, associative and idempotent.
    #[must_use]
    pub const fn resolve(a: Self, b: Self) -> Self {
        if b.rank() > a.rank() { b } else { a }
    }
}

/// Visual style of an action button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    #[default]
    Secondary,
    Destructive,
}

/// A button offered to the user alongside agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub style: ButtonStyle,
    /// Opaque action string interpreted by the client (e.g. `send:continue`).
    pub action: String,
}

/// Payload of a tool block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBlock {
    pub content: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    pub tool_status: ToolStatus,
}

impl ToolBlock {
    /// Fold a later observation of the same invocation into this one.
    fn absorb(&mut self, next: Self) {
        if !next.tool_name.is_empty() {
            self.tool_name = next.tool_name;
        }
        if !next.content.is_empty() {
            self.content = next.content;
        }
        if next.tool_input.is_some() {
            self.tool_input = next.tool_input;
        }
        if next.tool_output.is_some() {
            self.tool_output = next.tool_output;
        }
        if self.tool_use_id.is_none() {
            self.tool_use_id = next.tool_use_id;
        }
        self.tool_status = ToolStatus::resolve(self.tool_status, next.tool_status);
    }
}

/// Variant-specific part of a [`ContentBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block_type", rename_all = "snake_case")]
pub enum BlockKind {
    Text {
        content: String,
    },
    Code {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Tool(ToolBlock),
    Thinking {
        content: String,
    },
    Status {
        content: String,
    },
    Error {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    VoiceInput {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    VoiceOutput {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    ActionButtons {
        buttons: Vec<ActionButton>,
    },
}

/// One discrete unit of streamed agent output.
///
/// Serialized flat: `{"id": "...", "block_type": "tool", "tool_name": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: String,
    #[serde(flatten)]
    pub kind: BlockKind,
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

impl ContentBlock {
    /// Wrap a kind with a freshly generated id.
    #[must_use]
    pub fn new(kind: BlockKind) -> Self {
        Self {
            id: fresh_id(),
            kind,
        }
    }

    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(BlockKind::Text {
            content: content.into(),
        })
    }

    #[must_use]
    pub fn code(content: impl Into<String>, language: Option<String>) -> Self {
        Self::new(BlockKind::Code {
            content: content.into(),
            language,
        })
    }

    #[must_use]
    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(BlockKind::Thinking {
            content: content.into(),
        })
    }

    #[must_use]
    pub fn status(content: impl Into<String>) -> Self {
        Self::new(BlockKind::Status {
            content: content.into(),
        })
    }

    #[must_use]
    pub fn error(content: impl Into<String>, error_code: Option<String>) -> Self {
        Self::new(BlockKind::Error {
            content: content.into(),
            error_code,
        })
    }

    /// A tool invocation that has started but not reported back.
    #[must_use]
    pub fn tool_running(
        tool_name: impl Into<String>,
        tool_use_id: Option<String>,
        tool_input: Option<Value>,
    ) -> Self {
        let tool_name = tool_name.into();
        Self::new(BlockKind::Tool(ToolBlock {
            content: tool_name.clone(),
            tool_name,
            tool_use_id,
            tool_input,
            tool_output: None,
            tool_status: ToolStatus::Running,
        }))
    }

    /// The result of a tool invocation.
    #[must_use]
    pub fn tool_result(
        tool_name: impl Into<String>,
        tool_use_id: Option<String>,
        tool_output: impl Into<String>,
        failed: bool,
    ) -> Self {
        let tool_name = tool_name.into();
        Self::new(BlockKind::Tool(ToolBlock {
            content: tool_name.clone(),
            tool_name,
            tool_use_id,
            tool_input: None,
            tool_output: Some(tool_output.into()),
            tool_status: if failed {
                ToolStatus::Failed
            } else {
                ToolStatus::Completed
            },
        }))
    }

    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self.kind, BlockKind::Text { .. })
    }

    #[must_use]
    pub const fn as_tool(&self) -> Option<&ToolBlock> {
        match &self.kind {
            BlockKind::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    /// Correlation key of a tool block, if any.
    #[must_use]
    pub fn tool_use_id(&self) -> Option<&str> {
        self.as_tool().and_then(|t| t.tool_use_id.as_deref())
    }

    /// Text content of a text block.
    #[must_use]
    pub fn text_content(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::Text { content } => Some(content),
            _ => None,
        }
    }

    fn absorb_tool(&mut self, incoming: Self) {
        if let (BlockKind::Tool(current), BlockKind::Tool(next)) = (&mut self.kind, incoming.kind) {
            current.absorb(next);
        }
    }
}

/// Fold incoming blocks into `existing`, in arrival order.
///
/// - A tool block whose `tool_use_id` is already present replaces that block
///   in place with the merge of both.
/// - A text block overwrites the last block if that is also text (the
///   executor resends the full text each step); otherwise it is appended.
/// - Everything else is appended.
pub fn accumulate(existing: &mut Vec<ContentBlock>, incoming: impl IntoIterator<Item = ContentBlock>) {
    for block in incoming {
        if let Some(use_id) = block.tool_use_id() {
            if let Some(slot) = existing
                .iter_mut()
                .find(|b| b.tool_use_id() == Some(use_id))
            {
                slot.absorb_tool(block);
                continue;
            }
            existing.push(block);
            continue;
        }

        if block.is_text() {
            if let Some(last) = existing.last_mut().filter(|b| b.is_text()) {
                last.kind = block.kind;
                continue;
            }
        }

        existing.push(block);
    }
}

/// Collapse all tool blocks sharing a `tool_use_id` into the first of them.
///
/// Order-preserving and idempotent. `merge(all)` equals `merge` of the result
/// of [`accumulate`] over the same tool blocks.
#[must_use]
pub fn merge(blocks: &[ContentBlock]) -> Vec<ContentBlock> {
    let mut merged: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for block in blocks {
        if let Some(use_id) = block.tool_use_id() {
            if let Some(&at) = positions.get(use_id) {
                merged[at].absorb_tool(block.clone());
                continue;
            }
            positions.insert(use_id, merged.len());
        }
        merged.push(block.clone());
    }

    merged
}

/// Content of the last text block, if there is one.
#[must_use]
pub fn final_text(blocks: &[ContentBlock]) -> Option<&str> {
    blocks.iter().rev().find_map(ContentBlock::text_content)
}
