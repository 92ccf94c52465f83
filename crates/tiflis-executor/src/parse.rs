//! Translation of executor steps into content blocks.

use tiflis_core::ContentBlock;

use crate::message::{ExecutorStep, Message};

/// Parse every message of a step, in order.
#[must_use]
pub fn parse_step(step: &ExecutorStep) -> Vec<ContentBlock> {
    step.messages.iter().flat_map(parse_message).collect()
}

/// Parse a single executor message into zero or more blocks.
///
/// System and user messages are inputs and produce nothing. An assistant
/// message yields its reasoning, its text, then one running tool block per
/// requested call. A tool message yields the completed (or failed) tool block
/// correlated by `tool_call_id`.
#[must_use]
pub fn parse_message(message: &Message) -> Vec<ContentBlock> {
    match message {
        Message::System { .. } | Message::User { .. } => Vec::new(),
        Message::Assistant {
            content,
            reasoning,
            tool_calls,
        } => {
            let mut blocks = Vec::with_capacity(tool_calls.len() + 2);
            if let Some(reasoning) = reasoning.as_deref().filter(|r| !r.trim().is_empty()) {
                blocks.push(ContentBlock::thinking(reasoning));
            }
            if !content.trim().is_empty() {
                blocks.push(ContentBlock::text(content.clone()));
            }
            blocks.extend(tool_calls.iter().map(|call| {
                ContentBlock::tool_running(
                    call.name.clone(),
                    Some(call.id.clone()),
                    Some(call.args.clone()),
                )
            }));
            blocks
        }
        Message::Tool {
            tool_call_id,
            name,
            content,
            is_error,
        } => vec![ContentBlock::tool_result(
            name.clone(),
            Some(tool_call_id.clone()),
            content.clone(),
            *is_error,
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use tiflis_core::{BlockKind, ToolStatus};

    #[test]
    fn test_assistant_with_reasoning_and_tools() {
        let msg = Message::Assistant {
            content: "Let me check.".into(),
            reasoning: Some("need the calculator".into()),
            tool_calls: vec![ToolCall {
                id: "u1".into(),
                name: "calc".into(),
                args: serde_json::json!({"expr": "6*7"}),
            }],
        };
        let blocks = parse_message(&msg);
        assert_eq!(blocks.len(), 3);
        assert!(matches!(blocks[0].kind, BlockKind::Thinking { .. }));
        assert_eq!(blocks[1].text_content(), Some("Let me check."));
        let tool = blocks[2].as_tool().unwrap();
        assert_eq!(tool.tool_status, ToolStatus::Running);
        assert_eq!(tool.tool_use_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_tool_message_failed() {
        let blocks = parse_message(&Message::tool_result("u1", "calc", "division by zero", true));
        let tool = blocks[0].as_tool().unwrap();
        assert_eq!(tool.tool_status, ToolStatus::Failed);
        assert_eq!(tool.tool_output.as_deref(), Some("division by zero"));
    }

    #[test]
    fn test_inputs_and_empty_text_produce_nothing() {
        let step = ExecutorStep::new(vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("   "),
        ]);
        assert!(parse_step(&step).is_empty());
    }
}
