//! Sub-agent result formatting.
//!
//! A terminal result becomes a user-role conversation message that the
//! parent agent consumes on its next iteration.

use crate::services::{ConversationMessage, MessageRole};
use super::{ExecutionStatus, SubAgentResult};

/// Render a terminal sub-agent result as a conversation message.
pub fn format_result_message(result: &SubAgentResult) -> ConversationMessage {
    let content = match result.status {
        ExecutionStatus::Completed => format!(
            "[Sub-agent completed] {} (exec {}):\n{}",
            result.agent_name,
            result.execution_id,
            result.analysis.as_deref().unwrap_or(""),
        ),
        status => format!(
            "[Sub-agent {}] {} (exec {}): {}",
            status,
            result.agent_name,
            result.execution_id,
            result.error_message.as_deref().unwrap_or("no error details"),
        ),
    };
    ConversationMessage {
        role: MessageRole::User,
        content,
    }
}
