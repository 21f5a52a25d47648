use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::{ChainMode, StepDef, StepStatus, StepTodo};

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Chain progress notification for UI observers.
///
/// Observers that replay these events in order reconstruct the chain held
/// by the publishing `FlowContext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEvent {
    Start {
        mode: ChainMode,
    },
    AddStep {
        name: String,
        description: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        todos: Vec<StepTodo>,
    },
    UpdateStep {
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    CompleteStep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    FailStep {
        error: String,
    },
    Clear,
    /// The chain entered `executing` with `step_index` as the current step.
    StartExecution {
        step_index: usize,
    },
    SubPlanStart {
        step_index: usize,
        reason: String,
        steps: Vec<StepDef>,
    },
    SubPlanEnd {
        step_index: usize,
        success: bool,
    },
    SetTodos {
        todos: Vec<StepTodo>,
    },
    TodoDone {
        todo_index: usize,
    },
    ParallelUpdate {
        step_index: usize,
        status: StepStatus,
    },
}

impl ChainEvent {
    /// Stable event-type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "chain-start",
            Self::AddStep { .. } => "chain-add-step",
            Self::UpdateStep { .. } => "chain-update-step",
            Self::CompleteStep { .. } => "chain-complete-step",
            Self::FailStep { .. } => "chain-fail-step",
            Self::Clear => "chain-clear",
            Self::StartExecution { .. } => "chain-start-execution",
            Self::SubPlanStart { .. } => "chain-sub-plan-start",
            Self::SubPlanEnd { .. } => "chain-sub-plan-end",
            Self::SetTodos { .. } => "chain-set-todos",
            Self::TodoDone { .. } => "chain-todo-done",
            Self::ParallelUpdate { .. } => "chain-parallel-update",
        }
    }
}

/// Event broadcast to all bus subscribers.
///
/// Session-scoped variants carry the session id so a subscriber can follow
/// one prompt exchange without seeing another's deltas.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Text streaming from the model for a session.
    TextDelta { session_id: SessionId, text: String },
    /// The model started a tool call.
    ToolStart { session_id: SessionId, name: String },
    /// Token usage reported for a session's exchange.
    UsageUpdate {
        session_id: SessionId,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// The session finished processing the last prompt.
    SessionIdle { session_id: SessionId },
    /// The session's last prompt failed.
    SessionError { session_id: SessionId, error: String },
    /// Chain progress.
    Chain(ChainEvent),
}

impl AgentEvent {
    /// The session this event belongs to, if session-scoped.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::TextDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::UsageUpdate { session_id, .. }
            | Self::SessionIdle { session_id }
            | Self::SessionError { session_id, .. } => Some(session_id),
            Self::Chain(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_scope() {
        let sid = SessionId::from_str("abc");
        let event = AgentEvent::SessionIdle {
            session_id: sid.clone(),
        };
        assert_eq!(event.session_id(), Some(&sid));
        assert!(AgentEvent::Chain(ChainEvent::Clear).session_id().is_none());
    }

    #[test]
    fn test_chain_event_serialization() {
        let event = ChainEvent::UpdateStep {
            status: StepStatus::RunningCommand,
            tool: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "update_step", "status": "running_command"})
        );
        assert_eq!(event.event_type(), "chain-update-step");
    }
}
