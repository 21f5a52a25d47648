use serde::{Deserialize, Serialize};

use crate::decision::{default_choices, DecisionPolicy};

/// One stage of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Node kinds and their kind-specific fields, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    /// Planning: asks the model for a step list and adds it to the chain.
    Task { prompt: String },
    Decision {
        prompt: String,
        #[serde(default = "default_choices")]
        choices: Vec<String>,
        #[serde(default)]
        policy: DecisionPolicy,
    },
    Selector {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Execution {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Verification {
        /// Appended to the review prompt as a checklist.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        checks: Vec<String>,
    },
    Debugger {
        /// Appended to the fix prompt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task { .. } => "task",
            Self::Decision { .. } => "decision",
            Self::Selector { .. } => "selector",
            Self::Execution { .. } => "execution",
            Self::Verification { .. } => "verification",
            Self::Debugger { .. } => "debugger",
        }
    }
}

impl Node {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: None,
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::End)
    }

    pub fn task(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Task {
                prompt: prompt.into(),
            },
        )
    }

    /// Decision with `YES`/`NO` choices answered by the model.
    pub fn decision(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Decision {
                prompt: prompt.into(),
                choices: default_choices(),
                policy: DecisionPolicy::default(),
            },
        )
    }

    pub fn selector(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Selector { description: None })
    }

    pub fn execution(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Execution { description: None })
    }

    pub fn verification(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Verification { checks: Vec::new() })
    }

    pub fn debugger(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Debugger { context: None })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set decision choices. Ignored for other kinds.
    pub fn with_choices(mut self, new_choices: &[&str]) -> Self {
        if let NodeKind::Decision { choices, .. } = &mut self.kind {
            *choices = new_choices.iter().map(|c| c.to_string()).collect();
        }
        self
    }

    /// Set the decision policy. Ignored for other kinds.
    pub fn with_policy(mut self, new_policy: DecisionPolicy) -> Self {
        if let NodeKind::Decision { policy, .. } = &mut self.kind {
            *policy = new_policy;
        }
        self
    }

    /// Set the description of a selector or execution node.
    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        if let NodeKind::Selector { description } | NodeKind::Execution { description } =
            &mut self.kind
        {
            *description = Some(text.into());
        }
        self
    }

    pub fn with_checks(mut self, new_checks: &[&str]) -> Self {
        if let NodeKind::Verification { checks } = &mut self.kind {
            *checks = new_checks.iter().map(|c| c.to_string()).collect();
        }
        self
    }

    pub fn with_context(mut self, text: impl Into<String>) -> Self {
        if let NodeKind::Debugger { context } = &mut self.kind {
            *context = Some(text.into());
        }
        self
    }

    /// Label if set, otherwise the id.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}
