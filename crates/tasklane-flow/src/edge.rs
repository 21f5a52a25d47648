use serde::{Deserialize, Serialize};

use tasklane_core::error::Result;

use crate::predicate::Predicate;

/// A transition between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Taken when it equals the most recent decision's choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Taken when the predicate holds. Checked before any label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Predicate>,
}

impl Edge {
    /// Create an unguarded edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            condition: None,
        }
    }

    /// Create an edge guarded by a parsed condition expression.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: &str,
    ) -> Result<Self> {
        Ok(Self::new(from, to).when(Predicate::parse(expr)?))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn when(mut self, predicate: Predicate) -> Self {
        self.condition = Some(predicate);
        self
    }
}
