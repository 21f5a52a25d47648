//! Chain: the step-by-step progress record for one agent run.
//!
//! Every reducer takes `&self` and returns a new `Chain`; the input is never
//! mutated. Operations on "the current step" target `steps[current_step]`
//! and are no-ops when that index is out of range.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry count at which a step should be escalated to the user.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Status of a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Coding,
    SearchingWeb,
    SearchingCode,
    ReadingFile,
    WritingFile,
    RunningCommand,
    Analyzing,
    Thinking,
    Complete,
    Failed,
    Retrying,
}

impl StepStatus {
    pub const ALL: [StepStatus; 13] = [
        Self::Pending,
        Self::Running,
        Self::Coding,
        Self::SearchingWeb,
        Self::SearchingCode,
        Self::ReadingFile,
        Self::WritingFile,
        Self::RunningCommand,
        Self::Analyzing,
        Self::Thinking,
        Self::Complete,
        Self::Failed,
        Self::Retrying,
    ];

    /// Only `complete` and `failed` end a step.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Pending => "⏳",
            Self::Running => "🔄",
            Self::Coding => "💻",
            Self::SearchingWeb => "🌐",
            Self::SearchingCode => "🔍",
            Self::ReadingFile => "📖",
            Self::WritingFile => "✏️",
            Self::RunningCommand => "⚡",
            Self::Analyzing => "🧠",
            Self::Thinking => "💭",
            Self::Complete => "✅",
            Self::Failed => "❌",
            Self::Retrying => "🔁",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Coding => "coding",
            Self::SearchingWeb => "searching_web",
            Self::SearchingCode => "searching_code",
            Self::ReadingFile => "reading_file",
            Self::WritingFile => "writing_file",
            Self::RunningCommand => "running_command",
            Self::Analyzing => "analyzing",
            Self::Thinking => "thinking",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown step status: {}", s))
    }
}

/// Status of the whole chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    #[default]
    Planning,
    Executing,
    Verifying,
    WaitingUser,
    Complete,
    Failed,
}

impl ChainStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Planning => "📋",
            Self::Executing => "⚙️",
            Self::Verifying => "🧪",
            Self::WaitingUser => "👤",
            Self::Complete => "✅",
            Self::Failed => "❌",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::WaitingUser => "waiting_user",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "verifying" => Ok(Self::Verifying),
            "waiting_user" => Ok(Self::WaitingUser),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown chain status: {}", other)),
        }
    }
}

/// Execution mode. Informational only; the engine does not interpret it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    #[default]
    Safe,
    Autonomous,
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => f.write_str("safe"),
            Self::Autonomous => f.write_str("autonomous"),
        }
    }
}

impl FromStr for ChainMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(Self::Safe),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(format!("unknown chain mode: {}", other)),
        }
    }
}

/// Status of a per-step todo item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// Per-step checklist item, independent of the step's own status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTodo {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

impl StepTodo {
    pub fn pending(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            status: TodoStatus::Pending,
        }
    }

    /// Build pending todos with generated ids.
    pub fn from_contents<I, S>(contents: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        contents
            .into_iter()
            .map(|c| Self::pending(Uuid::new_v4().to_string(), c))
            .collect()
    }
}

/// Give every todo without an id a fresh one.
fn assign_todo_ids(mut todos: Vec<StepTodo>) -> Vec<StepTodo> {
    for todo in todos.iter_mut().filter(|t| t.id.is_empty()) {
        todo.id = Uuid::new_v4().to_string();
    }
    todos
}

/// One entry of a nested sub-plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStep {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: StepStatus,
}

/// Name/description pair used to define sub-steps and planned steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl StepDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A single step in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last active capability, display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<StepTodo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<SubStep>,
    #[serde(default)]
    pub sub_plan_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_plan_reason: Option<String>,
}

/// Caller-supplied fields for a new step. Id, status and retry count are
/// assigned by [`Chain::add_step`].
#[derive(Debug, Clone, Default)]
pub struct NewStep {
    pub name: String,
    pub description: String,
    pub tool: Option<String>,
    pub todos: Vec<StepTodo>,
}

impl NewStep {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_todos(mut self, todos: Vec<StepTodo>) -> Self {
        self.todos = todos;
        self
    }
}

/// The full agent chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub steps: Vec<Step>,
    pub current_step: usize,
    pub status: ChainStatus,
    pub mode: ChainMode,
}

impl Default for Chain {
    fn default() -> Self {
        Self::create(ChainMode::default())
    }
}

impl Chain {
    /// Create an empty chain in `planning`.
    pub fn create(mode: ChainMode) -> Self {
        Self {
            steps: Vec::new(),
            current_step: 0,
            status: ChainStatus::Planning,
            mode,
        }
    }

    /// The step at `current_step`, if in range.
    pub fn current(&self) -> Option<&Step> {
        self.steps.get(self.current_step)
    }

    #[must_use]
    pub fn add_step(&self, step: NewStep) -> Chain {
        let mut next = self.clone();
        next.steps.push(Step {
            id: Uuid::new_v4().to_string(),
            name: step.name,
            description: step.description,
            status: StepStatus::Pending,
            retry_count: 0,
            output: None,
            error: None,
            tool: step.tool,
            todos: assign_todo_ids(step.todos),
            sub_steps: Vec::new(),
            sub_plan_active: false,
            sub_plan_reason: None,
        });
        next
    }

    /// Set the current step's status. `tool` replaces the label only when given.
    #[must_use]
    pub fn update_step_status(&self, status: StepStatus, tool: Option<&str>) -> Chain {
        self.with_current(|step| {
            step.status = status;
            if let Some(tool) = tool {
                step.tool = Some(tool.to_string());
            }
        })
    }

    /// Mark the current step complete and advance. On the last step the
    /// chain completes and the index stays put.
    #[must_use]
    pub fn complete_step(&self, output: Option<&str>) -> Chain {
        let mut next = self.with_current(|step| {
            step.status = StepStatus::Complete;
            step.output = output.map(str::to_string);
        });

        if next.current_step + 1 >= next.steps.len() {
            next.status = ChainStatus::Complete;
        } else {
            next.current_step += 1;
            next.status = ChainStatus::Executing;
        }
        next
    }

    #[must_use]
    pub fn fail_step(&self, error: &str) -> Chain {
        let mut next = self.with_current(|step| {
            step.status = StepStatus::Failed;
            step.error = Some(error.to_string());
        });
        next.status = ChainStatus::Failed;
        next
    }

    #[must_use]
    pub fn retry_step(&self) -> Chain {
        let mut next = self.with_current(|step| {
            step.status = StepStatus::Retrying;
            step.retry_count += 1;
        });
        next.status = ChainStatus::Executing;
        next
    }

    /// True once the current step has been retried `max_retries` times.
    pub fn should_ask_user(&self, max_retries: u32) -> bool {
        self.current()
            .is_some_and(|step| step.retry_count >= max_retries)
    }

    #[must_use]
    pub fn wait_for_user(&self) -> Chain {
        Chain {
            status: ChainStatus::WaitingUser,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn start_execution(&self) -> Chain {
        Chain {
            status: ChainStatus::Executing,
            ..self.clone()
        }
    }

    /// Index of the first unfinished step at or after `current_step`.
    pub fn next_unfinished(&self) -> Option<usize> {
        self.steps
            .iter()
            .enumerate()
            .skip(self.current_step)
            .find(|(_, step)| !step.status.is_terminal())
            .map(|(index, _)| index)
    }

    /// Point at the next unfinished step and set the chain executing.
    /// Unchanged when no step at or after the current one is unfinished.
    #[must_use]
    pub fn resume_execution(&self) -> Chain {
        match self.next_unfinished() {
            Some(index) => Chain {
                current_step: index,
                status: ChainStatus::Executing,
                ..self.clone()
            },
            None => self.clone(),
        }
    }

    /// Replace the current step's todo list. Todos with an empty id get a
    /// generated one.
    #[must_use]
    pub fn set_todos(&self, todos: Vec<StepTodo>) -> Chain {
        let todos = assign_todo_ids(todos);
        self.with_current(|step| step.todos = todos)
    }

    #[must_use]
    pub fn mark_todo_done(&self, todo_index: usize) -> Chain {
        self.with_current(|step| {
            if let Some(todo) = step.todos.get_mut(todo_index) {
                todo.status = TodoStatus::Complete;
            }
        })
    }

    /// Set an arbitrary step's status, for parallel progress display.
    #[must_use]
    pub fn update_step_by_index(&self, index: usize, status: StepStatus) -> Chain {
        self.with_step(index, |step| step.status = status)
    }

    /// Attach a nested sub-plan to `steps[step_index]`. The first sub-step
    /// starts `running`, the rest `pending`.
    #[must_use]
    pub fn start_sub_plan(&self, step_index: usize, reason: &str, defs: &[StepDef]) -> Chain {
        self.with_step(step_index, |step| {
            step.sub_steps = defs
                .iter()
                .enumerate()
                .map(|(i, def)| SubStep {
                    id: Uuid::new_v4().to_string(),
                    name: def.name.clone(),
                    description: def.description.clone(),
                    status: if i == 0 {
                        StepStatus::Running
                    } else {
                        StepStatus::Pending
                    },
                })
                .collect();
            step.sub_plan_active = true;
            step.sub_plan_reason = Some(reason.to_string());
        })
    }

    /// Close the sub-plan on `steps[step_index]`, settling every
    /// non-terminal sub-step to match `success`.
    #[must_use]
    pub fn end_sub_plan(&self, step_index: usize, success: bool) -> Chain {
        let settled = if success {
            StepStatus::Complete
        } else {
            StepStatus::Failed
        };
        self.with_step(step_index, |step| {
            for sub in step.sub_steps.iter_mut().filter(|s| !s.status.is_terminal()) {
                sub.status = settled;
            }
            step.sub_plan_active = false;
        })
    }

    /// Human-readable rendering for logs and diagnostics.
    pub fn format(&self) -> String {
        let mut lines = vec![
            format!("{} Task Chain ({})", self.status.icon(), self.status),
            String::new(),
        ];

        for (i, step) in self.steps.iter().enumerate() {
            let current = if i == self.current_step { " ← current" } else { "" };
            lines.push(format!("{}. {} {}{}", i + 1, step.status.icon(), step.name, current));
            if !step.description.is_empty() {
                lines.push(format!("   {}", step.description));
            }
            if step.sub_plan_active {
                for sub in &step.sub_steps {
                    lines.push(format!("     ↳ {} {}", sub.status.icon(), sub.name));
                }
            }
        }

        lines.join("\n")
    }

    fn with_current(&self, f: impl FnOnce(&mut Step)) -> Chain {
        self.with_step(self.current_step, f)
    }

    fn with_step(&self, index: usize, f: impl FnOnce(&mut Step)) -> Chain {
        let mut next = self.clone();
        if let Some(step) = next.steps.get_mut(index) {
            f(step);
        }
        next
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}
