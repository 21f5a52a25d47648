use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use tasklane_core::chain::{
    Chain, ChainMode, ChainStatus, NewStep, Step, StepDef, StepStatus, StepTodo,
};
use tasklane_core::traits::EventPublisher;
use tasklane_core::types::ChainEvent;

/// Session-scoped state shared by node handlers: one chain plus a
/// free-form variable bag.
///
/// Every chain mutation goes through here and is published as a
/// `ChainEvent`, so observers that replay the events see the same chain.
pub struct FlowContext {
    chain: Chain,
    variables: HashMap<String, Value>,
    publisher: Arc<dyn EventPublisher>,
}

impl FlowContext {
    /// Empty autonomous chain, no variables.
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            chain: Chain::create(ChainMode::Autonomous),
            variables: HashMap::new(),
            publisher,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    // -- Variables ---------------------------------------------------------

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.variables.get(key).and_then(|v| v.as_str())
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    // -- Chain -------------------------------------------------------------

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Replace the chain with an empty one.
    pub fn start_chain(&mut self, mode: ChainMode) {
        self.chain = Chain::create(mode);
        self.emit(ChainEvent::Start { mode });
    }

    /// Bulk-replace the chain, replaying it as clear, start and one
    /// add-step per existing step.
    pub fn set_chain(&mut self, chain: Chain) {
        self.emit(ChainEvent::Clear);
        self.emit(ChainEvent::Start { mode: chain.mode });
        for step in &chain.steps {
            self.emit(ChainEvent::AddStep {
                name: step.name.clone(),
                description: step.description.clone(),
                todos: step.todos.clone(),
            });
        }
        self.chain = chain;
    }

    /// Reset to an empty chain in the same mode.
    pub fn clear(&mut self) {
        self.chain = Chain::create(self.chain.mode);
        self.emit(ChainEvent::Clear);
    }

    pub fn add_step(&mut self, name: &str, description: &str) -> Step {
        self.add_step_with(NewStep::new(name, description))
    }

    /// Append a step.
    ///
    /// When the chain has no active step (still planning, finished, or its
    /// current step already completed or failed) execution resumes at the
    /// first unfinished step, so the new work is picked up.
    pub fn add_step_with(&mut self, step: NewStep) -> Step {
        let idle = self.chain.status == ChainStatus::Planning || self.current_step().is_none();

        self.chain = self.chain.add_step(step);
        let added = self.chain.steps.len() - 1;
        let step = self.chain.steps[added].clone();
        self.emit(ChainEvent::AddStep {
            name: step.name.clone(),
            description: step.description.clone(),
            todos: step.todos.clone(),
        });

        if idle {
            self.chain = self.chain.resume_execution();
            self.emit(ChainEvent::StartExecution {
                step_index: self.chain.current_step,
            });
        }

        step
    }

    /// The step under execution, or `None` once the chain is finished or
    /// the current step itself already completed or failed.
    pub fn current_step(&self) -> Option<&Step> {
        if self.chain.status.is_terminal() {
            return None;
        }
        self.chain
            .current()
            .filter(|step| !step.status.is_terminal())
    }

    pub fn complete_current_step(&mut self, output: Option<&str>) {
        self.chain = self.chain.complete_step(output);
        self.emit(ChainEvent::CompleteStep {
            output: output.map(str::to_string),
        });
    }

    pub fn fail_current_step(&mut self, error: &str) {
        self.chain = self.chain.fail_step(error);
        self.emit(ChainEvent::FailStep {
            error: error.to_string(),
        });
    }

    pub fn update_current_step_status(&mut self, status: StepStatus, tool: Option<&str>) {
        self.chain = self.chain.update_step_status(status, tool);
        self.emit(ChainEvent::UpdateStep {
            status,
            tool: tool.map(str::to_string),
        });
    }

    pub fn retry_current_step(&mut self) {
        self.chain = self.chain.retry_step();
        self.emit(ChainEvent::UpdateStep {
            status: StepStatus::Retrying,
            tool: None,
        });
    }

    pub fn should_ask_user(&self, max_retries: u32) -> bool {
        self.chain.should_ask_user(max_retries)
    }

    /// Pause for user input. Chain status only; no event type covers it.
    pub fn wait_for_user(&mut self) {
        self.chain = self.chain.wait_for_user();
        debug!(status = %ChainStatus::WaitingUser, "Chain waiting for user");
    }

    pub fn set_current_todos(&mut self, todos: Vec<StepTodo>) {
        self.chain = self.chain.set_todos(todos.clone());
        self.emit(ChainEvent::SetTodos { todos });
    }

    pub fn complete_todo(&mut self, todo_index: usize) {
        self.chain = self.chain.mark_todo_done(todo_index);
        self.emit(ChainEvent::TodoDone { todo_index });
    }

    pub fn start_sub_plan(&mut self, step_index: usize, reason: &str, steps: Vec<StepDef>) {
        self.chain = self.chain.start_sub_plan(step_index, reason, &steps);
        self.emit(ChainEvent::SubPlanStart {
            step_index,
            reason: reason.to_string(),
            steps,
        });
    }

    pub fn end_sub_plan(&mut self, step_index: usize, success: bool) {
        self.chain = self.chain.end_sub_plan(step_index, success);
        self.emit(ChainEvent::SubPlanEnd {
            step_index,
            success,
        });
    }

    pub fn update_step_by_index(&mut self, step_index: usize, status: StepStatus) {
        self.chain = self.chain.update_step_by_index(step_index, status);
        self.emit(ChainEvent::ParallelUpdate { step_index, status });
    }

    fn emit(&self, event: ChainEvent) {
        self.publisher.publish_chain(event);
    }
}
