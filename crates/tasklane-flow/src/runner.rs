use std::sync::Arc;

use tracing::{debug, info, warn};

use tasklane_core::chain::{Step, StepStatus};
use tasklane_core::error::{Result, TasklaneError};
use tasklane_core::traits::PromptExecutor;
use tasklane_core::types::SessionId;

use crate::context::FlowContext;
use crate::decision::{choice_prompt, local_choice, match_choice, DecisionPolicy};
use crate::flow::Flow;
use crate::node::{Node, NodeKind};
use crate::plan::{default_plan, parse_plan, planning_prompt};

pub const DEFAULT_MAX_STEPS: usize = 50;
pub const DEFAULT_SUMMARY_CHARS: usize = 200;

/// Context variable holding the last verification response.
pub const VERIFICATION_VAR: &str = "verification";
/// Context variable holding the last full execution response.
pub const LAST_OUTPUT_VAR: &str = "last_output";

/// How a run ended without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Reached an `end` node.
    Ended { steps: usize },
    /// Stopped at a node with no outgoing edge.
    Halted { node_id: String, steps: usize },
}

/// Walks a flow from its start node, one node at a time.
///
/// Node handlers talk to the model through the `PromptExecutor` on a
/// single session and record progress in the `FlowContext`. Only a missing
/// node or an exhausted step budget fails the run.
pub struct FlowRunner {
    flow: Flow,
    context: FlowContext,
    executor: Arc<dyn PromptExecutor>,
    session: SessionId,
    current_node_id: String,
    steps: usize,
    max_steps: usize,
    summary_chars: usize,
    last_decision_choice: Option<String>,
    visited: Vec<String>,
}

impl FlowRunner {
    pub fn new(
        flow: Flow,
        context: FlowContext,
        executor: Arc<dyn PromptExecutor>,
        session: SessionId,
    ) -> Self {
        let current_node_id = flow.start_node.clone();
        Self {
            flow,
            context,
            executor,
            session,
            current_node_id,
            steps: 0,
            max_steps: DEFAULT_MAX_STEPS,
            summary_chars: DEFAULT_SUMMARY_CHARS,
            last_decision_choice: None,
            visited: Vec::new(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_summary_chars(mut self, chars: usize) -> Self {
        self.summary_chars = chars;
        self
    }

    pub fn context(&self) -> &FlowContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut FlowContext {
        &mut self.context
    }

    pub fn into_context(self) -> FlowContext {
        self.context
    }

    /// Nodes dispatched so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Node ids in dispatch order.
    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    pub fn last_decision_choice(&self) -> Option<&str> {
        self.last_decision_choice.as_deref()
    }

    pub async fn run(&mut self) -> Result<FlowOutcome> {
        info!(flow = %self.flow.name, max_steps = self.max_steps, "Starting flow execution");

        while self.steps < self.max_steps {
            self.steps += 1;

            let node = self
                .flow
                .node(&self.current_node_id)
                .cloned()
                .ok_or_else(|| TasklaneError::NodeNotFound(self.current_node_id.clone()))?;
            self.visited.push(node.id.clone());

            debug!(node_id = %node.id, kind = node.kind.name(), step = self.steps, "Executing node");

            if node.kind == NodeKind::End {
                info!(flow = %self.flow.name, steps = self.steps, "Flow finished");
                return Ok(FlowOutcome::Ended { steps: self.steps });
            }

            self.execute_node(&node).await;

            match self.find_next_node(&node) {
                Some(next) => self.current_node_id = next,
                None => {
                    warn!(node_id = %node.id, "No outgoing edge found, ending flow implicitly");
                    return Ok(FlowOutcome::Halted {
                        node_id: node.id,
                        steps: self.steps,
                    });
                }
            }
        }

        Err(TasklaneError::StepBudgetExceeded(self.max_steps))
    }

    async fn execute_node(&mut self, node: &Node) {
        match &node.kind {
            NodeKind::Start | NodeKind::End => {}
            NodeKind::Task { prompt } => self.run_task(node, prompt).await,
            NodeKind::Decision {
                prompt,
                choices,
                policy,
            } => {
                let choice = self.run_decision(node, prompt, choices, policy).await;
                self.last_decision_choice = Some(choice);
            }
            NodeKind::Selector { description } => self.run_selector(node, description.as_deref()),
            NodeKind::Execution { description } => {
                self.run_execution(node, description.as_deref()).await
            }
            NodeKind::Verification { checks } => self.run_verification(node, checks).await,
            NodeKind::Debugger { context } => self.run_debugger(node, context.as_deref()).await,
        }
    }

    async fn run_task(&mut self, node: &Node, prompt: &str) {
        info!(node_id = %node.id, "Planning");

        let plan = self
            .prompt(&planning_prompt(prompt))
            .await
            .and_then(|response| parse_plan(&response));
        let steps = plan.unwrap_or_else(|e| {
            warn!(node_id = %node.id, error = %e, "Plan unusable, falling back to default steps");
            default_plan()
        });

        for step in &steps {
            self.context.add_step(&step.name, &step.description);
        }
        info!(node_id = %node.id, steps = steps.len(), "Plan added to chain");
    }

    async fn run_decision(
        &mut self,
        node: &Node,
        prompt: &str,
        choices: &[String],
        policy: &DecisionPolicy,
    ) -> String {
        let choice = match policy {
            DecisionPolicy::LocalPredicate { predicate } => {
                local_choice(predicate.evaluate(&self.context), choices)
            }
            DecisionPolicy::ModelChoice => {
                match self.prompt(&choice_prompt(prompt, choices)).await {
                    Ok(response) => {
                        let (choice, matched) = match_choice(&response, choices);
                        if !matched {
                            warn!(node_id = %node.id, response = %response.trim(), "No choice matched, using first");
                        }
                        choice
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "Decision prompt failed, using first choice");
                        local_choice(true, choices)
                    }
                }
            }
        };

        info!(node_id = %node.id, choice = %choice, "Decision resolved");
        choice
    }

    fn run_selector(&self, node: &Node, description: Option<&str>) {
        match self.context.current_step() {
            Some(step) => info!(
                node_id = %node.id,
                step = %step.name,
                status = %step.status,
                "Selected next step"
            ),
            None => info!(node_id = %node.id, "No current step"),
        }
        if let Some(description) = description {
            debug!(node_id = %node.id, description, "Selector");
        }
    }

    async fn run_execution(&mut self, node: &Node, description: Option<&str>) {
        let Some(step) = self.context.current_step().cloned() else {
            debug!(node_id = %node.id, "No current step to execute");
            return;
        };

        info!(node_id = %node.id, step = %step.name, "Executing step");
        self.context.update_current_step_status(StepStatus::Running, None);

        match self.prompt(&execution_prompt(&step, description)).await {
            Ok(response) => {
                let summary = summarize(&response, self.summary_chars);
                self.context.set(LAST_OUTPUT_VAR, response);
                self.context.complete_current_step(Some(&summary));
                info!(step = %step.name, "Step complete");
            }
            Err(e) => {
                self.context.fail_current_step(&e.to_string());
                warn!(step = %step.name, error = %e, "Step failed");
            }
        }
    }

    async fn run_verification(&mut self, node: &Node, checks: &[String]) {
        info!(node_id = %node.id, "Verifying");
        match self.prompt(&verification_prompt(checks)).await {
            Ok(response) => self.context.set(VERIFICATION_VAR, response),
            Err(e) => warn!(node_id = %node.id, error = %e, "Verification prompt failed"),
        }
    }

    async fn run_debugger(&mut self, node: &Node, extra: Option<&str>) {
        warn!(node_id = %node.id, "Debugging failure");

        let failure = self
            .context
            .chain()
            .steps
            .iter()
            .rev()
            .find_map(|s| s.error.clone());
        if let Err(e) = self.prompt(&debugger_prompt(failure.as_deref(), extra)).await {
            warn!(node_id = %node.id, error = %e, "Debugger prompt failed");
        }

        self.context
            .add_step("Fix Issue", "Fix the detected error from previous step");
    }

    async fn prompt(&self, text: &str) -> Result<String> {
        self.executor.submit(&self.session, text).await
    }

    /// Next node id: first edge whose condition holds, then the edge
    /// labelled with the last decision's choice, then the first edge.
    fn find_next_node(&self, node: &Node) -> Option<String> {
        let edges = self.flow.outgoing(&node.id);

        match edges.as_slice() {
            [] => return None,
            [only] => return Some(only.to.clone()),
            _ => {}
        }

        for edge in &edges {
            if let Some(condition) = &edge.condition {
                let holds = condition.evaluate(&self.context);
                debug!(from = %edge.from, to = %edge.to, condition = %condition, holds, "Evaluated edge condition");
                if holds {
                    return Some(edge.to.clone());
                }
            }
        }

        if let Some(choice) = &self.last_decision_choice {
            if let Some(edge) = edges.iter().find(|e| e.label.as_ref() == Some(choice)) {
                return Some(edge.to.clone());
            }
        }

        edges.first().map(|e| e.to.clone())
    }
}

fn execution_prompt(step: &Step, description: Option<&str>) -> String {
    let mut prompt = format!("Execute this step of the plan.\n\nStep: {}\n", step.name);
    if !step.description.is_empty() {
        prompt.push_str(&format!("Details: {}\n", step.description));
    }
    if let Some(description) = description {
        prompt.push_str(&format!("Guidance: {}\n", description));
    }
    prompt.push_str("\nDo the work, then briefly summarize what you changed.");
    prompt
}

fn verification_prompt(checks: &[String]) -> String {
    let mut prompt = String::from(
        "Review the work from the latest step. Check it for errors, missing pieces, \
         and whether it does what the step asked.",
    );
    if !checks.is_empty() {
        prompt.push_str("\n\nChecklist:");
        for check in checks {
            prompt.push_str(&format!("\n- {}", check));
        }
    }
    prompt
}

fn debugger_prompt(failure: Option<&str>, extra: Option<&str>) -> String {
    let mut prompt =
        String::from("The previous step failed verification. Find the cause and fix it.");
    if let Some(failure) = failure {
        prompt.push_str(&format!("\n\nRecorded error: {}", failure));
    }
    if let Some(extra) = extra {
        prompt.push_str(&format!("\n\n{}", extra));
    }
    prompt
}

/// First `max_chars` characters of the trimmed text.
fn summarize(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionPolicy;
    use crate::edge::Edge;
    use crate::predicate::Predicate;
    use tasklane_core::chain::ChainStatus;
    use tasklane_test_utils::{MockPromptExecutor, RecordingPublisher};

    fn runner(flow: Flow, executor: MockPromptExecutor) -> (FlowRunner, Arc<MockPromptExecutor>) {
        let executor = Arc::new(executor);
        let context = FlowContext::new(Arc::new(RecordingPublisher::new()));
        let runner = FlowRunner::new(
            flow,
            context,
            executor.clone(),
            SessionId::from_str("test"),
        );
        (runner, executor)
    }

    #[tokio::test]
    async fn test_condition_beats_label() {
        let flow = Flow::builder("routing")
            .node(Node::start("start"))
            .node(
                Node::decision("d", "?")
                    .with_choices(&["PASS", "FAIL"])
                    .with_policy(DecisionPolicy::local(Predicate::True)),
            )
            .node(Node::end("X"))
            .node(Node::end("Y"))
            .node(Node::end("Z"))
            .edge(Edge::new("start", "d"))
            .edge(Edge::new("d", "Z").when(Predicate::False))
            .edge(Edge::new("d", "X").when(Predicate::True))
            .edge(Edge::new("d", "Y").with_label("PASS"))
            .build()
            .unwrap();

        let (mut runner, _) = runner(flow, MockPromptExecutor::new());
        let outcome = runner.run().await.unwrap();

        assert_eq!(runner.last_decision_choice(), Some("PASS"));
        assert_eq!(outcome, FlowOutcome::Ended { steps: 3 });
        assert_eq!(runner.visited().last().map(String::as_str), Some("X"));
    }

    #[tokio::test]
    async fn test_label_then_first_edge_fallback() {
        let flow = Flow::builder("labels")
            .node(Node::start("start"))
            .node(Node::decision("d", "Pick").with_choices(&["LEFT", "RIGHT"]))
            .node(Node::end("left"))
            .node(Node::end("right"))
            .edge(Edge::new("start", "d"))
            .edge(Edge::new("d", "left").with_label("LEFT"))
            .edge(Edge::new("d", "right").with_label("RIGHT"))
            .build()
            .unwrap();

        let (mut r, _) = runner(flow.clone(), MockPromptExecutor::new().on("Pick", "go right"));
        r.run().await.unwrap();
        assert_eq!(r.visited().last().map(String::as_str), Some("right"));

        // Unmatched answer resolves to the first choice.
        let (mut r, _) = runner(flow, MockPromptExecutor::new().on("Pick", "no idea"));
        r.run().await.unwrap();
        assert_eq!(r.last_decision_choice(), Some("LEFT"));
        assert_eq!(r.visited().last().map(String::as_str), Some("left"));
    }

    #[tokio::test]
    async fn test_cycle_exhausts_budget_after_exact_steps() {
        let flow = Flow::builder("loop")
            .node(Node::start("start"))
            .node(Node::selector("a"))
            .node(Node::selector("b"))
            .edge(Edge::new("start", "a"))
            .edge(Edge::new("a", "b"))
            .edge(Edge::new("b", "a"))
            .build()
            .unwrap();

        let (runner, _) = runner(flow, MockPromptExecutor::new());
        let mut runner = runner.with_max_steps(5);
        let err = runner.run().await.unwrap_err();

        assert!(matches!(err, TasklaneError::StepBudgetExceeded(5)));
        assert_eq!(err.to_string(), "Flow execution exceeded max steps (5)");
        assert_eq!(runner.steps(), 5);
        assert_eq!(runner.visited(), &["start", "a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_node_is_fatal() {
        let mut flow = Flow::builder("f")
            .node(Node::start("start"))
            .build()
            .unwrap();
        flow.start_node = "ghost".into();

        let (mut runner, _) = runner(flow, MockPromptExecutor::new());
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, TasklaneError::NodeNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_dead_end_halts_quietly() {
        let flow = Flow::builder("f")
            .node(Node::start("start"))
            .node(Node::selector("stuck"))
            .edge(Edge::new("start", "stuck"))
            .build()
            .unwrap();

        let (mut runner, _) = runner(flow, MockPromptExecutor::new());
        assert_eq!(
            runner.run().await.unwrap(),
            FlowOutcome::Halted {
                node_id: "stuck".into(),
                steps: 2
            }
        );
    }

    fn planner_flow() -> Flow {
        Flow::builder("plan")
            .node(Node::start("start"))
            .node(Node::task("planner", "Plan the work"))
            .node(Node::end("end"))
            .edge(Edge::new("start", "planner"))
            .edge(Edge::new("planner", "end"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_planner_without_fence_uses_default_steps() {
        let (mut runner, _) = runner(
            planner_flow(),
            MockPromptExecutor::new().on("Plan the work", "Sure! First analyze, then build."),
        );
        runner.run().await.unwrap();

        let names: Vec<&str> = runner
            .context()
            .chain()
            .steps
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["Analyze", "Implement", "Verify"]);
        assert_eq!(runner.context().chain().status, ChainStatus::Executing);
    }

    #[tokio::test]
    async fn test_planner_adds_parsed_steps() {
        let response = "```json\n[{\"name\":\"Scaffold\",\"description\":\"cargo new\"},{\"name\":\"Write parser\",\"description\":\"\"}]\n```";
        let (mut runner, executor) = runner(
            planner_flow(),
            MockPromptExecutor::new().on("Plan the work", response),
        );
        runner.run().await.unwrap();

        let chain = runner.context().chain();
        assert_eq!(chain.steps.len(), 2);
        assert_eq!(chain.steps[0].description, "cargo new");
        assert!(executor.prompts()[0].contains("JSON array"));
    }

    #[tokio::test]
    async fn test_planner_prompt_failure_falls_back() {
        let (mut runner, _) = runner(
            planner_flow(),
            MockPromptExecutor::new().fail_on("Plan the work", "backend down"),
        );
        assert!(runner.run().await.is_ok());
        assert_eq!(runner.context().chain().steps.len(), 3);
    }

    fn execution_flow() -> Flow {
        Flow::builder("exec")
            .node(Node::start("start"))
            .node(Node::execution("exec"))
            .node(Node::end("end"))
            .edge(Edge::new("start", "exec"))
            .edge(Edge::new("exec", "end"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execution_completes_with_truncated_summary() {
        let long = "x".repeat(500);
        let (mut runner, _) = runner(execution_flow(), MockPromptExecutor::new().on("Step: Build", &long));
        runner.context_mut().add_step("Build", "compile it");
        runner.context_mut().add_step("Ship", "");
        runner.run().await.unwrap();

        let chain = runner.context().chain();
        assert_eq!(chain.steps[0].status, StepStatus::Complete);
        assert_eq!(chain.steps[0].output.as_ref().map(|o| o.chars().count()), Some(200));
        assert_eq!(chain.current_step, 1);
        assert_eq!(runner.context().get_str(LAST_OUTPUT_VAR).map(str::len), Some(500));
    }

    #[tokio::test]
    async fn test_execution_failure_is_recorded_not_raised() {
        let (mut runner, _) = runner(
            execution_flow(),
            MockPromptExecutor::new().fail_on("Step: Build", "cancelled by user"),
        );
        runner.context_mut().add_step("Build", "");
        let outcome = runner.run().await.unwrap();

        assert_eq!(outcome, FlowOutcome::Ended { steps: 3 });
        let chain = runner.context().chain();
        assert_eq!(chain.status, ChainStatus::Failed);
        assert!(chain.steps[0].error.as_deref().unwrap().contains("cancelled by user"));
    }

    #[tokio::test]
    async fn test_execution_without_current_step_is_noop() {
        let (mut runner, executor) = runner(execution_flow(), MockPromptExecutor::new());
        runner.run().await.unwrap();
        assert!(executor.prompts().is_empty());
        assert!(runner.context().chain().steps.is_empty());
    }

    #[tokio::test]
    async fn test_verification_stores_response_and_debugger_adds_fix_step() {
        let flow = Flow::builder("vd")
            .node(Node::start("start"))
            .node(Node::verification("verify").with_checks(&["tests pass"]))
            .node(Node::debugger("debug").with_context("Prefer minimal changes."))
            .node(Node::end("end"))
            .edge(Edge::new("start", "verify"))
            .edge(Edge::new("verify", "debug"))
            .edge(Edge::new("debug", "end"))
            .build()
            .unwrap();

        let (mut runner, executor) = runner(
            flow,
            MockPromptExecutor::new()
                .on("Review the work", "FAIL: the parser panics")
                .on("previous step failed", "patched"),
        );
        runner.run().await.unwrap();

        assert_eq!(
            runner.context().get_str(VERIFICATION_VAR),
            Some("FAIL: the parser panics")
        );
        let steps = &runner.context().chain().steps;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "Fix Issue");

        let prompts = executor.prompts();
        assert!(prompts[0].contains("- tests pass"));
        assert!(prompts[1].contains("Prefer minimal changes."));
    }

    #[test]
    fn test_summarize_counts_chars() {
        assert_eq!(summarize("  héllo wörld  ", 5), "héllo");
        assert_eq!(summarize("short", 200), "short");
    }
}
