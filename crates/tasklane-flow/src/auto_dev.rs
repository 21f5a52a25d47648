use tasklane_core::error::Result;

use crate::decision::DecisionPolicy;
use crate::edge::Edge;
use crate::flow::Flow;
use crate::node::Node;
use crate::predicate::Predicate;

/// The plan → select → execute → verify → debug loop for one request.
///
/// ```text
/// start → planner → selector → has_task_check ─NO→ end
///                      ↑              │YES
///                      │          executor → verifier → verify_check
///                      ├──────────────────────────PASS──────┘ │FAIL
///                      └──────────── debugger ←───────────────┘
/// ```
pub fn create_auto_dev_flow(request: &str) -> Result<Flow> {
    Flow::builder("Auto-Dev Loop")
        .description("Autonomous planning, execution, verification, and debugging loop")
        .version("2.0.0")
        .node(Node::start("start").with_label("Start Analysis"))
        .node(
            Node::task(
                "planner",
                format!(
                    "Analyze the user request: \"{}\".\nBreak this down into logical atomic steps.",
                    request
                ),
            )
            .with_label("Plan"),
        )
        .node(Node::selector("selector").with_description("Pick the next pending step"))
        .node(
            Node::decision("has_task_check", "Is there a current step being processed?")
                .with_choices(&["YES", "NO"])
                .with_policy(DecisionPolicy::local(Predicate::HasCurrentStep)),
        )
        .node(Node::execution("executor").with_label("Execute"))
        .node(Node::verification("verifier").with_label("Verify"))
        .node(
            Node::decision("verify_check", "Did the step pass verification?")
                .with_choices(&["PASS", "FAIL"])
                .with_policy(DecisionPolicy::ModelChoice),
        )
        .node(Node::debugger("debugger").with_label("Debug"))
        .node(Node::end("end"))
        .edge(Edge::new("start", "planner"))
        .edge(Edge::new("planner", "selector"))
        .edge(Edge::new("selector", "has_task_check"))
        .edge(
            Edge::new("has_task_check", "end")
                .when(Predicate::not(Predicate::HasCurrentStep))
                .with_label("NO"),
        )
        .edge(
            Edge::new("has_task_check", "executor")
                .when(Predicate::HasCurrentStep)
                .with_label("YES"),
        )
        .edge(Edge::new("executor", "verifier"))
        .edge(Edge::new("verifier", "verify_check"))
        .edge(Edge::new("verify_check", "selector").with_label("PASS"))
        .edge(Edge::new("verify_check", "debugger").with_label("FAIL"))
        .edge(Edge::new("debugger", "selector"))
        .start("start")
        .build()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::FlowContext;
    use crate::runner::{FlowOutcome, FlowRunner};
    use tasklane_core::chain::{ChainStatus, StepStatus};
    use tasklane_core::types::SessionId;
    use tasklane_test_utils::{MockPromptExecutor, RecordingPublisher};

    const PLAN: &str = "```json\n[{\"name\":\"Write parser\",\"description\":\"\"},{\"name\":\"Add tests\",\"description\":\"\"}]\n```";
    const VERIFY_Q: &str = "Did the step pass verification?";

    fn runner(executor: Arc<MockPromptExecutor>) -> FlowRunner {
        FlowRunner::new(
            create_auto_dev_flow("build a calculator").unwrap(),
            FlowContext::new(Arc::new(RecordingPublisher::new())),
            executor,
            SessionId::from_str("auto-dev"),
        )
    }

    #[test]
    fn test_flow_shape() {
        let flow = create_auto_dev_flow("x").unwrap();
        assert_eq!(flow.nodes.len(), 9);
        assert_eq!(flow.edges.len(), 10);
        assert_eq!(flow.start_node, "start");
        assert_eq!(flow.version, "2.0.0");
        assert!(flow.node("planner").is_some());
    }

    #[test]
    fn test_request_is_embedded_in_planner_prompt() {
        let flow = create_auto_dev_flow("add a --json flag").unwrap();
        let json = flow.to_json_pretty().unwrap();
        assert!(json.contains("add a --json flag"));
        assert!(json.contains("not(hasCurrentStep)"));
    }

    #[tokio::test]
    async fn test_empty_chain_check_resolves_no() {
        let flow = Flow::builder("check")
            .node(Node::start("start"))
            .node(
                Node::decision("has_task_check", "Is there a current step being processed?")
                    .with_policy(DecisionPolicy::local(Predicate::HasCurrentStep)),
            )
            .node(Node::end("end"))
            .edge(Edge::new("start", "has_task_check"))
            .edge(Edge::new("has_task_check", "end"))
            .build()
            .unwrap();
        let executor = Arc::new(MockPromptExecutor::new());
        let mut runner = FlowRunner::new(
            flow,
            FlowContext::new(Arc::new(RecordingPublisher::new())),
            executor.clone(),
            SessionId::from_str("s"),
        );

        runner.run().await.unwrap();
        assert_eq!(runner.last_decision_choice(), Some("NO"));
        // Local policy never asks the model.
        assert!(executor.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_happy_path_runs_every_step() {
        let executor = Arc::new(
            MockPromptExecutor::new()
                .on("JSON array", PLAN)
                .on(VERIFY_Q, "PASS"),
        );
        let mut runner = runner(executor.clone());

        let outcome = runner.run().await.unwrap();

        // start, planner, then (selector, check, executor, verifier, verify_check) x2,
        // then selector, check, end.
        assert_eq!(outcome, FlowOutcome::Ended { steps: 15 });
        let chain = runner.context().chain();
        assert_eq!(chain.status, ChainStatus::Complete);
        assert!(chain.steps.iter().all(|s| s.status == StepStatus::Complete));
        assert!(!runner.visited().contains(&"debugger".to_string()));
        assert_eq!(executor.count_containing(VERIFY_Q), 2);
    }

    #[tokio::test]
    async fn test_failed_verification_routes_through_debugger() {
        let executor = Arc::new(
            MockPromptExecutor::new()
                .on("JSON array", PLAN)
                .on(VERIFY_Q, "FAIL")
                .on(VERIFY_Q, "PASS"),
        );
        let mut runner = runner(executor.clone());

        runner.run().await.unwrap();

        let visited: Vec<&str> = runner.visited().iter().map(String::as_str).collect();
        let first_check = visited.iter().position(|n| *n == "verify_check").unwrap();
        assert_eq!(
            &visited[first_check..first_check + 4],
            &["verify_check", "debugger", "selector", "has_task_check"]
        );
        // Pending steps remained, so the loop went on to execute instead of ending.
        assert_eq!(visited[first_check + 4], "executor");

        let names: Vec<&str> = runner
            .context()
            .chain()
            .steps
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["Write parser", "Add tests", "Fix Issue"]);
        assert_eq!(runner.context().chain().status, ChainStatus::Complete);
        assert_eq!(visited.last(), Some(&"end"));
    }

    fn step_states(runner: &FlowRunner) -> Vec<(String, StepStatus)> {
        runner
            .context()
            .chain()
            .steps
            .iter()
            .map(|s| (s.name.clone(), s.status))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_verification_of_last_step_runs_fix() {
        let executor = Arc::new(
            MockPromptExecutor::new()
                .on("JSON array", "```json\n[{\"name\":\"Only\"}]\n```")
                .on(VERIFY_Q, "FAIL")
                .on(VERIFY_Q, "PASS"),
        );
        let mut runner = runner(executor.clone());

        let outcome = runner.run().await.unwrap();
        assert!(matches!(outcome, FlowOutcome::Ended { .. }));

        let visited: Vec<&str> = runner.visited().iter().map(String::as_str).collect();
        let debug = visited.iter().position(|n| *n == "debugger").unwrap();
        assert_eq!(
            &visited[debug..debug + 4],
            &["debugger", "selector", "has_task_check", "executor"]
        );
        assert_eq!(
            step_states(&runner),
            vec![
                ("Only".to_string(), StepStatus::Complete),
                ("Fix Issue".to_string(), StepStatus::Complete),
            ]
        );
        assert_eq!(runner.context().chain().status, ChainStatus::Complete);
        assert_eq!(executor.count_containing("Step: Fix Issue"), 1);
    }

    #[tokio::test]
    async fn test_execution_failure_then_fail_leaves_no_pending_work() {
        let executor = Arc::new(
            MockPromptExecutor::new()
                .on(
                    "JSON array",
                    "```json\n[{\"name\":\"Alpha\"},{\"name\":\"Beta\"}]\n```",
                )
                .fail_on("Step: Alpha", "tool crashed")
                .on(VERIFY_Q, "FAIL")
                .on(VERIFY_Q, "PASS"),
        );
        let mut runner = runner(executor);

        let outcome = runner.run().await.unwrap();
        assert!(matches!(outcome, FlowOutcome::Ended { .. }));

        assert_eq!(
            step_states(&runner),
            vec![
                ("Alpha".to_string(), StepStatus::Failed),
                ("Beta".to_string(), StepStatus::Complete),
                ("Fix Issue".to_string(), StepStatus::Complete),
            ]
        );
        let alpha = &runner.context().chain().steps[0];
        assert!(alpha.error.as_deref().unwrap().contains("tool crashed"));
    }

    #[tokio::test]
    async fn test_verification_response_visible_to_flow() {
        let executor = Arc::new(
            MockPromptExecutor::new()
                .on("JSON array", PLAN)
                .on("Review the work", "looks good")
                .on(VERIFY_Q, "PASS"),
        );
        let mut runner = runner(executor);
        runner.run().await.unwrap();
        assert_eq!(
            runner.context().get_str(crate::runner::VERIFICATION_VAR),
            Some("looks good")
        );
    }

    #[tokio::test]
    async fn test_endless_failures_hit_the_budget() {
        let executor = Arc::new(
            MockPromptExecutor::new()
                .on("JSON array", PLAN)
                .on(VERIFY_Q, "FAIL"),
        );
        let mut runner = runner(executor).with_max_steps(20);

        // Every FAIL adds a Fix Issue step, so work never runs out.
        let err = runner.run().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(runner.steps(), 20);
    }
}
