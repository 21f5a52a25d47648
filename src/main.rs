use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tasklane_core::chain::ChainMode;
use tasklane_core::config::AppConfig;
use tasklane_core::event::EventBus;
use tasklane_core::traits::{LlmClient, PromptExecutor};
use tasklane_core::types::{AgentEvent, ChainEvent, SessionId};
use tasklane_flow::{
    create_auto_dev_flow, Flow, FlowContext, FlowOutcome, FlowRunner, StreamingPromptExecutor,
};
use tasklane_llm::{create_client, LlmSessionBackend, RetryingClient};

const SYSTEM_PROMPT: &str = "You are a careful software engineer working through a task one \
step at a time. Follow the requested output format exactly.";

#[derive(Parser)]
#[command(name = "tasklane", version, about = "Plan, execute, verify and debug a request step by step")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tasklane.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the auto-dev loop for a request
    Run {
        /// What to build (prompted for when omitted)
        #[arg(trailing_var_arg = true)]
        request: Vec<String>,
        /// Node-dispatch budget, overriding `[flow] max_steps`
        #[arg(long)]
        max_steps: Option<usize>,
        /// Chain mode: safe or autonomous
        #[arg(long)]
        mode: Option<ChainMode>,
    },
    /// Print the auto-dev flow for a request as JSON
    Show {
        #[arg(trailing_var_arg = true)]
        request: Vec<String>,
    },
    /// Check a flow definition file (JSON or TOML)
    Validate {
        file: PathBuf,
    },
    /// Print the effective configuration, API keys masked
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tasklane=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "tasklane", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate(file),
        Commands::Show { request } => {
            let flow = create_auto_dev_flow(&request.join(" "))?;
            println!("{}", flow.to_json_pretty()?);
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::Run {
            request,
            max_steps,
            mode,
        } => {
            let request = if request.is_empty() {
                dialoguer::Input::<String>::new()
                    .with_prompt("What should be built?")
                    .interact_text()?
            } else {
                request.join(" ")
            };
            run(config, request, max_steps, mode).await?;
        }
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Show { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using environment defaults");
        Ok(AppConfig::from_env())
    }
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let flow = Flow::load(file)?;
    println!("{} v{}: {} nodes, {} edges", flow.name, flow.version, flow.nodes.len(), flow.edges.len());
    if !flow.description.is_empty() {
        println!("  {}", flow.description);
    }
    for node in flow.nodes.values() {
        let marker = if node.id == flow.start_node { "*" } else { " " };
        println!(" {} {:<20} {}", marker, node.id, node.kind.name());
    }
    for edge in &flow.edges {
        let mut line = format!("   {} -> {}", edge.from, edge.to);
        if let Some(label) = &edge.label {
            line.push_str(&format!(" [{}]", label));
        }
        if let Some(condition) = &edge.condition {
            line.push_str(&format!(" when {}", condition));
        }
        println!("{}", line);
    }
    Ok(())
}

fn build_llm(config: &AppConfig) -> Arc<dyn LlmClient> {
    let primary = create_client(&config.model);
    if config.fallback_models.is_empty() && config.model.retry.is_none() {
        return Arc::from(primary);
    }
    let retry_config = config.model.retry.clone().unwrap_or_default();
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fc| (fc.clone(), create_client(fc)))
        .collect();
    info!(
        fallbacks = config.fallback_models.len(),
        max_retries = retry_config.max_retries,
        "LLM retry enabled"
    );
    Arc::new(RetryingClient::new(primary, fallbacks, retry_config))
}

async fn run(
    config: AppConfig,
    request: String,
    max_steps: Option<usize>,
    mode: Option<ChainMode>,
) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::new(config.flow.event_capacity));
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl-C, cancelling model call");
        cancel_clone.cancel();
    });

    let backend = LlmSessionBackend::new(build_llm(&config), config.model.clone(), event_bus.clone())
        .with_system_prompt(SYSTEM_PROMPT)
        .with_cancellation(cancel);
    let executor: Arc<dyn PromptExecutor> =
        Arc::new(StreamingPromptExecutor::new(Arc::new(backend), event_bus.clone()));

    let session = SessionId::new();
    let printer_done = CancellationToken::new();
    let printer = spawn_printer(&event_bus, session.clone(), printer_done.clone());

    let mut context = FlowContext::new(event_bus.clone());
    context.set("request", request.clone());
    context.start_chain(mode.unwrap_or(config.flow.mode));
    context.add_step("Initial Analysis", &format!("Analyze the request: {}", request));

    let flow = create_auto_dev_flow(&request)?;
    let mut runner = FlowRunner::new(flow, context, executor, session)
        .with_max_steps(max_steps.unwrap_or(config.flow.max_steps))
        .with_summary_chars(config.flow.summary_chars);

    let result = runner.run().await;
    printer_done.cancel();
    printer.await.ok();

    println!("\n{}", runner.context().chain().format());

    match result {
        Ok(FlowOutcome::Ended { steps }) => {
            info!(steps, "Flow finished");
            Ok(())
        }
        Ok(FlowOutcome::Halted { node_id, steps }) => {
            warn!(node = %node_id, steps, "Flow halted before reaching an end node");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Flow aborted");
            Err(e.into())
        }
    }
}

/// Stream model text to stdout and chain progress to stderr.
///
/// Once `done` fires the printer drains what is already buffered and
/// exits, returning the number of events it printed. `recv` is polled
/// first, so `done` only wins on an empty buffer.
fn spawn_printer(event_bus: &EventBus, session: SessionId, done: CancellationToken) -> JoinHandle<usize> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        let mut printed = 0;
        loop {
            let received = tokio::select! {
                biased;
                received = rx.recv() => received,
                _ = done.cancelled() => break,
            };
            let event = match received {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            if print_event(event, &session) {
                printed += 1;
            }
        }
        printed
    })
}

fn print_event(event: AgentEvent, session: &SessionId) -> bool {
    match event {
        AgentEvent::TextDelta { session_id, text } if &session_id == session => {
            print!("{}", text);
            std::io::stdout().flush().ok();
        }
        AgentEvent::ToolStart { name, .. } => eprintln!("\n[tool: {}]", name),
        AgentEvent::SessionIdle { session_id } if &session_id == session => println!(),
        AgentEvent::SessionError { error, .. } => eprintln!("\n[error: {}]", error),
        AgentEvent::Chain(event) => match describe(&event) {
            Some(line) => eprintln!("{}", line),
            None => return false,
        },
        _ => return false,
    }
    true
}

fn describe(event: &ChainEvent) -> Option<String> {
    let line = match event {
        ChainEvent::Start { mode } => format!("[chain] started ({})", mode),
        ChainEvent::AddStep { name, .. } => format!("[chain] + {}", name),
        ChainEvent::UpdateStep { status, .. } => format!("[chain] step {}", status),
        ChainEvent::CompleteStep { .. } => "[chain] step complete".to_string(),
        ChainEvent::FailStep { error } => format!("[chain] step failed: {}", truncate(error, 120)),
        ChainEvent::Clear => "[chain] cleared".to_string(),
        ChainEvent::StartExecution { step_index } => {
            format!("[chain] executing from step {}", step_index + 1)
        }
        ChainEvent::SubPlanStart { step_index, reason, .. } => {
            format!("[chain] sub-plan for step {}: {}", step_index + 1, reason)
        }
        ChainEvent::SubPlanEnd { step_index, success } => format!(
            "[chain] sub-plan for step {} {}",
            step_index + 1,
            if *success { "succeeded" } else { "failed" }
        ),
        ChainEvent::SetTodos { .. } | ChainEvent::TodoDone { .. } | ChainEvent::ParallelUpdate { .. } => {
            return None
        }
    };
    Some(line)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_printer_drains_buffered_events_before_exit() {
        let bus = EventBus::new(64);
        let done = CancellationToken::new();
        let printer = spawn_printer(&bus, SessionId::from_str("main"), done.clone());

        bus.publish(AgentEvent::Chain(ChainEvent::Start {
            mode: ChainMode::Safe,
        }));
        bus.publish(AgentEvent::Chain(ChainEvent::AddStep {
            name: "Analyze".into(),
            description: String::new(),
            todos: Vec::new(),
        }));
        bus.publish(AgentEvent::Chain(ChainEvent::CompleteStep { output: None }));
        done.cancel();

        let printed = tokio::time::timeout(Duration::from_secs(5), printer)
            .await
            .expect("printer did not exit")
            .unwrap();
        assert_eq!(printed, 3);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
