use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{debug, warn};

use tasklane_core::error::{Result, TasklaneError};
use tasklane_core::event::EventBus;
use tasklane_core::traits::{PromptExecutor, SessionBackend};
use tasklane_core::types::{AgentEvent, SessionId};

/// `PromptExecutor` over a session backend that reports through the bus.
///
/// Subscribes before submitting so no event of the exchange is missed, then
/// drives the submission and the collector together. Both are finished
/// before `submit` returns.
pub struct StreamingPromptExecutor {
    backend: Arc<dyn SessionBackend>,
    event_bus: Arc<EventBus>,
}

impl StreamingPromptExecutor {
    pub fn new(backend: Arc<dyn SessionBackend>, event_bus: Arc<EventBus>) -> Self {
        Self { backend, event_bus }
    }
}

impl PromptExecutor for StreamingPromptExecutor {
    fn submit<'a>(&'a self, session: &'a SessionId, text: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let mut rx = self.event_bus.subscribe();
            let mut submission = self.backend.prompt(session, text.to_string());
            let collector = collect_response(&mut rx, session);
            tokio::pin!(collector);

            tokio::select! {
                submitted = &mut submission => {
                    submitted?;
                    collector.await
                }
                collected = &mut collector => {
                    submission.await?;
                    collected
                }
            }
        })
    }
}

/// Accumulate text deltas for one session until it goes idle or errors.
///
/// A lagged receiver has lost deltas, so the exchange fails rather than
/// returning partial text.
async fn collect_response(rx: &mut Receiver<AgentEvent>, session: &SessionId) -> Result<String> {
    let mut response = String::new();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(session = %session, skipped, "Prompt collector lagged, events dropped");
                return Err(TasklaneError::LlmStream(format!("{} events dropped", skipped)));
            }
            Err(RecvError::Closed) => return Err(TasklaneError::StreamClosed(session.to_string())),
        };

        if event.session_id() != Some(session) {
            continue;
        }

        match event {
            AgentEvent::TextDelta { text, .. } => response.push_str(&text),
            AgentEvent::ToolStart { name, .. } => {
                debug!(session = %session, tool = %name, "Session tool started");
            }
            AgentEvent::UsageUpdate {
                input_tokens,
                output_tokens,
                ..
            } => {
                debug!(session = %session, input_tokens, output_tokens, "Session usage");
            }
            AgentEvent::SessionIdle { .. } => return Ok(response),
            AgentEvent::SessionError { error, .. } => {
                return Err(TasklaneError::Session {
                    session: session.to_string(),
                    message: error,
                });
            }
            AgentEvent::Chain(_) => {}
        }
    }
}
