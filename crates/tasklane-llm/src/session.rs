use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tasklane_core::config::ModelConfig;
use tasklane_core::error::{Result, TasklaneError};
use tasklane_core::event::EventBus;
use tasklane_core::traits::{LlmClient, SessionBackend};
use tasklane_core::types::{AgentEvent, ChatMessage, SessionId, StreamDelta};

/// Session backend that answers prompts with a streaming LLM call.
///
/// Keeps one conversation per session so later prompts see earlier
/// exchanges. Progress and the outcome are reported only as events on the
/// bus; `prompt` itself succeeds once the exchange is over.
pub struct LlmSessionBackend {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    event_bus: Arc<EventBus>,
    system_prompt: Option<String>,
    cancel: CancellationToken,
    history: Mutex<HashMap<SessionId, Vec<ChatMessage>>>,
}

impl LlmSessionBackend {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            llm,
            config,
            event_bus,
            system_prompt: None,
            cancel: CancellationToken::new(),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Cancelling the token aborts the in-flight exchange with a
    /// `SessionError` and fails every later prompt the same way.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Conversation recorded for a session so far.
    pub fn history(&self, session: &SessionId) -> Vec<ChatMessage> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, session: &SessionId, message: ChatMessage) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session.clone())
            .or_default()
            .push(message);
    }

    async fn stream_reply(&self, session: &SessionId, messages: Vec<ChatMessage>) -> Result<String> {
        let mut stream = self.llm.chat_stream(&self.config, messages).await?;
        let mut reply = String::new();

        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(text) => {
                    reply.push_str(&text);
                    self.event_bus.publish(AgentEvent::TextDelta {
                        session_id: session.clone(),
                        text,
                    });
                }
                StreamDelta::ToolUseStart { name, .. } => {
                    self.event_bus.publish(AgentEvent::ToolStart {
                        session_id: session.clone(),
                        name,
                    });
                }
                StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    self.event_bus.publish(AgentEvent::UsageUpdate {
                        session_id: session.clone(),
                        input_tokens,
                        output_tokens,
                    });
                }
                StreamDelta::Stop(reason) => {
                    debug!(session = %session, ?reason, "Model stopped");
                }
            }
        }

        Ok(reply)
    }
}

impl SessionBackend for LlmSessionBackend {
    fn prompt(&self, session: &SessionId, text: String) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();

        Box::pin(async move {
            self.record(&session, ChatMessage::user(text));

            let mut messages = Vec::new();
            if let Some(system) = &self.system_prompt {
                messages.push(ChatMessage::system(system.clone()));
            }
            messages.extend(self.history(&session));

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => Err(TasklaneError::Cancelled),
                reply = self.stream_reply(&session, messages) => reply,
            };

            match outcome {
                Ok(reply) => {
                    self.record(&session, ChatMessage::assistant(reply));
                    self.event_bus.publish(AgentEvent::SessionIdle {
                        session_id: session,
                    });
                }
                Err(e) => {
                    warn!(session = %session, error = %e, "Session prompt failed");
                    self.event_bus.publish(AgentEvent::SessionError {
                        session_id: session,
                        error: e.to_string(),
                    });
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::types::Role;
    use tasklane_test_utils::{drain_events, model_config, ScriptedLlm};

    fn backend(llm: ScriptedLlm, bus: &Arc<EventBus>) -> LlmSessionBackend {
        LlmSessionBackend::new(Arc::new(llm), model_config(), bus.clone())
    }

    #[tokio::test]
    async fn test_streams_deltas_then_idle() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let session = SessionId::from_str("s1");
        let backend = backend(ScriptedLlm::new().respond_chunks(&["Hel", "lo"]), &bus);

        backend.prompt(&session, "hi".into()).await.unwrap();

        let events = drain_events(&mut rx);
        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Hel", "lo"]);
        assert!(matches!(events.last(), Some(AgentEvent::SessionIdle { session_id }) if *session_id == session));
    }

    #[tokio::test]
    async fn test_failure_becomes_session_error() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let session = SessionId::from_str("s2");
        let backend = backend(ScriptedLlm::new().fail_with("HTTP 500: down"), &bus);

        assert!(backend.prompt(&session, "hi".into()).await.is_ok());

        let events = drain_events(&mut rx);
        match events.last() {
            Some(AgentEvent::SessionError { error, .. }) => assert!(error.contains("HTTP 500")),
            other => panic!("expected SessionError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_accumulates_per_session() {
        let bus = Arc::new(EventBus::default());
        let llm = ScriptedLlm::new().respond("first").respond("second");
        let seen = llm.last_messages();
        let backend = backend(llm, &bus).with_system_prompt("be terse");
        let session = SessionId::from_str("s3");

        backend.prompt(&session, "one".into()).await.unwrap();
        backend.prompt(&session, "two".into()).await.unwrap();

        let history = backend.history(&session);
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text, "first");

        let last_request = seen.lock().unwrap().clone();
        assert_eq!(last_request.len(), 4);
        assert_eq!(last_request[0].role, Role::System);
        assert_eq!(last_request[3].text, "two");

        assert!(backend.history(&SessionId::from_str("other")).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_prompt_reports_error() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let backend = backend(ScriptedLlm::new().respond("never"), &bus).with_cancellation(cancel);

        backend.prompt(&SessionId::from_str("s4"), "hi".into()).await.unwrap();

        let events = drain_events(&mut rx);
        assert!(matches!(
            events.last(),
            Some(AgentEvent::SessionError { error, .. }) if error == "Cancelled"
        ));
    }
}
