use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Multi-provider streaming LLM client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// One-way chain progress notification. Fire-and-forget: implementations
/// must not block and the caller never waits on subscribers.
pub trait EventPublisher: Send + Sync {
    fn publish_chain(&self, event: ChainEvent);
}

/// Session backend: accepts a prompt for a session and reports progress
/// only through session-scoped events on the bus (`TextDelta`, `ToolStart`,
/// then `SessionIdle` or `SessionError`).
pub trait SessionBackend: Send + Sync + 'static {
    /// Submit a prompt. Resolves once the submission is accepted or has
    /// finished; the response itself arrives as events.
    fn prompt(&self, session: &SessionId, text: String) -> BoxFuture<'_, Result<()>>;
}

/// Prompt execution: submit text to a session and get the accumulated
/// response text back.
pub trait PromptExecutor: Send + Sync {
    fn submit<'a>(&'a self, session: &'a SessionId, text: &'a str) -> BoxFuture<'a, Result<String>>;
}
