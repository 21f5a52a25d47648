pub mod openai;
pub mod retry;
pub mod session;
pub mod streaming;

use tasklane_core::config::ModelConfig;
use tasklane_core::traits::LlmClient;

pub use openai::OpenAiClient;
pub use retry::RetryingClient;
pub use session::LlmSessionBackend;

/// Create an LLM client for the configured provider.
///
/// Every supported provider (OpenAI, Ollama, vLLM, Groq, OpenRouter, ...)
/// speaks the OpenAI chat-completions dialect.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    tracing::debug!(provider = %config.provider, model = %config.model_id, "Creating LLM client");
    Box::new(OpenAiClient::new())
}
