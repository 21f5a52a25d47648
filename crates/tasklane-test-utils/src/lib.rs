//! Mocks and fixtures shared by the Tasklane test suites.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use tasklane_core::config::ModelConfig;
use tasklane_core::error::{Result, TasklaneError};
use tasklane_core::event::EventBus;
use tasklane_core::traits::{EventPublisher, LlmClient, PromptExecutor, SessionBackend};
use tasklane_core::types::{AgentEvent, ChainEvent, ChatMessage, SessionId, StopReason, StreamDelta};

/// A model config pointing nowhere; only the mocks below accept it.
pub fn model_config() -> ModelConfig {
    ModelConfig {
        provider: "openai".to_string(),
        model_id: "test-model".to_string(),
        api_key: None,
        base_url: Some("http://127.0.0.1:1/v1/chat/completions".to_string()),
        max_tokens: 256,
        temperature: 0.0,
        retry: None,
        extra_headers: HashMap::new(),
    }
}

/// Write `content` to a named temp file with the given suffix (e.g. ".toml").
pub fn temp_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

/// Collect every event currently buffered on a receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum LlmOutcome {
    Chunks(Vec<String>),
    Fail(String),
}

/// An `LlmClient` that plays back scripted outcomes in order.
/// The last outcome repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<LlmOutcome>>,
    calls: Arc<AtomicUsize>,
    last_messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, text: &str) -> Self {
        self.respond_chunks(&[text])
    }

    pub fn respond_chunks(self, chunks: &[&str]) -> Self {
        self.push(LlmOutcome::Chunks(chunks.iter().map(|c| c.to_string()).collect()))
    }

    /// Fail the request with `LlmRequest(message)`.
    pub fn fail_with(self, message: &str) -> Self {
        self.push(LlmOutcome::Fail(message.to_string()))
    }

    /// Shared counter of `chat_stream` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Messages passed to the most recent call.
    pub fn last_messages(&self) -> Arc<Mutex<Vec<ChatMessage>>> {
        self.last_messages.clone()
    }

    fn push(self, outcome: LlmOutcome) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    fn next_outcome(&self) -> Option<LlmOutcome> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages;
        let outcome = self.next_outcome();

        Box::pin(async move {
            match outcome {
                Some(LlmOutcome::Chunks(chunks)) => {
                    let mut deltas: Vec<Result<StreamDelta>> =
                        chunks.into_iter().map(|c| Ok(StreamDelta::TextDelta(c))).collect();
                    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
                    Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
                }
                Some(LlmOutcome::Fail(message)) => Err(TasklaneError::LlmRequest(message)),
                None => Err(TasklaneError::LlmRequest("no scripted response".into())),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Session backend
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum BackendOutcome {
    Reply(Vec<String>),
    SessionError(String),
    Reject(String),
}

/// A `SessionBackend` that answers each prompt by publishing scripted
/// session events on the bus, the way a real session would.
pub struct ScriptedBackend {
    bus: Arc<EventBus>,
    script: Mutex<VecDeque<BackendOutcome>>,
    noise: bool,
    burst: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            script: Mutex::new(VecDeque::new()),
            noise: false,
            burst: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: &str) -> Self {
        self.reply_chunks(&[text])
    }

    pub fn reply_chunks(self, chunks: &[&str]) -> Self {
        self.push(BackendOutcome::Reply(chunks.iter().map(|c| c.to_string()).collect()))
    }

    /// Accept the prompt, then publish `SessionError`.
    pub fn session_error(self, message: &str) -> Self {
        self.push(BackendOutcome::SessionError(message.to_string()))
    }

    /// Refuse the prompt outright.
    pub fn reject(self, message: &str) -> Self {
        self.push(BackendOutcome::Reject(message.to_string()))
    }

    /// Also publish events for an unrelated session around every reply.
    pub fn with_foreign_noise(mut self) -> Self {
        self.noise = true;
        self
    }

    /// Publish a whole reply without yielding, like a stream that is
    /// always ready.
    pub fn in_bursts(mut self) -> Self {
        self.burst = true;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn push(self, outcome: BackendOutcome) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    fn next_outcome(&self) -> BackendOutcome {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| BackendOutcome::Reply(Vec::new()))
        }
    }

    fn publish_noise(&self) {
        if self.noise {
            let other = SessionId::from_str("foreign-session");
            self.bus.publish(AgentEvent::TextDelta {
                session_id: other.clone(),
                text: "noise".into(),
            });
            self.bus.publish(AgentEvent::SessionIdle { session_id: other });
        }
    }
}

impl SessionBackend for ScriptedBackend {
    fn prompt(&self, session: &SessionId, text: String) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();
        Box::pin(async move {
            self.prompts.lock().unwrap().push(text);
            match self.next_outcome() {
                BackendOutcome::Reject(message) => Err(TasklaneError::Session {
                    session: session.to_string(),
                    message,
                }),
                BackendOutcome::SessionError(error) => {
                    self.publish_noise();
                    self.bus.publish(AgentEvent::SessionError {
                        session_id: session,
                        error,
                    });
                    Ok(())
                }
                BackendOutcome::Reply(chunks) => {
                    self.publish_noise();
                    for text in chunks {
                        self.bus.publish(AgentEvent::TextDelta {
                            session_id: session.clone(),
                            text,
                        });
                        if !self.burst {
                            tokio::task::yield_now().await;
                        }
                    }
                    self.bus.publish(AgentEvent::SessionIdle { session_id: session });
                    Ok(())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Prompt executor
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

/// A `PromptExecutor` answering by substring rules.
///
/// The first rule whose pattern occurs in the prompt answers. Registering
/// the same pattern again queues another reply; the last one repeats.
pub struct MockPromptExecutor {
    rules: Mutex<Vec<Rule>>,
    default_reply: String,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockPromptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPromptExecutor {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default_reply: "OK".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, pattern: &str, response: &str) -> Self {
        self.rule(pattern, Reply::Text(response.to_string()))
    }

    pub fn fail_on(self, pattern: &str, message: &str) -> Self {
        self.rule(pattern, Reply::Fail(message.to_string()))
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default_reply = response.to_string();
        self
    }

    /// Every prompt submitted so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn count_containing(&self, pattern: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(pattern))
            .count()
    }

    fn rule(self, pattern: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.pattern == pattern) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    pattern: pattern.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    fn answer(&self, text: &str) -> Reply {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if text.contains(&rule.pattern) {
                return if rule.replies.len() > 1 {
                    rule.replies.pop_front().unwrap()
                } else {
                    rule.replies[0].clone()
                };
            }
        }
        Reply::Text(self.default_reply.clone())
    }
}

impl PromptExecutor for MockPromptExecutor {
    fn submit<'a>(&'a self, session: &'a SessionId, text: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(text.to_string());
            match self.answer(text) {
                Reply::Text(response) => Ok(response),
                Reply::Fail(message) => Err(TasklaneError::Session {
                    session: session.to_string(),
                    message,
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Event publisher
// ---------------------------------------------------------------------------

/// An `EventPublisher` that keeps every chain event it receives.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ChainEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wire names of the recorded events, e.g. `chain-add-step`.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(ChainEvent::event_type)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish_chain(&self, event: ChainEvent) {
        self.events.lock().unwrap().push(event);
    }
}
