//! Model worker abstraction and implementations
//!
//! The pipeline talks to inference providers only through [`ModelWorker`]:
//! a prompt (and optional image) in, text plus token/latency metadata out.
//!
//! - [`OpenAiWorker`]: OpenAI chat completions, also Groq and Ollama via
//!   their OpenAI-compatible endpoints
//! - [`AnthropicWorker`]: Anthropic messages API
//! - [`ProviderDispatch`]: routes each call to the worker for its provider
//! - [`ScriptedWorker`]: canned replies for tests and offline runs
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: required by [`OpenAiWorker::openai_from_env`]
//! - `GROQ_API_KEY`: required by [`OpenAiWorker::groq_from_env`]
//! - `ANTHROPIC_API_KEY`: required by [`AnthropicWorker::from_env`]
//! - `OLLAMA_URL`: Ollama base URL (default: http://localhost:11434/v1)

use crate::catalog::Provider;
use crate::prompts::UseCase;
use crate::PipelineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// Provider hosting `model_id`.
    pub provider: Provider,
    /// Provider-facing model id.
    pub model_id: String,
    /// Prompt purpose, for logging and test doubles.
    pub use_case: UseCase,
    /// System message.
    pub system: String,
    /// User message.
    pub prompt: String,
    /// Image URL (http(s) or `data:`) when the submission carries one.
    pub image_url: Option<String>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Bounded wait for this call.
    pub timeout: Duration,
    /// Ask the provider for JSON-mode output when it supports it.
    pub json_mode: bool,
}

/// Model answer with metering metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    /// Raw completion text.
    pub text: String,
    /// Prompt tokens billed.
    pub tokens_in: u64,
    /// Completion tokens billed.
    pub tokens_out: u64,
    /// Wall-clock latency of the call.
    pub latency: Duration,
}

/// Why a model call failed.
///
/// These details are logged, never handed to pipeline callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeError {
    /// Connection, TLS, DNS or body-decoding failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Provider returned a non-success status other than 429.
    #[error("provider returned {status}: {message}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Provider error body, truncated.
        message: String,
    },
    /// HTTP 429 from the provider.
    #[error("rate limited by provider")]
    RateLimited {
        /// Parsed `retry-after` header, if present.
        retry_after: Option<Duration>,
    },
    /// The call exceeded its bounded wait.
    #[error("model call timed out")]
    Timeout,
    /// No worker is registered for the model's provider.
    #[error("no worker registered for provider `{0}`")]
    NoWorker(Provider),
}

impl InvokeError {
    /// Whether the failure is worth the single transport retry: connection
    /// trouble or a 5xx from the provider.
    pub fn is_transport(&self) -> bool {
        match self {
            InvokeError::Transport(_) => true,
            InvokeError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Map a `reqwest` failure, separating timeouts from other transport errors.
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InvokeError::Timeout
        } else {
            InvokeError::Transport(e.to_string())
        }
    }
}

/// Trait for model inference workers
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn ModelWorker>`.
#[async_trait]
pub trait ModelWorker: Send + Sync {
    /// Perform one model call.
    async fn invoke(&self, request: &InvocationRequest) -> Result<ModelResponse, InvokeError>;
}

/// Call `worker` and give up after `request.timeout`, whatever the worker
/// does with its own timeout.
pub async fn invoke_bounded(
    worker: &dyn ModelWorker,
    request: &InvocationRequest,
) -> Result<ModelResponse, InvokeError> {
    match tokio::time::timeout(request.timeout, worker.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(InvokeError::Timeout),
    }
}

/// Turn a non-success HTTP response into an [`InvokeError`].
async fn error_from_status(response: reqwest::Response) -> InvokeError {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return InvokeError::RateLimited { retry_after };
    }
    let message: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(512)
        .collect();
    InvokeError::Provider {
        status: status.as_u16(),
        message,
    }
}

// ============================================================================
// OpenAI-compatible Worker
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat-completions worker for OpenAI and OpenAI-compatible servers.
///
/// ## Example
///
/// ```no_run
/// use nutriwealth_pipeline::worker::OpenAiWorker;
///
/// let worker = OpenAiWorker::new("https://api.openai.com/v1", Some("sk-...".into()))
///     .with_temperature(0.1);
/// ```
pub struct OpenAiWorker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiWorker {
    /// Worker for `base_url` (without the `/chat/completions` suffix).
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            temperature: 0.1,
        }
    }

    /// OpenAI worker keyed by `OPENAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if the variable is unset.
    pub fn openai_from_env() -> Result<Self, PipelineError> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Ok(Self::new("https://api.openai.com/v1", Some(key)))
    }

    /// Groq worker keyed by `GROQ_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if the variable is unset.
    pub fn groq_from_env() -> Result<Self, PipelineError> {
        let key = std::env::var("GROQ_API_KEY")
            .map_err(|_| PipelineError::Config("GROQ_API_KEY environment variable not set".into()))?;
        Ok(Self::new("https://api.groq.com/openai/v1", Some(key)))
    }

    /// Ollama worker at `OLLAMA_URL` (default `http://localhost:11434/v1`).
    pub fn ollama_from_env() -> Self {
        let url = std::env::var("OLLAMA_URL")
            .unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
        Self::new(url, None)
    }

    /// Set sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn body(&self, request: &InvocationRequest) -> serde_json::Value {
        let user_content = match &request.image_url {
            Some(url) => json!([
                { "type": "text", "text": request.prompt },
                { "type": "image_url", "image_url": { "url": url } }
            ]),
            None => json!(request.prompt),
        };
        let mut body = json!({
            "model": request.model_id,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content }
            ],
            "max_tokens": request.max_tokens,
            "temperature": self.temperature,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl ModelWorker for OpenAiWorker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<ModelResponse, InvokeError> {
        let started = Instant::now();
        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(request.timeout)
            .json(&self.body(request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(InvokeError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }

        let parsed: ChatResponse = response.json().await.map_err(InvokeError::from_reqwest)?;
        let usage = parsed.usage.unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InvokeError::Transport("no choices in completion response".into()))?;

        Ok(ModelResponse {
            text,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            latency: started.elapsed(),
        })
    }
}

// ============================================================================
// Anthropic Worker
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<MessagesBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct MessagesBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Anthropic messages API worker.
pub struct AnthropicWorker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicWorker {
    /// Worker for `base_url` (e.g. `https://api.anthropic.com`).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Worker keyed by `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if the variable is unset.
    pub fn from_env() -> Result<Self, PipelineError> {
        let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            PipelineError::Config("ANTHROPIC_API_KEY environment variable not set".into())
        })?;
        Ok(Self::new("https://api.anthropic.com", key))
    }

    fn image_block(url: &str) -> serde_json::Value {
        // data:<media>;base64,<payload>
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((media_type, data)) = rest.split_once(";base64,") {
                return json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": media_type, "data": data }
                });
            }
        }
        json!({ "type": "image", "source": { "type": "url", "url": url } })
    }
}

#[async_trait]
impl ModelWorker for AnthropicWorker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<ModelResponse, InvokeError> {
        let started = Instant::now();
        let mut content = Vec::new();
        if let Some(url) = &request.image_url {
            content.push(Self::image_block(url));
        }
        content.push(json!({ "type": "text", "text": request.prompt }));

        let body = json!({
            "model": request.model_id,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": [{ "role": "user", "content": content }],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(InvokeError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }

        let parsed: MessagesResponse = response.json().await.map_err(InvokeError::from_reqwest)?;
        let usage = parsed.usage.unwrap_or_default();
        let text: String = parsed.content.into_iter().filter_map(|b| b.text).collect();

        Ok(ModelResponse {
            text,
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            latency: started.elapsed(),
        })
    }
}

// ============================================================================
// Provider dispatch
// ============================================================================

/// Routes each call to the worker registered for the request's provider.
#[derive(Default, Clone)]
pub struct ProviderDispatch {
    workers: HashMap<Provider, Arc<dyn ModelWorker>>,
}

impl ProviderDispatch {
    /// Empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the worker for `provider`, replacing any previous one.
    pub fn with(mut self, provider: Provider, worker: Arc<dyn ModelWorker>) -> Self {
        self.workers.insert(provider, worker);
        self
    }

    /// Providers with a registered worker.
    pub fn providers(&self) -> impl Iterator<Item = Provider> + '_ {
        self.workers.keys().copied()
    }
}

#[async_trait]
impl ModelWorker for ProviderDispatch {
    async fn invoke(&self, request: &InvocationRequest) -> Result<ModelResponse, InvokeError> {
        match self.workers.get(&request.provider) {
            Some(worker) => worker.invoke(request).await,
            None => Err(InvokeError::NoWorker(request.provider)),
        }
    }
}

// ============================================================================
// Scripted Worker (Testing)
// ============================================================================

/// One canned outcome for [`ScriptedWorker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptedReply {
    /// Reply with this text.
    Text(String),
    /// Fail with a transport error.
    TransportError,
    /// Fail with a rate-limit error.
    RateLimited,
    /// Sleep for the given milliseconds, then fail with a timeout.
    Stall(u64),
}

/// Worker that plays back canned replies per use case.
///
/// Queued replies are consumed first, then the use case's standing reply
/// (if any) answers every further call. Every request is recorded.
///
/// ```
/// use nutriwealth_pipeline::worker::{ScriptedReply, ScriptedWorker};
/// use nutriwealth_pipeline::UseCase;
///
/// let worker = ScriptedWorker::new()
///     .always(UseCase::Classify, ScriptedReply::Text(
///         r#"{"category":"food","confidence":0.9,"reasoning":"meal"}"#.into()))
///     .then(UseCase::Food, ScriptedReply::Text("not json".into()));
/// ```
pub struct ScriptedWorker {
    queued: Mutex<HashMap<UseCase, VecDeque<ScriptedReply>>>,
    standing: HashMap<UseCase, ScriptedReply>,
    calls: Mutex<Vec<InvocationRequest>>,
    tokens_in: u64,
    tokens_out: u64,
    delay: Duration,
}

impl ScriptedWorker {
    /// Worker with no replies; every call fails with a transport error.
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(HashMap::new()),
            standing: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            tokens_in: 100,
            tokens_out: 50,
            delay: Duration::ZERO,
        }
    }

    /// Queue a one-shot reply for `use_case`.
    pub fn then(self, use_case: UseCase, reply: ScriptedReply) -> Self {
        self.push(use_case, reply);
        self
    }

    /// Queue a one-shot reply on a shared worker.
    pub fn push(&self, use_case: UseCase, reply: ScriptedReply) {
        self.queued.lock().entry(use_case).or_default().push_back(reply);
    }

    /// Standing reply for `use_case` once its queue is empty.
    pub fn always(mut self, use_case: UseCase, reply: ScriptedReply) -> Self {
        self.standing.insert(use_case, reply);
        self
    }

    /// Token counts reported on every successful reply.
    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// Simulated latency before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<InvocationRequest> {
        self.calls.lock().clone()
    }

    /// Number of calls made for `use_case`.
    pub fn call_count(&self, use_case: UseCase) -> usize {
        self.calls.lock().iter().filter(|r| r.use_case == use_case).count()
    }

    fn next_reply(&self, use_case: UseCase) -> Option<ScriptedReply> {
        let queued = self
            .queued
            .lock()
            .get_mut(&use_case)
            .and_then(|q| q.pop_front());
        queued.or_else(|| self.standing.get(&use_case).cloned())
    }
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelWorker for ScriptedWorker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<ModelResponse, InvokeError> {
        self.calls.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_reply(request.use_case) {
            Some(ScriptedReply::Text(text)) => Ok(ModelResponse {
                text,
                tokens_in: self.tokens_in,
                tokens_out: self.tokens_out,
                latency: self.delay,
            }),
            Some(ScriptedReply::TransportError) => {
                Err(InvokeError::Transport("scripted transport failure".into()))
            }
            Some(ScriptedReply::RateLimited) => Err(InvokeError::RateLimited { retry_after: None }),
            Some(ScriptedReply::Stall(ms)) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Err(InvokeError::Timeout)
            }
            None => Err(InvokeError::Transport(format!(
                "no scripted reply for {}",
                request.use_case
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(use_case: UseCase) -> InvocationRequest {
        InvocationRequest {
            provider: Provider::OpenAi,
            model_id: "gpt-4o-mini".into(),
            use_case,
            system: "sys".into(),
            prompt: "hello".into(),
            image_url: None,
            max_tokens: 100,
            timeout: Duration::from_secs(5),
            json_mode: true,
        }
    }

    // -- scripted --------------------------------------------------------

    #[tokio::test]
    async fn test_scripted_worker_consumes_queue_then_standing_reply() {
        let worker = ScriptedWorker::new()
            .then(UseCase::Food, ScriptedReply::Text("first".into()))
            .always(UseCase::Food, ScriptedReply::Text("rest".into()));

        let a = worker.invoke(&request(UseCase::Food)).await.unwrap();
        let b = worker.invoke(&request(UseCase::Food)).await.unwrap();
        let c = worker.invoke(&request(UseCase::Food)).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "rest");
        assert_eq!(c.text, "rest");
        assert_eq!(worker.call_count(UseCase::Food), 3);
    }

    #[tokio::test]
    async fn test_scripted_worker_without_reply_is_transport_error() {
        let worker = ScriptedWorker::new();
        let err = worker.invoke(&request(UseCase::Receipt)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Transport(_)));
    }

    #[tokio::test]
    async fn test_invoke_bounded_cuts_stalled_worker() {
        let worker = ScriptedWorker::new().then(UseCase::Food, ScriptedReply::Stall(5_000));
        let mut req = request(UseCase::Food);
        req.timeout = Duration::from_millis(20);
        let err = invoke_bounded(&worker, &req).await.unwrap_err();
        assert_eq!(err, InvokeError::Timeout);
    }

    #[test]
    fn test_is_transport_covers_5xx_only() {
        assert!(InvokeError::Transport("reset".into()).is_transport());
        assert!(InvokeError::Provider { status: 503, message: String::new() }.is_transport());
        assert!(!InvokeError::Provider { status: 400, message: String::new() }.is_transport());
        assert!(!InvokeError::Timeout.is_transport());
        assert!(!InvokeError::RateLimited { retry_after: None }.is_transport());
    }

    #[tokio::test]
    async fn test_dispatch_without_worker_reports_provider() {
        let dispatch = ProviderDispatch::new();
        let err = dispatch.invoke(&request(UseCase::Food)).await.unwrap_err();
        assert_eq!(err, InvokeError::NoWorker(Provider::OpenAi));
    }

    // -- http ------------------------------------------------------------

    #[tokio::test]
    async fn test_openai_worker_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "{\"ok\":true}" } }],
                "usage": { "prompt_tokens": 42, "completion_tokens": 7 }
            })))
            .mount(&server)
            .await;

        let worker = OpenAiWorker::new(server.uri(), Some("test-key".into()));
        let resp = worker.invoke(&request(UseCase::Food)).await.unwrap();
        assert_eq!(resp.text, "{\"ok\":true}");
        assert_eq!(resp.tokens_in, 42);
        assert_eq!(resp.tokens_out, 7);
    }

    #[tokio::test]
    async fn test_openai_worker_maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let worker = OpenAiWorker::new(server.uri(), None);
        let err = worker.invoke(&request(UseCase::Food)).await.unwrap_err();
        assert_eq!(
            err,
            InvokeError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[tokio::test]
    async fn test_openai_worker_maps_500_to_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let worker = OpenAiWorker::new(server.uri(), None);
        let err = worker.invoke(&request(UseCase::Food)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Provider { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_anthropic_worker_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "{\"a\":" }, { "type": "text", "text": "1}" }],
                "usage": { "input_tokens": 10, "output_tokens": 4 }
            })))
            .mount(&server)
            .await;

        let worker = AnthropicWorker::new(server.uri(), "k");
        let mut req = request(UseCase::Receipt);
        req.provider = Provider::Anthropic;
        let resp = worker.invoke(&req).await.unwrap();
        assert_eq!(resp.text, "{\"a\":1}");
        assert_eq!(resp.tokens_in, 10);
    }

    #[test]
    fn test_anthropic_image_block_splits_data_url() {
        let block = AnthropicWorker::image_block("data:image/png;base64,AQID");
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
        assert_eq!(block["source"]["data"], "AQID");
    }
}
