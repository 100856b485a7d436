//! Backend adapters.
//!
//! Every backend implements [`ProviderAdapter`]. Adapters own their
//! configuration snapshot and HTTP client (or subprocess handling); the
//! shared pieces here turn a completion from any backend into the
//! normalized response types.

pub mod openai;
pub mod anthropic;
pub mod ollama;
pub mod claude_cli;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error, trace};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

pub use openai::OpenAiAdapter;
pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use claude_cli::ClaudeCliAdapter;

use crate::config::ProviderSettings;
use crate::error::{Error, Result};
use crate::extract::parse_sql_response;
use crate::prompt::{AssembledPrompt, PromptAssembler};
use crate::request::{
  ChatResponse, GenerationRequest, GenerationResponse, HealthStatus,
  RequestContext,
};
use crate::{ChatRequest, ModelInfo, ProviderId};

/// Capability set every backend provides
#[async_trait]
pub trait ProviderAdapter: Send + Sync
{   /// Turn a natural-language request into SQL
    async fn generate_sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    ) -> Result<GenerationResponse>;

    /// Repair `req.query` given `req.error_message`
    async fn fix_sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    ) -> Result<GenerationResponse>;

    async fn chat(
      &self
    , ctx: &RequestContext
    , req: &ChatRequest
    ) -> Result<ChatResponse>;

    /// Probe the backend. Failures are reported in the status, not as
    /// errors.
    async fn get_health(&self, ctx: &RequestContext) -> HealthStatus;

    /// One probe, healthy or not
    async fn is_available(&self, ctx: &RequestContext) -> bool
    {   self.get_health(ctx).await.is_healthy()
    }

    async fn list_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>>;

    fn provider_id(&self) -> ProviderId;

    /// Validate and swap in a whole new configuration. Requests already
    /// running keep the snapshot they started with.
    fn update_config(&self, settings: ProviderSettings) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

impl ProviderSettings
{   /// Build the adapter these settings describe
    pub fn build(
      self
    , assembler: PromptAssembler
    ) -> Result<Arc<dyn ProviderAdapter>>
    {   let adapter: Arc<dyn ProviderAdapter> = match self
        {   ProviderSettings::OpenAi(c) => {
              Arc::new(OpenAiAdapter::new(c, assembler)?)
            }
          , ProviderSettings::Anthropic(c) => {
              Arc::new(AnthropicAdapter::new(c, assembler)?)
            }
          , ProviderSettings::Ollama(c) => {
              Arc::new(OllamaAdapter::new(c, assembler)?)
            }
          , ProviderSettings::ClaudeCode(c) => {
              Arc::new(ClaudeCliAdapter::new(c, assembler)?)
            }
        };
        Ok(adapter)
    }
}

/// Configuration that can be replaced while requests are reading it.
/// Readers take an `Arc` snapshot and never see a half-applied update.
#[derive(Debug)]
pub struct SharedConfig<T>
{   inner: RwLock<Arc<T>>
}

impl<T> SharedConfig<T>
{   pub fn new(config: T) -> Self
    {   SharedConfig
        {   inner: RwLock::new(Arc::new(config))
        }
    }

    pub fn current(&self) -> Arc<T>
    {   match self.inner.read()
        {   Ok(guard) => Arc::clone(&guard)
          , Err(poisoned) => Arc::clone(&poisoned.into_inner())
        }
    }

    pub fn replace(&self, config: T)
    {   let config = Arc::new(config);
        match self.inner.write()
        {   Ok(mut guard) => *guard = config
          , Err(poisoned) => *poisoned.into_inner() = config
        }
    }
}

/// Reject settings meant for a different backend
pub(crate) fn settings_mismatch(
  expected: ProviderId
, settings: &ProviderSettings
) -> Error
{   Error::Configuration(format!(
      "{} adapter cannot take {} settings",
      expected,
      settings.provider_id()
    ))
}

/// Raw text answer from one backend call
#[derive(Debug, Clone, Default)]
pub(crate) struct Completion
{   pub text: String
  , pub model: String
  , pub tokens_used: usize
  , pub metadata: HashMap<String, String>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqlTask
{   Generate
  , Fix
}

/// Prompts for a generate or fix call against a model with
/// `context_window` tokens. Context retrieval is bound by `ctx`.
pub(crate) async fn sql_prompt(
  ctx: &RequestContext
, assembler: &PromptAssembler
, task: SqlTask
, req: &GenerationRequest
, context_window: usize
) -> Result<AssembledPrompt>
{   let dialect = assembler.dialect_for(req);
    match task
    {   SqlTask::Generate => {
          assembler
            .build_generation_prompt(ctx, req, dialect, context_window)
            .await
        }
      , SqlTask::Fix => {
          assembler.build_fix_prompt(ctx, req, dialect, context_window).await
        }
    }
}

/// Run the extractor over a completion and fill in provider, usage and
/// timing.
pub(crate) fn sql_response(
  provider: ProviderId
, completion: Completion
, prompt: &AssembledPrompt
, started: Instant
) -> Result<GenerationResponse>
{   let mut response = parse_sql_response(
      &completion.text, provider, &completion.model
    )
    .map_err(|e| {
      debug!("{}: {}", provider, e);
      e
    })?;
    response.tokens_used = completion.tokens_used;
    response.latency = started.elapsed();
    response.metadata.extend(completion.metadata);
    if let Some(allocation) = &prompt.allocation
    {   response.metadata
          .insert("context_budget".to_string(), allocation.summary());
    }
    Ok(response)
}

pub(crate) fn chat_response(
  provider: ProviderId
, completion: Completion
, started: Instant
) -> ChatResponse
{   ChatResponse
    {   content: completion.text
      , provider_id: provider
      , model: completion.model
      , tokens_used: completion.tokens_used
      , latency: started.elapsed()
      , metadata: completion.metadata
    }
}

/// Send a request; transport failures become [`Error::Transport`].
pub(crate) async fn send(
  provider: ProviderId
, request: reqwest::RequestBuilder
) -> Result<reqwest::Response>
{   request.send().await.map_err(|e| {
      error!("{} request failed: {}", provider, e);
      Error::Transport(format!("{}: {}", provider, e))
    })
}

/// Decode a JSON body. Non-2xx becomes [`Error::BackendApi`] carrying
/// the backend's own message; an undecodable body is [`Error::Parse`].
pub(crate) async fn read_json<T: DeserializeOwned>(
  provider: ProviderId
, response: reqwest::Response
) -> Result<T>
{   let status = response.status();
    let body = response.text().await.map_err(|e| {
      error!("{} body read failed: {}", provider, e);
      Error::Transport(format!("{}: {}", provider, e))
    })?;
    trace!("{} response ({}): {}", provider, status, body);

    if !status.is_success()
    {   let message = backend_error_message(&body);
        error!("{} API error {}: {}", provider, status, message);
        return Err(Error::BackendApi
        {   provider
          , status: status.as_u16()
          , message
        });
    }

    serde_json::from_str(&body).map_err(|e| {
      error!("{} returned an undecodable body: {}", provider, e);
      Error::Parse(format!("{}: {}", provider, e))
    })
}

/// The message a backend put in its error body, or the body itself
pub(crate) fn backend_error_message(body: &str) -> String
{   if let Ok(value) = serde_json::from_str::<Value>(body)
    {   let message = value.pointer("/error/message")
          .and_then(Value::as_str)
          .or_else(|| value.get("error").and_then(Value::as_str))
          .or_else(|| value.get("message").and_then(Value::as_str));
        if let Some(message) = message
        {   return message.to_string();
        }
    }
    let body = body.trim();
    if body.is_empty()
    {   "empty response body".to_string()
    } else
    {   body.to_string()
    }
}

/// Health probe over HTTP: send, require 2xx, require a JSON body.
/// Returns the body and round-trip time, or the unhealthy status to
/// report.
pub(crate) async fn probe_json(
  ctx: &RequestContext
, provider: ProviderId
, request: reqwest::RequestBuilder
) -> std::result::Result<(Value, Duration), HealthStatus>
{   let started = Instant::now();
    let exchange = async {
      let response = send(provider, request).await?;
      let status = response.status();
      let body = response.text().await?;
      Ok::<_, Error>((status, body))
    };

    let (status, body) = match ctx.run(exchange).await
    {   Ok(found) => found
      , Err(e @ Error::Cancelled) | Err(e @ Error::DeadlineExceeded(_)) => {
          return Err(HealthStatus::error(
            provider, e.to_string(), started.elapsed()
          ));
        }
      , Err(e) => {
          return Err(HealthStatus::unhealthy(
            provider,
            format!("service unreachable: {}", e),
            started.elapsed(),
          ));
        }
    };
    let elapsed = started.elapsed();

    if !status.is_success()
    {   return Err(HealthStatus::unhealthy(
          provider,
          format!("HTTP {}: {}", status.as_u16(), backend_error_message(&body)),
          elapsed,
        ));
    }
    match serde_json::from_str::<Value>(&body)
    {   Ok(value) => Ok((value, elapsed))
      , Err(e) => Err(HealthStatus::unhealthy(
          provider,
          format!("malformed response body: {}", e),
          elapsed,
        ))
    }
}

/// Capabilities guessed from a model id
pub(crate) fn infer_capabilities(model: &str) -> Vec<&'static str>
{   let model = model.to_ascii_lowercase();
    if model.contains("embed")
    {   return vec!["embedding"];
    }
    if ["whisper", "tts", "dall-e"].iter().any(|m| model.contains(m))
    {   return vec![];
    }
    if model.contains("sqlcoder")
    {   return vec!["text-to-sql", "sql-fixing"];
    }
    vec!["chat", "text-to-sql", "sql-fixing", "explanation"]
}
