//! Unified request and response types for sqlgate

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ProviderId;

/// Free-form context key naming the connection to retrieve schema for
pub const CONTEXT_CONNECTION_ID: &str = "connection_id";
/// Explicit SQL dialect override
pub const CONTEXT_DIALECT: &str = "dialect";
/// Connection type string, e.g. "postgres"
pub const CONTEXT_CONNECTION_TYPE: &str = "connection_type";
pub const CONTEXT_DATABASE_TYPE: &str = "database_type";
pub const CONTEXT_DRIVER: &str = "driver";

/// Request to generate or fix SQL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest
{   /// Provider to route to; the gateway default when absent
    pub provider: Option<ProviderId>
  , /// Natural-language request
    pub prompt: String
  , /// Literal schema text supplied by the caller
    pub schema: String
  , /// Broken query (fixes only)
    pub query: String
  , /// Database error message (fixes only)
    pub error_message: String
  , /// Model name; the adapter default when empty
    pub model: String
  , /// Max tokens to generate
    pub max_tokens: Option<usize>
  , /// Temperature for sampling
    pub temperature: Option<f32>
  , /// Connection id, dialect hints and similar
    pub freeform_context: HashMap<String, String>
}

impl GenerationRequest
{   pub fn new(prompt: impl Into<String>) -> Self
    {   GenerationRequest
        {   prompt: prompt.into()
          , ..Default::default()
        }
    }

    /// Build a fix request for `query` that failed with `error_message`
    pub fn fix(
      query: impl Into<String>
    , error_message: impl Into<String>
    ) -> Self
    {   GenerationRequest
        {   query: query.into()
          , error_message: error_message.into()
          , ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self
    {   self.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self
    {   self.model = model.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self
    {   self.schema = schema.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self
    {   self.prompt = prompt.into();
        self
    }

    pub fn with_context(
      mut self
    , key: impl Into<String>
    , value: impl Into<String>
    ) -> Self
    {   self.freeform_context.insert(key.into(), value.into());
        self
    }

    /// Non-blank free-form context value
    pub fn context_value(&self, key: &str) -> Option<&str>
    {   context_value(&self.freeform_context, key)
    }
}

pub(crate) fn context_value<'a>(
  context: &'a HashMap<String, String>
, key: &str
) -> Option<&'a str>
{   context.get(key)
      .map(|v| v.trim())
      .filter(|v| !v.is_empty())
}

/// Normalized result of a generate/fix call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse
{   pub query: String
  , pub explanation: String
  , /// Always within [0, 1]
    pub confidence: f64
  , pub suggestions: Vec<String>
  , pub warnings: Vec<String>
  , pub provider_id: ProviderId
  , pub model: String
  , pub tokens_used: usize
  , pub latency: Duration
  , pub metadata: HashMap<String, String>
}

/// Free-form chat request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatRequest
{   pub provider: Option<ProviderId>
  , pub prompt: String
  , /// Replaces the default assistant system prompt
    pub system: Option<String>
  , /// Extra context placed ahead of the prompt
    pub context: Option<String>
  , pub model: String
  , pub max_tokens: Option<usize>
  , pub temperature: Option<f32>
  , pub freeform_context: HashMap<String, String>
}

impl ChatRequest
{   pub fn new(prompt: impl Into<String>) -> Self
    {   ChatRequest
        {   prompt: prompt.into()
          , ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self
    {   self.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self
    {   self.model = model.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self
    {   self.context = Some(context.into());
        self
    }
}

/// Normalized chat answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse
{   pub content: String
  , pub provider_id: ProviderId
  , pub model: String
  , pub tokens_used: usize
  , pub latency: Duration
  , pub metadata: HashMap<String, String>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState
{   /// Probe succeeded and returned well-formed output
    Healthy
  , /// Probe completed but the backend is unreachable or misconfigured
    Unhealthy
  , /// The probe itself could not run
    Error
  , Unknown
}

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus
{   pub provider_id: ProviderId
  , pub status: HealthState
  , pub message: String
  , pub last_checked: DateTime<Utc>
  , pub response_time: Duration
}

impl HealthStatus
{   fn with_state(
      provider_id: ProviderId
    , status: HealthState
    , message: impl Into<String>
    , response_time: Duration
    ) -> Self
    {   HealthStatus
        {   provider_id
          , status
          , message: message.into()
          , last_checked: Utc::now()
          , response_time
        }
    }

    pub fn healthy(
      provider_id: ProviderId
    , message: impl Into<String>
    , response_time: Duration
    ) -> Self
    {   Self::with_state(
          provider_id, HealthState::Healthy, message, response_time
        )
    }

    pub fn unhealthy(
      provider_id: ProviderId
    , message: impl Into<String>
    , response_time: Duration
    ) -> Self
    {   Self::with_state(
          provider_id, HealthState::Unhealthy, message, response_time
        )
    }

    pub fn error(
      provider_id: ProviderId
    , message: impl Into<String>
    , response_time: Duration
    ) -> Self
    {   Self::with_state(
          provider_id, HealthState::Error, message, response_time
        )
    }

    pub fn unknown(
      provider_id: ProviderId
    , message: impl Into<String>
    ) -> Self
    {   Self::with_state(
          provider_id, HealthState::Unknown, message, Duration::ZERO
        )
    }

    pub fn is_healthy(&self) -> bool
    {   self.status == HealthState::Healthy
    }
}

/// Unified error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse
{   /// Error code, see [`crate::ErrorKind::code`]
    pub code: String
  , /// Error message
    pub message: String
  , /// Provider that errored
    pub provider: Option<ProviderId>
  , pub retryable: bool
}

impl ErrorResponse
{   pub fn from_error(
      error: &Error
    , provider: Option<ProviderId>
    ) -> Self
    {   ErrorResponse
        {   code: error.kind().code().to_string()
          , message: error.to_string()
          , provider
          , retryable: error.is_retryable()
        }
    }
}

/// A result or an error, never both; lets one failed call sit next to
/// successful ones in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T>
{   pub result: Option<T>
  , pub error: Option<ErrorResponse>
}

impl<T> Envelope<T>
{   pub fn from_result(
      result: Result<T>
    , provider: Option<ProviderId>
    ) -> Self
    {   match result
        {   Ok(value) => Envelope
            {   result: Some(value)
              , error: None
            }
          , Err(e) => Envelope
            {   result: None
              , error: Some(ErrorResponse::from_error(&e, provider))
            }
        }
    }

    pub fn is_ok(&self) -> bool
    {   self.result.is_some()
    }
}

/// Cancellation and deadline carried by every backend call
#[derive(Debug, Clone, Default)]
pub struct RequestContext
{   pub cancel: CancellationToken
  , pub deadline: Option<Instant>
}

impl RequestContext
{   pub fn new() -> Self
    {   RequestContext::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self
    {   RequestContext
        {   cancel: CancellationToken::new()
          , deadline: Some(Instant::now() + timeout)
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self
    {   self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool
    {   self.cancel.is_cancelled()
    }

    /// Drive `fut` until it finishes, the token is cancelled, or the
    /// deadline passes. The future is dropped on the losing branches,
    /// which releases whatever it held (connections, child processes).
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
      F: Future<Output = Result<T>>
    {   if self.cancel.is_cancelled()
        {   return Err(Error::Cancelled);
        }
        let started = Instant::now();
        match self.deadline
        {   Some(deadline) => {
              tokio::select!
              { biased;
                _ = self.cancel.cancelled() => Err(Error::Cancelled)
              , _ = tokio::time::sleep_until(deadline) => {
                  Err(Error::DeadlineExceeded(started.elapsed()))
                }
              , res = fut => res
              }
            }
          , None => {
              tokio::select!
              { biased;
                _ = self.cancel.cancelled() => Err(Error::Cancelled)
              , res = fut => res
              }
            }
        }
    }
}
