use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for every gateway, adapter and allocator operation.
/// Implements Clone for sending through channels.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error
{   /// Missing/invalid credentials, endpoint or model
    #[error("Invalid configuration: {0}")]
    Configuration(String)
  , /// Network failure talking to a backend
    #[error("Transport error: {0}")]
    Transport(String)
  , /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled
  , /// Caller deadline passed before the backend answered
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration)
  , /// Backend answered with a non-success status
    #[error("{provider} API error (status {status}): {message}")]
    BackendApi
    {   provider: crate::ProviderId
      , status: u16
      , message: String
    }
  , /// Backend answered with success but the body could not be decoded
    #[error("Parse error: {0}")]
    Parse(String)
  , /// Backend text decoded fine but held no SQL statement
    #[error("No SQL statement could be extracted from the model response")]
    NoExtractableSql
  , /// Token allocation exceeded its declared capacity
    #[error("Token budget invariant violated: {0}")]
    BudgetInvariantViolation(String)
  , /// Request failed gateway validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String)
  , /// No adapter registered for the provider
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(crate::ProviderId)
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind
{   Configuration
  , Transport
  , BackendApi
  , Parse
  , ExtractionFailure
  , BudgetInvariantViolation
  , InvalidRequest
}

impl ErrorKind
{   /// Stable code used in serialized error envelopes
    pub fn code(&self) -> &'static str
    {   match self
        {   ErrorKind::Configuration => "configuration_error"
          , ErrorKind::Transport => "transport_error"
          , ErrorKind::BackendApi => "backend_api_error"
          , ErrorKind::Parse => "parse_error"
          , ErrorKind::ExtractionFailure => "no_extractable_sql"
          , ErrorKind::BudgetInvariantViolation => "budget_invariant_violation"
          , ErrorKind::InvalidRequest => "invalid_request"
        }
    }
}

impl Error
{   pub fn kind(&self) -> ErrorKind
    {   match self
        {   Error::Configuration(_)
          | Error::ProviderNotConfigured(_) => ErrorKind::Configuration
          , Error::Transport(_)
          | Error::Cancelled
          | Error::DeadlineExceeded(_) => ErrorKind::Transport
          , Error::BackendApi { .. } => ErrorKind::BackendApi
          , Error::Parse(_) => ErrorKind::Parse
          , Error::NoExtractableSql => ErrorKind::ExtractionFailure
          , Error::BudgetInvariantViolation(_) => {
              ErrorKind::BudgetInvariantViolation
            }
          , Error::InvalidRequest(_) => ErrorKind::InvalidRequest
        }
    }

    /// Only transport-class failures are worth retrying, and only by the
    /// caller.
    pub fn is_retryable(&self) -> bool
    {   self.kind() == ErrorKind::Transport
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   if e.is_decode()
        {   Error::Parse(e.to_string())
        } else
        {   Error::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::Parse(e.to_string())
    }
}
