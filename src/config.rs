//! Configuration for sqlgate providers and the gateway.
//!
//! Loading is up to the caller; everything here deserializes with serde
//! and is checked by `validate()` before an adapter accepts it.

use std::collections::HashSet;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::budget::recommended_context_window;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::ProviderId;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_CLAUDE_CLI_PATH: &str = "claude";
pub const DEFAULT_CLAUDE_CLI_MODEL: &str = "opus";

/// OpenAI-compatible chat completions backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig
{   pub api_key: String
  , /// API base URL, e.g. a Mistral or proxy endpoint
    pub base_url: String
  , pub organization: Option<String>
  , /// First entry is the default model
    pub models: Vec<String>
  , /// Request timeout in seconds
    pub timeout_secs: u64
  , /// Overrides the context window looked up from the model name
    pub context_window: Option<usize>
}

impl Default for OpenAiConfig
{   fn default() -> Self
    {   OpenAiConfig
        {   api_key: String::new()
          , base_url: DEFAULT_OPENAI_BASE_URL.to_string()
          , organization: None
          , models: strings(&[
              "gpt-4o-mini", "gpt-4o", "gpt-4-turbo", "gpt-3.5-turbo",
            ])
          , timeout_secs: 60
          , context_window: None
        }
    }
}

impl OpenAiConfig
{   pub fn new(api_key: impl Into<String>) -> Self
    {   OpenAiConfig
        {   api_key: api_key.into()
          , ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()>
    {   require_non_empty(ProviderId::OpenAi, "api_key", &self.api_key)?;
        require_http_url(ProviderId::OpenAi, "base_url", &self.base_url)?;
        require_models(ProviderId::OpenAi, &self.models)?;
        require_timeout(ProviderId::OpenAi, "timeout_secs", self.timeout_secs)
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_secs(self.timeout_secs)
    }
}

/// Anthropic messages API backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig
{   pub api_key: String
  , pub base_url: String
  , /// Sent as the `anthropic-version` header
    pub version: String
  , pub models: Vec<String>
  , /// The messages API requires an explicit output cap
    pub max_output_tokens: usize
  , pub timeout_secs: u64
  , pub context_window: Option<usize>
}

impl Default for AnthropicConfig
{   fn default() -> Self
    {   AnthropicConfig
        {   api_key: String::new()
          , base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string()
          , version: DEFAULT_ANTHROPIC_VERSION.to_string()
          , models: strings(&[
              "claude-3-5-sonnet-20241022",
              "claude-3-5-haiku-20241022",
              "claude-3-opus-20240229",
            ])
          , max_output_tokens: 4096
          , timeout_secs: 60
          , context_window: None
        }
    }
}

impl AnthropicConfig
{   pub fn new(api_key: impl Into<String>) -> Self
    {   AnthropicConfig
        {   api_key: api_key.into()
          , ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()>
    {   let id = ProviderId::Anthropic;
        require_non_empty(id, "api_key", &self.api_key)?;
        require_http_url(id, "base_url", &self.base_url)?;
        require_non_empty(id, "version", &self.version)?;
        require_models(id, &self.models)?;
        if self.max_output_tokens == 0
        {   return Err(Error::Configuration(
              "anthropic: max_output_tokens must be positive".to_string()
            ));
        }
        require_timeout(id, "timeout_secs", self.timeout_secs)
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_secs(self.timeout_secs)
    }
}

/// Local Ollama runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig
{   pub endpoint: String
  , pub models: Vec<String>
  , /// Pull a missing model before generating instead of failing
    pub auto_pull_models: bool
  , pub pull_timeout_secs: u64
  , pub generate_timeout_secs: u64
  , pub context_window: Option<usize>
}

impl Default for OllamaConfig
{   fn default() -> Self
    {   OllamaConfig
        {   endpoint: DEFAULT_OLLAMA_ENDPOINT.to_string()
          , models: strings(&["sqlcoder:7b", "codellama:7b", "llama3.1:8b"])
          , auto_pull_models: false
          , pull_timeout_secs: 600
          , generate_timeout_secs: 120
          , context_window: None
        }
    }
}

impl OllamaConfig
{   pub fn validate(&self) -> Result<()>
    {   let id = ProviderId::Ollama;
        require_http_url(id, "endpoint", &self.endpoint)?;
        require_models(id, &self.models)?;
        require_timeout(id, "pull_timeout_secs", self.pull_timeout_secs)?;
        require_timeout(id, "generate_timeout_secs", self.generate_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration
    {   Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn generate_timeout(&self) -> Duration
    {   Duration::from_secs(self.generate_timeout_secs)
    }
}

/// Claude Code CLI, run as a subprocess per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeCliConfig
{   /// Binary name (looked up on PATH) or path
    pub cli_path: String
  , pub model: String
  , pub timeout_secs: u64
  , pub context_window: Option<usize>
}

impl Default for ClaudeCliConfig
{   fn default() -> Self
    {   ClaudeCliConfig
        {   cli_path: DEFAULT_CLAUDE_CLI_PATH.to_string()
          , model: DEFAULT_CLAUDE_CLI_MODEL.to_string()
          , timeout_secs: 120
          , context_window: None
        }
    }
}

impl ClaudeCliConfig
{   pub fn validate(&self) -> Result<()>
    {   let id = ProviderId::ClaudeCode;
        require_non_empty(id, "cli_path", &self.cli_path)?;
        require_non_empty(id, "model", &self.model)?;
        require_timeout(id, "timeout_secs", self.timeout_secs)
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for one backend, tagged by provider id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum ProviderSettings
{   #[serde(rename = "openai")]
    OpenAi(OpenAiConfig)
  , #[serde(rename = "anthropic")]
    Anthropic(AnthropicConfig)
  , #[serde(rename = "ollama")]
    Ollama(OllamaConfig)
  , #[serde(rename = "claudecode")]
    ClaudeCode(ClaudeCliConfig)
}

impl ProviderSettings
{   pub fn provider_id(&self) -> ProviderId
    {   match self
        {   ProviderSettings::OpenAi(_) => ProviderId::OpenAi
          , ProviderSettings::Anthropic(_) => ProviderId::Anthropic
          , ProviderSettings::Ollama(_) => ProviderId::Ollama
          , ProviderSettings::ClaudeCode(_) => ProviderId::ClaudeCode
        }
    }

    pub fn validate(&self) -> Result<()>
    {   match self
        {   ProviderSettings::OpenAi(c) => c.validate()
          , ProviderSettings::Anthropic(c) => c.validate()
          , ProviderSettings::Ollama(c) => c.validate()
          , ProviderSettings::ClaudeCode(c) => c.validate()
        }
    }

    /// Model used when a request does not name one
    pub fn default_model(&self) -> &str
    {   fn first(models: &[String]) -> &str
        {   models.first().map(String::as_str).unwrap_or("")
        }
        match self
        {   ProviderSettings::OpenAi(c) => first(&c.models)
          , ProviderSettings::Anthropic(c) => first(&c.models)
          , ProviderSettings::Ollama(c) => first(&c.models)
          , ProviderSettings::ClaudeCode(c) => &c.model
        }
    }
}

/// Whole-gateway configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig
{   /// Provider for requests that do not name one
    pub default_provider: ProviderId
  , /// Dialect when the request context gives no hint
    pub default_dialect: SqlDialect
  , pub providers: Vec<ProviderSettings>
}

impl Default for GatewayConfig
{   fn default() -> Self
    {   GatewayConfig
        {   default_provider: ProviderId::OpenAi
          , default_dialect: SqlDialect::Generic
          , providers: vec![]
        }
    }
}

impl GatewayConfig
{   pub fn validate(&self) -> Result<()>
    {   let mut seen = HashSet::new();
        for settings in &self.providers
        {   settings.validate()?;
            if !seen.insert(settings.provider_id())
            {   return Err(Error::Configuration(format!(
                  "{} is configured more than once",
                  settings.provider_id()
                )));
            }
        }
        if !seen.contains(&self.default_provider)
        {   return Err(Error::Configuration(format!(
              "default provider {} is not configured",
              self.default_provider
            )));
        }
        Ok(())
    }
}

/// Model to use: the requested one, else the configured default
pub(crate) fn pick_model(requested: &str, default: &str) -> String
{   let requested = requested.trim();
    if requested.is_empty()
    {   default.to_string()
    } else
    {   requested.to_string()
    }
}

/// Context window for `model`, honouring a configured override
pub(crate) fn context_window_for(
  model: &str
, configured: Option<usize>
) -> usize
{   configured
      .filter(|w| *w > 0)
      .unwrap_or_else(|| recommended_context_window(model))
}

fn strings(items: &[&str]) -> Vec<String>
{   items.iter().map(|s| s.to_string()).collect()
}

fn require_non_empty(
  provider: ProviderId
, field: &str
, value: &str
) -> Result<()>
{   if value.trim().is_empty()
    {   return Err(Error::Configuration(
          format!("{}: {} is required", provider, field)
        ));
    }
    Ok(())
}

fn require_http_url(
  provider: ProviderId
, field: &str
, value: &str
) -> Result<()>
{   let value = value.trim();
    if !(value.starts_with("http://") || value.starts_with("https://"))
    {   return Err(Error::Configuration(format!(
          "{}: {} must be an http(s) URL, got {:?}",
          provider, field, value
        )));
    }
    Ok(())
}

fn require_models(provider: ProviderId, models: &[String]) -> Result<()>
{   if models.first().map_or(true, |m| m.trim().is_empty())
    {   return Err(Error::Configuration(
          format!("{}: at least one model is required", provider)
        ));
    }
    Ok(())
}

fn require_timeout(provider: ProviderId, field: &str, secs: u64) -> Result<()>
{   if secs == 0
    {   return Err(Error::Configuration(
          format!("{}: {} must be positive", provider, field)
        ));
    }
    Ok(())
}
