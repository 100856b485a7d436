pub mod error;
pub mod config;
pub mod request;
pub mod dialect;
pub mod extract;
pub mod budget;
pub mod prompt;
pub mod providers;
pub mod gateway;
pub mod client;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

pub use error::{Error, ErrorKind, Result};
pub use request::{
  ChatRequest, ChatResponse, Envelope, ErrorResponse, GenerationRequest,
  GenerationResponse, HealthState, HealthStatus, RequestContext,
};
pub use dialect::{ErrorCategory, SqlDialect};
pub use extract::{extract, parse_sql_response, Extraction, ExtractionTier};
pub use budget::{BudgetAllocation, PriorityProfile, TokenBudget};
pub use prompt::{AssembledPrompt, ContextBundle, ContextRetriever, PromptAssembler};
pub use providers::ProviderAdapter;
pub use gateway::Gateway;
pub use client::GatewayClient;

/*

sqlgate: one request/response contract over several LLM backends
(hosted chat APIs, a local model runner, a CLI-driven assistant) for
turning natural language into SQL, fixing broken SQL, and free-form chat.

sqlgate/
├── Cargo.toml
├── src/
│   ├── lib.rs          # Re-exports, provider ids, model info
│   ├── error.rs        # Error taxonomy
│   ├── config.rs       # Per-backend configuration + validation
│   ├── request.rs      # Normalized request/response types
│   ├── dialect.rs      # SQL dialect + error category classifiers
│   ├── extract.rs      # SQL + confidence recovery from model text
│   ├── budget.rs       # Token budget allocator
│   ├── prompt.rs       # System/user prompt assembly
│   ├── providers/      # One adapter per backend
│   │   ├── mod.rs      # ProviderAdapter trait, factory, shared plumbing
│   │   ├── openai.rs
│   │   ├── anthropic.rs
│   │   ├── ollama.rs
│   │   └── claude_cli.rs
│   ├── gateway.rs      # Registry of adapters, single entry point
│   └── client.rs       # Channel-driven front-end for the gateway
└── tests/

*/

/// Backends the gateway knows how to talk to.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
  Deserialize, Serialize,
)]
pub enum ProviderId
{   /// OpenAI-compatible chat completions (OpenAI, Mistral, ...)
    #[serde(rename = "openai")]
    OpenAi
  , /// Anthropic messages API
    #[serde(rename = "anthropic")]
    Anthropic
  , /// Local Ollama model runner
    #[serde(rename = "ollama")]
    Ollama
  , /// Claude Code CLI, driven as a subprocess
    #[serde(rename = "claudecode")]
    ClaudeCode
}

impl ProviderId
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   ProviderId::OpenAi => "openai"
          , ProviderId::Anthropic => "anthropic"
          , ProviderId::Ollama => "ollama"
          , ProviderId::ClaudeCode => "claudecode"
        }
    }
}

impl fmt::Display for ProviderId
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId
{   type Err = Error;

    fn from_str(s: &str) -> Result<Self>
    {   match s.trim().to_ascii_lowercase().as_str()
        {   "openai" => Ok(ProviderId::OpenAi)
          , "anthropic" => Ok(ProviderId::Anthropic)
          , "ollama" => Ok(ProviderId::Ollama)
          , "claudecode" | "claude_code" | "claude-code" => {
              Ok(ProviderId::ClaudeCode)
            }
          , other => Err(Error::Configuration(
              format!("unknown provider: {}", other)
            ))
        }
    }
}

/// Information about a model a provider can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo
{   /// Identifier passed back to the backend (e.g. "gpt-4o-mini")
    pub id: String
  , /// Human-readable name
    pub name: String
  , /// Provider serving the model
    pub provider_id: ProviderId
  , pub description: String
  , /// Context window in tokens, when known
    pub max_tokens: Option<usize>
  , /// e.g. "text-to-sql", "sql-fixing", "explanation"
    pub capabilities: BTreeSet<String>
  , #[serde(default)]
    pub metadata: HashMap<String, String>
}

impl ModelInfo
{   pub fn new(
      id: impl Into<String>
    , provider_id: ProviderId
    ) -> Self
    {   let id = id.into();
        ModelInfo
        {   name: id.clone()
          , id
          , provider_id
          , description: String::new()
          , max_tokens: None
          , capabilities: BTreeSet::new()
          , metadata: HashMap::new()
        }
    }

    pub fn with_capabilities(
      mut self
    , capabilities: &[&str]
    ) -> Self
    {   self.capabilities
          .extend(capabilities.iter().map(|c| c.to_string()));
        self
    }
}
