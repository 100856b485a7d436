use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use log::{debug, trace, error};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{context_window_for, pick_model, OpenAiConfig, ProviderSettings};
use crate::error::{Error, Result};
use crate::prompt::{chat_prompt, PromptAssembler};
use crate::providers::{
  chat_response, infer_capabilities, probe_json, read_json, send,
  settings_mismatch, sql_prompt, sql_response, Completion, ProviderAdapter,
  SharedConfig, SqlTask,
};
use crate::request::{
  ChatRequest, ChatResponse, GenerationRequest, GenerationResponse,
  HealthStatus, RequestContext,
};
use crate::{ModelInfo, ProviderId};

const SQL_MAX_TOKENS: usize = 2000;
const GENERATE_TEMPERATURE: f32 = 0.3;
const FIX_TEMPERATURE: f32 = 0.2;

// ===== Message Types =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage
{   pub role: String
  , pub content: String
}

impl ChatMessage
{   fn new(role: &str, content: &str) -> Self
    {   ChatMessage
        {   role: role.to_string()
          , content: content.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest
{   pub model: String
  , pub messages: Vec<ChatMessage>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>
  , pub stream: bool
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse
{   #[serde(default)]
    pub model: Option<String>
  , pub choices: Vec<Choice>
  , #[serde(default)]
    pub usage: Option<Usage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: ChoiceMessage
  , #[serde(default)]
    pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage
{   #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage
{   #[serde(default)]
    pub prompt_tokens: usize
  , #[serde(default)]
    pub completion_tokens: usize
  , #[serde(default)]
    pub total_tokens: usize
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse
{   pub data: Vec<ModelData>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelData
{   pub id: String
  , #[serde(default)]
    pub owned_by: Option<String>
}

// ===== Adapter =====

/// OpenAI-compatible `/chat/completions` backend. Any service speaking
/// the same protocol (Mistral, local proxies) works through `base_url`.
pub struct OpenAiAdapter
{   config: SharedConfig<OpenAiConfig>
  , http: reqwest::Client
  , assembler: PromptAssembler
}

impl OpenAiAdapter
{   pub fn new(
      config: OpenAiConfig
    , assembler: PromptAssembler
    ) -> Result<Self>
    {   config.validate()?;
        debug!("Creating OpenAiAdapter for {}", config.base_url);
        Ok(OpenAiAdapter
        {   config: SharedConfig::new(config)
          , http: reqwest::Client::new()
          , assembler
        })
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<OpenAiConfig>
    {   self.config.current()
    }

    fn authorized(
      &self
    , config: &OpenAiConfig
    , request: reqwest::RequestBuilder
    ) -> reqwest::RequestBuilder
    {   let request = request
          .bearer_auth(&config.api_key)
          .timeout(config.timeout());
        match &config.organization
        {   Some(org) => request.header("OpenAI-Organization", org)
          , None => request
        }
    }

    async fn complete(
      &self
    , config: &OpenAiConfig
    , messages: Vec<ChatMessage>
    , model: String
    , max_tokens: Option<usize>
    , temperature: Option<f32>
    ) -> Result<Completion>
    {   let request = ChatCompletionRequest
        {   model: model.clone()
          , messages
          , max_tokens
          , temperature
          , stream: false
        };
        trace!("OpenAI request: {:?}", request);

        let url = format!(
          "{}/chat/completions", config.base_url.trim_end_matches('/')
        );
        let response = send(
          ProviderId::OpenAi,
          self.authorized(config, self.http.post(url)).json(&request),
        ).await?;
        let body: ChatCompletionResponse
          = read_json(ProviderId::OpenAi, response).await?;

        let choice = body.choices.into_iter().next().ok_or_else(|| {
          error!("No choices in OpenAI response");
          Error::Parse("openai: no choices in response".to_string())
        })?;

        let mut metadata = HashMap::new();
        if let Some(reason) = choice.finish_reason
        {   metadata.insert("finish_reason".to_string(), reason);
        }
        let usage = body.usage.unwrap_or_default();
        Ok(Completion
        {   text: choice.message.content.unwrap_or_default()
          , model: body.model.unwrap_or(model)
          , tokens_used: usage.total_tokens
          , metadata
        })
    }

    async fn sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    , task: SqlTask
    ) -> Result<GenerationResponse>
    {   let started = Instant::now();
        let config = self.config.current();
        let model = pick_model(&req.model, default_model(&config));
        debug!("OpenAI {:?} with model {}", task, model);

        let window = context_window_for(&model, config.context_window);
        let prompt = sql_prompt(ctx, &self.assembler, task, req, window).await?;
        let temperature = match task
        {   SqlTask::Generate => GENERATE_TEMPERATURE
          , SqlTask::Fix => FIX_TEMPERATURE
        };
        let messages = vec![
          ChatMessage::new("system", &prompt.system_prompt),
          ChatMessage::new("user", &prompt.user_prompt),
        ];

        let completion = ctx.run(self.complete(
          &config,
          messages,
          model,
          Some(req.max_tokens.unwrap_or(SQL_MAX_TOKENS)),
          Some(req.temperature.unwrap_or(temperature)),
        )).await?;
        sql_response(ProviderId::OpenAi, completion, &prompt, started)
    }
}

fn default_model(config: &OpenAiConfig) -> &str
{   config.models.first().map(String::as_str).unwrap_or("")
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter
{   async fn generate_sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    ) -> Result<GenerationResponse>
    {   self.sql(ctx, req, SqlTask::Generate).await
    }

    async fn fix_sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    ) -> Result<GenerationResponse>
    {   self.sql(ctx, req, SqlTask::Fix).await
    }

    async fn chat(
      &self
    , ctx: &RequestContext
    , req: &ChatRequest
    ) -> Result<ChatResponse>
    {   let started = Instant::now();
        let config = self.config.current();
        let model = pick_model(&req.model, default_model(&config));
        let (system, user) = chat_prompt(req);
        let messages = vec![
          ChatMessage::new("system", &system),
          ChatMessage::new("user", &user),
        ];

        let completion = ctx.run(self.complete(
          &config, messages, model, req.max_tokens, req.temperature,
        )).await?;
        Ok(chat_response(ProviderId::OpenAi, completion, started))
    }

    async fn get_health(&self, ctx: &RequestContext) -> HealthStatus
    {   let config = self.config.current();
        let url = format!("{}/models", config.base_url.trim_end_matches('/'));
        let request = self.authorized(&config, self.http.get(url));

        match probe_json(ctx, ProviderId::OpenAi, request).await
        {   Ok((body, elapsed)) => {
              if body.get("data").map_or(false, |d| d.is_array())
              {   HealthStatus::healthy(
                    ProviderId::OpenAi, "API reachable", elapsed
                  )
              } else
              {   HealthStatus::unhealthy(
                    ProviderId::OpenAi,
                    "malformed response body: missing model list",
                    elapsed,
                  )
              }
            }
          , Err(status) => status
        }
    }

    async fn list_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>>
    {   let config = self.config.current();
        let url = format!("{}/models", config.base_url.trim_end_matches('/'));
        let request = self.authorized(&config, self.http.get(url));

        let models: ModelsResponse = ctx.run(async {
          let response = send(ProviderId::OpenAi, request).await?;
          read_json(ProviderId::OpenAi, response).await
        }).await?;

        let infos: Vec<ModelInfo> = models.data
          .into_iter()
          .map(|m| {
            let mut info = ModelInfo::new(&m.id, ProviderId::OpenAi)
              .with_capabilities(&infer_capabilities(&m.id));
            info.max_tokens = Some(context_window_for(&m.id, config.context_window));
            if let Some(owner) = m.owned_by
            {   info.description = format!("Owned by {}", owner);
                info.metadata.insert("owned_by".to_string(), owner);
            }
            info
          })
          .collect();
        debug!("Retrieved {} OpenAI models", infos.len());
        Ok(infos)
    }

    fn provider_id(&self) -> ProviderId
    {   ProviderId::OpenAi
    }

    fn update_config(&self, settings: ProviderSettings) -> Result<()>
    {   match settings
        {   ProviderSettings::OpenAi(config) => {
              config.validate()?;
              debug!("Replacing OpenAI configuration");
              self.config.replace(config);
              Ok(())
            }
          , other => Err(settings_mismatch(ProviderId::OpenAi, &other))
        }
    }

    async fn close(&self) -> Result<()>
    {   debug!("Closing OpenAiAdapter");
        Ok(())
    }
}
