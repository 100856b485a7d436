use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use log::{debug, trace, error};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{context_window_for, pick_model, AnthropicConfig, ProviderSettings};
use crate::error::{Error, Result};
use crate::prompt::{chat_prompt, PromptAssembler};
use crate::providers::{
  chat_response, probe_json, read_json, send, settings_mismatch, sql_prompt,
  sql_response, Completion, ProviderAdapter, SharedConfig, SqlTask,
};
use crate::request::{
  ChatRequest, ChatResponse, GenerationRequest, GenerationResponse,
  HealthStatus, RequestContext,
};
use crate::{ModelInfo, ProviderId};

const GENERATE_TEMPERATURE: f32 = 0.3;
const FIX_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, Serialize)]
struct Message
{   role: &'static str
  , content: String
}

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest
{   model: String
  , max_tokens: usize
  , #[serde(skip_serializing_if = "String::is_empty")]
    system: String
  , messages: Vec<Message>
  , #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse
{   #[serde(default)]
    model: Option<String>
  , content: Vec<ContentBlock>
  , #[serde(default)]
    stop_reason: Option<String>
  , #[serde(default)]
    usage: Option<Usage>
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock
{   #[serde(rename = "type")]
    kind: String
  , #[serde(default)]
    text: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Usage
{   #[serde(default)]
    input_tokens: usize
  , #[serde(default)]
    output_tokens: usize
}

/// Anthropic messages API backend. Model listing is static.
pub struct AnthropicAdapter
{   config: SharedConfig<AnthropicConfig>
  , http: reqwest::Client
  , assembler: PromptAssembler
}

impl AnthropicAdapter
{   pub fn new(
      config: AnthropicConfig
    , assembler: PromptAssembler
    ) -> Result<Self>
    {   config.validate()?;
        debug!("Creating AnthropicAdapter for {}", config.base_url);
        Ok(AnthropicAdapter
        {   config: SharedConfig::new(config)
          , http: reqwest::Client::new()
          , assembler
        })
    }

    pub fn config(&self) -> Arc<AnthropicConfig>
    {   self.config.current()
    }

    fn request(
      &self
    , config: &AnthropicConfig
    , method: reqwest::Method
    , path: &str
    ) -> reqwest::RequestBuilder
    {   let url = format!("{}{}", config.base_url.trim_end_matches('/'), path);
        self.http.request(method, url)
          .header("x-api-key", &config.api_key)
          .header("anthropic-version", &config.version)
          .timeout(config.timeout())
    }

    async fn complete(
      &self
    , config: &AnthropicConfig
    , system: String
    , user: String
    , model: String
    , max_tokens: Option<usize>
    , temperature: Option<f32>
    ) -> Result<Completion>
    {   let request = MessagesRequest
        {   model: model.clone()
          , max_tokens: max_tokens.unwrap_or(config.max_output_tokens)
          , system
          , messages: vec![Message { role: "user", content: user }]
          , temperature
        };
        trace!("Anthropic request: {:?}", request);

        let response = send(
          ProviderId::Anthropic,
          self.request(config, reqwest::Method::POST, "/v1/messages")
            .json(&request),
        ).await?;
        let body: MessagesResponse
          = read_json(ProviderId::Anthropic, response).await?;

        let text = body.content
          .iter()
          .filter(|block| block.kind == "text")
          .filter_map(|block| block.text.as_deref())
          .collect::<Vec<_>>()
          .join("");
        if body.content.is_empty()
        {   error!("No content blocks in Anthropic response");
            return Err(Error::Parse(
              "anthropic: no content in response".to_string()
            ));
        }

        let mut metadata = HashMap::new();
        if let Some(reason) = body.stop_reason
        {   metadata.insert("stop_reason".to_string(), reason);
        }
        let usage = body.usage.unwrap_or_default();
        Ok(Completion
        {   text
          , model: body.model.unwrap_or(model)
          , tokens_used: usage.input_tokens + usage.output_tokens
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
        debug!("Anthropic {:?} with model {}", task, model);

        let window = context_window_for(&model, config.context_window);
        let prompt = sql_prompt(ctx, &self.assembler, task, req, window).await?;
        let temperature = match task
        {   SqlTask::Generate => GENERATE_TEMPERATURE
          , SqlTask::Fix => FIX_TEMPERATURE
        };

        let completion = ctx.run(self.complete(
          &config,
          prompt.system_prompt.clone(),
          prompt.user_prompt.clone(),
          model,
          req.max_tokens,
          Some(req.temperature.unwrap_or(temperature)),
        )).await?;
        sql_response(ProviderId::Anthropic, completion, &prompt, started)
    }
}

fn default_model(config: &AnthropicConfig) -> &str
{   config.models.first().map(String::as_str).unwrap_or("")
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter
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

        let completion = ctx.run(self.complete(
          &config, system, user, model, req.max_tokens, req.temperature,
        )).await?;
        Ok(chat_response(ProviderId::Anthropic, completion, started))
    }

    async fn get_health(&self, ctx: &RequestContext) -> HealthStatus
    {   let config = self.config.current();
        let request = self.request(&config, reqwest::Method::GET, "/v1/models");

        match probe_json(ctx, ProviderId::Anthropic, request).await
        {   Ok((_, elapsed)) => HealthStatus::healthy(
              ProviderId::Anthropic, "API reachable", elapsed
            )
          , Err(status) => status
        }
    }

    async fn list_models(&self, _ctx: &RequestContext) -> Result<Vec<ModelInfo>>
    {   let config = self.config.current();
        Ok(config.models.iter()
          .map(|id| {
            let mut info = ModelInfo::new(id, ProviderId::Anthropic)
              .with_capabilities(
                &["chat", "text-to-sql", "sql-fixing", "explanation"]
              );
            info.max_tokens = Some(context_window_for(id, config.context_window));
            info.description = "Anthropic Claude model".to_string();
            info
          })
          .collect())
    }

    fn provider_id(&self) -> ProviderId
    {   ProviderId::Anthropic
    }

    fn update_config(&self, settings: ProviderSettings) -> Result<()>
    {   match settings
        {   ProviderSettings::Anthropic(config) => {
              config.validate()?;
              debug!("Replacing Anthropic configuration");
              self.config.replace(config);
              Ok(())
            }
          , other => Err(settings_mismatch(ProviderId::Anthropic, &other))
        }
    }

    async fn close(&self) -> Result<()>
    {   debug!("Closing AnthropicAdapter");
        Ok(())
    }
}
