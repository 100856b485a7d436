use std::sync::Arc;
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::{context_window_for, pick_model, OllamaConfig, ProviderSettings};
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

const GENERATE_TEMPERATURE: f32 = 0.3;
const FIX_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest
{   model: String
  , prompt: String
  , #[serde(skip_serializing_if = "String::is_empty")]
    system: String
  , stream: bool
  , options: GenerateOptions
}

#[derive(Debug, Clone, Default, Serialize)]
struct GenerateOptions
{   #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>
  , #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse
{   #[serde(default)]
    model: Option<String>
  , response: String
  , #[serde(default)]
    prompt_eval_count: usize
  , #[serde(default)]
    eval_count: usize
}

#[derive(Debug, Clone, Serialize)]
struct PullRequest<'a>
{   name: &'a str
  , stream: bool
}

#[derive(Debug, Clone, Deserialize)]
struct TagsResponse
{   #[serde(default)]
    models: Vec<LocalModel>
}

#[derive(Debug, Clone, Deserialize)]
struct LocalModel
{   name: String
  , #[serde(default)]
    size: Option<u64>
  , #[serde(default)]
    modified_at: Option<String>
}

/// `name` and `name:latest` are the same model
fn same_model(a: &str, b: &str) -> bool
{   let strip = |m: &str| {
      m.trim().strip_suffix(":latest").unwrap_or(m.trim()).to_string()
    };
    strip(a) == strip(b)
}

/// Local Ollama runner. Checks that a model is present before using it
/// and optionally pulls it.
pub struct OllamaAdapter
{   config: SharedConfig<OllamaConfig>
  , http: reqwest::Client
  , assembler: PromptAssembler
}

impl OllamaAdapter
{   pub fn new(
      config: OllamaConfig
    , assembler: PromptAssembler
    ) -> Result<Self>
    {   config.validate()?;
        debug!("Creating OllamaAdapter for {}", config.endpoint);
        Ok(OllamaAdapter
        {   config: SharedConfig::new(config)
          , http: reqwest::Client::new()
          , assembler
        })
    }

    pub fn config(&self) -> Arc<OllamaConfig>
    {   self.config.current()
    }

    fn url(config: &OllamaConfig, path: &str) -> String
    {   format!("{}{}", config.endpoint.trim_end_matches('/'), path)
    }

    async fn tags(&self, config: &OllamaConfig) -> Result<Vec<LocalModel>>
    {   let request = self.http
          .get(Self::url(config, "/api/tags"))
          .timeout(config.generate_timeout());
        let response = send(ProviderId::Ollama, request).await?;
        let tags: TagsResponse = read_json(ProviderId::Ollama, response).await?;
        Ok(tags.models)
    }

    /// Whether `model` has been pulled
    pub async fn has_model(&self, ctx: &RequestContext, model: &str) -> Result<bool>
    {   let config = self.config.current();
        let models = ctx.run(self.tags(&config)).await?;
        Ok(models.iter().any(|m| same_model(&m.name, model)))
    }

    /// Download `model`, bounded by the pull timeout
    pub async fn pull_model(&self, ctx: &RequestContext, model: &str) -> Result<()>
    {   let config = self.config.current();
        self.pull(ctx, &config, model).await
    }

    async fn pull(
      &self
    , ctx: &RequestContext
    , config: &OllamaConfig
    , model: &str
    ) -> Result<()>
    {   info!("Pulling Ollama model {}", model);
        let request = self.http
          .post(Self::url(config, "/api/pull"))
          .timeout(config.pull_timeout())
          .json(&PullRequest { name: model, stream: false });

        let body: Value = ctx.run(async {
          let response = send(ProviderId::Ollama, request).await?;
          read_json(ProviderId::Ollama, response).await
        }).await?;

        if let Some(message) = body.get("error").and_then(Value::as_str)
        {   return Err(Error::BackendApi
            {   provider: ProviderId::Ollama
              , status: 200
              , message: message.to_string()
            });
        }
        debug!("Pulled Ollama model {}", model);
        Ok(())
    }

    /// Make sure `model` is available, pulling it only when allowed
    async fn ensure_model(
      &self
    , ctx: &RequestContext
    , config: &OllamaConfig
    , model: &str
    ) -> Result<()>
    {   let models = ctx.run(self.tags(config)).await?;
        if models.iter().any(|m| same_model(&m.name, model))
        {   return Ok(());
        }
        if !config.auto_pull_models
        {   warn!("Ollama model {} is not pulled", model);
            return Err(Error::Configuration(format!(
              "ollama: model {} is not pulled; run `ollama pull {}` or \
               enable auto_pull_models",
              model, model
            )));
        }
        self.pull(ctx, config, model).await
    }

    async fn complete(
      &self
    , config: &OllamaConfig
    , system: String
    , prompt: String
    , model: String
    , max_tokens: Option<usize>
    , temperature: Option<f32>
    ) -> Result<Completion>
    {   let request = GenerateRequest
        {   model: model.clone()
          , prompt
          , system
          , stream: false
          , options: GenerateOptions
            {   temperature
              , num_predict: max_tokens
            }
        };
        trace!("Ollama request: {:?}", request);

        let response = send(
          ProviderId::Ollama,
          self.http
            .post(Self::url(config, "/api/generate"))
            .timeout(config.generate_timeout())
            .json(&request),
        ).await?;
        let body: GenerateResponse
          = read_json(ProviderId::Ollama, response).await?;

        Ok(Completion
        {   text: body.response
          , model: body.model.unwrap_or(model)
          , tokens_used: body.prompt_eval_count + body.eval_count
          , metadata: Default::default()
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
        debug!("Ollama {:?} with model {}", task, model);
        self.ensure_model(ctx, &config, &model).await?;

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
        sql_response(ProviderId::Ollama, completion, &prompt, started)
    }
}

fn default_model(config: &OllamaConfig) -> &str
{   config.models.first().map(String::as_str).unwrap_or("")
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter
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
        self.ensure_model(ctx, &config, &model).await?;
        let (system, user) = chat_prompt(req);

        let completion = ctx.run(self.complete(
          &config, system, user, model, req.max_tokens, req.temperature,
        )).await?;
        Ok(chat_response(ProviderId::Ollama, completion, started))
    }

    async fn get_health(&self, ctx: &RequestContext) -> HealthStatus
    {   let config = self.config.current();
        let request = self.http
          .get(Self::url(&config, "/api/tags"))
          .timeout(config.generate_timeout());

        let (body, elapsed) =
          match probe_json(ctx, ProviderId::Ollama, request).await
          {   Ok(found) => found
            , Err(status) => return status
          };

        let names: Vec<&str> = match body.get("models").and_then(Value::as_array)
        {   Some(models) => models.iter()
              .filter_map(|m| m.get("name").and_then(Value::as_str))
              .collect()
          , None => {
              return HealthStatus::unhealthy(
                ProviderId::Ollama,
                "malformed response body: missing model list",
                elapsed,
              );
            }
        };

        let model = default_model(&config);
        if names.iter().any(|n| same_model(n, model))
        {   HealthStatus::healthy(
              ProviderId::Ollama,
              format!("service running, {} models available", names.len()),
              elapsed,
            )
        } else
        {   HealthStatus::unhealthy(
              ProviderId::Ollama,
              format!("model {} not pulled", model),
              elapsed,
            )
        }
    }

    async fn list_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>>
    {   let config = self.config.current();
        let models = ctx.run(self.tags(&config)).await?;

        Ok(models.into_iter()
          .map(|m| {
            let mut info = ModelInfo::new(&m.name, ProviderId::Ollama)
              .with_capabilities(&infer_capabilities(&m.name));
            info.max_tokens = Some(context_window_for(&m.name, config.context_window));
            info.description = "Local Ollama model".to_string();
            if let Some(size) = m.size
            {   info.metadata.insert("size".to_string(), size.to_string());
            }
            if let Some(modified) = m.modified_at
            {   info.metadata.insert("modified_at".to_string(), modified);
            }
            info
          })
          .collect())
    }

    fn provider_id(&self) -> ProviderId
    {   ProviderId::Ollama
    }

    fn update_config(&self, settings: ProviderSettings) -> Result<()>
    {   match settings
        {   ProviderSettings::Ollama(config) => {
              config.validate()?;
              debug!("Replacing Ollama configuration");
              self.config.replace(config);
              Ok(())
            }
          , other => Err(settings_mismatch(ProviderId::Ollama, &other))
        }
    }

    async fn close(&self) -> Result<()>
    {   debug!("Closing OllamaAdapter");
        Ok(())
    }
}
