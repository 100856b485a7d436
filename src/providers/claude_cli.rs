use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error, trace};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::time::Instant;

use crate::config::{context_window_for, pick_model, ClaudeCliConfig, ProviderSettings};
use crate::error::{Error, Result};
use crate::prompt::{chat_prompt, PromptAssembler};
use crate::providers::{
  chat_response, settings_mismatch, sql_prompt, sql_response, Completion,
  ProviderAdapter, SharedConfig, SqlTask,
};
use crate::request::{
  ChatRequest, ChatResponse, GenerationRequest, GenerationResponse,
  HealthStatus, RequestContext,
};
use crate::{ModelInfo, ProviderId};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const MODEL_ALIASES: &[&str] = &["opus", "sonnet", "haiku"];

/// `--output-format json` result document
#[derive(Debug, Clone, Deserialize)]
struct CliResult
{   #[serde(default)]
    result: Option<String>
  , #[serde(default)]
    is_error: bool
  , #[serde(default)]
    subtype: Option<String>
  , #[serde(default)]
    usage: Option<CliUsage>
  , #[serde(default)]
    total_cost_usd: Option<f64>
  , #[serde(default)]
    session_id: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CliUsage
{   #[serde(default)]
    input_tokens: usize
  , #[serde(default)]
    output_tokens: usize
}

/// Claude Code CLI driven as a subprocess. Each call spawns the binary,
/// writes the prompt to stdin and reads one JSON result from stdout; the
/// child is killed if the call is dropped.
pub struct ClaudeCliAdapter
{   config: SharedConfig<ClaudeCliConfig>
  , assembler: PromptAssembler
}

impl ClaudeCliAdapter
{   pub fn new(
      config: ClaudeCliConfig
    , assembler: PromptAssembler
    ) -> Result<Self>
    {   config.validate()?;
        debug!("Creating ClaudeCliAdapter for {}", config.cli_path);
        Ok(ClaudeCliAdapter
        {   config: SharedConfig::new(config)
          , assembler
        })
    }

    pub fn config(&self) -> Arc<ClaudeCliConfig>
    {   self.config.current()
    }

    async fn invoke(
      &self
    , config: &ClaudeCliConfig
    , system: &str
    , prompt: &str
    , model: String
    ) -> Result<Completion>
    {   let mut command = Command::new(&config.cli_path);
        command
          .arg("-p")
          .arg("--output-format").arg("json")
          .arg("--model").arg(&model);
        if !system.trim().is_empty()
        {   command.arg("--append-system-prompt").arg(system);
        }
        command
          .stdin(Stdio::piped())
          .stdout(Stdio::piped())
          .stderr(Stdio::piped())
          .kill_on_drop(true);
        trace!("Claude CLI command: {:?}", command);

        let mut child = command.spawn().map_err(|e| {
          error!("Failed to start {}: {}", config.cli_path, e);
          if e.kind() == std::io::ErrorKind::NotFound
          {   Error::Configuration(
                format!("claudecode: {} not found", config.cli_path)
              )
          } else
          {   Error::Transport(format!("claudecode: spawn failed: {}", e))
          }
        })?;

        let stdin = child.stdin.take();
        let run = async {
          let (_, output) = tokio::join!(
            feed_stdin(stdin, prompt),
            child.wait_with_output(),
          );
          output
        };
        let output = tokio::time::timeout(config.timeout(), run)
          .await
          .map_err(|_| {
            error!("Claude CLI timed out after {:?}", config.timeout());
            Error::Transport(format!(
              "claudecode: timed out after {:?}", config.timeout()
            ))
          })?
          .map_err(|e| {
            Error::Transport(format!("claudecode: wait failed: {}", e))
          })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success()
        {   let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty()
            {   stdout.trim().to_string()
            } else
            {   stderr.trim().to_string()
            };
            error!("Claude CLI exited with {}: {}", output.status, message);
            return Err(Error::BackendApi
            {   provider: ProviderId::ClaudeCode
              , status: output.status.code()
                  .and_then(|c| u16::try_from(c).ok())
                  .unwrap_or(0)
              , message
            });
        }
        parse_cli_output(&stdout, model)
    }

    async fn sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    , task: SqlTask
    ) -> Result<GenerationResponse>
    {   let started = Instant::now();
        let config = self.config.current();
        let model = pick_model(&req.model, &config.model);
        debug!("Claude CLI {:?} with model {}", task, model);

        let window = context_window_for(&model, config.context_window);
        let prompt = sql_prompt(ctx, &self.assembler, task, req, window).await?;
        let completion = ctx.run(self.invoke(
          &config, &prompt.system_prompt, &prompt.user_prompt, model,
        )).await?;
        sql_response(ProviderId::ClaudeCode, completion, &prompt, started)
    }
}

async fn feed_stdin(stdin: Option<ChildStdin>, prompt: &str)
{   if let Some(mut stdin) = stdin
    {   if let Err(e) = stdin.write_all(prompt.as_bytes()).await
        {   debug!("Claude CLI closed stdin early: {}", e);
        }
        // dropping stdin sends EOF
    }
}

fn parse_cli_output(stdout: &str, model: String) -> Result<Completion>
{   let stdout = stdout.trim();
    if stdout.is_empty()
    {   return Err(Error::Parse("claudecode: empty output".to_string()));
    }

    let as_text = || Completion
    {   text: stdout.to_string()
      , model: model.clone()
      , ..Default::default()
    };
    let value: Value = match serde_json::from_str(stdout)
    {   Ok(value) => value
      , Err(_) => {
          debug!("Claude CLI output is not JSON, using it as text");
          return Ok(as_text());
        }
    };
    let is_result = value.get("type").and_then(Value::as_str) == Some("result")
      || value.get("result").is_some();
    if !is_result
    {   return Ok(as_text());
    }
    let parsed: CliResult = serde_json::from_value(value)?;

    if parsed.is_error
    {   let message = parsed.result
          .or(parsed.subtype)
          .unwrap_or_else(|| "unknown error".to_string());
        return Err(Error::BackendApi
        {   provider: ProviderId::ClaudeCode
          , status: 0
          , message
        });
    }
    let text = parsed.result.ok_or_else(|| {
      Error::Parse("claudecode: JSON output has no result".to_string())
    })?;

    let mut metadata = HashMap::new();
    if let Some(cost) = parsed.total_cost_usd
    {   metadata.insert("total_cost_usd".to_string(), cost.to_string());
    }
    if let Some(session) = parsed.session_id
    {   metadata.insert("session_id".to_string(), session);
    }
    let usage = parsed.usage.unwrap_or_default();
    Ok(Completion
    {   text
      , model
      , tokens_used: usage.input_tokens + usage.output_tokens
      , metadata
    })
}

/// Resolve the CLI binary: a path is checked directly, a bare name is
/// searched for on PATH.
fn locate_binary(cli_path: &str) -> Option<PathBuf>
{   let candidate = Path::new(cli_path);
    if candidate.components().count() > 1
    {   return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
      .map(|dir| dir.join(cli_path))
      .find(|p| p.is_file())
}

#[async_trait]
impl ProviderAdapter for ClaudeCliAdapter
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
        let model = pick_model(&req.model, &config.model);
        let (system, user) = chat_prompt(req);

        let completion = ctx.run(
          self.invoke(&config, &system, &user, model)
        ).await?;
        Ok(chat_response(ProviderId::ClaudeCode, completion, started))
    }

    async fn get_health(&self, ctx: &RequestContext) -> HealthStatus
    {   let started = Instant::now();
        let config = self.config.current();

        let binary = match locate_binary(&config.cli_path)
        {   Some(binary) => binary
          , None => {
              return HealthStatus::unhealthy(
                ProviderId::ClaudeCode,
                format!("binary missing: {} not found", config.cli_path),
                started.elapsed(),
              );
            }
        };

        let probe = async {
          let mut command = Command::new(&binary);
          command.arg("--version").kill_on_drop(true);
          tokio::time::timeout(VERSION_TIMEOUT, command.output())
            .await
            .map_err(|_| Error::Transport("--version timed out".to_string()))?
            .map_err(|e| Error::Transport(e.to_string()))
        };

        let output = match ctx.run(probe).await
        {   Ok(output) => output
          , Err(e @ Error::Cancelled) | Err(e @ Error::DeadlineExceeded(_)) => {
              return HealthStatus::error(
                ProviderId::ClaudeCode, e.to_string(), started.elapsed()
              );
            }
          , Err(e) => {
              return HealthStatus::unhealthy(
                ProviderId::ClaudeCode,
                format!("failed to run {}: {}", binary.display(), e),
                started.elapsed(),
              );
            }
        };
        let elapsed = started.elapsed();

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success()
        {   HealthStatus::unhealthy(
              ProviderId::ClaudeCode,
              format!(
                "--version exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
              ),
              elapsed,
            )
        } else if version.is_empty()
        {   HealthStatus::unhealthy(
              ProviderId::ClaudeCode,
              "malformed --version output: empty",
              elapsed,
            )
        } else
        {   HealthStatus::healthy(ProviderId::ClaudeCode, version, elapsed)
        }
    }

    async fn list_models(&self, _ctx: &RequestContext) -> Result<Vec<ModelInfo>>
    {   let config = self.config.current();
        let mut ids = vec![config.model.clone()];
        ids.extend(
          MODEL_ALIASES.iter()
            .filter(|alias| **alias != config.model)
            .map(|alias| alias.to_string())
        );

        Ok(ids.into_iter()
          .map(|id| {
            let mut info = ModelInfo::new(&id, ProviderId::ClaudeCode)
              .with_capabilities(
                &["chat", "text-to-sql", "sql-fixing", "explanation"]
              );
            info.max_tokens = Some(context_window_for(&id, config.context_window));
            info.description = "Claude model via the Claude Code CLI".to_string();
            info
          })
          .collect())
    }

    fn provider_id(&self) -> ProviderId
    {   ProviderId::ClaudeCode
    }

    fn update_config(&self, settings: ProviderSettings) -> Result<()>
    {   match settings
        {   ProviderSettings::ClaudeCode(config) => {
              config.validate()?;
              debug!("Replacing Claude CLI configuration");
              self.config.replace(config);
              Ok(())
            }
          , other => Err(settings_mismatch(ProviderId::ClaudeCode, &other))
        }
    }

    async fn close(&self) -> Result<()>
    {   debug!("Closing ClaudeCliAdapter");
        Ok(())
    }
}
