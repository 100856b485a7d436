use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sqlgate::config::{AnthropicConfig, OllamaConfig, OpenAiConfig, ProviderSettings};
use sqlgate::providers::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter};
use sqlgate::request::CONTEXT_CONNECTION_ID;
use sqlgate::{
  BudgetAllocation, ChatRequest, ContextBundle, ContextRetriever, Error,
  GenerationRequest, HealthState, PromptAssembler, ProviderAdapter,
  ProviderId, RequestContext,
};

fn init()
{   let _ = env_logger::builder().is_test(true).try_init();
}

fn openai(server: &MockServer) -> OpenAiAdapter
{   let mut config = OpenAiConfig::new("test-key");
    config.base_url = server.uri();
    OpenAiAdapter::new(config, PromptAssembler::new()).unwrap()
}

fn anthropic(server: &MockServer) -> AnthropicAdapter
{   let mut config = AnthropicConfig::new("test-key");
    config.base_url = server.uri();
    AnthropicAdapter::new(config, PromptAssembler::new()).unwrap()
}

fn ollama(server: &MockServer, auto_pull: bool) -> OllamaAdapter
{   let config = OllamaConfig
    {   endpoint: server.uri()
      , auto_pull_models: auto_pull
      , ..Default::default()
    };
    OllamaAdapter::new(config, PromptAssembler::new()).unwrap()
}

fn completion(content: &str) -> serde_json::Value
{   json!({
      "model": "gpt-4o-mini",
      "choices": [
        { "message": { "role": "assistant", "content": content }
        , "finish_reason": "stop"
        }
      ],
      "usage": { "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150 }
    })
}

// ===== OpenAI =====

#[tokio::test]
async fn test_openai_generate_sql()
{   init();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(header("authorization", "Bearer test-key"))
      .and(body_partial_json(json!({ "model": "gpt-4o-mini", "stream": false })))
      .respond_with(ResponseTemplate::new(200).set_body_json(
        completion("```sql\nSELECT * FROM users\n```")
      ))
      .expect(1)
      .mount(&server)
      .await;

    let adapter = openai(&server);
    let response = adapter
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("all users"))
      .await
      .unwrap();

    assert_eq!(response.query, "SELECT * FROM users");
    assert_eq!(response.confidence, 0.8);
    assert_eq!(response.provider_id, ProviderId::OpenAi);
    assert_eq!(response.model, "gpt-4o-mini");
    assert_eq!(response.tokens_used, 150);
    assert_eq!(response.metadata.get("finish_reason").map(String::as_str), Some("stop"));
    assert_eq!(
      response.metadata.get("extraction_tier").map(String::as_str),
      Some("code_block")
    );
}

#[tokio::test]
async fn test_openai_backend_error_is_verbatim()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(ResponseTemplate::new(401).set_body_json(json!({
        "error": { "message": "Incorrect API key provided: sk-...", "type": "invalid_request_error" }
      })))
      .mount(&server)
      .await;

    let err = openai(&server)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap_err();

    assert_eq!(err, Error::BackendApi
    {   provider: ProviderId::OpenAi
      , status: 401
      , message: "Incorrect API key provided: sk-...".to_string()
    });
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_openai_undecodable_body_is_parse_error()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
      .mount(&server)
      .await;

    let err = openai(&server)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "{:?}", err);
}

#[tokio::test]
async fn test_openai_refusal_is_extraction_failure()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(ResponseTemplate::new(200).set_body_json(
        completion("I cannot help with that.")
      ))
      .mount(&server)
      .await;

    let err = openai(&server)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap_err();
    assert_eq!(err, Error::NoExtractableSql);
}

#[tokio::test]
async fn test_openai_deadline()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(completion("SELECT 1"))
          .set_delay(Duration::from_secs(5))
      )
      .mount(&server)
      .await;

    let ctx = RequestContext::with_timeout(Duration::from_millis(200));
    let err = openai(&server)
      .generate_sql(&ctx, &GenerationRequest::new("x"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(_)), "{:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_openai_cancelled()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(ResponseTemplate::new(200).set_body_json(completion("SELECT 1")))
      .expect(0)
      .mount(&server)
      .await;

    let token = CancellationToken::new();
    token.cancel();
    let ctx = RequestContext::new().with_cancel(token);
    let err = openai(&server)
      .generate_sql(&ctx, &GenerationRequest::new("x"))
      .await
      .unwrap_err();
    assert_eq!(err, Error::Cancelled);
}

/// Retriever that never answers in time
struct HungRetriever;

#[async_trait]
impl ContextRetriever for HungRetriever
{   async fn build_context_with_budget(
      &self
    , _query: &str
    , _connection_id: &str
    , _max_tokens: usize
    , _is_error_fix: bool
    ) -> sqlgate::Result<(ContextBundle, BudgetAllocation)>
    {   tokio::time::sleep(Duration::from_secs(30)).await;
        Err(Error::Transport("retriever gave up".to_string()))
    }
}

#[tokio::test]
async fn test_openai_deadline_covers_retrieval()
{   init();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(ResponseTemplate::new(200).set_body_json(completion("SELECT 1")))
      .expect(0)
      .mount(&server)
      .await;

    let mut config = OpenAiConfig::new("test-key");
    config.base_url = server.uri();
    let assembler = PromptAssembler::new().with_retriever(Arc::new(HungRetriever));
    let adapter = OpenAiAdapter::new(config, assembler).unwrap();

    let req = GenerationRequest::new("all users")
      .with_context(CONTEXT_CONNECTION_ID, "conn-1");
    let started = Instant::now();
    let ctx = RequestContext::with_timeout(Duration::from_millis(200));
    let err = adapter.generate_sql(&ctx, &req).await.unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_openai_chat()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(body_partial_json(json!({ "model": "gpt-4o" })))
      .respond_with(ResponseTemplate::new(200).set_body_json(
        completion("A join combines rows from two tables.")
      ))
      .mount(&server)
      .await;

    let req = ChatRequest::new("what is a join?").with_model("gpt-4o");
    let response = openai(&server)
      .chat(&RequestContext::new(), &req)
      .await
      .unwrap();
    assert_eq!(response.content, "A join combines rows from two tables.");
    assert_eq!(response.tokens_used, 150);
}

#[tokio::test]
async fn test_openai_health()
{   let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
      .mount(&server)
      .await;

    let status = openai(&server).get_health(&RequestContext::new()).await;
    assert_eq!(status.status, HealthState::Healthy);
    assert_eq!(status.provider_id, ProviderId::OpenAi);
}

#[tokio::test]
async fn test_openai_health_reports_status_code()
{   let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
      .mount(&server)
      .await;

    let status = openai(&server).get_health(&RequestContext::new()).await;
    assert_eq!(status.status, HealthState::Unhealthy);
    assert_eq!(status.message, "HTTP 503: overloaded");
}

#[tokio::test]
async fn test_openai_health_malformed_body()
{   let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "object": "list" })))
      .mount(&server)
      .await;

    let status = openai(&server).get_health(&RequestContext::new()).await;
    assert_eq!(status.status, HealthState::Unhealthy);
    assert!(status.message.starts_with("malformed response body"), "{}", status.message);
}

#[tokio::test]
async fn test_openai_health_unreachable()
{   let mut config = OpenAiConfig::new("test-key");
    config.base_url = "http://127.0.0.1:1".to_string();
    let adapter = OpenAiAdapter::new(config, PromptAssembler::new()).unwrap();

    let status = adapter.get_health(&RequestContext::new()).await;
    assert_eq!(status.status, HealthState::Unhealthy);
    assert!(status.message.starts_with("service unreachable"), "{}", status.message);
    assert!(!adapter.is_available(&RequestContext::new()).await);
}

#[tokio::test]
async fn test_openai_list_models()
{   let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [
          { "id": "gpt-4o", "owned_by": "openai" },
          { "id": "text-embedding-3-small", "owned_by": "openai" }
        ]
      })))
      .mount(&server)
      .await;

    let models = openai(&server).list_models(&RequestContext::new()).await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "gpt-4o");
    assert_eq!(models[0].max_tokens, Some(128_000));
    assert!(models[0].capabilities.contains("text-to-sql"));
    assert_eq!(models[1].capabilities.iter().collect::<Vec<_>>(), vec!["embedding"]);
}

#[tokio::test]
async fn test_openai_update_config()
{   let first = MockServer::start().await;
    let second = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(header("authorization", "Bearer rotated-key"))
      .respond_with(ResponseTemplate::new(200).set_body_json(completion("SELECT 2")))
      .expect(1)
      .mount(&second)
      .await;

    let adapter = openai(&first);
    let err = adapter
      .update_config(ProviderSettings::Ollama(OllamaConfig::default()))
      .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let err = adapter
      .update_config(ProviderSettings::OpenAi(OpenAiConfig::new("")))
      .unwrap_err();
    assert_eq!(err, Error::Configuration("openai: api_key is required".to_string()));
    assert_eq!(adapter.config().base_url, first.uri());

    let mut rotated = OpenAiConfig::new("rotated-key");
    rotated.base_url = second.uri();
    adapter.update_config(ProviderSettings::OpenAi(rotated)).unwrap();

    let response = adapter
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap();
    assert_eq!(response.query, "SELECT 2");
}

#[test]
fn test_openai_rejects_bad_config()
{   let err = OpenAiAdapter::new(OpenAiConfig::default(), PromptAssembler::new())
      .err()
      .unwrap();
    assert!(matches!(err, Error::Configuration(_)));

    let mut config = OpenAiConfig::new("k");
    config.base_url = "api.openai.com".to_string();
    assert!(OpenAiAdapter::new(config, PromptAssembler::new()).is_err());
}

// ===== Anthropic =====

#[tokio::test]
async fn test_anthropic_generate_sql()
{   init();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/messages"))
      .and(header("x-api-key", "test-key"))
      .and(header("anthropic-version", "2023-06-01"))
      .and(body_partial_json(json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 4096
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "model": "claude-3-5-sonnet-20241022",
        "content": [
          { "type": "text", "text": "{\"query\": \"SELECT 1\", \"confidence\": 0.9}" }
        ],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 10, "output_tokens": 5 }
      })))
      .expect(1)
      .mount(&server)
      .await;

    let response = anthropic(&server)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("one"))
      .await
      .unwrap();
    assert_eq!(response.query, "SELECT 1");
    assert_eq!(response.confidence, 0.9);
    assert_eq!(response.tokens_used, 15);
    assert_eq!(response.provider_id, ProviderId::Anthropic);
    assert_eq!(response.metadata.get("stop_reason").map(String::as_str), Some("end_turn"));
}

#[tokio::test]
async fn test_anthropic_backend_error_is_verbatim()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/messages"))
      .respond_with(ResponseTemplate::new(400).set_body_json(json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "message": "max_tokens: 999999 > 8192" }
      })))
      .mount(&server)
      .await;

    let err = anthropic(&server)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap_err();
    assert_eq!(err, Error::BackendApi
    {   provider: ProviderId::Anthropic
      , status: 400
      , message: "max_tokens: 999999 > 8192".to_string()
    });
}

#[tokio::test]
async fn test_anthropic_empty_content_is_parse_error()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/messages"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": [] })))
      .mount(&server)
      .await;

    let err = anthropic(&server)
      .chat(&RequestContext::new(), &ChatRequest::new("hi"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "{:?}", err);
}

#[tokio::test]
async fn test_anthropic_static_models()
{   let server = MockServer::start().await;
    let models = anthropic(&server).list_models(&RequestContext::new()).await.unwrap();
    assert_eq!(models.len(), 3);
    assert!(models.iter().all(|m| m.max_tokens == Some(200_000)));
    assert!(models.iter().all(|m| m.provider_id == ProviderId::Anthropic));
}

#[tokio::test]
async fn test_anthropic_models_use_context_window_override()
{   let server = MockServer::start().await;
    let mut config = AnthropicConfig::new("test-key");
    config.base_url = server.uri();
    config.context_window = Some(50_000);
    let adapter = AnthropicAdapter::new(config, PromptAssembler::new()).unwrap();

    let models = adapter.list_models(&RequestContext::new()).await.unwrap();
    assert!(!models.is_empty());
    assert!(models.iter().all(|m| m.max_tokens == Some(50_000)));
}

// ===== Ollama =====

async fn mount_tags(server: &MockServer, names: &[&str])
{   let models: Vec<_> = names.iter()
      .map(|n| json!({ "name": n, "size": 4_000_000_000u64 }))
      .collect();
    Mock::given(method("GET"))
      .and(path("/api/tags"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": models })))
      .mount(server)
      .await;
}

fn generated(text: &str) -> ResponseTemplate
{   ResponseTemplate::new(200).set_body_json(json!({
      "model": "sqlcoder:7b",
      "response": text,
      "done": true,
      "prompt_eval_count": 30,
      "eval_count": 12
    }))
}

#[tokio::test]
async fn test_ollama_generate_sql()
{   init();
    let server = MockServer::start().await;
    mount_tags(&server, &["sqlcoder:7b"]).await;
    Mock::given(method("POST"))
      .and(path("/api/generate"))
      .and(body_partial_json(json!({ "model": "sqlcoder:7b", "stream": false })))
      .respond_with(generated("SELECT count(*) FROM orders"))
      .expect(1)
      .mount(&server)
      .await;

    let response = ollama(&server, false)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("count orders"))
      .await
      .unwrap();
    assert_eq!(response.query, "SELECT count(*) FROM orders");
    assert_eq!(response.confidence, 0.7);
    assert_eq!(response.tokens_used, 42);
}

#[tokio::test]
async fn test_ollama_missing_model_without_auto_pull()
{   let server = MockServer::start().await;
    mount_tags(&server, &["llama3.1:8b"]).await;
    Mock::given(method("POST"))
      .and(path("/api/generate"))
      .respond_with(generated("SELECT 1"))
      .expect(0)
      .mount(&server)
      .await;

    let err = ollama(&server, false)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap_err();
    match err
    {   Error::Configuration(message) => {
          assert!(message.contains("sqlcoder:7b is not pulled"), "{}", message);
        }
      , other => panic!("expected a configuration error, got {:?}", other)
    }
}

#[tokio::test]
async fn test_ollama_auto_pull()
{   let server = MockServer::start().await;
    mount_tags(&server, &[]).await;
    Mock::given(method("POST"))
      .and(path("/api/pull"))
      .and(body_partial_json(json!({ "name": "sqlcoder:7b", "stream": false })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/generate"))
      .respond_with(generated("SELECT 1"))
      .expect(1)
      .mount(&server)
      .await;

    let response = ollama(&server, true)
      .generate_sql(&RequestContext::new(), &GenerationRequest::new("x"))
      .await
      .unwrap();
    assert_eq!(response.query, "SELECT 1");
}

#[tokio::test]
async fn test_ollama_pull_error_body()
{   let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/pull"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "error": "pull model manifest: file does not exist"
      })))
      .mount(&server)
      .await;

    let err = ollama(&server, true)
      .pull_model(&RequestContext::new(), "nope:1b")
      .await
      .unwrap_err();
    assert_eq!(err, Error::BackendApi
    {   provider: ProviderId::Ollama
      , status: 200
      , message: "pull model manifest: file does not exist".to_string()
    });
}

#[tokio::test]
async fn test_ollama_latest_tag_matches()
{   let server = MockServer::start().await;
    mount_tags(&server, &["codellama:latest"]).await;

    let adapter = ollama(&server, false);
    let ctx = RequestContext::new();
    assert!(adapter.has_model(&ctx, "codellama").await.unwrap());
    assert!(!adapter.has_model(&ctx, "codellama:13b").await.unwrap());
}

#[tokio::test]
async fn test_ollama_health()
{   let server = MockServer::start().await;
    mount_tags(&server, &["sqlcoder:7b", "llama3.1:8b"]).await;

    let status = ollama(&server, false).get_health(&RequestContext::new()).await;
    assert_eq!(status.status, HealthState::Healthy);
    assert_eq!(status.message, "service running, 2 models available");
}

#[tokio::test]
async fn test_ollama_health_model_not_pulled()
{   let server = MockServer::start().await;
    mount_tags(&server, &["llama3.1:8b"]).await;

    let status = ollama(&server, false).get_health(&RequestContext::new()).await;
    assert_eq!(status.status, HealthState::Unhealthy);
    assert_eq!(status.message, "model sqlcoder:7b not pulled");
}

#[tokio::test]
async fn test_ollama_list_models()
{   let server = MockServer::start().await;
    mount_tags(&server, &["sqlcoder:7b", "nomic-embed-text:latest"]).await;

    let models = ollama(&server, false).list_models(&RequestContext::new()).await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].max_tokens, Some(8_192));
    assert!(models[0].capabilities.contains("sql-fixing"));
    assert!(!models[0].capabilities.contains("chat"));
    assert!(models[1].capabilities.contains("embedding"));
    assert_eq!(
      models[0].metadata.get("size").map(String::as_str),
      Some("4000000000")
    );
}
