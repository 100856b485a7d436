use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use sqlgate::budget::{plan_context_budget, COMPONENT_EXAMPLES, COMPONENT_SCHEMA};
use sqlgate::prompt::{chat_prompt, CHAT_SYSTEM_PROMPT};
use sqlgate::request::{CONTEXT_CONNECTION_ID, CONTEXT_CONNECTION_TYPE};
use sqlgate::{
  BudgetAllocation, ChatRequest, ContextBundle, ContextRetriever, Error,
  GenerationRequest, PromptAssembler, RequestContext, Result, SqlDialect,
};

fn init()
{   let _ = env_logger::builder().is_test(true).try_init();
}

/// Serves a fixed bundle and counts calls
#[derive(Default)]
struct FixedRetriever
{   calls: AtomicUsize
  , fail: bool
  , /// Time spent before answering
    delay: Option<Duration>
}

#[async_trait]
impl ContextRetriever for FixedRetriever
{   async fn build_context_with_budget(
      &self
    , query: &str
    , connection_id: &str
    , max_tokens: usize
    , is_error_fix: bool
    ) -> Result<(ContextBundle, BudgetAllocation)>
    {   self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(connection_id, "conn-1");
        if let Some(delay) = self.delay
        {   tokio::time::sleep(delay).await;
        }
        if self.fail
        {   return Err(Error::Transport("vector store offline".to_string()));
        }
        let allocation = plan_context_budget(query, max_tokens, is_error_fix)?;
        let bundle = ContextBundle
        {   schemas: vec!["users(id, name, email)".to_string()]
          , examples: vec!["SELECT id FROM users".to_string()]
          , business_rules: vec![]
          , performance_hints: vec![]
        };
        Ok((bundle, allocation))
    }
}

fn assembler(retriever: Arc<FixedRetriever>) -> PromptAssembler
{   PromptAssembler::new().with_retriever(retriever)
}

#[tokio::test]
async fn test_generation_prompt_with_context()
{   init();
    let retriever = Arc::new(FixedRetriever::default());
    let req = GenerationRequest::new("list all users")
      .with_context(CONTEXT_CONNECTION_ID, "conn-1");

    let prompt = assembler(retriever.clone())
      .build_generation_prompt(&RequestContext::new(), &req, SqlDialect::PostgreSql, 8192)
      .await
      .unwrap();

    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    assert!(prompt.system_prompt.contains("## Database Dialect: postgresql"));
    assert!(prompt.system_prompt.contains("### PostgreSQL Specifics"));
    assert!(prompt.user_prompt.starts_with("## Database Schema\n\n- users(id, name, email)"));
    assert!(prompt.user_prompt.contains("### Example 1\n\n```sql\nSELECT id FROM users\n```"));
    assert!(prompt.user_prompt.contains("## User Request\n\nlist all users"));
    assert!(!prompt.user_prompt.contains("## Business Rules"));

    let schema_at = prompt.user_prompt.find("## Database Schema").unwrap();
    let request_at = prompt.user_prompt.find("## User Request").unwrap();
    assert!(schema_at < request_at);

    let allocation = prompt.allocation.expect("retrieval allocation");
    assert!(allocation.component(COMPONENT_SCHEMA).unwrap().is_frozen());
    assert!(allocation.component(COMPONENT_EXAMPLES).unwrap().is_frozen());
    assert!(allocation.validate(8192).is_ok());
}

#[tokio::test]
async fn test_retrieval_failure_falls_back()
{   init();
    let retriever = Arc::new(FixedRetriever { fail: true, ..Default::default() });
    let req = GenerationRequest::new("list all users")
      .with_schema("CREATE TABLE users (id int)")
      .with_context(CONTEXT_CONNECTION_ID, "conn-1");

    let prompt = assembler(retriever.clone())
      .build_generation_prompt(&RequestContext::new(), &req, SqlDialect::Generic, 4096)
      .await
      .unwrap();

    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    assert!(prompt.allocation.is_none());
    assert!(prompt.user_prompt.starts_with(
      "## Database Schema\n\nCREATE TABLE users (id int)\n\n## Request\n\nlist all users"
    ));
}

#[tokio::test]
async fn test_no_connection_skips_retrieval()
{   let retriever = Arc::new(FixedRetriever::default());
    let req = GenerationRequest::new("count orders")
      .with_context(CONTEXT_CONNECTION_ID, "   ");

    let prompt = assembler(retriever.clone())
      .build_generation_prompt(&RequestContext::new(), &req, SqlDialect::Generic, 4096)
      .await
      .unwrap();

    assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
    assert!(prompt.allocation.is_none());
    assert!(prompt.user_prompt.starts_with("## Request\n\ncount orders"));
}

#[tokio::test]
async fn test_fix_prompt_sections()
{   let req = GenerationRequest::fix("SELEC * FROM users", "syntax error at or near \"SELEC\"")
      .with_prompt("should list every user");

    let prompt = PromptAssembler::new()
      .build_fix_prompt(&RequestContext::new(), &req, SqlDialect::MySql, 4096)
      .await
      .unwrap();

    assert!(prompt.system_prompt.contains("## Error Category: syntax"));
    assert!(prompt.system_prompt.contains("### Syntax Error Guidance"));
    assert!(prompt.system_prompt.contains("### MySQL Specifics"));
    assert!(prompt.user_prompt.contains("## Error Message\n\nsyntax error at or near \"SELEC\""));
    assert!(prompt.user_prompt.contains("## Broken Query\n\n```sql\nSELEC * FROM users\n```"));
    assert!(prompt.user_prompt.contains("## Additional Context\n\nshould list every user"));
    assert!(prompt.allocation.is_none());
}

#[tokio::test]
async fn test_fix_prompt_retrieves_with_error_text()
{   let retriever = Arc::new(FixedRetriever::default());
    let req = GenerationRequest::fix("SELECT nme FROM users", "column \"nme\" does not exist")
      .with_context(CONTEXT_CONNECTION_ID, "conn-1");

    let prompt = assembler(retriever.clone())
      .build_fix_prompt(&RequestContext::new(), &req, SqlDialect::PostgreSql, 8192)
      .await
      .unwrap();

    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    assert!(prompt.system_prompt.contains("### Reference Error Guidance"));
    assert!(prompt.user_prompt.contains("## Broken Query"));
    assert!(prompt.allocation.is_some());
}

#[test]
fn test_dialect_for_request()
{   let assembler = PromptAssembler::new().with_default_dialect(SqlDialect::Oracle);
    let req = GenerationRequest::new("x");
    assert_eq!(assembler.dialect_for(&req), SqlDialect::Oracle);

    let req = req.with_context(CONTEXT_CONNECTION_TYPE, "sqlite3");
    assert_eq!(assembler.dialect_for(&req), SqlDialect::Sqlite);
}

#[test]
fn test_chat_prompt()
{   let (system, user) = chat_prompt(&ChatRequest::new("what is a join?"));
    assert_eq!(system, CHAT_SYSTEM_PROMPT);
    assert_eq!(user, "what is a join?");

    let mut req = ChatRequest::new("explain it")
      .with_context("SELECT * FROM a JOIN b USING (id)");
    req.system = Some("Be brief.".to_string());
    let (system, user) = chat_prompt(&req);
    assert_eq!(system, "Be brief.");
    assert_eq!(
      user,
      "## Context\n\nSELECT * FROM a JOIN b USING (id)\n\n## Question\n\nexplain it"
    );
}

fn slow_retriever() -> Arc<FixedRetriever>
{   Arc::new(FixedRetriever
    {   delay: Some(Duration::from_secs(30))
      , ..Default::default()
    })
}

#[tokio::test]
async fn test_deadline_stops_slow_retrieval()
{   init();
    let retriever = slow_retriever();
    let req = GenerationRequest::new("list all users")
      .with_context(CONTEXT_CONNECTION_ID, "conn-1");

    let started = Instant::now();
    let ctx = RequestContext::with_timeout(Duration::from_millis(200));
    let err = assembler(retriever.clone())
      .build_generation_prompt(&ctx, &req, SqlDialect::Generic, 4096)
      .await
      .unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_stops_slow_retrieval()
{   let retriever = slow_retriever();
    let req = GenerationRequest::fix("SELECT nme FROM users", "column \"nme\" does not exist")
      .with_context(CONTEXT_CONNECTION_ID, "conn-1");

    let cancel = CancellationToken::new();
    let ctx = RequestContext::new().with_cancel(cancel.clone());
    let trigger = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      cancel.cancel();
    });

    let started = Instant::now();
    let err = assembler(retriever)
      .build_fix_prompt(&ctx, &req, SqlDialect::PostgreSql, 8192)
      .await
      .unwrap_err();
    trigger.await.unwrap();

    assert_eq!(err, Error::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3));
}
