//! System and user prompt assembly for SQL generation and repair.

use std::sync::Arc;
use async_trait::async_trait;
use log::{debug, trace, warn};

use crate::budget::{
  estimate_tokens, truncate_to_token_budget, BudgetAllocation,
  COMPONENT_BUSINESS, COMPONENT_EXAMPLES, COMPONENT_PERFORMANCE,
  COMPONENT_SCHEMA,
};
use crate::dialect::{
  detect_error_category, resolve_dialect, ErrorCategory, SqlDialect,
};
use crate::error::{Error, Result};
use crate::request::{
  ChatRequest, GenerationRequest, RequestContext, CONTEXT_CONNECTION_ID,
};

/// System prompt for chat requests that do not bring their own
pub const CHAT_SYSTEM_PROMPT: &str = "You are a helpful database assistant. \
Answer questions about SQL, schemas and query behaviour clearly and \
concisely. When you show SQL, put it in a ```sql fenced block.";

const GENERATION_FORMAT: &str = r#"Provide your response in the following JSON format:
```json
{
  "query": "The generated SQL query",
  "explanation": "Brief explanation of the query",
  "confidence": 0.95,
  "suggestions": ["Optional improvements"],
  "warnings": ["Any caveats"]
}
```"#;

const FIX_FORMAT: &str = r#"Provide the fixed SQL in the following JSON format:
```json
{
  "query": "The corrected SQL query",
  "explanation": "What was wrong and how it was fixed",
  "confidence": 0.90,
  "suggestions": ["Additional improvements"],
  "warnings": ["Potential issues to watch for"]
}
```"#;

const SIMPLE_GENERATION_FORMAT: &str = "Provide your response in JSON format \
with: query, explanation, confidence, suggestions, and warnings.";
const SIMPLE_FIX_FORMAT: &str = "Provide the fixed SQL in JSON format with: \
query, explanation, confidence, suggestions, and warnings.";

/// Retrieved context, already trimmed by the retriever
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextBundle
{   /// Table descriptions, one per entry
    pub schemas: Vec<String>
  , /// Example queries, SQL only
    pub examples: Vec<String>
  , pub business_rules: Vec<String>
  , pub performance_hints: Vec<String>
}

impl ContextBundle
{   pub fn is_empty(&self) -> bool
    {   self.schemas.is_empty()
          && self.examples.is_empty()
          && self.business_rules.is_empty()
          && self.performance_hints.is_empty()
    }
}

/// External context retrieval (schema search, similar queries, ...)
#[async_trait]
pub trait ContextRetriever: Send + Sync
{   /// Fetch context for `query` on `connection_id` sized for a model
    /// with `max_tokens` of context. Returns the allocation it used.
    async fn build_context_with_budget(
      &self
    , query: &str
    , connection_id: &str
    , max_tokens: usize
    , is_error_fix: bool
    ) -> Result<(ContextBundle, BudgetAllocation)>;
}

/// Prompts ready to send. `allocation` is `None` when no retrieval took
/// place.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt
{   pub system_prompt: String
  , pub user_prompt: String
  , pub allocation: Option<BudgetAllocation>
}

/// Builds system and user prompts, pulling retrieved context in when a
/// retriever is configured and the request names a connection.
#[derive(Clone, Default)]
pub struct PromptAssembler
{   retriever: Option<Arc<dyn ContextRetriever>>
  , default_dialect: SqlDialect
}

impl std::fmt::Debug for PromptAssembler
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {   f.debug_struct("PromptAssembler")
          .field("retriever", &self.retriever.is_some())
          .field("default_dialect", &self.default_dialect)
          .finish()
    }
}

impl PromptAssembler
{   pub fn new() -> Self
    {   PromptAssembler::default()
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self
    {   self.retriever = Some(retriever);
        self
    }

    pub fn with_default_dialect(mut self, dialect: SqlDialect) -> Self
    {   self.default_dialect = dialect;
        self
    }

    pub fn has_retriever(&self) -> bool
    {   self.retriever.is_some()
    }

    /// Dialect named by the request context, else the default
    pub fn dialect_for(&self, req: &GenerationRequest) -> SqlDialect
    {   resolve_dialect(&req.freeform_context, self.default_dialect)
    }

    /// A retrieval error falls back to the simple prompt. Retrieval is
    /// bound by `ctx`, so only cancellation or an expired deadline fail.
    pub async fn build_generation_prompt(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    , dialect: SqlDialect
    , max_tokens: usize
    ) -> Result<AssembledPrompt>
    {   let system_prompt = generation_system_prompt(dialect);

        let prompt = match self.retrieve(ctx, req, &req.prompt, max_tokens, false).await?
        {   Some((bundle, mut allocation)) => {
              let user_prompt =
                generation_prompt_with_context(req, &bundle, &mut allocation);
              AssembledPrompt
              {   system_prompt
                , user_prompt
                , allocation: Some(allocation)
              }
            }
          , None => AssembledPrompt
            {   system_prompt
              , user_prompt: simple_generation_prompt(req)
              , allocation: None
            }
        };
        Ok(prompt)
    }

    /// Fix counterpart of [`Self::build_generation_prompt`]; the system
    /// prompt carries guidance for the detected error category.
    pub async fn build_fix_prompt(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    , dialect: SqlDialect
    , max_tokens: usize
    ) -> Result<AssembledPrompt>
    {   let category = detect_error_category(&req.error_message);
        debug!("fix prompt: dialect {}, error category {}", dialect, category);
        let system_prompt = fix_system_prompt(dialect, category);

        let retrieval_query = if req.prompt.trim().is_empty()
        {   &req.error_message
        } else
        {   &req.prompt
        };
        let prompt = match self.retrieve(ctx, req, retrieval_query, max_tokens, true).await?
        {   Some((bundle, mut allocation)) => {
              let user_prompt =
                fix_prompt_with_context(req, &bundle, &mut allocation);
              AssembledPrompt
              {   system_prompt
                , user_prompt
                , allocation: Some(allocation)
              }
            }
          , None => AssembledPrompt
            {   system_prompt
              , user_prompt: simple_fix_prompt(req)
              , allocation: None
            }
        };
        Ok(prompt)
    }

    /// `Ok(None)` when there is nothing to retrieve or the retriever
    /// failed; `Err` only when `ctx` stops the call.
    async fn retrieve(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    , query: &str
    , max_tokens: usize
    , is_error_fix: bool
    ) -> Result<Option<(ContextBundle, BudgetAllocation)>>
    {   let (retriever, connection_id) = match (
          self.retriever.as_ref(), req.context_value(CONTEXT_CONNECTION_ID)
        )
        {   (Some(retriever), Some(connection_id)) => (retriever, connection_id)
          , _ => return Ok(None)
        };

        let lookup = ctx.run(async {
          Ok::<_, Error>(retriever
            .build_context_with_budget(
              query, connection_id, max_tokens, is_error_fix
            )
            .await)
        })
        .await
        .map_err(|e| {
          debug!("context retrieval for connection {} stopped: {}", connection_id, e);
          e
        })?;

        match lookup
        {   Ok(found) => Ok(Some(found))
          , Err(e) => {
              warn!(
                "context retrieval for connection {} failed, using simple \
                 prompt: {}",
                connection_id, e
              );
              Ok(None)
            }
        }
    }
}

/// System and user prompt for a chat request
pub fn chat_prompt(req: &ChatRequest) -> (String, String)
{   let system = req.system.as_deref()
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .unwrap_or(CHAT_SYSTEM_PROMPT)
      .to_string();

    let user = match req.context.as_deref().map(str::trim)
    {   Some(context) if !context.is_empty() => {
          format!("## Context\n\n{}\n\n## Question\n\n{}", context, req.prompt)
        }
      , _ => req.prompt.clone()
    };
    (system, user)
}

fn simple_generation_prompt(req: &GenerationRequest) -> String
{   let mut parts = Vec::new();
    if !req.schema.trim().is_empty()
    {   parts.push(format!("## Database Schema\n\n{}", req.schema));
    }
    parts.push(format!("## Request\n\n{}", req.prompt));
    parts.push(SIMPLE_GENERATION_FORMAT.to_string());
    parts.join("\n\n")
}

fn simple_fix_prompt(req: &GenerationRequest) -> String
{   let mut parts = Vec::new();
    if !req.schema.trim().is_empty()
    {   parts.push(format!("## Database Schema\n\n{}", req.schema));
    }
    push_fix_sections(&mut parts, req);
    parts.push(SIMPLE_FIX_FORMAT.to_string());
    parts.join("\n\n")
}

fn generation_prompt_with_context(
  req: &GenerationRequest
, bundle: &ContextBundle
, allocation: &mut BudgetAllocation
) -> String
{   let mut parts = context_sections(bundle, allocation);
    if !req.schema.trim().is_empty()
    {   parts.push(format!("## Additional Schema Information\n\n{}", req.schema));
    }
    parts.push(format!("## User Request\n\n{}", req.prompt));
    parts.push(GENERATION_FORMAT.to_string());
    parts.join("\n\n")
}

fn fix_prompt_with_context(
  req: &GenerationRequest
, bundle: &ContextBundle
, allocation: &mut BudgetAllocation
) -> String
{   let mut parts = context_sections(bundle, allocation);
    if !req.schema.trim().is_empty()
    {   parts.push(format!("## Additional Schema Information\n\n{}", req.schema));
    }
    push_fix_sections(&mut parts, req);
    parts.push(FIX_FORMAT.to_string());
    parts.join("\n\n")
}

fn push_fix_sections(parts: &mut Vec<String>, req: &GenerationRequest)
{   parts.push(format!("## Error Message\n\n{}", req.error_message));
    parts.push(format!("## Broken Query\n\n```sql\n{}\n```", req.query));
    if !req.prompt.trim().is_empty()
    {   parts.push(format!("## Additional Context\n\n{}", req.prompt));
    }
}

/// Format each retrieved component inside its quota, then give back what
/// it did not use so later components can grow.
fn context_sections(
  bundle: &ContextBundle
, allocation: &mut BudgetAllocation
) -> Vec<String>
{   let components: [(&str, &str, &[String]); 4] = [
      (COMPONENT_SCHEMA, "## Database Schema", &bundle.schemas),
      (COMPONENT_EXAMPLES, "## Similar Query Examples", &bundle.examples),
      (COMPONENT_BUSINESS, "## Business Rules", &bundle.business_rules),
      (COMPONENT_PERFORMANCE, "## Performance Hints", &bundle.performance_hints),
    ];

    let mut sections = Vec::new();
    for (name, heading, items) in components
    {   let limit = allocation.tokens_for(name);
        if items.is_empty() || limit == 0 || !allocation.should_fetch(name)
        {   allocation.adjust_for_actual_usage(name, 0);
            continue;
        }
        let body = if name == COMPONENT_EXAMPLES
        {   format_examples(items)
        } else
        {   items.iter()
              .map(|item| format!("- {}", item.trim()))
              .collect::<Vec<_>>()
              .join("\n")
        };
        let section = truncate_to_token_budget(
          &format!("{}\n\n{}", heading, body), limit
        );
        let used = estimate_tokens(&section);
        let freed = allocation.adjust_for_actual_usage(name, used);
        trace!("{} section: {} of {} tokens, {} handed on", name, used, limit, freed);
        sections.push(section);
    }
    sections
}

fn format_examples(examples: &[String]) -> String
{   examples.iter()
      .enumerate()
      .map(|(i, sql)| {
        format!("### Example {}\n\n```sql\n{}\n```", i + 1, sql.trim())
      })
      .collect::<Vec<_>>()
      .join("\n\n")
}

/// System prompt for turning a request into SQL
pub fn generation_system_prompt(dialect: SqlDialect) -> String
{   format!(
      "You are an expert SQL query generator with deep knowledge of \
database systems and best practices.

Your task is to generate accurate, efficient and safe SQL queries from \
natural language requests.

## Database Dialect: {dialect}

{specifics}

## Guidelines

- Use table and column names exactly as they appear in the schema
- Prefer explicit INNER/LEFT JOIN with join conditions over comma joins
- Put every non-aggregated SELECT column in GROUP BY; filter groups with HAVING
- Use ORDER BY with explicit ASC/DESC and limit large result sets
- Handle NULL explicitly with COALESCE or IS NULL
- Use parameter placeholders for user-supplied values
- Never modify or delete data unless the request asks for it

## Response Format

Respond with a single JSON object:

{{
  \"query\": \"The generated SQL query\",
  \"explanation\": \"What the query does\",
  \"confidence\": 0.95,
  \"suggestions\": [\"Alternative approaches\"],
  \"warnings\": [\"Caveats the user should know\"]
}}

Confidence: 0.95-1.0 certain, 0.80-0.94 likely correct, 0.65-0.79 may \
need adjustment, 0.50-0.64 needs verification, below 0.50 uncertain.

When in doubt, prefer a simpler, safer query.",
      dialect = dialect,
      specifics = dialect_specifics(dialect),
    )
}

/// System prompt for repairing a failed query
pub fn fix_system_prompt(dialect: SqlDialect, category: ErrorCategory) -> String
{   format!(
      "You are an expert SQL debugger specializing in fixing broken queries.

## Database Dialect: {dialect}

{specifics}

## Error Category: {category}

{guidance}

## Debugging Process

1. Read the error message and find the root cause
2. Locate the failing part of the query
3. Check names and relationships against the schema
4. Make the smallest change that fixes the error
5. Keep the original intent and results of the query

When a query has several errors, fix syntax first, then references, then \
types, then logic, then performance.

## Response Format

Respond with a single JSON object:

{{
  \"query\": \"The corrected SQL query\",
  \"explanation\": \"What was wrong and how it was fixed\",
  \"confidence\": 0.90,
  \"suggestions\": [\"Further improvements\"],
  \"warnings\": [\"Things to watch for\"]
}}

If the query cannot be fixed without more information, say what is \
missing and set confidence below 0.50.",
      dialect = dialect,
      specifics = dialect_specifics(dialect),
      category = category,
      guidance = error_guidance(category),
    )
}

/// Syntax notes for one dialect
pub fn dialect_specifics(dialect: SqlDialect) -> &'static str
{   match dialect
    {   SqlDialect::PostgreSql => "### PostgreSQL Specifics
- Double quotes for identifiers, single quotes for literals
- Parameter placeholders: $1, $2, $3
- Case-insensitive matching with ILIKE
- Dates: NOW(), CURRENT_DATE, INTERVAL '1 day'
- JSON operators ->, ->> and jsonb_* functions
- LIMIT/OFFSET for pagination, RETURNING on writes
- Upserts with ON CONFLICT"
      , SqlDialect::MySql => "### MySQL Specifics
- Backticks for identifiers, single quotes for literals
- Parameter placeholders: ?
- String concatenation with CONCAT()
- Dates: NOW(), CURDATE(), DATE_ADD(), DATE_SUB()
- LIMIT offset, count for pagination
- IFNULL, IF() and COALESCE
- Upserts with ON DUPLICATE KEY UPDATE"
      , SqlDialect::Sqlite => "### SQLite Specifics
- Double quotes for identifiers, single quotes for literals
- Parameter placeholders: ?, :name, @name, $name
- String concatenation with ||
- Dates: datetime('now'), date('now'), julianday()
- No native BOOLEAN; use INTEGER 0/1
- Limited ALTER TABLE support
- Upserts with INSERT OR REPLACE"
      , SqlDialect::MsSql => "### SQL Server Specifics
- Square brackets for identifiers, single quotes for literals
- Parameter placeholders: @p1, @p2
- TOP N, or OFFSET/FETCH for pagination
- Dates: GETDATE(), DATEADD(), DATEDIFF()
- ISNULL and COALESCE
- OUTPUT clause on writes, MERGE for upserts"
      , SqlDialect::Oracle => "### Oracle Specifics
- Double quotes for case-sensitive identifiers
- Parameter placeholders: :1, :2 or :name
- FETCH FIRST n ROWS ONLY (12c+) or ROWNUM
- Dates: SYSDATE, TO_DATE(), ADD_MONTHS()
- NVL, NVL2, DECODE and COALESCE
- SELECT constants FROM DUAL
- MERGE for upserts, CONNECT BY for hierarchies"
      , SqlDialect::Generic => "### Generic SQL
- Stick to ANSI SQL and explicit JOIN syntax
- Standard functions: COALESCE, NULLIF, CASE
- Single quotes for string literals
- Avoid dialect-specific features unless necessary"
    }
}

/// What to look for when fixing an error of `category`
pub fn error_guidance(category: ErrorCategory) -> &'static str
{   match category
    {   ErrorCategory::Syntax => "### Syntax Error Guidance
Check keyword spelling and order, comma placement in lists, matching \
parentheses and quotes, and reserved words used as identifiers."
      , ErrorCategory::Reference => "### Reference Error Guidance
Check table and column spelling, schema qualification, alias usage and \
ambiguous columns in joins. Verify every object exists in the schema."
      , ErrorCategory::Type => "### Type Error Guidance
Check comparisons between mismatched types, function argument types, \
UNION column types and date formats. Cast explicitly where needed."
      , ErrorCategory::Permission => "### Permission Error Guidance
The user lacks rights on some object. Query only accessible tables or \
views; permission errors usually cannot be fixed by rewriting the query."
      , ErrorCategory::Constraint => "### Constraint Error Guidance
Check primary key uniqueness, foreign key targets, NOT NULL columns and \
CHECK constraints. Consider conflict handling clauses for upserts."
      , ErrorCategory::Performance => "### Performance Error Guidance
The query timed out or exhausted resources. Add selective WHERE clauses, \
LIMIT large results, make sure every JOIN has a condition, and avoid \
SELECT * on large tables."
      , ErrorCategory::Unknown => "### General Error Guidance
Read the error for line and column hints, identify the failing section, \
check it against the schema and syntax rules, then apply the most likely \
fix."
    }
}
