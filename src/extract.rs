//! Recovering a SQL statement and a confidence score from model output.
//!
//! Model text arrives as a JSON object, a fenced code block, or bare
//! prose. [`extract`] tries, in order:
//!
//! 1. a fenced block tagged `sql`
//! 2. a JSON object with a `query` field (whole text, ```json block,
//!    generic block, then the first balanced `{...}` span that works)
//! 3. a generic fenced block that is not JSON
//! 4. bare text from the first line opening with SELECT/INSERT/UPDATE/DELETE
//!
//! and fails with [`Error::NoExtractableSql`] otherwise.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::request::GenerationResponse;
use crate::ProviderId;

/// Confidence for a JSON payload that does not state its own
pub const JSON_DEFAULT_CONFIDENCE: f64 = 0.5;
/// Confidence for SQL recovered from a fenced code block
pub const CODE_BLOCK_CONFIDENCE: f64 = 0.8;
/// Confidence for SQL recovered from bare prose
pub const BARE_TEXT_CONFIDENCE: f64 = 0.7;

/// Metadata key carrying the [`ExtractionTier`] of a response
pub const METADATA_EXTRACTION_TIER: &str = "extraction_tier";

const SQL_KEYWORDS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE"];
const FENCE: &str = "```";

/// Where the statement was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier
{   /// Parsed from a JSON object; confidence is the model's own
    Json
  , /// Lifted out of a fenced code block
    CodeBlock
  , /// Recovered from prose
    BareText
}

impl ExtractionTier
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   ExtractionTier::Json => "json"
          , ExtractionTier::CodeBlock => "code_block"
          , ExtractionTier::BareText => "bare_text"
        }
    }
}

impl fmt::Display for ExtractionTier
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

/// A statement recovered from model output. `query` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction
{   pub query: String
  , pub confidence: f64
  , pub tier: ExtractionTier
  , /// Only JSON payloads carry these
    pub explanation: Option<String>
  , pub suggestions: Vec<String>
  , pub warnings: Vec<String>
}

impl Extraction
{   fn structural(query: String, tier: ExtractionTier) -> Self
    {   let confidence = match tier
        {   ExtractionTier::BareText => BARE_TEXT_CONFIDENCE
          , _ => CODE_BLOCK_CONFIDENCE
        };
        Extraction
        {   query
          , confidence
          , tier
          , explanation: None
          , suggestions: Vec::new()
          , warnings: Vec::new()
        }
    }
}

/// Recover a SQL statement from raw model text.
pub fn extract(raw: &str) -> Result<Extraction>
{   let blocks = fenced_blocks(raw);
    trace!("extract: {} fenced blocks", blocks.len());

    let found = sql_tagged_block(&blocks)
      .or_else(|| json_payload(raw, &blocks))
      .or_else(|| generic_block(&blocks))
      .or_else(|| bare_sql(raw));

    match found
    {   Some(extraction) => {
          debug!(
            "extracted SQL from {} (confidence {})",
            extraction.tier, extraction.confidence
          );
          Ok(extraction)
        }
      , None => {
          debug!("no SQL found in {} chars of model text", raw.len());
          Err(Error::NoExtractableSql)
        }
    }
}

/// Build a normalized response from model text. JSON payloads fill every
/// field; structural matches use the whole text as the explanation.
pub fn parse_sql_response(
  content: &str
, provider_id: ProviderId
, model: &str
) -> Result<GenerationResponse>
{   let extraction = extract(content)?;
    let mut metadata = HashMap::new();
    metadata.insert(
      METADATA_EXTRACTION_TIER.to_string()
    , extraction.tier.to_string()
    );
    Ok(GenerationResponse
    {   query: extraction.query
      , explanation: extraction.explanation
          .unwrap_or_else(|| content.trim().to_string())
      , confidence: extraction.confidence.clamp(0.0, 1.0)
      , suggestions: extraction.suggestions
      , warnings: extraction.warnings
      , provider_id
      , model: model.to_string()
      , tokens_used: 0
      , latency: Duration::ZERO
      , metadata
    })
}

struct FencedBlock<'a>
{   /// Lower-cased info string, empty when untagged
    lang: String
  , body: &'a str
}

impl FencedBlock<'_>
{   fn is_generic(&self) -> bool
    {   self.lang != "sql" && self.lang != "json"
    }
}

/// Split out every ``` fenced block. An unterminated fence runs to the
/// end of the text.
fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>>
{   let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE)
    {   let after = &rest[open + FENCE.len()..];
        let line_end = after.find('\n').unwrap_or(after.len());
        let info = &after[..line_end];

        // ```sql SELECT 1``` on a single line
        if let Some(close) = info.find(FENCE)
        {   let inner = &info[..close];
            let (lang, body) = match inner.split_once(char::is_whitespace)
            {   Some((tag, body))
                  if matches!(
                    tag.to_ascii_lowercase().as_str(), "sql" | "json"
                  ) => (tag.to_ascii_lowercase(), body)
              , _ => (String::new(), inner)
            };
            blocks.push(FencedBlock { lang, body });
            rest = &after[close + FENCE.len()..];
            continue;
        }

        let lang = info.split_whitespace()
          .next()
          .unwrap_or("")
          .to_ascii_lowercase();
        let body_region = if line_end < after.len()
        {   &after[line_end + 1..]
        } else
        {   ""
        };

        match body_region.find(FENCE)
        {   Some(close) => {
              blocks.push(FencedBlock
              {   lang
                , body: &body_region[..close]
              });
              rest = &body_region[close + FENCE.len()..];
            }
          , None => {
              blocks.push(FencedBlock
              {   lang
                , body: body_region
              });
              break;
            }
        }
    }
    blocks
}

fn sql_tagged_block(blocks: &[FencedBlock<'_>]) -> Option<Extraction>
{   blocks.iter()
      .filter(|b| b.lang == "sql")
      .map(|b| b.body.trim())
      .find(|body| !body.is_empty())
      .map(|body| {
        Extraction::structural(body.to_string(), ExtractionTier::CodeBlock)
      })
}

fn json_payload(
  raw: &str
, blocks: &[FencedBlock<'_>]
) -> Option<Extraction>
{   if let Some(found) = json_extraction(raw)
    {   return Some(found);
    }

    let tagged = blocks.iter().filter(|b| b.lang == "json");
    let generic = blocks.iter().filter(|b| b.is_generic());
    if let Some(found) = tagged.chain(generic)
      .find_map(|b| json_extraction(b.body))
    {   return Some(found);
    }

    let mut offset = 0;
    while let Some(pos) = raw[offset..].find('{')
    {   let start = offset + pos;
        if let Some(end) = matching_brace(&raw[start..])
        {   if let Some(found) = json_extraction(&raw[start..=start + end])
            {   return Some(found);
            }
        }
        offset = start + 1;
    }
    None
}

/// Index of the `}` closing the `{` that `s` starts with. Braces inside
/// JSON strings do not count.
fn matching_brace(s: &str) -> Option<usize>
{   let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices()
    {   if in_string
        {   if escaped
            {   escaped = false;
            } else if c == '\\'
            {   escaped = true;
            } else if c == '"'
            {   in_string = false;
            }
            continue;
        }
        match c
        {   '"' => in_string = true
          , '{' => depth += 1
          , '}' => {
              depth = depth.saturating_sub(1);
              if depth == 0
              {   return Some(i);
              }
            }
          , _ => {}
        }
    }
    None
}

fn json_extraction(candidate: &str) -> Option<Extraction>
{   let candidate = candidate.trim();
    if !candidate.starts_with('{')
    {   return None;
    }
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;
    let query = object.get("query")?.as_str()?.trim();
    if query.is_empty()
    {   return None;
    }

    Some(Extraction
    {   query: query.to_string()
      , confidence: object.get("confidence")
          .and_then(Value::as_f64)
          .unwrap_or(JSON_DEFAULT_CONFIDENCE)
      , tier: ExtractionTier::Json
      , explanation: Some(
          object.get("explanation")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
        )
      , suggestions: string_list(object, "suggestions")
      , warnings: string_list(object, "warnings")
    })
}

fn string_list(object: &Map<String, Value>, key: &str) -> Vec<String>
{   object.get(key)
      .and_then(Value::as_array)
      .map(|items| {
        items.iter()
          .filter_map(Value::as_str)
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
}

fn generic_block(blocks: &[FencedBlock<'_>]) -> Option<Extraction>
{   blocks.iter()
      .filter(|b| b.is_generic())
      .map(|b| b.body.trim())
      .filter(|body| !body.is_empty())
      .find(|body| serde_json::from_str::<Value>(body).is_err())
      .map(|body| {
        Extraction::structural(body.to_string(), ExtractionTier::CodeBlock)
      })
}

fn bare_sql(text: &str) -> Option<Extraction>
{   let lines: Vec<&str> = text.lines()
      .map(strip_line_comment)
      .collect();
    let start = lines.iter()
      .position(|line| starts_with_sql_keyword(line.trim_start()))?;

    let sql = lines[start..].iter()
      .map(|line| line.trim_end())
      .filter(|line| !line.trim().is_empty())
      .collect::<Vec<_>>()
      .join("\n");
    let sql = sql.trim();
    if sql.is_empty()
    {   return None;
    }
    Some(Extraction::structural(sql.to_string(), ExtractionTier::BareText))
}

fn starts_with_sql_keyword(line: &str) -> bool
{   SQL_KEYWORDS.iter().any(|keyword| {
      line.get(..keyword.len())
        .map(|head| head.eq_ignore_ascii_case(keyword))
        .unwrap_or(false)
        && line[keyword.len()..]
          .chars()
          .next()
          .map_or(true, char::is_whitespace)
    })
}

/// Cut a `--` comment off the line, ignoring dashes inside quotes.
fn strip_line_comment(line: &str) -> &str
{   let mut quote: Option<char> = None;
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next()
    {   match quote
        {   Some(q) if c == q => quote = None
          , Some(_) => {}
          , None => match c
            {   '\'' | '"' => quote = Some(c)
              , '-' if matches!(chars.peek(), Some((_, '-'))) => {
                  return &line[..i];
                }
              , _ => {}
            }
        }
    }
    line
}
