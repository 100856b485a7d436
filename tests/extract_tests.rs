use sqlgate::extract::{
  extract, parse_sql_response, ExtractionTier, BARE_TEXT_CONFIDENCE,
  CODE_BLOCK_CONFIDENCE, JSON_DEFAULT_CONFIDENCE, METADATA_EXTRACTION_TIER,
};
use sqlgate::{Error, ProviderId};

#[test]
fn test_sql_fenced_block()
{   let found = extract("```sql\nSELECT * FROM users\n```").unwrap();
    assert_eq!(found.query, "SELECT * FROM users");
    assert_eq!(found.confidence, CODE_BLOCK_CONFIDENCE);
    assert_eq!(found.tier, ExtractionTier::CodeBlock);
    assert!(found.explanation.is_none());
}

#[test]
fn test_json_with_confidence()
{   let found = extract(r#"{"query":"SELECT 1","confidence":0.95}"#).unwrap();
    assert_eq!(found.query, "SELECT 1");
    assert_eq!(found.confidence, 0.95);
    assert_eq!(found.tier, ExtractionTier::Json);
}

#[test]
fn test_refusal_is_extraction_failure()
{   let err = extract("I cannot help with that.").unwrap_err();
    assert_eq!(err, Error::NoExtractableSql);
}

#[test]
fn test_empty_and_whitespace_input()
{   assert_eq!(extract("").unwrap_err(), Error::NoExtractableSql);
    assert_eq!(extract("   \n\t ").unwrap_err(), Error::NoExtractableSql);
}

#[test]
fn test_json_without_confidence_uses_default()
{   let found = extract(r#"{"query": "SELECT id FROM orders"}"#).unwrap();
    assert_eq!(found.confidence, JSON_DEFAULT_CONFIDENCE);
}

#[test]
fn test_json_zero_confidence_is_kept()
{   let found = extract(r#"{"query": "SELECT 1", "confidence": 0}"#).unwrap();
    assert_eq!(found.confidence, 0.0);
}

#[test]
fn test_json_in_tagged_block()
{   let text = "Here is the result:\n```json\n{\"query\": \"SELECT 2\", \
                \"explanation\": \"two\"}\n```\nLet me know.";
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT 2");
    assert_eq!(found.tier, ExtractionTier::Json);
    assert_eq!(found.explanation.as_deref(), Some("two"));
}

#[test]
fn test_json_embedded_in_prose()
{   let text = r#"Sure! {"query": "SELECT 3", "confidence": 0.9} Hope that helps."#;
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT 3");
    assert_eq!(found.confidence, 0.9);
}

#[test]
fn test_braces_inside_json_strings()
{   let text = r#"Answer: {"query": "SELECT '{' || name || '}' FROM t", "confidence": 0.6}"#;
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT '{' || name || '}' FROM t");
    assert_eq!(found.confidence, 0.6);
}

#[test]
fn test_skips_brace_spans_without_query()
{   let text = r#"Config {"limit": 10} then {"query": "SELECT 4"}"#;
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT 4");
}

#[test]
fn test_sql_block_wins_over_json()
{   let text = "{\"query\": \"SELECT 1\"}\n```sql\nSELECT 2\n```";
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT 2");
    assert_eq!(found.tier, ExtractionTier::CodeBlock);
}

#[test]
fn test_generic_block()
{   let text = "Try this:\n```\nSELECT name FROM users WHERE active\n```";
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT name FROM users WHERE active");
    assert_eq!(found.confidence, CODE_BLOCK_CONFIDENCE);
}

#[test]
fn test_block_confidence_ignores_content()
{   for text in [
      "```sql\nthis is not even sql\n```",
      "```postgres\nDELETE FROM t\n```",
      "```\nWITH x AS (SELECT 1) SELECT * FROM x\n```",
    ]
    {   let found = extract(text).unwrap();
        assert_eq!(found.confidence, CODE_BLOCK_CONFIDENCE, "{}", text);
    }
}

#[test]
fn test_single_line_fence()
{   let found = extract("```sql SELECT 1```").unwrap();
    assert_eq!(found.query, "SELECT 1");
}

#[test]
fn test_unterminated_fence()
{   let found = extract("```sql\nSELECT * FROM orders").unwrap();
    assert_eq!(found.query, "SELECT * FROM orders");
}

#[test]
fn test_bare_text_strips_comments()
{   let text = "Here is the query:\nSELECT name\nFROM users -- all users\n\nWHERE id = 1";
    let found = extract(text).unwrap();
    assert_eq!(found.query, "SELECT name\nFROM users\nWHERE id = 1");
    assert_eq!(found.confidence, BARE_TEXT_CONFIDENCE);
    assert_eq!(found.tier, ExtractionTier::BareText);
}

#[test]
fn test_bare_text_keeps_dashes_in_literals()
{   let found = extract("update t set note = 'a--b' where id = 2").unwrap();
    assert_eq!(found.query, "update t set note = 'a--b' where id = 2");
}

#[test]
fn test_bare_keyword_needs_word_boundary()
{   assert_eq!(
      extract("SELECTED rows are highlighted.").unwrap_err(),
      Error::NoExtractableSql
    );
}

#[test]
fn test_blank_json_query_is_not_success()
{   let err = extract(r#"{"query": "   ", "confidence": 0.9}"#).unwrap_err();
    assert_eq!(err, Error::NoExtractableSql);
}

#[test]
fn test_parse_response_round_trip()
{   let text = r#"{
      "query": "SELECT id FROM users",
      "explanation": "Lists user ids",
      "confidence": 0.82,
      "suggestions": ["Add an index on id"],
      "warnings": ["Returns every row"]
    }"#;
    let response = parse_sql_response(text, ProviderId::OpenAi, "gpt-4o").unwrap();
    assert_eq!(response.query, "SELECT id FROM users");
    assert_eq!(response.explanation, "Lists user ids");
    assert_eq!(response.confidence, 0.82);
    assert_eq!(response.suggestions, vec!["Add an index on id".to_string()]);
    assert_eq!(response.warnings, vec!["Returns every row".to_string()]);
    assert_eq!(response.provider_id, ProviderId::OpenAi);
    assert_eq!(response.model, "gpt-4o");
    assert_eq!(
      response.metadata.get(METADATA_EXTRACTION_TIER).map(String::as_str),
      Some("json")
    );
}

#[test]
fn test_parse_response_missing_lists_are_empty()
{   let response = parse_sql_response(
      r#"{"query": "SELECT 1"}"#, ProviderId::Ollama, "sqlcoder:7b"
    ).unwrap();
    assert!(response.suggestions.is_empty());
    assert!(response.warnings.is_empty());
    assert_eq!(response.explanation, "");
}

#[test]
fn test_parse_response_clamps_confidence()
{   let response = parse_sql_response(
      r#"{"query": "SELECT 1", "confidence": 1.7}"#,
      ProviderId::Anthropic,
      "claude-3-5-haiku-20241022",
    ).unwrap();
    assert_eq!(response.confidence, 1.0);
}

#[test]
fn test_parse_response_structural_explanation()
{   let text = "  Use this:\n```sql\nSELECT 1\n```  ";
    let response = parse_sql_response(text, ProviderId::ClaudeCode, "opus").unwrap();
    assert_eq!(response.query, "SELECT 1");
    assert_eq!(response.explanation, text.trim());
    assert_eq!(
      response.metadata.get(METADATA_EXTRACTION_TIER).map(String::as_str),
      Some("code_block")
    );
}

#[test]
fn test_parse_response_failure_propagates()
{   let err = parse_sql_response("No idea.", ProviderId::OpenAi, "gpt-4o")
      .unwrap_err();
    assert_eq!(err, Error::NoExtractableSql);
}
