//! Token budget allocation.
//!
//! A model's context window is split into fixed shares for the system
//! prompt, the user's request and the output buffer. Whatever is left
//! after a safety margin goes to retrieved context, divided between named
//! components in proportion to their priority.
//!
//! Token counts are estimated at [`CHARS_PER_TOKEN`] characters per
//! token; nothing here depends on a real tokenizer.

use std::collections::BTreeMap;
use std::fmt::Write;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Characters per token used by every estimate in this module
pub const CHARS_PER_TOKEN: usize = 4;
/// Share of the window held back so the true ceiling is never reached
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.05;
pub const SYSTEM_PROMPT_SHARE: f64 = 0.25;
pub const USER_QUERY_SHARE: f64 = 0.06;
pub const OUTPUT_BUFFER_SHARE: f64 = 0.25;
/// Appended to text cut by [`truncate_to_token_budget`]
pub const TRUNCATION_MARKER: &str = " ...[truncated]";
/// Context window assumed for models not in the table
pub const DEFAULT_CONTEXT_WINDOW: usize = 4096;
/// A component that comes in under budget can later receive freed
/// tokens up to this multiple of its original allocation.
pub const RECEIVER_CAP_FACTOR: usize = 2;

pub const COMPONENT_SCHEMA: &str = "schema";
pub const COMPONENT_EXAMPLES: &str = "examples";
pub const COMPONENT_BUSINESS: &str = "business";
pub const COMPONENT_PERFORMANCE: &str = "performance";

/// How far back from the cut point a line or sentence break is preferred
const BOUNDARY_WINDOW: usize = 100;

const BUSINESS_KEYWORDS: &[&str] =
  &["revenue", "profit", "customer", "order", "discount", "refund"];
const PERFORMANCE_KEYWORDS: &[&str] =
  &["slow", "performance", "optimize", "fast", "index"];

/// Ordered most specific first; the first prefix that matches wins.
const CONTEXT_WINDOWS: &[(&str, usize)] = &[
  ("claude-3", 200_000),
  ("claude-sonnet", 200_000),
  ("claude-opus", 200_000),
  ("claude-haiku", 200_000),
  ("opus", 200_000),
  ("sonnet", 200_000),
  ("haiku", 200_000),
  ("claude-2", 100_000),
  ("gpt-4o", 128_000),
  ("gpt-4-turbo", 128_000),
  ("gpt-4-32k", 32_768),
  ("gpt-4", 8_192),
  ("gpt-3.5-turbo-16k", 16_384),
  ("gpt-3.5", 4_096),
  ("llama3.1", 128_000),
  ("llama3", 8_192),
  ("codellama", 16_384),
  ("sqlcoder", 8_192),
  ("mistral", 32_768),
];

/// Context window for a model name, [`DEFAULT_CONTEXT_WINDOW`] when the
/// model is unknown.
pub fn recommended_context_window(model: &str) -> usize
{   let model = model.trim().to_ascii_lowercase();
    CONTEXT_WINDOWS.iter()
      .find(|(prefix, _)| model.starts_with(prefix))
      .map(|(_, window)| *window)
      .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Estimated token count, rounded up
pub fn estimate_tokens(text: &str) -> usize
{   let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

/// Fixed split of one model's context window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget
{   pub total: usize
  , pub system_prompt: usize
  , pub user_query: usize
  , pub output_buffer: usize
  , /// What is left for retrieved context under the ceiling
    pub context: usize
  , pub safety_margin: f64
}

impl TokenBudget
{   /// Budget for a model with `capacity` tokens of context. Pure.
    pub fn default_for(capacity: usize) -> Self
    {   Self::with_margin(capacity, DEFAULT_SAFETY_MARGIN)
    }

    pub fn with_margin(capacity: usize, safety_margin: f64) -> Self
    {   let safety_margin = safety_margin.clamp(0.0, 1.0);
        let system_prompt = share(capacity, SYSTEM_PROMPT_SHARE);
        let user_query = share(capacity, USER_QUERY_SHARE);
        let output_buffer = share(capacity, OUTPUT_BUFFER_SHARE);
        let context = share(capacity, 1.0 - safety_margin)
          .saturating_sub(system_prompt + user_query + output_buffer);

        TokenBudget
        {   total: capacity
          , system_prompt
          , user_query
          , output_buffer
          , context
          , safety_margin
        }
    }

    /// `total × (1 − safety_margin)`, rounded down
    pub fn ceiling(&self) -> usize
    {   share(self.total, 1.0 - self.safety_margin)
    }

    /// Divide the context share between components by priority weight.
    /// Each component gets `context × priority / Σpriority`, rounded
    /// down; zero-priority components get nothing and should not be
    /// fetched at all.
    pub fn allocate_context_budget(
      &self
    , priorities: &BTreeMap<String, u32>
    ) -> BudgetAllocation
    {   let weight: u64 = priorities.values().map(|p| *p as u64).sum();

        let components = priorities.iter()
          .map(|(name, priority)| {
            let allocated = if weight == 0 || *priority == 0
            {   0
            } else
            {   (self.context as u64 * *priority as u64 / weight) as usize
            };
            let budget = ComponentBudget
            {   allocated
              , priority: *priority
              , cap: allocated * RECEIVER_CAP_FACTOR
              , used: None
            };
            (name.clone(), budget)
          })
          .collect();

        let allocation = BudgetAllocation
        {   total: self.total
          , system_prompt_tokens: self.system_prompt
          , user_query_tokens: self.user_query
          , output_buffer_tokens: self.output_buffer
          , components
          , safety_margin: self.safety_margin
        };
        trace!("allocated context budget: {}", allocation.summary());
        allocation
    }
}

fn share(capacity: usize, fraction: f64) -> usize
{   (capacity as f64 * fraction).floor() as usize
}

/// One component's slice of the context budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentBudget
{   pub allocated: usize
  , pub priority: u32
  , /// Most this component may grow to when tokens are redistributed
    pub cap: usize
  , /// Actual usage once known; the component is frozen from then on
    pub used: Option<usize>
}

impl ComponentBudget
{   pub fn should_fetch(&self) -> bool
    {   self.priority > 0
    }

    pub fn is_frozen(&self) -> bool
    {   self.used.is_some()
    }
}

/// Token plan for one prompt assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation
{   pub total: usize
  , pub system_prompt_tokens: usize
  , pub user_query_tokens: usize
  , pub output_buffer_tokens: usize
  , pub components: BTreeMap<String, ComponentBudget>
  , pub safety_margin: f64
}

impl BudgetAllocation
{   /// Allocated tokens per component
    pub fn component_tokens(&self) -> BTreeMap<String, usize>
    {   self.components.iter()
          .map(|(name, c)| (name.clone(), c.allocated))
          .collect()
    }

    pub fn component(&self, name: &str) -> Option<&ComponentBudget>
    {   self.components.get(name)
    }

    /// Allocated tokens for `name`, 0 when the component is absent
    pub fn tokens_for(&self, name: &str) -> usize
    {   self.component(name).map_or(0, |c| c.allocated)
    }

    /// Whether the caller should bother retrieving `name` at all
    pub fn should_fetch(&self, name: &str) -> bool
    {   self.component(name).map_or(false, ComponentBudget::should_fetch)
    }

    pub fn ceiling(&self) -> usize
    {   share(self.total, 1.0 - self.safety_margin)
    }

    /// Fixed shares plus every component allocation
    pub fn allocated_total(&self) -> usize
    {   self.system_prompt_tokens
          + self.user_query_tokens
          + self.output_buffer_tokens
          + self.components.values().map(|c| c.allocated).sum::<usize>()
    }

    /// Tokens under the ceiling that nothing has claimed
    pub fn remaining(&self) -> usize
    {   self.ceiling().saturating_sub(self.allocated_total())
    }

    /// Record the real size of `name` and hand what it did not use to
    /// the other unfrozen components, highest priority first (ties by
    /// name), each up to its cap. Returns the number of tokens handed
    /// out; anything nobody can take stays unallocated.
    pub fn adjust_for_actual_usage(
      &mut self
    , name: &str
    , actual_tokens: usize
    ) -> usize
    {   let freed = match self.components.get_mut(name)
        {   Some(component) => {
              let freed = component.allocated.saturating_sub(actual_tokens);
              component.allocated -= freed;
              component.used = Some(actual_tokens);
              freed
            }
          , None => {
              debug!("adjust_for_actual_usage: no component named {}", name);
              return 0;
            }
        };
        if freed == 0
        {   return 0;
        }

        let mut receivers: Vec<(String, u32)> = self.components.iter()
          .filter(|(n, c)| {
            n.as_str() != name && !c.is_frozen() && c.priority > 0
          })
          .map(|(n, c)| (n.clone(), c.priority))
          .collect();
        receivers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut left = freed;
        for (receiver, _) in receivers
        {   if left == 0
            {   break;
            }
            if let Some(component) = self.components.get_mut(&receiver)
            {   let grant = component.cap
                  .saturating_sub(component.allocated)
                  .min(left);
                component.allocated += grant;
                left -= grant;
            }
        }

        trace!(
          "{} used {} tokens; redistributed {} of {} freed",
          name, actual_tokens, freed - left, freed
        );
        freed - left
    }

    /// Fail if any single allocation, or all of them together, exceed
    /// `capacity`.
    pub fn validate(&self, capacity: usize) -> Result<()>
    {   let fixed = [
          ("system_prompt", self.system_prompt_tokens),
          ("user_query", self.user_query_tokens),
          ("output_buffer", self.output_buffer_tokens),
        ];
        let components = self.components.iter()
          .map(|(name, c)| (name.as_str(), c.allocated));

        for (name, tokens) in fixed.into_iter().chain(components)
        {   if tokens > capacity
            {   return Err(Error::BudgetInvariantViolation(format!(
                  "{} allocated {} tokens, capacity is {}",
                  name, tokens, capacity
                )));
            }
        }

        let total = self.allocated_total();
        if total > capacity
        {   return Err(Error::BudgetInvariantViolation(format!(
              "allocations total {} tokens, capacity is {}",
              total, capacity
            )));
        }
        Ok(())
    }

    /// One-line human-readable breakdown
    pub fn summary(&self) -> String
    {   let mut out = format!(
          "total={} system={} query={} output={}",
          self.total,
          self.system_prompt_tokens,
          self.user_query_tokens,
          self.output_buffer_tokens,
        );
        for (name, c) in &self.components
        {   let _ = write!(out, " {}={}", name, c.allocated);
            if let Some(used) = c.used
            {   let _ = write!(out, "(used {})", used);
            }
        }
        let _ = write!(out, " remaining={}", self.remaining());
        out
    }
}

/// Cut `text` so its estimate fits in `token_limit` tokens, marker
/// included. Cuts at a line or sentence break near the limit, else at
/// whitespace; never inside a word. Any cut carries the marker, even
/// when the limit is too small to hold it alongside the text.
pub fn truncate_to_token_budget(text: &str, token_limit: usize) -> String
{   let max_chars = token_limit * CHARS_PER_TOKEN;
    if text.chars().count() <= max_chars
    {   return text.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    if keep == 0
    {   return TRUNCATION_MARKER.trim_start().to_string();
    }

    let cut = text.char_indices()
      .nth(keep)
      .map_or(text.len(), |(i, _)| i);
    let head = &text[..cut];
    let at_word_end = text[cut..]
      .chars()
      .next()
      .map_or(true, char::is_whitespace);

    let end = boundary_before(head, at_word_end);
    let kept = head[..end].trim_end();
    if kept.is_empty()
    {   return TRUNCATION_MARKER.trim_start().to_string();
    }
    format!("{}{}", kept, TRUNCATION_MARKER)
}

/// Byte offset to cut `head` at
fn boundary_before(head: &str, at_word_end: bool) -> usize
{   let window_start = head.char_indices()
      .rev()
      .nth(BOUNDARY_WINDOW)
      .map_or(0, |(i, _)| i);
    let window = &head[window_start..];

    if let Some(i) = window.rfind('\n')
    {   return window_start + i;
    }
    let sentence_end = window.char_indices()
      .zip(window.chars().skip(1))
      .filter(|((_, c), next)| {
        matches!(c, '.' | '!' | '?' | ';') && next.is_whitespace()
      })
      .map(|((i, c), _)| i + c.len_utf8())
      .last();
    if let Some(i) = sentence_end
    {   return window_start + i;
    }
    if at_word_end
    {   return head.len();
    }
    head.rfind(char::is_whitespace).unwrap_or(0)
}

/// Caller policy for picking component priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityProfile
{   /// Plain text-to-SQL
    Generation
  , /// Fixing a broken query; examples of correct patterns matter more
    ErrorFix
  , /// Request mentions business concepts (revenue, customers, ...)
    BusinessRules
  , /// Request is about speed or indexes
    Performance
}

impl PriorityProfile
{   pub fn priorities(&self) -> BTreeMap<String, u32>
    {   let (schema, examples, business, performance) = match self
        {   PriorityProfile::Generation => (10, 7, 5, 3)
          , PriorityProfile::ErrorFix => (10, 9, 5, 2)
          , PriorityProfile::BusinessRules => (10, 7, 8, 3)
          , PriorityProfile::Performance => (10, 7, 5, 7)
        };
        priority_map(schema, examples, business, performance)
    }

    /// Dominant intent of a request: fixes first, then business, then
    /// performance.
    pub fn for_request(query: &str, is_fix: bool) -> Self
    {   if is_fix
        {   PriorityProfile::ErrorFix
        } else if mentions_any(query, BUSINESS_KEYWORDS)
        {   PriorityProfile::BusinessRules
        } else if mentions_any(query, PERFORMANCE_KEYWORDS)
        {   PriorityProfile::Performance
        } else
        {   PriorityProfile::Generation
        }
    }
}

/// Priorities for a request: the profile of its dominant intent, with
/// the boosts of any other intent it also mentions layered on, so a fix
/// that mentions revenue gets both.
pub fn priorities_for_request(query: &str, is_fix: bool) -> BTreeMap<String, u32>
{   let mut priorities = PriorityProfile::for_request(query, is_fix).priorities();
    let boosts = [
      (BUSINESS_KEYWORDS, PriorityProfile::BusinessRules, COMPONENT_BUSINESS),
      (PERFORMANCE_KEYWORDS, PriorityProfile::Performance, COMPONENT_PERFORMANCE),
    ];
    for (keywords, profile, component) in boosts
    {   if mentions_any(query, keywords)
        {   let boosted = profile.priorities()
              .get(component)
              .copied()
              .unwrap_or_default();
            let entry = priorities.entry(component.to_string()).or_default();
            *entry = (*entry).max(boosted);
        }
    }
    priorities
}

/// Default budget for `max_tokens` of context, allocated with the
/// request's priorities and checked against the window. Meant for
/// context-retrieval implementations.
pub fn plan_context_budget(
  query: &str
, max_tokens: usize
, is_fix: bool
) -> Result<BudgetAllocation>
{   let budget = TokenBudget::default_for(max_tokens);
    let allocation = budget
      .allocate_context_budget(&priorities_for_request(query, is_fix));
    allocation.validate(max_tokens)?;
    Ok(allocation)
}

fn priority_map(
  schema: u32
, examples: u32
, business: u32
, performance: u32
) -> BTreeMap<String, u32>
{   [
      (COMPONENT_SCHEMA, schema),
      (COMPONENT_EXAMPLES, examples),
      (COMPONENT_BUSINESS, business),
      (COMPONENT_PERFORMANCE, performance),
    ]
    .into_iter()
    .map(|(name, p)| (name.to_string(), p))
    .collect()
}

fn mentions_any(query: &str, keywords: &[&str]) -> bool
{   let query = query.to_lowercase();
    keywords.iter().any(|k| query.contains(k))
}
