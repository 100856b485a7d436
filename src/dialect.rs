//! SQL dialect and error-category classification

use std::collections::HashMap;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::request::{
  context_value, CONTEXT_CONNECTION_TYPE, CONTEXT_DATABASE_TYPE,
  CONTEXT_DIALECT, CONTEXT_DRIVER,
};

/// Target SQL flavor. Affects prompt wording only.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect
{   PostgreSql
  , MySql
  , Sqlite
  , MsSql
  , Oracle
  , #[default]
    Generic
}

impl SqlDialect
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   SqlDialect::PostgreSql => "postgresql"
          , SqlDialect::MySql => "mysql"
          , SqlDialect::Sqlite => "sqlite"
          , SqlDialect::MsSql => "mssql"
          , SqlDialect::Oracle => "oracle"
          , SqlDialect::Generic => "generic"
        }
    }
}

impl fmt::Display for SqlDialect
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

/// Map a connection-type (or driver, or database-type) string to a
/// dialect. Unrecognised strings give [`SqlDialect::Generic`].
pub fn detect_dialect(connection_type: &str) -> SqlDialect
{   let conn = connection_type.trim().to_ascii_lowercase();

    if conn.contains("postgres") || conn.starts_with("pg")
    {   return SqlDialect::PostgreSql;
    }
    if conn.contains("mysql") || conn.contains("mariadb")
    {   return SqlDialect::MySql;
    }
    if conn.contains("sqlite")
    {   return SqlDialect::Sqlite;
    }
    if conn.contains("mssql")
      || conn.contains("sqlserver")
      || conn.contains("sql server")
    {   return SqlDialect::MsSql;
    }
    if conn.contains("oracle")
    {   return SqlDialect::Oracle;
    }
    SqlDialect::Generic
}

/// Parse an explicitly requested dialect. Unlike [`detect_dialect`],
/// `generic` is a real answer here; `None` means the value names no
/// dialect at all.
pub fn parse_dialect(value: &str) -> Option<SqlDialect>
{   let value = value.trim();
    if value.eq_ignore_ascii_case(SqlDialect::Generic.as_str())
    {   return Some(SqlDialect::Generic);
    }
    match detect_dialect(value)
    {   SqlDialect::Generic => None
      , dialect => Some(dialect)
    }
}

/// Resolve the dialect for a request.
///
/// Precedence: explicit `dialect` > `connection_type` > `database_type`
/// > `driver` > `default`. An explicit `generic` stops the search; an
/// unrecognised value at any level is skipped.
pub fn resolve_dialect(
  context: &HashMap<String, String>
, default: SqlDialect
) -> SqlDialect
{   if let Some(dialect) = context_value(context, CONTEXT_DIALECT)
      .and_then(parse_dialect)
    {   return dialect;
    }
    let metadata = [
      CONTEXT_CONNECTION_TYPE,
      CONTEXT_DATABASE_TYPE,
      CONTEXT_DRIVER,
    ];
    metadata.iter()
      .filter_map(|key| context_value(context, key))
      .map(detect_dialect)
      .find(|d| *d != SqlDialect::Generic)
      .unwrap_or(default)
}

/// Coarse SQL error class used to pick fix guidance
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory
{   Syntax
  , Reference
  , Type
  , Permission
  , Constraint
  , Performance
  , Unknown
}

impl ErrorCategory
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   ErrorCategory::Syntax => "syntax"
          , ErrorCategory::Reference => "reference"
          , ErrorCategory::Type => "type"
          , ErrorCategory::Permission => "permission"
          , ErrorCategory::Constraint => "constraint"
          , ErrorCategory::Performance => "performance"
          , ErrorCategory::Unknown => "unknown"
        }
    }
}

impl fmt::Display for ErrorCategory
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

/// Evaluated top to bottom; the first category with a matching keyword
/// wins.
const ERROR_KEYWORDS: &[(ErrorCategory, &[&str])] = &[
  ( ErrorCategory::Syntax
  , &["syntax error", "parse error", "unexpected token", "expected", "missing"]
  ),
  ( ErrorCategory::Reference
  , &[
      "does not exist", "unknown column", "unknown table", "ambiguous",
      "not found", "no such table", "no such column",
    ]
  ),
  ( ErrorCategory::Type
  , &["type mismatch", "invalid type", "cannot cast", "incompatible types",
      "invalid input syntax for type"]
  ),
  ( ErrorCategory::Permission
  , &["permission denied", "access denied", "insufficient privileges"]
  ),
  ( ErrorCategory::Constraint
  , &["constraint", "unique violation", "duplicate key", "foreign key",
      "not null"]
  ),
  ( ErrorCategory::Performance
  , &["timeout", "timed out", "cancelled", "canceled", "resource exhausted",
      "too many rows"]
  ),
];

/// Classify a database error message
pub fn detect_error_category(error_message: &str) -> ErrorCategory
{   let message = error_message.to_lowercase();
    ERROR_KEYWORDS.iter()
      .find(|(_, keywords)| {
        keywords.iter().any(|k| message.contains(k))
      })
      .map(|(category, _)| *category)
      .unwrap_or(ErrorCategory::Unknown)
}
