use std::fmt;

use pg_escape::quote_identifier;
use thiserror::Error;

/// Maximum length of a Postgres identifier (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("tenant id `{0}` is not a valid tenant identifier")]
    InvalidTenantId(String),

    #[error("schema name `{0}` exceeds {MAX_IDENTIFIER_LEN} characters")]
    NameTooLong(String),
}

/// A validated tenant schema name.
///
/// Only lowercase ASCII letters, digits and underscores are accepted, starting with a letter.
/// Qualified names are always quoted, so a [`TenantSchema`] is the only way schema text ends
/// up inside SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantSchema(String);

impl TenantSchema {
    /// Validates `name` as a schema name.
    pub fn parse(name: &str) -> Result<Self, SchemaError> {
        if !is_plain_identifier(name) {
            return Err(SchemaError::InvalidTenantId(name.to_string()));
        }

        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(SchemaError::NameTooLong(name.to_string()));
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the quoted, schema-qualified name of `table`.
    ///
    /// Table names are static and come from this crate's table definitions.
    pub fn table(&self, table: &'static str) -> String {
        format!("{}.{}", quote_identifier(&self.0), quote_identifier(table))
    }

    /// Returns the quoted schema name on its own.
    pub fn quoted(&self) -> String {
        quote_identifier(&self.0).into_owned()
    }
}

impl fmt::Display for TenantSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps tenant ids to their schemas using the `{tenant}_{suffix}` convention.
#[derive(Debug, Clone)]
pub struct SchemaResolver {
    suffix: String,
}

impl SchemaResolver {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn schema_for(&self, tenant_id: &str) -> Result<TenantSchema, SchemaError> {
        if !is_plain_identifier(tenant_id) {
            return Err(SchemaError::InvalidTenantId(tenant_id.to_string()));
        }

        TenantSchema::parse(&format!("{tenant_id}_{}", self.suffix))
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
