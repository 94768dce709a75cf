use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// The schema suffix would produce schema names Postgres cannot hold.
    #[error("Invalid schema suffix `{0}`: use lowercase letters, digits and underscores only")]
    InvalidSchemaSuffix(String),
    /// A field holds a value outside of its accepted range.
    #[error("Invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
