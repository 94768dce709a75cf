//! Error types and result definitions for reindex operations.
//!
//! [`ReindexError`] carries a classification, a static description, optional dynamic detail and
//! source, plus the callsite and a backtrace. Errors of several workers can be aggregated into one.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use postgres::schema::SchemaError;

/// Result type used across the reindex pipeline.
pub type ReindexResult<T> = Result<T, ReindexError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the reindex pipeline.
#[derive(Debug, Clone)]
pub struct ReindexError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Failures collected from several independent units of work.
    Many {
        errors: Vec<ReindexError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised by the pipeline.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection errors
    ConnectionFailed,

    // Query and execution errors
    QueryFailed,
    LockTimeout,
    OperationCanceled,

    // Schema errors
    SchemaError,
    InvalidTenant,

    // Data errors
    ConversionError,
    InvalidData,
    ValidationError,

    // Configuration errors
    ConfigError,

    // IO and serialization errors
    IoError,
    SerializationError,
    DeserializationError,

    // State and workflow errors
    InvalidState,
    RangeFailed,
    WorkerPanic,

    Unknown,
}

impl ReindexError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(&payload.description),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the detail of this error, or of the first aggregated error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// One line summary used as the failure cause of merge ranges and in row error logs.
    pub fn summary(&self) -> String {
        match (&self.repr, self.detail()) {
            (ErrorRepr::Single(payload), Some(detail)) => {
                format!("{}: {detail}", payload.description)
            }
            (ErrorRepr::Single(payload), None) => payload.description.to_string(),
            (ErrorRepr::Many { errors, .. }, _) => errors
                .iter()
                .map(ReindexError::summary)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        ReindexError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for ReindexError {
    fn eq(&self, other: &ReindexError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ReindexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write!(f, "\n  Backtrace:")?;
                    for line in backtrace.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ReindexError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for ReindexError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> ReindexError {
        ReindexError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for ReindexError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> ReindexError {
        ReindexError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for ReindexError
where
    E: Into<ReindexError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> ReindexError {
        let location = Location::caller();
        let mut errors: Vec<ReindexError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        ReindexError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for ReindexError {
    #[track_caller]
    fn from(err: std::io::Error) -> ReindexError {
        let detail = err.to_string();
        ReindexError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for ReindexError {
    #[track_caller]
    fn from(err: serde_json::Error) -> ReindexError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };
        let detail = err.to_string();
        ReindexError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<uuid::Error> for ReindexError {
    #[track_caller]
    fn from(err: uuid::Error) -> ReindexError {
        let detail = err.to_string();
        ReindexError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("UUID parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::num::TryFromIntError> for ReindexError {
    #[track_caller]
    fn from(err: std::num::TryFromIntError) -> ReindexError {
        let detail = err.to_string();
        ReindexError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Integer conversion failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<SchemaError> for ReindexError {
    #[track_caller]
    fn from(err: SchemaError) -> ReindexError {
        let detail = err.to_string();
        ReindexError::from_components(
            ErrorKind::InvalidTenant,
            Cow::Borrowed("Tenant schema name is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::shared::ValidationError> for ReindexError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> ReindexError {
        let detail = err.to_string();
        ReindexError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Classifies a SQLSTATE code by its class.
fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code.get(..2) {
        Some("08") => (ErrorKind::ConnectionFailed, "Database connection failed"),
        Some("22") => (ErrorKind::ConversionError, "Database data conversion failed"),
        Some("23") => (ErrorKind::ValidationError, "Database constraint violation"),
        Some("3F") => (ErrorKind::SchemaError, "Database schema not found"),
        Some("40") => (ErrorKind::InvalidState, "Database transaction failed"),
        Some("42") => (ErrorKind::SchemaError, "Database syntax or access error"),
        Some("53") => (ErrorKind::ConnectionFailed, "Database resource limitation"),
        Some("55") if code == "55P03" => (ErrorKind::LockTimeout, "Database lock not available"),
        Some("57") => (ErrorKind::OperationCanceled, "Database operation canceled"),
        _ => (ErrorKind::QueryFailed, "Database operation failed"),
    }
}

/// Maps database errors by SQLSTATE class, so constraint violations become
/// [`ErrorKind::ValidationError`] and missing schemas become [`ErrorKind::SchemaError`].
impl From<sqlx::Error> for ReindexError {
    #[track_caller]
    fn from(err: sqlx::Error) -> ReindexError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => classify_sqlstate(&code),
                None => (ErrorKind::QueryFailed, "Database operation failed"),
            },
            sqlx::Error::Io(_) => (ErrorKind::IoError, "Database I/O failed"),
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                (ErrorKind::ConnectionFailed, "Database pool unavailable")
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorKind::ConversionError, "Database value decoding failed")
            }
            sqlx::Error::Migrate(_) => (ErrorKind::SchemaError, "Database migration failed"),
            _ => (ErrorKind::QueryFailed, "Database operation failed"),
        };

        let detail = err.to_string();
        ReindexError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
