use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Transport-level failures surfaced by a content fetch.
///
/// Every variant renders the message that ends up in the error sink, so the
/// display text carries the URL (or path) that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The server answered 404. On pages after the first this is the
    /// end-of-pagination signal rather than a failure.
    #[error("Could not get content from {url}. Server responded with 404 Not Found")]
    NotFound { url: String },

    #[error("Could not get content from {url} because the connection timed out")]
    Timeout { url: String },

    #[error("Could not get content from {url} because a connection error occurred: {message}")]
    Connection { url: String, message: String },

    #[error("Could not get content from {url}. Server responded with {status} {reason}")]
    Http {
        url: String,
        status: u16,
        reason: String,
    },

    /// Declared or streamed size crossed the configured maximum.
    /// `actual` is the declared Content-Length when the check happened
    /// before download, `None` when the stream was aborted mid-way.
    #[error("Remote file is too big. Allowed file size: {limit}, Content-Length: {}", .actual.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    SizeExceeded { limit: u64, actual: Option<u64> },

    #[error("Could not get content for this url: local path {} does not exist", .0.display())]
    LocalPathNotFound(PathBuf),

    #[error("Could not read local file {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// Field-level validation errors returned by the catalog store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(pub BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(field, messages)| format!("{}: {}", field, messages.join(", ")))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Application-wide error types.
///
/// Transport failures are wrapped from [`FetchError`]; storage and
/// serialization errors convert automatically through `#[from]`:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
/// - `FetchError` → `AppError::Fetch`
///
/// # Examples
///
/// ```no_run
/// use gleaner_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::ConfigError("default_tags must be a list".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Fetching source content failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Source content could not be parsed into records.
    #[error("Error parsing file: {0}")]
    ParseError(String),

    /// The catalog rejected the resolved field dictionary.
    #[error("Invalid package: {0}")]
    ValidationError(FieldErrors),

    /// A non-delete record arrived without content.
    #[error("Empty content for object {0}")]
    EmptyContent(Uuid),

    /// Source configuration is malformed or references unknown entities.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The target object does not exist in the catalog.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// No unique target name could be synthesised.
    #[error("Could not generate a unique name from the title or the GUID: {0}")]
    NameGeneration(String),

    /// The catalog identity used for writes could not be resolved.
    #[error("Could not resolve catalog identity: {0}")]
    IdentityUnavailable(String),

    /// The catalog API failed in a way not covered above.
    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::Fetch(FetchError::Timeout { url }) => {
                format!(
                    "Request to {} timed out.\n   The source may be slow or unreachable.",
                    url
                )
            }
            AppError::Fetch(FetchError::Connection { url, .. }) => {
                format!(
                    "Cannot connect to {}\n   Check your internet connection and the source URL.",
                    url
                )
            }
            AppError::Fetch(FetchError::SizeExceeded { limit, .. }) => {
                format!(
                    "Remote file is larger than the {} byte limit.\n   Raise the limit or split the source.",
                    limit
                )
            }
            AppError::ConfigError(reason) => {
                format!(
                    "Invalid source configuration: {}\n   Example: {{\"default_tags\": [\"open-data\"]}}",
                    reason
                )
            }
            AppError::IdentityUnavailable(_) => {
                "No catalog identity available for writes.\n   Check your CATALOG_API_KEY environment variable.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is transient and a later run may succeed.
    ///
    /// No retry happens inside the harvester; this classification is for the
    /// scheduler deciding when to rerun a source.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_core::error::{AppError, FetchError};
    ///
    /// let err = AppError::Fetch(FetchError::Timeout { url: "https://example.org".into() });
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::ConfigError("bad".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Fetch(FetchError::Timeout { .. })
            | AppError::Fetch(FetchError::Connection { .. }) => true,
            AppError::Fetch(FetchError::Http { status, .. }) => *status >= 500 || *status == 429,
            AppError::CatalogError(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = FetchError::NotFound {
            url: "https://example.org/catalog.json".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Could not get content from https://example.org/catalog.json. Server responded with 404 Not Found"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_size_exceeded_display() {
        let declared = FetchError::SizeExceeded {
            limit: 10,
            actual: Some(11),
        };
        assert!(declared.to_string().contains("Content-Length: 11"));

        let streamed = FetchError::SizeExceeded {
            limit: 10,
            actual: None,
        };
        assert!(streamed.to_string().contains("Content-Length: unknown"));
    }

    #[test]
    fn test_http_error_display() {
        let err = FetchError::Http {
            url: "https://example.org".to_string(),
            status: 500,
            reason: "Internal Server Error".to_string(),
        };
        assert!(err.to_string().contains("500 Internal Server Error"));
    }

    #[test]
    fn test_field_errors_display() {
        let mut errors = FieldErrors::new();
        errors.add("name", "That URL is already in use.");
        errors.add("title", "Missing value");
        assert_eq!(
            errors.to_string(),
            "name: That URL is already in use.; title: Missing value"
        );
    }

    #[test]
    fn test_empty_content_display() {
        let id = Uuid::nil();
        let err = AppError::EmptyContent(id);
        assert_eq!(err.to_string(), format!("Empty content for object {}", id));
    }

    #[test]
    fn test_error_from_serde() {
        let result: Result<serde_json::Value, _> = serde_json::from_str("{ invalid json }");
        let app_err: AppError = result.unwrap_err().into();
        assert!(matches!(app_err, AppError::SerializationError(_)));
    }

    #[test]
    fn test_error_from_fetch_is_transparent() {
        let fetch = FetchError::Timeout {
            url: "https://example.org".to_string(),
        };
        let app_err: AppError = fetch.clone().into();
        assert_eq!(app_err.to_string(), fetch.to_string());
    }

    #[test]
    fn test_user_message_database_connection() {
        let err = AppError::DatabaseError(sqlx::Error::PoolTimedOut);
        let msg = err.user_message();
        assert!(msg.contains("Cannot connect to database") || msg.contains("Database error"));
    }

    #[test]
    fn test_is_retryable() {
        let http = |status| {
            AppError::Fetch(FetchError::Http {
                url: "u".into(),
                status,
                reason: String::new(),
            })
        };
        assert!(http(503).is_retryable());
        assert!(http(429).is_retryable());
        assert!(!http(403).is_retryable());
        assert!(!AppError::ParseError("bad".to_string()).is_retryable());
        assert!(!AppError::Fetch(FetchError::SizeExceeded {
            limit: 1,
            actual: None
        })
        .is_retryable());
    }
}
