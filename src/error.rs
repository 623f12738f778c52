//! Error types returned by the WebDAV client

use reqwest::StatusCode;

use crate::services::webdav::status::{DavMethod, ExpectedStatus};

pub type Result<T> = std::result::Result<T, WebDavError>;

#[derive(Debug, thiserror::Error)]
pub enum WebDavError {
    /// Transport-level failure (DNS, TLS, refused connection, broken stream)
    #[error("connection failed: {0}")]
    Connection(#[source] reqwest::Error),

    #[error(transparent)]
    Operation(#[from] OperationFailed),

    #[error("short transfer: expected {expected} bytes, received {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    #[error("transfer exceeded the announced length of {expected} bytes")]
    LengthExceeded { expected: u64 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("too many redirects while listing \"{path}\" (limit {limit})")]
    TooManyRedirects { path: String, limit: usize },

    #[error("redirect without a usable Location header for \"{path}\"")]
    MissingLocation { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transfer task failed: {0}")]
    TaskFailed(String),
}

impl WebDavError {
    /// Actual status code of an operation failure, if this is one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            WebDavError::Operation(failed) => Some(failed.actual),
            _ => None,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, WebDavError::Connection(_))
    }
}

impl From<reqwest::Error> for WebDavError {
    fn from(e: reqwest::Error) -> Self {
        WebDavError::Connection(e)
    }
}

impl From<quick_xml::Error> for WebDavError {
    fn from(e: quick_xml::Error) -> Self {
        WebDavError::MalformedResponse(e.to_string())
    }
}

impl From<tokio::task::JoinError> for WebDavError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            WebDavError::TaskFailed("cancelled".to_string())
        } else {
            WebDavError::TaskFailed(e.to_string())
        }
    }
}

/// A response status outside the set an operation accepts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.render())]
pub struct OperationFailed {
    pub method: DavMethod,
    pub path: String,
    pub expected: ExpectedStatus,
    pub actual: u16,
}

impl OperationFailed {
    pub fn new(
        method: DavMethod,
        path: impl Into<String>,
        expected: ExpectedStatus,
        actual: u16,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            expected,
            actual,
        }
    }

    /// Short summary, e.g. `Failed to create directory "docs/"`
    pub fn reason(&self) -> String {
        format!("Failed to {} \"{}\"", self.method.operation_name(), self.path)
    }

    /// Multi-line message with the operation, every accepted code and the actual one
    fn render(&self) -> String {
        let expected = self
            .expected
            .codes()
            .iter()
            .map(|code| code_with_reason(*code))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{}.\n  Operation     :  {} {}\n  Expected code :  {}\n  Actual code   :  {}",
            self.reason(),
            self.method,
            self.path,
            expected,
            code_with_reason(self.actual)
        )
    }
}

fn code_with_reason(code: u16) -> String {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("UNKNOWN");
    format!("{} {}", code, reason)
}
