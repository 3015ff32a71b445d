//! Error types for parley.
//!
//! Every failure the session core can observe is an [`Error`].  The session state machine only
//! cares about the coarse [`ErrorKind`], which is what ends up in `SessionState::Failed`.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// The coarse classification the session state machine acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response arrived within the time budget.
    Timeout,
    /// The backend could not be reached or answered with a non-success status.
    TransportUnavailable,
    /// A streamed record failed to parse.  Recovered locally by the decoder.
    MalformedSegment,
    /// A request was attempted while another one was in flight.
    Busy,
    /// The backend is warming up; retrying after a wait is likely to succeed.
    ColdStart,
    /// The caller aborted the request.
    Aborted,
    /// Anything outside the request lifecycle: configuration, URLs, local I/O.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransportUnavailable => "transport unavailable",
            ErrorKind::MalformedSegment => "malformed segment",
            ErrorKind::Busy => "busy",
            ErrorKind::ColdStart => "cold start",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// The main error type for parley.
#[derive(Clone, Debug)]
pub enum Error {
    /// The backend answered with a non-success status that is not a cold-start signal.
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Human-readable error message, usually the backend's `detail` field.
        message: String,
    },

    /// No data arrived before the deadline.
    Timeout {
        /// Human-readable error message.
        message: String,
        /// Duration of the timeout in seconds.
        duration: Option<f64>,
    },

    /// Request was aborted by the caller.
    Abort {
        /// Human-readable error message.
        message: String,
    },

    /// Connection refused, DNS failure, or another network-level failure.
    Connection {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The backend is still starting up.
    ColdStart {
        /// HTTP status code that carried the signal, if any.
        status_code: Option<u16>,
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds, when the backend said so.
        retry_after: Option<u64>,
    },

    /// A request was attempted while one was already in flight.
    Busy {
        /// Human-readable error message.
        message: String,
    },

    /// One streamed record could not be parsed.
    MalformedSegment {
        /// The offending record, as received.
        segment: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The response body broke off mid-read.
    Streaming {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Error during JSON or YAML serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// HTTP client construction or request building failed.
    HttpClient {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// A URL parsing or manipulation error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// Invalid configuration or arguments.
    Validation {
        /// Human-readable error message.
        message: String,
    },
}

impl Error {
    /// Creates a new API error.
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Error::Api {
            status_code,
            message: message.into(),
        }
    }

    /// Creates a new timeout error.
    pub fn timeout(message: impl Into<String>, duration: Option<f64>) -> Self {
        Error::Timeout {
            message: message.into(),
            duration,
        }
    }

    /// Creates a new abort error.
    pub fn abort(message: impl Into<String>) -> Self {
        Error::Abort {
            message: message.into(),
        }
    }

    /// Creates a new connection error.
    pub fn connection(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new cold-start error.
    pub fn cold_start(
        status_code: Option<u16>,
        message: impl Into<String>,
        retry_after: Option<u64>,
    ) -> Self {
        Error::ColdStart {
            status_code,
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Error::Busy {
            message: message.into(),
        }
    }

    /// Creates a new malformed segment error.
    pub fn malformed_segment(
        segment: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::MalformedSegment {
            segment: segment.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new streaming error.
    pub fn streaming(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Streaming {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new HTTP client error.
    pub fn http_client(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::HttpClient {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Classifies this error for the session state machine.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Api { .. }
            | Error::Connection { .. }
            | Error::Streaming { .. }
            | Error::HttpClient { .. } => ErrorKind::TransportUnavailable,
            // A buffered answer that does not parse is as useless as no answer at all.
            Error::Serialization { .. } => ErrorKind::TransportUnavailable,
            Error::MalformedSegment { .. } => ErrorKind::MalformedSegment,
            Error::Busy { .. } => ErrorKind::Busy,
            Error::ColdStart { .. } => ErrorKind::ColdStart,
            Error::Abort { .. } => ErrorKind::Aborted,
            Error::Url { .. } | Error::Io { .. } | Error::Validation { .. } => ErrorKind::Other,
        }
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true if this error is an abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort { .. })
    }

    /// Returns true if this error is a connection error.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    /// Returns true if this error is a cold-start signal.
    pub fn is_cold_start(&self) -> bool {
        matches!(self, Error::ColdStart { .. })
    }

    /// Returns true if this error is a busy rejection.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }

    /// Returns true if this error is a malformed stream record.
    pub fn is_malformed_segment(&self) -> bool {
        matches!(self, Error::MalformedSegment { .. })
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status_code, .. } => Some(*status_code),
            Error::ColdStart { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Returns the backend's requested wait, if it sent one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::ColdStart { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Api {
                status_code,
                message,
            } => {
                write!(f, "API error ({status_code}): {message}")
            }
            Error::Timeout { message, duration } => {
                if let Some(duration) = duration {
                    write!(f, "Timeout error: {message} ({duration} seconds)")
                } else {
                    write!(f, "Timeout error: {message}")
                }
            }
            Error::Abort { message } => {
                write!(f, "Request aborted: {message}")
            }
            Error::Connection { message, .. } => {
                write!(f, "Connection error: {message}")
            }
            Error::ColdStart {
                message,
                retry_after,
                ..
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Backend warming up: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Backend warming up: {message}")
                }
            }
            Error::Busy { message } => {
                write!(f, "Busy: {message}")
            }
            Error::MalformedSegment { segment, source } => {
                if let Some(source) = source {
                    write!(f, "Malformed stream record {segment:?}: {source}")
                } else {
                    write!(f, "Malformed stream record {segment:?}")
                }
            }
            Error::Streaming { message, .. } => {
                write!(f, "Streaming error: {message}")
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::HttpClient { message, .. } => {
                write!(f, "HTTP client error: {message}")
            }
            Error::Url { message, .. } => {
                write!(f, "URL error: {message}")
            }
            Error::Io { message, .. } => {
                write!(f, "I/O error: {message}")
            }
            Error::Validation { message } => {
                write!(f, "Validation error: {message}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Connection { source, .. }
            | Error::MalformedSegment { source, .. }
            | Error::Streaming { source, .. }
            | Error::Serialization { source, .. }
            | Error::HttpClient { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source.as_ref()),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

/// A specialized Result type for parley operations.
pub type Result<T> = std::result::Result<T, Error>;
