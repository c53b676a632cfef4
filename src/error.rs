//! Error Types
//!
//! Typed errors for configuration and transport failures, plus the closed
//! classification every transport error is mapped to before it leaves a
//! connection client.

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

use crate::connection::ClientType;
use crate::retry::RetryError;

/// EBUSY on Linux and the BSDs
#[cfg(unix)]
const EBUSY: i32 = 16;

/// Configuration problems detected before any I/O happens
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid serial {field} `{value}`: expected one of {allowed}")]
    InvalidSerialSetting {
        field: &'static str,
        value: String,
        allowed: &'static str,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How a transport error should be treated by the retry machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Transient: refused, not found, busy, reset, timed out
    Retryable,
    /// Permission or access problems; retrying cannot help
    Fatal,
    /// Anything else; logged and surfaced as an event
    Unexpected,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Unexpected => write!(f, "unexpected"),
        }
    }
}

/// Classify an I/O error kind
pub fn classify_io_kind(kind: io::ErrorKind) -> ErrorClass {
    use io::ErrorKind::*;

    match kind {
        ConnectionRefused | NotFound | ConnectionReset | ConnectionAborted | TimedOut
        | BrokenPipe | NotConnected | AddrNotAvailable | AddrInUse | UnexpectedEof
        | Interrupted | WouldBlock => ErrorClass::Retryable,
        PermissionDenied => ErrorClass::Fatal,
        _ => ErrorClass::Unexpected,
    }
}

/// Classify an I/O error, including raw OS codes that have no stable `ErrorKind`
pub fn classify_io(err: &io::Error) -> ErrorClass {
    #[cfg(unix)]
    if err.raw_os_error() == Some(EBUSY) {
        return ErrorClass::Retryable;
    }

    classify_io_kind(err.kind())
}

/// Errors produced by connection clients
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{client} is not connected")]
    NotConnected { client: ClientType },

    #[error("{client} {operation} failed ({class}): {source}")]
    Io {
        client: ClientType,
        operation: &'static str,
        class: ErrorClass,
        #[source]
        source: io::Error,
    },

    #[error("{client} failed to connect after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        client: ClientType,
        attempts: u32,
        #[source]
        source: Box<ConnectionError>,
    },

    #[error("{client} connect abandoned because the client is closing")]
    Cancelled { client: ClientType },

    #[error("{client} write abandoned because the client was force-closed")]
    WriteAborted { client: ClientType },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConnectionError {
    /// Build an I/O error, classifying it at the adapter boundary
    pub fn io(client: ClientType, operation: &'static str, source: io::Error) -> Self {
        let class = classify_io(&source);
        ConnectionError::Io {
            client,
            operation,
            class,
            source,
        }
    }

    /// Classification used to decide whether a connect attempt is retried
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectionError::NotConnected { .. } => ErrorClass::Retryable,
            ConnectionError::Io { class, .. } => *class,
            ConnectionError::RetriesExhausted { source, .. } => source.class(),
            // Neither a cancelled connect nor a bad config is worth another attempt
            ConnectionError::Cancelled { .. }
            | ConnectionError::WriteAborted { .. }
            | ConnectionError::Config(_) => ErrorClass::Fatal,
        }
    }

    pub fn client(&self) -> Option<ClientType> {
        match self {
            ConnectionError::NotConnected { client }
            | ConnectionError::Io { client, .. }
            | ConnectionError::RetriesExhausted { client, .. }
            | ConnectionError::Cancelled { client }
            | ConnectionError::WriteAborted { client } => Some(*client),
            ConnectionError::Config(_) => None,
        }
    }

    /// Number of connect attempts behind this error, when it came from the retry loop
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ConnectionError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub(crate) fn from_retry(client: ClientType, err: RetryError<ConnectionError>) -> Self {
        match err {
            RetryError::Exhausted {
                attempts, source, ..
            } => ConnectionError::RetriesExhausted {
                client,
                attempts,
                source: Box::new(source),
            },
            // Fatal errors surface as-is
            RetryError::Aborted { source, .. } => source,
        }
    }
}
