use std::fmt;

use docdb_proto::{ErrorType, ProtocolError, Response, ResponseType};
use serde_json::Value;
use thiserror::Error;

/// Error reported by the server for a rejected or failed query
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub message: String,
    /// JSON text of the term that failed, when known
    pub term: Option<String>,
    pub backtrace: Vec<Value>,
}

impl ServerError {
    pub fn from_response(response: &Response, term: Option<&Value>) -> Self {
        Self {
            message: response.error_message(),
            term: term.map(|t| t.to_string()),
            backtrace: response.backtrace.clone(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.term {
            Some(term) => write!(f, "{} in: {}", self.message, term),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Query timed out: {0}")]
    Timeout(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Client error: {0}")]
    Client(ServerError),

    #[error("Compile error: {0}")]
    Compile(ServerError),

    #[error("Runtime error ({kind}): {error}")]
    Runtime { kind: ErrorType, error: ServerError },

    #[error("Empty result")]
    EmptyResult,

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Invalid node")]
    InvalidNode,

    #[error("No hosts available")]
    NoHosts,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Errors meaning the node could not be reached, as opposed to the node answering with an error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DriverError::Connection(_) | DriverError::ConnectionClosed | DriverError::Handshake(_)
        )
    }

    /// Whether a write may or may not have been applied; callers may retry these themselves
    pub fn is_op_indeterminate(&self) -> bool {
        matches!(
            self,
            DriverError::Runtime {
                kind: ErrorType::OpIndeterminate,
                ..
            }
        )
    }

    /// Build the error carried by a CLIENT/COMPILE/RUNTIME error response
    pub fn from_response(response: &Response, term: Option<&Value>) -> Self {
        let error = ServerError::from_response(response, term);
        match response.response_type() {
            Some(ResponseType::ClientError) => DriverError::Client(error),
            Some(ResponseType::CompileError) => DriverError::Compile(error),
            Some(ResponseType::RuntimeError) => DriverError::Runtime {
                kind: ErrorType::from_code(response.error_type.unwrap_or_default()),
                error,
            },
            _ => DriverError::Driver(format!(
                "unexpected response type {} for error",
                response.type_code
            )),
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Decode(err.to_string())
    }
}

impl From<ProtocolError> for DriverError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => DriverError::Connection(e.to_string()),
            ProtocolError::Handshake(msg) | ProtocolError::Auth(msg) => DriverError::Handshake(msg),
            ProtocolError::Json(e) => DriverError::Driver(format!("malformed message: {}", e)),
            other => DriverError::Driver(other.to_string()),
        }
    }
}
