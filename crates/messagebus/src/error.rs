use serde_json::Value;
use thiserror::Error;

/// A domain-level error exchanged on the wire as a JSON-RPC error object.
///
/// Unlike JSON-RPC's standard numeric `code`, this crate's `code` is a short
/// name (`"NotFound"`, `"Timeout"`, ...) per the wire format this bus speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub data: Option<Value>,
}

impl StructuredError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn not_found(method: &str) -> Self {
        Self::new("NotFound", format!("no such method: {method}"))
    }

    pub fn invalid_call(method: &str) -> Self {
        Self::new("InvalidCall", format!("wrong number of arguments for {method}"))
    }

    pub fn uncaught_exception() -> Self {
        Self::new("UncaughtException", "uncaught exception in handler")
    }

    pub fn timeout() -> Self {
        Self::new("Timeout", "method call timed out")
    }

    pub fn disconnected() -> Self {
        Self::new("Disconnected", "connection closed before a reply arrived")
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// What a registered handler returned besides a value: either a deliberate
/// [`StructuredError`] (forwarded to the caller verbatim) or some other error
/// a handler propagated with `?` (reported to the caller as
/// [`StructuredError::uncaught_exception`] after the real cause is logged).
#[derive(Debug)]
pub enum HandlerError {
    Structured(StructuredError),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        HandlerError::Other(Box::new(err))
    }
}

impl From<StructuredError> for HandlerError {
    fn from(err: StructuredError) -> Self {
        HandlerError::Structured(err)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Structured(err) => write!(f, "{err}"),
            HandlerError::Other(err) => write!(f, "{err}"),
        }
    }
}

/// Top-level error type for connection, framing, and dispatch failures that
/// never reach the wire (those are reported via [`StructuredError`] instead).
#[derive(Debug, Error)]
pub enum MessageBusError {
    #[error("malformed frame: non-whitespace before opening `{{`")]
    BadPreamble,

    #[error("message exceeds max_message_size ({0} bytes)")]
    MessageTooLarge(usize),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("connection is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error(transparent)]
    Rpc(#[from] StructuredError),
}
