use std::fmt;

use crate::utils::command::CommandError;

/// Error type for all kernel-facing network operations.
#[derive(Debug)]
pub enum NetError {
    /// External tool invocation failed
    Command(CommandError),
    /// System I/O error
    Io(std::io::Error),
    /// Output of a kernel tool could not be parsed
    Parse { what: String, message: String },
    /// Input validation failed
    Validation(String),
    /// Resource not found (interface, chain, container)
    NotFound(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Command(e) => write!(f, "command error: {}", e),
            NetError::Io(e) => write!(f, "io error: {}", e),
            NetError::Parse { what, message } => write!(f, "failed to parse {}: {}", what, message),
            NetError::Validation(msg) => write!(f, "validation error: {}", msg),
            NetError::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

impl std::error::Error for NetError {}

impl From<CommandError> for NetError {
    fn from(e: CommandError) -> Self {
        NetError::Command(e)
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(e)
    }
}

pub type NetResult<T> = Result<T, NetError>;
