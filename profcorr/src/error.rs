//! Error taxonomy shared by every agent operation.
//!
//! Callers on the far side of a C boundary only see [`ReturnCode`]; the Rust
//! side keeps the operation, parameter and OS error code for logging.

use crate::host::HostError;

#[cfg(unix)]
pub use nix::errno::Errno;

/// Discriminated result handed across the foreign-function boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    Success = 0,
    Error = -1,
    NotInitialized = -2,
}

impl ReturnCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl<T> From<&Result<T, AgentError>> for ReturnCode {
    fn from(result: &Result<T, AgentError>) -> Self {
        match result {
            Ok(_) => ReturnCode::Success,
            Err(e) => e.return_code(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A caller-supplied argument was rejected before any resource was touched.
    #[error("{op}: {message}")]
    InvalidArgument { op: &'static str, message: String },

    /// The operation is not valid in the current state (already open, not open, ...).
    #[error("{op}: {message}")]
    InvalidState { op: &'static str, message: String },

    /// A system call failed.
    #[cfg(unix)]
    #[error("{op}: {message}, error is {errno} ({code})", code = errno_code(.errno))]
    Os {
        op: &'static str,
        message: String,
        errno: Errno,
    },

    /// The runtime introspection session reported a failure.
    #[error("{op}: {source}")]
    Host {
        op: &'static str,
        #[source]
        source: HostError,
    },

    /// Virtual thread bridging was requested but the runtime cannot provide it.
    #[error("virtual thread support is unavailable: {reason}")]
    Unsupported { reason: String },

    #[error("profiler correlation agent has not been initialized")]
    NotInitialized,
}

impl AgentError {
    pub fn invalid_argument(op: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            message: message.into(),
        }
    }

    pub fn invalid_state(op: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            op,
            message: message.into(),
        }
    }

    #[cfg(unix)]
    pub fn os(op: &'static str, message: impl Into<String>, errno: Errno) -> Self {
        Self::Os {
            op,
            message: message.into(),
            errno,
        }
    }

    pub fn host(op: &'static str, source: HostError) -> Self {
        Self::Host { op, source }
    }

    /// OS error code carried by this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            #[cfg(unix)]
            Self::Os { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }

    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::NotInitialized => ReturnCode::NotInitialized,
            _ => ReturnCode::Error,
        }
    }
}

#[cfg(unix)]
fn errno_code(errno: &Errno) -> i32 {
    *errno as i32
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
