//! profcorr: correlation between an external sampling profiler and the
//! process it samples.

mod config;
mod error;
mod status;

pub mod agent;
pub mod host;
#[cfg(unix)]
pub mod socket;
pub mod storage;
pub mod vthread;

pub use config::{AgentConfig, LogConfig, LogFormat, LogLevel};
pub use error::{AgentError, Result, ReturnCode};
#[cfg(unix)]
pub use error::Errno;
pub use host::{Host, HostError, HostVersion, SessionHandle, ThreadHandle};
#[cfg(unix)]
pub use socket::ControlSocket;
pub use status::{AgentState, AgentStatus, PROFCORR_VERSION, VirtualThreadStatus};
pub use storage::{BufferAlias, CorrelationBuffer};
pub use vthread::ThreadLifecycleBridge;
