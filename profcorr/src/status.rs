//! Serializable agent status.

use std::path::PathBuf;

use crate::host::EventIndex;
use crate::storage::CORRELATION_FORMAT_VERSION;

/// Crate version from Cargo.toml
pub const PROFCORR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Uninitialized,
    Initialized,
    /// Teardown failed part-way; a new init is required.
    DestroyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VirtualThreadStatus {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsupported_reason: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_event: Option<EventIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmount_event: Option<EventIndex>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStatus {
    pub version: &'static str,
    pub state: AgentState,
    /// Generation of the exported correlation symbols.
    pub format_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_threads: Option<VirtualThreadStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    pub process_buffer_set: bool,
}

impl AgentStatus {
    pub fn new(state: AgentState) -> Self {
        Self {
            version: PROFCORR_VERSION,
            state,
            format_version: CORRELATION_FORMAT_VERSION,
            virtual_threads: None,
            socket_path: None,
            process_buffer_set: false,
        }
    }

    pub fn with_virtual_threads(mut self, status: VirtualThreadStatus) -> Self {
        self.virtual_threads = Some(status);
        self
    }

    pub fn with_socket_path(mut self, path: Option<PathBuf>) -> Self {
        self.socket_path = path;
        self
    }

    pub fn with_process_buffer_set(mut self, set: bool) -> Self {
        self.process_buffer_set = set;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
