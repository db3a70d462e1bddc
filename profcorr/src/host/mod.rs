//! Runtime introspection session.
//!
//! The managed runtime exposes its scheduler through a versioned introspection
//! interface: capability negotiation, a catalogue of extension events, callback
//! registration and per-thread raw storage. [`Host`] is that interface as seen
//! by the agent. A native adapter implements it over the runtime's C API; tests
//! use [`fake::FakeHost`].
//!
//! Callbacks cross the boundary as plain `extern "C"` functions receiving
//! `(SessionHandle, ThreadHandle)`. The session handle is chosen by the host and
//! must stay stable for the session's lifetime; the agent uses it to find its
//! own state for the session.

use std::ffi::c_void;
use std::fmt;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

/// Extension event fired when a virtual thread is mounted on a carrier.
pub const MOUNT_EVENT_ID: &str = "com.sun.hotspot.events.VirtualThreadMount";
/// Extension event fired when a virtual thread is unmounted from a carrier.
pub const UNMOUNT_EVENT_ID: &str = "com.sun.hotspot.events.VirtualThreadUnmount";

/// First interface version that defines virtual threads.
pub const MIN_VIRTUAL_THREAD_VERSION: HostVersion = HostVersion::new(21, 0, 0);

/// Error code reported by the host. Zero is never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("host returned error code {code}")]
pub struct HostError {
    pub code: i32,
}

impl HostError {
    pub const fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Identifies one introspection session when the host calls back into the agent.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Opaque thread reference owned by the host.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(*mut c_void);

impl ThreadHandle {
    pub const fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub const fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Position of an event in the host's extension-event catalogue.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct EventIndex(pub i32);

impl fmt::Display for EventIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler invoked synchronously by the host on the carrier thread.
pub type EventCallback = extern "C" fn(session: SessionHandle, thread: ThreadHandle);

/// Interface version, packed as `major << 16 | minor << 8 | micro` below the
/// interface-type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostVersion(u32);

impl HostVersion {
    const MAJOR_MASK: u32 = 0x0FFF_0000;
    const MINOR_MASK: u32 = 0x0000_FF00;
    const MICRO_MASK: u32 = 0x0000_00FF;

    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self(
            0x3000_0000
                | ((major << 16) & Self::MAJOR_MASK)
                | ((minor << 8) & Self::MINOR_MASK)
                | (micro & Self::MICRO_MASK),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        (self.0 & Self::MAJOR_MASK) >> 16
    }

    pub const fn minor(self) -> u32 {
        (self.0 & Self::MINOR_MASK) >> 8
    }

    pub const fn micro(self) -> u32 {
        self.0 & Self::MICRO_MASK
    }

    fn ordinal(self) -> (u32, u32, u32) {
        (self.major(), self.minor(), self.micro())
    }
}

impl PartialOrd for HostVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HostVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.micro())
    }
}

/// Capabilities the agent negotiates with the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Observe virtual thread scheduling (mount/unmount events).
    pub support_virtual_threads: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Enable,
    Disable,
}

impl NotificationMode {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled { Self::Enable } else { Self::Disable }
    }
}

/// How a callback parameter is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    In,
    InPtr,
    InBuf,
    AllocBuf,
    Out,
    OutBuf,
}

/// What a callback parameter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Per-thread execution context of the runtime's native interface.
    ExecutionContext,
    Thread,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: String,
    pub kind: ParamKind,
    pub base_type: ParamType,
    pub null_ok: bool,
}

impl ParamInfo {
    pub fn new(name: impl Into<String>, kind: ParamKind, base_type: ParamType, null_ok: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            base_type,
            null_ok,
        }
    }
}

/// One entry of the host's extension-event catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEventInfo {
    pub index: EventIndex,
    pub id: String,
    pub short_description: String,
    pub params: Vec<ParamInfo>,
}

impl ExtensionEventInfo {
    /// Checks for the `(execution context, thread)` signature shared by the
    /// mount and unmount events.
    pub fn has_thread_event_signature(&self) -> bool {
        match self.params.as_slice() {
            [ctx, thread] => {
                ctx.kind == ParamKind::InPtr
                    && ctx.base_type == ParamType::ExecutionContext
                    && !ctx.null_ok
                    && thread.kind == ParamKind::In
                    && thread.base_type == ParamType::Thread
                    && !thread.null_ok
            }
            _ => false,
        }
    }
}

/// The runtime's introspection session.
///
/// Implementations must tolerate calls from any thread; the agent serialises
/// state changes itself but callbacks arrive on carrier threads.
pub trait Host: Send + Sync {
    fn session_handle(&self) -> SessionHandle;

    fn version(&self) -> Result<HostVersion, HostError>;

    fn potential_capabilities(&self) -> Result<Capabilities, HostError>;

    fn add_capabilities(&self, capabilities: Capabilities) -> Result<(), HostError>;

    fn extension_events(&self) -> Result<Vec<ExtensionEventInfo>, HostError>;

    /// Registers (`Some`) or removes (`None`) the handler for an extension event.
    fn set_extension_event_callback(
        &self,
        event: EventIndex,
        callback: Option<EventCallback>,
    ) -> Result<(), HostError>;

    fn set_event_notification(
        &self,
        mode: NotificationMode,
        event: EventIndex,
    ) -> Result<(), HostError>;

    /// Raw value of the runtime-managed storage slot of `thread`.
    fn thread_local_storage(&self, thread: ThreadHandle) -> Result<*mut c_void, HostError>;

    /// Releases the session. No other method is called afterwards.
    fn dispose(&self) -> Result<(), HostError>;
}
