//! Virtual thread lifecycle bridge.
//!
//! Virtual threads share carrier threads over time. A thread-local slot set by
//! one virtual thread would otherwise stay on the carrier and attribute samples
//! to whichever virtual thread last wrote it. When enabled, the bridge hooks the
//! runtime's mount/unmount events and rewrites the carrier's slot on every
//! switch:
//!
//! - mount: copy the runtime's raw storage of the mounted thread into the slot;
//! - unmount: clear the slot, so an idle carrier is never misattributed.
//!
//! Discovery happens once, in [`ThreadLifecycleBridge::initialize`]. Missing
//! support is not an error; it is recorded as a reason and reported when
//! someone asks to enable the bridge.
//!
//! Enable/disable are not locked internally (`&mut self`); the agent facade
//! serialises them.

use std::ptr::NonNull;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::error::{AgentError, Result};
use crate::host::{
    Capabilities, EventCallback, EventIndex, ExtensionEventInfo, Host, MIN_VIRTUAL_THREAD_VERSION,
    MOUNT_EVENT_ID, NotificationMode, SessionHandle, ThreadHandle, UNMOUNT_EVENT_ID,
};
use crate::status::VirtualThreadStatus;
use crate::storage;

/// Sessions with registered handlers, looked up by the callback trampolines.
static SESSIONS: LazyLock<DashMap<SessionHandle, Arc<dyn Host>>> = LazyLock::new(DashMap::new);

fn session(handle: SessionHandle) -> Option<Arc<dyn Host>> {
    SESSIONS.get(&handle).map(|entry| Arc::clone(entry.value()))
}

extern "C" fn mount_trampoline(session_handle: SessionHandle, thread: ThreadHandle) {
    match session(session_handle) {
        Some(host) => on_mount(host.as_ref(), thread),
        None => {
            tracing::trace!(session = session_handle.0, "Mount event for unknown session");
            storage::set_thread_buffer(None);
        }
    }
}

extern "C" fn unmount_trampoline(_session_handle: SessionHandle, thread: ThreadHandle) {
    on_unmount(thread);
}

/// Points the carrier's slot at the storage of the virtual thread being mounted.
///
/// Runs synchronously on the carrier thread.
pub fn on_mount(host: &dyn Host, thread: ThreadHandle) {
    if thread.is_null() {
        storage::set_thread_buffer(None);
        return;
    }
    match host.thread_local_storage(thread) {
        Ok(address) => storage::set_thread_buffer(NonNull::new(address)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read thread local storage of mounted thread");
            storage::set_thread_buffer(None);
        }
    }
}

/// Clears the carrier's slot when a virtual thread leaves it.
pub fn on_unmount(_thread: ThreadHandle) {
    storage::set_thread_buffer(None);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Mount,
    Unmount,
}

impl EventKind {
    fn handler(self) -> EventCallback {
        match self {
            Self::Mount => mount_trampoline,
            Self::Unmount => unmount_trampoline,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Callback(EventKind),
    Notification(EventKind),
}

impl Step {
    fn op(self, enable: bool) -> &'static str {
        match (self, enable) {
            (Self::Callback(EventKind::Mount), true) => "register_mount_callback",
            (Self::Callback(EventKind::Unmount), true) => "register_unmount_callback",
            (Self::Callback(EventKind::Mount), false) => "unregister_mount_callback",
            (Self::Callback(EventKind::Unmount), false) => "unregister_unmount_callback",
            (Self::Notification(EventKind::Mount), true) => "enable_mount_notification",
            (Self::Notification(EventKind::Unmount), true) => "enable_unmount_notification",
            (Self::Notification(EventKind::Mount), false) => "disable_mount_notification",
            (Self::Notification(EventKind::Unmount), false) => "disable_unmount_notification",
        }
    }
}

const ENABLE_STEPS: [Step; 4] = [
    Step::Callback(EventKind::Mount),
    Step::Callback(EventKind::Unmount),
    Step::Notification(EventKind::Mount),
    Step::Notification(EventKind::Unmount),
];

const DISABLE_STEPS: [Step; 4] = [
    Step::Notification(EventKind::Mount),
    Step::Notification(EventKind::Unmount),
    Step::Callback(EventKind::Mount),
    Step::Callback(EventKind::Unmount),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Support {
    Unsupported(String),
    Supported {
        mount: EventIndex,
        unmount: EventIndex,
    },
}

pub struct ThreadLifecycleBridge {
    host: Arc<dyn Host>,
    support: Support,
    callbacks_enabled: bool,
}

impl ThreadLifecycleBridge {
    /// Runs capability discovery against `host`.
    ///
    /// Only a failing host query is an error; a runtime without virtual
    /// thread support yields an unsupported bridge.
    pub fn initialize(host: Arc<dyn Host>) -> Result<Self> {
        let support = discover(host.as_ref())?;
        match &support {
            Support::Unsupported(reason) => {
                tracing::info!(reason = %reason, "Virtual thread correlation is unavailable");
            }
            Support::Supported { mount, unmount } => {
                tracing::debug!(%mount, %unmount, "Virtual thread mount events discovered");
            }
        }
        Ok(Self {
            host,
            support,
            callbacks_enabled: false,
        })
    }

    pub fn is_supported(&self) -> bool {
        matches!(self.support, Support::Supported { .. })
    }

    /// Why bridging is unavailable, or `None` when it is supported.
    pub fn unsupported_reason(&self) -> Option<&str> {
        match &self.support {
            Support::Unsupported(reason) => Some(reason),
            Support::Supported { .. } => None,
        }
    }

    pub fn callbacks_enabled(&self) -> bool {
        self.callbacks_enabled
    }

    /// `(mount, unmount)` catalogue indices, when supported.
    pub fn event_indices(&self) -> Option<(EventIndex, EventIndex)> {
        match self.support {
            Support::Supported { mount, unmount } => Some((mount, unmount)),
            Support::Unsupported(_) => None,
        }
    }

    pub fn status(&self) -> VirtualThreadStatus {
        VirtualThreadStatus {
            supported: self.is_supported(),
            unsupported_reason: self.unsupported_reason().map(str::to_string),
            enabled: self.callbacks_enabled,
            mount_event: self.event_indices().map(|(mount, _)| mount),
            unmount_event: self.event_indices().map(|(_, unmount)| unmount),
        }
    }

    /// Turns the mount/unmount handlers on or off.
    ///
    /// A no-op when already in the requested state. Enabling an unsupported
    /// bridge fails. A failed enable undoes its completed steps and leaves the
    /// bridge disabled. Disable always attempts every step, reports the first
    /// failure and ends disabled regardless.
    pub fn set_callbacks_enabled(&mut self, enable: bool) -> Result<()> {
        if enable == self.callbacks_enabled {
            return Ok(());
        }
        let Support::Supported { .. } = self.support else {
            return Err(AgentError::Unsupported {
                reason: self.unsupported_reason().unwrap_or_default().to_string(),
            });
        };
        if enable { self.enable() } else { self.disable() }
    }

    fn index(&self, kind: EventKind) -> Option<EventIndex> {
        let (mount, unmount) = self.event_indices()?;
        Some(match kind {
            EventKind::Mount => mount,
            EventKind::Unmount => unmount,
        })
    }

    fn apply(&self, step: Step, enable: bool) -> Result<()> {
        let op = step.op(enable);
        let kind = match step {
            Step::Callback(kind) | Step::Notification(kind) => kind,
        };
        let Some(event) = self.index(kind) else {
            return Err(AgentError::invalid_state(op, "virtual thread events were not discovered"));
        };
        let result = match step {
            Step::Callback(kind) => self
                .host
                .set_extension_event_callback(event, enable.then_some(kind.handler())),
            Step::Notification(_) => self
                .host
                .set_event_notification(NotificationMode::from_enabled(enable), event),
        };
        result.map_err(|e| AgentError::host(op, e))
    }

    fn enable(&mut self) -> Result<()> {
        let handle = self.host.session_handle();
        SESSIONS.insert(handle, Arc::clone(&self.host));

        let mut done = Vec::with_capacity(ENABLE_STEPS.len());
        for step in ENABLE_STEPS {
            if let Err(e) = self.apply(step, true) {
                for completed in done.into_iter().rev() {
                    if let Err(undo) = self.apply(completed, false) {
                        tracing::warn!(error = %undo, "Failed to undo partial enable");
                    }
                }
                SESSIONS.remove(&handle);
                return Err(e);
            }
            done.push(step);
        }

        self.callbacks_enabled = true;
        tracing::debug!(session = handle.0, "Virtual thread mount callbacks enabled");
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        let mut first_error = None;
        for step in DISABLE_STEPS {
            if let Err(e) = self.apply(step, false) {
                tracing::warn!(error = %e, "Failed to disable virtual thread callback");
                first_error.get_or_insert(e);
            }
        }

        SESSIONS.remove(&self.host.session_handle());
        self.callbacks_enabled = false;
        tracing::debug!("Virtual thread mount callbacks disabled");
        first_error.map_or(Ok(()), Err)
    }

    /// Disables the handlers if enabled, then releases the session.
    pub fn destroy(mut self) -> Result<()> {
        let disabled = self.set_callbacks_enabled(false);
        let disposed = self
            .host
            .dispose()
            .map_err(|e| AgentError::host("dispose", e));
        disabled.and(disposed)
    }
}

impl std::fmt::Debug for ThreadLifecycleBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLifecycleBridge")
            .field("session", &self.host.session_handle())
            .field("support", &self.support)
            .field("callbacks_enabled", &self.callbacks_enabled)
            .finish()
    }
}

fn discover(host: &dyn Host) -> Result<Support> {
    let version = host
        .version()
        .map_err(|e| AgentError::host("get_version", e))?;
    if version < MIN_VIRTUAL_THREAD_VERSION {
        return Ok(Support::Unsupported(format!(
            "runtime interface version {version} is too old, version {MIN_VIRTUAL_THREAD_VERSION} or newer is required"
        )));
    }

    let potential = host
        .potential_capabilities()
        .map_err(|e| AgentError::host("get_potential_capabilities", e))?;
    if !potential.support_virtual_threads {
        return Ok(Support::Unsupported(
            "the runtime does not offer the capability to observe virtual thread scheduling"
                .to_string(),
        ));
    }
    host.add_capabilities(Capabilities {
        support_virtual_threads: true,
    })
    .map_err(|e| AgentError::host("add_capabilities", e))?;

    let events = host
        .extension_events()
        .map_err(|e| AgentError::host("get_extension_events", e))?;
    let mount = find_thread_event(&events, MOUNT_EVENT_ID);
    let unmount = find_thread_event(&events, UNMOUNT_EVENT_ID);

    Ok(match (mount, unmount) {
        (Some(mount), Some(unmount)) => Support::Supported { mount, unmount },
        (None, Some(_)) => Support::Unsupported(format!(
            "virtual thread mount event '{MOUNT_EVENT_ID}' not found"
        )),
        (Some(_), None) => Support::Unsupported(format!(
            "virtual thread unmount event '{UNMOUNT_EVENT_ID}' not found"
        )),
        (None, None) => Support::Unsupported(format!(
            "virtual thread mount and unmount events ('{MOUNT_EVENT_ID}', '{UNMOUNT_EVENT_ID}') not found"
        )),
    })
}

/// An event only counts when its signature is `(execution context, thread)`.
fn find_thread_event(events: &[ExtensionEventInfo], id: &str) -> Option<EventIndex> {
    events
        .iter()
        .find(|event| event.id == id && event.has_thread_event_signature())
        .map(|event| event.index)
}
