//! In-process host for tests.
//!
//! Records every call and can be told to fail specific ones. Registered
//! callbacks fire on the calling thread, as a runtime scheduler fires them on
//! the carrier.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{
    Capabilities, EventCallback, EventIndex, ExtensionEventInfo, Host, HostError, HostVersion,
    MIN_VIRTUAL_THREAD_VERSION, MOUNT_EVENT_ID, NotificationMode, ParamInfo, ParamKind, ParamType,
    SessionHandle, ThreadHandle, UNMOUNT_EVENT_ID,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Index of the mount event in [`FakeHost::standard_events`].
pub const FAKE_MOUNT_INDEX: EventIndex = EventIndex(4);
/// Index of the unmount event in [`FakeHost::standard_events`].
pub const FAKE_UNMOUNT_INDEX: EventIndex = EventIndex(5);

/// A call made against the fake, in the order it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Version,
    PotentialCapabilities,
    AddCapabilities,
    ExtensionEvents,
    SetCallback { event: EventIndex, registered: bool },
    SetNotification { event: EventIndex, enabled: bool },
    ThreadLocalStorage,
    Dispose,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<HostCall>,
    failures: HashMap<HostCall, i32>,
    added: Capabilities,
    callbacks: HashMap<EventIndex, EventCallback>,
    notifications: HashSet<EventIndex>,
    tls: HashMap<usize, usize>,
    disposed: bool,
}

pub struct FakeHost {
    handle: SessionHandle,
    version: HostVersion,
    capabilities: Capabilities,
    events: Vec<ExtensionEventInfo>,
    state: Mutex<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A host that supports virtual threads.
    pub fn new() -> Self {
        Self {
            handle: SessionHandle(NEXT_SESSION.fetch_add(1, Ordering::Relaxed)),
            version: MIN_VIRTUAL_THREAD_VERSION,
            capabilities: Capabilities {
                support_virtual_threads: true,
            },
            events: Self::standard_events(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_version(mut self, version: HostVersion) -> Self {
        self.version = version;
        self
    }

    pub fn without_virtual_thread_capability(mut self) -> Self {
        self.capabilities.support_virtual_threads = false;
        self
    }

    pub fn with_events(mut self, events: Vec<ExtensionEventInfo>) -> Self {
        self.events = events;
        self
    }

    /// Catalogue with an unrelated event followed by mount and unmount.
    pub fn standard_events() -> Vec<ExtensionEventInfo> {
        vec![
            ExtensionEventInfo {
                index: EventIndex(3),
                id: "com.sun.hotspot.events.ClassUnload".to_string(),
                short_description: "class unload".to_string(),
                params: vec![ParamInfo::new("class", ParamKind::In, ParamType::Other, false)],
            },
            Self::thread_event(FAKE_MOUNT_INDEX, MOUNT_EVENT_ID),
            Self::thread_event(FAKE_UNMOUNT_INDEX, UNMOUNT_EVENT_ID),
        ]
    }

    /// An event with the `(execution context, thread)` signature.
    pub fn thread_event(index: EventIndex, id: &str) -> ExtensionEventInfo {
        ExtensionEventInfo {
            index,
            id: id.to_string(),
            short_description: String::new(),
            params: vec![
                ParamInfo::new("env", ParamKind::InPtr, ParamType::ExecutionContext, false),
                ParamInfo::new("thread", ParamKind::In, ParamType::Thread, false),
            ],
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: HostCall) -> Result<(), HostError> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.failures.get(&call) {
            Some(code) => Err(HostError::new(*code)),
            None => Ok(()),
        }
    }

    /// Makes every subsequent `call` fail with `code`.
    pub fn fail_on(&self, call: HostCall, code: i32) {
        self.lock().failures.insert(call, code);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn added_capabilities(&self) -> Capabilities {
        self.lock().added
    }

    pub fn has_callback(&self, event: EventIndex) -> bool {
        self.lock().callbacks.contains_key(&event)
    }

    pub fn notification_enabled(&self, event: EventIndex) -> bool {
        self.lock().notifications.contains(&event)
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Value the runtime reports for `thread`'s storage slot.
    pub fn set_thread_local_storage(&self, thread: ThreadHandle, address: *mut c_void) {
        self.lock()
            .tls
            .insert(thread.as_ptr() as usize, address as usize);
    }

    /// Delivers `event` for `thread` on the calling thread, if the event has a
    /// handler and notification is enabled. Returns whether it was delivered.
    pub fn fire(&self, event: EventIndex, thread: ThreadHandle) -> bool {
        let callback = {
            let state = self.lock();
            if !state.notifications.contains(&event) {
                return false;
            }
            state.callbacks.get(&event).copied()
        };
        match callback {
            Some(callback) => {
                callback(self.handle, thread);
                true
            }
            None => false,
        }
    }

    pub fn mount(&self, thread: ThreadHandle) -> bool {
        self.fire(FAKE_MOUNT_INDEX, thread)
    }

    pub fn unmount(&self, thread: ThreadHandle) -> bool {
        self.fire(FAKE_UNMOUNT_INDEX, thread)
    }
}

impl Host for FakeHost {
    fn session_handle(&self) -> SessionHandle {
        self.handle
    }

    fn version(&self) -> Result<HostVersion, HostError> {
        self.record(HostCall::Version)?;
        Ok(self.version)
    }

    fn potential_capabilities(&self) -> Result<Capabilities, HostError> {
        self.record(HostCall::PotentialCapabilities)?;
        Ok(self.capabilities)
    }

    fn add_capabilities(&self, capabilities: Capabilities) -> Result<(), HostError> {
        self.record(HostCall::AddCapabilities)?;
        if capabilities.support_virtual_threads && !self.capabilities.support_virtual_threads {
            // JVMTI_ERROR_NOT_AVAILABLE
            return Err(HostError::new(98));
        }
        self.lock().added = capabilities;
        Ok(())
    }

    fn extension_events(&self) -> Result<Vec<ExtensionEventInfo>, HostError> {
        self.record(HostCall::ExtensionEvents)?;
        Ok(self.events.clone())
    }

    fn set_extension_event_callback(
        &self,
        event: EventIndex,
        callback: Option<EventCallback>,
    ) -> Result<(), HostError> {
        self.record(HostCall::SetCallback {
            event,
            registered: callback.is_some(),
        })?;
        let mut state = self.lock();
        match callback {
            Some(callback) => {
                state.callbacks.insert(event, callback);
            }
            None => {
                state.callbacks.remove(&event);
            }
        }
        Ok(())
    }

    fn set_event_notification(
        &self,
        mode: NotificationMode,
        event: EventIndex,
    ) -> Result<(), HostError> {
        let enabled = mode == NotificationMode::Enable;
        self.record(HostCall::SetNotification { event, enabled })?;
        let mut state = self.lock();
        if enabled {
            state.notifications.insert(event);
        } else {
            state.notifications.remove(&event);
        }
        Ok(())
    }

    fn thread_local_storage(&self, thread: ThreadHandle) -> Result<*mut c_void, HostError> {
        self.record(HostCall::ThreadLocalStorage)?;
        let address = self
            .lock()
            .tls
            .get(&(thread.as_ptr() as usize))
            .copied()
            .unwrap_or(0);
        Ok(address as *mut c_void)
    }

    fn dispose(&self) -> Result<(), HostError> {
        self.record(HostCall::Dispose)?;
        self.lock().disposed = true;
        Ok(())
    }
}
