//! [`Host`] over a C function table.
//!
//! A native runtime adapter fills in a [`ProfcorrHostVTable`] and passes it to
//! `profcorr_init`. Every entry returns the runtime's error code, `0` meaning
//! success. Parameter kinds and types use the runtime interface's numbering.
//!
//! Handlers registered through `set_extension_event_callback` must be invoked
//! as `callback(session, thread)`, passing back the table's `session` value.

use std::ffi::{CStr, c_char, c_void};
use std::ptr;
use std::slice;

use profcorr::host::{
    Capabilities, EventCallback, EventIndex, ExtensionEventInfo, NotificationMode, ParamInfo,
    ParamKind, ParamType,
};
use profcorr::{Host, HostError, HostVersion, SessionHandle, ThreadHandle};

/// Reported when the table leaves an entry empty.
pub const ERROR_NOT_AVAILABLE: i32 = 98;

pub const KIND_IN: i32 = 91;
pub const KIND_IN_PTR: i32 = 92;
pub const KIND_IN_BUF: i32 = 93;
pub const KIND_ALLOC_BUF: i32 = 94;
pub const KIND_OUT: i32 = 96;
pub const KIND_OUT_BUF: i32 = 97;

pub const TYPE_THREAD: i32 = 110;
pub const TYPE_EXECUTION_CONTEXT: i32 = 117;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfcorrEventParam {
    pub name: *const c_char,
    pub kind: i32,
    pub base_type: i32,
    pub null_ok: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfcorrExtensionEvent {
    pub index: i32,
    pub id: *const c_char,
    pub short_description: *const c_char,
    pub param_count: i32,
    pub params: *const ProfcorrEventParam,
}

pub type GetVersionFn = unsafe extern "C" fn(ctx: *mut c_void, version: *mut u32) -> i32;
pub type GetPotentialCapabilitiesFn =
    unsafe extern "C" fn(ctx: *mut c_void, virtual_threads: *mut bool) -> i32;
pub type AddCapabilitiesFn = unsafe extern "C" fn(ctx: *mut c_void, virtual_threads: bool) -> i32;
pub type GetExtensionEventsFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    count: *mut i32,
    events: *mut *const ProfcorrExtensionEvent,
) -> i32;
pub type ReleaseExtensionEventsFn =
    unsafe extern "C" fn(ctx: *mut c_void, count: i32, events: *const ProfcorrExtensionEvent);
pub type SetExtensionEventCallbackFn =
    unsafe extern "C" fn(ctx: *mut c_void, event: i32, callback: Option<EventCallback>) -> i32;
pub type SetEventNotificationFn =
    unsafe extern "C" fn(ctx: *mut c_void, enable: bool, event: i32) -> i32;
pub type GetThreadLocalStorageFn =
    unsafe extern "C" fn(ctx: *mut c_void, thread: *mut c_void, storage: *mut *mut c_void) -> i32;
pub type DisposeFn = unsafe extern "C" fn(ctx: *mut c_void) -> i32;

/// Introspection session supplied by the runtime adapter.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfcorrHostVTable {
    pub ctx: *mut c_void,
    pub session: u64,
    pub get_version: Option<GetVersionFn>,
    pub get_potential_capabilities: Option<GetPotentialCapabilitiesFn>,
    pub add_capabilities: Option<AddCapabilitiesFn>,
    pub get_extension_events: Option<GetExtensionEventsFn>,
    /// Optional; called once the catalogue has been copied.
    pub release_extension_events: Option<ReleaseExtensionEventsFn>,
    pub set_extension_event_callback: Option<SetExtensionEventCallbackFn>,
    pub set_event_notification: Option<SetEventNotificationFn>,
    pub get_thread_local_storage: Option<GetThreadLocalStorageFn>,
    pub dispose: Option<DisposeFn>,
}

pub struct VTableHost {
    vtable: ProfcorrHostVTable,
}

// SAFETY: `profcorr_init` requires the table and its context to be usable from
// any thread until `dispose` returns; the table itself is immutable.
unsafe impl Send for VTableHost {}
unsafe impl Sync for VTableHost {}

impl VTableHost {
    pub fn new(vtable: ProfcorrHostVTable) -> Self {
        Self { vtable }
    }
}

fn require<F>(entry: Option<F>) -> Result<F, HostError> {
    entry.ok_or(HostError::new(ERROR_NOT_AVAILABLE))
}

fn check(code: i32) -> Result<(), HostError> {
    if code == 0 {
        Ok(())
    } else {
        Err(HostError::new(code))
    }
}

/// # Safety
/// `ptr` is null or a NUL-terminated string.
unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: guaranteed by the caller.
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

fn param_kind(raw: i32) -> Option<ParamKind> {
    Some(match raw {
        KIND_IN => ParamKind::In,
        KIND_IN_PTR => ParamKind::InPtr,
        KIND_IN_BUF => ParamKind::InBuf,
        KIND_ALLOC_BUF => ParamKind::AllocBuf,
        KIND_OUT => ParamKind::Out,
        KIND_OUT_BUF => ParamKind::OutBuf,
        _ => return None,
    })
}

fn param_type(raw: i32) -> ParamType {
    match raw {
        TYPE_THREAD => ParamType::Thread,
        TYPE_EXECUTION_CONTEXT => ParamType::ExecutionContext,
        _ => ParamType::Other,
    }
}

/// # Safety
/// The event's strings and parameter array must be valid for reads.
unsafe fn convert_event(raw: &ProfcorrExtensionEvent) -> Option<ExtensionEventInfo> {
    // SAFETY: guaranteed by the caller.
    let id = unsafe { c_string(raw.id) };
    let raw_params = match usize::try_from(raw.param_count) {
        Ok(count) if count > 0 && !raw.params.is_null() => {
            // SAFETY: guaranteed by the caller.
            unsafe { slice::from_raw_parts(raw.params, count) }
        }
        _ => &[],
    };

    let mut params = Vec::with_capacity(raw_params.len());
    for param in raw_params {
        let Some(kind) = param_kind(param.kind) else {
            tracing::trace!(event = %id, kind = param.kind, "Skipping event with unknown parameter kind");
            return None;
        };
        params.push(ParamInfo::new(
            // SAFETY: guaranteed by the caller.
            unsafe { c_string(param.name) },
            kind,
            param_type(param.base_type),
            param.null_ok,
        ));
    }

    Some(ExtensionEventInfo {
        index: EventIndex(raw.index),
        id,
        // SAFETY: guaranteed by the caller.
        short_description: unsafe { c_string(raw.short_description) },
        params,
    })
}

impl Host for VTableHost {
    fn session_handle(&self) -> SessionHandle {
        SessionHandle(self.vtable.session)
    }

    fn version(&self) -> Result<HostVersion, HostError> {
        let get_version = require(self.vtable.get_version)?;
        let mut raw = 0u32;
        // SAFETY: entries accept the table's context; `raw` outlives the call.
        check(unsafe { get_version(self.vtable.ctx, &mut raw) })?;
        Ok(HostVersion::from_raw(raw))
    }

    fn potential_capabilities(&self) -> Result<Capabilities, HostError> {
        let get = require(self.vtable.get_potential_capabilities)?;
        let mut virtual_threads = false;
        // SAFETY: as above.
        check(unsafe { get(self.vtable.ctx, &mut virtual_threads) })?;
        Ok(Capabilities {
            support_virtual_threads: virtual_threads,
        })
    }

    fn add_capabilities(&self, capabilities: Capabilities) -> Result<(), HostError> {
        let add = require(self.vtable.add_capabilities)?;
        // SAFETY: as above.
        check(unsafe { add(self.vtable.ctx, capabilities.support_virtual_threads) })
    }

    fn extension_events(&self) -> Result<Vec<ExtensionEventInfo>, HostError> {
        let get = require(self.vtable.get_extension_events)?;
        let mut count = 0i32;
        let mut events: *const ProfcorrExtensionEvent = ptr::null();
        // SAFETY: as above.
        check(unsafe { get(self.vtable.ctx, &mut count, &mut events) })?;

        let catalogue = match usize::try_from(count) {
            Ok(len) if len > 0 && !events.is_null() => {
                // SAFETY: the adapter returned `count` events at `events`,
                // valid until released below.
                let raw = unsafe { slice::from_raw_parts(events, len) };
                raw.iter()
                    // SAFETY: same allocation as above.
                    .filter_map(|event| unsafe { convert_event(event) })
                    .collect()
            }
            _ => Vec::new(),
        };

        if let Some(release) = self.vtable.release_extension_events {
            // SAFETY: hands back exactly what the adapter returned.
            unsafe { release(self.vtable.ctx, count, events) };
        }
        Ok(catalogue)
    }

    fn set_extension_event_callback(
        &self,
        event: EventIndex,
        callback: Option<EventCallback>,
    ) -> Result<(), HostError> {
        let set = require(self.vtable.set_extension_event_callback)?;
        // SAFETY: as above.
        check(unsafe { set(self.vtable.ctx, event.0, callback) })
    }

    fn set_event_notification(
        &self,
        mode: NotificationMode,
        event: EventIndex,
    ) -> Result<(), HostError> {
        let set = require(self.vtable.set_event_notification)?;
        let enable = mode == NotificationMode::Enable;
        // SAFETY: as above.
        check(unsafe { set(self.vtable.ctx, enable, event.0) })
    }

    fn thread_local_storage(&self, thread: ThreadHandle) -> Result<*mut c_void, HostError> {
        let get = require(self.vtable.get_thread_local_storage)?;
        let mut storage = ptr::null_mut();
        // SAFETY: as above; `thread` was handed to us by the runtime.
        check(unsafe { get(self.vtable.ctx, thread.as_ptr(), &mut storage) })?;
        Ok(storage)
    }

    fn dispose(&self) -> Result<(), HostError> {
        let dispose = require(self.vtable.dispose)?;
        // SAFETY: as above; no entry is called afterwards.
        check(unsafe { dispose(self.vtable.ctx) })
    }
}
