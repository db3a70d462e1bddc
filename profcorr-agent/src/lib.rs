//! C entry points of the profiler correlation agent.
//!
//! Every function returns `0` on success, `-1` on error and `-2` when the
//! agent has not been initialized. Functions producing a length or byte count
//! return it instead of `0`. Errors are logged here; callers only see the code.

mod host_vtable;

use std::ffi::{CStr, c_char, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;

#[cfg(unix)]
use std::ffi::OsStr;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

use profcorr::{AgentConfig, AgentError, AgentStatus, LogConfig, LogFormat, ReturnCode, agent};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use host_vtable::{ProfcorrEventParam, ProfcorrExtensionEvent, ProfcorrHostVTable, VTableHost};

/// Build metadata recorded by build.rs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub git_sha: &'static str,
    pub rustc: &'static str,
}

pub const BUILD_INFO: BuildInfo = BuildInfo {
    git_sha: env!("PROFCORR_GIT_SHA"),
    rustc: env!("PROFCORR_RUSTC_VERSION"),
};

#[derive(serde::Serialize)]
struct StatusPayload {
    #[serde(flatten)]
    status: AgentStatus,
    build: BuildInfo,
}

/// Installs the stderr subscriber unless the process already has one.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_new(log.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new("profcorr=info,profcorr_agent=info"));

    match log.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr));
            let _ = subscriber.try_init();
        }
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr));
            let _ = subscriber.try_init();
        }
    }
}

fn report(op: &str, error: &AgentError) {
    match error {
        AgentError::NotInitialized => tracing::debug!(op, "Agent not initialized"),
        _ => tracing::error!(op, error = %error, os_code = ?error.os_code(), "Agent call failed"),
    }
}

fn code<T>(op: &str, result: profcorr::Result<T>) -> i32 {
    let code = ReturnCode::from(&result);
    if let Err(e) = &result {
        report(op, e);
    }
    code.as_i32()
}

/// A length as the non-negative return value, or the error's code. A length
/// that does not fit is an error too.
fn count(op: &'static str, result: profcorr::Result<usize>) -> i32 {
    let result = result.and_then(|n| {
        i32::try_from(n).map_err(|_| {
            AgentError::invalid_state(op, format!("length {n} does not fit the return value"))
        })
    });
    match result {
        Ok(n) => n,
        Err(e) => {
            report(op, &e);
            e.return_code().as_i32()
        }
    }
}

/// Copies `text` into `buf` snprintf-style: truncated and NUL-terminated when
/// `capacity` is non-zero. Returns the full length of `text`.
///
/// # Safety
/// `buf` is null or valid for `capacity` bytes of writes.
unsafe fn copy_out(text: &str, buf: *mut c_char, capacity: usize) -> usize {
    let bytes = text.as_bytes();
    if !buf.is_null() && capacity > 0 {
        let n = bytes.len().min(capacity - 1);
        // SAFETY: `n + 1 <= capacity` bytes are writable per the caller.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), n);
            *buf.add(n) = 0;
        }
    }
    bytes.len()
}

/// Starts the agent on the runtime session described by `vtable`.
///
/// Configuration and logging come from the environment. The table is copied;
/// its context must stay valid until `profcorr_destroy` returns.
///
/// # Safety
/// `vtable` is null or points to an initialized table.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_init(vtable: *const ProfcorrHostVTable) -> i32 {
    let config = AgentConfig::from_env();
    init_tracing(&config.log);

    // SAFETY: guaranteed by the caller.
    let Some(vtable) = (unsafe { vtable.as_ref() }) else {
        return code::<()>(
            "init",
            Err(AgentError::invalid_argument("init", "host vtable is null")),
        );
    };
    tracing::info!(
        version = profcorr::PROFCORR_VERSION,
        git_sha = BUILD_INFO.git_sha,
        "profcorr agent starting"
    );
    code("init", agent::init(Arc::new(VTableHost::new(*vtable)), config))
}

#[unsafe(no_mangle)]
pub extern "C" fn profcorr_destroy() -> i32 {
    code("destroy", agent::destroy())
}

#[unsafe(no_mangle)]
pub extern "C" fn profcorr_set_virtual_thread_support_enabled(enabled: bool) -> i32 {
    code(
        "set_virtual_thread_support_enabled",
        agent::set_virtual_thread_support_enabled(enabled),
    )
}

/// Writes why virtual threads are unsupported into `buf`.
///
/// Returns the reason's length, `0` meaning fully supported.
///
/// # Safety
/// `buf` is null or valid for `capacity` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_virtual_threads_unsupported_reason(
    buf: *mut c_char,
    capacity: usize,
) -> i32 {
    let result = agent::virtual_threads_unsupported_reason().map(|reason| {
        // SAFETY: guaranteed by the caller.
        unsafe { copy_out(reason.as_deref().unwrap_or_default(), buf, capacity) }
    });
    count("virtual_threads_unsupported_reason", result)
}

/// Publishes `address` in the calling thread's correlation slot; null clears it.
#[unsafe(no_mangle)]
pub extern "C" fn profcorr_set_thread_buffer(address: *mut c_void) -> i32 {
    code("set_thread_buffer", agent::set_thread_buffer(NonNull::new(address)))
}

/// Publishes `address` in the process-wide correlation slot; null clears it.
#[unsafe(no_mangle)]
pub extern "C" fn profcorr_set_process_buffer(address: *mut c_void) -> i32 {
    code("set_process_buffer", agent::set_process_buffer(NonNull::new(address)))
}

/// Stores the address currently in the calling thread's slot into `out`, or
/// null if none is set. For in-process verification only.
///
/// # Safety
/// `out` is null or valid for one pointer write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_thread_buffer_alias(capacity: usize, out: *mut *mut c_void) -> i32 {
    let alias = profcorr::storage::thread_buffer_alias(capacity);
    // SAFETY: guaranteed by the caller.
    unsafe { store_alias("thread_buffer_alias", alias.map(|a| a.address()), out) }
}

/// Process-wide counterpart of [`profcorr_thread_buffer_alias`].
///
/// # Safety
/// `out` is null or valid for one pointer write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_process_buffer_alias(
    capacity: usize,
    out: *mut *mut c_void,
) -> i32 {
    let alias = profcorr::storage::process_buffer_alias(capacity);
    // SAFETY: guaranteed by the caller.
    unsafe { store_alias("process_buffer_alias", alias.map(|a| a.address()), out) }
}

/// # Safety
/// `out` is null or valid for one pointer write.
unsafe fn store_alias(op: &'static str, address: Option<*mut c_void>, out: *mut *mut c_void) -> i32 {
    if out.is_null() {
        return code::<()>(op, Err(AgentError::invalid_argument(op, "out pointer is null")));
    }
    // SAFETY: non-null and writable per the caller.
    unsafe { *out = address.unwrap_or(ptr::null_mut()) };
    ReturnCode::Success.as_i32()
}

/// Binds the control socket to the NUL-terminated `path`.
///
/// # Safety
/// `path` is null or a NUL-terminated string.
#[cfg(unix)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_socket_open(path: *const c_char) -> i32 {
    if path.is_null() {
        return code::<()>(
            "socket_open",
            Err(AgentError::invalid_argument("open", "the provided path is null")),
        );
    }
    // SAFETY: non-null and NUL-terminated per the caller.
    let path = OsStr::from_bytes(unsafe { CStr::from_ptr(path) }.to_bytes());
    code("socket_open", agent::socket_open(path))
}

#[cfg(unix)]
#[unsafe(no_mangle)]
pub extern "C" fn profcorr_socket_close() -> i32 {
    code("socket_close", agent::socket_close())
}

/// Receives at most one pending message into `buf`.
///
/// Returns the number of bytes received, `0` when nothing is pending.
///
/// # Safety
/// `buf` is null or valid for `capacity` bytes of writes.
#[cfg(unix)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_socket_read(buf: *mut u8, capacity: usize) -> i32 {
    if buf.is_null() {
        return code::<()>(
            "socket_read",
            Err(AgentError::invalid_argument("read", "the provided buffer is null")),
        );
    }
    // SAFETY: non-null and writable for `capacity` bytes per the caller.
    let buf = unsafe { std::slice::from_raw_parts_mut(buf, capacity) };
    count("socket_read", agent::socket_read(buf))
}

/// Sends `len` bytes at `message` as one datagram.
///
/// # Safety
/// `message` is valid for `len` bytes of reads; it may be null only when
/// `len` is zero.
#[cfg(unix)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_socket_write(message: *const u8, len: usize) -> i32 {
    let message: &[u8] = if len == 0 {
        &[]
    } else if message.is_null() {
        return code::<()>(
            "socket_write",
            Err(AgentError::invalid_argument("write", "the provided message is null")),
        );
    } else {
        // SAFETY: readable for `len` bytes per the caller.
        unsafe { std::slice::from_raw_parts(message, len) }
    };
    code("socket_write", agent::socket_write(message))
}

/// Writes the agent status as JSON into `buf`; returns the full JSON length.
///
/// Available in every agent state.
///
/// # Safety
/// `buf` is null or valid for `capacity` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn profcorr_status_json(buf: *mut c_char, capacity: usize) -> i32 {
    let result = agent::status().and_then(|status| {
        let payload = StatusPayload {
            status,
            build: BUILD_INFO,
        };
        serde_json::to_string(&payload)
            .map_err(|e| AgentError::invalid_state("status_json", e.to_string()))
    });
    let result = result.map(|json| {
        // SAFETY: guaranteed by the caller.
        unsafe { copy_out(&json, buf, capacity) }
    });
    count("status_json", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use profcorr::host::fake::FakeHost;
    use profcorr::host::HostVersion;
    use std::ffi::CString;
    use std::sync::{Mutex, MutexGuard};

    use crate::host_vtable::tests::TestRuntime;

    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        let guard = SERIAL.lock().unwrap_or_else(|p| p.into_inner());
        let _ = agent::destroy();
        guard
    }

    const NOT_INITIALIZED: i32 = -2;

    #[test]
    fn length_beyond_i32_is_an_error() {
        assert_eq!(count("status_json", Ok(5)), 5);
        assert_eq!(count("status_json", Ok(i32::MAX as usize)), i32::MAX);
        assert_eq!(count("status_json", Ok(usize::MAX)), -1);
        assert_eq!(count("status_json", Err(AgentError::NotInitialized)), NOT_INITIALIZED);
    }

    #[test]
    fn entry_points_before_init() {
        let _guard = serial();

        assert_eq!(profcorr_set_virtual_thread_support_enabled(true), NOT_INITIALIZED);
        assert_eq!(profcorr_set_thread_buffer(ptr::null_mut()), NOT_INITIALIZED);
        assert_eq!(profcorr_set_process_buffer(ptr::null_mut()), NOT_INITIALIZED);
        assert_eq!(profcorr_socket_close(), NOT_INITIALIZED);
        let path = CString::new("/tmp/profcorr-uninit.sock").unwrap();
        assert_eq!(unsafe { profcorr_socket_open(path.as_ptr()) }, NOT_INITIALIZED);
        let mut buf = [0u8; 8];
        assert_eq!(
            unsafe { profcorr_socket_read(buf.as_mut_ptr(), buf.len()) },
            NOT_INITIALIZED
        );
        assert_eq!(unsafe { profcorr_socket_write(b"x".as_ptr(), 1) }, NOT_INITIALIZED);
        assert_eq!(
            unsafe { profcorr_virtual_threads_unsupported_reason(ptr::null_mut(), 0) },
            NOT_INITIALIZED
        );
        assert_eq!(profcorr_destroy(), 0);
    }

    #[test]
    fn init_rejects_null_vtable() {
        let _guard = serial();
        assert_eq!(unsafe { profcorr_init(ptr::null()) }, -1);
        assert!(!agent::is_initialized());
    }

    #[test]
    fn init_through_vtable_enables_and_tears_down() {
        let _guard = serial();
        let rt = TestRuntime::new(HostVersion::new(21, 0, 0).raw(), true);
        let vtable = rt.vtable();

        assert_eq!(unsafe { profcorr_init(&vtable) }, 0);
        assert_eq!(unsafe { profcorr_init(&vtable) }, -1);
        assert_eq!(
            unsafe { profcorr_virtual_threads_unsupported_reason(ptr::null_mut(), 0) },
            0
        );

        assert_eq!(profcorr_set_virtual_thread_support_enabled(true), 0);
        assert_eq!(rt.callbacks.lock().unwrap().len(), 2);
        assert_eq!(*rt.notifications.lock().unwrap(), vec![(10, true), (11, true)]);

        assert_eq!(profcorr_destroy(), 0);
        assert!(*rt.disposed.lock().unwrap());
        assert_eq!(
            *rt.notifications.lock().unwrap(),
            vec![(10, true), (11, true), (10, false), (11, false)]
        );
    }

    #[test]
    fn unsupported_reason_is_copied_with_truncation() {
        let _guard = serial();
        let rt = TestRuntime::new(HostVersion::new(17, 0, 0).raw(), true);
        let vtable = rt.vtable();
        assert_eq!(unsafe { profcorr_init(&vtable) }, 0);

        let len = unsafe { profcorr_virtual_threads_unsupported_reason(ptr::null_mut(), 0) };
        assert!(len > 0);

        let mut full = vec![0 as c_char; len as usize + 1];
        assert_eq!(
            unsafe { profcorr_virtual_threads_unsupported_reason(full.as_mut_ptr(), full.len()) },
            len
        );
        let reason = unsafe { CStr::from_ptr(full.as_ptr()) }.to_str().unwrap();
        assert!(reason.contains("version"));
        assert_eq!(reason.len(), len as usize);

        let mut short = [0x7f as c_char; 8];
        unsafe { profcorr_virtual_threads_unsupported_reason(short.as_mut_ptr(), short.len()) };
        assert_eq!(short[7], 0);
        assert_eq!(unsafe { CStr::from_ptr(short.as_ptr()) }.to_bytes().len(), 7);

        assert_eq!(profcorr_set_virtual_thread_support_enabled(true), -1);
        assert_eq!(profcorr_destroy(), 0);
    }

    #[test]
    fn buffers_and_aliases() {
        let _guard = serial();
        agent::init(Arc::new(FakeHost::new()), AgentConfig::new()).unwrap();

        let mut thread_backing = [0u8; 16];
        let mut process_backing = [0u8; 16];
        let thread_addr = thread_backing.as_mut_ptr().cast::<c_void>();
        let process_addr = process_backing.as_mut_ptr().cast::<c_void>();

        assert_eq!(profcorr_set_thread_buffer(thread_addr), 0);
        assert_eq!(profcorr_set_process_buffer(process_addr), 0);

        let mut out = ptr::null_mut();
        assert_eq!(unsafe { profcorr_thread_buffer_alias(16, &mut out) }, 0);
        assert_eq!(out, thread_addr);
        assert_eq!(unsafe { profcorr_process_buffer_alias(16, &mut out) }, 0);
        assert_eq!(out, process_addr);
        assert_eq!(unsafe { profcorr_process_buffer_alias(16, ptr::null_mut()) }, -1);

        assert_eq!(profcorr_set_thread_buffer(ptr::null_mut()), 0);
        assert_eq!(unsafe { profcorr_thread_buffer_alias(16, &mut out) }, 0);
        assert!(out.is_null());

        assert_eq!(profcorr_destroy(), 0);
        assert_eq!(unsafe { profcorr_process_buffer_alias(16, &mut out) }, 0);
        assert!(out.is_null());
    }

    #[test]
    fn socket_ping_roundtrip() {
        let _guard = serial();
        agent::init(Arc::new(FakeHost::new()), AgentConfig::new()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let c_path = CString::new(path.to_str().unwrap()).unwrap();

        assert_eq!(unsafe { profcorr_socket_open(ptr::null()) }, -1);
        assert_eq!(unsafe { profcorr_socket_open(c_path.as_ptr()) }, 0);
        assert_eq!(unsafe { profcorr_socket_open(c_path.as_ptr()) }, -1);

        let mut buf = [0u8; 64];
        assert_eq!(unsafe { profcorr_socket_read(buf.as_mut_ptr(), buf.len()) }, 0);
        assert_eq!(unsafe { profcorr_socket_read(ptr::null_mut(), 4) }, -1);

        assert_eq!(unsafe { profcorr_socket_write(b"PING".as_ptr(), 4) }, 0);
        assert_eq!(unsafe { profcorr_socket_read(buf.as_mut_ptr(), buf.len()) }, 4);
        assert_eq!(&buf[..4], b"PING");

        assert_eq!(profcorr_socket_close(), 0);
        assert!(!path.exists());
        assert_eq!(profcorr_socket_close(), -1);

        assert_eq!(profcorr_destroy(), 0);
    }

    #[test]
    fn status_json_includes_build_info() {
        let _guard = serial();

        let len = unsafe { profcorr_status_json(ptr::null_mut(), 0) };
        assert!(len > 0);
        let mut buf = vec![0 as c_char; len as usize + 1];
        assert_eq!(unsafe { profcorr_status_json(buf.as_mut_ptr(), buf.len()) }, len);

        let json = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["state"], "UNINITIALIZED");
        assert_eq!(value["version"], profcorr::PROFCORR_VERSION);
        assert_eq!(value["build"]["git_sha"], BUILD_INFO.git_sha);
    }
}
