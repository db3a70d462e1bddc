//! Process-wide agent.
//!
//! Holds the introspection session, the virtual thread bridge and the single
//! control socket. Every entry point other than [`init`], [`destroy`] and
//! [`status`] fails with [`AgentError::NotInitialized`] until [`init`] has
//! succeeded.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(unix)]
use std::path::Path;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::host::Host;
#[cfg(unix)]
use crate::socket::ControlSocket;
use crate::status::{AgentState, AgentStatus};
use crate::storage;
use crate::vthread::ThreadLifecycleBridge;

struct Session {
    bridge: ThreadLifecycleBridge,
    #[cfg(unix)]
    socket: ControlSocket,
}

enum Slot {
    Uninitialized,
    Initialized(Session),
    DestroyFailed,
}

static AGENT: Mutex<Slot> = Mutex::new(Slot::Uninitialized);

/// Fast-path flag for the thread buffer setter, which never touches the session.
static ACTIVE: AtomicBool = AtomicBool::new(false);

fn lock(op: &'static str) -> Result<MutexGuard<'static, Slot>> {
    AGENT
        .lock()
        .map_err(|_| AgentError::invalid_state(op, "agent state lock is poisoned"))
}

fn with_session<R>(op: &'static str, f: impl FnOnce(&mut Session) -> Result<R>) -> Result<R> {
    let mut agent = lock(op)?;
    match &mut *agent {
        Slot::Initialized(session) => f(session),
        Slot::Uninitialized | Slot::DestroyFailed => Err(AgentError::NotInitialized),
    }
}

fn ensure_active() -> Result<()> {
    if ACTIVE.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(AgentError::NotInitialized)
    }
}

/// Starts the agent on `host`.
///
/// Runs virtual thread discovery and, when `config.virtual_threads` is set
/// and the runtime supports it, enables bridging. Failing to enable bridging
/// is logged, not fatal. If discovery itself fails the session is disposed.
pub fn init(host: Arc<dyn Host>, config: AgentConfig) -> Result<()> {
    let mut agent = lock("init")?;
    if let Slot::Initialized(_) = *agent {
        return Err(AgentError::invalid_state(
            "init",
            "agent is already initialized",
        ));
    }

    let mut bridge = match ThreadLifecycleBridge::initialize(Arc::clone(&host)) {
        Ok(bridge) => bridge,
        Err(e) => {
            if let Err(dispose) = host.dispose() {
                tracing::warn!(error = %dispose, "Failed to dispose session after failed init");
            }
            return Err(e);
        }
    };

    if config.virtual_threads {
        match bridge.unsupported_reason() {
            Some(reason) => {
                tracing::warn!(reason = %reason, "Virtual thread bridging requested but unsupported");
            }
            None => {
                if let Err(e) = bridge.set_callbacks_enabled(true) {
                    tracing::warn!(error = %e, "Failed to enable virtual thread bridging");
                }
            }
        }
    }

    tracing::info!(
        version = crate::PROFCORR_VERSION,
        session = host.session_handle().0,
        virtual_threads_supported = bridge.is_supported(),
        virtual_threads_enabled = bridge.callbacks_enabled(),
        "Profiler correlation agent initialized"
    );

    *agent = Slot::Initialized(Session {
        bridge,
        #[cfg(unix)]
        socket: ControlSocket::new(),
    });
    ACTIVE.store(true, Ordering::Release);
    Ok(())
}

/// Tears everything down: socket, bridge and session, process slot.
///
/// A no-op when not initialized. On failure the agent is left in
/// [`AgentState::DestroyFailed`]; every step is still attempted.
pub fn destroy() -> Result<()> {
    let mut agent = lock("destroy")?;
    let session = match std::mem::replace(&mut *agent, Slot::Uninitialized) {
        Slot::Initialized(session) => session,
        other => {
            *agent = other;
            return Ok(());
        }
    };
    ACTIVE.store(false, Ordering::Release);

    #[cfg(unix)]
    session.socket.destroy();
    let result = session.bridge.destroy();
    storage::reset();

    match result {
        Ok(()) => {
            tracing::info!("Profiler correlation agent destroyed");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Profiler correlation agent teardown failed");
            *agent = Slot::DestroyFailed;
            Err(e)
        }
    }
}

pub fn state() -> AgentState {
    match AGENT.lock() {
        Ok(agent) => match *agent {
            Slot::Uninitialized => AgentState::Uninitialized,
            Slot::Initialized(_) => AgentState::Initialized,
            Slot::DestroyFailed => AgentState::DestroyFailed,
        },
        Err(_) => AgentState::DestroyFailed,
    }
}

pub fn is_initialized() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

pub fn set_virtual_thread_support_enabled(enabled: bool) -> Result<()> {
    with_session("set_virtual_thread_support_enabled", |session| {
        session.bridge.set_callbacks_enabled(enabled)
    })
}

/// `None` when virtual threads are fully supported.
pub fn virtual_threads_unsupported_reason() -> Result<Option<String>> {
    with_session("virtual_threads_unsupported_reason", |session| {
        Ok(session.bridge.unsupported_reason().map(str::to_string))
    })
}

pub fn set_thread_buffer(address: Option<NonNull<c_void>>) -> Result<()> {
    ensure_active()?;
    storage::set_thread_buffer(address);
    Ok(())
}

/// Publishes the process-wide buffer.
///
/// Stored under the agent lock so a concurrent [`destroy`] cannot be followed
/// by a stale address reappearing in the slot it just reset.
pub fn set_process_buffer(address: Option<NonNull<c_void>>) -> Result<()> {
    with_session("set_process_buffer", |_| {
        storage::set_process_buffer(address);
        Ok(())
    })
}

#[cfg(unix)]
pub fn socket_open(path: impl AsRef<Path>) -> Result<()> {
    with_session("socket_open", |session| session.socket.open(path))
}

#[cfg(unix)]
pub fn socket_close() -> Result<()> {
    with_session("socket_close", |session| session.socket.close())
}

#[cfg(unix)]
pub fn socket_read(buf: &mut [u8]) -> Result<usize> {
    with_session("socket_read", |session| session.socket.read(buf))
}

#[cfg(unix)]
pub fn socket_write(message: &[u8]) -> Result<()> {
    with_session("socket_write", |session| session.socket.write(message))
}

/// Snapshot of the agent, available in every state.
pub fn status() -> Result<AgentStatus> {
    let agent = lock("status")?;
    let status = match &*agent {
        Slot::Uninitialized => AgentStatus::new(AgentState::Uninitialized),
        Slot::DestroyFailed => AgentStatus::new(AgentState::DestroyFailed),
        Slot::Initialized(session) => {
            let status = AgentStatus::new(AgentState::Initialized)
                .with_virtual_threads(session.bridge.status());
            #[cfg(unix)]
            let status = status.with_socket_path(session.socket.bound_path());
            status
        }
    };
    Ok(status.with_process_buffer_set(storage::process_buffer().is_some()))
}
