//! Correlation slots read by the external profiler.
//!
//! Two well-known symbols hold addresses of externally readable buffers:
//! one thread-local, one process-wide. The profiler resolves them by name and
//! reads them out of process, so both live at fixed, exported locations:
//!
//! - the thread-local slot is a `__thread` variable in `csrc/correlation_tls.c`,
//!   built into its own shared library `libprofcorr_tls` (stable Rust cannot
//!   export a thread-local);
//! - the process slot is the `#[no_mangle]` [`AtomicPtr`] below, which has the
//!   same in-memory representation as a plain pointer.
//!
//! Writers never lock. A thread slot only has one writer (its own thread, or
//! the runtime calling the mount/unmount handlers on that thread). The process
//! slot is last-writer-wins and readers tolerate torn transitions.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{AgentError, Result};

/// Layout generation encoded in the exported symbol names.
pub const CORRELATION_FORMAT_VERSION: u32 = 1;
pub const THREAD_SLOT_SYMBOL: &str = "elastic_apm_profiling_correlation_tls_v1";
pub const PROCESS_SLOT_SYMBOL: &str = "elastic_apm_profiling_correlation_process_storage_v1";

#[allow(non_upper_case_globals)]
#[unsafe(no_mangle)]
pub static elastic_apm_profiling_correlation_process_storage_v1: AtomicPtr<c_void> =
    AtomicPtr::new(ptr::null_mut());

unsafe extern "C" {
    fn profcorr_tls_set(address: *mut c_void);
    fn profcorr_tls_get() -> *mut c_void;
}

fn raw(address: Option<NonNull<c_void>>) -> *mut c_void {
    address.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Stores `address` in the calling thread's slot.
///
/// The address is not validated; it must stay readable for as long as it is
/// published.
pub fn set_thread_buffer(address: Option<NonNull<c_void>>) {
    // SAFETY: the shim only writes the calling thread's own `__thread` variable.
    unsafe { profcorr_tls_set(raw(address)) }
}

/// Current value of the calling thread's slot.
pub fn thread_buffer() -> Option<NonNull<c_void>> {
    // SAFETY: reads the calling thread's own `__thread` variable.
    NonNull::new(unsafe { profcorr_tls_get() })
}

/// Stores `address` in the process-wide slot, visible to every thread.
pub fn set_process_buffer(address: Option<NonNull<c_void>>) {
    elastic_apm_profiling_correlation_process_storage_v1.store(raw(address), Ordering::Release);
}

pub fn process_buffer() -> Option<NonNull<c_void>> {
    NonNull::new(elastic_apm_profiling_correlation_process_storage_v1.load(Ordering::Acquire))
}

/// A view of whatever a slot currently points at.
///
/// Only meant for verifying, in-process, that the stored address is the one
/// that was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAlias {
    address: NonNull<c_void>,
    capacity: usize,
}

impl BufferAlias {
    pub fn address(&self) -> *mut c_void {
        self.address.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// # Safety
    ///
    /// The aliased region must be readable for `capacity` bytes and not be
    /// freed or written while the returned slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.address.as_ptr().cast::<u8>(), self.capacity) }
    }
}

pub fn thread_buffer_alias(capacity: usize) -> Option<BufferAlias> {
    thread_buffer().map(|address| BufferAlias { address, capacity })
}

pub fn process_buffer_alias(capacity: usize) -> Option<BufferAlias> {
    process_buffer().map(|address| BufferAlias { address, capacity })
}

/// Owned, zero-initialised region with a stable address.
pub struct CorrelationBuffer {
    bytes: Box<[u8]>,
}

impl CorrelationBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AgentError::invalid_argument(
                "allocate_correlation_buffer",
                "capacity must be greater than zero",
            ));
        }
        Ok(Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn address(&self) -> NonNull<c_void> {
        // Boxed slices of non-zero length never have a null data pointer.
        NonNull::from(&self.bytes[0]).cast()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl std::fmt::Debug for CorrelationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationBuffer")
            .field("address", &self.address())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Thread-owned buffer; unpublishes itself before it is freed at thread exit.
struct ThreadStorage(Option<CorrelationBuffer>);

impl Drop for ThreadStorage {
    fn drop(&mut self) {
        if self.0.take().is_some() {
            set_thread_buffer(None);
        }
    }
}

thread_local! {
    static THREAD_STORAGE: RefCell<ThreadStorage> = const { RefCell::new(ThreadStorage(None)) };
}

static PROCESS_STORAGE: Mutex<Option<CorrelationBuffer>> = Mutex::new(None);

/// Runs `f` on the calling thread's owned buffer.
///
/// Without a buffer, one of `capacity` bytes is allocated and published when
/// `allocate` is set; otherwise `Ok(None)` is returned. An existing buffer of a
/// different capacity is an error.
pub fn with_current_thread_storage<R>(
    allocate: bool,
    capacity: usize,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<Option<R>> {
    const OP: &str = "current_thread_storage";

    THREAD_STORAGE.with(|cell| {
        let mut storage = cell
            .try_borrow_mut()
            .map_err(|_| AgentError::invalid_state(OP, "thread storage is already borrowed"))?;

        if storage.0.is_none() {
            if !allocate {
                return Ok(None);
            }
            let buffer = CorrelationBuffer::new(capacity)?;
            set_thread_buffer(Some(buffer.address()));
            tracing::trace!(capacity, "Allocated thread correlation buffer");
            storage.0 = Some(buffer);
        }

        let Some(buffer) = storage.0.as_mut() else {
            return Ok(None);
        };
        if buffer.capacity() != capacity {
            return Err(AgentError::invalid_argument(
                OP,
                format!(
                    "buffer has been allocated with a different capacity: {}",
                    buffer.capacity()
                ),
            ));
        }
        Ok(Some(f(buffer.as_mut_slice())))
    })
}

/// Clears the calling thread's slot and frees its owned buffer, if any.
pub fn remove_current_thread_storage() {
    THREAD_STORAGE.with(|cell| {
        if let Ok(mut storage) = cell.try_borrow_mut()
            && storage.0.take().is_some()
        {
            set_thread_buffer(None);
        }
    });
}

/// Publishes an owned buffer process-wide, keeping it alive until replaced.
///
/// Returns the previously owned buffer. The new address is visible before the
/// old buffer is handed back.
pub fn set_process_storage(buffer: Option<CorrelationBuffer>) -> Option<CorrelationBuffer> {
    let mut owned = PROCESS_STORAGE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    set_process_buffer(buffer.as_ref().map(CorrelationBuffer::address));
    std::mem::replace(&mut *owned, buffer)
}

/// Runs `f` on the owned process buffer, if one is set.
pub fn with_process_storage<R>(f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
    let mut owned = PROCESS_STORAGE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    owned.as_mut().map(|buffer| f(buffer.as_mut_slice()))
}

/// Clears the process slot and frees the owned process buffer.
pub fn reset() {
    drop(set_process_storage(None));
}
