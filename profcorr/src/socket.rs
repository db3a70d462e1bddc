//! Control socket for out-of-band messages with an attached profiler.
//!
//! A connectionless Unix datagram socket bound to a filesystem path. The
//! profiler sends short messages to that path; the process drains them with
//! non-blocking reads. Every datagram is one message, no framing is added.
//!
//! All operations serialise on one mutex, so a concurrent caller never sees a
//! descriptor that is created but not yet bound.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr, bind, recv, sendto, socket,
};

use crate::error::{AgentError, Result};

/// Longest path that fits into `sockaddr_un` with its terminating NUL.
pub fn max_path_len() -> usize {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len() - 1
}

/// Bound descriptor and its path. The path is unlinked exactly once, when the
/// state is dropped.
struct SocketState {
    fd: OwnedFd,
    path: PathBuf,
}

impl SocketState {
    fn open(path: &Path) -> Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .map_err(|e| AgentError::os("open", "could not create datagram socket", e))?;

        // From here on `fd` is closed on every early return.
        let flags = fcntl(&fd, FcntlArg::F_GETFL)
            .map_err(|e| AgentError::os("open", "could not read socket flags", e))?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(&fd, FcntlArg::F_SETFL(flags))
            .map_err(|e| AgentError::os("open", "could not make socket non-blocking", e))?;

        let addr = UnixAddr::new(path).map_err(|e| {
            AgentError::os("open", format!("invalid socket path '{}'", path.display()), e)
        })?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| {
            AgentError::os(
                "open",
                format!("could not bind socket to '{}'", path.display()),
                e,
            )
        })?;

        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SocketState {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove control socket file");
        }
    }
}

/// Datagram endpoint for messages from the profiler.
#[derive(Default)]
pub struct ControlSocket {
    state: Mutex<Option<SocketState>>,
}

impl ControlSocket {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<SocketState>> {
        // State is only ever replaced wholesale, so a poisoned lock still
        // guards a consistent value.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the socket and binds it to `path`.
    ///
    /// Fails if already open, if `path` is empty or longer than
    /// [`max_path_len`], or if any system call fails. Nothing is left behind on
    /// failure.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.lock();

        if let Some(existing) = state.as_ref() {
            return Err(AgentError::invalid_state(
                "open",
                format!(
                    "control socket already opened at '{}'",
                    existing.path.display()
                ),
            ));
        }

        let len = path.as_os_str().len();
        if len == 0 {
            return Err(AgentError::invalid_argument("open", "the provided path is empty"));
        }
        let max = max_path_len();
        if len > max {
            return Err(AgentError::invalid_argument(
                "open",
                format!(
                    "the provided path '{}' is too long, max allowed length is {max}",
                    path.display()
                ),
            ));
        }

        let opened = SocketState::open(path)?;
        tracing::debug!(path = %path.display(), fd = opened.fd.as_raw_fd(), "Opened control socket");
        *state = Some(opened);
        Ok(())
    }

    /// Closes the socket and removes its file. Fails if not open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        match state.take() {
            Some(closed) => {
                tracing::debug!(path = %closed.path.display(), "Closing control socket");
                drop(closed);
                Ok(())
            }
            None => Err(AgentError::invalid_state(
                "close",
                "control socket has not been opened",
            )),
        }
    }

    /// Teardown variant of [`close`](Self::close): succeeds when not open.
    pub fn destroy(&self) {
        if let Some(closed) = self.lock().take() {
            tracing::debug!(path = %closed.path.display(), "Destroying control socket");
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub fn bound_path(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|s| s.path.clone())
    }

    /// Receives at most one pending message into `buf`.
    ///
    /// Returns the number of bytes received, or 0 when nothing is pending.
    /// Messages longer than `buf` are truncated.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let state = self.lock();
        let Some(state) = state.as_ref() else {
            return Err(AgentError::invalid_state(
                "read",
                "control socket has not been opened",
            ));
        };

        match recv(state.fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(n) => Ok(n),
            Err(e) if e == Errno::EAGAIN || e == Errno::EWOULDBLOCK => Ok(0),
            Err(e) => Err(AgentError::os("read", "failed to read from control socket", e)),
        }
    }

    /// Sends `message` as one datagram to the bound path.
    pub fn write(&self, message: &[u8]) -> Result<()> {
        let state = self.lock();
        let Some(state) = state.as_ref() else {
            return Err(AgentError::invalid_state(
                "write",
                "control socket has not been opened",
            ));
        };

        let addr = UnixAddr::new(&state.path).map_err(|e| {
            AgentError::os(
                "write",
                format!("invalid socket path '{}'", state.path.display()),
                e,
            )
        })?;
        let sent = sendto(state.fd.as_raw_fd(), message, &addr, MsgFlags::MSG_DONTWAIT)
            .map_err(|e| AgentError::os("write", "could not send to control socket", e))?;
        if sent != message.len() {
            return Err(AgentError::invalid_state(
                "write",
                format!("sent {sent} of {} bytes", message.len()),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ControlSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSocket")
            .field("path", &self.bound_path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn socket_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn open_then_close_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "ctl.sock");
        let socket = ControlSocket::new();

        socket.open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(socket.bound_path(), Some(path.clone()));

        socket.close().unwrap();
        assert!(!path.exists());
        assert!(!socket.is_open());
    }

    #[test]
    fn second_open_fails_and_keeps_first_binding() {
        let dir = tempfile::tempdir().unwrap();
        let first = socket_path(&dir, "first.sock");
        let second = socket_path(&dir, "second.sock");
        let socket = ControlSocket::new();

        socket.open(&first).unwrap();
        let err = socket.open(&second).unwrap_err();
        assert!(err.to_string().contains("already opened"));
        assert!(!second.exists());

        socket.write(b"still here").unwrap();
        let mut buf = [0u8; 32];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"still here");

        socket.close().unwrap();
    }

    #[test]
    fn read_without_pending_message_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ControlSocket::new();
        socket.open(socket_path(&dir, "empty.sock")).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(socket.read(&mut buf).unwrap(), 0);

        socket.close().unwrap();
    }

    #[test]
    fn ping_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "x.sock");
        let socket = ControlSocket::new();

        socket.open(&path).unwrap();
        socket.write(b"PING").unwrap();

        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"PING");

        socket.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn each_write_is_one_message() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ControlSocket::new();
        socket.open(socket_path(&dir, "multi.sock")).unwrap();

        socket.write(b"first").unwrap();
        socket.write(b"second message").unwrap();

        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second message");
        assert_eq!(socket.read(&mut buf).unwrap(), 0);

        socket.close().unwrap();
    }

    #[test]
    fn write_larger_than_send_buffer_reports_errno() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ControlSocket::new();
        socket.open(socket_path(&dir, "big.sock")).unwrap();

        let err = socket.write(&vec![0u8; 1 << 20]).unwrap_err();
        assert!(matches!(err, AgentError::Os { op: "write", .. }), "{err:?}");
        assert_eq!(err.os_code(), Some(Errno::EMSGSIZE as i32));

        // The failed send leaves the socket usable.
        assert!(socket.is_open());
        socket.write(b"PING").unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING");

        socket.close().unwrap();
    }

    #[test]
    fn oversized_message_is_truncated_to_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ControlSocket::new();
        socket.open(socket_path(&dir, "trunc.sock")).unwrap();

        socket.write(b"0123456789").unwrap();
        let mut buf = [0u8; 4];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");

        socket.close().unwrap();
    }

    #[test]
    fn operations_require_open_socket() {
        let socket = ControlSocket::new();
        let mut buf = [0u8; 8];

        assert!(matches!(socket.close(), Err(AgentError::InvalidState { op: "close", .. })));
        assert!(matches!(socket.read(&mut buf), Err(AgentError::InvalidState { op: "read", .. })));
        assert!(matches!(socket.write(b"x"), Err(AgentError::InvalidState { op: "write", .. })));

        // The teardown variant is silent.
        socket.destroy();
    }

    #[test]
    fn rejects_empty_and_too_long_paths() {
        let socket = ControlSocket::new();

        let err = socket.open("").unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument { .. }));

        let long = format!("/tmp/{}", "a".repeat(max_path_len()));
        let err = socket.open(&long).unwrap_err();
        assert!(err.to_string().contains("too long"));
        assert!(!Path::new(&long).exists());
        assert!(!socket.is_open());
    }

    #[test]
    fn bind_failure_surfaces_os_code_and_leaves_socket_closed() {
        let socket = ControlSocket::new();
        let err = socket
            .open("/nonexistent-profcorr-dir/ctl.sock")
            .unwrap_err();
        assert!(err.os_code().is_some());
        assert!(!socket.is_open());

        // A failed open does not block a later one.
        let dir = tempfile::tempdir().unwrap();
        socket.open(socket_path(&dir, "retry.sock")).unwrap();
        socket.close().unwrap();
    }

    #[test]
    fn destroy_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "destroy.sock");
        let socket = ControlSocket::new();

        socket.open(&path).unwrap();
        socket.destroy();
        assert!(!path.exists());
        assert!(!socket.is_open());
    }

    #[test]
    fn concurrent_writers_and_reader() {
        let dir = tempfile::tempdir().unwrap();
        let socket = Arc::new(ControlSocket::new());
        socket.open(socket_path(&dir, "concurrent.sock")).unwrap();

        let writers: Vec<_> = (0..4u8)
            .map(|id| {
                let socket = Arc::clone(&socket);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        socket.write(&[id; 8]).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut received = 0;
        let mut buf = [0u8; 16];
        loop {
            let n = socket.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(n, 8);
            assert!(buf[..8].iter().all(|b| *b == buf[0]));
            received += 1;
        }
        assert_eq!(received, 20);

        socket.close().unwrap();
    }
}
