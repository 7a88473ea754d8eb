//! Pipes and non-blocking output capture

use std::fs::File;
use std::future::Future;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use nix::errno::Errno;
use nix::fcntl::OFlag;

use crate::errors::{Result, SpawnError};

/// Create a close-on-exec pipe, returning `(read, write)`.
///
/// Close-on-exec keeps unrelated children from inheriting either end; the
/// rebinder clears the flag on the copy it installs in the child.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| SpawnError::Syscall(format!("pipe failed: {}", e)))
}

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = Errno::result(unsafe { libc::fcntl(raw, libc::F_GETFL) })
        .map_err(|e| SpawnError::Syscall(format!("F_GETFL failed: {}", e)))?;
    Errno::result(unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) })
        .map_err(|e| SpawnError::Syscall(format!("F_SETFL failed: {}", e)))?;
    Ok(())
}

struct CaptureInner {
    buf: Mutex<Vec<u8>>,
    error: Mutex<Option<io::Error>>,
    done: AtomicBool,
    waker: AtomicWaker,
}

/// Bytes collected from a pipe read end, resolved at end-of-file.
///
/// Awaiting the capture yields everything the writers produced, in write
/// order. The bytes are handed out once; awaiting a clone afterwards yields
/// an empty buffer.
#[derive(Clone)]
pub struct OutputCapture {
    inner: Arc<CaptureInner>,
}

impl OutputCapture {
    fn new() -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                buf: Mutex::new(Vec::new()),
                error: Mutex::new(None),
                done: AtomicBool::new(false),
                waker: AtomicWaker::new(),
            }),
        }
    }

    /// Whether end-of-file (or a read error) has been observed
    pub fn is_finished(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Bytes collected so far
    pub fn len(&self) -> usize {
        lock(&self.inner.buf).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&self, bytes: &[u8]) {
        lock(&self.inner.buf).extend_from_slice(bytes);
    }

    fn finish(&self, error: Option<io::Error>) {
        *lock(&self.inner.error) = error;
        self.inner.done.store(true, Ordering::Release);
        self.inner.waker.wake();
    }
}

impl Future for OutputCapture {
    type Output = io::Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.is_finished() {
            self.inner.waker.register(cx.waker());
            if !self.is_finished() {
                return Poll::Pending;
            }
        }

        if let Some(err) = lock(&self.inner.error).take() {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(std::mem::take(&mut *lock(&self.inner.buf))))
    }
}

/// Notifier-side reader feeding an [`OutputCapture`]
pub(crate) struct CaptureReader {
    file: File,
    capture: OutputCapture,
}

impl CaptureReader {
    pub(crate) fn new(fd: OwnedFd) -> Result<(Self, OutputCapture)> {
        set_nonblocking(fd.as_fd())?;
        let capture = OutputCapture::new();
        let reader = Self {
            file: File::from(fd),
            capture: capture.clone(),
        };
        Ok((reader, capture))
    }

    /// Read everything currently available. Returns `true` once the capture
    /// is resolved and the reader can be dropped.
    pub(crate) fn drain(&mut self) -> bool {
        let mut chunk = [0u8; 8192];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => {
                    self.capture.finish(None);
                    return true;
                }
                Ok(n) => self.capture.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.capture.finish(Some(e));
                    return true;
                }
            }
        }
    }
}

impl AsFd for CaptureReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
