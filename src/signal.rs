//! Cancellation object and signal wiring
//!
//! Blocking waits in the daemon and the console proxy include the
//! cancellation event in their poll set, so a signal wakes them immediately
//! instead of being noticed only after the next byte arrives. Signal handlers
//! never touch server state; they only call [`Cancellation::cancel`].

use anyhow::Result;
use nix::sys::eventfd::{EfdFlags, EventFd};
use signal_hook::consts::{SIGINT, SIGTERM, SIGWINCH};
use signal_hook::iterator::{Handle, Signals};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct Inner {
    requested: AtomicBool,
    event: EventFd,
}

/// A one-shot cancellation event observable by `poll`
///
/// Once cancelled the event stays readable, so every later wait on it
/// returns immediately.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    pub fn new() -> std::io::Result<Self> {
        let event = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(std::io::Error::from)?;
        Ok(Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                event,
            }),
        })
    }

    /// Request cancellation. Returns true only for the call that triggered it.
    pub fn cancel(&self) -> bool {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.inner.event.write(1) {
            log::error!("Failed to signal cancellation event: {}", e);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }
}

impl AsFd for Cancellation {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.event.as_fd()
    }
}

/// Forwards process signals to a [`Cancellation`] from a dedicated thread
///
/// SIGINT and SIGTERM request cancellation. When a resize callback is
/// installed, SIGWINCH invokes it; the callback must not block for long.
pub struct SignalHandler {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalHandler {
    /// Install SIGINT/SIGTERM handling
    pub fn install(cancel: Cancellation) -> Result<Self> {
        Self::spawn(cancel, None)
    }

    /// Install SIGINT/SIGTERM handling plus a SIGWINCH callback
    pub fn install_with_resize<F>(cancel: Cancellation, on_resize: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn(cancel, Some(Box::new(on_resize)))
    }

    fn spawn(cancel: Cancellation, mut on_resize: Option<Box<dyn FnMut() + Send>>) -> Result<Self> {
        let mut wanted = vec![SIGINT, SIGTERM];
        if on_resize.is_some() {
            wanted.push(SIGWINCH);
        }
        let mut signals = Signals::new(&wanted)?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    match sig {
                        SIGINT | SIGTERM => {
                            log::debug!("Received signal {}, cancelling", sig);
                            cancel.cancel();
                        }
                        SIGWINCH => {
                            if let Some(callback) = on_resize.as_mut() {
                                callback();
                            }
                        }
                        _ => {}
                    }
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
