//! Client side of a console attachment
//!
//! The proxy waits on three sources at once: the cancellation event, the
//! local terminal and the session socket. Exactly one source is serviced per
//! wakeup. Cancellation always wins; when both the terminal and the socket
//! are ready they take turns, so a long paste into an echoing console keeps
//! draining the socket. Terminal input is read one byte at a time so the
//! detach sequence (`Ctrl-]` then `q`) is seen byte-for-byte; `Ctrl-]`
//! followed by anything else is passed through unchanged.

use crate::daemon::client::RpcClient;
use crate::error::{Error, Result};
use crate::signal::{Cancellation, SignalHandler};
use crate::terminal::{self, RawMode};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Detach trigger (Ctrl-])
pub const ESCAPE_BYTE: u8 = 0x1D;

/// Follow-up byte that confirms a detach
pub const ESCAPE_DETACH: u8 = b'q';

/// Read size for data coming from the session socket
const SOCKET_BUFFER_SIZE: usize = 4096;

/// Upper bound on a resize call, which runs on the signal thread
const RESIZE_TIMEOUT: Duration = Duration::from_secs(2);

/// What to do with one byte of terminal input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeAction {
    /// Swallowed for now; it may start a detach
    Hold,
    /// Send this byte
    Forward(u8),
    /// Send the held escape byte followed by this one
    ForwardEscaped(u8),
    /// Leave the console
    Detach,
}

/// Tracks whether the previous terminal byte was the escape trigger
#[derive(Debug, Default)]
pub struct EscapeDetector {
    pending: bool,
}

impl EscapeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn feed(&mut self, byte: u8) -> EscapeAction {
        if self.pending {
            self.pending = false;
            if byte == ESCAPE_DETACH {
                EscapeAction::Detach
            } else {
                EscapeAction::ForwardEscaped(byte)
            }
        } else if byte == ESCAPE_BYTE {
            self.pending = true;
            EscapeAction::Hold
        } else {
            EscapeAction::Forward(byte)
        }
    }
}

/// Why the proxy loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyExit {
    /// The user typed the detach sequence
    Detached,
    /// A termination signal fired
    Cancelled,
    /// The session socket reached end of file
    RemoteClosed,
    /// The local input reached end of file
    InputClosed,
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

/// Relay bytes between `input`/`output` and `socket` until something ends it
///
/// The terminal is not touched here; callers that own a TTY put it into raw
/// mode first (see [`attach`]).
pub fn run_proxy<I, S, O>(
    cancel: &Cancellation,
    input: &mut I,
    socket: &mut S,
    output: &mut O,
) -> Result<ProxyExit>
where
    I: Read + AsFd,
    S: Read + Write + AsFd,
    O: Write,
{
    let mut escape = EscapeDetector::new();
    let mut buf = [0u8; SOCKET_BUFFER_SIZE];
    let mut socket_turn = false;

    loop {
        let (cancelled, input_ready, socket_ready) = {
            let mut fds = [
                PollFd::new(cancel.as_fd(), PollFlags::POLLIN),
                PollFd::new(input.as_fd(), PollFlags::POLLIN),
                PollFd::new(socket.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
            (is_ready(&fds[0]), is_ready(&fds[1]), is_ready(&fds[2]))
        };

        if cancelled {
            return Ok(ProxyExit::Cancelled);
        }

        if input_ready && !(socket_ready && socket_turn) {
            socket_turn = true;
            let mut byte = [0u8; 1];
            match input.read(&mut byte) {
                Ok(0) => return Ok(ProxyExit::InputClosed),
                Ok(_) => {}
                Err(e) if retryable(&e) => continue,
                Err(e) => return Err(e.into()),
            }

            match escape.feed(byte[0]) {
                EscapeAction::Hold => {}
                EscapeAction::Forward(b) => socket.write_all(&[b])?,
                EscapeAction::ForwardEscaped(b) => socket.write_all(&[ESCAPE_BYTE, b])?,
                EscapeAction::Detach => return Ok(ProxyExit::Detached),
            }
            continue;
        }

        if socket_ready {
            socket_turn = false;
            let n = match socket.read(&mut buf) {
                Ok(0) => return Ok(ProxyExit::RemoteClosed),
                Ok(n) => n,
                Err(e) if retryable(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            output.write_all(&buf[..n])?;
            output.flush()?;
        }
    }
}

fn retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

/// Attach the controlling terminal to the console session at `session`
///
/// Raw mode is held for exactly the duration of the relay and restored on
/// every exit path. Window size changes are forwarded to the daemon from the
/// signal thread; a failed resize is logged and the relay carries on.
pub fn attach(client: &RpcClient, session: &Path, cancel: &Cancellation) -> Result<ProxyExit> {
    let mut socket = UnixStream::connect(session).map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("Failed to attach to {}: {}", session.display(), e),
        ))
    })?;

    let _signals = SignalHandler::install_with_resize(cancel.clone(), resize_notifier(client, session))
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

    let stdin = io::stdin();
    // Unbuffered handle on the terminal so poll readiness matches what read sees
    let mut input = File::from(stdin.as_fd().try_clone_to_owned()?);
    let stdout = io::stdout();
    let mut output = stdout.lock();

    let mut raw = RawMode::enable(stdin.as_fd())?;
    let result = run_proxy(cancel, &mut input, &mut socket, &mut output);
    raw.restore()?;

    result
}

/// Callback that pushes the terminal's current size to the session
///
/// Each call makes one `console_resize` on a fresh connection, bounded by
/// [`RESIZE_TIMEOUT`]. Failures are logged and otherwise ignored.
pub fn resize_notifier(client: &RpcClient, session: &Path) -> impl FnMut() + Send + 'static {
    let client = client.clone().with_timeout(Some(RESIZE_TIMEOUT));
    let session = session.to_path_buf();
    move || {
        let (width, height) = terminal::dimensions();
        if let Err(e) = client.console_resize(&session, width, height) {
            log::warn!("Failed to resize console to {}x{}: {}", width, height, e);
        }
    }
}
