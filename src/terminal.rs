use nix::sys::termios::{self, SetArg, Termios};
use std::os::fd::BorrowedFd;

/// Fallback dimensions when the terminal size cannot be queried
pub const DEFAULT_DIMENSIONS: (u16, u16) = (80, 24);

/// Raw-mode acquisition for a terminal
///
/// Saves the current attributes, switches the terminal to raw mode (no echo,
/// no line buffering, no signal characters) and restores the saved
/// attributes exactly once: on [`RawMode::restore`] or on drop, whichever
/// comes first.
pub struct RawMode<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Option<Termios>,
}

impl<'fd> RawMode<'fd> {
    /// Put the terminal behind `fd` into raw mode
    pub fn enable(fd: BorrowedFd<'fd>) -> std::io::Result<Self> {
        let saved = termios::tcgetattr(fd)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw)?;

        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }

    /// Whether the saved attributes have not been restored yet
    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }

    /// Restore the original attributes; later calls do nothing
    pub fn restore(&mut self) -> std::io::Result<()> {
        match self.saved.take() {
            Some(saved) => {
                termios::tcsetattr(self.fd, SetArg::TCSANOW, &saved)?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RawMode<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::error!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Current terminal width and height, falling back to 80x24
pub fn dimensions() -> (u16, u16) {
    terminal_size::terminal_size()
        .map(|(w, h)| (w.0, h.0))
        .unwrap_or(DEFAULT_DIMENSIONS)
}

/// Check whether stdin is attached to a terminal
pub fn stdin_is_terminal() -> bool {
    atty::is(atty::Stream::Stdin)
}
