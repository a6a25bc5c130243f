//! Interactive container consoles
//!
//! - `session`: daemon side, one private socket per attachment bridged onto
//!   the backend's console stream
//! - `proxy`: client side, relays the local terminal to that socket until
//!   the escape sequence, a signal, or either end closing

pub mod proxy;
pub mod session;

pub use proxy::{attach, resize_notifier, run_proxy, EscapeDetector, ProxyExit, ESCAPE_BYTE, ESCAPE_DETACH};
pub use session::{ConsoleRegistry, ConsoleSession, SessionState};
