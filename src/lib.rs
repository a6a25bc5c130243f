// Library interface for webspace
// The `webspace` and `webspaced` binaries, tests and benchmarks build on it

pub mod backend;
pub mod cli;
pub mod console;
pub mod daemon;
pub mod error;
pub mod signal;
pub mod terminal;

pub use error::{Error, Result};
