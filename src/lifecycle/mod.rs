//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! Ctrl-C / SIGTERM
//!     → shutdown.rs triggers the broadcast
//!     → queue drainer and config reloader leave their loops
//!     → binary awaits their join handles and exits
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
