//! Process-wide tracing setup shared by the stockpile binaries.

pub mod subscriber;

pub use subscriber::{DEFAULT_FILTER, init_with_default};

/// Initialize process-wide tracing with the default filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init_with_default(DEFAULT_FILTER);
}
