//! Run-time configuration for the kernel memory layer

use std::time::Duration;

/// What to do once a fatal failure has been logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalAction {
    /// Pause, then terminate the process with a failure status
    #[default]
    Exit,
    /// Pause, then hand the fatal error back to the caller
    Return,
}

/// Kernel memory layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmemConfig {
    /// Diagnostic delay after a recoverable failure
    pub error_pause: Duration,

    /// Diagnostic delay before acting on a fatal failure
    pub fatal_pause: Duration,

    /// Behaviour after a fatal failure
    pub on_fatal: FatalAction,

    /// Actually deallocate in `free`. Off by default: releasing kernel memory
    /// obtained this way can panic the kernel.
    pub release_on_free: bool,
}

impl Default for KmemConfig {
    fn default() -> Self {
        Self {
            error_pause: Duration::from_secs(3),
            fatal_pause: Duration::from_secs(10),
            on_fatal: FatalAction::Exit,
            release_on_free: false,
        }
    }
}

impl KmemConfig {
    /// No pauses, fatal errors returned instead of exiting
    pub fn quiet() -> Self {
        Self {
            error_pause: Duration::ZERO,
            fatal_pause: Duration::ZERO,
            on_fatal: FatalAction::Return,
            release_on_free: false,
        }
    }
}
