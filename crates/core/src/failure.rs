#![forbid(unsafe_code)]

/// Error taxonomy shared by every crate's error type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Bad inputs: malformed search spec, unknown provider, missing field.
    UserConfig,
    /// Retryable backend errors.
    StoreTransient,
    /// Backend errors that survived every retry.
    StoreFatal,
    /// The user process could not be spawned (exit code -2).
    LaunchFailure,
    /// The user process exited non-zero.
    UserProcessError,
    Cancelled,
    /// Assertion failure; fatal for the controller.
    InternalInvariant,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreTransient)
    }

    pub fn is_fatal_for_controller(&self) -> bool {
        matches!(self, Self::InternalInvariant)
    }
}

/// Exit code recorded when a run could not be launched.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -2;
