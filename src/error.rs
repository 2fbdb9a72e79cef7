use thiserror::Error;

/// The single out-of-band error channel (programmer errors, never surfaced
/// through a [`crate::future::Future`]'s failure slot).
///
/// Mirrors the teacher's `LastFmError` shape: one `thiserror` enum, one
/// variant per failure mode, no wrapped diagnostic chain since none of
/// these originate from an external dependency.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("value was already set on this source")]
    AlreadySet,

    #[error("subject was not in the state required for this operation")]
    NotInExpectedState,

    #[error("invalid delay: {0}")]
    InvalidDelay(String),
}
