//! §7: the in-band failure channel. A future's failure value is opaque
//! (`F`), but two shapes are library-originated and worth naming:
//! cancellation and timeout.

use crate::future::Future;
use crate::token::CancellationToken;

/// Identifies whether a failure value is one of the two well-known
/// library-originated shapes. Implemented for any failure type so
/// `hasFailedWithCancel`/`hasFailedWithTimeout` (§7) work by value rather
/// than by `dyn Any` downcasting.
pub trait FailureKind {
    /// The cancel token, if this failure is a cancellation failure.
    fn as_cancellation(&self) -> Option<&CancellationToken> {
        None
    }

    fn is_timeout(&self) -> bool {
        false
    }
}

/// A ready-made failure type covering the two well-known shapes plus an
/// arbitrary custom one. Most callers that don't need a bespoke failure
/// enum can use `Future<V, StandardFailure<MyError>>` directly.
#[derive(Debug, Clone, PartialEq)]
pub enum StandardFailure<F> {
    /// An `unless` token (or any cancel-driven operation) cancelled first.
    Cancelled(CancellationToken),
    /// A timer-driven operation (e.g. `afterDelay`) timed out.
    TimedOut,
    Custom(F),
}

impl<F> FailureKind for StandardFailure<F> {
    fn as_cancellation(&self) -> Option<&CancellationToken> {
        match self {
            StandardFailure::Cancelled(token) => Some(token),
            _ => None,
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, StandardFailure::TimedOut)
    }
}

impl<F> From<CancellationToken> for StandardFailure<F> {
    fn from(token: CancellationToken) -> Self {
        StandardFailure::Cancelled(token)
    }
}

/// `true` if this future failed, and the failure is a cancellation failure.
pub fn has_failed_with_cancel<V, F>(future: &Future<V, F>) -> bool
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static + FailureKind,
{
    future
        .force_get_failure()
        .ok()
        .is_some_and(|f| f.as_cancellation().is_some())
}

/// `true` if this future failed, and the failure is a timeout failure.
pub fn has_failed_with_timeout<V, F>(future: &Future<V, F>) -> bool
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static + FailureKind,
{
    future.force_get_failure().ok().is_some_and(|f| f.is_timeout())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn standard_failure_from_token_is_cancellation() {
        let token = CancellationToken::cancelled();
        let failure: StandardFailure<String> = StandardFailure::from(token.clone());
        assert!(failure.as_cancellation().is_some());
    }

    #[test]
    fn has_failed_with_cancel_detects_cancellation_shape() {
        let future = Future::<i32, StandardFailure<String>>::with_failure(StandardFailure::Cancelled(
            CancellationToken::cancelled(),
        ));
        assert!(has_failed_with_cancel(&future));
        assert!(!has_failed_with_timeout(&future));
    }

    #[test]
    fn has_failed_with_timeout_detects_timeout_shape() {
        let future = Future::<i32, StandardFailure<String>>::with_failure(StandardFailure::TimedOut);
        assert!(has_failed_with_timeout(&future));
        assert!(!has_failed_with_cancel(&future));
    }

    #[test]
    fn custom_failure_matches_neither() {
        let future =
            Future::<i32, StandardFailure<String>>::with_failure(StandardFailure::Custom("oops".to_string()));
        assert!(!has_failed_with_cancel(&future));
        assert!(!has_failed_with_timeout(&future));
    }
}
