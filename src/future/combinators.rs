//! §4.D/§4.F: `then`/`catch`/`finally`[`_do`], their `unless` variants,
//! `cancelled_on_completion_token`, and the async-interop bridge.
//!
//! Predicate dispatch (§4.D's continuation table) is expressed directly in
//! each combinator's closure rather than as a shared enum: `then`'s closure
//! ignores a `Failed` settlement by inheriting it, `catch`'s ignores a
//! `CompletedWithResult` the same way, and `finally`'s never needs to
//! ignore anything. `Immortal` is never seen by any of them — it's filtered
//! out one layer down, in [`Future::register_value_raw`].
//!
//! Dispatcher/thread-affinity routing is deliberately not implemented here
//! (see the crate-level design notes): these observers always fire directly
//! on whichever thread performs the terminal transition.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::future::{Future, FutureOutcome, Settlement, ValueRegisterOutcome};
use crate::observer::ObserverHandle;
use crate::token::{CancellationToken, CancellationTokenSource, RegisterOutcome};

struct UnlessLink {
    receiver_handle: Option<ObserverHandle>,
    unless_handle: Option<ObserverHandle>,
}

/// Registers `raw_handler` on `receiver`, discarded if `unless` cancels
/// first (§4.D's `unless` semantics). The two-phase link mirrors
/// [`CancellationToken::when_cancelled_do_unless`]: both halves are
/// registered, and the shared link handle populated, before either can run.
///
/// `on_unless_cancelled` is invoked (instead of `raw_handler`) if `unless`
/// wins the race; it's the caller's job to decide what that means (for
/// `_do` observers, nothing further; for continuation combinators, failing
/// the returned future with `unless` as the failure value).
fn register_with_unless<V, F, H, U>(receiver: &Future<V, F>, raw_handler: H, unless: Option<&CancellationToken>, on_unless_cancelled: U)
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
    H: FnOnce(Settlement<V, F>) + Send + 'static,
    U: FnOnce() + Send + 'static,
{
    let Some(unless) = unless else {
        match receiver.register_value_raw(raw_handler) {
            ValueRegisterOutcome::Registered(_) => {}
            ValueRegisterOutcome::RunInline(handler, settlement) => handler(settlement),
            ValueRegisterOutcome::Discarded => {}
        }
        return;
    };

    if unless.is_already_cancelled() {
        on_unless_cancelled();
        return;
    }

    if unless.is_immortal() {
        match receiver.register_value_raw(raw_handler) {
            ValueRegisterOutcome::Registered(_) => {}
            ValueRegisterOutcome::RunInline(handler, settlement) => handler(settlement),
            ValueRegisterOutcome::Discarded => {}
        }
        return;
    }

    let link: Arc<Mutex<UnlessLink>> = Arc::new(Mutex::new(UnlessLink {
        receiver_handle: None,
        unless_handle: None,
    }));

    let link_for_handler = link.clone();
    let unless_for_handler = unless.clone();
    let wrapped_handler = move |settlement: Settlement<V, F>| {
        if let Some(unless_handle) = link_for_handler.lock().unless_handle.take() {
            unless_for_handler.unregister_raw(unless_handle);
        }
        raw_handler(settlement);
    };

    let receiver_for_cleanup = receiver.clone();
    let link_for_cleanup = link.clone();
    let mut on_unless_cancelled_opt = Some(on_unless_cancelled);
    let cleanup_handler = move || {
        if let Some(receiver_handle) = link_for_cleanup.lock().receiver_handle.take() {
            receiver_for_cleanup.unregister_value_raw(receiver_handle);
        }
        if let Some(on_unless_cancelled) = on_unless_cancelled_opt.take() {
            on_unless_cancelled();
        }
    };

    match receiver.register_value_raw(wrapped_handler) {
        ValueRegisterOutcome::Registered(receiver_handle) => {
            match unless.register_raw(Box::new(cleanup_handler)) {
                RegisterOutcome::Registered(unless_handle) => {
                    let mut guarded = link.lock();
                    guarded.receiver_handle = Some(receiver_handle);
                    guarded.unless_handle = Some(unless_handle);
                }
                RegisterOutcome::RunInline(cleanup) => cleanup(),
                RegisterOutcome::Discarded => {}
            }
        }
        ValueRegisterOutcome::RunInline(handler, settlement) => {
            // Receiver already terminal: `unless` racing in no longer
            // matters, the settlement already happened.
            handler(settlement);
        }
        ValueRegisterOutcome::Discarded => {}
    }
}

impl<V, F> Future<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    /// Fires `handler(v)` when this future reaches `CompletedWithResult`;
    /// discarded on `Failed` or `Immortal`.
    pub fn then_do<H>(&self, handler: H, unless: Option<&CancellationToken>)
    where
        H: FnOnce(V) + Send + 'static,
    {
        register_with_unless(
            self,
            move |settlement| {
                if let Settlement::CompletedWithResult(v) = settlement {
                    handler(v);
                }
            },
            unless,
            || {},
        );
    }

    /// Fires `handler(f)` when this future reaches `Failed`; discarded on
    /// `CompletedWithResult` or `Immortal`.
    pub fn catch_do<H>(&self, handler: H, unless: Option<&CancellationToken>)
    where
        H: FnOnce(F) + Send + 'static,
    {
        register_with_unless(
            self,
            move |settlement| {
                if let Settlement::Failed(f) = settlement {
                    handler(f);
                }
            },
            unless,
            || {},
        );
    }

    /// Fires `handler(outcome)` when this future reaches any value-bearing
    /// terminal state; discarded on `Immortal`.
    pub fn finally_do<H>(&self, handler: H, unless: Option<&CancellationToken>)
    where
        H: FnOnce(FutureOutcome<V, F>) + Send + 'static,
    {
        register_with_unless(
            self,
            move |settlement| match settlement {
                Settlement::CompletedWithResult(v) => handler(FutureOutcome::Result(v)),
                Settlement::Failed(f) => handler(FutureOutcome::Failure(f)),
                Settlement::Immortal => {}
            },
            unless,
            || {},
        );
    }

    /// Chains a continuation that only runs on `CompletedWithResult`; a
    /// `Failed` settlement is inherited unchanged. The continuation's
    /// returned future is adopted via flattening (§4.D's continuation
    /// table).
    pub fn then<V2, C>(&self, continuation: C, unless: Option<&CancellationToken>) -> Future<V2, F>
    where
        V2: Clone + Send + 'static,
        C: FnOnce(V) -> Future<V2, F> + Send + 'static,
        F: From<CancellationToken>,
    {
        let (new_source, new_future) = Future::<V2, F>::new_source();
        let new_source = Arc::new(Mutex::new(Some(new_source)));

        let source_for_handler = new_source.clone();
        let handler = move |settlement: Settlement<V, F>| {
            let Some(source) = source_for_handler.lock().take() else {
                return;
            };
            match settlement {
                Settlement::CompletedWithResult(v) => {
                    source.try_set_result_future(continuation(v));
                }
                Settlement::Failed(f) => {
                    source.try_set_failure(f);
                }
                Settlement::Immortal => {
                    // Dropping `source` here immortalises `new_future`.
                }
            }
        };

        let source_for_unless = new_source.clone();
        let unless_owned = unless.cloned();
        register_with_unless(self, handler, unless, move || {
            if let Some(source) = source_for_unless.lock().take() {
                if let Some(unless) = unless_owned {
                    source.try_set_failure(F::from(unless));
                }
            }
        });

        new_future
    }

    /// Chains a continuation that only runs on `Failed`; a
    /// `CompletedWithResult` settlement is inherited unchanged.
    pub fn catch<C>(&self, continuation: C, unless: Option<&CancellationToken>) -> Future<V, F>
    where
        C: FnOnce(F) -> Future<V, F> + Send + 'static,
        F: From<CancellationToken>,
    {
        let (new_source, new_future) = Future::<V, F>::new_source();
        let new_source = Arc::new(Mutex::new(Some(new_source)));

        let source_for_handler = new_source.clone();
        let handler = move |settlement: Settlement<V, F>| {
            let Some(source) = source_for_handler.lock().take() else {
                return;
            };
            match settlement {
                Settlement::Failed(f) => {
                    source.try_set_result_future(continuation(f));
                }
                Settlement::CompletedWithResult(v) => {
                    source.try_set_result(v);
                }
                Settlement::Immortal => {}
            }
        };

        let source_for_unless = new_source.clone();
        let unless_owned = unless.cloned();
        register_with_unless(self, handler, unless, move || {
            if let Some(source) = source_for_unless.lock().take() {
                if let Some(unless) = unless_owned {
                    source.try_set_failure(F::from(unless));
                }
            }
        });

        new_future
    }

    /// Chains a continuation that runs on any value-bearing terminal state.
    pub fn finally<C>(&self, continuation: C, unless: Option<&CancellationToken>) -> Future<V, F>
    where
        C: FnOnce(FutureOutcome<V, F>) -> Future<V, F> + Send + 'static,
        F: From<CancellationToken>,
    {
        let (new_source, new_future) = Future::<V, F>::new_source();
        let new_source = Arc::new(Mutex::new(Some(new_source)));

        let source_for_handler = new_source.clone();
        let handler = move |settlement: Settlement<V, F>| {
            let Some(source) = source_for_handler.lock().take() else {
                return;
            };
            match settlement {
                Settlement::CompletedWithResult(v) => {
                    source.try_set_result_future(continuation(FutureOutcome::Result(v)));
                }
                Settlement::Failed(f) => {
                    source.try_set_result_future(continuation(FutureOutcome::Failure(f)));
                }
                Settlement::Immortal => {}
            }
        };

        let source_for_unless = new_source.clone();
        let unless_owned = unless.cloned();
        register_with_unless(self, handler, unless, move || {
            if let Some(source) = source_for_unless.lock().take() {
                if let Some(unless) = unless_owned {
                    source.try_set_failure(F::from(unless));
                }
            }
        });

        new_future
    }

    /// A cancel token that enters `Cancelled` when this future reaches any
    /// value-bearing terminal state, and `Immortal` when this future does.
    pub fn cancelled_on_completion_token(&self) -> CancellationToken {
        let source = Arc::new(CancellationTokenSource::new());
        let token = source.token();

        self.subscribe_settlement(move |settlement| match settlement {
            Settlement::CompletedWithResult(_) | Settlement::Failed(_) => source.cancel(),
            Settlement::Immortal => drop(source),
        });

        token
    }
}

/// A future that resolves when a [`CancellationToken`] is cancelled, never
/// resolving if the token becomes immortal instead.
///
/// Plays the same role as the teacher's `CancellationTokenFuture`, adapted
/// to notify via the token's own observer registration instead of a
/// bespoke waiter list.
pub struct CancellationTokenFuture {
    token: CancellationToken,
    waker_slot: Arc<Mutex<Option<Waker>>>,
    registered: bool,
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationTokenFuture {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            waker_slot: Arc::new(Mutex::new(None)),
            registered: false,
            ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

impl futures::future::Future for CancellationTokenFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        *self.waker_slot.lock() = Some(cx.waker().clone());

        if !self.registered {
            self.registered = true;
            let ready = self.ready.clone();
            let waker_slot = self.waker_slot.clone();
            self.token.when_cancelled_do(move || {
                ready.store(true, std::sync::atomic::Ordering::SeqCst);
                if let Some(waker) = waker_slot.lock().take() {
                    waker.wake();
                }
            });
        }

        if self.ready.load(std::sync::atomic::Ordering::SeqCst) || self.token.is_already_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl futures::future::FusedFuture for CancellationTokenFuture {
    fn is_terminated(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use std::task::Context;

    use assert_matches::assert_matches;
    use futures::Future as _;

    use super::*;
    use crate::failure::StandardFailure;
    use crate::token::CancellationTokenSource;

    type TestFuture<V> = Future<V, StandardFailure<String>>;

    #[test]
    fn then_chain_success() {
        let (source, future) = TestFuture::<i32>::new_source();
        let chained = future.then(|x| TestFuture::with_result(x + 1), None);

        source.try_set_result(41);
        assert!(chained.has_result());
        assert_eq!(chained.force_get_result().unwrap(), 42);
        assert!(!source.try_set_result(99));
    }

    #[test]
    fn catch_recovers() {
        let (source, future) = TestFuture::<i32>::new_source();
        let chained = future
            .then(|x| TestFuture::with_result(x + 1), None)
            .catch(|_failure| TestFuture::with_result(-1), None);

        source.try_set_failure(StandardFailure::Custom("boom".to_string()));
        assert!(chained.has_result());
        assert_eq!(chained.force_get_result().unwrap(), -1);
    }

    #[test]
    fn unless_cancels_pending_finally() {
        let (source, future) = TestFuture::<i32>::new_source();
        let cancel_source = CancellationTokenSource::new();
        let cancel_token = cancel_source.token();

        let chained = future.finally(|outcome| match outcome {
            FutureOutcome::Result(v) => TestFuture::with_result(v),
            FutureOutcome::Failure(f) => TestFuture::with_failure(f),
        }, Some(&cancel_token));

        cancel_source.cancel();
        assert!(chained.has_failed());
        assert_matches!(chained.force_get_failure().unwrap(), StandardFailure::Cancelled(_));

        // The receiver-side registration must be reclaimed once `unless`
        // wins the race, not left behind as dead storage.
        assert!(future.inner.guarded.lock().value_observers.is_empty());

        assert!(source.try_set_result(7));
    }

    #[test]
    fn then_do_does_not_fire_on_failure() {
        let (source, future) = TestFuture::<i32>::new_source();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        future.then_do(move |_| fired_clone.store(true, std::sync::atomic::Ordering::SeqCst), None);

        source.try_set_failure(StandardFailure::Custom("nope".to_string()));
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn cancelled_on_completion_token_cancels_on_result() {
        let (source, future) = TestFuture::<i32>::new_source();
        let token = future.cancelled_on_completion_token();
        assert!(token.can_still_be_cancelled());

        source.try_set_result(1);
        assert!(token.is_already_cancelled());
    }

    #[test]
    fn cancelled_on_completion_token_immortal_on_immortal() {
        let (source, future) = TestFuture::<i32>::new_source();
        let token = future.cancelled_on_completion_token();
        drop(source);
        assert!(token.is_immortal());
    }

    #[test]
    fn cancellation_future_resolves_on_cancel() {
        let source = CancellationTokenSource::new();
        let mut future = Box::pin(source.token().cancellation_future());

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);

        assert_matches!(future.as_mut().poll(&mut context), Poll::Pending);
        source.cancel();
        assert_matches!(future.as_mut().poll(&mut context), Poll::Ready(()));
    }
}
