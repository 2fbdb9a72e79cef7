//! §4.C: the 3-state cancel token machine.
//!
//! Generalises the teacher's `cancellation-token/src/token.rs`, which models
//! a 2-state boolean cancellation flag, into the spec's 3-state machine
//! (`StillCancellable` additionally resolves to `Immortal` on source drop,
//! never just "cancelled or not"). The single `Mutex<TokenGuarded>` (rather
//! than an atomic flag plus a separate observer mutex, as the teacher used)
//! is deliberate: it makes "check state, then enqueue observer" atomic,
//! closing a race window a split lock would leave open.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatcher::{self, Dispatcher};
use crate::observer::{ObserverHandle, ObserverList};

/// Observable state of a [`CancellationToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Transient: may still become `Cancelled`. Volatile — by the time a
    /// caller acts on having observed this, the token may already have
    /// moved on.
    StillCancellable,
    /// Terminal: cancellation was requested.
    Cancelled,
    /// Terminal: the source was dropped without cancelling, or the token
    /// was constructed via [`CancellationToken::immortal`].
    Immortal,
}

pub(crate) type CancelHandler = Box<dyn FnOnce() + Send>;

struct TokenGuarded {
    state: TokenState,
    observers: ObserverList<CancelHandler>,
}

struct TokenInner {
    guarded: Mutex<TokenGuarded>,
}

/// A read-only, freely cloneable handle to cancellation state.
///
/// A null/absent token is semantically equivalent to [`TokenState::Immortal`]
/// (§3); callers that want that value can use [`CancellationToken::immortal`].
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CancellationToken {}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("state", &self.inner.guarded.lock().state)
            .finish()
    }
}

/// The sole owner of the write capability for a [`CancellationToken`].
///
/// Not `Clone`: uniqueness of the write capability is enforced by the type
/// system, not by convention. Dropping a source that never cancelled
/// immortalises its token.
pub struct CancellationTokenSource {
    inner: Arc<TokenInner>,
}

impl CancellationTokenSource {
    /// Creates a fresh, still-cancellable token and its source.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let inner = Arc::new(TokenInner {
            guarded: Mutex::new(TokenGuarded {
                state: TokenState::StillCancellable,
                observers: ObserverList::new(),
            }),
        });

        Self { inner }
    }

    /// The token this source controls.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.clone(),
        }
    }

    /// Marks the token cancelled. Idempotent (§5): a second call is a no-op.
    pub fn cancel(&self) {
        self.try_cancel();
    }

    /// Marks the token cancelled, returning `true` exactly once across all
    /// concurrent callers (§5's cancellation atomicity guarantee).
    pub fn try_cancel(&self) -> bool {
        let observers = {
            let mut guarded = self.inner.guarded.lock();
            if guarded.state != TokenState::StillCancellable {
                return false;
            }
            guarded.state = TokenState::Cancelled;
            guarded.observers.drain_in_order()
        };

        tracing::trace!("cancellation token cancelled, firing observers");
        for handler in observers {
            handler();
        }

        true
    }
}

impl Drop for CancellationTokenSource {
    fn drop(&mut self) {
        let observers = {
            let mut guarded = self.inner.guarded.lock();
            if guarded.state != TokenState::StillCancellable {
                return;
            }
            guarded.state = TokenState::Immortal;
            guarded.observers.drain_in_order()
        };

        tracing::trace!("cancellation token source dropped without cancelling, token is now immortal");
        // Immortal observers never fire (§3); draining only reclaims storage.
        drop(observers);
    }
}

pub(crate) enum RegisterOutcome {
    Registered(ObserverHandle),
    RunInline(CancelHandler),
    Discarded,
}

impl CancellationToken {
    /// A pre-cancelled token, with no source.
    pub fn cancelled() -> Self {
        let source = CancellationTokenSource::new();
        source.cancel();
        source.token()
    }

    /// A token that is already (and will forever remain) [`TokenState::Immortal`].
    pub fn immortal() -> Self {
        let inner = Arc::new(TokenInner {
            guarded: Mutex::new(TokenGuarded {
                state: TokenState::Immortal,
                observers: ObserverList::new(),
            }),
        });

        Self { inner }
    }

    /// Current state. Volatile for [`TokenState::StillCancellable`] (§4.C).
    pub fn state(&self) -> TokenState {
        self.inner.guarded.lock().state
    }

    pub fn is_already_cancelled(&self) -> bool {
        self.state() == TokenState::Cancelled
    }

    pub fn can_still_be_cancelled(&self) -> bool {
        self.state() == TokenState::StillCancellable
    }

    pub fn is_immortal(&self) -> bool {
        self.state() == TokenState::Immortal
    }

    pub(crate) fn register_raw(&self, handler: CancelHandler) -> RegisterOutcome {
        let mut guarded = self.inner.guarded.lock();
        match guarded.state {
            TokenState::Cancelled => RegisterOutcome::RunInline(handler),
            TokenState::Immortal => RegisterOutcome::Discarded,
            TokenState::StillCancellable => {
                let handle = guarded.observers.insert(handler);
                RegisterOutcome::Registered(handle)
            }
        }
    }

    pub(crate) fn unregister_raw(&self, handle: ObserverHandle) {
        let mut guarded = self.inner.guarded.lock();
        guarded.observers.remove(handle);
    }

    /// Runs `handler` exactly once, the first time the token is cancelled.
    /// Discarded without running if the token becomes [`TokenState::Immortal`]
    /// instead.
    ///
    /// Honors the thread-affinity guarantee of §4.C/§5: if a [`Dispatcher`]
    /// is bound on the calling thread at registration time, the eventual
    /// (deferred) firing is routed through it. A handler that fires inline
    /// because the token was already cancelled runs synchronously on the
    /// calling thread, matching "or inline if the subject was already
    /// terminal".
    pub fn when_cancelled_do<H>(&self, handler: H)
    where
        H: FnOnce() + Send + 'static,
    {
        let captured_dispatcher = dispatcher::current_dispatcher();
        let routed: CancelHandler = Box::new(move || run_via(captured_dispatcher, handler));

        match self.register_raw(routed) {
            RegisterOutcome::Registered(_) => {}
            RegisterOutcome::RunInline(handler) => handler(),
            RegisterOutcome::Discarded => {}
        }
    }

    /// As [`Self::when_cancelled_do`], but the registration is dropped if
    /// `unless` cancels first (§4.C's algorithm). If `self` and `unless`
    /// are the same token, the handler is dropped without running.
    pub fn when_cancelled_do_unless<H>(&self, handler: H, unless: &CancellationToken)
    where
        H: FnOnce() + Send + 'static,
    {
        if Arc::ptr_eq(&self.inner, &unless.inner) {
            return;
        }

        if unless.is_already_cancelled() {
            return;
        }

        if self.is_already_cancelled() {
            // Still subject to §4.C fast path #1: run inline, no link needed.
            let captured_dispatcher = dispatcher::current_dispatcher();
            run_via(captured_dispatcher, handler);
            return;
        }

        if self.is_immortal() || unless.is_immortal() {
            return;
        }

        // Two-phase link: register both halves before either can run, so a
        // synchronous resolution on one side can never find the other
        // side's cleanup handle missing.
        let link: Arc<Mutex<LinkHandles>> = Arc::new(Mutex::new(LinkHandles {
            receiver_handle: None,
            unless_handle: None,
        }));

        let captured_dispatcher = dispatcher::current_dispatcher();
        let unless_for_handler = unless.clone();
        let link_for_handler = link.clone();
        let receiver_handler: CancelHandler = Box::new(move || {
            // The handler fired: remove our cleanup entry from `unless` so
            // long-lived `unless` tokens don't accumulate dead observers.
            if let Some(unless_handle) = link_for_handler.lock().unless_handle.take() {
                unless_for_handler.unregister_raw(unless_handle);
            }
            run_via(captured_dispatcher, handler);
        });

        let receiver_for_cleanup = self.clone();
        let link_for_cleanup = link.clone();
        let cleanup_handler: CancelHandler = Box::new(move || {
            if let Some(receiver_handle) = link_for_cleanup.lock().receiver_handle.take() {
                receiver_for_cleanup.unregister_raw(receiver_handle);
            }
        });

        match self.register_raw(receiver_handler) {
            RegisterOutcome::Registered(receiver_handle) => {
                match unless.register_raw(cleanup_handler) {
                    RegisterOutcome::Registered(unless_handle) => {
                        let mut guarded = link.lock();
                        guarded.receiver_handle = Some(receiver_handle);
                        guarded.unless_handle = Some(unless_handle);
                    }
                    RegisterOutcome::RunInline(cleanup) => {
                        // `unless` raced to cancelled between our fast-path
                        // check and registration; remove the freshly
                        // installed receiver observer and run the cleanup.
                        cleanup();
                    }
                    RegisterOutcome::Discarded => {
                        // `unless` became immortal concurrently; nothing to
                        // clean up, the receiver handler stays registered
                        // as a plain `when_cancelled_do`.
                    }
                }
            }
            RegisterOutcome::RunInline(handler) => handler(),
            RegisterOutcome::Discarded => {}
        }
    }

    /// A future that resolves when the token is cancelled, and never
    /// resolves if the token becomes immortal.
    pub fn cancellation_future(&self) -> crate::future::combinators::CancellationTokenFuture {
        crate::future::combinators::CancellationTokenFuture::new(self.clone())
    }
}

struct LinkHandles {
    receiver_handle: Option<ObserverHandle>,
    unless_handle: Option<ObserverHandle>,
}

fn run_via<H>(dispatcher: Option<Arc<dyn Dispatcher>>, handler: H)
where
    H: FnOnce() + Send + 'static,
{
    match dispatcher {
        Some(dispatcher) => dispatcher.run(Box::new(handler)),
        None => handler(),
    }
}

pub mod combinators {
    //! §4.C: `min`/`max` and dependent-token-source combinators.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};

    use super::{CancellationToken, CancellationTokenSource};

    /// Cancel-on-first: cancelled as soon as either input is cancelled,
    /// immortal once both inputs are immortal.
    pub fn min(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
        if a.is_already_cancelled() {
            return a.clone();
        }
        if b.is_already_cancelled() {
            return b.clone();
        }
        if a.is_immortal() {
            return b.clone();
        }
        if b.is_immortal() {
            return a.clone();
        }
        if std::sync::Arc::ptr_eq(&a.inner, &b.inner) {
            return a.clone();
        }

        let source = Arc::new(CancellationTokenSource::new());
        let result = source.token();

        // Each closure below holds the only strong references to `source`
        // (the combinator doesn't keep one itself — `result` only holds the
        // token). If an input cancels, its closure fires `source.cancel()`.
        // If an input instead turns immortal, its closure is dropped
        // unfired by the input's own observer drain; once both closures are
        // gone this way, `source`'s refcount hits zero and its `Drop` impl
        // immortalises `result` — exactly the "immortal once both inputs
        // are immortal" rule, with no extra bookkeeping needed.
        for input in [a, b] {
            let source = source.clone();
            input.when_cancelled_do(move || {
                source.cancel();
            });
        }

        result
    }

    /// Cancel-on-last: cancelled only once both inputs have cancelled,
    /// immortal as soon as either input is immortal.
    pub fn max(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
        if a.is_immortal() {
            return a.clone();
        }
        if b.is_immortal() {
            return b.clone();
        }
        if a.is_already_cancelled() {
            return b.clone();
        }
        if b.is_already_cancelled() {
            return a.clone();
        }
        if std::sync::Arc::ptr_eq(&a.inner, &b.inner) {
            return a.clone();
        }

        let source = Arc::new(CancellationTokenSource::new());
        let result = source.token();
        let remaining = Arc::new(AtomicUsize::new(2));

        for input in [a, b] {
            let source = source.clone();
            let remaining = remaining.clone();
            input.when_cancelled_do(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    source.cancel();
                }
            });
        }

        result
    }

    /// A source whose token is cancelled whenever `upstream` cancels, while
    /// remaining independently cancellable. Uses a weak self-reference so
    /// that dropping every strong handle to the returned source (without
    /// cancelling) still immortalises its token, even though `upstream`
    /// holds a closure that would otherwise keep a strong cycle alive.
    pub fn cancel_token_source_until(upstream: &CancellationToken) -> CancellationTokenSource {
        let source = Arc::new(CancellationTokenSource::new());
        let weak: Weak<CancellationTokenSource> = Arc::downgrade(&source);

        upstream.when_cancelled_do(move || {
            if let Some(source) = weak.upgrade() {
                source.cancel();
            }
        });

        match Arc::try_unwrap(source) {
            Ok(source) => source,
            Err(_) => unreachable!("no other strong reference to `source` has been created yet"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn starts_still_cancellable() {
        let source = CancellationTokenSource::new();
        assert_eq!(source.token().state(), TokenState::StillCancellable);
    }

    #[test]
    fn cancel_is_idempotent() {
        let source = CancellationTokenSource::new();
        assert!(source.try_cancel());
        assert!(!source.try_cancel());
        assert_eq!(source.token().state(), TokenState::Cancelled);
    }

    #[test]
    fn drop_without_cancel_is_immortal() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        drop(source);
        assert_eq!(token.state(), TokenState::Immortal);
    }

    #[test]
    fn cancelled_factory_is_pre_cancelled() {
        assert_eq!(CancellationToken::cancelled().state(), TokenState::Cancelled);
    }

    #[test]
    fn immortal_factory_is_distinguishable_from_null() {
        let token = CancellationToken::immortal();
        assert_eq!(token.state(), TokenState::Immortal);
    }

    #[test]
    fn when_cancelled_do_fires_on_cancel() {
        let source = CancellationTokenSource::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        source.token().when_cancelled_do(move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        assert!(!fired.load(Ordering::SeqCst));
        source.cancel();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn when_cancelled_do_runs_inline_if_already_cancelled() {
        let token = CancellationToken::cancelled();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        token.when_cancelled_do(move || fired_clone.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn when_cancelled_do_discarded_if_immortal() {
        let token = CancellationToken::immortal();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        token.when_cancelled_do(move || fired_clone.store(true, Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn unless_discards_handler_when_unless_cancels_first() {
        let receiver_source = CancellationTokenSource::new();
        let unless_source = CancellationTokenSource::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        receiver_source
            .token()
            .when_cancelled_do_unless(move || fired_clone.store(true, Ordering::SeqCst), &unless_source.token());

        unless_source.cancel();

        // The receiver-side registration must be reclaimed as soon as
        // `unless` wins the race, not merely left inert.
        assert!(receiver_source.inner.guarded.lock().observers.is_empty());

        receiver_source.cancel();

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn unless_fires_handler_when_receiver_cancels_first() {
        let receiver_source = CancellationTokenSource::new();
        let unless_source = CancellationTokenSource::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        receiver_source
            .token()
            .when_cancelled_do_unless(move || fired_clone.store(true, Ordering::SeqCst), &unless_source.token());

        receiver_source.cancel();
        assert!(fired.load(Ordering::SeqCst));

        // The `unless`-side cleanup entry must be reclaimed once the
        // receiver itself fires, not left behind to accumulate.
        assert!(unless_source.inner.guarded.lock().observers.is_empty());
    }

    #[test]
    fn unless_same_token_drops_handler() {
        let source = CancellationTokenSource::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let token = source.token();

        token.when_cancelled_do_unless(move || fired_clone.store(true, Ordering::SeqCst), &token.clone());

        source.cancel();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn min_returns_cancelled_input_if_any_already_cancelled() {
        let a = CancellationToken::cancelled();
        let b = CancellationTokenSource::new().token();
        let result = combinators::min(&a, &b);
        assert_eq!(result.state(), TokenState::Cancelled);
    }

    #[test]
    fn min_cancels_when_either_input_cancels() {
        let source_a = CancellationTokenSource::new();
        let source_b = CancellationTokenSource::new();
        let result = combinators::min(&source_a.token(), &source_b.token());

        assert_eq!(result.state(), TokenState::StillCancellable);
        source_a.cancel();
        assert_eq!(result.state(), TokenState::Cancelled);
    }

    #[test]
    fn max_cancels_only_once_both_inputs_cancel() {
        let source_a = CancellationTokenSource::new();
        let source_b = CancellationTokenSource::new();
        let result = combinators::max(&source_a.token(), &source_b.token());

        source_a.cancel();
        assert_eq!(result.state(), TokenState::StillCancellable);
        source_b.cancel();
        assert_eq!(result.state(), TokenState::Cancelled);
    }

    #[test]
    fn max_returns_immortal_input_immediately() {
        let a = CancellationToken::immortal();
        let b = CancellationTokenSource::new().token();
        let result = combinators::max(&a, &b);
        assert_eq!(result.state(), TokenState::Immortal);
    }

    #[test]
    fn dependent_source_inherits_upstream_cancellation() {
        let upstream_source = CancellationTokenSource::new();
        let dependent_source = combinators::cancel_token_source_until(&upstream_source.token());
        let dependent_token = dependent_source.token();

        assert_eq!(dependent_token.state(), TokenState::StillCancellable);
        upstream_source.cancel();
        assert_eq!(dependent_token.state(), TokenState::Cancelled);
    }

    #[test]
    fn dependent_source_can_cancel_independently() {
        let upstream_source = CancellationTokenSource::new();
        let dependent_source = combinators::cancel_token_source_until(&upstream_source.token());
        let dependent_token = dependent_source.token();

        dependent_source.cancel();
        assert_eq!(dependent_token.state(), TokenState::Cancelled);
        assert_eq!(upstream_source.token().state(), TokenState::StillCancellable);
    }

    #[test]
    fn min_is_reflexive() {
        let token = CancellationTokenSource::new().token();
        let result = combinators::min(&token, &token);
        assert_eq!(result.state(), token.state());
    }

    #[test]
    fn max_is_reflexive() {
        let token = CancellationTokenSource::new().token();
        let result = combinators::max(&token, &token);
        assert_eq!(result.state(), token.state());
    }
}
