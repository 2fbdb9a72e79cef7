//! §4.D: the 5-state future machine with auto-collapsing (flattening) and
//! cycle detection.
//!
//! Generalises the teacher's `cancellation-token/src/future.rs`, whose
//! `CancellationTokenFuture` bridges a single boolean flag into a
//! `futures::Future`, into a value-bearing, multi-state subject. The waker
//! list there becomes [`crate::observer::ObserverList`]'s `settle_observers`
//! here: the same "don't leak a waker that's never going to fire" problem,
//! generalised to arbitrary callbacks.

pub mod combinators;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PreconditionError;
use crate::observer::{ObserverHandle, ObserverList};

/// Observable state of a [`Future`] (§3). Carries the payload for the two
/// value-bearing terminal states.
enum FutureState<V, F> {
    AbleToBeSet,
    Flattening,
    CompletedWithResult(V),
    Failed(F),
    Immortal,
}

/// Cheap, payload-free view of [`FutureState`] for callers that only need to
/// branch on which state a future is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStateKind {
    AbleToBeSet,
    Flattening,
    CompletedWithResult,
    Failed,
    Immortal,
}

impl<V, F> From<&FutureState<V, F>> for FutureStateKind {
    fn from(state: &FutureState<V, F>) -> Self {
        match state {
            FutureState::AbleToBeSet => FutureStateKind::AbleToBeSet,
            FutureState::Flattening => FutureStateKind::Flattening,
            FutureState::CompletedWithResult(_) => FutureStateKind::CompletedWithResult,
            FutureState::Failed(_) => FutureStateKind::Failed,
            FutureState::Immortal => FutureStateKind::Immortal,
        }
    }
}

/// The outcome of a future reaching a value-bearing terminal state; passed
/// to `finallyDo`/`finally` handlers, which see either side.
#[derive(Clone)]
pub enum FutureOutcome<V, F> {
    Result(V),
    Failure(F),
}

/// Every way a subject can come to rest, including the non-value-bearing
/// [`Settlement::Immortal`]. This is what flatten propagation fires with,
/// since unlike [`FutureOutcome`] it must also carry the immortal case.
#[derive(Clone)]
pub(crate) enum Settlement<V, F> {
    CompletedWithResult(V),
    Failed(F),
    Immortal,
}

type ValueHandler<V, F> = Box<dyn FnOnce(Settlement<V, F>) + Send>;
type SettleHandler<V, F> = Box<dyn FnOnce(Settlement<V, F>) + Send>;

pub(crate) enum ValueRegisterOutcome<V, F> {
    Registered(ObserverHandle),
    RunInline(ValueHandler<V, F>, Settlement<V, F>),
    Discarded,
}

struct FutureGuarded<V, F> {
    state: FutureState<V, F>,
    /// User-facing observers (`then`/`catch`/`finally`[`Do`]). Discarded
    /// without firing on `Immortal` (§3's observer lifecycle).
    value_observers: ObserverList<ValueHandler<V, F>>,
    /// Internal flatten-propagation plumbing. Unlike `value_observers`,
    /// these always fire, including on `Immortal` — that's what lets a
    /// cycle's `Immortal` transition cascade through an entire flatten
    /// chain without a dedicated "immortalise the whole chain" routine.
    settle_observers: ObserverList<SettleHandler<V, F>>,
    /// Set exactly once, when this future enters `Flattening`. Walked (one
    /// lock at a time, since it's write-once) by cycle detection.
    flatten_target: Option<Future<V, F>>,
}

pub(crate) struct FutureInner<V, F> {
    guarded: Mutex<FutureGuarded<V, F>>,
}

/// A read-only, freely cloneable handle onto a future's state.
pub struct Future<V, F> {
    inner: Arc<FutureInner<V, F>>,
}

impl<V, F> Clone for Future<V, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The sole owner of the write capability for a [`Future`].
///
/// Not `Clone`. Dropping a source that is still `AbleToBeSet` immortalises
/// its future. Dropping a source that is `Flattening` does *not* immortalise
/// — the future stays subscribed to whatever it flattened into and inherits
/// that future's eventual state, because the subscription closure already
/// holds its own strong handle onto this future, independent of the source.
pub struct FutureSource<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    inner: Arc<FutureInner<V, F>>,
}

impl<V, F> Future<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    /// Creates a fresh, unset future together with its source.
    pub fn new_source() -> (FutureSource<V, F>, Future<V, F>) {
        let inner = Arc::new(FutureInner {
            guarded: Mutex::new(FutureGuarded {
                state: FutureState::AbleToBeSet,
                value_observers: ObserverList::new(),
                settle_observers: ObserverList::new(),
                flatten_target: None,
            }),
        });

        (
            FutureSource {
                inner: inner.clone(),
            },
            Future { inner },
        )
    }

    /// A future that is already `CompletedWithResult(v)`.
    pub fn with_result(v: V) -> Self {
        let (source, future) = Self::new_source();
        source.try_set_result(v);
        future
    }

    /// A future that is already `Failed(f)`.
    pub fn with_failure(f: F) -> Self {
        let (source, future) = Self::new_source();
        source.try_set_failure(f);
        future
    }

    /// A future that is already `Immortal`.
    pub fn immortal() -> Self {
        let (source, future) = Self::new_source();
        drop(source);
        future
    }

    pub fn state_kind(&self) -> FutureStateKind {
        FutureStateKind::from(&self.inner.guarded.lock().state)
    }

    pub fn has_result(&self) -> bool {
        self.state_kind() == FutureStateKind::CompletedWithResult
    }

    pub fn has_failed(&self) -> bool {
        self.state_kind() == FutureStateKind::Failed
    }

    /// True for any non-terminal state (`AbleToBeSet` or `Flattening`).
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self.state_kind(),
            FutureStateKind::AbleToBeSet | FutureStateKind::Flattening
        )
    }

    pub fn is_immortal(&self) -> bool {
        self.state_kind() == FutureStateKind::Immortal
    }

    /// Returns the result, or a precondition error if not `CompletedWithResult`.
    pub fn force_get_result(&self) -> Result<V, PreconditionError> {
        match &self.inner.guarded.lock().state {
            FutureState::CompletedWithResult(v) => Ok(v.clone()),
            _ => Err(PreconditionError::NotInExpectedState),
        }
    }

    /// Returns the failure, or a precondition error if not `Failed`.
    pub fn force_get_failure(&self) -> Result<F, PreconditionError> {
        match &self.inner.guarded.lock().state {
            FutureState::Failed(f) => Ok(f.clone()),
            _ => Err(PreconditionError::NotInExpectedState),
        }
    }

    /// Compares by terminal-state equivalence (§6): same result, same
    /// failure, or both immortal. Transient futures are equal only to
    /// themselves (i.e. the same underlying subject).
    pub fn terminal_eq(&self, other: &Self) -> bool
    where
        V: PartialEq,
        F: PartialEq,
    {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }

        let a = self.inner.guarded.lock();
        let b = other.inner.guarded.lock();
        match (&a.state, &b.state) {
            (FutureState::CompletedWithResult(x), FutureState::CompletedWithResult(y)) => x == y,
            (FutureState::Failed(x), FutureState::Failed(y)) => x == y,
            (FutureState::Immortal, FutureState::Immortal) => true,
            _ => false,
        }
    }

    /// Drives a terminal transition. Returns `false` if the subject was
    /// already terminal. Drains `value_observers` (firing them unless the
    /// settlement is `Immortal`, in which case they're merely discarded) and
    /// `settle_observers` (always fired).
    pub(crate) fn settle(&self, settlement: Settlement<V, F>) -> bool {
        let (value_observers, settle_observers) = {
            let mut guarded = self.inner.guarded.lock();
            if !matches!(guarded.state, FutureState::AbleToBeSet | FutureState::Flattening) {
                return false;
            }

            guarded.state = match &settlement {
                Settlement::CompletedWithResult(v) => FutureState::CompletedWithResult(v.clone()),
                Settlement::Failed(f) => FutureState::Failed(f.clone()),
                Settlement::Immortal => FutureState::Immortal,
            };

            (
                guarded.value_observers.drain_in_order(),
                guarded.settle_observers.drain_in_order(),
            )
        };

        tracing::trace!("future settled");

        if !matches!(settlement, Settlement::Immortal) {
            for observer in value_observers {
                observer(settlement.clone());
            }
        }
        for observer in settle_observers {
            observer(settlement.clone());
        }

        true
    }

    /// Registers `handler` to run exactly once this future settles
    /// (including on `Immortal`), or immediately if it already has.
    pub(crate) fn subscribe_settlement<H>(&self, handler: H)
    where
        H: FnOnce(Settlement<V, F>) + Send + 'static,
    {
        let mut handler_opt = Some(handler);
        let immediate = {
            let mut guarded = self.inner.guarded.lock();
            match &guarded.state {
                FutureState::CompletedWithResult(v) => Some(Settlement::CompletedWithResult(v.clone())),
                FutureState::Failed(f) => Some(Settlement::Failed(f.clone())),
                FutureState::Immortal => Some(Settlement::Immortal),
                FutureState::AbleToBeSet | FutureState::Flattening => {
                    let handler = handler_opt.take().expect("handler not yet consumed");
                    guarded.settle_observers.insert(Box::new(handler));
                    None
                }
            }
        };

        if let Some(settlement) = immediate {
            (handler_opt.take().expect("handler not yet consumed"))(settlement);
        }
    }

    /// Registers a raw observer over any value-bearing terminal state,
    /// discarded (never invoked) should the subject become `Immortal`
    /// instead. Shared plumbing for `then`/`catch`/`finally`[`_do`] and
    /// their `unless` variants, all of which live in [`combinators`].
    pub(crate) fn register_value_raw<H>(&self, handler: H) -> ValueRegisterOutcome<V, F>
    where
        H: FnOnce(Settlement<V, F>) + Send + 'static,
    {
        let mut guarded = self.inner.guarded.lock();
        match &guarded.state {
            FutureState::CompletedWithResult(v) => {
                ValueRegisterOutcome::RunInline(Box::new(handler), Settlement::CompletedWithResult(v.clone()))
            }
            FutureState::Failed(f) => {
                ValueRegisterOutcome::RunInline(Box::new(handler), Settlement::Failed(f.clone()))
            }
            FutureState::Immortal => ValueRegisterOutcome::Discarded,
            FutureState::AbleToBeSet | FutureState::Flattening => {
                let handle = guarded.value_observers.insert(Box::new(handler));
                ValueRegisterOutcome::Registered(handle)
            }
        }
    }

    pub(crate) fn unregister_value_raw(&self, handle: ObserverHandle) {
        self.inner.guarded.lock().value_observers.remove(handle);
    }

    /// Walks the chain of `Flattening` targets starting at `start`, looking
    /// for `self`. Used by [`FutureSource::try_set_result_future`] to detect
    /// a would-be cycle before subscribing. Locks at most one future at a
    /// time — safe because `flatten_target` is write-once.
    fn is_in_flatten_chain_of(&self, start: &Future<V, F>) -> bool {
        let mut current = start.clone();
        loop {
            if Arc::ptr_eq(&current.inner, &self.inner) {
                return true;
            }

            let next = {
                let guarded = current.inner.guarded.lock();
                match guarded.state {
                    FutureState::Flattening => guarded.flatten_target.clone(),
                    _ => None,
                }
            };

            match next {
                Some(next) => current = next,
                None => return false,
            }
        }
    }
}

impl<V, F> FutureSource<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    pub fn future(&self) -> Future<V, F> {
        Future {
            inner: self.inner.clone(),
        }
    }

    /// Sets the result. Never collapses, even if `V` happens to itself be a
    /// [`Future`] (Rust's two-method split resolves the dynamically-typed
    /// "auto-collapse" ambiguity: use [`Self::try_set_result_future`] for
    /// the collapsing case). Returns `false` if already set.
    pub fn try_set_result(&self, v: V) -> bool {
        self.future().settle(Settlement::CompletedWithResult(v))
    }

    /// Sets the result to the eventual state of `inner_future`, flattening
    /// (adopting its terminal state) rather than wrapping it. Detects
    /// cycles: if `inner_future`'s flatten chain already contains `self`,
    /// `self` becomes `Immortal` instead, and the natural `settle_observers`
    /// cascade immortalises the rest of the cycle without any dedicated
    /// "walk and immortalise everything" routine.
    pub fn try_set_result_future(&self, inner_future: Future<V, F>) -> bool {
        let self_future = self.future();

        if self_future.is_in_flatten_chain_of(&inner_future) {
            tracing::trace!("flatten cycle detected, immortalising");
            return self_future.settle(Settlement::Immortal);
        }

        let became_flattening = {
            let mut guarded = self.inner.guarded.lock();
            match guarded.state {
                FutureState::AbleToBeSet => {
                    guarded.state = FutureState::Flattening;
                    guarded.flatten_target = Some(inner_future.clone());
                    true
                }
                _ => false,
            }
        };

        if !became_flattening {
            return false;
        }

        inner_future.subscribe_settlement(move |settlement| {
            self_future.settle(settlement);
        });

        true
    }

    /// Sets the failure. Never collapses, even if `F` happens to be a
    /// future (§4.D: "setting a failure never collapses").
    pub fn try_set_failure(&self, f: F) -> bool {
        self.future().settle(Settlement::Failed(f))
    }

    pub fn force_set_result(&self, v: V) -> Result<(), PreconditionError> {
        if self.try_set_result(v) {
            Ok(())
        } else {
            Err(PreconditionError::AlreadySet)
        }
    }

    pub fn force_set_failure(&self, f: F) -> Result<(), PreconditionError> {
        if self.try_set_failure(f) {
            Ok(())
        } else {
            Err(PreconditionError::AlreadySet)
        }
    }
}

impl<V, F> Drop for FutureSource<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    fn drop(&mut self) {
        let still_able_to_be_set = matches!(self.inner.guarded.lock().state, FutureState::AbleToBeSet);
        if still_able_to_be_set {
            tracing::trace!("future source dropped without setting a value, future is now immortal");
            self.future().settle(Settlement::Immortal);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_result_is_completed() {
        let future = Future::<i32, String>::with_result(7);
        assert!(future.has_result());
        assert_eq!(future.force_get_result().unwrap(), 7);
    }

    #[test]
    fn with_failure_is_failed() {
        let future = Future::<i32, String>::with_failure("boom".to_string());
        assert!(future.has_failed());
        assert_eq!(future.force_get_failure().unwrap(), "boom");
    }

    #[test]
    fn source_drop_without_set_immortalises() {
        let (source, future) = Future::<i32, String>::new_source();
        assert!(future.is_incomplete());
        drop(source);
        assert!(future.is_immortal());
    }

    #[test]
    fn repeated_try_set_result_returns_false() {
        let (source, future) = Future::<i32, String>::new_source();
        assert!(source.try_set_result(1));
        assert!(!source.try_set_result(2));
        assert_eq!(future.force_get_result().unwrap(), 1);
    }

    #[test]
    fn force_set_result_after_set_raises_precondition_error() {
        let (source, _future) = Future::<i32, String>::new_source();
        source.force_set_result(1).unwrap();
        assert!(matches!(
            source.force_set_result(2),
            Err(PreconditionError::AlreadySet)
        ));
    }

    #[test]
    fn flatten_adopts_inner_future_result() {
        let (outer_source, outer_future) = Future::<i32, String>::new_source();
        let (inner_source, inner_future) = Future::<i32, String>::new_source();

        outer_source.try_set_result_future(inner_future);
        assert!(outer_future.is_incomplete());

        inner_source.try_set_result(42);
        assert!(outer_future.has_result());
        assert_eq!(outer_future.force_get_result().unwrap(), 42);
    }

    #[test]
    fn direct_self_flatten_cycle_is_immortal() {
        let (source, future) = Future::<i32, String>::new_source();
        source.try_set_result_future(future.clone());
        assert!(future.is_immortal());
    }

    #[test]
    fn transitive_flatten_cycle_immortalises_whole_chain() {
        let (source_a, future_a) = Future::<i32, String>::new_source();
        let (source_b, future_b) = Future::<i32, String>::new_source();

        source_a.try_set_result_future(future_b.clone());
        source_b.try_set_result_future(future_a.clone());

        assert!(future_a.is_immortal());
        assert!(future_b.is_immortal());
    }

    #[test]
    fn flatten_source_drop_inherits_upstream_instead_of_immortalising() {
        let (outer_source, outer_future) = Future::<i32, String>::new_source();
        let (inner_source, inner_future) = Future::<i32, String>::new_source();

        outer_source.try_set_result_future(inner_future);
        drop(outer_source);
        assert!(outer_future.is_incomplete());

        inner_source.try_set_result(5);
        assert!(outer_future.has_result());
        assert_eq!(outer_future.force_get_result().unwrap(), 5);
    }

    #[test]
    fn terminal_eq_compares_by_value() {
        let a = Future::<i32, String>::with_result(1);
        let b = Future::<i32, String>::with_result(1);
        let c = Future::<i32, String>::with_result(2);

        assert!(a.terminal_eq(&b));
        assert!(!a.terminal_eq(&c));
    }

    #[test]
    fn terminal_eq_true_for_both_immortal() {
        let a = Future::<i32, String>::immortal();
        let b = Future::<i32, String>::immortal();
        assert!(a.terminal_eq(&b));
    }
}
