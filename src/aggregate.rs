//! §4.G: aggregation combinators built entirely on the core primitives —
//! `futureWithResult`/`futureWithFailure`, `afterDelay`, `finallyAll`,
//! `thenAll`, `orderedByCompletion`, `race`. Grounded on `NSArray+TOCFuture.h`
//! in the original source pack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::PreconditionError;
use crate::future::{Future, FutureOutcome, FutureSource};
use crate::timer::{CancelHandle, Timer};
use crate::token::combinators::cancel_token_source_until;
use crate::token::{CancellationToken, CancellationTokenSource};

/// `v` is already a future: this is the identity function (the collapse
/// law, §8: `futureWithResult(futureWithResult(v)) == futureWithResult(v)`).
/// Kept as a separate entry point (rather than overloading
/// [`future_with_result`]) per the crate's auto-collapse typing decision.
pub fn future_with_result_from_future<V, F>(future: Future<V, F>) -> Future<V, F> {
    future
}

/// A pre-completed future. Never collapses even if `V` happens to be a
/// future-shaped type — use [`future_with_result_from_future`] for that.
pub fn future_with_result<V, F>(v: V) -> Future<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    Future::with_result(v)
}

/// A pre-failed future. Failures never collapse (§4.D).
pub fn future_with_failure<V, F>(f: F) -> Future<V, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    Future::with_failure(f)
}

/// Resolves with `v` after `delay_seconds`. `0` resolves immediately;
/// `+inf` never resolves (an immortal future); negative or `NaN` is a
/// precondition failure. If `unless` cancels first, the timer is cancelled
/// and the returned future fails with `unless` as the failure value.
pub fn after_delay<V, F, T>(
    v: V,
    delay_seconds: f64,
    unless: Option<&CancellationToken>,
    timer: &T,
) -> Result<Future<V, F>, PreconditionError>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static + From<CancellationToken>,
    T: Timer + ?Sized,
{
    if delay_seconds.is_nan() || delay_seconds < 0.0 {
        return Err(PreconditionError::InvalidDelay(delay_seconds.to_string()));
    }
    if delay_seconds == 0.0 {
        return Ok(Future::with_result(v));
    }
    if delay_seconds.is_infinite() {
        return Ok(Future::immortal());
    }

    let (source, future) = Future::new_source();
    let source = Arc::new(source);
    let duration = Duration::from_secs_f64(delay_seconds);

    let source_for_timer = source.clone();
    let mut value_opt = Some(v);
    let cancel_handle: Box<dyn CancelHandle> = timer.schedule(
        duration,
        Box::new(move || {
            if let Some(v) = value_opt.take() {
                source_for_timer.try_set_result(v);
            }
        }),
    );
    let cancel_handle = Arc::new(Mutex::new(Some(cancel_handle)));

    if let Some(unless) = unless {
        let source_for_cancel = source.clone();
        let unless_clone = unless.clone();
        let cancel_handle_for_unless = cancel_handle.clone();
        unless.when_cancelled_do(move || {
            if let Some(handle) = cancel_handle_for_unless.lock().take() {
                handle.cancel();
            }
            source_for_cancel.try_set_failure(F::from(unless_clone));
        });
    }

    Ok(future)
}

/// Succeeds with the original input array once every input reaches a
/// value-bearing terminal state. `unless` shortcircuits to `Failed(unless)`.
/// Empty input succeeds immediately with an empty array.
pub fn finally_all<V, F>(inputs: Vec<Future<V, F>>, unless: Option<&CancellationToken>) -> Future<Vec<Future<V, F>>, F>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static + From<CancellationToken>,
{
    let (source, future) = Future::new_source();
    if inputs.is_empty() {
        source.try_set_result(Vec::new());
        return future;
    }

    let source = Arc::new(source);
    let remaining = Arc::new(AtomicUsize::new(inputs.len()));
    let inputs_for_result = inputs.clone();

    if let Some(unless) = unless {
        let source_for_cancel = source.clone();
        let unless_clone = unless.clone();
        unless.when_cancelled_do(move || {
            source_for_cancel.try_set_failure(F::from(unless_clone));
        });
    }

    for input in &inputs {
        let remaining = remaining.clone();
        let source = source.clone();
        let inputs_for_result = inputs_for_result.clone();
        input.finally_do(
            move |_outcome| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    source.try_set_result(inputs_for_result);
                }
            },
            unless,
        );
    }

    future
}

/// Failure shape for [`then_all`]: either some input failed (carrying every
/// completed input future, per §4.G), or `unless` shortcircuited the whole
/// aggregate.
#[derive(Clone)]
pub enum ThenAllFailure<V, F> {
    SomeFailed(Vec<Future<V, F>>),
    Cancelled(CancellationToken),
}

impl<V, F> From<CancellationToken> for ThenAllFailure<V, F> {
    fn from(token: CancellationToken) -> Self {
        ThenAllFailure::Cancelled(token)
    }
}

/// Like [`finally_all`], but succeeds with the array of results only if
/// every input succeeded; otherwise fails with the array of completed
/// input futures.
pub fn then_all<V, F>(
    inputs: Vec<Future<V, F>>,
    unless: Option<&CancellationToken>,
) -> Future<Vec<V>, ThenAllFailure<V, F>>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    let (source, future) = Future::new_source();
    if inputs.is_empty() {
        source.try_set_result(Vec::new());
        return future;
    }

    let source = Arc::new(source);
    let remaining = Arc::new(AtomicUsize::new(inputs.len()));
    let inputs_for_result = inputs.clone();

    if let Some(unless) = unless {
        let source_for_cancel = source.clone();
        let unless_clone = unless.clone();
        unless.when_cancelled_do(move || {
            source_for_cancel.try_set_failure(ThenAllFailure::Cancelled(unless_clone));
        });
    }

    for input in &inputs {
        let remaining = remaining.clone();
        let source = source.clone();
        let inputs_for_result = inputs_for_result.clone();
        input.finally_do(
            move |_outcome| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let all_succeeded = inputs_for_result.iter().all(|f| f.has_result());
                    if all_succeeded {
                        let results = inputs_for_result
                            .iter()
                            .map(|f| f.force_get_result().expect("checked has_result above"))
                            .collect();
                        source.try_set_result(results);
                    } else {
                        source.try_set_failure(ThenAllFailure::SomeFailed(inputs_for_result));
                    }
                }
            },
            unless,
        );
    }

    future
}

fn forward_outcome<V, F>(input: &Future<V, F>, source: &FutureSource<V, F>)
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    if let Ok(v) = input.force_get_result() {
        source.try_set_result(v);
    } else if let Ok(f) = input.force_get_failure() {
        source.try_set_failure(f);
    }
}

/// Returns one fresh future per input, each resolving with the
/// corresponding input's result/failure in *completion* order rather than
/// input order. Inputs already terminal at call time are assigned slots
/// synchronously, preserving their original relative order.
pub fn ordered_by_completion<V, F>(inputs: Vec<Future<V, F>>, unless: Option<&CancellationToken>) -> Vec<Future<V, F>>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static + From<CancellationToken>,
{
    let outputs: Vec<(FutureSource<V, F>, Future<V, F>)> = inputs.iter().map(|_| Future::new_source()).collect();
    let output_futures: Vec<Future<V, F>> = outputs.iter().map(|(_, f)| f.clone()).collect();
    let sources: Arc<Vec<FutureSource<V, F>>> = Arc::new(outputs.into_iter().map(|(s, _)| s).collect());
    let next_slot = Arc::new(AtomicUsize::new(0));

    for input in &inputs {
        if input.has_result() || input.has_failed() {
            let slot_index = next_slot.fetch_add(1, Ordering::AcqRel);
            if let Some(source) = sources.get(slot_index) {
                forward_outcome(input, source);
            }
        }
    }

    for input in &inputs {
        if input.has_result() || input.has_failed() {
            continue;
        }

        let sources = sources.clone();
        let next_slot = next_slot.clone();
        input.finally_do(
            move |outcome| {
                let slot_index = next_slot.fetch_add(1, Ordering::AcqRel);
                if let Some(source) = sources.get(slot_index) {
                    match outcome {
                        FutureOutcome::Result(v) => {
                            source.try_set_result(v);
                        }
                        FutureOutcome::Failure(f) => {
                            source.try_set_failure(f);
                        }
                    }
                }
            },
            unless,
        );
    }

    output_futures
}

/// A starter closure: given a fresh, `until`-rooted cancel token, initiates
/// an asynchronous operation and returns its future.
pub type Starter<V, F> = Box<dyn FnOnce(CancellationToken) -> Future<V, F> + Send>;

/// Runs every starter concurrently. The first to reach a result-bearing
/// terminal wins: its result is adopted, and **every** per-starter token is
/// cancelled, including the winner's (the winner is responsible for
/// cleaning up its own result when its token cancels, even post-completion).
/// If every starter fails, the race fails with the array of their futures.
pub fn race<V, F>(starters: Vec<Starter<V, F>>, until: &CancellationToken) -> Future<V, Vec<Future<V, F>>>
where
    V: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    let (race_source, race_future) = Future::new_source();
    let race_source = Arc::new(race_source);

    let per_starter_sources: Arc<Vec<CancellationTokenSource>> =
        Arc::new(starters.iter().map(|_| cancel_token_source_until(until)).collect());
    let per_starter_tokens: Vec<CancellationToken> = per_starter_sources.iter().map(|s| s.token()).collect();

    let starter_futures: Vec<Future<V, F>> = starters
        .into_iter()
        .zip(per_starter_tokens.into_iter())
        .map(|(starter, token)| starter(token))
        .collect();

    let remaining = Arc::new(AtomicUsize::new(starter_futures.len()));
    let starter_futures_for_failure = starter_futures.clone();

    for future in &starter_futures {
        let race_source = race_source.clone();
        let remaining = remaining.clone();
        let per_starter_sources = per_starter_sources.clone();
        let starter_futures_for_failure = starter_futures_for_failure.clone();

        future.finally_do(
            move |outcome| match outcome {
                FutureOutcome::Result(v) => {
                    for source in per_starter_sources.iter() {
                        source.cancel();
                    }
                    race_source.try_set_result(v);
                }
                FutureOutcome::Failure(_) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        for source in per_starter_sources.iter() {
                            source.cancel();
                        }
                        race_source.try_set_failure(starter_futures_for_failure);
                    }
                }
            },
            None,
        );
    }

    race_future
}
