//! Cancellable, auto-flattening futures.
//!
//! Two tightly-coupled primitives: a [`token::CancellationToken`] (a
//! one-shot notification that some scope's work should be abandoned) and a
//! [`future::Future`] (an eventual value that either succeeds with a result
//! or fails with a failure). Both are backed by a `Source` type that
//! uniquely owns the write capability and immortalises its subject on drop
//! if nothing was ever written.
//!
//! Futures auto-collapse: setting a result that is itself a future adopts
//! that future's terminal state rather than wrapping it, transitively, with
//! cycle detection that immortalises an entire flatten chain rather than
//! deadlocking or panicking.
//!
//! `Dispatcher` and `Timer` (see [`dispatcher`] and [`timer`]) are the
//! crate's only external seams — thread/queue and wall-clock facilities the
//! core treats as interfaces rather than depending on a concrete runtime.

pub mod aggregate;
pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod future;
mod observer;
pub mod timer;
pub mod token;

pub use error::PreconditionError;
pub use future::{Future, FutureOutcome, FutureSource, FutureStateKind};
pub use token::{CancellationToken, CancellationTokenSource, TokenState};
