//! §4.B: a one-shot, cancellable delay facility. `after_delay` is the only
//! thing in this crate built on top of it; the core otherwise stays out of
//! wall-clock concerns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Prevents a scheduled callback from running, if it hasn't already.
///
/// Best-effort: if the callback has already been dispatched, cancelling is
/// a no-op (matching spec.md §4.B).
pub trait CancelHandle: Send {
    fn cancel(&self);
}

/// Schedules a one-shot callback after a delay.
pub trait Timer: Send + Sync {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn CancelHandle>;
}

struct ThreadCancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle for ThreadCancelHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Reference [`Timer`] implementation: one detached thread per scheduled
/// callback, the same shape as `CancellationTokenSource::cancel_after` in
/// the `dgrunwald-rust-cancellation` reference crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimer;

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn CancelHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_thread = cancelled.clone();

        thread::spawn(move || {
            thread::sleep(delay);
            if !cancelled_for_thread.load(Ordering::SeqCst) {
                callback();
            }
        });

        Box::new(ThreadCancelHandle { cancelled })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let (tx, rx) = mpsc::channel();
        let timer = ThreadTimer;
        let _handle = timer.schedule(Duration::from_millis(10), Box::new(move || {
            let _ = tx.send(());
        }));

        rx.recv_timeout(Duration::from_secs(1)).expect("timer should fire");
    }

    #[test]
    fn cancel_prevents_callback() {
        let (tx, rx) = mpsc::channel();
        let timer = ThreadTimer;
        let handle = timer.schedule(Duration::from_millis(50), Box::new(move || {
            let _ = tx.send(());
        }));
        handle.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
