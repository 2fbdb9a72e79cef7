//! §4.A: an external capability that runs a closure "on" a logical thread.
//!
//! The core is agnostic to how a dispatcher is built; it only needs to be
//! able to ask "is there a dispatcher bound to the calling thread right now"
//! at registration sites, so that [`crate::token`] can honor the
//! thread-affinity guarantee described in spec.md §4.C/§5.

use std::cell::RefCell;
use std::sync::Arc;

/// Runs a closure "on" whatever thread/queue this dispatcher represents.
pub trait Dispatcher: Send + Sync {
    fn run(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs the job synchronously, on whichever thread calls `run`.
///
/// Used by tests and as the default when no thread-affinity is needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn run(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

thread_local! {
    static CURRENT_DISPATCHER: RefCell<Option<Arc<dyn Dispatcher>>> = const { RefCell::new(None) };
}

/// Returns the dispatcher bound to the calling thread, if any.
pub fn current_dispatcher() -> Option<Arc<dyn Dispatcher>> {
    CURRENT_DISPATCHER.with(|cell| cell.borrow().clone())
}

fn set_current_dispatcher(dispatcher: Option<Arc<dyn Dispatcher>>) -> Option<Arc<dyn Dispatcher>> {
    CURRENT_DISPATCHER.with(|cell| cell.replace(dispatcher))
}

/// Restores the previously bound dispatcher (if any) when dropped.
pub struct DispatcherGuard {
    previous: Option<Arc<dyn Dispatcher>>,
}

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        set_current_dispatcher(self.previous.take());
    }
}

/// Binds `dispatcher` as the calling thread's current dispatcher for the
/// lifetime of the returned guard. This is how a caller identifies "the
/// current main thread" for the purposes of §4.A's thread-affinity
/// guarantee: bind once near the top of that thread, then every
/// `whenCancelledDo` registered from it will fire through `dispatcher`.
pub fn bind_current_thread_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> DispatcherGuard {
    let previous = set_current_dispatcher(Some(dispatcher));
    DispatcherGuard { previous }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDispatcher(AtomicUsize);

    impl Dispatcher for CountingDispatcher {
        fn run(&self, job: Box<dyn FnOnce() + Send>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            job();
        }
    }

    #[test]
    fn no_dispatcher_bound_by_default() {
        assert!(current_dispatcher().is_none());
    }

    #[test]
    fn bound_dispatcher_is_visible_until_guard_drops() {
        let counting: Arc<dyn Dispatcher> = Arc::new(CountingDispatcher(AtomicUsize::new(0)));
        {
            let _guard = bind_current_thread_dispatcher(counting.clone());
            assert!(current_dispatcher().is_some());
        }
        assert!(current_dispatcher().is_none());
    }
}
