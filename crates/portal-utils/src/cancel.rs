use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cooperative cancellation signal handed to worker/post functions.
///
/// The Python source can asynchronously abort a blocking worker thread
/// (`ctypes.PyThreadState_SetAsyncExc`). Safe Rust has no equivalent, so
/// long-running work is expected to poll `is_cancelled()` in its own loops;
/// `ThreadPool::close` sets this and then waits out the timeout rather than
/// forcing termination.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
