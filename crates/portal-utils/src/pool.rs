use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError, unbounded};
use thiserror::Error;

use crate::{CancelToken, Thread};

type BoxJob = Box<dyn FnOnce(&CancelToken) + Send>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("thread pool is closed")]
    Closed,
}

/// Slot a submitted job's result lands in once a worker runs it.
struct Slot<T> {
    done: std::sync::atomic::AtomicBool,
    value: Mutex<Option<T>>,
}

/// Handle to a job submitted to a [`ThreadPool`].
///
/// Mirrors the Python source's `concurrent.futures.Future` as used by
/// `poollib.ThreadPool`: a cheap, cloneable token you can poll or block on.
pub struct JobHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> JobHandle<T> {
    pub fn is_done(&self) -> bool {
        self.slot.done.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Blocks until the job completes and returns its result. Panics if
    /// called twice and the result was already taken by a prior call.
    pub fn wait(&self) -> T {
        while !self.is_done() {
            std::thread::sleep(Duration::from_micros(50));
        }
        self.slot
            .value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .expect("JobHandle result already taken")
    }

    /// Blocks up to `timeout`, returning the result if the job finished in
    /// time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let start = std::time::Instant::now();
        while !self.is_done() {
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
        self.slot.value.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
    }
}

/// Marker type for jobs that don't produce a useful result.
pub type Job = JobHandle<()>;

/// Fixed-size worker pool draining a shared job queue.
///
/// Grounded on the Python source's `poollib.ThreadPool`: a small number of
/// named worker threads pull closures off a queue and run them to
/// completion. `close` asks workers to stop after their current job and
/// waits up to a timeout rather than force-killing them.
pub struct ThreadPool {
    name: String,
    tx: Option<Sender<BoxJob>>,
    workers: Vec<Thread>,
    cancel: CancelToken,
}

impl ThreadPool {
    pub fn new(workers: usize, name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx): (Sender<BoxJob>, Receiver<BoxJob>) = unbounded();
        let cancel = CancelToken::new();
        let threads = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                let worker_cancel = cancel.clone();
                Thread::spawn(format!("{name}-{i}"), move |_| {
                    while let Ok(job) = rx.recv() {
                        job(&worker_cancel);
                    }
                })
            })
            .collect();
        Self { name, tx: Some(tx), workers: threads, cancel }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` to run on the next free worker, returning a handle to its
    /// result.
    pub fn submit<T, F>(&self, f: F) -> Result<JobHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let Some(tx) = &self.tx else { return Err(PoolError::Closed) };
        let slot = Arc::new(Slot { done: std::sync::atomic::AtomicBool::new(false), value: Mutex::new(None) });
        let handle = JobHandle { slot: slot.clone() };
        let job: BoxJob = Box::new(move |cancel: &CancelToken| {
            let result = f(cancel);
            *slot.value.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(result);
            slot.done.store(true, std::sync::atomic::Ordering::Release);
        });
        match tx.try_send(job) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed),
            Err(TrySendError::Full(_)) => unreachable!("unbounded channel cannot be full"),
        }
    }

    /// Stops accepting new jobs, signals cancellation, and waits up to
    /// `timeout` (None = forever) for workers to drain. Workers still alive
    /// after the deadline are detached with a warning rather than killed.
    pub fn close(&mut self, timeout: Option<Duration>) {
        self.cancel.cancel();
        self.tx.take();
        match timeout {
            None => {
                for worker in &mut self.workers {
                    worker.join(None);
                }
            }
            Some(timeout) => {
                let start = std::time::Instant::now();
                for worker in &mut self.workers {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    worker.join(Some(remaining));
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.close(Some(Duration::from_millis(200)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_runs_and_returns_result() {
        let pool = ThreadPool::new(2, "test-pool");
        let handle = pool.submit(|_| 2 + 2).expect("submit");
        assert_eq!(handle.wait(), 4);
    }

    #[test]
    fn many_jobs_drain_across_workers() {
        let pool = ThreadPool::new(4, "test-pool");
        let handles: Vec<_> = (0..32).map(|i| pool.submit(move |_| i * i).expect("submit")).collect();
        let results: Vec<_> = handles.iter().map(JobHandle::wait).collect();
        assert_eq!(results, (0..32).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn submit_after_close_errors() {
        let mut pool = ThreadPool::new(1, "test-pool");
        pool.close(Some(Duration::from_millis(50)));
        assert!(matches!(pool.submit(|_| ()), Err(PoolError::Closed)));
    }

    #[test]
    fn job_can_observe_cancellation() {
        let pool = ThreadPool::new(1, "test-pool");
        let handle = pool.submit(|cancel| {
            let start = std::time::Instant::now();
            while !cancel.is_cancelled() && start.elapsed() < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(5));
            }
            cancel.is_cancelled()
        });
        drop(pool);
        assert!(handle.expect("submit").wait_timeout(Duration::from_secs(1)).unwrap_or(false));
    }
}
