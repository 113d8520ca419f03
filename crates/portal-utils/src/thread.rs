use std::{thread::JoinHandle, time::Duration};

use tracing::warn;

use crate::CancelToken;

/// Thin wrapper around a daemon-style worker thread.
///
/// Mirrors the Python source's `portal.thread.Thread`: a named background
/// thread that can be asked to stop and then joined with a bounded timeout.
/// Rust gives up the source's hard `kill()` (async thread abort); instead the
/// thread body is handed a [`CancelToken`] it is expected to poll.
pub struct Thread {
    name: String,
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `f` on a new OS thread named `name`. `f` receives the
    /// [`CancelToken`] that [`Thread::stop`] sets.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let name = name.into();
        let stop = CancelToken::new();
        let handle = {
            let stop = stop.clone();
            let spawn_name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || f(stop))
                .unwrap_or_else(|e| panic!("failed to spawn thread {spawn_name}: {e}"))
        };
        Self { name, stop, handle: Some(handle) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the thread's [`CancelToken`] without waiting for it to exit.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits up to `timeout` (None = forever) for the thread to finish.
    /// Returns whether it finished. Does not signal `stop` itself; call
    /// [`Thread::stop`] first if the thread checks the token.
    pub fn join(&mut self, timeout: Option<Duration>) -> bool {
        if self.handle.is_none() {
            return true;
        }
        match timeout {
            None => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
            Some(timeout) => {
                let start = std::time::Instant::now();
                loop {
                    if self.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                        if let Some(handle) = self.handle.take() {
                            let _ = handle.join();
                        }
                        return true;
                    }
                    if start.elapsed() >= timeout {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(5).min(timeout));
                }
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            if !self.join(Some(Duration::from_millis(100))) {
                warn!(thread = %self.name, "thread still running at drop, detaching");
            }
        }
    }
}
