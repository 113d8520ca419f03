use std::{path::PathBuf, sync::Arc, time::Duration};

use portal_wire::Resolver;
use tracing::{info, warn};

/// Process-wide configuration threaded explicitly into client/server/batch
/// builders, replacing the Python source's module-level `CONTEXT` global
/// (`portal/contextlib.py`, `portal/utils.py`).
pub struct Context {
    init_hooks: Vec<Box<dyn Fn() + Send + Sync>>,
    resolver: Resolver,
    errfile: Option<PathBuf>,
}

impl Default for Context {
    fn default() -> Self {
        Self { init_hooks: Vec::new(), resolver: Arc::new(|host, port| (host.to_string(), port)), errfile: None }
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Runs every registered init hook, in registration order.
    pub fn run_init_hooks(&self) {
        for hook in &self.init_hooks {
            hook();
        }
    }

    pub fn resolver(&self) -> Resolver {
        self.resolver.clone()
    }

    /// Spawns the error-file watcher if one is configured. The watcher
    /// thread polls for the file's existence and calls `std::process::exit`
    /// the moment it appears, mirroring `Context._watcher`/`Context.shutdown`
    /// from the Python source.
    pub fn spawn_errfile_watcher(self: &Arc<Self>) -> Option<std::thread::JoinHandle<()>> {
        let path = self.errfile.clone()?;
        Some(std::thread::Builder::new().name("portal-errfile-watcher".to_string()).spawn(move || {
            loop {
                if path.exists() {
                    warn!(path = %path.display(), "error file detected, exiting process");
                    std::process::exit(1);
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }).expect("failed to spawn errfile watcher"))
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    init_hooks: Vec<Box<dyn Fn() + Send + Sync>>,
    resolver: Option<Resolver>,
    errfile: Option<PathBuf>,
}

impl ContextBuilder {
    pub fn with_init_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.init_hooks.push(Box::new(hook));
        self
    }

    pub fn with_resolver(mut self, resolver: impl Fn(&str, u16) -> (String, u16) + Send + Sync + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_errfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.errfile = Some(path.into());
        self
    }

    pub fn build(self) -> Arc<Context> {
        let ctx = Arc::new(Context {
            init_hooks: self.init_hooks,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(|host, port| (host.to_string(), port))),
            errfile: self.errfile,
        });
        ctx.run_init_hooks();
        if ctx.errfile.is_some() {
            info!("error-file watcher armed");
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn init_hooks_run_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();
        let _ctx = Context::builder()
            .with_init_hook(move || a.lock().unwrap().push(1))
            .with_init_hook(move || b.lock().unwrap().push(2))
            .build();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn default_resolver_is_identity() {
        let ctx = Context::builder().build();
        assert_eq!((ctx.resolver())("example", 80), ("example".to_string(), 80));
    }

    #[test]
    fn errfile_watcher_exits_process_is_not_exercised_directly() {
        // Spawning the watcher without an errfile configured is a no-op.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let ctx = Context::builder().with_init_hook(move || { c.fetch_add(1, Ordering::SeqCst); }).build();
        assert!(ctx.spawn_errfile_watcher().is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
