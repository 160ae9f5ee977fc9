//! The program: one engine, two contexts, and the host-facing surface.

pub(crate) mod module;
pub(crate) mod service;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Level, instrument};

use crate::bridge::{self, HostFunction};
use crate::error::ProgramError;
use crate::inspector::InspectorSession;
use crate::metrics::ProgramMetricsGuard;
use crate::source::{SourceProvider, SourceText};
use crate::watchdog::{self, WallClock};
use crate::{rt, Result};

use self::module::ProgramModule;
use self::service::{Command, Service};

/// Quota enforced by the watchdog.
#[derive(Debug, Clone, Copy)]
pub struct QuotaOptions {
    /// Sampling interval.
    pub checkout: Duration,
    /// Maximum continuous guest execution observed in one sampling window
    /// before the program is disposed.
    pub max_delta: Duration,
}

impl Default for QuotaOptions {
    fn default() -> Self {
        Self {
            checkout: Duration::from_secs(10),
            max_delta: Duration::from_secs(2),
        }
    }
}

/// Construction options for a [`Program`].
#[derive(Debug, Clone)]
pub struct ProgramOptions {
    /// Hard cap on the engine heap, in mebibytes.
    pub memory_limit_mb: usize,
    /// Whether inspector sessions may be created.
    pub inspector: bool,
    /// Watchdog quota.
    pub quota: QuotaOptions,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            memory_limit_mb: 8,
            inspector: false,
            quota: QuotaOptions::default(),
        }
    }
}

impl ProgramOptions {
    /// Set the engine heap cap.
    pub fn with_memory_limit_mb(mut self, limit: usize) -> Self {
        self.memory_limit_mb = limit;
        self
    }

    /// Enable inspector sessions.
    pub fn with_inspector(mut self, inspector: bool) -> Self {
        self.inspector = inspector;
        self
    }

    /// Replace the watchdog quota.
    pub fn with_quota(mut self, quota: QuotaOptions) -> Self {
        self.quota = quota;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.memory_limit_mb == 0 {
            return Err(ProgramError::internal("memory limit must be non-zero"));
        }
        if self.quota.checkout.is_zero() || self.quota.max_delta.is_zero() {
            return Err(ProgramError::internal("quota durations must be non-zero"));
        }
        Ok(())
    }
}

type DisposeHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct HookList {
    next_id: u64,
    entries: Vec<(u64, DisposeHook)>,
}

/// State shared between the program handle, its modules, the service
/// thread, the watchdog and inspector sessions.
pub(crate) struct Shared {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    /// Set once teardown begins; guards hook execution.
    disposing: AtomicBool,
    /// Observable disposed flag, set after hooks have run.
    disposed: AtomicBool,
    /// Read by the engine interrupt handler; once set, guest execution
    /// aborts and never resumes.
    pub(crate) kill: Arc<AtomicBool>,
    pub(crate) wall: WallClock,
    hooks: Mutex<HookList>,
    dispose_tx: watch::Sender<bool>,
    builtins: Mutex<HashSet<String>>,
    pub(crate) inspector_enabled: bool,
}

impl Shared {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_builtin(&self, name: &str) -> bool {
        lock(&self.builtins).contains(name)
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<()> {
        if self.is_disposed() {
            return Err(ProgramError::IsolateDisposed);
        }
        self.cmd_tx
            .send(cmd)
            .map_err(|_| ProgramError::IsolateDisposed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Register a dispose hook; runs immediately when teardown already began.
pub(crate) fn add_dispose_hook(shared: &Shared, hook: DisposeHook) -> u64 {
    if shared.disposing.load(Ordering::SeqCst) {
        run_hook(hook);
        return 0;
    }
    let mut hooks = lock(&shared.hooks);
    hooks.next_id += 1;
    let id = hooks.next_id;
    hooks.entries.push((id, hook));
    id
}

pub(crate) fn remove_dispose_hook(shared: &Shared, id: u64) -> bool {
    let mut hooks = lock(&shared.hooks);
    let before = hooks.entries.len();
    hooks.entries.retain(|(hook_id, _)| *hook_id != id);
    hooks.entries.len() != before
}

fn run_hook(hook: DisposeHook) {
    if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
        tracing::warn!("dispose hook panicked");
    }
}

/// Tear a program down: hooks in insertion order (errors swallowed), then
/// the engine, then the flag, then the event — exactly once.
pub(crate) fn dispose_shared(shared: &Shared) {
    if shared.disposing.swap(true, Ordering::SeqCst) {
        return;
    }
    let hooks = std::mem::take(&mut *lock(&shared.hooks));
    for (_, hook) in hooks.entries {
        run_hook(hook);
    }
    shared.kill.store(true, Ordering::SeqCst);
    let _ = shared.cmd_tx.send(Command::Dispose);
    shared.disposed.store(true, Ordering::SeqCst);
    shared.dispose_tx.send_replace(true);
}

/// An isolated guest program: one engine with a hard memory cap, a guest
/// and a helper context, a lazy module graph, virtual timers, a
/// maybe-async host bridge and a CPU watchdog.
///
/// All engine access funnels through a dedicated service thread; dropping
/// the handle disposes the program.
pub struct Program {
    shared: Arc<Shared>,
    _metrics: ProgramMetricsGuard,
}

impl Program {
    /// Build a program over a source provider.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub fn new(provider: impl SourceProvider, options: ProgramOptions) -> Result<Self> {
        options.validate()?;
        let runtime = rt::shared_runtime()
            .ok_or_else(|| ProgramError::internal("shared program runtime unavailable"))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dispose_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cmd_tx,
            disposing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            kill: Arc::new(AtomicBool::new(false)),
            wall: WallClock::default(),
            hooks: Mutex::new(HookList::default()),
            dispose_tx,
            builtins: Mutex::new(HashSet::new()),
            inspector_enabled: options.inspector,
        });

        let (init_tx, init_rx) = std::sync::mpsc::channel();
        let thread_shared = shared.clone();
        let handle = runtime.handle().clone();
        let thread_options = options.clone();
        std::thread::Builder::new()
            .name("varhub-program".into())
            .spawn(move || {
                match Service::init(Box::new(provider), &thread_options, thread_shared, handle) {
                    Ok(service) => {
                        let _ = init_tx.send(Ok(()));
                        service.run(cmd_rx);
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| ProgramError::internal(format!("failed to spawn service thread: {e}")))?;
        init_rx
            .recv()
            .map_err(|_| ProgramError::internal("service thread died during init"))??;

        watchdog::spawn(runtime, Arc::downgrade(&shared), options.quota);

        Ok(Self {
            shared,
            _metrics: ProgramMetricsGuard::new(),
        })
    }

    /// Resolve a module lazily; idempotent, and aliases share handles.
    #[instrument(err(Debug), skip(self), level = Level::DEBUG)]
    pub async fn get_module(&self, descriptor: &str) -> Result<ProgramModule> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::LoadModule {
            descriptor: descriptor.to_string(),
            reply,
        })?;
        let info = rx.await.map_err(|_| ProgramError::IsolateDisposed)??;
        Ok(ProgramModule::new(self.shared.clone(), info))
    }

    /// Insert source under a fixed name and evaluate it. Fails with
    /// [`ModuleAlreadyExists`](ProgramError::ModuleAlreadyExists) if the
    /// name is tracked in any state; the first request's outcome is never
    /// changed by a duplicate.
    #[instrument(err(Debug), skip(self, source), level = Level::DEBUG)]
    pub async fn create_module(
        &self,
        name: &str,
        source: impl Into<String>,
        kind: Option<&str>,
    ) -> Result<ProgramModule> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::CreateModule {
            name: name.to_string(),
            text: SourceText {
                kind: kind.map(str::to_string),
                text: source.into(),
            },
            reply,
        })?;
        let info = rx.await.map_err(|_| ProgramError::IsolateDisposed)??;
        Ok(ProgramModule::new(self.shared.clone(), info))
    }

    /// Bind a user module as the RPC form through the `varhub:rpc` builtin:
    /// evaluates a helper in the main context that imports both and calls
    /// the builtin's exported `start(form)`.
    #[instrument(err(Debug), skip(self), level = Level::DEBUG)]
    pub async fn start_rpc(&self, module: &str) -> Result<Json> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::StartRpc {
            module: module.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Expose a host function to guest imports of `module`.
    ///
    /// Functions registered before the module's first import become its
    /// exports; the wrapper preserves the sync-return / sync-throw /
    /// promise trichotomy of [`HostCallResult`](crate::HostCallResult).
    pub fn register_host_function(
        &self,
        module: &str,
        name: &str,
        func: HostFunction,
    ) -> Result<()> {
        if module.is_empty() || module.contains('#') {
            return Err(ProgramError::internal(format!(
                "invalid host module name: {module:?}"
            )));
        }
        if !bridge::is_export_name(name) {
            return Err(ProgramError::internal(format!(
                "invalid host function name: {name:?}"
            )));
        }
        self.shared.send(Command::RegisterHostFunction {
            module: module.to_string(),
            name: name.to_string(),
            func,
        })
    }

    /// Toggle a module's membership in the privileged set that may import
    /// other modules' private (`#`) submodules.
    pub fn set_builtin_module_name(&self, name: &str, on: bool) {
        let mut builtins = lock(&self.shared.builtins);
        if on {
            builtins.insert(name.to_string());
        } else {
            builtins.remove(name);
        }
    }

    /// Open an inspector session. Fails unless the program was built with
    /// [`ProgramOptions::inspector`].
    pub fn create_inspector_session(&self) -> Result<InspectorSession> {
        InspectorSession::create(&self.shared)
    }

    /// Request a collection cycle on the service thread.
    pub fn run_gc(&self) {
        let _ = self.shared.send(Command::RunGc);
    }

    /// Register a dispose hook; hooks run in insertion order during
    /// disposal and their panics are swallowed. Returns an id usable with
    /// [`remove_dispose_hook`](Self::remove_dispose_hook); a hook
    /// registered after disposal runs immediately and returns 0.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) -> u64 {
        add_dispose_hook(&self.shared, Box::new(hook))
    }

    /// Unregister a dispose hook.
    pub fn remove_dispose_hook(&self, id: u64) -> bool {
        remove_dispose_hook(&self.shared, id)
    }

    /// Dispose the program: every hook runs once, outstanding timers are
    /// cancelled, in-flight guest work is abandoned and pending host calls
    /// reject with [`IsolateDisposed`](ProgramError::IsolateDisposed).
    /// Idempotent.
    pub fn dispose(&self) {
        dispose_shared(&self.shared);
    }

    /// Whether the program has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Wait for the dispose event; resolves immediately on a disposed
    /// program.
    pub async fn disposed(&self) {
        let mut rx = self.shared.dispose_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        dispose_shared(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(ProgramOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_quota_is_rejected() {
        let options = ProgramOptions::default().with_quota(QuotaOptions {
            checkout: Duration::ZERO,
            max_delta: Duration::from_secs(1),
        });
        assert!(options.validate().is_err());
    }

    #[test]
    fn zero_memory_limit_is_rejected() {
        assert!(
            ProgramOptions::default()
                .with_memory_limit_mb(0)
                .validate()
                .is_err()
        );
    }
}
