//! Shared Tokio runtime for timers and watchdogs.
//!
//! Every program shares one lazily-initialized runtime for its native timer
//! sleeps and its quota watchdog, instead of paying an OS thread per
//! program. The thread count can be configured through the
//! `VARHUB_PROGRAM_THREADS` environment variable, read once before the
//! first program is built.

use std::sync::LazyLock;

use tokio::runtime::Runtime;

/// Environment variable selecting the worker-thread count.
pub(crate) const ENV_PROGRAM_THREADS: &str = "VARHUB_PROGRAM_THREADS";

/// Two threads keep timer fires and watchdog ticks from starving each other.
const DEFAULT_WORKERS: usize = 2;

/// If runtime creation fails the `None` is cached permanently — no retry
/// mechanism, to avoid retry storms; program construction fails closed.
static SHARED_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    let workers = std::env::var(ENV_PROGRAM_THREADS)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_WORKERS);

    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("varhub-program")
        .enable_time()
        .build()
    {
        Ok(rt) => {
            tracing::debug!(workers, "initialized shared program runtime");
            Some(rt)
        }
        Err(e) => {
            tracing::error!("failed to create shared program runtime: {e}");
            None
        }
    }
});

/// Get the shared runtime, or `None` if it could not be built.
pub(crate) fn shared_runtime() -> Option<&'static Runtime> {
    SHARED_RUNTIME.as_ref()
}
