//! CPU wall-time accounting and the quota watchdog.
//!
//! A guest in a tight loop cannot be interrupted by the engine's own
//! microtasks; the only reclamation primitive is killing the whole program.
//! The service thread accounts every engine entry into an atomic wall-time
//! counter; the watchdog samples it from the shared runtime and disposes
//! the program when one sampling window shows more continuous guest
//! execution than the quota allows. Programs are never resumed after this
//! path fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Weak};
use std::time::Instant;

use crate::metrics::{METRIC_WATCHDOG_REASON_LABEL, METRIC_WATCHDOG_TERMINATIONS};
use crate::program::{self, QuotaOptions, Shared};

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Monotonic counter of time spent inside the engine, readable from any
/// thread. The in-progress slice is visible through the anchor, so a guest
/// that never yields still advances the observable value.
#[derive(Default)]
pub(crate) struct WallClock {
    accum_ns: AtomicU64,
    /// Non-zero while the service thread is inside the engine.
    anchor_ns: AtomicU64,
    depth: AtomicU64,
}

impl WallClock {
    pub(crate) fn enter_scope(&self) -> ExecGuard<'_> {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.anchor_ns.store(now_ns().max(1), Ordering::SeqCst);
        }
        ExecGuard(self)
    }

    fn exit(&self) {
        if self.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            let anchor = self.anchor_ns.swap(0, Ordering::SeqCst);
            if anchor != 0 {
                self.accum_ns
                    .fetch_add(now_ns().saturating_sub(anchor), Ordering::SeqCst);
            }
        }
    }

    /// Accumulated engine time plus the in-progress slice, in nanoseconds.
    pub(crate) fn value_ns(&self) -> u64 {
        let accum = self.accum_ns.load(Ordering::SeqCst);
        let anchor = self.anchor_ns.load(Ordering::SeqCst);
        if anchor == 0 {
            accum
        } else {
            accum + now_ns().saturating_sub(anchor)
        }
    }
}

/// RAII scope for one engine entry.
pub(crate) struct ExecGuard<'a>(&'a WallClock);

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Start the watchdog for a program. It holds only a weak reference, so
/// normal disposal does not require its cooperation; it also stops on its
/// own once it observes disposal.
pub(crate) fn spawn(rt: &tokio::runtime::Runtime, shared: Weak<Shared>, quota: QuotaOptions) {
    rt.spawn(async move {
        let max_delta_ns = quota.max_delta.as_nanos() as u64;
        let mut previous = 0u64;
        loop {
            tokio::time::sleep(quota.checkout).await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.is_disposed() {
                break;
            }
            let wall = shared.wall.value_ns();
            if wall.saturating_sub(previous) > max_delta_ns {
                metrics::counter!(
                    METRIC_WATCHDOG_TERMINATIONS,
                    METRIC_WATCHDOG_REASON_LABEL => "cpu-wall-time"
                )
                .increment(1);
                tracing::warn!(
                    busy_ms = (wall - previous) / 1_000_000,
                    limit_ms = quota.max_delta.as_millis() as u64,
                    "guest exceeded its execution quota, disposing program"
                );
                program::dispose_shared(&shared);
                break;
            }
            previous = wall;
        }
    });
}
