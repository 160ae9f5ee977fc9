//! Virtual timers: host-owned, guest-observable.
//!
//! The six timer globals are native functions installed on the main
//! context. Registration stores the guest callback as a persistent and
//! schedules a native sleep on the shared runtime; the sleep fires by
//! enqueueing a command, which serializes the callback dispatch with all
//! other engine work. Clearing removes the handle before the fire command
//! is processed, so a cleared timer never reaches its callback even when
//! the native sleep has already elapsed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use rquickjs::prelude::{Opt, Rest};
use rquickjs::{Ctx, Exception, Function, Persistent, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::program::service::Command;

/// The three timer families. Ids are unique per kind for the lifetime of
/// the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Timeout,
    Interval,
    Immediate,
}

impl TimerKind {
    fn index(self) -> usize {
        match self {
            TimerKind::Timeout => 0,
            TimerKind::Interval => 1,
            TimerKind::Immediate => 2,
        }
    }
}

/// Aborts the native sleep task on drop, whether from an explicit clear or
/// from table teardown.
struct TaskAbortGuard(JoinHandle<()>);

impl Drop for TaskAbortGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct TimerEntry {
    callback: Persistent<Function<'static>>,
    args: Vec<Persistent<Value<'static>>>,
    _task: Option<TaskAbortGuard>,
}

/// The pending-handle table, owned by the service thread.
#[derive(Default)]
pub(crate) struct TimerTable {
    next_id: [u32; 3],
    entries: [HashMap<u32, TimerEntry>; 3],
}

impl TimerTable {
    fn alloc(&mut self, kind: TimerKind) -> u32 {
        let slot = &mut self.next_id[kind.index()];
        *slot = slot.wrapping_add(1).max(1);
        *slot
    }

    fn remove(&mut self, kind: TimerKind, id: u32) -> Option<TimerEntry> {
        self.entries[kind.index()].remove(&id)
    }

    /// The callback and arguments for a fire, leaving interval entries in
    /// place so they keep firing until cleared.
    pub(crate) fn take_for_fire(
        &mut self,
        kind: TimerKind,
        id: u32,
    ) -> Option<(Persistent<Function<'static>>, Vec<Persistent<Value<'static>>>)> {
        match kind {
            TimerKind::Interval => {
                let entry = self.entries[kind.index()].get(&id)?;
                Some((entry.callback.clone(), entry.args.clone()))
            }
            _ => {
                let entry = self.remove(kind, id)?;
                Some((entry.callback, entry.args))
            }
        }
    }

    /// Drop every handle; native tasks abort through their guards and no
    /// callback can fire afterwards.
    pub(crate) fn clear_all(&mut self) {
        for entries in &mut self.entries {
            entries.clear();
        }
    }
}

/// Install the timer globals into a context.
pub(crate) fn install(
    ctx: &Ctx<'_>,
    table: Rc<RefCell<TimerTable>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    rt: tokio::runtime::Handle,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    for (set_name, clear_name, kind) in [
        ("setTimeout", "clearTimeout", TimerKind::Timeout),
        ("setInterval", "clearInterval", TimerKind::Interval),
        ("setImmediate", "clearImmediate", TimerKind::Immediate),
    ] {
        let set = {
            let table = table.clone();
            let cmd_tx = cmd_tx.clone();
            let rt = rt.clone();
            match kind {
                // no delay parameter; everything after the callback is an argument
                TimerKind::Immediate => Function::new(
                    ctx.clone(),
                    coerce_immediate_signature(move |ctx, callback, rest: Rest<_>| {
                        register(&ctx, &table, &cmd_tx, &rt, kind, callback, None, rest.0)
                    }),
                )?,
                _ => Function::new(
                    ctx.clone(),
                    coerce_set_signature(move |ctx, callback, delay: Opt<f64>, rest: Rest<_>| {
                        register(&ctx, &table, &cmd_tx, &rt, kind, callback, delay.0, rest.0)
                    }),
                )?,
            }
            .with_name(set_name)?
        };
        globals.set(set_name, set)?;

        let clear = {
            let table = table.clone();
            Function::new(
                ctx.clone(),
                coerce_clear_signature(move |id: Opt<_>| {
                    if let Some(id) = id.0.as_ref().and_then(Value::as_number) {
                        table.borrow_mut().remove(kind, id as u32);
                    }
                    Ok(())
                }),
            )?
            .with_name(clear_name)?
        };
        globals.set(clear_name, clear)?;
    }

    Ok(())
}

/// All parameter lifetimes must unify with the `Ctx` lifetime; without the
/// coercions Rust infers independent lifetimes for closure arguments.
fn coerce_set_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>, Opt<f64>, Rest<Value<'js>>) -> rquickjs::Result<u32>,
{
    f
}

fn coerce_immediate_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>, Rest<Value<'js>>) -> rquickjs::Result<u32>,
{
    f
}

fn coerce_clear_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Opt<Value<'js>>) -> rquickjs::Result<()>,
{
    f
}

fn register<'js>(
    ctx: &Ctx<'js>,
    table: &Rc<RefCell<TimerTable>>,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    rt: &tokio::runtime::Handle,
    kind: TimerKind,
    callback: Value<'js>,
    delay: Option<f64>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<u32> {
    let Some(callback) = callback.into_function() else {
        return Err(Exception::throw_type(ctx, "timer callback must be a function"));
    };

    let delay = delay.filter(|d| d.is_finite()).unwrap_or(0.0).max(0.0);
    let period = Duration::from_secs_f64(delay / 1000.0);

    let mut tbl = table.borrow_mut();
    let id = tbl.alloc(kind);
    let callback = Persistent::save(ctx, callback);
    let args = args.into_iter().map(|v| Persistent::save(ctx, v)).collect();

    // the time argument is ignored for immediates
    let task = match kind {
        TimerKind::Immediate => {
            let _ = cmd_tx.send(Command::FireTimer { kind, id });
            None
        }
        TimerKind::Timeout => {
            let cmd_tx = cmd_tx.clone();
            Some(TaskAbortGuard(rt.spawn(async move {
                tokio::time::sleep(period).await;
                let _ = cmd_tx.send(Command::FireTimer { kind, id });
            })))
        }
        TimerKind::Interval => {
            let cmd_tx = cmd_tx.clone();
            Some(TaskAbortGuard(rt.spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if cmd_tx.send(Command::FireTimer { kind, id }).is_err() {
                        break;
                    }
                }
            })))
        }
    };

    tbl.entries[kind.index()].insert(
        id,
        TimerEntry {
            callback,
            args,
            _task: task,
        },
    );
    Ok(id)
}
