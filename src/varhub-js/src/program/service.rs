//! The service thread: sole owner of the engine.
//!
//! Every engine entry — module loads, method calls, timer fires, settled
//! host futures, inspector evaluations — arrives here as a command, so at
//! most one guest stack executes at a time and host callbacks invoked by
//! guest code run synchronously before control returns to the guest. After
//! each command the service drains the engine job queue and re-polls calls
//! parked on pending promises.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc as std_mpsc;

use rquickjs::{
    CatchResultExt, CaughtError, Context, Function, Module, Object, Persistent, Promise, Runtime,
    Value,
};
use serde_json::{Value as Json, json};
use tokio::sync::{mpsc, oneshot};

use crate::bridge::timers::{self, TimerKind, TimerTable};
use crate::bridge::{self, BridgeState, BridgeUserData, HostFunction, HostRegistry};
use crate::error::ProgramError;
use crate::graph::{self, GraphState, ModuleInfo, ModuleReply, ProgramLoader, ProgramResolver, SlotState};
use crate::program::{ProgramOptions, Shared};
use crate::source::{SourceFetch, SourceProvider, SourceText};
use crate::stubs::SafeStubs;

pub(crate) type CallReplyTx = oneshot::Sender<Result<Json, ProgramError>>;

/// Everything the service thread can be asked to do.
pub(crate) enum Command {
    LoadModule {
        descriptor: String,
        reply: ModuleReply,
    },
    CreateModule {
        name: String,
        text: SourceText,
        reply: ModuleReply,
    },
    RegisterHostFunction {
        module: String,
        name: String,
        func: HostFunction,
    },
    StartRpc {
        module: String,
        reply: CallReplyTx,
    },
    CallMethod {
        module: String,
        prop: String,
        this: Option<Json>,
        args: Vec<Json>,
        /// `None` for fire-and-forget dispatch; errors are swallowed.
        reply: Option<CallReplyTx>,
    },
    GetProp {
        module: String,
        prop: String,
        reply: CallReplyTx,
    },
    GetKeys {
        module: String,
        reply: oneshot::Sender<Result<Vec<String>, ProgramError>>,
    },
    GetType {
        module: String,
        prop: String,
        reply: std_mpsc::Sender<Result<Option<String>, ProgramError>>,
    },
    FireTimer {
        kind: TimerKind,
        id: u32,
    },
    SettleHostCall {
        id: u64,
        outcome: Result<Json, Json>,
    },
    Inspector {
        message: Json,
        out: mpsc::UnboundedSender<String>,
    },
    RunGc,
    Dispose,
}

/// A host call whose guest result is a pending promise; re-polled after
/// every command until the engine settles it.
struct ParkedJob {
    promise: Persistent<Promise<'static>>,
    kind: ParkKind,
}

enum ParkKind {
    Call { reply: Option<CallReplyTx> },
    ModuleEval { name: String, session: u64 },
    Script { session: u64, reply: CallReplyTx },
}

enum Polled {
    Pending,
    Done(Json),
    Failed(ProgramError),
}

enum CallFlow {
    Done(Json),
    Parked(Persistent<Promise<'static>>),
}

pub(crate) struct Service {
    runtime: Runtime,
    main: Context,
    /// Kept so the helper realm outlives its compiled stubs.
    _safe: Context,
    stubs: Rc<SafeStubs>,
    graph: Rc<RefCell<GraphState>>,
    registry: HostRegistry,
    timers: Rc<RefCell<TimerTable>>,
    parked: Vec<ParkedJob>,
    bridge: Rc<BridgeState>,
    shared: Arc<Shared>,
}

impl Service {
    pub(crate) fn init(
        provider: Box<dyn SourceProvider>,
        options: &ProgramOptions,
        shared: Arc<Shared>,
        rt: tokio::runtime::Handle,
    ) -> Result<Self, ProgramError> {
        let runtime = Runtime::new()
            .map_err(|e| ProgramError::internal(format!("failed to create runtime: {e}")))?;
        runtime.set_memory_limit(options.memory_limit_mb.saturating_mul(1024 * 1024));
        runtime.set_max_stack_size(256 * 1024);

        let kill = shared.kill.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || kill.load(Ordering::Relaxed))));

        let main = Context::full(&runtime)
            .map_err(|e| ProgramError::internal(format!("failed to create main context: {e}")))?;
        let safe = Context::full(&runtime)
            .map_err(|e| ProgramError::internal(format!("failed to create safe context: {e}")))?;

        let stubs = Rc::new(SafeStubs::compile(&safe)?);
        let graph = Rc::new(RefCell::new(GraphState::new(provider)));
        let registry = HostRegistry::default();
        let bridge = Rc::new(BridgeState::new(shared.cmd_tx.clone(), rt.clone()));
        let timers = Rc::new(RefCell::new(TimerTable::default()));

        runtime.set_loader(
            ProgramResolver {
                graph: graph.clone(),
                registry: registry.clone(),
                shared: shared.clone(),
            },
            ProgramLoader {
                graph: graph.clone(),
                registry: registry.clone(),
            },
        );

        main.with(|ctx| -> Result<(), ProgramError> {
            ctx.store_userdata(BridgeUserData {
                registry: registry.clone(),
                stubs: stubs.clone(),
                state: bridge.clone(),
            })
            .map_err(|_| ProgramError::internal("failed to install bridge state"))?;
            timers::install(&ctx, timers.clone(), shared.cmd_tx.clone(), rt.clone())
                .map_err(|e| ProgramError::internal(format!("failed to install timers: {e}")))?;
            Ok(())
        })?;

        Ok(Self {
            runtime,
            main,
            _safe: safe,
            stubs,
            graph,
            registry,
            timers,
            parked: Vec::new(),
            bridge,
            shared,
        })
    }

    pub(crate) fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.blocking_recv() {
            if self.shared.is_disposed() || self.shared.kill.load(Ordering::Relaxed) {
                if matches!(cmd, Command::Dispose) {
                    break;
                }
                reject(cmd);
                continue;
            }
            match cmd {
                Command::LoadModule { descriptor, reply } => self.handle_load(descriptor, reply),
                Command::CreateModule { name, text, reply } => {
                    self.handle_create(name, text, reply)
                }
                Command::RegisterHostFunction { module, name, func } => {
                    if self.graph.borrow().contains(&module) {
                        tracing::warn!(module, name, "host function registered after module load");
                    }
                    self.registry.add(module, name, func);
                }
                Command::StartRpc { module, reply } => self.handle_start_rpc(module, reply),
                Command::CallMethod {
                    module,
                    prop,
                    this,
                    args,
                    reply,
                } => self.handle_call(module, prop, this, args, reply),
                Command::GetProp {
                    module,
                    prop,
                    reply,
                } => {
                    let _ = reply.send(self.handle_get_prop(&module, &prop));
                }
                Command::GetKeys { module, reply } => {
                    let _ = reply.send(self.handle_get_keys(&module));
                }
                Command::GetType {
                    module,
                    prop,
                    reply,
                } => {
                    let _ = reply.send(self.handle_get_type(&module, &prop));
                }
                Command::FireTimer { kind, id } => self.handle_fire_timer(kind, id),
                Command::SettleHostCall { id, outcome } => self.handle_settle(id, outcome),
                Command::Inspector { message, out } => self.handle_inspector(message, out),
                Command::RunGc => self.main.with(|ctx| ctx.run_gc()),
                Command::Dispose => break,
            }
            self.pump();
        }
        self.shutdown();
    }

    // ---- modules ---------------------------------------------------------

    fn handle_load(&mut self, descriptor: String, reply: ModuleReply) {
        // cache hit on either key, in any state
        enum Hit {
            Done(Result<ModuleInfo, ProgramError>),
            Miss,
        }
        let hit = {
            let mut graph = self.graph.borrow_mut();
            match graph.slot_index(&descriptor) {
                Some(idx) => {
                    let settled = match &graph.slot(idx).state {
                        SlotState::Ready => {
                            let slot = graph.slot(idx);
                            Some(Ok(ModuleInfo {
                                name: slot.canonical.clone(),
                                deps: slot.deps.clone(),
                            }))
                        }
                        SlotState::Failed(e) => Some(Err(e.clone())),
                        SlotState::Loading => None,
                    };
                    match settled {
                        Some(outcome) => Hit::Done(outcome),
                        None => {
                            let (canonical, session) = {
                                let slot = graph.slot(idx);
                                (slot.canonical.clone(), slot.session)
                            };
                            graph.slot_mut(idx).waiters.push(reply);
                            drop(graph);
                            self.drive_orphaned_load(canonical, session);
                            return;
                        }
                    }
                }
                None => Hit::Miss,
            }
        };
        match hit {
            Hit::Done(outcome) => {
                let _ = reply.send(outcome);
            }
            Hit::Miss => {
                let (session, resolved) = {
                    let mut graph = self.graph.borrow_mut();
                    let session = graph.begin_session();
                    let resolved = if self.registry.contains_module(&descriptor) {
                        graph
                            .insert_new(&descriptor, None)
                            .map(|_| descriptor.clone())
                    } else {
                        graph.resolve_descriptor(&descriptor, None)
                    };
                    (session, resolved)
                };
                let canonical = match resolved {
                    Ok(name) => name,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                // the descriptor may alias a module already tracked
                let fresh = {
                    let graph = self.graph.borrow();
                    let idx = graph.slot_index(&canonical).expect("slot just resolved");
                    let slot = graph.slot(idx);
                    match &slot.state {
                        SlotState::Ready => {
                            let _ = reply.send(Ok(ModuleInfo {
                                name: slot.canonical.clone(),
                                deps: slot.deps.clone(),
                            }));
                            return;
                        }
                        SlotState::Failed(e) => {
                            let _ = reply.send(Err(e.clone()));
                            return;
                        }
                        SlotState::Loading => slot.session == session,
                    }
                };
                if !fresh {
                    // pending under an earlier session; settle together
                    let slot_session = {
                        let mut graph = self.graph.borrow_mut();
                        let idx = graph.slot_index(&canonical).expect("slot just resolved");
                        let slot_session = graph.slot(idx).session;
                        graph.slot_mut(idx).waiters.push(reply);
                        slot_session
                    };
                    self.drive_orphaned_load(canonical, slot_session);
                    return;
                }
                self.evaluate_root(canonical, session, reply);
            }
        }
    }

    fn handle_create(&mut self, name: String, text: SourceText, reply: ModuleReply) {
        let inserted = {
            let mut graph = self.graph.borrow_mut();
            let session = graph.begin_session();
            graph
                .insert_new(&name, Some(SourceFetch::Ready(text)))
                .map(|_| session)
        };
        match inserted {
            Ok(session) => self.evaluate_root(name, session, reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Declare and evaluate a root module, settling its whole load session
    /// or parking on its evaluation promise.
    fn evaluate_root(&mut self, canonical: String, session: u64, reply: ModuleReply) {
        let graph = self.graph.clone();
        let registry = self.registry.clone();
        let shared = self.shared.clone();
        let outcome = self.main.with(|ctx| -> Result<CallFlow, ProgramError> {
            let _guard = shared.wall.enter_scope();
            let module = graph::declare_module(&ctx, &graph, &registry, &canonical)?;
            let (_module, promise) = match module.eval().catch(&ctx) {
                Ok(evaluated) => evaluated,
                Err(caught) => return Err(self.module_error(&ctx, &canonical, caught)),
            };
            match promise.finish::<Value>().catch(&ctx) {
                Ok(_) => Ok(CallFlow::Done(Json::Null)),
                Err(CaughtError::Error(rquickjs::Error::WouldBlock)) => {
                    Ok(CallFlow::Parked(Persistent::save(&ctx, promise)))
                }
                Err(caught) => Err(self.module_error(&ctx, &canonical, caught)),
            }
        });
        match outcome {
            Ok(CallFlow::Done(_)) => {
                self.graph.borrow_mut().settle_session(session, Ok(()));
                let graph = self.graph.borrow();
                let outcome = match graph.slot_index(&canonical) {
                    Some(idx) => {
                        let slot = graph.slot(idx);
                        Ok(ModuleInfo {
                            name: slot.canonical.clone(),
                            deps: slot.deps.clone(),
                        })
                    }
                    None => Err(ProgramError::internal("module vanished during load")),
                };
                let _ = reply.send(outcome);
            }
            Ok(CallFlow::Parked(promise)) => {
                let mut graph = self.graph.borrow_mut();
                if let Some(idx) = graph.slot_index(&canonical) {
                    graph.slot_mut(idx).waiters.push(reply);
                }
                self.parked.push(ParkedJob {
                    promise,
                    kind: ParkKind::ModuleEval {
                        name: canonical,
                        session,
                    },
                });
            }
            Err(e) => {
                self.graph.borrow_mut().settle_session(session, Err(e.clone()));
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Re-drive a loading slot that has no active root parked for its
    /// session. Guest-driven dynamic imports create such slots: the engine
    /// owns their evaluation, but no host request would otherwise settle
    /// their graph state.
    fn drive_orphaned_load(&mut self, canonical: String, session: u64) {
        let driven = self.parked.iter().any(|job| match &job.kind {
            ParkKind::ModuleEval { session: s, .. } | ParkKind::Script { session: s, .. } => {
                *s == session
            }
            ParkKind::Call { .. } => false,
        });
        if driven {
            return;
        }
        let shared = self.shared.clone();
        let flow = self.main.with(|ctx| -> Result<CallFlow, ProgramError> {
            let _guard = shared.wall.enter_scope();
            let promise = Module::import(&ctx, canonical.as_str())
                .catch(&ctx)
                .map_err(|e| self.module_error(&ctx, &canonical, e))?;
            match promise.finish::<Value>().catch(&ctx) {
                Ok(_) => Ok(CallFlow::Done(Json::Null)),
                Err(CaughtError::Error(rquickjs::Error::WouldBlock)) => {
                    Ok(CallFlow::Parked(Persistent::save(&ctx, promise)))
                }
                Err(caught) => Err(self.module_error(&ctx, &canonical, caught)),
            }
        });
        match flow {
            Ok(CallFlow::Done(_)) => {
                self.graph.borrow_mut().settle_session(session, Ok(()));
            }
            Ok(CallFlow::Parked(promise)) => {
                self.parked.push(ParkedJob {
                    promise,
                    kind: ParkKind::ModuleEval {
                        name: canonical,
                        session,
                    },
                });
            }
            Err(e) => {
                self.graph.borrow_mut().settle_session(session, Err(e));
            }
        }
    }

    /// Map a caught module failure, preferring the typed error the graph
    /// recorded while the engine drove resolution.
    fn module_error(&self, ctx: &rquickjs::Ctx<'_>, name: &str, caught: CaughtError<'_>) -> ProgramError {
        if let Some(typed) = self.graph.borrow_mut().take_error() {
            return typed;
        }
        if self.shared.kill.load(Ordering::Relaxed) {
            return ProgramError::IsolateDisposed;
        }
        match caught {
            CaughtError::Error(e) => ProgramError::Instantiate {
                name: name.to_string(),
                message: e.to_string(),
            },
            other => ProgramError::Evaluate {
                name: name.to_string(),
                message: caught_to_string(&other),
            },
        }
    }

    // ---- namespace operations -------------------------------------------

    /// The canonical name of a module that is tracked and evaluated.
    fn lookup_ready(&self, module: &str) -> Result<String, ProgramError> {
        let graph = self.graph.borrow();
        let Some(idx) = graph.slot_index(module) else {
            return Err(ProgramError::internal(format!(
                "module {module} is not tracked by this program"
            )));
        };
        let slot = graph.slot(idx);
        match &slot.state {
            SlotState::Ready => Ok(slot.canonical.clone()),
            SlotState::Failed(e) => Err(e.clone()),
            SlotState::Loading => Err(ProgramError::internal(format!(
                "module {module} is still loading"
            ))),
        }
    }

    fn with_namespace<R>(
        &self,
        module: &str,
        f: impl for<'js> FnOnce(&rquickjs::Ctx<'js>, Object<'js>) -> Result<R, ProgramError>,
    ) -> Result<R, ProgramError> {
        let canonical = self.lookup_ready(module)?;
        let shared = self.shared.clone();
        self.main.with(|ctx| {
            let _guard = shared.wall.enter_scope();
            let namespace: Object = Module::import(&ctx, canonical.as_str())
                .catch(&ctx)
                .and_then(|promise| promise.finish().catch(&ctx))
                .map_err(|e| {
                    ProgramError::internal(format!(
                        "failed to reach namespace of {canonical}: {}",
                        caught_to_string(&e)
                    ))
                })?;
            f(&ctx, namespace)
        })
    }

    fn handle_call(
        &mut self,
        module: String,
        prop: String,
        this: Option<Json>,
        args: Vec<Json>,
        reply: Option<CallReplyTx>,
    ) {
        let stubs = self.stubs.clone();
        let shared = self.shared.clone();
        let flow = self.with_namespace(&module, |ctx, namespace| {
            let apply = SafeStubs::restore(&stubs.apply, ctx)
                .map_err(|e| ProgramError::internal(format!("apply stub lost: {e}")))?;
            let this_value = match &this {
                Some(v) => bridge::json_in(ctx, v)
                    .map_err(|e| ProgramError::internal(format!("bad this value: {e}")))?,
                None => Value::new_undefined(ctx.clone()),
            };
            let args_value = bridge::json_in(ctx, &Json::Array(args))
                .map_err(|e| ProgramError::internal(format!("bad arguments: {e}")))?;
            let result: Result<Value, _> = apply
                .call((namespace, prop.as_str(), this_value, args_value))
                .catch(ctx);
            match result {
                Ok(value) => settle_value(ctx, &shared, value),
                Err(caught) => Err(guest_error(ctx, &shared, caught)),
            }
        });
        match flow {
            Ok(CallFlow::Done(value)) => send_call_reply(reply, Ok(value)),
            Ok(CallFlow::Parked(promise)) => self.parked.push(ParkedJob {
                promise,
                kind: ParkKind::Call { reply },
            }),
            Err(e) => send_call_reply(reply, Err(e)),
        }
    }

    fn handle_get_prop(&self, module: &str, prop: &str) -> Result<Json, ProgramError> {
        let stubs = self.stubs.clone();
        let shared = self.shared.clone();
        self.with_namespace(module, |ctx, namespace| {
            let getter = SafeStubs::restore(&stubs.prop, ctx)
                .map_err(|e| ProgramError::internal(format!("prop stub lost: {e}")))?;
            let result: Result<Value, _> = getter.call((namespace, prop)).catch(ctx);
            match result {
                Ok(value) => bridge::json_out(ctx, &value)
                    .map_err(|e| ProgramError::internal(format!("unserializable export: {e}"))),
                Err(caught) => Err(guest_error(ctx, &shared, caught)),
            }
        })
    }

    fn handle_get_keys(&self, module: &str) -> Result<Vec<String>, ProgramError> {
        let stubs = self.stubs.clone();
        let shared = self.shared.clone();
        self.with_namespace(module, |ctx, namespace| {
            let keys = SafeStubs::restore(&stubs.keys, ctx)
                .map_err(|e| ProgramError::internal(format!("keys stub lost: {e}")))?;
            let result: Result<Vec<String>, _> = keys.call((namespace,)).catch(ctx);
            result.map_err(|caught| guest_error(ctx, &shared, caught))
        })
    }

    fn handle_get_type(&self, module: &str, prop: &str) -> Result<Option<String>, ProgramError> {
        let stubs = self.stubs.clone();
        let shared = self.shared.clone();
        self.with_namespace(module, |ctx, namespace| {
            let kind_of = SafeStubs::restore(&stubs.kind_of, ctx)
                .map_err(|e| ProgramError::internal(format!("kindOf stub lost: {e}")))?;
            let result: Result<Option<String>, _> = kind_of.call((namespace, prop)).catch(ctx);
            result.map_err(|caught| guest_error(ctx, &shared, caught))
        })
    }

    // ---- rpc bootstrap ---------------------------------------------------

    fn handle_start_rpc(&mut self, module: String, reply: CallReplyTx) {
        let (session, resolved) = {
            let mut graph = self.graph.borrow_mut();
            let session = graph.begin_session();
            let resolved = if self.registry.contains_module(&module) {
                Ok(module.clone())
            } else {
                graph.resolve_descriptor(&module, None)
            };
            (session, resolved)
        };
        let canonical = match resolved {
            Ok(name) => name,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let module_lit = match serde_json::to_string(&canonical) {
            Ok(lit) => lit,
            Err(e) => {
                let _ = reply.send(Err(ProgramError::internal(format!("bad module name: {e}"))));
                return;
            }
        };
        // binds the user module as the rpc form through the builtin's start
        let bootstrap = format!(
            "import(\"varhub:rpc\").then(async (rpc) => rpc.start(await import({module_lit})))"
        );

        let shared = self.shared.clone();
        let flow = self.main.with(|ctx| -> Result<CallFlow, ProgramError> {
            let _guard = shared.wall.enter_scope();
            let result: Result<Value, _> = ctx.eval(bootstrap).catch(&ctx);
            match result {
                Ok(value) => settle_value(&ctx, &shared, value),
                Err(caught) => Err(guest_error(&ctx, &shared, caught)),
            }
        });
        match flow {
            Ok(CallFlow::Done(value)) => {
                self.graph.borrow_mut().settle_session(session, Ok(()));
                let _ = reply.send(Ok(value));
            }
            Ok(CallFlow::Parked(promise)) => self.parked.push(ParkedJob {
                promise,
                kind: ParkKind::Script { session, reply },
            }),
            Err(e) => {
                // a typed resolution failure beats the generic rejection
                let e = self.graph.borrow_mut().take_error().unwrap_or(e);
                self.graph
                    .borrow_mut()
                    .settle_session(session, Err(e.clone()));
                let _ = reply.send(Err(e));
            }
        }
    }

    // ---- timers and host futures ----------------------------------------

    fn handle_fire_timer(&mut self, kind: TimerKind, id: u32) {
        let Some((callback, args)) = self.timers.borrow_mut().take_for_fire(kind, id) else {
            // cleared between the native fire and this dispatch
            return;
        };
        let shared = self.shared.clone();
        self.main.with(|ctx| {
            let _guard = shared.wall.enter_scope();
            let restored: rquickjs::Result<(Function, Vec<Value>)> = (|| {
                let callback = callback.restore(&ctx)?;
                let args = args
                    .into_iter()
                    .map(|a| a.restore(&ctx))
                    .collect::<rquickjs::Result<Vec<_>>>()?;
                Ok((callback, args))
            })();
            let Ok((callback, args)) = restored else {
                return;
            };
            let result: Result<Value, _> = callback.call((rquickjs::prelude::Rest(args),)).catch(&ctx);
            if let Err(caught) = result {
                tracing::warn!(
                    "uncaught error in timer callback: {}",
                    caught_to_string(&caught)
                );
            }
        });
    }

    fn handle_settle(&mut self, id: u64, outcome: Result<Json, Json>) {
        let Some(resolve) = self.bridge.pending.borrow_mut().remove(&id) else {
            return;
        };
        let shared = self.shared.clone();
        self.main.with(|ctx| {
            let _guard = shared.wall.enter_scope();
            let status = json!({
                "rejected": outcome.is_err(),
                "value": match outcome { Ok(v) | Err(v) => v },
            });
            let settled: rquickjs::Result<()> = (|| {
                let resolve = resolve.restore(&ctx)?;
                let status = bridge::json_in(&ctx, &status)?;
                resolve.call::<_, ()>((status,))
            })();
            if let Err(e) = settled {
                tracing::warn!("failed to settle host call {id}: {e}");
            }
        });
    }

    // ---- inspector backend ----------------------------------------------

    fn handle_inspector(&mut self, message: Json, out: mpsc::UnboundedSender<String>) {
        let id = message.get("id").cloned().unwrap_or(Json::Null);
        let method = message
            .get("method")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let response = match method {
            "Runtime.evaluate" => {
                let expression = message["params"]["expression"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let shared = self.shared.clone();
                let evaluated = self.main.with(|ctx| {
                    let _guard = shared.wall.enter_scope();
                    let result: Result<Value, _> = ctx.eval(expression).catch(&ctx);
                    match result {
                        Ok(value) => {
                            let tag = type_tag(&value);
                            let copied = bridge::json_out(&ctx, &value).unwrap_or(Json::Null);
                            Ok((tag, copied))
                        }
                        Err(caught) => Err(caught_to_string(&caught)),
                    }
                });
                match evaluated {
                    Ok((tag, value)) => json!({
                        "id": id,
                        "result": { "result": { "type": tag, "value": value } },
                    }),
                    Err(text) => json!({
                        "id": id,
                        "result": { "exceptionDetails": { "text": text } },
                    }),
                }
            }
            _ => json!({ "id": id, "result": {} }),
        };
        let _ = out.send(response.to_string());
    }

    // ---- queue maintenance ----------------------------------------------

    /// Drain the engine job queue, then re-poll parked promises.
    fn pump(&mut self) {
        self.drain_jobs();
        self.check_parked();
        // a resolution error the guest swallowed (caught dynamic import)
        // must not leak into the next command's failure
        let _ = self.graph.borrow_mut().take_error();
    }

    fn drain_jobs(&self) {
        let _guard = self.shared.wall.enter_scope();
        loop {
            if !self.runtime.is_job_pending() {
                break;
            }
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("guest job raised: {e:?}");
                }
            }
        }
    }

    fn check_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let jobs = std::mem::take(&mut self.parked);
        let mut kept = Vec::new();
        for job in jobs {
            let shared = self.shared.clone();
            let graph = self.graph.clone();
            let polled = self.main.with(|ctx| {
                let _guard = shared.wall.enter_scope();
                let promise = match job.promise.clone().restore(&ctx) {
                    Ok(p) => p,
                    Err(e) => {
                        return Polled::Failed(ProgramError::internal(format!(
                            "parked promise lost: {e}"
                        )));
                    }
                };
                match promise.finish::<Value>().catch(&ctx) {
                    Ok(value) => match bridge::json_out(&ctx, &value) {
                        Ok(json) => Polled::Done(json),
                        Err(e) => Polled::Failed(ProgramError::internal(format!(
                            "unserializable result: {e}"
                        ))),
                    },
                    Err(CaughtError::Error(rquickjs::Error::WouldBlock)) => Polled::Pending,
                    Err(caught) => {
                        if let Some(typed) = graph.borrow_mut().take_error() {
                            Polled::Failed(typed)
                        } else {
                            Polled::Failed(guest_error(&ctx, &shared, caught))
                        }
                    }
                }
            });
            match polled {
                Polled::Pending => kept.push(job),
                Polled::Done(value) => self.settle_parked(job.kind, Ok(value)),
                Polled::Failed(e) => self.settle_parked(job.kind, Err(e)),
            }
        }
        self.parked.extend(kept);
    }

    fn settle_parked(&mut self, kind: ParkKind, outcome: Result<Json, ProgramError>) {
        match kind {
            ParkKind::Call { reply } => send_call_reply(reply, outcome),
            ParkKind::ModuleEval { name, session } => {
                let session_result = match &outcome {
                    Ok(_) => Ok(()),
                    Err(ProgramError::Guest(v)) => Err(ProgramError::Evaluate {
                        name,
                        message: v.to_string(),
                    }),
                    Err(e) => Err(e.clone()),
                };
                self.graph.borrow_mut().settle_session(session, session_result);
            }
            ParkKind::Script { session, reply } => {
                let session_result = match &outcome {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.clone()),
                };
                self.graph.borrow_mut().settle_session(session, session_result);
                let _ = reply.send(outcome);
            }
        }
    }

    // ---- teardown --------------------------------------------------------

    fn shutdown(&mut self) {
        self.timers.borrow_mut().clear_all();
        self.bridge.pending.borrow_mut().clear();
        for job in std::mem::take(&mut self.parked) {
            self.settle_parked(job.kind, Err(ProgramError::IsolateDisposed));
        }
        self.graph
            .borrow_mut()
            .fail_all_loading(&ProgramError::IsolateDisposed);
        // contexts and the runtime drop with self; every persistent above is
        // gone first, and the stub persistents held through the context
        // userdata are released during context teardown
    }
}

/// Resolve a call result: copy plain values out, finish promise results,
/// park promises the engine cannot settle yet.
fn settle_value<'js>(
    ctx: &rquickjs::Ctx<'js>,
    shared: &Arc<Shared>,
    value: Value<'js>,
) -> Result<CallFlow, ProgramError> {
    let Some(promise) = value.as_promise() else {
        return bridge::json_out(ctx, &value)
            .map(CallFlow::Done)
            .map_err(|e| ProgramError::internal(format!("unserializable result: {e}")));
    };
    match promise.finish::<Value>().catch(ctx) {
        Ok(inner) => bridge::json_out(ctx, &inner)
            .map(CallFlow::Done)
            .map_err(|e| ProgramError::internal(format!("unserializable result: {e}"))),
        Err(CaughtError::Error(rquickjs::Error::WouldBlock)) => {
            Ok(CallFlow::Parked(Persistent::save(ctx, promise.clone())))
        }
        Err(caught) => Err(guest_error(ctx, shared, caught)),
    }
}

/// Copy a guest-thrown value across the boundary verbatim; `Error` objects
/// cross as `{name, message, stack}` records. A kill-flagged program maps
/// every engine fault to `IsolateDisposed`.
fn guest_error<'js>(
    ctx: &rquickjs::Ctx<'js>,
    shared: &Arc<Shared>,
    caught: CaughtError<'js>,
) -> ProgramError {
    if shared.kill.load(Ordering::Relaxed) {
        return ProgramError::IsolateDisposed;
    }
    match caught {
        CaughtError::Exception(exception) => {
            let name: Option<String> = exception.get("name").ok().flatten();
            let message: Option<String> = exception.get("message").ok().flatten();
            let stack: Option<String> = exception.get("stack").ok().flatten();
            ProgramError::Guest(json!({
                "name": name.unwrap_or_else(|| "Error".into()),
                "message": message.unwrap_or_default(),
                "stack": stack,
            }))
        }
        CaughtError::Value(value) => {
            ProgramError::Guest(bridge::json_out(ctx, &value).unwrap_or(Json::Null))
        }
        CaughtError::Error(e) => ProgramError::internal(format!("engine fault: {e}")),
    }
}

/// Human-readable rendering of a caught engine failure.
pub(crate) fn caught_to_string(caught: &CaughtError<'_>) -> String {
    match caught {
        CaughtError::Error(e) => e.to_string(),
        CaughtError::Exception(exception) => {
            let message: Option<String> = exception.get("message").ok().flatten();
            message.unwrap_or_else(|| "unknown exception".into())
        }
        CaughtError::Value(value) => format!("{value:?}"),
    }
}

fn type_tag(value: &Value<'_>) -> &'static str {
    use rquickjs::Type;
    match value.type_of() {
        Type::Undefined | Type::Uninitialized => "undefined",
        Type::Null => "object",
        Type::Bool => "boolean",
        Type::Int | Type::Float => "number",
        Type::String => "string",
        Type::Symbol => "symbol",
        Type::Function | Type::Constructor => "function",
        Type::BigInt => "bigint",
        _ => "object",
    }
}

fn send_call_reply(reply: Option<CallReplyTx>, outcome: Result<Json, ProgramError>) {
    match reply {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => {
            if let Err(e) = outcome {
                tracing::warn!("ignored guest dispatch failed: {e}");
            }
        }
    }
}

/// Fail a command that arrived after disposal began.
fn reject(cmd: Command) {
    let err = ProgramError::IsolateDisposed;
    match cmd {
        Command::LoadModule { reply, .. } | Command::CreateModule { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::StartRpc { reply, .. } | Command::GetProp { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::CallMethod { reply, .. } => send_call_reply(reply, Err(err)),
        Command::GetKeys { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::GetType { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Inspector { .. }
        | Command::RegisterHostFunction { .. }
        | Command::FireTimer { .. }
        | Command::SettleHostCall { .. }
        | Command::RunGc
        | Command::Dispose => {}
    }
}
