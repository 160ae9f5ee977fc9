//! The value bridge: host functions callable from guest code.
//!
//! A registered host function is exposed to the guest as an import from its
//! module name. The guest-facing function is produced by the safe-context
//! wrapper around an inner native function, so the result trichotomy is
//! preserved across the boundary: a synchronous return stays synchronous, a
//! synchronous error is a synchronous throw, and a future becomes a promise
//! that resolves or rejects with the copied value.
//!
//! The inner native function packages every call result as an envelope
//! `{isError, isPromise, get}`; the wrapper unpacks it on the guest side.
//! Future results settle a safe-constructed deferred with a
//! `{rejected, value}` status record once the host future completes.

pub(crate) mod timers;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use rquickjs::module::{Declarations, Exports, ModuleDef};
use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, JsLifetime, Object, Persistent, Value};
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::graph::HOST_CORE;
use crate::program::service::Command;
use crate::stubs::SafeStubs;

/// The outcome of one host-function invocation.
pub enum HostCallResult {
    /// Synchronous value; the guest call returns it.
    Value(Json),
    /// Synchronous error; the guest call throws it.
    Error(Json),
    /// Deferred outcome; the guest call returns a promise that resolves
    /// with `Ok` or rejects with `Err` once the future completes.
    Future(Pin<Box<dyn Future<Output = Result<Json, Json>> + Send>>),
}

/// A host function callable from guest code.
///
/// Arguments arrive as JSON copies of what the guest passed; the result is
/// copied back the same way. The closure runs on the program's service
/// thread, synchronously within the guest call.
#[derive(Clone)]
pub struct HostFunction {
    #[allow(clippy::type_complexity)]
    func: std::sync::Arc<dyn Fn(Vec<Json>) -> HostCallResult + Send + Sync>,
}

impl HostFunction {
    /// A host function with full control over the outcome.
    pub fn new(func: impl Fn(Vec<Json>) -> HostCallResult + Send + Sync + 'static) -> Self {
        Self {
            func: std::sync::Arc::new(func),
        }
    }

    /// A synchronous host function; `Err` becomes a guest-side throw of the
    /// carried value.
    pub fn from_sync(
        func: impl Fn(Vec<Json>) -> Result<Json, Json> + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |args| match func(args) {
            Ok(v) => HostCallResult::Value(v),
            Err(e) => HostCallResult::Error(e),
        })
    }

    pub(crate) fn invoke(&self, args: Vec<Json>) -> HostCallResult {
        (self.func)(args)
    }
}

/// The table of registered host-function modules. Lives on the service
/// thread; registration arrives over the command channel.
#[derive(Clone, Default)]
pub(crate) struct HostRegistry {
    modules: Rc<RefCell<HashMap<String, HashMap<String, HostFunction>>>>,
}

impl HostRegistry {
    pub(crate) fn contains_module(&self, name: &str) -> bool {
        self.modules.borrow().contains_key(name)
    }

    pub(crate) fn add(&self, module: String, name: String, func: HostFunction) {
        self.modules
            .borrow_mut()
            .entry(module)
            .or_default()
            .insert(name, func);
    }

    pub(crate) fn get(&self, module: &str, name: &str) -> Option<HostFunction> {
        self.modules.borrow().get(module)?.get(name).cloned()
    }

    fn function_names(&self, module: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .borrow()
            .get(module)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Reserved words that cannot appear as `export const` bindings.
const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Whether a function name can be spliced into a facade export binding.
pub(crate) fn is_export_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        && !RESERVED.contains(&name)
}

/// Generate the facade source for one host-function module: every function
/// is an export bound through the core wrapping primitive.
pub(crate) fn facade_source(registry: &HostRegistry, module: &str) -> String {
    let module_lit = serde_json::to_string(module).unwrap_or_else(|_| "\"\"".into());
    let mut source = format!("import {{ hostFunction }} from \"{HOST_CORE}\";\n");
    for name in registry.function_names(module) {
        let name_lit = serde_json::to_string(&name).unwrap_or_else(|_| "\"\"".into());
        source.push_str(&format!(
            "export const {name} = hostFunction({module_lit}, {name_lit});\n"
        ));
    }
    source
}

/// State shared by in-flight maybe-async host calls.
pub(crate) struct BridgeState {
    /// Deferred resolvers keyed by call id, settled when the host future
    /// completes.
    pub(crate) pending: RefCell<HashMap<u64, Persistent<Function<'static>>>>,
    next_call: Cell<u64>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    rt: tokio::runtime::Handle,
}

impl BridgeState {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<Command>, rt: tokio::runtime::Handle) -> Self {
        Self {
            pending: RefCell::new(HashMap::new()),
            next_call: Cell::new(0),
            cmd_tx,
            rt,
        }
    }

    fn next_call_id(&self) -> u64 {
        let id = self.next_call.get() + 1;
        self.next_call.set(id);
        id
    }
}

/// Context userdata giving the core module and the inner native functions
/// access to the registry, the safe stubs and the bridge state.
#[derive(Clone, JsLifetime)]
pub(crate) struct BridgeUserData {
    pub(crate) registry: HostRegistry,
    pub(crate) stubs: Rc<SafeStubs>,
    pub(crate) state: Rc<BridgeState>,
}

/// The fixed-name internal module exporting the wrapping primitive used by
/// facade sources. The resolver only lets facade module names import it.
pub(crate) struct HostCoreModule;

impl ModuleDef for HostCoreModule {
    fn declare<'js>(decl: &Declarations<'js>) -> rquickjs::Result<()> {
        decl.declare("hostFunction")?;
        Ok(())
    }

    fn evaluate<'js>(ctx: &Ctx<'js>, exports: &Exports<'js>) -> rquickjs::Result<()> {
        let func = Function::new(
            ctx.clone(),
            coerce_binder_signature(|ctx, module: String, name: String| {
                make_wrapped(&ctx, &module, &name)
            }),
        )?
        .with_name("hostFunction")?;
        exports.export("hostFunction", func)?;
        Ok(())
    }
}

/// The returned `Value<'_>` must share the lifetime of the `Ctx<'_>`
/// argument; without the coercion Rust infers independent lifetimes.
fn coerce_fn_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn coerce_thunk_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn coerce_binder_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, String, String) -> rquickjs::Result<Value<'js>>,
{
    f
}

/// Build the guest-facing function for one registered host function: the
/// safe wrapper applied to an inner native function that invokes the host
/// closure and packages the envelope.
fn make_wrapped<'js>(ctx: &Ctx<'js>, module: &str, name: &str) -> rquickjs::Result<Value<'js>> {
    let Some(ud) = ctx.userdata::<BridgeUserData>() else {
        return Err(Exception::throw_internal(ctx, "bridge state missing"));
    };
    let Some(host_func) = ud.registry.get(module, name) else {
        return Err(Exception::throw_internal(
            ctx,
            &format!("unknown host function {module}.{name}"),
        ));
    };
    let stubs = ud.stubs.clone();
    let state = ud.state.clone();
    drop(ud);

    let inner = {
        let stubs = stubs.clone();
        Function::new(
            ctx.clone(),
            coerce_fn_signature(move |ctx, args| {
                let mut json_args = Vec::with_capacity(args.len());
                for arg in args.iter() {
                    json_args.push(json_out(&ctx, arg)?);
                }
                let outcome = host_func.invoke(json_args);
                build_envelope(&ctx, outcome, &stubs, &state)
            }),
        )?
        .with_name(name)?
    };

    let wrap = SafeStubs::restore(&stubs.wrap, ctx)?;
    wrap.call((inner,))
}

/// Package one call outcome as the `{isError, isPromise, get}` envelope.
fn build_envelope<'js>(
    ctx: &Ctx<'js>,
    outcome: HostCallResult,
    stubs: &Rc<SafeStubs>,
    state: &Rc<BridgeState>,
) -> rquickjs::Result<Value<'js>> {
    let envelope = Object::new(ctx.clone())?;
    match outcome {
        HostCallResult::Value(v) => {
            let held = Persistent::save(ctx, json_in(ctx, &v)?);
            envelope.set("isError", false)?;
            envelope.set("isPromise", false)?;
            envelope.set("get", getter(ctx, held)?)?;
        }
        HostCallResult::Error(v) => {
            let held = Persistent::save(ctx, json_in(ctx, &v)?);
            envelope.set("isError", true)?;
            envelope.set("isPromise", false)?;
            envelope.set("get", getter(ctx, held)?)?;
        }
        HostCallResult::Future(future) => {
            let deferred: Object = SafeStubs::restore(&stubs.deferred, ctx)?.call(())?;
            let promise: Value = deferred.get("promise")?;
            let resolve: Function = deferred.get("resolve")?;

            let id = state.next_call_id();
            state
                .pending
                .borrow_mut()
                .insert(id, Persistent::save(ctx, resolve));
            let cmd_tx = state.cmd_tx.clone();
            state.rt.spawn(async move {
                let outcome = future.await;
                let _ = cmd_tx.send(Command::SettleHostCall { id, outcome });
            });

            let held = Persistent::save(ctx, promise);
            envelope.set("isError", false)?;
            envelope.set("isPromise", true)?;
            envelope.set("get", getter(ctx, held)?)?;
        }
    }
    Ok(envelope.into_value())
}

/// A zero-argument function returning the held value.
fn getter<'js>(
    ctx: &Ctx<'js>,
    held: Persistent<Value<'static>>,
) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        coerce_thunk_signature(move |ctx| held.clone().restore(&ctx)),
    )
}

/// Copy a guest value out as JSON through the engine's own serializer.
/// Unserializable values (undefined, functions) copy as null; cyclic values
/// surface the engine's own throw.
pub(crate) fn json_out<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Json> {
    let Some(text) = ctx.json_stringify(value.clone())? else {
        return Ok(Json::Null);
    };
    let text = text.to_string()?;
    serde_json::from_str(&text)
        .map_err(|e| Exception::throw_internal(ctx, &format!("unserializable result: {e}")))
}

/// Copy a JSON value into the current context.
pub(crate) fn json_in<'js>(ctx: &Ctx<'js>, value: &Json) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(value)
        .map_err(|e| Exception::throw_internal(ctx, &format!("unserializable argument: {e}")))?;
    ctx.json_parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_names_are_validated() {
        assert!(is_export_name("inc"));
        assert!(is_export_name("_private"));
        assert!(is_export_name("$lookup2"));
        assert!(!is_export_name(""));
        assert!(!is_export_name("2fast"));
        assert!(!is_export_name("do-thing"));
        assert!(!is_export_name("delete"));
    }

    #[test]
    fn facade_source_lists_functions_sorted() {
        let registry = HostRegistry::default();
        registry.add(
            "varhub:api".into(),
            "zeta".into(),
            HostFunction::from_sync(|_| Ok(Json::Null)),
        );
        registry.add(
            "varhub:api".into(),
            "alpha".into(),
            HostFunction::from_sync(|_| Ok(Json::Null)),
        );
        let source = facade_source(&registry, "varhub:api");
        let alpha = source.find("export const alpha").expect("alpha exported");
        let zeta = source.find("export const zeta").expect("zeta exported");
        assert!(alpha < zeta, "facade exports should be sorted:\n{source}");
        assert!(source.starts_with("import { hostFunction } from"));
    }
}
