//! Helper stubs compiled once in the `safe` context.
//!
//! Guest code can monkey-patch every intrinsic reachable from its own
//! global scope, so any JS-level primitive the host relies on — property
//! enumeration, property access, promise construction, the maybe-async
//! unwrapper — is compiled in the second context instead. QuickJS functions
//! resolve their free identifiers (`Object`, `Reflect`, `Promise`) through
//! the realm that compiled them, so these keep using the safe realm's
//! intrinsics even when invoked while the main context is current, and
//! their prototype chains never appear in guest name resolution.

use rquickjs::{Context, Ctx, Function, Object, Persistent};

use crate::error::ProgramError;

/// Source of the stub table. Evaluated as a single object expression so the
/// whole set compiles in one shot.
const STUB_SOURCE: &str = r#"({
    keys: (o) => Object.getOwnPropertyNames(o),
    prop: (o, k) => o[k],
    kindOf: (o, k) => (k in o ? typeof o[k] : void 0),
    apply: (o, k, t, a) => Reflect.apply(o[k], t, a),
    deferred: () => {
        const d = {};
        d.promise = new Promise((resolve, reject) => {
            d.resolve = resolve;
            d.reject = reject;
        });
        return d;
    },
    wrap: (call) => function (...args) {
        const r = call(...args);
        if (r.isError) throw r.get();
        if (r.isPromise) return r.get().then((s) => {
            if (s.rejected) throw s.value;
            return s.value;
        });
        return r.get();
    },
})"#;

/// The compiled stubs, held as persistents so they can be restored into
/// whichever context is current at the call site.
pub(crate) struct SafeStubs {
    /// `Object.getOwnPropertyNames` over a namespace.
    pub(crate) keys: Persistent<Function<'static>>,
    /// Plain property read.
    pub(crate) prop: Persistent<Function<'static>>,
    /// `typeof` tag of a property, or undefined when absent.
    pub(crate) kind_of: Persistent<Function<'static>>,
    /// `Reflect.apply(o[k], this, args)` — the guest-method entry point.
    pub(crate) apply: Persistent<Function<'static>>,
    /// Builds a `{promise, resolve, reject}` record for maybe-async results.
    pub(crate) deferred: Persistent<Function<'static>>,
    /// Wraps a host call returning an `{isError, isPromise, get}` envelope
    /// into a guest function that throws, returns, or returns a promise.
    pub(crate) wrap: Persistent<Function<'static>>,
}

impl SafeStubs {
    /// Compile the stub table in the safe context.
    pub(crate) fn compile(safe: &Context) -> Result<Self, ProgramError> {
        safe.with(|ctx| {
            let table: Object = ctx.eval(STUB_SOURCE).map_err(|e| ProgramError::Compile {
                name: "<safe stubs>".into(),
                message: e.to_string(),
            })?;
            let save = |name: &str| -> Result<Persistent<Function<'static>>, ProgramError> {
                let f: Function = table.get(name).map_err(|e| {
                    ProgramError::internal(format!("safe stub {name} missing: {e}"))
                })?;
                Ok(Persistent::save(&ctx, f))
            };
            Ok(Self {
                keys: save("keys")?,
                prop: save("prop")?,
                kind_of: save("kindOf")?,
                apply: save("apply")?,
                deferred: save("deferred")?,
                wrap: save("wrap")?,
            })
        })
    }

    /// Restore one stub into the current context.
    pub(crate) fn restore<'js>(
        stub: &Persistent<Function<'static>>,
        ctx: &Ctx<'js>,
    ) -> rquickjs::Result<Function<'js>> {
        stub.clone().restore(ctx)
    }
}
