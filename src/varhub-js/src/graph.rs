//! The module graph: caching, deduplication, aliasing and specifier rules.
//!
//! The graph is the host-side source of truth for every module the engine
//! knows about. Aliasing happens in the resolver — it hands the engine the
//! canonical name, so the engine's own per-context module cache
//! deduplicates — while compilation and `import.meta` seeding happen in the
//! loader. Typed failures (not-found, private-module, fetch errors) are
//! recorded out-of-band while the engine drives resolution, because the
//! engine's own resolving/loading errors carry no detail.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::{CatchResultExt, Ctx, Module, Object};
use tokio::sync::oneshot;
use url::Url;

use crate::bridge::{self, HostRegistry};
use crate::error::ProgramError;
use crate::program::Shared;
use crate::source::{SourceFetch, SourceProvider};

/// Canonical name of the internal module exporting the host-function
/// wrapping primitive. Only facade modules may resolve it.
pub(crate) const HOST_CORE: &str = "varhub:internal/host";

/// Synthetic base used to resolve relative specifiers between modules whose
/// canonical names are themselves relative (`index.js` importing `./a.js`).
const SYNTHETIC_ROOT: &str = "graph:///";

/// What a host caller learns about an evaluated module.
#[derive(Debug, Clone)]
pub(crate) struct ModuleInfo {
    pub(crate) name: String,
    pub(crate) deps: Vec<String>,
}

pub(crate) type ModuleReply = oneshot::Sender<Result<ModuleInfo, ProgramError>>;

pub(crate) enum SlotState {
    /// Declared or being evaluated; its load session has not settled.
    Loading,
    /// Evaluated; the engine cache owns the namespace.
    Ready,
    /// Load failed; replayed verbatim to later requests.
    Failed(ProgramError),
}

pub(crate) struct Slot {
    pub(crate) canonical: String,
    pub(crate) state: SlotState,
    /// Source handed over by the provider at resolve time, consumed by the
    /// loader. `None` for facade modules and after consumption.
    pub(crate) stash: Option<SourceFetch>,
    /// Raw import specifiers, recorded as the resolver observes them.
    pub(crate) deps: Vec<String>,
    /// The load session that created this slot; all slots of a session
    /// settle together when the session's root promise settles.
    pub(crate) session: u64,
    /// Host callers waiting for this module to settle.
    pub(crate) waiters: Vec<ModuleReply>,
}

pub(crate) struct GraphState {
    provider: Box<dyn SourceProvider>,
    slots: Vec<Slot>,
    /// Descriptor and canonical-name keys; two keys may share one slot.
    keys: HashMap<String, usize>,
    /// First typed error recorded during engine-driven resolution; takes
    /// precedence over the engine's generic error when surfaced.
    pending_error: Option<ProgramError>,
    current_session: u64,
}

impl GraphState {
    pub(crate) fn new(provider: Box<dyn SourceProvider>) -> Self {
        Self {
            provider,
            slots: Vec::new(),
            keys: HashMap::new(),
            pending_error: None,
            current_session: 0,
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub(crate) fn slot_index(&self, key: &str) -> Option<usize> {
        self.keys.get(key).copied()
    }

    pub(crate) fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub(crate) fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// Start a load session for a root request; slots created while it runs
    /// are tagged with it and settle together.
    pub(crate) fn begin_session(&mut self) -> u64 {
        self.current_session += 1;
        self.current_session
    }

    /// Resolution steps 1–4: cache hit, provider consult, alias insertion,
    /// slot allocation. Returns the canonical name.
    pub(crate) fn resolve_descriptor(
        &mut self,
        descriptor: &str,
        from: Option<&str>,
    ) -> Result<String, ProgramError> {
        if let Some(&idx) = self.keys.get(descriptor) {
            return Ok(self.slots[idx].canonical.clone());
        }
        let Some(provided) = self.provider.resolve(descriptor) else {
            return Err(ProgramError::ModuleNotFound {
                descriptor: descriptor.to_string(),
                from: from.map(str::to_string),
            });
        };
        let canonical = provided.name;
        if let Some(&idx) = self.keys.get(&canonical) {
            self.keys.insert(descriptor.to_string(), idx);
            return Ok(canonical);
        }
        let idx = self.slots.len();
        self.slots.push(Slot {
            canonical: canonical.clone(),
            state: SlotState::Loading,
            stash: Some(provided.source),
            deps: Vec::new(),
            session: self.current_session,
            waiters: Vec::new(),
        });
        self.keys.insert(descriptor.to_string(), idx);
        if canonical != descriptor {
            self.keys.insert(canonical.clone(), idx);
        }
        Ok(canonical)
    }

    /// Insert a host-authored module (created source or facade) under a
    /// fixed name. Fails if the name is tracked in any state.
    pub(crate) fn insert_new(
        &mut self,
        name: &str,
        stash: Option<SourceFetch>,
    ) -> Result<usize, ProgramError> {
        if self.keys.contains_key(name) {
            return Err(ProgramError::ModuleAlreadyExists(name.to_string()));
        }
        let idx = self.slots.len();
        self.slots.push(Slot {
            canonical: name.to_string(),
            state: SlotState::Loading,
            stash,
            deps: Vec::new(),
            session: self.current_session,
            waiters: Vec::new(),
        });
        self.keys.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub(crate) fn record_dep(&mut self, base: &str, specifier: &str) {
        if let Some(&idx) = self.keys.get(base) {
            let deps = &mut self.slots[idx].deps;
            if !deps.iter().any(|d| d == specifier) {
                deps.push(specifier.to_string());
            }
        }
    }

    pub(crate) fn record_error(&mut self, err: ProgramError) {
        self.pending_error.get_or_insert(err);
    }

    pub(crate) fn take_error(&mut self) -> Option<ProgramError> {
        self.pending_error.take()
    }

    pub(crate) fn take_stash(&mut self, canonical: &str) -> Option<SourceFetch> {
        let idx = *self.keys.get(canonical)?;
        self.slots[idx].stash.take()
    }

    /// Settle every slot of a session, flushing its waiters.
    pub(crate) fn settle_session(&mut self, session: u64, result: Result<(), ProgramError>) {
        for slot in &mut self.slots {
            if slot.session != session || !matches!(slot.state, SlotState::Loading) {
                continue;
            }
            slot.stash = None;
            match &result {
                Ok(()) => slot.state = SlotState::Ready,
                Err(e) => slot.state = SlotState::Failed(e.clone()),
            }
            let outcome = match &slot.state {
                SlotState::Ready => Ok(ModuleInfo {
                    name: slot.canonical.clone(),
                    deps: slot.deps.clone(),
                }),
                SlotState::Failed(e) => Err(e.clone()),
                SlotState::Loading => unreachable!(),
            };
            for waiter in slot.waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Fail every unsettled slot; used at teardown.
    pub(crate) fn fail_all_loading(&mut self, err: &ProgramError) {
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Loading) {
                slot.stash = None;
                slot.state = SlotState::Failed(err.clone());
                for waiter in slot.waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Resolve a specifier against a referrer's canonical name.
///
/// Absolute (scheme-carrying) specifiers pass through normalized and need no
/// base. Relative specifiers are joined against the referrer under a
/// synthetic root, which also keeps `..` from escaping the module space.
pub(crate) fn resolve_specifier(base: Option<&str>, specifier: &str) -> Option<String> {
    if let Ok(url) = Url::parse(specifier) {
        return Some(url.to_string());
    }
    let base = base?;
    if let Ok(base_url) = Url::parse(base) {
        if let Ok(joined) = base_url.join(specifier) {
            return Some(joined.to_string());
        }
        // opaque base (varhub:rpc style) cannot host relative imports
        return None;
    }
    let root = Url::parse(SYNTHETIC_ROOT).ok()?;
    let joined = root.join(base).ok()?.join(specifier).ok()?;
    let joined = joined.to_string();
    Some(
        joined
            .strip_prefix(SYNTHETIC_ROOT)
            .map(str::to_string)
            .unwrap_or(joined),
    )
}

/// The resolver half installed on the runtime: applies the `#` rules, the
/// builtin privilege, URL resolution and aliasing, and records typed errors
/// for the service to surface.
pub(crate) struct ProgramResolver {
    pub(crate) graph: Rc<RefCell<GraphState>>,
    pub(crate) registry: HostRegistry,
    pub(crate) shared: Arc<Shared>,
}

impl ProgramResolver {
    fn resolve_inner(&mut self, base: &str, name: &str) -> Result<String, ProgramError> {
        // the wrapping primitive is importable only from facade sources
        if name == HOST_CORE {
            if self.registry.contains_module(base) {
                return Ok(HOST_CORE.to_string());
            }
            return Err(ProgramError::PrivateModule {
                specifier: name.to_string(),
                referrer: base.to_string(),
            });
        }
        if self.registry.contains_module(name) {
            self.graph.borrow_mut().record_dep(base, name);
            return Ok(name.to_string());
        }

        let base_known = self.graph.borrow().contains(base) || self.registry.contains_module(base);
        let descriptor = if name.starts_with('#') {
            // private submodule attached to the referrer
            if !base_known {
                return Err(ProgramError::UnknownReferrer(base.to_string()));
            }
            format!("{base}{name}")
        } else if name.contains('#') {
            // cross-module private reference, builtin referrers only
            if !self.shared.is_builtin(base) {
                return Err(ProgramError::PrivateModule {
                    specifier: name.to_string(),
                    referrer: base.to_string(),
                });
            }
            name.to_string()
        } else {
            match resolve_specifier(base_known.then_some(base), name) {
                Some(resolved) => resolved,
                None if !base_known => {
                    // script-driven import with no tracked referrer: the
                    // specifier must be a descriptor the graph already knows
                    if self.graph.borrow().contains(name) {
                        name.to_string()
                    } else {
                        return Err(ProgramError::UnknownReferrer(base.to_string()));
                    }
                }
                None => {
                    return Err(ProgramError::ModuleNotFound {
                        descriptor: name.to_string(),
                        from: Some(base.to_string()),
                    });
                }
            }
        };

        let mut graph = self.graph.borrow_mut();
        graph.record_dep(base, name);
        graph.resolve_descriptor(&descriptor, Some(base))
    }
}

impl Resolver for ProgramResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        match self.resolve_inner(base, name) {
            Ok(canonical) => Ok(canonical),
            Err(err) => {
                self.graph.borrow_mut().record_error(err);
                Err(rquickjs::Error::new_resolving(base, name))
            }
        }
    }
}

/// The loader half: declares facade modules, synthesizes JSON wrappers,
/// compiles provider sources and seeds `import.meta`.
pub(crate) struct ProgramLoader {
    pub(crate) graph: Rc<RefCell<GraphState>>,
    pub(crate) registry: HostRegistry,
}

impl Loader for ProgramLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        match declare_module(ctx, &self.graph, &self.registry, name) {
            Ok(module) => Ok(module),
            Err(err) => {
                self.graph.borrow_mut().record_error(err);
                Err(rquickjs::Error::new_loading(name))
            }
        }
    }
}

/// Declare a module by canonical name. Shared by the engine-driven loader
/// and the service's root-load path so both produce identical modules.
pub(crate) fn declare_module<'js>(
    ctx: &Ctx<'js>,
    graph: &Rc<RefCell<GraphState>>,
    registry: &HostRegistry,
    name: &str,
) -> Result<Module<'js>, ProgramError> {
    if name == HOST_CORE {
        return Module::declare_def::<bridge::HostCoreModule, _>(ctx.clone(), name).map_err(|e| {
            ProgramError::internal(format!("failed to declare host core module: {e}"))
        });
    }
    if registry.contains_module(name) {
        let source = bridge::facade_source(registry, name);
        return declare_source(ctx, name, source);
    }

    let fetch = graph.borrow_mut().take_stash(name).ok_or_else(|| {
        ProgramError::internal(format!("module {name} was loaded without resolution"))
    })?;
    let text = match fetch {
        SourceFetch::Ready(text) => text,
        SourceFetch::Deferred(fetch) => fetch().map_err(|e| ProgramError::Source {
            descriptor: name.to_string(),
            message: format!("{e:#}"),
        })?,
    };
    let source = if text.is_json() {
        // JSON modules carry exactly one default export; validate before
        // splicing the text into module syntax so a bad payload fails as a
        // compile error of this module, not a cryptic engine parse error.
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&text.text) {
            return Err(ProgramError::Compile {
                name: name.to_string(),
                message: format!("invalid JSON module: {e}"),
            });
        }
        format!("export default {};\n", text.text.trim())
    } else {
        text.text
    };
    declare_source(ctx, name, source)
}

fn declare_source<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    source: String,
) -> Result<Module<'js>, ProgramError> {
    let module =
        Module::declare(ctx.clone(), name, source)
            .catch(ctx)
            .map_err(|e| ProgramError::Compile {
                name: name.to_string(),
                message: crate::program::service::caught_to_string(&e),
            })?;
    let meta: Object = module.meta().map_err(|e| ProgramError::Compile {
        name: name.to_string(),
        message: format!("failed to seed import.meta: {e}"),
    })?;
    meta.set("url", name).map_err(|e| ProgramError::Compile {
        name: name.to_string(),
        message: format!("failed to seed import.meta: {e}"),
    })?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_specifiers_pass_through() {
        assert_eq!(
            resolve_specifier(None, "varhub:rpc").as_deref(),
            Some("varhub:rpc")
        );
        assert_eq!(
            resolve_specifier(Some("index.js"), "room:index").as_deref(),
            Some("room:index")
        );
    }

    #[test]
    fn relative_specifiers_resolve_against_referrer() {
        assert_eq!(
            resolve_specifier(Some("index.js"), "./util.js").as_deref(),
            Some("util.js")
        );
        assert_eq!(
            resolve_specifier(Some("a/b/c.js"), "../d.js").as_deref(),
            Some("a/d.js")
        );
        assert_eq!(
            resolve_specifier(Some("a/b.js"), "lib.js").as_deref(),
            Some("a/lib.js")
        );
    }

    #[test]
    fn relative_specifiers_cannot_escape_the_root() {
        assert_eq!(
            resolve_specifier(Some("index.js"), "../../../etc.js").as_deref(),
            Some("etc.js")
        );
    }

    #[test]
    fn relative_specifiers_need_a_base() {
        assert_eq!(resolve_specifier(None, "./util.js"), None);
    }

    #[test]
    fn opaque_bases_reject_relative_imports() {
        assert_eq!(resolve_specifier(Some("varhub:rpc"), "./x.js"), None);
    }
}
