//! The host-side seam that maps module descriptors to source text.
//!
//! A [`SourceProvider`] is the only way module source enters a program. The
//! provider decides canonical names (which is how aliasing happens: two
//! descriptors mapping to one name share one module) and hands back the text
//! either eagerly or through a deferred fetch closure.

use std::collections::HashMap;

/// Maps a module descriptor to a canonical name and its source.
///
/// Returning `None` makes the descriptor fail with
/// [`ModuleNotFound`](crate::ProgramError::ModuleNotFound); the descriptor
/// never enters the graph. The provider is consulted once per descriptor —
/// later requests for the same descriptor or canonical name hit the graph
/// cache.
pub trait SourceProvider: Send + 'static {
    /// Resolve a descriptor into a canonical name plus a source fetch.
    fn resolve(&mut self, descriptor: &str) -> Option<ProvidedModule>;
}

/// Adapt a closure into a [`SourceProvider`]; the common shape for hosts
/// that close over a controller-owned module table.
pub fn provider_fn<F>(f: F) -> impl SourceProvider
where
    F: FnMut(&str) -> Option<ProvidedModule> + Send + 'static,
{
    struct FnProvider<F>(F);
    impl<F> SourceProvider for FnProvider<F>
    where
        F: FnMut(&str) -> Option<ProvidedModule> + Send + 'static,
    {
        fn resolve(&mut self, descriptor: &str) -> Option<ProvidedModule> {
            (self.0)(descriptor)
        }
    }
    FnProvider(f)
}

/// The provider's answer for one descriptor.
pub struct ProvidedModule {
    /// Canonical name for the module; may equal the descriptor. All later
    /// lookups by either key return the same module.
    pub name: String,
    /// The source, ready or deferred.
    pub source: SourceFetch,
}

impl ProvidedModule {
    /// A module whose canonical name is the descriptor itself.
    pub fn new(name: impl Into<String>, text: SourceText) -> Self {
        Self {
            name: name.into(),
            source: SourceFetch::Ready(text),
        }
    }

    /// A module whose text is produced on demand, at most once.
    pub fn deferred(
        name: impl Into<String>,
        fetch: impl FnOnce() -> anyhow::Result<SourceText> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            source: SourceFetch::Deferred(Box::new(fetch)),
        }
    }
}

/// Source text, available now or behind a one-shot fetch.
///
/// Module linking is synchronous in the engine, so the fetch closure runs on
/// the service thread; hosts that fetch over the network materialize the
/// text before resolution and hand it over as `Ready`.
pub enum SourceFetch {
    /// Text already in hand.
    Ready(SourceText),
    /// Text produced on first use. Errors surface as
    /// [`Source`](crate::ProgramError::Source) and are cached like any other
    /// module failure.
    Deferred(Box<dyn FnOnce() -> anyhow::Result<SourceText> + Send>),
}

/// A unit of module source plus its loose type hint.
#[derive(Debug, Clone)]
pub struct SourceText {
    /// Type hint; only values containing `"json"` (case-insensitive) change
    /// behavior, switching the module to JSON synthesis. Anything else is
    /// treated as a JS module.
    pub kind: Option<String>,
    /// The source text.
    pub text: String,
}

impl SourceText {
    /// A JS module.
    pub fn js(text: impl Into<String>) -> Self {
        Self {
            kind: None,
            text: text.into(),
        }
    }

    /// A JSON module; the text must be a valid JSON value.
    pub fn json(text: impl Into<String>) -> Self {
        Self {
            kind: Some("json".into()),
            text: text.into(),
        }
    }

    pub(crate) fn is_json(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.to_ascii_lowercase().contains("json"))
    }
}

/// A provider backed by a closed, in-memory module table.
///
/// Descriptors are exact keys and double as canonical names. This is the
/// secure default for tenants whose sources are known up front, and the
/// workhorse for tests.
#[derive(Default)]
pub struct MemorySourceProvider {
    modules: HashMap<String, SourceText>,
}

impl MemorySourceProvider {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a module under its canonical name.
    pub fn insert(&mut self, name: impl Into<String>, text: SourceText) -> &mut Self {
        self.modules.insert(name.into(), text);
        self
    }

    /// Builder-flavored [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, text: SourceText) -> Self {
        self.modules.insert(name.into(), text);
        self
    }
}

impl SourceProvider for MemorySourceProvider {
    fn resolve(&mut self, descriptor: &str) -> Option<ProvidedModule> {
        let text = self.modules.get(descriptor)?.clone();
        Some(ProvidedModule::new(descriptor, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_hint_is_case_insensitive_substring() {
        assert!(SourceText::json("1").is_json());
        assert!(
            SourceText {
                kind: Some("application/JSON; charset=utf-8".into()),
                text: "1".into(),
            }
            .is_json()
        );
        assert!(!SourceText::js("1").is_json());
        assert!(
            !SourceText {
                kind: Some("text/javascript".into()),
                text: "1".into(),
            }
            .is_json()
        );
    }

    #[test]
    fn memory_provider_is_exact_match() {
        let mut provider = MemorySourceProvider::new().with("index.js", SourceText::js("export {}"));
        assert!(provider.resolve("index.js").is_some());
        assert!(provider.resolve("./index.js").is_none());
    }
}
