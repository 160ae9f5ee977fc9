use serde_json::Value as Json;

/// The error type for every fallible `Program` operation.
///
/// Module failures are cached by the graph, so the type is `Clone`: a second
/// request for a module that failed to load observes the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProgramError {
    /// The source provider returned nothing for a descriptor.
    #[error("module not found: {descriptor}{}", .from.as_deref().map(|f| format!(" (imported from {f})")).unwrap_or_default())]
    ModuleNotFound {
        /// The descriptor that could not be resolved.
        descriptor: String,
        /// The importing module, when the request came from guest code.
        from: Option<String>,
    },

    /// `create_module` was called with a name that is already tracked.
    #[error("module already exists: {0}")]
    ModuleAlreadyExists(String),

    /// A cross-module `#` import was attempted by a non-builtin module.
    #[error("private module {specifier} imported from {referrer}")]
    PrivateModule {
        /// The offending specifier (contains `#` past its first byte).
        specifier: String,
        /// The module that tried to import it.
        referrer: String,
    },

    /// The engine rejected the module source.
    #[error("failed to compile {name}: {message}")]
    Compile {
        /// Canonical name of the module.
        name: String,
        /// Engine-reported reason.
        message: String,
    },

    /// The engine failed to link the module against its dependencies.
    #[error("failed to instantiate {name}: {message}")]
    Instantiate {
        /// Canonical name of the module.
        name: String,
        /// Engine-reported reason.
        message: String,
    },

    /// Module evaluation ran and threw.
    #[error("failed to evaluate {name}: {message}")]
    Evaluate {
        /// Canonical name of the module.
        name: String,
        /// Engine-reported reason.
        message: String,
    },

    /// A value thrown by guest code, copied across the boundary verbatim.
    ///
    /// A guest `throw 31` is observed by the host as the JSON number `31`;
    /// thrown `Error` objects cross as `{name, message, stack}` records.
    #[error("guest error: {0}")]
    Guest(Json),

    /// The program was disposed, either explicitly or by the watchdog,
    /// before or during the operation.
    #[error("isolate disposed")]
    IsolateDisposed,

    /// An inspector method was called on a program built without `inspector`.
    #[error("inspector is not enabled")]
    InspectorDisabled,

    /// A relative specifier was resolved against a referrer the graph does
    /// not track. Reaching this from the public surface is a bug indicator.
    #[error("unknown referrer: {0}")]
    UnknownReferrer(String),

    /// The source provider accepted a descriptor but its fetch failed.
    #[error("source for {descriptor} unavailable: {message}")]
    Source {
        /// The descriptor whose fetch failed.
        descriptor: String,
        /// Provider-reported reason.
        message: String,
    },

    /// Service machinery fault (poisoned channel, malformed protocol input).
    #[error("{0}")]
    Internal(String),
}

impl ProgramError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
