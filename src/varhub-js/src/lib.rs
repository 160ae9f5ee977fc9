//! This crate embeds untrusted per-room JavaScript inside a quota-bounded
//! QuickJS sandbox. Each [`Program`] owns one engine with a guest and a
//! helper context, resolves modules lazily through a host
//! [`SourceProvider`], exposes host-owned virtual timers to the guest,
//! bridges host functions with preserved error/promise semantics, and is
//! torn down by a CPU wall-time watchdog when guest code runs away.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(any(test, debug_assertions), allow(clippy::disallowed_macros))]

mod bridge;
mod error;
mod graph;
mod inspector;
mod metrics;
mod program;
mod rt;
mod source;
mod stubs;
mod watchdog;

/// The outcome of one host-function invocation: a synchronous value, a
/// synchronous error, or a deferred future.
pub use bridge::HostCallResult;
/// A host function callable from guest code through a registered module.
pub use bridge::HostFunction;
/// The error type for every fallible program operation.
pub use error::ProgramError;
/// A filtered debug-protocol session over a program.
pub use inspector::InspectorSession;
/// An isolated guest program.
pub use program::Program;
/// Construction options for a program.
pub use program::ProgramOptions;
/// The watchdog quota: sampling interval and maximum continuous execution.
pub use program::QuotaOptions;
/// Host-side handle over an evaluated module namespace.
pub use program::module::ProgramModule;
/// A provider backed by a closed, in-memory module table.
pub use source::MemorySourceProvider;
/// The provider's answer for one descriptor.
pub use source::ProvidedModule;
/// Source text, available now or behind a one-shot fetch.
pub use source::SourceFetch;
/// The host-side seam mapping module descriptors to source text.
pub use source::SourceProvider;
/// Adapt a closure into a [`SourceProvider`].
pub use source::provider_fn;
/// A unit of module source plus its loose type hint.
pub use source::SourceText;

/// The result of a program operation.
pub type Result<T, E = ProgramError> = std::result::Result<T, E>;
