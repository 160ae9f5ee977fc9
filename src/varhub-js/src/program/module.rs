//! Host-side handle over an evaluated module namespace.

use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::error::ProgramError;
use crate::graph::ModuleInfo;
use crate::program::Shared;
use crate::program::service::Command;
use crate::Result;

/// A handle over a compiled and evaluated module.
///
/// Handles are cheap to clone and stay valid for the life of the program;
/// after disposal every operation fails with
/// [`IsolateDisposed`](ProgramError::IsolateDisposed).
#[derive(Clone)]
pub struct ProgramModule {
    shared: Arc<Shared>,
    name: String,
    deps: Arc<Vec<String>>,
}

impl ProgramModule {
    pub(crate) fn new(shared: Arc<Shared>, info: ModuleInfo) -> Self {
        Self {
            shared,
            name: info.name,
            deps: Arc::new(info.deps),
        }
    }

    /// Canonical name of the module.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The import specifiers recorded when the module was linked.
    pub fn get_dependency_specifiers(&self) -> &[String] {
        &self.deps
    }

    /// Own property names of the namespace, through the safe-context stub.
    pub async fn get_keys(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::GetKeys {
            module: self.name.clone(),
            reply,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// `typeof` tag of an export, or `None` when the export is absent.
    /// Synchronous: blocks briefly on the service thread.
    pub fn get_type(&self, prop: &str) -> Result<Option<String>> {
        let (reply, rx) = std::sync::mpsc::channel();
        self.shared.send(Command::GetType {
            module: self.name.clone(),
            prop: prop.to_string(),
            reply,
        })?;
        rx.recv().map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Copy of an exported value.
    pub async fn get_prop(&self, prop: &str) -> Result<Json> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::GetProp {
            module: self.name.clone(),
            prop: prop.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Call an exported method: arguments are copied in, the result is
    /// copied out, and promise results are awaited. A guest throw or
    /// rejection surfaces as [`Guest`](ProgramError::Guest) carrying the
    /// thrown value verbatim.
    pub async fn call_method(
        &self,
        prop: &str,
        this: Option<Json>,
        args: Vec<Json>,
    ) -> Result<Json> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::CallMethod {
            module: self.name.clone(),
            prop: prop.to_string(),
            this,
            args,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Fire-and-forget dispatch into the guest: any error is swallowed and
    /// no ordering with later [`call_method`](Self::call_method) calls is
    /// guaranteed. Used for host-originated events where guest back-pressure
    /// is undesirable.
    pub fn call_method_ignored(&self, prop: &str, this: Option<Json>, args: Vec<Json>) {
        let _ = self.shared.send(Command::CallMethod {
            module: self.name.clone(),
            prop: prop.to_string(),
            this,
            args,
            reply: None,
        });
    }
}

impl std::fmt::Debug for ProgramModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramModule")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .finish()
    }
}
