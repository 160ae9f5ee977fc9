//! Debug-protocol sessions, filtered and lifecycle-coupled to the program.
//!
//! A session accepts raw protocol messages, applies two edits before
//! forwarding to the engine-side evaluator, and re-emits responses through
//! its message channel:
//!
//! - `Runtime.compileScript` is answered with a synthesized successful
//!   response and not forwarded — the engine does not support script
//!   compilation over the protocol, but debugger frontends require a
//!   success reply.
//! - `Runtime.evaluate` is forwarded with `replMode` and `awaitPromise`
//!   stripped; the engine rejects both options.
//!
//! Everything else passes through untouched. The program holds the strong
//! edge of the coupling (a removable dispose hook); the session only knows
//! how to detach its own hook, so no reference cycle exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Value as Json, json};
use tokio::sync::mpsc;

use crate::error::ProgramError;
use crate::program::{self, Shared, service::Command};
use crate::Result;

#[derive(Debug)]
struct SessionState {
    disposed: AtomicBool,
    /// Master sender for the message channel; taken on dispose so the
    /// receiver observes the close once in-flight responses drain.
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SessionState {
    fn sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn close(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let taken = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(mut poisoned) => poisoned.get_mut().take(),
        };
        drop(taken);
    }
}

/// One debug session over a program.
///
/// State machine: created → open → disposed; there are no transitions out
/// of disposed, and dispatch on a disposed session is a silent no-op.
#[derive(Debug)]
pub struct InspectorSession {
    shared: Weak<Shared>,
    state: Arc<SessionState>,
    rx: mpsc::UnboundedReceiver<String>,
    hook_id: u64,
}

impl InspectorSession {
    pub(crate) fn create(shared: &Arc<Shared>) -> Result<Self> {
        if !shared.inspector_enabled {
            return Err(ProgramError::InspectorDisabled);
        }
        if shared.is_disposed() {
            return Err(ProgramError::IsolateDisposed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState {
            disposed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });
        let hook_state = state.clone();
        let hook_id = program::add_dispose_hook(shared, Box::new(move || hook_state.close()));
        Ok(Self {
            shared: Arc::downgrade(shared),
            state,
            rx,
            hook_id,
        })
    }

    /// Feed one raw protocol message into the session.
    ///
    /// Responses and notifications come back through
    /// [`next_message`](Self::next_message). Dispatch on a disposed session
    /// does nothing; malformed JSON is an error, never a crash.
    pub fn dispatch_protocol_message(&self, raw: &str) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let mut message: Json = serde_json::from_str(raw).map_err(|e| {
            ProgramError::internal(format!("malformed protocol message: {e}"))
        })?;
        let method = message
            .get("method")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();

        match method.as_str() {
            "Runtime.compileScript" => {
                let id = message.get("id").cloned().unwrap_or(Json::Null);
                if let Some(tx) = self.state.sender() {
                    let _ = tx.send(json!({ "id": id, "result": { "fake": true } }).to_string());
                }
                return Ok(());
            }
            "Runtime.evaluate" => {
                if let Some(params) = message.get_mut("params").and_then(Json::as_object_mut) {
                    params.remove("replMode");
                    params.remove("awaitPromise");
                }
            }
            _ => {}
        }

        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let Some(tx) = self.state.sender() else {
            return Ok(());
        };
        // after disposal this is a silent no-op, like dispatch itself
        let _ = shared.send(Command::Inspector {
            message,
            out: tx,
        });
        Ok(())
    }

    /// Await the next response or notification; `None` once the session is
    /// disposed and drained.
    pub async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next_message`](Self::next_message).
    pub fn try_next_message(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Whether the session is disposed.
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Dispose the session and detach it from the program. The program is
    /// not affected. Idempotent.
    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.close();
        if let Some(shared) = self.shared.upgrade() {
            program::remove_dispose_hook(&shared, self.hook_id);
        }
    }
}

impl Drop for InspectorSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
