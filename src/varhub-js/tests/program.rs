//! Program lifecycle: disposal, hooks, the dispose event, rpc bootstrap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use varhub_js::{
    MemorySourceProvider, Program, ProgramError, ProgramOptions, SourceText,
};

fn program_with(modules: &[(&str, &str)]) -> Program {
    let mut provider = MemorySourceProvider::new();
    for (name, text) in modules {
        provider.insert(*name, SourceText::js(*text));
    }
    Program::new(provider, ProgramOptions::default()).unwrap()
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let program = program_with(&[]);
    assert!(!program.is_disposed());
    program.dispose();
    assert!(program.is_disposed());
    program.dispose();
    assert!(program.is_disposed());
}

#[tokio::test]
async fn operations_after_dispose_fail_with_isolate_disposed() {
    let program = program_with(&[("index.js", "export function f(){ return 1 }")]);
    let module = program.get_module("index.js").await.unwrap();
    program.dispose();

    let err = program.get_module("index.js").await.unwrap_err();
    assert!(matches!(err, ProgramError::IsolateDisposed));
    let err = module.call_method("f", None, vec![]).await.unwrap_err();
    assert!(matches!(err, ProgramError::IsolateDisposed));
    let err = module.get_type("f").unwrap_err();
    assert!(matches!(err, ProgramError::IsolateDisposed));
    let err = program.create_module("x.js", "export {}", None).await.unwrap_err();
    assert!(matches!(err, ProgramError::IsolateDisposed));
}

#[tokio::test]
async fn dropping_the_handle_disposes_the_program() {
    let module = {
        let program = program_with(&[("index.js", "export function f(){ return 1 }")]);
        program.get_module("index.js").await.unwrap()
        // program dropped here
    };
    let err = module.call_method("f", None, vec![]).await.unwrap_err();
    assert!(matches!(err, ProgramError::IsolateDisposed));
}

#[tokio::test]
async fn dispose_hooks_run_in_insertion_order_once() {
    let program = program_with(&[]);
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = order.clone();
    program.on_dispose(move || first.lock().unwrap().push("first"));
    let second = order.clone();
    program.on_dispose(move || second.lock().unwrap().push("second"));
    let removed = order.clone();
    let id = program.on_dispose(move || removed.lock().unwrap().push("removed"));
    assert!(program.remove_dispose_hook(id));

    program.dispose();
    program.dispose();
    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
}

#[tokio::test]
async fn panicking_hooks_are_swallowed() {
    let program = program_with(&[]);
    let order = Arc::new(Mutex::new(Vec::new()));

    program.on_dispose(|| panic!("teardown must not fail"));
    let after = order.clone();
    program.on_dispose(move || after.lock().unwrap().push("ran"));

    program.dispose();
    assert!(program.is_disposed());
    assert_eq!(*order.lock().unwrap(), ["ran"]);
}

#[tokio::test]
async fn hooks_registered_after_dispose_run_immediately() {
    let program = program_with(&[]);
    program.dispose();
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    let id = program.on_dispose(move || *flag.lock().unwrap() = true);
    assert_eq!(id, 0);
    assert!(*ran.lock().unwrap());
}

#[tokio::test]
async fn dispose_event_reaches_every_waiter() {
    let program = Arc::new(program_with(&[]));
    let waiter = {
        let program = program.clone();
        tokio::spawn(async move { program.disposed().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    program.dispose();
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("dispose event must fire")
        .unwrap();
    // late waiters resolve immediately
    program.disposed().await;
}

#[tokio::test]
async fn run_gc_keeps_the_program_usable() {
    let program = program_with(&[("index.js", "export function f(){ return ({}).x === undefined }")]);
    let module = program.get_module("index.js").await.unwrap();
    program.run_gc();
    assert_eq!(module.call_method("f", None, vec![]).await.unwrap(), json!(true));
}

#[tokio::test]
async fn start_rpc_binds_the_user_module_as_the_form() {
    let program = program_with(&[
        (
            "varhub:rpc",
            "export function start(form){ return \"rpc:\" + form.NAME }",
        ),
        ("index.js", "export const NAME = \"room-1\";"),
    ]);
    let result = program.start_rpc("index.js").await.unwrap();
    assert_eq!(result, json!("rpc:room-1"));
}

#[tokio::test]
async fn start_rpc_without_the_builtin_fails() {
    let program = program_with(&[("index.js", "export const NAME = \"room-1\";")]);
    let err = program.start_rpc("index.js").await.unwrap_err();
    assert!(matches!(err, ProgramError::ModuleNotFound { descriptor, .. } if descriptor == "varhub:rpc"));
}

#[tokio::test]
async fn start_rpc_unknown_module_fails_early() {
    let program = program_with(&[(
        "varhub:rpc",
        "export function start(){ return true }",
    )]);
    let err = program.start_rpc("ghost.js").await.unwrap_err();
    assert!(matches!(err, ProgramError::ModuleNotFound { descriptor, .. } if descriptor == "ghost.js"));
}
