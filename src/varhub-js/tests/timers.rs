//! Virtual timer contracts: ids, firing, clearing, teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value as Json, json};
use varhub_js::{
    HostFunction, MemorySourceProvider, Program, ProgramOptions, SourceText,
};

fn program_with(modules: &[(&str, &str)]) -> Program {
    let mut provider = MemorySourceProvider::new();
    for (name, text) in modules {
        provider.insert(*name, SourceText::js(*text));
    }
    Program::new(provider, ProgramOptions::default()).unwrap()
}

/// Poll an exported value until it satisfies a predicate or time runs out.
async fn wait_for(
    module: &varhub_js::ProgramModule,
    prop: &str,
    predicate: impl Fn(&Json) -> bool,
) -> Json {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let value = module.get_prop(prop).await.unwrap();
        if predicate(&value) {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {prop}, last value: {value}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn timeout_fires_with_its_arguments() {
    let program = program_with(&[(
        "index.js",
        "export const hits = [];\n\
         export function arm(ms){ setTimeout((v) => hits.push(v), ms, \"tick\") }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    module.call_method("arm", None, vec![json!(10)]).await.unwrap();
    let hits = wait_for(&module, "hits", |v| v != &json!([])).await;
    assert_eq!(hits, json!(["tick"]));
}

#[tokio::test]
async fn timer_ids_are_positive_and_unique_per_kind() {
    let program = program_with(&[(
        "index.js",
        "export function ids(){\n\
             const a = setTimeout(() => {}, 60000);\n\
             const b = setTimeout(() => {}, 60000);\n\
             const c = setInterval(() => {}, 60000);\n\
             clearTimeout(a); clearTimeout(b); clearInterval(c);\n\
             return [a, b, c];\n\
         }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    let ids = module.call_method("ids", None, vec![]).await.unwrap();
    let a = ids[0].as_u64().unwrap();
    let b = ids[1].as_u64().unwrap();
    let c = ids[2].as_u64().unwrap();
    assert!(a >= 1, "ids are positive");
    assert!(b > a, "timeout ids grow");
    assert!(c >= 1, "interval ids are counted per kind");
}

#[tokio::test]
async fn cleared_timeout_never_fires() {
    let program = program_with(&[(
        "index.js",
        "export const hits = [];\n\
         // zero delay: the native timer may fire before the clear command\n\
         // is even processed, the callback must still be suppressed\n\
         export function arm_and_clear(){\n\
             const id = setTimeout(() => hits.push(\"boom\"), 0);\n\
             clearTimeout(id);\n\
         }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    module.call_method("arm_and_clear", None, vec![]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(module.get_prop("hits").await.unwrap(), json!([]));
}

#[tokio::test]
async fn interval_repeats_until_cleared() {
    let program = program_with(&[(
        "index.js",
        "export const hits = [];\n\
         let id = null;\n\
         export function arm(){ id = setInterval(() => hits.push(1), 15) }\n\
         export function stop(){ clearInterval(id) }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    module.call_method("arm", None, vec![]).await.unwrap();
    wait_for(&module, "hits", |v| {
        v.as_array().is_some_and(|a| a.len() >= 2)
    })
    .await;
    module.call_method("stop", None, vec![]).await.unwrap();
    let frozen = module.get_prop("hits").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(module.get_prop("hits").await.unwrap(), frozen);
}

#[tokio::test]
async fn immediate_fires_and_passes_arguments() {
    let program = program_with(&[(
        "index.js",
        "export const hits = [];\n\
         export function arm(){ setImmediate((v) => hits.push(v), \"now\") }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    module.call_method("arm", None, vec![]).await.unwrap();
    let hits = wait_for(&module, "hits", |v| v != &json!([])).await;
    assert_eq!(hits, json!(["now"]));
}

#[tokio::test]
async fn non_function_callback_is_a_guest_type_error() {
    let program = program_with(&[(
        "index.js",
        "export function bad(){\n\
             try { setTimeout(42, 0); } catch (e) {\n\
                 return e instanceof TypeError ? \"type-error\" : \"other\";\n\
             }\n\
             return \"no-throw\";\n\
         }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    let result = module.call_method("bad", None, vec![]).await.unwrap();
    assert_eq!(result, json!("type-error"));
}

#[tokio::test]
async fn no_timer_fires_after_dispose() {
    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    let program = program_with(&[(
        "index.js",
        "import { record } from \"varhub:probe\";\n\
         export function arm(){ setTimeout(() => record(), 40); setInterval(() => record(), 40) }",
    )]);
    program
        .register_host_function(
            "varhub:probe",
            "record",
            HostFunction::from_sync(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
                Ok(Json::Null)
            }),
        )
        .unwrap();
    let module = program.get_module("index.js").await.unwrap();
    module.call_method("arm", None, vec![]).await.unwrap();
    program.dispose();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        fired.load(Ordering::SeqCst),
        0,
        "no guest callback may fire after disposal"
    );
}
