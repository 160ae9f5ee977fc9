//! Cross-boundary value semantics: host functions, envelopes, guest errors.

use std::time::Duration;

use serde_json::{Value as Json, json};
use varhub_js::{
    HostCallResult, HostFunction, MemorySourceProvider, Program, ProgramError, ProgramOptions,
    SourceText,
};

fn program_with(modules: &[(&str, &str)]) -> Program {
    let mut provider = MemorySourceProvider::new();
    for (name, text) in modules {
        provider.insert(*name, SourceText::js(*text));
    }
    Program::new(provider, ProgramOptions::default()).unwrap()
}

#[tokio::test]
async fn identity_round_trip() {
    let program = program_with(&[("index.js", "export function identity(x){ return x }")]);
    let module = program.get_module("index.js").await.unwrap();
    let value = json!({"a": [1, 2, {"b": "x"}], "n": null, "flag": true});
    let result = module
        .call_method("identity", None, vec![value.clone()])
        .await
        .unwrap();
    assert_eq!(result, value);
}

#[tokio::test]
async fn guest_sync_throw_crosses_verbatim() {
    let program = program_with(&[("index.js", "export function boom(x){ throw x + 1 }")]);
    let module = program.get_module("index.js").await.unwrap();
    let err = module.call_method("boom", None, vec![json!(30)]).await.unwrap_err();
    assert!(matches!(err, ProgramError::Guest(v) if v == json!(31)));
}

#[tokio::test]
async fn guest_async_throw_preserves_the_value() {
    let program = program_with(&[(
        "index.js",
        "export async function boom(x){ await Promise.resolve(); throw x + 1 }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    let err = module.call_method("boom", None, vec![json!(40)]).await.unwrap_err();
    // rejects with exactly 41, not an Error wrapping 41
    assert!(matches!(err, ProgramError::Guest(v) if v == json!(41)));
}

#[tokio::test]
async fn guest_error_objects_cross_as_records() {
    let program = program_with(&[(
        "index.js",
        "export function boom(){ throw new TypeError(\"bad input\") }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    let err = module.call_method("boom", None, vec![]).await.unwrap_err();
    match err {
        ProgramError::Guest(value) => {
            assert_eq!(value["name"], json!("TypeError"));
            assert_eq!(value["message"], json!("bad input"));
        }
        other => panic!("expected Guest, got {other:?}"),
    }
}

#[tokio::test]
async fn guest_promise_results_are_awaited() {
    let program = program_with(&[(
        "index.js",
        "export async function later(x){ await Promise.resolve(); return x * 2 }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    let result = module.call_method("later", None, vec![json!(21)]).await.unwrap();
    assert_eq!(result, json!(42));
}

#[tokio::test]
async fn this_value_is_copied_in_when_truthy() {
    let program = program_with(&[(
        "index.js",
        "export function read(){ return this && this.tag ? this.tag : \"no-this\" }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    let with_this = module
        .call_method("read", Some(json!({"tag": "here"})), vec![])
        .await
        .unwrap();
    assert_eq!(with_this, json!("here"));
    let without = module.call_method("read", None, vec![]).await.unwrap();
    assert_eq!(without, json!("no-this"));
}

#[tokio::test]
async fn host_function_sync_value() {
    let program = program_with(&[(
        "index.js",
        "import { double } from \"varhub:api\"; export function run(x){ return double(x) }",
    )]);
    program
        .register_host_function(
            "varhub:api",
            "double",
            HostFunction::from_sync(|args| {
                let n = args.first().and_then(Json::as_f64).unwrap_or(0.0);
                Ok(json!(n * 2.0))
            }),
        )
        .unwrap();
    let module = program.get_module("index.js").await.unwrap();
    let result = module.call_method("run", None, vec![json!(10)]).await.unwrap();
    assert_eq!(result, json!(20));
}

#[tokio::test]
async fn host_function_sync_error_is_a_synchronous_throw() {
    let program = program_with(&[(
        "index.js",
        "import { boom } from \"varhub:api\";\n\
         export function probe(){\n\
             try { boom(); } catch (e) { return [\"threw\", e]; }\n\
             return [\"no-throw\"];\n\
         }",
    )]);
    program
        .register_host_function(
            "varhub:api",
            "boom",
            HostFunction::from_sync(|_| Err(json!(31))),
        )
        .unwrap();
    let module = program.get_module("index.js").await.unwrap();
    // a synchronous catch sees the thrown value: the trichotomy is preserved
    let result = module.call_method("probe", None, vec![]).await.unwrap();
    assert_eq!(result, json!(["threw", 31]));
}

#[tokio::test]
async fn host_function_future_resolves_a_promise() {
    let program = program_with(&[(
        "index.js",
        "import { delayed } from \"varhub:api\";\n\
         export async function run(){ return await delayed() }",
    )]);
    program
        .register_host_function(
            "varhub:api",
            "delayed",
            HostFunction::new(|_| {
                HostCallResult::Future(Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!(7))
                }))
            }),
        )
        .unwrap();
    let module = program.get_module("index.js").await.unwrap();
    let result = module.call_method("run", None, vec![]).await.unwrap();
    assert_eq!(result, json!(7));
}

#[tokio::test]
async fn host_function_future_rejection_preserves_the_value() {
    let program = program_with(&[(
        "index.js",
        "import { failing } from \"varhub:api\";\n\
         export async function run(){\n\
             try { await failing(); } catch (e) { return [\"rejected\", e]; }\n\
             return [\"resolved\"];\n\
         }",
    )]);
    program
        .register_host_function(
            "varhub:api",
            "failing",
            HostFunction::new(|_| {
                HostCallResult::Future(Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Err(json!(41))
                }))
            }),
        )
        .unwrap();
    let module = program.get_module("index.js").await.unwrap();
    let result = module.call_method("run", None, vec![]).await.unwrap();
    assert_eq!(result, json!(["rejected", 41]));
}

#[tokio::test]
async fn host_function_sees_its_arguments_as_json() {
    let program = program_with(&[(
        "index.js",
        "import { echo } from \"varhub:api\"; export function run(){ return echo(1, \"two\", {three: 3}) }",
    )]);
    program
        .register_host_function(
            "varhub:api",
            "echo",
            HostFunction::from_sync(|args| Ok(Json::Array(args))),
        )
        .unwrap();
    let module = program.get_module("index.js").await.unwrap();
    let result = module.call_method("run", None, vec![]).await.unwrap();
    assert_eq!(result, json!([1, "two", {"three": 3}]));
}

#[tokio::test]
async fn host_module_names_are_guarded() {
    let program = program_with(&[]);
    let func = HostFunction::from_sync(|_| Ok(Json::Null));
    assert!(program.register_host_function("", "ok", func.clone()).is_err());
    assert!(
        program
            .register_host_function("varhub:api", "not-an-identifier", func.clone())
            .is_err()
    );
    assert!(
        program
            .register_host_function("bad#module", "ok", func.clone())
            .is_err()
    );
    assert!(program.register_host_function("varhub:api", "ok", func).is_ok());
}

#[tokio::test]
async fn wrapping_primitive_is_unreachable_from_guest_modules() {
    let program = program_with(&[(
        "index.js",
        "import \"varhub:internal/host\"; export const leaked = true;",
    )]);
    program
        .register_host_function("varhub:api", "noop", HostFunction::from_sync(|_| Ok(Json::Null)))
        .unwrap();
    let err = program.get_module("index.js").await.unwrap_err();
    assert!(matches!(err, ProgramError::PrivateModule { .. }));
}

#[tokio::test]
async fn module_reflection_reports_types_and_keys() {
    let program = program_with(&[(
        "index.js",
        "export const n = 1;\n\
         export const s = \"txt\";\n\
         export function f(){}\n\
         export const o = { nested: true };",
    )]);
    let module = program.get_module("index.js").await.unwrap();

    let mut keys = module.get_keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, ["f", "n", "o", "s"]);

    assert_eq!(module.get_type("n").unwrap().as_deref(), Some("number"));
    assert_eq!(module.get_type("s").unwrap().as_deref(), Some("string"));
    assert_eq!(module.get_type("f").unwrap().as_deref(), Some("function"));
    assert_eq!(module.get_type("o").unwrap().as_deref(), Some("object"));
    assert_eq!(module.get_type("missing").unwrap(), None);

    assert_eq!(module.get_prop("o").await.unwrap(), json!({"nested": true}));
    // functions copy as null through the JSON boundary
    assert_eq!(module.get_prop("f").await.unwrap(), Json::Null);
}

#[tokio::test]
async fn ignored_dispatch_swallows_errors() {
    let program = program_with(&[(
        "index.js",
        "export const hits = [];\n\
         export function record(x){ hits.push(x) }\n\
         export function boom(){ throw new Error(\"ignored\") }",
    )]);
    let module = program.get_module("index.js").await.unwrap();
    module.call_method_ignored("boom", None, vec![]);
    module.call_method_ignored("record", None, vec![json!("evt")]);
    // the program survives ignored failures and stays usable
    let hits = module.get_prop("hits").await.unwrap();
    assert_eq!(hits, json!(["evt"]));
}
