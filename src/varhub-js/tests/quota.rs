//! Resource quotas: CPU wall-time watchdog and the engine memory cap.

use std::time::Duration;

use serde_json::json;
use varhub_js::{
    MemorySourceProvider, Program, ProgramError, ProgramOptions, QuotaOptions, SourceText,
};

fn spin_program() -> Program {
    let provider = MemorySourceProvider::new().with(
        "index.js",
        SourceText::js(
            "export function spin(){ for (;;) {} }\n\
             export function quick(){ return 1 }",
        ),
    );
    let options = ProgramOptions::default().with_quota(QuotaOptions {
        checkout: Duration::from_millis(150),
        max_delta: Duration::from_millis(100),
    });
    Program::new(provider, options).unwrap()
}

#[tokio::test]
async fn runaway_guest_is_disposed_by_the_watchdog() {
    let program = spin_program();
    let module = program.get_module("index.js").await.unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        module.call_method("spin", None, vec![]),
    )
    .await
    .expect("the watchdog must interrupt the spin")
    .unwrap_err();
    assert!(
        matches!(err, ProgramError::IsolateDisposed),
        "watchdog terminations surface as IsolateDisposed, got {err:?}"
    );

    // disposal follows within one checkout window
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !program.is_disposed() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "program must be disposed shortly after the quota trips"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    program.disposed().await;
}

#[tokio::test]
async fn well_behaved_guests_are_left_alone() {
    let program = spin_program();
    let module = program.get_module("index.js").await.unwrap();
    for _ in 0..5 {
        assert_eq!(module.call_method("quick", None, vec![]).await.unwrap(), json!(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    assert!(!program.is_disposed());
}

#[tokio::test]
async fn memory_limit_fails_the_allocation_not_the_host() {
    let provider = MemorySourceProvider::new().with(
        "index.js",
        SourceText::js(
            "export function alloc(mb){\n\
                 const a = new Uint8Array(mb * 1024 * 1024);\n\
                 for (let i = 0; i < a.length; i += 4096) a[i] = 1;\n\
                 return a.length;\n\
             }",
        ),
    );
    let program = Program::new(provider, ProgramOptions::default()).unwrap();
    let module = program.get_module("index.js").await.unwrap();

    // 12 MiB under an 8 MiB cap
    let err = module.call_method("alloc", None, vec![json!(12)]).await;
    assert!(err.is_err(), "allocation beyond the cap must fail");

    // a fresh program with the same cap serves small allocations
    let provider = MemorySourceProvider::new().with(
        "index.js",
        SourceText::js("export function alloc(mb){ return new Uint8Array(mb * 1024 * 1024).length }"),
    );
    let fresh = Program::new(provider, ProgramOptions::default()).unwrap();
    let module = fresh.get_module("index.js").await.unwrap();
    let ok = module.call_method("alloc", None, vec![json!(2)]).await.unwrap();
    assert_eq!(ok, json!(2 * 1024 * 1024));
}
