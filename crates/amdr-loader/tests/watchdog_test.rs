// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Load watchdog tests
//!
//! All of these run on tokio's paused clock, so the seconds below are
//! virtual.

use amdr_loader::{
    Context, Factory, Loader, LoaderConfig, LoaderError, MemoryHost, RecordState, Value,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

fn setup(latency_ms: u64, config: &str) -> (Rc<MemoryHost>, Loader, Context) {
    let host = Rc::new(MemoryHost::with_latency(Duration::from_millis(latency_ms)));
    let loader = Loader::new(host.clone());
    let ctx = loader.config(&LoaderConfig::from_json_str(config).unwrap());
    (host, loader, ctx)
}

fn collect_errors(ctx: &Context) -> Rc<RefCell<Vec<LoaderError>>> {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&errors);
    ctx.set_on_error(move |err| out.borrow_mut().push(err.clone()));
    errors
}

fn value_script(host: &MemoryHost, url: &str, value: Value) {
    host.add_script(url, move |ctx| {
        ctx.define(None, &[], value.clone());
        Ok(())
    });
}

#[tokio::test(start_paused = true)]
async fn test_stalled_script_times_out_once() {
    let (host, loader, ctx) = setup(10, r#"{ "waitSeconds": 1 }"#);
    host.stall("./a.js");
    let errors = collect_errors(&ctx);

    let start = Instant::now();
    ctx.require(&["a"], |_| panic!("a never loads"), None);
    loader.run().await.unwrap();

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        LoaderError::Timeout { ids } => assert_eq!(ids, &vec!["a".to_string()]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(errors[0].is_timeout());

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2));

    // Timed-out records are left pending, not rejected
    assert_eq!(ctx.module_state("a"), Some(RecordState::AwaitingSource));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_hook_is_returned() {
    let (host, loader, ctx) = setup(10, r#"{ "waitSeconds": 1 }"#);
    host.stall("./a.js");
    host.stall("./b.js");

    ctx.require(&["b", "a"], |_| Ok(()), None);
    let err = loader.run().await.unwrap_err();

    assert_eq!(err.require_modules(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_zero_wait_seconds_never_times_out() {
    let (host, loader, ctx) = setup(10, r#"{ "waitSeconds": 0 }"#);
    host.stall("./a.js");
    let errors = collect_errors(&ctx);

    ctx.require(&["a"], |_| Ok(()), None);
    loader.run_for(Duration::from_secs(30)).await.unwrap();

    assert!(errors.borrow().is_empty());
    assert_eq!(ctx.module_state("a"), Some(RecordState::AwaitingSource));
    assert_eq!(ctx.pending_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_script_within_deadline() {
    let (host, loader, ctx) = setup(500, r#"{ "waitSeconds": 1 }"#);
    value_script(&host, "./slow.js", Value::from("slow"));
    let errors = collect_errors(&ctx);

    let promise = ctx.require_all(&["slow"]);
    loader.run().await.unwrap();

    assert!(errors.borrow().is_empty());
    assert_eq!(promise.value(), Some(Value::array(vec![Value::from("slow")])));
}

#[tokio::test(start_paused = true)]
async fn test_cycle_across_scripts_is_broken() {
    let (host, loader, ctx) = setup(10, r#"{ "waitSeconds": 1 }"#);
    host.add_script("./a.js", |ctx| {
        ctx.define(None, &["b"], Factory::function(|deps| Ok(Value::array(deps.to_vec()))));
        Ok(())
    });
    host.add_script("./b.js", |ctx| {
        ctx.define(None, &["a"], Factory::function(|_| Ok(Value::from("b"))));
        Ok(())
    });
    let errors = collect_errors(&ctx);

    let promise = ctx.require_all(&["a"]);
    loader.run().await.unwrap();

    assert!(errors.borrow().is_empty());
    assert!(promise.is_fulfilled());
    assert_eq!(ctx.get("a").unwrap(), Value::array(vec![Value::from("b")]));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_switches_to_path_fallback() {
    let (host, loader, ctx) = setup(
        10,
        r#"{ "waitSeconds": 1, "paths": { "lib": ["slow/lib", "fast/lib"] } }"#,
    );
    host.stall("./slow/lib.js");
    value_script(&host, "./fast/lib.js", Value::from("fast"));
    let errors = collect_errors(&ctx);

    let promise = ctx.require_all(&["lib"]);
    loader.run().await.unwrap();

    assert!(errors.borrow().is_empty());
    assert_eq!(promise.value(), Some(Value::array(vec![Value::from("fast")])));
    assert_eq!(host.fetch_count("./slow/lib.js"), 1);
    assert_eq!(host.fetch_count("./fast/lib.js"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_require_restarts_the_clock() {
    let (host, loader, ctx) = setup(10, r#"{ "waitSeconds": 1 }"#);
    value_script(&host, "./early.js", Value::from(1));
    host.stall("./late.js");
    let errors = collect_errors(&ctx);

    ctx.require(&["early"], |_| Ok(()), None);
    loader.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    ctx.require(&["late"], |_| Ok(()), None);
    let restarted = Instant::now();
    loader.run().await.unwrap();

    assert_eq!(errors.borrow().len(), 1);
    assert!(restarted.elapsed() >= Duration::from_secs(1));
}
