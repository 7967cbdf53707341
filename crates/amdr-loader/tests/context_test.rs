// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Named context tests

use amdr_loader::{DEFAULT_CONTEXT, Loader, LoaderConfig, LoaderError, MemoryHost, Value};
use std::rc::Rc;

fn loader_with_script() -> (Rc<MemoryHost>, Loader) {
    let host = Rc::new(MemoryHost::blocking());
    host.add_script("./x.js", |ctx| {
        ctx.define(None, &[], Value::from(ctx.name()));
        Ok(())
    });
    let loader = Loader::new(host.clone());
    (host, loader)
}

#[tokio::test]
async fn test_contexts_keep_separate_registries() {
    let (host, loader) = loader_with_script();
    let default = loader.default_context();
    let other = loader.context("other");

    let a = default.require_all(&["x"]);
    let b = other.require_all(&["x"]);
    loader.run().await.unwrap();

    assert_eq!(a.value(), Some(Value::array(vec![Value::from(DEFAULT_CONTEXT)])));
    assert_eq!(b.value(), Some(Value::array(vec![Value::from("other")])));
    // URL dedupe is per context
    assert_eq!(host.fetch_count("./x.js"), 2);
    assert_eq!(loader.context_names(), vec!["_".to_string(), "other".to_string()]);
}

#[tokio::test]
async fn test_config_applies_to_named_context_only() {
    let (_host, loader) = loader_with_script();
    let configured = loader.config(&LoaderConfig {
        context: Some("assets".to_string()),
        base_url: Some("static".to_string()),
        ..Default::default()
    });

    assert_eq!(configured.name(), "assets");
    assert_eq!(configured.to_url("img/logo.png"), "static/img/logo.png");
    assert_eq!(loader.default_context().to_url("img/logo.png"), "./img/logo.png");
}

#[tokio::test]
async fn test_not_loaded_error_names_the_context() {
    let (_host, loader) = loader_with_script();
    let ctx = loader.context("isolated");

    let err = ctx.get("x").unwrap_err();
    assert!(matches!(err, LoaderError::NotLoaded { .. }));
    assert_eq!(
        err.to_string(),
        "Module name \"x\" has not been loaded yet for context: isolated"
    );
}

#[tokio::test]
async fn test_run_reports_errors_from_any_context() {
    let (_host, loader) = loader_with_script();
    let ctx = loader.context("broken");
    ctx.require(&["missing"], |_| Ok(()), None);

    let err = loader.run().await.unwrap_err();
    assert!(matches!(err, LoaderError::Fetch { ref id, .. } if id == "missing"));

    // Taken once
    loader.run().await.unwrap();
}
