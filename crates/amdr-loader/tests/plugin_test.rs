// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader plugin tests

use amdr_loader::{
    Config, Context, Factory, LoadCallback, Loader, LoaderConfig, LoaderError, LoaderPlugin,
    LocalRequire, MemoryHost, Result, TextPlugin, Value,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

type Captured = Rc<RefCell<Option<Vec<Value>>>>;

fn capture(ctx: &Context, deps: &[&str]) -> Captured {
    let slot: Captured = Rc::new(RefCell::new(None));
    let out = Rc::clone(&slot);
    ctx.require(
        deps,
        move |values| {
            *out.borrow_mut() = Some(values.to_vec());
            Ok(())
        },
        None,
    );
    slot
}

fn capture_error(ctx: &Context, deps: &[&str]) -> Rc<RefCell<Option<LoaderError>>> {
    let slot = Rc::new(RefCell::new(None));
    let out = Rc::clone(&slot);
    ctx.require(
        deps,
        |_| Ok(()),
        Some(Box::new(move |err: LoaderError| *out.borrow_mut() = Some(err))),
    );
    slot
}

fn setup(host: MemoryHost) -> (Rc<MemoryHost>, Loader, Context) {
    let host = Rc::new(host);
    let loader = Loader::new(host.clone());
    let ctx = loader.default_context();
    (host, loader, ctx)
}

/// Fetches text and evaluates it as module source
struct SourcePlugin;

impl LoaderPlugin for SourcePlugin {
    fn load(&self, name: &str, require: &LocalRequire, onload: LoadCallback, _config: &Config) -> Result<()> {
        let url = require.to_url(name)?;
        let ctx = require.context()?;
        ctx.host().fetch_text(
            &ctx,
            &url,
            Box::new(move |result| match result {
                Ok(text) => onload.from_text(&text),
                Err(err) => onload.error(err),
            }),
        );
        Ok(())
    }
}

/// Lower-cases resource names and echoes them back
struct LowerPlugin {
    loads: Rc<Cell<usize>>,
}

impl LoaderPlugin for LowerPlugin {
    fn normalize(&self, name: &str, _normalize: &dyn Fn(&str) -> String) -> String {
        name.to_lowercase()
    }

    fn load(&self, name: &str, _require: &LocalRequire, onload: LoadCallback, _config: &Config) -> Result<()> {
        self.loads.set(self.loads.get() + 1);
        onload.call(Value::from(name));
        Ok(())
    }
}

struct FailingPlugin;

impl LoaderPlugin for FailingPlugin {
    fn load(&self, name: &str, _require: &LocalRequire, onload: LoadCallback, _config: &Config) -> Result<()> {
        if name == "sync" {
            return Err(LoaderError::msg("refused"));
        }
        onload.error("nope");
        Ok(())
    }
}

#[tokio::test]
async fn test_text_plugin_loads_resource() {
    let (host, loader, ctx) = setup(MemoryHost::blocking());
    host.add_text("./tpl/view.html", "<p>hi</p>");
    ctx.define_plugin(TextPlugin::ID, TextPlugin);

    let result = capture(&ctx, &["text!tpl/view.html"]);
    loader.run().await.unwrap();

    assert_eq!(result.borrow().clone(), Some(vec![Value::from("<p>hi</p>")]));
    assert!(ctx.defined("text!tpl/view.html"));
    assert_eq!(host.fetch_count("./tpl/view.html"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_text_plugin_resolves_relative_to_module() {
    let (host, loader, ctx) = setup(MemoryHost::with_latency(Duration::from_millis(5)));
    host.add_text("./app/tpl.html", "template");
    ctx.define_plugin(TextPlugin::ID, TextPlugin);
    ctx.define(
        Some("app/view"),
        &["text!./tpl.html"],
        Factory::function(|deps| Ok(deps[0].clone())),
    );

    let result = capture(&ctx, &["app/view"]);
    loader.run().await.unwrap();

    assert_eq!(result.borrow().clone(), Some(vec![Value::from("template")]));
}

#[tokio::test]
async fn test_from_text_evaluates_source() {
    let (host, loader, ctx) = setup(MemoryHost::blocking());
    host.add_text("./file.txt", "plain contents");
    host.add_text("./data.json", r#"{ "answer": 42 }"#);
    ctx.define_plugin("textPlugin", SourcePlugin);

    let result = capture(&ctx, &["textPlugin!file.txt", "textPlugin!data.json"]);
    loader.run().await.unwrap();

    let values = result.borrow().clone().unwrap();
    assert_eq!(values[0], Value::from("plain contents"));
    assert_eq!(values[1].as_object().unwrap().get("answer"), Some(Value::from(42)));
    assert!(ctx.defined("file.txt"));
}

#[tokio::test]
async fn test_plugin_normalize_dedupes_loads() {
    let (_host, loader, ctx) = setup(MemoryHost::blocking());
    let loads = Rc::new(Cell::new(0));
    ctx.define_plugin(
        "lower",
        LowerPlugin {
            loads: Rc::clone(&loads),
        },
    );

    // The plugin is not loaded yet: both ids start out provisional
    let upper = capture(&ctx, &["lower!ABC"]);
    let lower = capture(&ctx, &["lower!abc"]);
    loader.run().await.unwrap();

    assert_eq!(upper.borrow().clone(), Some(vec![Value::from("abc")]));
    assert_eq!(lower.borrow().clone(), Some(vec![Value::from("abc")]));
    assert_eq!(loads.get(), 1);

    // Now the plugin normalizes up front
    let mixed = capture(&ctx, &["lower!AbC"]);
    loader.run().await.unwrap();
    assert_eq!(mixed.borrow().clone(), Some(vec![Value::from("abc")]));
    assert_eq!(loads.get(), 1);
}

#[tokio::test]
async fn test_plugin_error_reaches_errback() {
    let (_host, loader, ctx) = setup(MemoryHost::blocking());
    ctx.define_plugin("failing", FailingPlugin);

    let reported = capture_error(&ctx, &["failing!x"]);
    let returned = capture_error(&ctx, &["failing!sync"]);
    loader.run().await.unwrap();

    let err = reported.borrow().clone().unwrap();
    assert!(matches!(err, LoaderError::Plugin { ref id, ref reason } if id == "failing!x" && reason == "nope"));
    let err = returned.borrow().clone().unwrap();
    assert!(matches!(err, LoaderError::Plugin { ref reason, .. } if reason == "refused"));
}

#[tokio::test]
async fn test_prefix_must_be_a_plugin() {
    let (_host, loader, ctx) = setup(MemoryHost::blocking());
    ctx.define(Some("notplugin"), &[], Value::from(5));

    let failure = capture_error(&ctx, &["notplugin!x"]);
    loader.run().await.unwrap();

    let err = failure.borrow().clone().unwrap();
    assert!(matches!(err, LoaderError::NotAPlugin(ref id) if id == "notplugin"));
}

#[tokio::test]
async fn test_bundled_plugin_resource() {
    let (host, loader, _) = setup(MemoryHost::blocking());
    host.add_script("./views.js", |ctx| {
        ctx.define(Some("text!a.html"), &[], Value::from("from bundle"));
        Ok(())
    });
    let ctx = loader.config(
        &LoaderConfig::from_json_str(r#"{ "bundles": { "views": ["text!a.html"] } }"#).unwrap(),
    );
    ctx.define_plugin(TextPlugin::ID, TextPlugin);

    let result = capture(&ctx, &["text!a.html"]);
    loader.run().await.unwrap();

    assert_eq!(result.borrow().clone(), Some(vec![Value::from("from bundle")]));
    assert_eq!(host.fetch_count("./a.html"), 0);
    assert_eq!(host.fetch_count("./views.js"), 1);
}

#[tokio::test]
async fn test_missing_text_resource() {
    let (_host, loader, ctx) = setup(MemoryHost::blocking());
    ctx.define_plugin(TextPlugin::ID, TextPlugin);

    let failure = capture_error(&ctx, &["text!missing.html"]);
    loader.run().await.unwrap();

    let err = failure.borrow().clone().unwrap();
    assert_eq!(err.require_modules(), vec!["text!missing.html".to_string()]);
    assert!(err.to_string().contains("404 Not Found: ./missing.html"));
}
