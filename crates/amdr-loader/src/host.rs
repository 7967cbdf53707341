// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Script hosts
//!
//! The loader never reads files or sockets itself. A [`ScriptHost`] turns a
//! URL into "the script ran" (scripts announce modules by calling
//! [`Context::define`]) and serves text resources to plugins.
//!
//! [`MemoryHost`] keeps scripts as closures and text in a table. It can
//! act as a blocking host (the script runs inside `import_script`) or as an
//! asynchronous one (the script runs on a timer after some latency).

use crate::error::{LoaderError, Result};
use crate::module_system::{Context, WeakContext};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

/// Completion callback for [`ScriptHost::fetch_text`]
pub type TextCallback = Box<dyn FnOnce(Result<String>)>;

/// Where scripts and text resources come from
pub trait ScriptHost {
    /// Whether `import_script` runs the script before returning
    fn supports_blocking_import(&self) -> bool {
        false
    }

    /// Fetch and run a script synchronously
    fn import_script(&self, context: &Context, url: &str) -> Result<()> {
        let _ = context;
        Err(LoaderError::msg(format!(
            "host cannot import {} synchronously",
            url
        )))
    }

    /// Start loading a script; report through `request` once it ran
    fn load_script(&self, request: ScriptRequest) {
        let reason = format!("host cannot load {} asynchronously", request.url());
        request.failed(reason);
    }

    /// Fetch a text resource
    fn fetch_text(&self, context: &Context, url: &str, done: TextCallback) {
        let _ = context;
        done(Err(LoaderError::msg(format!("host cannot fetch {}", url))));
    }

    /// Evaluate module source handed to `load.fromText`
    ///
    /// The default treats the text as the body of an anonymous module:
    /// JSON text exports the parsed value, anything else exports the text.
    fn exec(&self, context: &Context, text: &str) -> Result<()> {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => Value::from_json(&json),
            Err(_) => Value::String(text.to_string()),
        };
        context.define(None, &[], value);
        Ok(())
    }
}

/// An outstanding asynchronous script load
///
/// Consumed by [`ScriptRequest::loaded`] or [`ScriptRequest::failed`], so
/// completion is reported at most once.
pub struct ScriptRequest {
    context: WeakContext,
    module_id: String,
    url: String,
}

impl ScriptRequest {
    pub(crate) fn new(context: WeakContext, module_id: String, url: String) -> Self {
        Self {
            context,
            module_id,
            url,
        }
    }

    /// Context that asked for the script
    pub fn context(&self) -> Option<Context> {
        self.context.upgrade()
    }

    /// Id of the module the script is expected to define
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// URL to load
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The script ran
    pub fn loaded(self) {
        if let Some(ctx) = self.context.upgrade() {
            ctx.script_loaded(&self.module_id);
        }
    }

    /// The script could not be loaded
    pub fn failed(self, reason: impl std::fmt::Display) {
        if let Some(ctx) = self.context.upgrade() {
            ctx.script_failed(&self.module_id, &self.url, reason.to_string());
        }
    }
}

impl std::fmt::Debug for ScriptRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRequest")
            .field("module_id", &self.module_id)
            .field("url", &self.url)
            .finish()
    }
}

/// A script body: runs against the loading context
pub type Script = Rc<dyn Fn(&Context) -> Result<()>>;

/// How a [`MemoryHost`] delivers scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    /// Scripts run inside `import_script`
    Blocking,
    /// Scripts run on a timer
    Async {
        /// Delay before a script runs or a text resource arrives
        latency: Duration,
    },
}

/// In-memory [`ScriptHost`]
pub struct MemoryHost {
    mode: HostMode,
    scripts: RefCell<HashMap<String, Script>>,
    texts: RefCell<HashMap<String, String>>,
    stalled: RefCell<HashSet<String>>,
    fetches: RefCell<HashMap<String, usize>>,
}

impl MemoryHost {
    /// Host whose scripts run synchronously
    pub fn blocking() -> Self {
        Self::new(HostMode::Blocking)
    }

    /// Host whose scripts run `latency` after being requested
    pub fn with_latency(latency: Duration) -> Self {
        Self::new(HostMode::Async { latency })
    }

    /// Create a host in the given mode
    pub fn new(mode: HostMode) -> Self {
        Self {
            mode,
            scripts: RefCell::new(HashMap::new()),
            texts: RefCell::new(HashMap::new()),
            stalled: RefCell::new(HashSet::new()),
            fetches: RefCell::new(HashMap::new()),
        }
    }

    /// Delivery mode
    pub fn mode(&self) -> HostMode {
        self.mode
    }

    /// Serve `script` at `url`
    pub fn add_script(&self, url: impl Into<String>, script: impl Fn(&Context) -> Result<()> + 'static) {
        self.scripts.borrow_mut().insert(url.into(), Rc::new(script));
    }

    /// Serve `text` at `url`
    pub fn add_text(&self, url: impl Into<String>, text: impl Into<String>) {
        self.texts.borrow_mut().insert(url.into(), text.into());
    }

    /// Never complete loads of `url` (asynchronous mode)
    pub fn stall(&self, url: impl Into<String>) {
        self.stalled.borrow_mut().insert(url.into());
    }

    /// Number of times `url` was requested
    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.borrow().get(url).copied().unwrap_or(0)
    }

    /// Number of requests for any URL
    pub fn total_fetches(&self) -> usize {
        self.fetches.borrow().values().sum()
    }

    fn record_fetch(&self, url: &str) {
        *self.fetches.borrow_mut().entry(url.to_string()).or_insert(0) += 1;
    }

    fn script(&self, url: &str) -> Option<Script> {
        self.scripts.borrow().get(url).cloned()
    }

    fn text(&self, url: &str) -> Result<String> {
        self.texts
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| LoaderError::msg(format!("404 Not Found: {}", url)))
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::blocking()
    }
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("mode", &self.mode)
            .field("scripts", &self.scripts.borrow().len())
            .field("texts", &self.texts.borrow().len())
            .finish()
    }
}

impl ScriptHost for MemoryHost {
    fn supports_blocking_import(&self) -> bool {
        self.mode == HostMode::Blocking
    }

    fn import_script(&self, context: &Context, url: &str) -> Result<()> {
        self.record_fetch(url);
        match self.script(url) {
            Some(script) => script(context),
            None => Err(LoaderError::msg(format!("404 Not Found: {}", url))),
        }
    }

    fn load_script(&self, request: ScriptRequest) {
        self.record_fetch(request.url());
        if self.stalled.borrow().contains(request.url()) {
            tracing::trace!(url = %request.url(), "stalling script load");
            return;
        }
        let Some(ctx) = request.context() else {
            return;
        };
        let latency = match self.mode {
            HostMode::Async { latency } => latency,
            HostMode::Blocking => Duration::ZERO,
        };
        let script = self.script(request.url());
        ctx.event_loop().set_timeout(latency, move || {
            let Some(ctx) = request.context() else {
                return;
            };
            match script {
                Some(script) => match script(&ctx) {
                    Ok(()) => request.loaded(),
                    Err(err) => request.failed(err),
                },
                None => {
                    let reason = format!("404 Not Found: {}", request.url());
                    request.failed(reason);
                }
            }
        });
    }

    fn fetch_text(&self, context: &Context, url: &str, done: TextCallback) {
        self.record_fetch(url);
        let result = self.text(url);
        match self.mode {
            HostMode::Blocking => done(result),
            HostMode::Async { latency } => {
                context.event_loop().set_timeout(latency, move || done(result));
            }
        }
    }
}
