// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Top-level loader: named contexts over one event loop

use crate::config::LoaderConfig;
use crate::error::Result;
use crate::host::ScriptHost;
use crate::module_system::Context;
use crate::runtime::EventLoop;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

/// Name of the context used when none is given
pub const DEFAULT_CONTEXT: &str = "_";

/// The module loader
pub struct Loader {
    /// Event loop shared by every context
    event_loop: Rc<EventLoop>,
    /// Script host shared by every context
    host: Rc<dyn ScriptHost>,
    /// Contexts by name
    contexts: RefCell<BTreeMap<String, Context>>,
}

impl Loader {
    /// Create a loader fetching through `host`
    pub fn new(host: Rc<dyn ScriptHost>) -> Self {
        Self {
            event_loop: Rc::new(EventLoop::new()),
            host,
            contexts: RefCell::new(BTreeMap::new()),
        }
    }

    /// The shared event loop
    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    /// Get or create the context called `name`
    pub fn context(&self, name: &str) -> Context {
        self.contexts
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Context::new(name, Rc::clone(&self.event_loop), Rc::clone(&self.host)))
            .clone()
    }

    /// The default context
    pub fn default_context(&self) -> Context {
        self.context(DEFAULT_CONTEXT)
    }

    /// Names of the contexts created so far
    pub fn context_names(&self) -> Vec<String> {
        self.contexts.borrow().keys().cloned().collect()
    }

    /// Apply configuration to the context it names (default otherwise)
    pub fn config(&self, options: &LoaderConfig) -> Context {
        let name = options.context.as_deref().unwrap_or(DEFAULT_CONTEXT);
        let context = self.context(name);
        context.configure(options);
        context
    }

    /// Drive the event loop until it is idle
    ///
    /// Returns the first unhandled error of any context.
    pub async fn run(&self) -> Result<()> {
        self.event_loop.run().await;
        self.first_uncaught()
    }

    /// Drive the event loop for at most `limit`
    pub async fn run_for(&self, limit: Duration) -> Result<()> {
        self.event_loop.run_for(limit).await;
        self.first_uncaught()
    }

    fn first_uncaught(&self) -> Result<()> {
        let contexts: Vec<Context> = self.contexts.borrow().values().cloned().collect();
        let mut first = Ok(());
        for context in contexts {
            if let Err(err) = context.take_uncaught() {
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("contexts", &self.context_names())
            .finish()
    }
}
