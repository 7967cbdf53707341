// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! `require` entry points
//!
//! The asynchronous form registers an anonymous top-level record on the
//! next tick; the synchronous form only reads values that are already
//! defined. [`LocalRequire`] is the same surface bound to a module, so
//! relative names resolve against it.

use crate::error::{LoaderError, Result};
use crate::module_system::context::{Context, WeakContext};
use crate::module_system::record::{Errback, Factory};
use crate::module_system::resolver::{ModuleIdentifier, name_to_url, normalize};
use crate::runtime::Promise;
use crate::value::Value;
use tokio::time::Instant;

/// A `require` bound to a context and, optionally, a module
#[derive(Clone)]
pub struct LocalRequire {
    context: WeakContext,
    rel_map: Option<ModuleIdentifier>,
}

impl LocalRequire {
    pub(crate) fn new(context: WeakContext, rel_map: Option<ModuleIdentifier>) -> Self {
        Self { context, rel_map }
    }

    /// The context this handle belongs to
    pub fn context(&self) -> Result<Context> {
        self.context.upgrade().ok_or(LoaderError::ContextDropped)
    }

    /// Module names resolve relative to this one
    pub fn relative_to(&self) -> Option<&ModuleIdentifier> {
        self.rel_map.as_ref()
    }

    /// Load `deps`, then call `callback` with their values in order
    pub fn require(
        &self,
        deps: &[&str],
        callback: impl FnOnce(&[Value]) -> Result<()> + 'static,
        errback: Option<Errback>,
    ) {
        match self.context() {
            Ok(ctx) => ctx.require_from(self.rel_map.clone(), deps, callback, errback),
            Err(err) => {
                if let Some(errback) = errback {
                    errback(err);
                }
            }
        }
    }

    /// Load `deps`; the promise fulfills with an array of their values
    pub fn require_all(&self, deps: &[&str]) -> Result<Promise> {
        Ok(self.context()?.require_all_from(self.rel_map.clone(), deps))
    }

    /// Value of an already defined module
    pub fn get(&self, id: &str) -> Result<Value> {
        self.context()?.get_from(self.rel_map.as_ref(), id)
    }

    /// URL for a module-relative path; an extension is kept as written
    pub fn to_url(&self, name_plus_ext: &str) -> Result<String> {
        Ok(self.context()?.to_url_from(self.rel_map.as_ref(), name_plus_ext))
    }

    /// Whether `id` has a value
    pub fn defined(&self, id: &str) -> bool {
        self.context()
            .map(|ctx| ctx.defined_from(self.rel_map.as_ref(), id))
            .unwrap_or(false)
    }

    /// Whether `id` has been requested or defined
    pub fn specified(&self, id: &str) -> bool {
        self.context()
            .map(|ctx| ctx.specified_from(self.rel_map.as_ref(), id))
            .unwrap_or(false)
    }

    /// Forget `id` so that it can be loaded again
    pub fn undef(&self, id: &str) {
        if let Ok(ctx) = self.context() {
            ctx.undef_from(self.rel_map.as_ref(), id);
        }
    }
}

impl std::fmt::Debug for LocalRequire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRequire")
            .field("context", &self.context)
            .field("relative_to", &self.rel_map.as_ref().map(|map| map.id.as_str()))
            .finish()
    }
}

impl Context {
    /// Handle for `require` calls outside any module
    pub fn local_require(&self) -> LocalRequire {
        LocalRequire::new(self.downgrade(), None)
    }

    /// Load `deps`, then call `callback` with their values in order
    ///
    /// Registration happens on the next tick. Without an errback, a
    /// failure goes to the error hook.
    pub fn require(
        &self,
        deps: &[&str],
        callback: impl FnOnce(&[Value]) -> Result<()> + 'static,
        errback: Option<Errback>,
    ) {
        self.require_from(None, deps, callback, errback);
    }

    /// Load `deps`; the promise fulfills with an array of their values
    ///
    /// Failures reject the promise instead of reaching the error hook.
    pub fn require_all(&self, deps: &[&str]) -> Promise {
        self.require_all_from(None, deps)
    }

    /// Value of an already defined module
    ///
    /// Never triggers a load: an unknown or unfinished id is
    /// [`LoaderError::NotLoaded`].
    pub fn get(&self, id: &str) -> Result<Value> {
        self.get_from(None, id)
    }

    /// URL for a path; an extension is kept as written
    pub fn to_url(&self, name_plus_ext: &str) -> String {
        self.to_url_from(None, name_plus_ext)
    }

    /// Whether `id` has a value
    pub fn defined(&self, id: &str) -> bool {
        self.defined_from(None, id)
    }

    /// Whether `id` has been requested or defined
    pub fn specified(&self, id: &str) -> bool {
        self.specified_from(None, id)
    }

    /// Forget `id` so that it can be loaded again
    pub fn undef(&self, id: &str) {
        self.undef_from(None, id);
    }

    pub(crate) fn require_from(
        &self,
        rel_map: Option<ModuleIdentifier>,
        deps: &[&str],
        callback: impl FnOnce(&[Value]) -> Result<()> + 'static,
        errback: Option<Errback>,
    ) {
        let deps: Vec<String> = deps.iter().map(|dep| dep.to_string()).collect();
        let weak = self.downgrade();
        self.event_loop().set_immediate(move || {
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            ctx.intake_defines();

            let map = ctx.make_identifier(None, rel_map.as_ref(), false, true);
            let id = ctx.get_module(&map);
            ctx.state_mut().start_time = Instant::now();
            tracing::debug!(context = %ctx.name(), id = %id, deps = ?deps, "require");

            let factory = Factory::function(move |values| {
                callback(values)?;
                Ok(Value::Undefined)
            });
            ctx.init_module(&id, deps, factory, errback, true, false);
            ctx.check_loaded();
        });
    }

    pub(crate) fn require_all_from(&self, rel_map: Option<ModuleIdentifier>, deps: &[&str]) -> Promise {
        let (promise, resolver) = Promise::with_resolver(self.event_loop());
        let on_error = resolver.clone();
        self.require_from(
            rel_map,
            deps,
            move |values| {
                resolver.fulfill(Value::array(values.to_vec()));
                Ok(())
            },
            Some(Box::new(move |err| on_error.reject(err))),
        );
        promise
    }

    pub(crate) fn get_from(&self, rel_map: Option<&ModuleIdentifier>, id: &str) -> Result<Value> {
        let map = self.make_identifier(Some(id), rel_map, false, true);
        if let Some(rel_map) = rel_map {
            if let Some(value) = self.handler_value(&rel_map.id, &map) {
                return Ok(value);
            }
        } else if map.id == "require" {
            return Ok(Value::Require(self.local_require()));
        }

        self.state()
            .defined
            .get(&map.id)
            .cloned()
            .ok_or_else(|| LoaderError::not_loaded(&map.id, self.name()))
    }

    pub(crate) fn to_url_from(&self, rel_map: Option<&ModuleIdentifier>, name_plus_ext: &str) -> String {
        let first_segment = name_plus_ext.split('/').next().unwrap_or_default();
        let is_relative = first_segment == "." || first_segment == "..";
        let (name, ext) = match name_plus_ext.rfind('.') {
            Some(index) if !is_relative || index > 1 => {
                (&name_plus_ext[..index], Some(&name_plus_ext[index..]))
            }
            _ => (name_plus_ext, None),
        };

        let config = self.config();
        let normalized = normalize(name, rel_map.map(|map| map.id.as_str()), true, &config);
        name_to_url(&normalized, ext, true, &config)
    }

    pub(crate) fn defined_from(&self, rel_map: Option<&ModuleIdentifier>, id: &str) -> bool {
        let map = self.make_identifier(Some(id), rel_map, false, true);
        self.state().defined.contains_key(&map.id)
    }

    pub(crate) fn specified_from(&self, rel_map: Option<&ModuleIdentifier>, id: &str) -> bool {
        let map = self.make_identifier(Some(id), rel_map, false, true);
        let state = self.state();
        state.defined.contains_key(&map.id) || state.registry.contains_key(&map.id)
    }

    pub(crate) fn undef_from(&self, rel_map: Option<&ModuleIdentifier>, id: &str) {
        let map = self.make_identifier(Some(id), rel_map, true, false);
        let mut state = self.state_mut();
        tracing::debug!(context = %self.name(), id = %map.id, "undefining module");

        state.defined.remove(&map.id);
        state.invoked_plugins.remove(&map.id);
        if let Some(url) = &map.url {
            state.url_fetched.remove(url);
        }
        if let Some(record) = state.registry.remove(&map.id) {
            if let Some(url) = record.map.url {
                state.url_fetched.remove(&url);
            }
        }
        state
            .def_queue
            .retain(|define| define.id.as_deref() != Some(map.id.as_str()));
        state.def_queue_ids.remove(&map.id);
    }
}
