// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Fetch layer
//!
//! Turns "this record needs its source" into a script load through the
//! context's [`ScriptHost`](crate::host::ScriptHost), once per URL, and
//! matches the `define` calls the script made back to the record.

use crate::error::LoaderError;
use crate::host::ScriptRequest;
use crate::module_system::context::Context;
use crate::module_system::record::Factory;
use crate::module_system::require::LocalRequire;
use crate::value::Value;

/// How a context loads scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// The host evaluates the script before `import_script` returns
    Blocking,
    /// The host reports completion later through a [`ScriptRequest`]
    Async,
}

impl Context {
    /// Start loading a record's source, once
    ///
    /// Shimmed scripts wait for their shim dependencies first.
    pub(crate) fn fetch_module(&self, id: &str) {
        let Some((map, shim)) = self.with_record(id, |record| {
            if record.fetched {
                return None;
            }
            record.fetched = true;
            Some((record.map.clone(), record.shim.clone()))
        })
        .flatten() else {
            return;
        };

        match shim {
            Some(shim) if !shim.deps.is_empty() => {
                tracing::debug!(context = %self.name(), id, deps = ?shim.deps, "loading shim dependencies");
                let weak = self.downgrade();
                let id = id.to_string();
                let is_plugin = map.plugin_prefix.is_some();
                let deps: Vec<&str> = shim.deps.iter().map(String::as_str).collect();
                LocalRequire::new(self.downgrade(), Some(map)).require(
                    &deps,
                    move |_| {
                        if let Some(ctx) = weak.upgrade() {
                            if is_plugin {
                                ctx.call_plugin(&id);
                            } else {
                                ctx.load_script(&id);
                            }
                        }
                        Ok(())
                    },
                    None,
                );
            }
            _ if map.plugin_prefix.is_some() => self.call_plugin(id),
            _ => self.load_script(id),
        }
    }

    /// Fetch the record's URL unless some record already fetched it
    pub(crate) fn load_script(&self, id: &str) {
        let Some(url) = self.record_map(id).and_then(|map| map.url) else {
            return;
        };
        if !self.state_mut().url_fetched.insert(url.clone()) {
            tracing::trace!(context = %self.name(), id, url = %url, "url already fetched");
            return;
        }

        self.state_mut().in_flight += 1;
        tracing::debug!(context = %self.name(), id, url = %url, strategy = ?self.strategy(), "fetching script");

        match self.strategy() {
            FetchStrategy::Blocking => {
                let result = self.host().import_script(self, &url);
                match result {
                    Ok(()) => self.script_loaded(id),
                    Err(err) => self.script_failed(id, &url, err.to_string()),
                }
            }
            FetchStrategy::Async => {
                self.host()
                    .load_script(ScriptRequest::new(self.downgrade(), id.to_string(), url));
            }
        }
    }

    pub(crate) fn script_loaded(&self, id: &str) {
        {
            let mut state = self.state_mut();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.complete_load(id);
    }

    pub(crate) fn script_failed(&self, id: &str, url: &str, reason: String) {
        {
            let mut state = self.state_mut();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        if self.has_path_fallback(id) {
            return;
        }

        let mut needed_by: Vec<String> = self
            .state()
            .registry
            .iter()
            .filter(|(key, _)| !key.starts_with("_@r"))
            .filter(|(_, record)| record.dep_maps.iter().flatten().any(|dep| dep.id == id))
            .map(|(key, _)| key.clone())
            .collect();
        needed_by.sort();

        let err = LoaderError::Fetch {
            id: id.to_string(),
            url: url.to_string(),
            needed_by,
            reason,
        };
        self.module_failed(id, err);
        self.check_loaded();
    }

    /// Match the defines a finished script queued to `module_name`
    ///
    /// The first anonymous define is named after the script; a second one
    /// is a mismatch. A script that defined nothing gets its shim value,
    /// or is an error under `enforceDefine`.
    pub(crate) fn complete_load(&self, module_name: &str) {
        let queue = {
            let mut state = self.state_mut();
            state.def_queue_ids.clear();
            std::mem::take(&mut state.def_queue)
        };

        let mut found = false;
        for define in queue {
            let id = match define.id {
                Some(id) => id,
                None if found => {
                    self.report(LoaderError::MismatchedDefine(module_name.to_string()));
                    continue;
                }
                None => module_name.to_string(),
            };
            if id == module_name {
                found = true;
            }
            self.call_get_module(&id, define.deps, define.factory);
        }

        let (already_defined, inited) = {
            let state = self.state();
            (
                state.defined.contains_key(module_name),
                state.registry.get(module_name).map(|record| record.inited),
            )
        };

        if !found && !already_defined && inited == Some(false) {
            let config = self.config();
            let shim = config.shim.get(module_name).cloned().unwrap_or_default();
            let exported = shim
                .exports
                .as_deref()
                .is_some_and(|name| self.global(name).is_some());

            if config.enforce_define && !exported {
                if self.has_path_fallback(module_name) {
                    return;
                }
                self.module_failed(module_name, LoaderError::NoDefine(module_name.to_string()));
                return;
            }

            tracing::debug!(context = %self.name(), id = module_name, "script defined nothing, using shim");
            let weak = self.downgrade();
            let exports = shim.exports.clone();
            let factory = Factory::function(move |_| {
                let value = match (exports, weak.upgrade()) {
                    (Some(name), Some(ctx)) => ctx.global(&name).unwrap_or_default(),
                    _ => Value::Undefined,
                };
                Ok(value)
            });
            self.call_get_module(module_name, shim.deps, factory);
        }

        self.check_loaded();
    }

    /// Retry `id` from its next `paths` candidate, if one remains
    pub(crate) fn has_path_fallback(&self, id: &str) -> bool {
        let Some(next) = self.update_config(|config| config.advance_path_fallback(id)) else {
            return false;
        };
        tracing::warn!(context = %self.name(), id, next = %next, "script failed, trying path fallback");

        self.clear_identifier_cache();
        let map = self.make_identifier(Some(id), None, true, false);
        let old_url = self.with_record(id, |record| {
            let old = record.map.url.take();
            record.map.url = map.url.clone();
            record.fetched = false;
            old
        });
        if let Some(Some(url)) = old_url {
            self.state_mut().url_fetched.remove(&url);
        }

        self.fetch_module(id);
        true
    }
}

