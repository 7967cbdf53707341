// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Dependency engine
//!
//! Drives records from "requested" to "defined":
//!
//! - `init` attaches a factory and dependency list (from `define`, a
//!   top-level `require`, or a plugin's `load` callback)
//! - `enable` resolves the dependencies, creates and enables their records
//!   and subscribes to their promises
//! - `check` fetches a record that has no factory yet, or runs the factory
//!   once every dependency slot is filled
//!
//! The reserved names `require`, `exports` and `module` never become
//! records; they are filled in directly. `exports` publishes the partial
//! exports object right away, which is what lets CommonJS cycles see each
//! other half-initialized.

use crate::error::LoaderError;
use crate::module_system::context::Context;
use crate::module_system::record::{Errback, Factory};
use crate::module_system::require::LocalRequire;
use crate::module_system::resolver::ModuleIdentifier;
use crate::value::{Object, Value};
use std::collections::HashSet;

enum Step {
    Fetch,
    Define(Factory, Vec<Value>),
}

impl Context {
    /// Attach a factory and dependency list to a record, once
    pub(crate) fn init_module(
        &self,
        id: &str,
        deps: Vec<String>,
        factory: Factory,
        errback: Option<Errback>,
        enabled: bool,
        ignore: bool,
    ) {
        let enable = {
            let mut state = self.state_mut();
            let Some(record) = state.registry.get_mut(id) else {
                return;
            };
            if record.inited {
                return;
            }
            let slots = deps.len();
            record.inited = true;
            record.factory = Some(factory);
            record.raw_deps = deps;
            record.dep_maps = vec![None; slots];
            record.dep_exports = vec![Value::Undefined; slots];
            record.dep_matched = vec![false; slots];
            record.dep_count = 0;
            record.errback = errback;
            record.ignore = ignore;
            enabled || record.enabled
        };
        tracing::trace!(context = %self.name(), id, "module initialized");

        if enable {
            self.enable_record(id);
        } else {
            self.check_module(id);
        }
    }

    /// Enable a record unless it already is
    pub(crate) fn enable_module(&self, id: &str) {
        let enabled = self.state().registry.get(id).map(|record| record.enabled);
        if enabled == Some(false) {
            self.enable_record(id);
        }
    }

    fn enable_record(&self, id: &str) {
        let Some((map, raw_deps)) = self.with_record(id, |record| {
            record.enabled = true;
            record.enabling = true;
            (record.map.clone(), record.raw_deps.clone())
        }) else {
            return;
        };

        // Top-level requires resolve against whoever called them
        let base = if map.is_define {
            Some(map.clone())
        } else {
            map.parent.as_deref().cloned()
        };

        for (slot, raw) in raw_deps.iter().enumerate() {
            let dep_map = self.make_identifier(Some(raw.as_str()), base.as_ref(), false, true);

            if let Some(value) = self.handler_value(id, &dep_map) {
                self.with_record(id, |record| {
                    record.dep_exports[slot] = value;
                    record.dep_matched[slot] = true;
                });
                continue;
            }

            let dep_id = self.get_module(&dep_map);
            self.with_record(id, |record| {
                record.dep_maps[slot] = Some(dep_map.clone());
                record.dep_count += 1;
            });
            self.watch_dependency(id, slot, &dep_id);
            self.enable_module(&dep_id);
        }

        self.with_record(id, |record| record.enabling = false);
        self.check_module(id);
    }

    /// Fill `slot` of `id` when the dependency settles
    fn watch_dependency(&self, id: &str, slot: usize, dep_id: &str) {
        let Some(promise) = self.record_promise(dep_id) else {
            return;
        };
        let weak = self.downgrade();
        let on_value = {
            let weak = weak.clone();
            let id = id.to_string();
            move |value: Value| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.define_dep(&id, slot, value);
                    ctx.check_module(&id);
                }
                Ok(Value::Undefined)
            }
        };
        let on_failed = {
            let id = id.to_string();
            move |err: LoaderError| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.module_failed(&id, err);
                }
                Ok(Value::Undefined)
            }
        };
        promise.then(on_value, on_failed);
    }

    /// Values for the reserved `require`, `exports` and `module` deps
    pub(crate) fn handler_value(&self, id: &str, dep_map: &ModuleIdentifier) -> Option<Value> {
        if dep_map.plugin_prefix.is_some() {
            return None;
        }
        match dep_map.id.as_str() {
            "require" => {
                let map = self.record_map(id)?;
                Some(Value::Require(LocalRequire::new(self.downgrade(), Some(map))))
            }
            "exports" => self.exports_handler(id),
            "module" => self.module_handler(id).map(Value::Object),
            _ => None,
        }
    }

    fn exports_handler(&self, id: &str) -> Option<Value> {
        let mut state = self.state_mut();
        let state = &mut *state;
        let record = state.registry.get_mut(id)?;
        record.using_exports = true;
        if !record.map.is_define {
            return Some(Value::Undefined);
        }
        let exports = record
            .exports
            .get_or_insert_with(|| Value::Object(Object::new()))
            .clone();
        state.defined.insert(id.to_string(), exports.clone());
        Some(exports)
    }

    fn module_handler(&self, id: &str) -> Option<Object> {
        let mut state = self.state_mut();
        let state = &mut *state;
        let module_config = state.config.module_config.get(id).cloned();
        let record = state.registry.get_mut(id)?;
        if let Some(module) = &record.module {
            return Some(module.clone());
        }

        let exports = record
            .exports
            .get_or_insert_with(|| Value::Object(Object::new()))
            .clone();
        let module = Object::new();
        module.set("id", record.map.id.as_str());
        module.set("uri", record.map.url.clone().unwrap_or_default());
        module.set("exports", exports);
        module.set(
            "config",
            module_config
                .map(|config| Value::from_json(&config))
                .unwrap_or_else(|| Value::Object(Object::new())),
        );
        record.module = Some(module.clone());
        Some(module)
    }

    /// Fill a dependency slot, once
    pub(crate) fn define_dep(&self, id: &str, slot: usize, value: Value) {
        self.with_record(id, |record| {
            if slot < record.dep_matched.len() && !record.dep_matched[slot] {
                record.dep_matched[slot] = true;
                record.dep_count = record.dep_count.saturating_sub(1);
                record.dep_exports[slot] = value;
            }
        });
    }

    /// Fetch, run the factory, or keep waiting
    pub(crate) fn check_module(&self, id: &str) {
        let step = {
            let mut state = self.state_mut();
            let state = &mut *state;
            let Some(record) = state.registry.get_mut(id) else {
                return;
            };
            if !record.enabled
                || record.enabling
                || record.defining
                || record.defined
                || record.error.is_some()
            {
                return;
            }
            if !record.inited {
                // A queued named define will init it on intake
                if state.def_queue_ids.contains(id) {
                    return;
                }
                Step::Fetch
            } else if record.dep_count == 0 {
                let Some(factory) = record.factory.take() else {
                    return;
                };
                record.defining = true;
                Step::Define(factory, record.dep_exports.clone())
            } else {
                return;
            }
        };

        match step {
            Step::Fetch => self.fetch_module(id),
            Step::Define(factory, args) => self.run_factory(id, factory, &args),
        }
    }

    fn run_factory(&self, id: &str, factory: Factory, args: &[Value]) {
        let result = factory.run(args);

        let Some(is_define) = self.record_map(id).map(|map| map.is_define) else {
            return;
        };
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                let err = if is_define {
                    LoaderError::Define {
                        id: id.to_string(),
                        source: Box::new(err),
                    }
                } else {
                    err
                };
                self.module_failed(id, err);
                return;
            }
        };

        let (resolver, value) = {
            let mut state = self.state_mut();
            let state = &mut *state;
            let Some(record) = state.registry.get_mut(id) else {
                return;
            };

            // A factory that returns nothing exports through CommonJS
            let value = if is_define && value.is_undefined() {
                match &record.module {
                    Some(module) => module.get("exports").unwrap_or_default(),
                    None if record.using_exports => record.exports.clone().unwrap_or_default(),
                    None => value,
                }
            } else {
                value
            };

            record.exports = Some(value.clone());
            record.defined = true;
            record.defining = false;
            if is_define && !record.ignore {
                state.defined.insert(id.to_string(), value.clone());
            }
            let resolver = record.resolver.clone();
            if !is_define {
                state.registry.remove(id);
            }
            (resolver, value)
        };

        tracing::debug!(context = %self.name(), id, "module defined");
        resolver.fulfill(value);
    }

    /// Reject a record; dependents follow through its promise
    ///
    /// The error goes to the record's errback if it has one. Failures of
    /// top-level requires without an errback reach the error hook.
    pub(crate) fn module_failed(&self, id: &str, err: LoaderError) {
        let Some((resolver, errback, is_define)) = self.with_record(id, |record| {
            if record.defined || record.error.is_some() {
                return None;
            }
            record.error = Some(err.clone());
            record.defining = false;
            Some((record.resolver.clone(), record.errback.take(), record.map.is_define))
        })
        .flatten() else {
            return;
        };

        tracing::debug!(context = %self.name(), id, error = %err, "module rejected");
        resolver.reject(err.clone());
        match errback {
            Some(errback) => errback(err),
            None if !is_define => self.report(err),
            None => {}
        }
    }

    /// Attach every queued named define to its record
    pub(crate) fn intake_defines(&self) {
        let queue = {
            let mut state = self.state_mut();
            state.def_queue_ids.clear();
            std::mem::take(&mut state.def_queue)
        };
        for define in queue {
            match define.id {
                Some(id) => self.call_get_module(&id, define.deps, define.factory),
                None => self.report(LoaderError::MismatchedDefine(format!(
                    "anonymous define with dependencies [{}] outside of a script load",
                    define.deps.join(", ")
                ))),
            }
        }
    }

    /// Init the record for a named define, unless the id is defined already
    pub(crate) fn call_get_module(&self, id: &str, deps: Vec<String>, factory: Factory) {
        if self.state().defined.contains_key(id) {
            tracing::trace!(id, "ignoring define of an already defined module");
            return;
        }
        let map = self.make_identifier(Some(id), None, true, false);
        let id = self.get_module(&map);
        self.init_module(&id, deps, factory, None, false, false);
    }

    /// Force-satisfy back edges reachable from `id`
    ///
    /// A dependency already on the current trace is handed whatever value
    /// it has published so far (possibly none), so one side of every cycle
    /// can define.
    pub(crate) fn break_cycle(&self, id: &str, traced: &mut HashSet<String>, processed: &mut HashSet<String>) {
        let deps = {
            let state = self.state();
            match state.registry.get(id) {
                Some(record) if record.error.is_none() => record.traced_deps(),
                _ => return,
            }
        };
        traced.insert(id.to_string());

        for (slot, dep_map) in deps {
            let dep_id = dep_map.id;
            let (matched, pending) = {
                let state = self.state();
                let matched = match (slot, state.registry.get(id)) {
                    (Some(slot), Some(record)) => record.dep_matched.get(slot).copied().unwrap_or(true),
                    _ => false,
                };
                let pending = state
                    .registry
                    .get(&dep_id)
                    .is_some_and(|dep| !dep.defined && dep.error.is_none());
                (matched, pending)
            };
            if matched || !pending || processed.contains(&dep_id) {
                continue;
            }

            if traced.contains(&dep_id) {
                if let Some(slot) = slot {
                    let value = self.state().defined.get(&dep_id).cloned().unwrap_or_default();
                    tracing::debug!(context = %self.name(), module = id, dependency = %dep_id, "breaking dependency cycle");
                    self.define_dep(id, slot, value);
                    self.check_module(id);
                }
            } else {
                self.break_cycle(&dep_id, traced, processed);
            }
        }

        processed.insert(id.to_string());
    }
}
