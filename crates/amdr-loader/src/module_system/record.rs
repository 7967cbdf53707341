// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module records
//!
//! One [`ModuleRecord`] per canonical id and context: the bookkeeping the
//! dependency engine needs to go from "requested" to "defined".

use crate::config::Shim;
use crate::error::{LoaderError, Result};
use crate::module_system::resolver::ModuleIdentifier;
use crate::runtime::{Promise, Resolver};
use crate::value::{Object, Value};

/// Callback invoked instead of the error hook when a `require` fails
pub type Errback = Box<dyn FnOnce(LoaderError)>;

/// What produces a module's value once its dependencies are satisfied
pub enum Factory {
    /// A literal value
    Value(Value),
    /// A function of the dependency values, in declaration order
    Function(Box<dyn FnOnce(&[Value]) -> Result<Value>>),
}

impl Factory {
    /// Wrap a factory function
    pub fn function(f: impl FnOnce(&[Value]) -> Result<Value> + 'static) -> Self {
        Factory::Function(Box::new(f))
    }

    pub(crate) fn run(self, args: &[Value]) -> Result<Value> {
        match self {
            Factory::Value(value) => Ok(value),
            Factory::Function(f) => f(args),
        }
    }
}

impl From<Value> for Factory {
    fn from(value: Value) -> Self {
        Factory::Value(value)
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Factory::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Factory::Function(_) => write!(f, "Function"),
        }
    }
}

/// Lifecycle of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Known by id, nothing requested yet
    Unstarted,
    /// Script requested, no `define` seen
    AwaitingSource,
    /// Factory and dependencies known, waiting on dependency values
    AwaitingDeps,
    /// Value produced
    Defined,
    /// Failed; dependents received the reason
    Rejected,
}

/// Per-module bookkeeping
pub(crate) struct ModuleRecord {
    pub map: ModuleIdentifier,
    pub promise: Promise,
    pub resolver: Resolver,
    pub shim: Option<Shim>,

    /// Dependency names as declared
    pub raw_deps: Vec<String>,
    /// Resolved dependency identifiers, by slot
    pub dep_maps: Vec<Option<ModuleIdentifier>>,
    pub dep_exports: Vec<Value>,
    pub dep_matched: Vec<bool>,
    /// Slots still waiting on a value
    pub dep_count: usize,
    /// Plugin and redirect targets, walked by cycle detection
    pub plugin_maps: Vec<ModuleIdentifier>,

    pub factory: Option<Factory>,
    pub errback: Option<Errback>,
    /// CommonJS `exports`; holds the final value once defined
    pub exports: Option<Value>,
    /// CommonJS `module`
    pub module: Option<Object>,
    pub using_exports: bool,

    pub inited: bool,
    pub enabled: bool,
    pub enabling: bool,
    pub fetched: bool,
    pub defining: bool,
    pub defined: bool,
    pub ignore: bool,
    pub timed_out: bool,
    pub error: Option<LoaderError>,
}

impl ModuleRecord {
    pub fn new(map: ModuleIdentifier, promise: Promise, resolver: Resolver, shim: Option<Shim>) -> Self {
        Self {
            map,
            promise,
            resolver,
            shim,
            raw_deps: Vec::new(),
            dep_maps: Vec::new(),
            dep_exports: Vec::new(),
            dep_matched: Vec::new(),
            dep_count: 0,
            plugin_maps: Vec::new(),
            factory: None,
            errback: None,
            exports: None,
            module: None,
            using_exports: false,
            inited: false,
            enabled: false,
            enabling: false,
            fetched: false,
            defining: false,
            defined: false,
            ignore: false,
            timed_out: false,
            error: None,
        }
    }

    pub fn state(&self) -> RecordState {
        if self.defined {
            RecordState::Defined
        } else if self.error.is_some() {
            RecordState::Rejected
        } else if self.inited {
            RecordState::AwaitingDeps
        } else if self.fetched {
            RecordState::AwaitingSource
        } else {
            RecordState::Unstarted
        }
    }

    /// Every dependency slot, then the plugin targets
    pub fn traced_deps(&self) -> Vec<(Option<usize>, ModuleIdentifier)> {
        let slots = self
            .dep_maps
            .iter()
            .enumerate()
            .filter_map(|(i, map)| map.clone().map(|map| (Some(i), map)));
        let plugins = self.plugin_maps.iter().cloned().map(|map| (None, map));
        slots.chain(plugins).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;
    use std::rc::Rc;

    fn identifier(id: &str) -> ModuleIdentifier {
        ModuleIdentifier {
            id: id.to_string(),
            plugin_prefix: None,
            resource_name: id.to_string(),
            url: Some(format!("./{}.js", id)),
            parent: None,
            original_name: Some(id.to_string()),
            is_define: true,
            unnormalized: false,
        }
    }

    #[test]
    fn test_state_follows_flags() {
        let el = Rc::new(EventLoop::new());
        let (promise, resolver) = Promise::with_resolver(&el);
        let mut record = ModuleRecord::new(identifier("a"), promise, resolver, None);
        assert_eq!(record.state(), RecordState::Unstarted);

        record.fetched = true;
        assert_eq!(record.state(), RecordState::AwaitingSource);

        record.inited = true;
        assert_eq!(record.state(), RecordState::AwaitingDeps);

        record.error = Some(LoaderError::msg("x"));
        assert_eq!(record.state(), RecordState::Rejected);
    }

    #[test]
    fn test_factory_runs_with_args() {
        let factory = Factory::function(|args| Ok(Value::from(args.len() as f64)));
        let value = factory.run(&[Value::Null, Value::Null]).unwrap();
        assert_eq!(value, Value::from(2));
        assert_eq!(Factory::from(Value::from("x")).run(&[]).unwrap(), Value::from("x"));
    }
}
