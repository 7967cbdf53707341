// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader contexts
//!
//! A [`Context`] is an isolated module namespace: its own configuration,
//! registry, defined-value map, fetched-URL set and define queue. Contexts
//! sharing an event loop never see each other's modules.
//!
//! The handle is cheap to clone. Anything the engine stores for later
//! (promise reactions, timers, local `require` handles) holds a
//! [`WeakContext`], so dropping the last handle tears the context down.

use crate::config::{Config, LoaderConfig};
use crate::error::{LoaderError, Result};
use crate::host::ScriptHost;
use crate::module_system::fetch::FetchStrategy;
use crate::module_system::plugin::LoaderPlugin;
use crate::module_system::record::{Factory, ModuleRecord, RecordState};
use crate::module_system::resolver::{IdentifierResolver, ModuleIdentifier};
use crate::runtime::{EventLoop, Promise};
use crate::value::Value;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Receives errors no errback handled
pub type ErrorHook = Rc<dyn Fn(&LoaderError)>;

/// A `define` call waiting to be attached to a record
pub(crate) struct QueuedDefine {
    pub id: Option<String>,
    pub deps: Vec<String>,
    pub factory: Factory,
}

pub(crate) struct ContextState {
    pub config: Rc<Config>,
    pub registry: HashMap<String, ModuleRecord>,
    /// Values of finished modules (and early CommonJS exports)
    pub defined: HashMap<String, Value>,
    pub url_fetched: HashSet<String>,
    pub invoked_plugins: HashSet<String>,
    pub def_queue: Vec<QueuedDefine>,
    pub def_queue_ids: HashSet<String>,
    pub globals: HashMap<String, Value>,
    pub in_flight: usize,
    pub start_time: Instant,
    pub check_scheduled: bool,
    pub in_check_loaded: bool,
    pub uncaught: Vec<LoaderError>,
}

pub(crate) struct ContextInner {
    name: String,
    event_loop: Rc<EventLoop>,
    host: Rc<dyn ScriptHost>,
    strategy: FetchStrategy,
    resolver: IdentifierResolver,
    state: RefCell<ContextState>,
    on_error: RefCell<Option<ErrorHook>>,
}

/// Handle to a loader context
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

/// Non-owning handle to a loader context
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    /// Get the context back, unless it was torn down
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

impl std::fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upgrade() {
            Some(ctx) => write!(f, "WeakContext({})", ctx.name()),
            None => write!(f, "WeakContext(<dropped>)"),
        }
    }
}

impl Context {
    /// Create a context driven by `event_loop`, fetching through `host`
    ///
    /// The fetch strategy is fixed here: blocking when the host can import
    /// scripts synchronously, asynchronous otherwise.
    pub fn new(name: impl Into<String>, event_loop: Rc<EventLoop>, host: Rc<dyn ScriptHost>) -> Self {
        let strategy = if host.supports_blocking_import() {
            FetchStrategy::Blocking
        } else {
            FetchStrategy::Async
        };
        let name = name.into();
        tracing::debug!(context = %name, ?strategy, "creating loader context");
        Self {
            inner: Rc::new(ContextInner {
                name,
                event_loop,
                host,
                strategy,
                resolver: IdentifierResolver::new(),
                state: RefCell::new(ContextState {
                    config: Rc::new(Config::default()),
                    registry: HashMap::new(),
                    defined: HashMap::new(),
                    url_fetched: HashSet::new(),
                    invoked_plugins: HashSet::new(),
                    def_queue: Vec::new(),
                    def_queue_ids: HashSet::new(),
                    globals: HashMap::new(),
                    in_flight: 0,
                    start_time: Instant::now(),
                    check_scheduled: false,
                    in_check_loaded: false,
                    uncaught: Vec::new(),
                }),
                on_error: RefCell::new(None),
            }),
        }
    }

    /// Context name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Event loop driving this context
    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.inner.event_loop
    }

    /// Script host used for fetching
    pub fn host(&self) -> Rc<dyn ScriptHost> {
        Rc::clone(&self.inner.host)
    }

    /// Fetch strategy chosen at creation
    pub fn strategy(&self) -> FetchStrategy {
        self.inner.strategy
    }

    /// Non-owning handle
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Snapshot of the effective configuration
    pub fn config(&self) -> Rc<Config> {
        Rc::clone(&self.state().config)
    }

    /// Merge `options` into the configuration
    ///
    /// Identifiers of records that have not started are recomputed, and
    /// `deps` are required once the options are in place.
    pub fn configure(&self, options: &LoaderConfig) {
        self.update_config(|config| config.merge(options));
        self.clear_identifier_cache();

        let pending: Vec<String> = self
            .state()
            .registry
            .iter()
            .filter(|(_, record)| !record.inited && !record.map.unnormalized)
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            let map = self.make_identifier(Some(id.as_str()), None, true, false);
            let shim = self.config().shim.get(&id).cloned();
            self.with_record(&id, |record| {
                record.map = map;
                record.shim = shim;
            });
        }

        if !options.deps.is_empty() {
            let deps: Vec<&str> = options.deps.iter().map(String::as_str).collect();
            tracing::debug!(context = %self.name(), deps = ?deps, "requiring configured deps");
            self.require(&deps, |_| Ok(()), None);
        }
    }

    /// Install the hook that receives unhandled errors
    ///
    /// Without a hook, errors are logged and kept; [`Context::run`] returns
    /// the first one.
    pub fn set_on_error(&self, hook: impl Fn(&LoaderError) + 'static) {
        *self.inner.on_error.borrow_mut() = Some(Rc::new(hook));
    }

    /// Queue a module definition
    ///
    /// An anonymous definition takes its id from the script being loaded.
    /// Named definitions stay lazy: the factory runs once something
    /// requires the id.
    pub fn define(&self, id: Option<&str>, deps: &[&str], factory: impl Into<Factory>) {
        let mut state = self.state_mut();
        if let Some(id) = id {
            state.def_queue_ids.insert(id.to_string());
        }
        state.def_queue.push(QueuedDefine {
            id: id.map(str::to_string),
            deps: deps.iter().map(|dep| dep.to_string()).collect(),
            factory: factory.into(),
        });
    }

    /// Queue a CommonJS-style definition
    ///
    /// The factory receives `require`, `exports` and `module`. Dependencies
    /// it reaches through `require` synchronously must be loaded already.
    pub fn define_cjs(&self, id: Option<&str>, factory: impl FnOnce(&[Value]) -> Result<Value> + 'static) {
        self.define(id, &["require", "exports", "module"], Factory::function(factory));
    }

    /// Register a plugin module under `id`
    pub fn define_plugin(&self, id: &str, plugin: impl LoaderPlugin + 'static) {
        self.define(Some(id), &[], Value::plugin(plugin));
    }

    /// Set a global read by `shim` exports
    pub fn set_global(&self, name: &str, value: impl Into<Value>) {
        self.state_mut().globals.insert(name.to_string(), value.into());
    }

    /// Read a global
    pub fn global(&self, name: &str) -> Option<Value> {
        self.state().globals.get(name).cloned()
    }

    /// Lifecycle state of the record with canonical id `id`
    pub fn module_state(&self, id: &str) -> Option<RecordState> {
        self.state().registry.get(id).map(ModuleRecord::state)
    }

    /// Number of script fetches that have not completed
    pub fn pending_fetches(&self) -> usize {
        self.state().in_flight
    }

    /// Drive the event loop until it is idle
    ///
    /// Returns the first error that reached the default hook.
    pub async fn run(&self) -> Result<()> {
        self.inner.event_loop.run().await;
        self.take_uncaught()
    }

    /// Drive the event loop for at most `limit`
    pub async fn run_for(&self, limit: Duration) -> Result<()> {
        self.inner.event_loop.run_for(limit).await;
        self.take_uncaught()
    }

    /// Drain ready work without waiting on timers
    pub fn run_until_idle(&self) -> Result<()> {
        self.inner.event_loop.run_until_idle();
        self.take_uncaught()
    }

    pub(crate) fn take_uncaught(&self) -> Result<()> {
        let uncaught = std::mem::take(&mut self.state_mut().uncaught);
        match uncaught.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hand an error to the hook
    pub(crate) fn report(&self, err: LoaderError) {
        let hook = self.inner.on_error.borrow().clone();
        match hook {
            Some(hook) => hook(&err),
            None => {
                tracing::error!(context = %self.name(), modules = ?err.require_modules(), "{}", err);
                self.state_mut().uncaught.push(err);
            }
        }
    }

    pub(crate) fn state(&self) -> Ref<'_, ContextState> {
        self.inner.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, ContextState> {
        self.inner.state.borrow_mut()
    }

    pub(crate) fn update_config<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        let mut state = self.state_mut();
        f(Rc::make_mut(&mut state.config))
    }

    pub(crate) fn clear_identifier_cache(&self) {
        self.inner.resolver.clear_cache();
    }

    /// Run `f` on a record, if it exists
    pub(crate) fn with_record<R>(&self, id: &str, f: impl FnOnce(&mut ModuleRecord) -> R) -> Option<R> {
        self.state_mut().registry.get_mut(id).map(f)
    }

    pub(crate) fn record_map(&self, id: &str) -> Option<ModuleIdentifier> {
        self.state().registry.get(id).map(|record| record.map.clone())
    }

    pub(crate) fn record_promise(&self, id: &str) -> Option<Promise> {
        self.state().registry.get(id).map(|record| record.promise.clone())
    }

    /// Resolve a name with this context's configuration and plugins
    pub(crate) fn make_identifier(
        &self,
        name: Option<&str>,
        parent: Option<&ModuleIdentifier>,
        is_normalized: bool,
        apply_map: bool,
    ) -> ModuleIdentifier {
        let config = self.config();
        let plugin_for = |id: &str| -> Option<Rc<dyn LoaderPlugin>> {
            self.state()
                .defined
                .get(id)
                .and_then(|value| value.as_plugin().cloned())
        };
        self.inner
            .resolver
            .make(name, parent, is_normalized, apply_map, &config, &plugin_for)
    }

    /// Get or create the record for `map`; returns its id
    pub(crate) fn get_module(&self, map: &ModuleIdentifier) -> String {
        let mut state = self.state_mut();
        let state = &mut *state;
        if !state.registry.contains_key(&map.id) {
            let (promise, resolver) = Promise::with_resolver(&self.inner.event_loop);
            let shim = state.config.shim.get(&map.id).cloned();
            tracing::trace!(context = %self.inner.name, id = %map.id, "new module record");
            state
                .registry
                .insert(map.id.clone(), ModuleRecord::new(map.clone(), promise, resolver, shim));
        }
        map.id.clone()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Context");
        debug.field("name", &self.inner.name);
        if let Ok(state) = self.inner.state.try_borrow() {
            debug
                .field("records", &state.registry.len())
                .field("defined", &state.defined.len())
                .field("in_flight", &state.in_flight);
        }
        debug.finish()
    }
}
