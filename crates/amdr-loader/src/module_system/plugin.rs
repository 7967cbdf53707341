// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader plugin protocol
//!
//! A `prefix!resource` id is produced by the module `prefix`, whose value
//! must be a [`LoaderPlugin`]. The loader first loads the plugin, then lets
//! it canonicalize the resource name and finally hands it a [`LoadCallback`]
//! to deliver the resource's value.

use crate::config::Config;
use crate::error::{LoaderError, Result};
use crate::module_system::context::{Context, WeakContext};
use crate::module_system::record::Factory;
use crate::module_system::require::LocalRequire;
use crate::module_system::resolver::{ModuleIdentifier, name_to_url, normalize};
use crate::value::Value;
use std::rc::Rc;

/// A module that knows how to load `prefix!resource` ids
pub trait LoaderPlugin {
    /// Canonicalize a resource name
    ///
    /// `normalize` applies the loader's own normalization relative to the
    /// requesting module. Names containing `!` are left alone by default.
    fn normalize(&self, name: &str, normalize: &dyn Fn(&str) -> String) -> String {
        if name.contains('!') {
            name.to_string()
        } else {
            normalize(name)
        }
    }

    /// Load `name` and report through `onload`
    ///
    /// `require` resolves relative to the module that asked for the
    /// resource. The callback may be kept and invoked later.
    fn load(
        &self,
        name: &str,
        require: &LocalRequire,
        onload: LoadCallback,
        config: &Config,
    ) -> Result<()>;
}

/// Completion handle passed to [`LoaderPlugin::load`]
#[derive(Clone)]
pub struct LoadCallback {
    context: WeakContext,
    map: ModuleIdentifier,
}

impl LoadCallback {
    pub(crate) fn new(context: WeakContext, map: ModuleIdentifier) -> Self {
        Self { context, map }
    }

    /// Id of the plugin resource being loaded
    pub fn id(&self) -> &str {
        &self.map.id
    }

    /// Deliver the resource's value
    pub fn call(&self, value: Value) {
        if let Some(ctx) = self.context.upgrade() {
            ctx.init_module(&self.map.id, Vec::new(), Factory::Value(value), None, true, false);
        }
    }

    /// Report a failure to load the resource
    pub fn error(&self, reason: impl std::fmt::Display) {
        if let Some(ctx) = self.context.upgrade() {
            let err = LoaderError::Plugin {
                id: self.map.id.clone(),
                reason: reason.to_string(),
            };
            ctx.module_failed(&self.map.id, err);
        }
    }

    /// Evaluate module text, then deliver the module it defines
    ///
    /// The text runs through the host's `exec`; an anonymous `define` in it
    /// is named after the resource.
    pub fn from_text(&self, text: &str) {
        let Some(ctx) = self.context.upgrade() else {
            return;
        };
        let module_name = self.map.resource_name.clone();
        let module_map = ctx.make_identifier(Some(module_name.as_str()), None, false, false);
        ctx.get_module(&module_map);

        if let Some(module_config) = ctx.config().module_config.get(&self.map.id).cloned() {
            ctx.update_config(|config| {
                config
                    .module_config
                    .insert(module_map.id.clone(), module_config);
            });
        }

        tracing::debug!(id = %self.map.id, module = %module_map.id, "plugin fromText");
        let host = ctx.host();
        if let Err(err) = host.exec(&ctx, text) {
            let err = LoaderError::FromText {
                id: self.map.id.clone(),
                reason: err.to_string(),
            };
            ctx.module_failed(&self.map.id, err);
            return;
        }
        ctx.complete_load(&module_map.id);

        let onload = self.clone();
        let require = LocalRequire::new(ctx.downgrade(), self.map.parent.as_deref().cloned());
        require.require(
            &[module_map.id.as_str()],
            move |values| {
                onload.call(values.first().cloned().unwrap_or_default());
                Ok(())
            },
            Some(Box::new({
                let onload = self.clone();
                move |err: LoaderError| onload.error(err)
            })),
        );
    }
}

impl std::fmt::Debug for LoadCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCallback").field("id", &self.map.id).finish()
    }
}

impl Context {
    /// Load the plugin behind `id`'s prefix, then hand the resource to it
    pub(crate) fn call_plugin(&self, id: &str) {
        let Some(map) = self.record_map(id) else {
            return;
        };
        let Some(prefix) = map.plugin_prefix.clone() else {
            return;
        };
        let plugin_map = self.make_identifier(Some(prefix.as_str()), None, false, false);
        let plugin_id = self.get_module(&plugin_map);
        self.with_record(id, |record| record.plugin_maps.push(plugin_map.clone()));

        let weak = self.downgrade();
        let on_ready = {
            let weak = weak.clone();
            let id = id.to_string();
            move |value: Value| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.on_plugin_ready(&id, value);
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
        if let Some(promise) = self.record_promise(&plugin_id) {
            promise.then(on_ready, on_failed);
        }
        self.enable_module(&plugin_id);
    }

    fn on_plugin_ready(&self, id: &str, value: Value) {
        let Some(map) = self.record_map(id) else {
            return;
        };
        let prefix = map.plugin_prefix.clone().unwrap_or_default();
        let plugin: Rc<dyn LoaderPlugin> = match value {
            Value::Plugin(plugin) => plugin,
            _ => {
                self.module_failed(id, LoaderError::NotAPlugin(prefix));
                return;
            }
        };

        if map.unnormalized {
            self.redirect_unnormalized(id, &map, &plugin);
            return;
        }

        let config = self.config();
        if let Some(bundle_id) = config.bundles_map.get(&map.id) {
            let url = name_to_url(bundle_id, None, false, &config);
            tracing::debug!(id, bundle = %bundle_id, "plugin resource provided by bundle");
            self.with_record(id, |record| record.map.url = Some(url));
            self.load_script(id);
            return;
        }

        if !self.state_mut().invoked_plugins.insert(map.id.clone()) {
            return;
        }

        let require = LocalRequire::new(self.downgrade(), map.parent.as_deref().cloned());
        let onload = LoadCallback::new(self.downgrade(), map.clone());
        tracing::debug!(plugin = %prefix, resource = %map.resource_name, "invoking plugin load");
        if let Err(err) = plugin.load(&map.resource_name, &require, onload, &config) {
            let err = LoaderError::Plugin {
                id: map.id.clone(),
                reason: err.to_string(),
            };
            self.module_failed(id, err);
        }
    }

    /// Re-key a provisional `prefix!name_unnormalizedN` record onto the
    /// id the now-loaded plugin produces, and take its value from there
    fn redirect_unnormalized(&self, id: &str, map: &ModuleIdentifier, plugin: &Rc<dyn LoaderPlugin>) {
        let prefix = map.plugin_prefix.clone().unwrap_or_default();
        let parent_name = map.parent.as_ref().map(|p| p.name().to_string());
        let config = self.config();
        let local = |name: &str| normalize(name, parent_name.as_deref(), true, &config);
        let name = plugin.normalize(&map.resource_name, &local);

        let full_name = format!("{}!{}", prefix, name);
        let normalized_map = self.make_identifier(Some(full_name.as_str()), map.parent.as_deref(), true, false);
        let target = self.get_module(&normalized_map);
        tracing::debug!(from = %id, to = %target, "plugin resource normalized");
        self.with_record(id, |record| record.plugin_maps.push(normalized_map.clone()));

        let weak = self.downgrade();
        let on_value = {
            let weak = weak.clone();
            let id = id.to_string();
            move |value: Value| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.init_module(&id, Vec::new(), Factory::Value(value), None, true, true);
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
        if let Some(promise) = self.record_promise(&target) {
            promise.then(on_value, on_failed);
        }
        self.enable_module(&target);
    }
}
