// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Load manifests
//!
//! A manifest describes a whole module world in JSON: loader configuration,
//! the scripts served at each URL and the text resources plugins can fetch.
//!
//! ```json
//! {
//!   "config": { "baseUrl": "js", "waitSeconds": 2 },
//!   "async": true,
//!   "latencyMs": 20,
//!   "scripts": {
//!     "js/a.js": { "defines": [{ "deps": ["b"] }] },
//!     "js/b.js": { "defines": [{ "value": 42 }] },
//!     "js/legacy.js": { "globals": { "Legacy": "old" } }
//!   },
//!   "resources": { "js/tpl.html": "<p>hi</p>" }
//! }
//! ```
//!
//! A define without a `value` produces an object keyed by its dependency
//! names.

use amdr_loader::{Factory, HostMode, LoaderConfig, MemoryHost, Object, Value};
use anyhow::Context as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// One `define` call made by a script
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefineSpec {
    /// Module id; anonymous when absent
    pub id: Option<String>,
    /// Dependency names
    pub deps: Vec<String>,
    /// Literal module value
    pub value: Option<serde_json::Value>,
}

impl DefineSpec {
    fn factory(&self) -> Factory {
        match &self.value {
            Some(value) => Factory::Value(Value::from_json(value)),
            None => {
                let names = self.deps.clone();
                Factory::function(move |deps| {
                    let composed = Object::new();
                    for (name, value) in names.iter().zip(deps) {
                        composed.set(name.as_str(), value.clone());
                    }
                    Ok(Value::Object(composed))
                })
            }
        }
    }
}

/// What running a script does
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptSpec {
    /// `define` calls, in order
    pub defines: Vec<DefineSpec>,
    /// Globals the script assigns
    pub globals: BTreeMap<String, serde_json::Value>,
}

/// A complete load manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Manifest {
    /// Loader configuration
    pub config: LoaderConfig,
    /// Deliver scripts on timers instead of synchronously
    #[serde(rename = "async")]
    pub is_async: bool,
    /// Delay per script or resource in async mode
    pub latency_ms: u64,
    /// Scripts by URL
    pub scripts: BTreeMap<String, ScriptSpec>,
    /// Text resources by URL
    pub resources: BTreeMap<String, String>,
    /// URLs whose load never completes
    pub stall: Vec<String>,
}

impl Manifest {
    /// Parse a manifest from JSON text
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("invalid manifest")
    }

    /// Read a manifest file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_json_str(&text)
    }

    /// Delivery mode for the host
    pub fn mode(&self) -> HostMode {
        if self.is_async {
            HostMode::Async {
                latency: Duration::from_millis(self.latency_ms),
            }
        } else {
            HostMode::Blocking
        }
    }

    /// Build an in-memory host serving this manifest
    pub fn host(&self) -> MemoryHost {
        let host = MemoryHost::new(self.mode());
        for (url, script) in &self.scripts {
            let script = script.clone();
            host.add_script(url.as_str(), move |ctx| {
                for (name, value) in &script.globals {
                    ctx.set_global(name, Value::from_json(value));
                }
                for define in &script.defines {
                    let deps: Vec<&str> = define.deps.iter().map(String::as_str).collect();
                    ctx.define(define.id.as_deref(), &deps, define.factory());
                }
                Ok(())
            });
        }
        for (url, text) in &self.resources {
            host.add_text(url.as_str(), text.as_str());
        }
        for url in &self.stall {
            host.stall(url.as_str());
        }
        host
    }
}
