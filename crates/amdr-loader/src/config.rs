// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader configuration
//!
//! [`LoaderConfig`] is what callers hand to `config()`: every field is
//! optional and the JSON shape follows the conventional AMD options
//! (`baseUrl`, `paths`, `map`, `packages`, `shim`, `bundles`, ...).
//! [`Config`] is the effective per-context configuration those calls are
//! merged into, additively.

use crate::error::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Default watchdog timeout
pub const DEFAULT_WAIT_SECONDS: u64 = 7;

/// A `paths` entry: one location or an ordered list of fallbacks
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PathTarget {
    /// Single location
    Single(String),
    /// Candidates tried in order until one loads
    Fallbacks(Vec<String>),
}

impl PathTarget {
    fn into_candidates(self) -> Vec<String> {
        match self {
            PathTarget::Single(path) => vec![path],
            PathTarget::Fallbacks(paths) => paths,
        }
    }
}

/// A `packages` entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PackageSpec {
    /// Package whose main module is `<name>/main`
    Name(String),
    /// Package with explicit location and main module
    Detailed {
        /// Package name
        name: String,
        /// Directory the package lives in
        #[serde(default)]
        location: Option<String>,
        /// Main module, relative to the package
        #[serde(default)]
        main: Option<String>,
    },
}

/// A `shim` entry for scripts that do not call `define`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ShimSpec {
    /// Shorthand: dependencies only
    Deps(Vec<String>),
    /// Dependencies and the global the script exports
    Full {
        /// Scripts that must run first
        #[serde(default)]
        deps: Vec<String>,
        /// Global name read as the module value
        #[serde(default)]
        exports: Option<String>,
    },
}

/// Effective shim for a module id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shim {
    /// Dependencies loaded before the script
    pub deps: Vec<String>,
    /// Global name holding the module value
    pub exports: Option<String>,
}

/// Options accepted by `config()`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderConfig {
    /// Context the options apply to (`Loader::config` only)
    pub context: Option<String>,
    /// Directory prefix for ids without a `paths` entry
    pub base_url: Option<String>,
    /// Id prefix -> location (or ordered fallback list)
    pub paths: BTreeMap<String, PathTarget>,
    /// Scope id -> (id prefix -> replacement); `*` applies to every scope
    pub map: BTreeMap<String, BTreeMap<String, String>>,
    /// Package declarations
    pub packages: Vec<PackageSpec>,
    /// Package name -> main module id, already resolved
    pub pkgs: BTreeMap<String, String>,
    /// Non-module scripts
    pub shim: BTreeMap<String, ShimSpec>,
    /// Bundle id -> ids the bundle defines
    pub bundles: BTreeMap<String, Vec<String>>,
    /// Watchdog timeout in seconds; 0 disables it
    pub wait_seconds: Option<u64>,
    /// Query string appended to fetched URLs
    pub url_args: Option<String>,
    /// Strip a trailing `.js` from ids
    pub node_id_compat: Option<bool>,
    /// Treat scripts that never call `define` as errors
    pub enforce_define: Option<bool>,
    /// Per-module configuration, exposed as `module.config`
    pub config: BTreeMap<String, serde_json::Value>,
    /// Ids to require once the configuration is applied
    pub deps: Vec<String>,
}

impl LoaderConfig {
    /// Parse options from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse options from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Effective configuration of one context
#[derive(Debug, Clone)]
pub struct Config {
    /// Always ends with `/` (or is empty)
    pub base_url: String,
    /// Id prefix -> remaining location candidates; the first one is current
    pub paths: BTreeMap<String, Vec<String>>,
    /// Scoped id remapping
    pub map: BTreeMap<String, BTreeMap<String, String>>,
    /// Package name -> main module id
    pub pkgs: BTreeMap<String, String>,
    /// Shim configuration by id
    pub shim: BTreeMap<String, Shim>,
    /// Module id -> id of the bundle that defines it
    pub bundles_map: BTreeMap<String, String>,
    /// Watchdog timeout in seconds; 0 disables it
    pub wait_seconds: u64,
    /// Query string appended to URLs
    pub url_args: Option<String>,
    /// Strip trailing `.js` from ids
    pub node_id_compat: bool,
    /// Require a `define` call from every fetched script
    pub enforce_define: bool,
    /// Per-module configuration
    pub module_config: BTreeMap<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "./".to_string(),
            paths: BTreeMap::new(),
            map: BTreeMap::new(),
            pkgs: BTreeMap::new(),
            shim: BTreeMap::new(),
            bundles_map: BTreeMap::new(),
            wait_seconds: DEFAULT_WAIT_SECONDS,
            url_args: None,
            node_id_compat: false,
            enforce_define: false,
            module_config: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Merge `options` into this configuration
    pub fn merge(&mut self, options: &LoaderConfig) {
        if let Some(base_url) = &options.base_url {
            let mut base_url = base_url.clone();
            if !base_url.is_empty() && !base_url.ends_with('/') {
                base_url.push('/');
            }
            self.base_url = base_url;
        }

        for (prefix, target) in &options.paths {
            self.paths
                .insert(prefix.clone(), target.clone().into_candidates());
        }

        for (scope, entries) in &options.map {
            let scoped = self.map.entry(scope.clone()).or_default();
            for (from, to) in entries {
                scoped.insert(from.clone(), to.clone());
            }
        }

        for (bundle_id, ids) in &options.bundles {
            for id in ids {
                if id != bundle_id {
                    self.bundles_map.insert(id.clone(), bundle_id.clone());
                }
            }
        }

        for (id, value) in &options.config {
            self.module_config.insert(id.clone(), value.clone());
        }

        for (id, entry) in &options.shim {
            let shim = match entry {
                ShimSpec::Deps(deps) => Shim {
                    deps: deps.clone(),
                    exports: None,
                },
                ShimSpec::Full { deps, exports } => Shim {
                    deps: deps.clone(),
                    exports: exports.clone(),
                },
            };
            self.shim.insert(id.clone(), shim);
        }

        for (name, main) in &options.pkgs {
            self.pkgs.insert(name.clone(), main.clone());
        }

        for package in &options.packages {
            let (name, location, main) = match package {
                PackageSpec::Name(name) => (name.as_str(), None, None),
                PackageSpec::Detailed {
                    name,
                    location,
                    main,
                } => (name.as_str(), location.as_deref(), main.as_deref()),
            };
            if let Some(location) = location {
                self.paths
                    .insert(name.to_string(), vec![location.to_string()]);
            }
            let main = main.unwrap_or("main");
            let main = main.strip_prefix("./").unwrap_or(main);
            let main = main.strip_suffix(".js").unwrap_or(main);
            self.pkgs
                .insert(name.to_string(), format!("{}/{}", name, main));
        }

        if let Some(wait) = options.wait_seconds {
            self.wait_seconds = wait;
        }
        if let Some(url_args) = &options.url_args {
            self.url_args = Some(url_args.clone());
        }
        if let Some(compat) = options.node_id_compat {
            self.node_id_compat = compat;
        }
        if let Some(enforce) = options.enforce_define {
            self.enforce_define = enforce;
        }
    }

    /// Current `paths` candidate for an id prefix
    pub fn path_for(&self, prefix: &str) -> Option<&str> {
        self.paths
            .get(prefix)
            .and_then(|candidates| candidates.first())
            .map(String::as_str)
    }

    /// Drop the current candidate for `id` if another one remains
    ///
    /// Returns the candidate that becomes current.
    pub fn advance_path_fallback(&mut self, id: &str) -> Option<String> {
        let candidates = self.paths.get_mut(id)?;
        if candidates.len() > 1 {
            candidates.remove(0);
            candidates.first().cloned()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_merge() {
        let options = LoaderConfig::from_json_str(
            r#"{
                "baseUrl": "js",
                "paths": { "jquery": ["cdn/jquery", "lib/jquery"], "app": "src/app" },
                "packages": ["dojo", { "name": "ui", "location": "vendor/ui", "main": "./index.js" }],
                "shim": { "legacy": { "deps": ["jquery"], "exports": "Legacy" }, "plain": ["app"] },
                "bundles": { "core-bundle": ["a", "b", "core-bundle"] },
                "waitSeconds": 0,
                "urlArgs": "v=2",
                "config": { "app/main": { "debug": true } }
            }"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.merge(&options);

        assert_eq!(config.base_url, "js/");
        assert_eq!(config.path_for("jquery"), Some("cdn/jquery"));
        assert_eq!(config.path_for("ui"), Some("vendor/ui"));
        assert_eq!(config.pkgs.get("dojo").map(String::as_str), Some("dojo/main"));
        assert_eq!(config.pkgs.get("ui").map(String::as_str), Some("ui/index"));
        assert_eq!(config.shim["legacy"].exports.as_deref(), Some("Legacy"));
        assert_eq!(config.shim["plain"].deps, vec!["app".to_string()]);
        assert_eq!(config.bundles_map.get("a").map(String::as_str), Some("core-bundle"));
        assert!(!config.bundles_map.contains_key("core-bundle"));
        assert_eq!(config.wait_seconds, 0);
        assert_eq!(config.url_args.as_deref(), Some("v=2"));
        assert!(config.module_config.contains_key("app/main"));
    }

    #[test]
    fn test_merge_is_additive() {
        let mut config = Config::default();
        config.merge(
            &LoaderConfig::from_json_str(r#"{ "map": { "*": { "a": "a1" } }, "paths": { "x": "x1" } }"#)
                .unwrap(),
        );
        config.merge(
            &LoaderConfig::from_json_str(r#"{ "map": { "*": { "b": "b1" } }, "paths": { "y": "y1" } }"#)
                .unwrap(),
        );

        assert_eq!(config.map["*"].len(), 2);
        assert_eq!(config.path_for("x"), Some("x1"));
        assert_eq!(config.path_for("y"), Some("y1"));
        assert_eq!(config.wait_seconds, DEFAULT_WAIT_SECONDS);
        assert_eq!(config.base_url, "./");
    }

    #[test]
    fn test_path_fallbacks_advance() {
        let mut config = Config::default();
        config.merge(
            &LoaderConfig::from_json_str(r#"{ "paths": { "lib": ["one", "two"] } }"#).unwrap(),
        );

        assert_eq!(config.advance_path_fallback("lib").as_deref(), Some("two"));
        assert_eq!(config.advance_path_fallback("lib"), None);
        assert_eq!(config.path_for("lib"), Some("two"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(LoaderConfig::from_json_str("{ \"paths\": 3 }").is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "waitSeconds": 3, "enforceDefine": true }}"#).unwrap();

        let options = LoaderConfig::from_file(file.path()).unwrap();
        assert_eq!(options.wait_seconds, Some(3));
        assert_eq!(options.enforce_define, Some(true));
        assert!(LoaderConfig::from_file(Path::new("/nonexistent/amdr.json")).is_err());
    }
}
