// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module identifier resolution
//!
//! Turns a raw, possibly relative, possibly plugin-prefixed module name into
//! a canonical [`ModuleIdentifier`]:
//!
//! 1. split a leading `prefix!`
//! 2. resolve `./` and `../` against the directory of the base id
//! 3. apply `map` (longest scope, longest id prefix; `*` as fallback)
//! 4. substitute a package name by its main module
//! 5. compute the URL from `paths`, `baseUrl` and `urlArgs`

use crate::config::Config;
use crate::module_system::plugin::LoaderPlugin;
use regex::Regex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

/// Names that are used as URLs unchanged
static URL_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/|:|\?|\.js$").expect("valid regex"));

/// URLs that never get a `.js` suffix
static NO_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^data:|^blob:|\?").expect("valid regex"));

/// Absolute URLs that must not be prefixed with `baseUrl`
static HAS_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+.\-]+:").expect("valid regex"));

/// Canonical identity of a requested module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentifier {
    /// Registry key: `prefix!resource` or `resource`
    pub id: String,
    /// Plugin module id, for `prefix!resource` names
    pub plugin_prefix: Option<String>,
    /// Normalized name without the plugin prefix
    pub resource_name: String,
    /// Fetchable URL; plugin resources have none
    pub url: Option<String>,
    /// Identifier of the module that asked for this one
    pub parent: Option<Box<ModuleIdentifier>>,
    /// Name as written by the requester
    pub original_name: Option<String>,
    /// False for the synthetic records behind top-level `require` calls
    pub is_define: bool,
    /// The plugin was not loaded yet, so the resource name is provisional
    pub unnormalized: bool,
}

impl ModuleIdentifier {
    /// Resource name used for relative resolution of this module's deps
    pub fn name(&self) -> &str {
        &self.resource_name
    }
}

/// Split `prefix!name` into its parts
pub fn split_prefix(name: &str) -> (Option<&str>, &str) {
    match name.find('!') {
        Some(index) => (Some(&name[..index]), &name[index + 1..]),
        None => (None, name),
    }
}

/// Collapse `.` and `..` segments left to right
///
/// A `..` with nothing left to consume is kept.
pub fn trim_dots(parts: &mut Vec<String>) {
    let mut i = 0;
    while i < parts.len() {
        match parts[i].as_str() {
            "." => {
                parts.remove(i);
                continue;
            }
            ".." => {
                let underflow = i == 0
                    || (i == 1 && parts.get(2).map(String::as_str) == Some(".."))
                    || parts[i - 1] == "..";
                if !underflow {
                    parts.drain(i - 1..=i);
                    i -= 1;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

/// Normalize a module name against an optional base id
pub fn normalize(name: &str, base: Option<&str>, apply_map: bool, config: &Config) -> String {
    let base_parts: Option<Vec<&str>> = base.map(|b| b.split('/').collect());
    let mut name = name.to_string();

    if !name.is_empty() {
        let mut parts: Vec<String> = name.split('/').map(str::to_string).collect();

        if config.node_id_compat && parts[0].starts_with('.') {
            if let Some(last) = parts.last_mut() {
                if let Some(stripped) = last.strip_suffix(".js") {
                    *last = stripped.to_string();
                }
            }
        }

        if parts[0].starts_with('.') {
            if let Some(base_parts) = &base_parts {
                // Relative to the base's directory, not the base itself
                let dir = &base_parts[..base_parts.len().saturating_sub(1)];
                let mut joined: Vec<String> = dir.iter().map(|s| s.to_string()).collect();
                joined.extend(parts);
                parts = joined;
            }
        }

        trim_dots(&mut parts);
        name = parts.join("/");
    }

    let star_map = config.map.get("*");
    if apply_map && !config.map.is_empty() && (base_parts.is_some() || star_map.is_some()) {
        if let Some(mapped) = apply_map_config(&name, base_parts.as_deref(), config) {
            name = mapped;
        }
    }

    match config.pkgs.get(&name) {
        Some(main) => main.clone(),
        None => name,
    }
}

/// Find the longest `map` replacement for `name` as seen from `base_parts`
fn apply_map_config(name: &str, base_parts: Option<&[&str]>, config: &Config) -> Option<String> {
    let name_parts: Vec<&str> = name.split('/').collect();
    let star_map = config.map.get("*");
    let mut found: Option<(&str, usize)> = None;
    let mut found_star: Option<(&str, usize)> = None;

    'outer: for i in (1..=name_parts.len()).rev() {
        let segment = name_parts[..i].join("/");

        if let Some(base_parts) = base_parts {
            for j in (1..=base_parts.len()).rev() {
                let scope = base_parts[..j].join("/");
                if let Some(value) = config.map.get(&scope).and_then(|m| m.get(&segment)) {
                    found = Some((value.as_str(), i));
                    break 'outer;
                }
            }
        }

        if found_star.is_none() {
            if let Some(value) = star_map.and_then(|m| m.get(&segment)) {
                found_star = Some((value.as_str(), i));
            }
        }
    }

    let (replacement, consumed) = found.or(found_star)?;
    let mut parts: Vec<&str> = vec![replacement];
    parts.extend_from_slice(&name_parts[consumed..]);
    Some(parts.join("/"))
}

/// Compute the URL for a normalized module name
///
/// `ext` replaces the default `.js` suffix; `skip_ext` suppresses it.
pub fn name_to_url(module_name: &str, ext: Option<&str>, skip_ext: bool, config: &Config) -> String {
    let module_name = config
        .pkgs
        .get(module_name)
        .map(String::as_str)
        .unwrap_or(module_name);

    if let Some(bundle_id) = config.bundles_map.get(module_name) {
        return name_to_url(bundle_id, ext, skip_ext, config);
    }

    let url = if URL_LIKE.is_match(module_name) {
        format!("{}{}", module_name, ext.unwrap_or(""))
    } else {
        let mut syms: Vec<&str> = module_name.split('/').collect();
        for i in (1..=syms.len()).rev() {
            let parent = syms[..i].join("/");
            if let Some(path) = config.path_for(&parent) {
                syms.splice(0..i, [path]);
                break;
            }
        }

        let mut url = syms.join("/");
        match ext {
            Some(ext) => url.push_str(ext),
            None if NO_SUFFIX.is_match(&url) || skip_ext => {}
            None => url.push_str(".js"),
        }
        if url.starts_with('/') || HAS_SCHEME.is_match(&url) {
            url
        } else {
            format!("{}{}", config.base_url, url)
        }
    };

    append_url_args(url, config)
}

fn append_url_args(url: String, config: &Config) -> String {
    match &config.url_args {
        Some(args) if !args.is_empty() && !url.starts_with("blob:") => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{}{}{}", url, separator, args)
        }
        _ => url,
    }
}

type CacheKey = (String, Option<String>, bool, bool);

/// Builds [`ModuleIdentifier`]s and caches the plugin-free ones
///
/// Works through `&self`: no borrow is held while a plugin's `normalize`
/// runs, so plugins may call back into the loader.
#[derive(Debug, Default)]
pub struct IdentifierResolver {
    cache: RefCell<HashMap<CacheKey, ModuleIdentifier>>,
    require_counter: Cell<u64>,
    unnormalized_counter: Cell<u64>,
}

impl IdentifierResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget cached identifiers (configuration changed)
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Resolve `name` (or allocate an anonymous id for `None`)
    ///
    /// `plugin_for` looks up an already-defined plugin so its `normalize` can
    /// canonicalize the resource name. Identifiers carrying a plugin prefix
    /// are never cached: the plugin's normalization may depend on context.
    pub fn make(
        &self,
        name: Option<&str>,
        parent: Option<&ModuleIdentifier>,
        is_normalized: bool,
        apply_map: bool,
        config: &Config,
        plugin_for: &dyn Fn(&str) -> Option<Rc<dyn LoaderPlugin>>,
    ) -> ModuleIdentifier {
        let parent_name = parent.map(|p| p.name().to_string());

        let raw = match name {
            Some(raw) => raw.to_string(),
            None => {
                let count = self.require_counter.get() + 1;
                self.require_counter.set(count);
                let id = format!("_@r{}", count);
                return ModuleIdentifier {
                    id: id.clone(),
                    plugin_prefix: None,
                    resource_name: id,
                    url: None,
                    parent: parent.map(|p| Box::new(p.clone())),
                    original_name: None,
                    is_define: false,
                    unnormalized: false,
                };
            }
        };

        let key = (raw.clone(), parent_name.clone(), is_normalized, apply_map);
        if let Some(cached) = self.cache.borrow().get(&key) {
            return cached.clone();
        }

        let (prefix, rest) = split_prefix(&raw);
        let mut is_normalized = is_normalized;
        let mut prefix = prefix
            .map(|p| normalize(p, parent_name.as_deref(), apply_map, config));
        let plugin = prefix.as_deref().and_then(plugin_for);

        let mut url = None;
        let resource_name = if rest.is_empty() {
            String::new()
        } else if let Some(prefix_id) = &prefix {
            if is_normalized {
                rest.to_string()
            } else if let Some(plugin) = &plugin {
                let base = parent_name.clone();
                let local = move |n: &str| normalize(n, base.as_deref(), apply_map, config);
                tracing::trace!(plugin = %prefix_id, name = rest, "plugin normalize");
                plugin.normalize(rest, &local)
            } else if rest.contains('!') {
                rest.to_string()
            } else {
                normalize(rest, parent_name.as_deref(), apply_map, config)
            }
        } else {
            let normalized = normalize(rest, parent_name.as_deref(), apply_map, config);
            // `map` may introduce a plugin prefix
            let (mapped_prefix, mapped_rest) = split_prefix(&normalized);
            prefix = mapped_prefix.map(str::to_string);
            is_normalized = true;
            let resource = mapped_rest.to_string();
            if prefix.is_none() {
                url = Some(name_to_url(&resource, None, false, config));
            }
            resource
        };

        let unnormalized = prefix.is_some() && plugin.is_none() && !is_normalized;
        let mut id = match &prefix {
            Some(prefix) => format!("{}!{}", prefix, resource_name),
            None => resource_name.clone(),
        };
        if unnormalized {
            let count = self.unnormalized_counter.get() + 1;
            self.unnormalized_counter.set(count);
            id.push_str(&format!("_unnormalized{}", count));
        }

        let identifier = ModuleIdentifier {
            id,
            plugin_prefix: prefix,
            resource_name,
            url,
            parent: parent.map(|p| Box::new(p.clone())),
            original_name: Some(raw),
            is_define: true,
            unnormalized,
        };

        if identifier.plugin_prefix.is_none() {
            self.cache.borrow_mut().insert(key, identifier.clone());
        }
        identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;

    fn config(json: &str) -> Config {
        let mut config = Config::default();
        config.merge(&LoaderConfig::from_json_str(json).unwrap());
        config
    }

    fn no_plugins(_: &str) -> Option<Rc<dyn LoaderPlugin>> {
        None
    }

    #[test]
    fn test_relative_normalization() {
        let cfg = Config::default();
        assert_eq!(normalize("./a", Some("x/y"), false, &cfg), "x/a");
        assert_eq!(normalize("../a", Some("x/y/z"), false, &cfg), "x/a");
        assert_eq!(normalize("./b/../c", Some("x/y"), false, &cfg), "x/c");
        assert_eq!(normalize("a/./b", None, false, &cfg), "a/b");
    }

    #[test]
    fn test_underflowing_dots_are_kept() {
        let cfg = Config::default();
        assert_eq!(normalize("../../a", Some("x/y"), false, &cfg), "x/../../a");
        assert_eq!(normalize("../a", None, false, &cfg), "../a");
    }

    #[test]
    fn test_node_id_compat_strips_js() {
        let cfg = config(r#"{ "nodeIdCompat": true }"#);
        assert_eq!(normalize("./util.js", Some("lib/main"), false, &cfg), "lib/util");
        // Top-level ids keep their extension
        assert_eq!(normalize("vendor/util.js", None, false, &cfg), "vendor/util.js");
    }

    #[test]
    fn test_map_prefers_scoped_over_star() {
        let cfg = config(
            r#"{ "map": {
                "*": { "jquery": "jquery-private" },
                "some/newmodule": { "foo": "foo1.2" },
                "some": { "foo": "foo1.0", "jquery": "jquery-legacy" }
            } }"#,
        );
        assert_eq!(normalize("foo", Some("some/newmodule"), true, &cfg), "foo1.2");
        assert_eq!(normalize("foo/bar", Some("some/oldmodule"), true, &cfg), "foo1.0/bar");
        assert_eq!(normalize("jquery", Some("some/oldmodule"), true, &cfg), "jquery-legacy");
        assert_eq!(normalize("jquery", Some("app/main"), true, &cfg), "jquery-private");
        assert_eq!(normalize("jquery", None, true, &cfg), "jquery-private");
        // Map is skipped when not requested
        assert_eq!(normalize("foo", Some("some/newmodule"), false, &cfg), "foo");
    }

    #[test]
    fn test_map_longest_name_prefix() {
        let cfg = config(r#"{ "map": { "*": { "a": "A", "a/b": "AB" } } }"#);
        assert_eq!(normalize("a/b/c", None, true, &cfg), "AB/c");
        assert_eq!(normalize("a/x", None, true, &cfg), "A/x");
    }

    #[test]
    fn test_package_main_substitution() {
        let cfg = config(r#"{ "packages": [{ "name": "pkg", "location": "vendor/pkg", "main": "lib/index" }] }"#);
        assert_eq!(normalize("pkg", None, true, &cfg), "pkg/lib/index");
        assert_eq!(name_to_url("pkg/lib/index", None, false, &cfg), "./vendor/pkg/lib/index.js");
    }

    #[test]
    fn test_name_to_url() {
        let cfg = config(
            r#"{ "baseUrl": "js", "paths": { "lib": "vendor/lib", "cdn": "https://cdn.example.com/x", "multi": ["first", "second"] } }"#,
        );
        assert_eq!(name_to_url("app/main", None, false, &cfg), "js/app/main.js");
        assert_eq!(name_to_url("lib/util", None, false, &cfg), "js/vendor/lib/util.js");
        assert_eq!(name_to_url("cdn", None, false, &cfg), "https://cdn.example.com/x.js");
        assert_eq!(name_to_url("multi", None, false, &cfg), "js/first.js");
        assert_eq!(name_to_url("/abs/file.js", None, false, &cfg), "/abs/file.js");
        assert_eq!(name_to_url("data/file", Some(".txt"), true, &cfg), "js/data/file.txt");
    }

    #[test]
    fn test_url_args() {
        let cfg = config(r#"{ "urlArgs": "bust=1" }"#);
        assert_eq!(name_to_url("a", None, false, &cfg), "./a.js?bust=1");
        assert_eq!(name_to_url("b.js?x=1", None, false, &cfg), "b.js?x=1&bust=1");
    }

    #[test]
    fn test_bundle_ids_resolve_to_bundle_url() {
        let cfg = config(r#"{ "bundles": { "bundles/main": ["a", "b"] } }"#);
        assert_eq!(name_to_url("a", None, false, &cfg), "./bundles/main.js");
        assert_eq!(name_to_url("b", None, false, &cfg), "./bundles/main.js");
    }

    #[test]
    fn test_make_identifier() {
        let cfg = config(r#"{ "baseUrl": "js" }"#);
        let resolver = IdentifierResolver::new();
        let parent = resolver.make(Some("app/main"), None, false, true, &cfg, &no_plugins);
        assert_eq!(parent.id, "app/main");
        assert_eq!(parent.url.as_deref(), Some("js/app/main.js"));

        let dep = resolver.make(Some("./util"), Some(&parent), false, true, &cfg, &no_plugins);
        assert_eq!(dep.id, "app/util");
        assert_eq!(dep.original_name.as_deref(), Some("./util"));
        assert!(dep.is_define);

        let anon = resolver.make(None, None, false, true, &cfg, &no_plugins);
        assert!(!anon.is_define);
        assert!(anon.id.starts_with("_@r"));
    }

    #[test]
    fn test_unloaded_plugin_gets_provisional_id() {
        let cfg = Config::default();
        let resolver = IdentifierResolver::new();
        let first = resolver.make(Some("text!./a.txt"), None, false, true, &cfg, &no_plugins);
        let second = resolver.make(Some("text!./a.txt"), None, false, true, &cfg, &no_plugins);

        assert!(first.unnormalized);
        assert_eq!(first.plugin_prefix.as_deref(), Some("text"));
        assert!(first.id.starts_with("text!a.txt_unnormalized"));
        assert_ne!(first.id, second.id);
        assert!(first.url.is_none());
    }
}
