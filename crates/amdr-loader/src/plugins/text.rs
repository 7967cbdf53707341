// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! `text!` plugin: a resource's contents as a string

use crate::config::Config;
use crate::error::Result;
use crate::module_system::{LoadCallback, LoaderPlugin, LocalRequire};
use crate::value::Value;

/// Loads `text!path/to/file.ext` through the host's `fetch_text`
///
/// The extension is part of the resource name, so `file.html` is fetched
/// as `file.html`, not `file.html.js`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextPlugin;

impl TextPlugin {
    /// Module id the plugin is usually registered under
    pub const ID: &'static str = "text";
}

impl LoaderPlugin for TextPlugin {
    fn load(&self, name: &str, require: &LocalRequire, onload: LoadCallback, _config: &Config) -> Result<()> {
        let url = require.to_url(name)?;
        let ctx = require.context()?;
        tracing::debug!(resource = name, url = %url, "fetching text resource");
        ctx.host().fetch_text(
            &ctx,
            &url,
            Box::new(move |result| match result {
                Ok(text) => onload.call(Value::String(text)),
                Err(err) => onload.error(err),
            }),
        );
        Ok(())
    }
}
