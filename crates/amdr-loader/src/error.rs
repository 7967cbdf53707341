// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the module loader

use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors that can occur while resolving, fetching or defining modules
///
/// Errors are `Clone`: a single rejection reason is handed to every module
/// that depends on the failed one.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// Synchronous `require(id)` of a module that is not defined yet
    #[error("Module name \"{id}\" has not been loaded yet for context: {context}")]
    NotLoaded {
        /// Module id
        id: String,
        /// Context name
        context: String,
    },

    /// Watchdog expired with modules still unfinished
    #[error("Load timeout for modules: {}", .ids.join(","))]
    Timeout {
        /// Stalled module ids
        ids: Vec<String>,
    },

    /// A script could not be fetched and no path fallback remains
    #[error("Script error for \"{id}\"{}: {reason}", needed_by_suffix(.needed_by))]
    Fetch {
        /// Module id whose script failed
        id: String,
        /// URL of the last attempt
        url: String,
        /// Modules waiting on the failed one
        needed_by: Vec<String>,
        /// Reason reported by the host
        reason: String,
    },

    /// A promise was resolved with itself
    #[error("TypeError: cannot resolve a promise with itself")]
    SelfResolution,

    /// A module factory returned an error
    #[error("Error evaluating module \"{id}\": {source}")]
    Define {
        /// Module id
        id: String,
        /// Error raised by the factory
        source: Box<LoaderError>,
    },

    /// More than one anonymous `define` ran for a single script
    #[error("Mismatched anonymous define() module: {0}")]
    MismatchedDefine(String),

    /// `enforceDefine` is set and the script called no `define`
    #[error("No define call for {0}")]
    NoDefine(String),

    /// A loader plugin reported failure through `load.error`
    #[error("Plugin error for \"{id}\": {reason}")]
    Plugin {
        /// Plugin-qualified module id
        id: String,
        /// Reason given by the plugin
        reason: String,
    },

    /// The prefix of a `prefix!resource` id does not export a plugin
    #[error("Module \"{0}\" is not a loader plugin")]
    NotAPlugin(String),

    /// Text handed to `load.fromText` failed to evaluate
    #[error("fromText eval for {id} failed: {reason}")]
    FromText {
        /// Module id the text was defining
        id: String,
        /// Evaluation failure
        reason: String,
    },

    /// Configuration could not be parsed or applied
    #[error("Invalid loader configuration: {0}")]
    Config(String),

    /// The context backing a local `require` has been dropped
    #[error("Loader context has been torn down")]
    ContextDropped,

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

fn needed_by_suffix(parents: &[String]) -> String {
    if parents.is_empty() {
        String::new()
    } else {
        format!(", needed by: {}", parents.join(", "))
    }
}

impl LoaderError {
    /// Create a generic error with a message
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a "not loaded" error for a synchronous lookup
    pub fn not_loaded(id: impl Into<String>, context: impl Into<String>) -> Self {
        Self::NotLoaded {
            id: id.into(),
            context: context.into(),
        }
    }

    /// Module ids this error concerns
    pub fn require_modules(&self) -> Vec<String> {
        match self {
            Self::NotLoaded { id, .. }
            | Self::Fetch { id, .. }
            | Self::Define { id, .. }
            | Self::Plugin { id, .. }
            | Self::FromText { id, .. } => vec![id.clone()],
            Self::NoDefine(id) | Self::NotAPlugin(id) => vec![id.clone()],
            Self::Timeout { ids } => ids.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether this is a watchdog timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_lists_parents() {
        let err = LoaderError::Fetch {
            id: "a".to_string(),
            url: "js/a.js".to_string(),
            needed_by: vec!["main".to_string(), "b".to_string()],
            reason: "404".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Script error for \"a\", needed by: main, b: 404"
        );
        assert_eq!(err.require_modules(), vec!["a".to_string()]);
    }

    #[test]
    fn test_timeout_lists_ids() {
        let err = LoaderError::Timeout {
            ids: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Load timeout for modules: a,b");
    }
}
