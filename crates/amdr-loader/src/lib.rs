// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # amdr-loader
//!
//! An asynchronous AMD module loader with CommonJS interop.
//!
//! Modules are registered with `define(id, deps, factory)` and requested with
//! `require(deps, callback)`. The loader resolves ids through `baseUrl`,
//! `paths`, `map` and packages, fetches missing scripts through a
//! [`ScriptHost`], waits for dependencies, breaks cycles, and runs each
//! factory exactly once.
//!
//! - single-threaded: an [`EventLoop`] runs promise reactions, "next tick"
//!   callbacks and timers
//! - loader plugins handle `prefix!resource` ids ([`LoaderPlugin`])
//! - a watchdog reports modules whose script never arrives
//! - independent, named [`Context`]s
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use amdr_loader::{Factory, Loader, MemoryHost, Value};
//! use std::rc::Rc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> amdr_loader::Result<()> {
//!     let loader = Loader::new(Rc::new(MemoryHost::blocking()));
//!     let ctx = loader.default_context();
//!
//!     ctx.define(Some("b"), &[], Value::from(42));
//!     ctx.define(Some("a"), &["b"], Factory::function(|deps| {
//!         Ok(Value::from(deps[0].as_f64().unwrap_or_default() + 1.0))
//!     }));
//!     ctx.require(&["a"], |values| {
//!         println!("a = {}", values[0]);
//!         Ok(())
//!     }, None);
//!
//!     loader.run().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod host;
pub mod loader;
pub mod module_system;
pub mod plugins;
pub mod runtime;
pub mod value;

// Re-exports
pub use config::{Config, LoaderConfig};
pub use error::{LoaderError, Result};
pub use host::{HostMode, MemoryHost, ScriptHost, ScriptRequest};
pub use loader::{DEFAULT_CONTEXT, Loader};
pub use module_system::{
    Context, Errback, Factory, FetchStrategy, LoadCallback, LoaderPlugin, LocalRequire,
    ModuleIdentifier, RecordState,
};
pub use plugins::TextPlugin;
pub use runtime::{EventLoop, Promise};
pub use value::{Object, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
