// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! AMD module system
//!
//! - identifier resolution (`paths`, `map`, packages, plugin prefixes)
//! - the registry of module records and their dependency engine
//! - loader plugins (`prefix!resource`)
//! - script fetching, path fallbacks and shims
//! - the load watchdog and cycle breaking
//! - `require`, synchronous and asynchronous

mod context;
mod engine;
mod fetch;
mod plugin;
mod record;
mod require;
mod resolver;
mod watchdog;

pub use context::{Context, ErrorHook, WeakContext};
pub use fetch::FetchStrategy;
pub use plugin::{LoadCallback, LoaderPlugin};
pub use record::{Errback, Factory, RecordState};
pub use require::LocalRequire;
pub use resolver::{IdentifierResolver, ModuleIdentifier, name_to_url, normalize, split_prefix, trim_dots};
pub use watchdog::CHECK_INTERVAL;
