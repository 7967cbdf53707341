// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Load watchdog
//!
//! Runs after every script completion and top-level `require`, then every
//! 50ms while scripts are outstanding. Once `waitSeconds` have passed since
//! the last top-level `require`, records still waiting for their source
//! are reported as a timeout. When no script is outstanding but top-level
//! requests are still unfinished, the remaining waits can only be cycles,
//! so they are broken.

use crate::error::LoaderError;
use crate::module_system::context::Context;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Polling interval while loads are outstanding
pub const CHECK_INTERVAL: Duration = Duration::from_millis(50);

struct Snapshot {
    id: String,
    is_define: bool,
    is_plugin: bool,
    inited: bool,
    fetched: bool,
}

impl Context {
    /// Look for timeouts and cycles; reschedule while loads are outstanding
    pub(crate) fn check_loaded(&self) {
        let (wait_seconds, start_time, in_flight, records) = {
            let mut state = self.state_mut();
            if state.in_check_loaded {
                return;
            }
            state.in_check_loaded = true;

            let mut records: Vec<Snapshot> = state
                .registry
                .values()
                .filter(|r| r.enabled && !r.defined && !r.timed_out && r.error.is_none())
                .map(|r| Snapshot {
                    id: r.map.id.clone(),
                    is_define: r.map.is_define,
                    is_plugin: r.map.plugin_prefix.is_some(),
                    inited: r.inited,
                    fetched: r.fetched,
                })
                .collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            (state.config.wait_seconds, state.start_time, state.in_flight, records)
        };

        let expired =
            wait_seconds > 0 && start_time + Duration::from_secs(wait_seconds) < Instant::now();

        let mut no_loads = Vec::new();
        let mut req_calls = Vec::new();
        let mut still_loading = false;
        let mut using_path_fallback = false;
        let mut need_cycle_check = true;

        for record in &records {
            if !record.is_define {
                req_calls.push(record.id.clone());
            }
            if record.inited {
                continue;
            }
            if expired {
                if self.has_path_fallback(&record.id) {
                    using_path_fallback = true;
                    still_loading = true;
                } else {
                    no_loads.push(record.id.clone());
                }
            } else if record.fetched && record.is_define {
                still_loading = true;
                // Plugin resources may wait on a cycle themselves
                if !record.is_plugin {
                    need_cycle_check = false;
                }
            }
        }

        if expired && !no_loads.is_empty() {
            for id in &no_loads {
                self.with_record(id, |record| record.timed_out = true);
            }
            self.state_mut().in_check_loaded = false;
            tracing::warn!(context = %self.name(), modules = ?no_loads, "load timeout");
            self.report(LoaderError::Timeout { ids: no_loads });
            return;
        }

        if need_cycle_check {
            for id in &req_calls {
                self.break_cycle(id, &mut HashSet::new(), &mut HashSet::new());
            }
        }

        if (!expired || using_path_fallback) && (still_loading || in_flight > 0) {
            self.schedule_check();
        }

        self.state_mut().in_check_loaded = false;
    }

    fn schedule_check(&self) {
        {
            let mut state = self.state_mut();
            if state.check_scheduled {
                return;
            }
            state.check_scheduled = true;
        }
        let weak = self.downgrade();
        self.event_loop().set_timeout(CHECK_INTERVAL, move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.state_mut().check_scheduled = false;
                ctx.check_loaded();
            }
        });
    }
}
