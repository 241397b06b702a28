// Vlanstitch: Multi-Aggregate VLAN Circuit Reservation
// Copyright (C) 2024  Vlanstitch Developers
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

#![deny(missing_docs)]

//! # Vlanstitch: Multi-Aggregate VLAN Circuit Reservation
//!
//! This is a library for reserving a multi-segment virtual circuit across
//! a set of cooperating resource providers ("aggregates"), each owning one
//! or more segments ("hops") of an end-to-end path. Every hop carries a
//! VLAN tag constraint, and adjacent hops must agree on tags subject to
//! per-hop translation capability.
//!
//! Given a stitching plan (paths of hops, each pinned to an aggregate,
//! with dependency edges), the engine drives the reservations to
//! completion: it negotiates VLAN tags, handles partial failures, retries,
//! deletes and re-reserves, and on exhaustion escalates to an external
//! path computation service for a new plan.
//!
//! ## Structure
//!
//! - **[`topology`]**: the per-run arena of [`Hop`](topology::Hop),
//!   [`Path`](topology::Path) and [`Aggregate`](topology::Aggregate)
//!   objects, addressed by integer handles, plus the aggregate dependency
//!   graph and the allocation workhorse
//!   ([`Topology::allocate_aggregate`](topology::Topology::allocate_aggregate)).
//!
//! - **[`vlan`]**: the [`VlanRange`](vlan::VlanRange) tag-set algebra,
//!   including the `any` sentinel ("the provider chooses").
//!
//! - **[`negotiate`]**: the recovery engine invoked when a provider cannot
//!   honor a tag or delivers a different one — local re-pick, upstream
//!   redo, or escalation to the plan expander.
//!
//! - **[`scheduler`]**: the dependency-ordered run loop with its global
//!   budgets (expander calls, allocation attempts, wall clock).
//!
//! - **[`classify`]**: the taxonomy mapping provider error dialects onto
//!   retry / renegotiate / escalate / fatal.
//!
//! - **[`family`]**: the provider family capability table.
//!
//! - **[`provider`]**: the trait seams to the external collaborators (RPC
//!   client, plan expander, document codec).
//!
//! - **[`sample`]**: prepared plans and scripted collaborators, used by
//!   the test suite and the demo binary.
//!
//! ## Usage
//!
//! ```
//! use vlanstitch::provider::PlanDoc;
//! use vlanstitch::sample::{self, EchoCodec, ScriptedExpander, ScriptedProvider};
//! use vlanstitch::scheduler::{Scheduler, SchedulerConfig};
//! use vlanstitch::Stopper;
//!
//! fn main() -> Result<(), vlanstitch::StitchError> {
//!     let plan = sample::linear_two_aggregates();
//!     let provider = ScriptedProvider::echo();
//!     let expander = ScriptedExpander::fixed(plan);
//!     let cfg = SchedulerConfig {
//!         suppress_waits: true,
//!         seed: Some(7),
//!         ..SchedulerConfig::default()
//!     };
//!     let mut scheduler = Scheduler::new(
//!         PlanDoc("request".to_string()),
//!         provider,
//!         expander,
//!         EchoCodec,
//!         cfg,
//!     )?;
//!     let report = scheduler.run(Stopper::new())?;
//!     println!("{} aggregates reserved", report.aggregates.len());
//!     Ok(())
//! }
//! ```

mod error;
pub mod classify;
pub mod family;
pub mod negotiate;
pub mod provider;
pub mod sample;
pub mod scheduler;
pub mod topology;
pub mod vlan;

mod test;

pub use error::StitchError;

use std::sync::{Arc, RwLock};

/// Cancel token: the scheduler checks it before each dispatch and after
/// each RPC return, and stops cleanly when it is set.
#[derive(Clone, Debug, Default)]
pub struct Stopper {
    flag: Arc<RwLock<bool>>,
}

impl Stopper {
    /// Create a new, unset stopper.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(RwLock::new(false)),
        }
    }

    /// Send the stop command. Blocks until the write lock is acquired.
    pub fn send_stop(&self) {
        if let Ok(mut flag) = self.flag.write() {
            *flag = true;
        }
    }

    /// Check whether the stop flag is set.
    pub fn is_stop(&self) -> bool {
        self.flag.read().map(|flag| *flag).unwrap_or(false)
    }
}
