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

//! # The reservation scheduler
//!
//! The scheduler owns the run: it asks the plan expander for the expanded
//! plan, dispatches aggregates whose dependencies are satisfied (FIFO,
//! single-threaded — the blocking RPC model), routes failures through the
//! negotiator, and re-expands the plan when negotiation escalates. Global
//! budgets bound the run: plan-expander calls, total allocation attempts,
//! and wall clock.

use crate::classify::Classifier;
use crate::error::StitchError;
use crate::negotiate::{NegotiationOutcome, VlanNegotiator};
use crate::provider::{PlanDoc, PlanExpander, ProviderClient, RspecCodec};
use crate::topology::{AggId, AggState, AllocationOutcome, Topology};
use crate::Stopper;
use log::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Tunables and budgets of one scheduler run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name of the slice the reservations belong to.
    pub slice_name: String,
    /// Where to persist per-attempt request documents; `None` disables.
    pub artifact_dir: Option<PathBuf>,
    /// Max calls to the plan expander (including the initial one).
    pub max_pce_calls: u32,
    /// Max allocation attempts across the whole run.
    pub max_total_allocations: u32,
    /// Max allocation attempts at one aggregate within one expansion;
    /// beyond this its hops are marked for exclusion.
    pub max_allocate_tries: u32,
    /// Wall-clock budget for the whole run.
    pub wall_clock_budget: Option<Duration>,
    /// Wall-clock budget for a single aggregate reservation.
    pub per_aggregate_budget: Option<Duration>,
    /// Seconds between polls of a busy provider.
    pub busy_poll_secs: u64,
    /// Max polls of a busy provider per attempt.
    pub busy_max_polls: u32,
    /// Seconds between status polls of a delayed-commit provider.
    pub status_poll_secs: u64,
    /// Max status polls before giving up on ready.
    pub status_max_polls: u32,
    /// Skip all inter-RPC waits (tests, replay runs).
    pub suppress_waits: bool,
    /// RNG seed for tag picks; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            slice_name: "circuit".to_string(),
            artifact_dir: None,
            max_pce_calls: 5,
            max_total_allocations: 100,
            max_allocate_tries: crate::family::MAX_ALLOCATE_TRIES,
            wall_clock_budget: None,
            per_aggregate_budget: None,
            busy_poll_secs: 10,
            busy_max_polls: crate::family::BUSY_MAX_POLLS,
            status_poll_secs: 30,
            status_max_polls: crate::family::STATUS_MAX_POLLS,
            suppress_waits: false,
            seed: None,
        }
    }
}

/// Final tag state of one hop, for the run report.
#[derive(Debug, Clone)]
pub struct HopReport {
    /// Path the hop sits on.
    pub path: String,
    /// Interface URN.
    pub urn: String,
    /// The committed tag, when the hop completed.
    pub tag: Option<u16>,
    /// Provider circuit id, when one was assigned.
    pub circuit_id: Option<String>,
}

/// Final state of one aggregate, for the run report.
#[derive(Debug, Clone)]
pub struct AggReport {
    /// Aggregate URN.
    pub urn: String,
    /// Provider endpoint.
    pub url: String,
    /// Final lifecycle state.
    pub state: AggState,
    /// Per-hop outcome.
    pub hops: Vec<HopReport>,
    /// Provider-side log URL, when one was exposed.
    pub provider_log_url: Option<String>,
}

/// What a completed run reserved, and what it cost.
#[derive(Debug, Clone)]
pub struct StitchReport {
    /// Plan-expander calls consumed.
    pub pce_calls: u32,
    /// Allocation attempts consumed.
    pub total_allocations: u32,
    /// Per-aggregate outcomes.
    pub aggregates: Vec<AggReport>,
}

/// The reservation scheduler for one run.
pub struct Scheduler<P, X, C> {
    topo: Topology,
    provider: P,
    expander: X,
    codec: C,
    classifier: Classifier,
    cfg: SchedulerConfig,
    original_request: PlanDoc,
    plan: PlanDoc,
    pce_calls: u32,
    total_allocations: u32,
    rng: StdRng,
}

impl<P, X, C> Scheduler<P, X, C>
where
    P: ProviderClient,
    X: PlanExpander,
    C: RspecCodec,
{
    /// Expand the request once and build the run state.
    pub fn new(
        request: PlanDoc,
        provider: P,
        expander: X,
        codec: C,
        cfg: SchedulerConfig,
    ) -> Result<Self, StitchError> {
        let mut expander = expander;
        let expanded = expander.expand(&request, &[], &BTreeMap::new())?;
        let topo = Topology::from_plan(&expanded)?;
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Scheduler {
            topo,
            provider,
            expander,
            codec,
            classifier: Classifier::new(),
            cfg,
            original_request: request,
            plan: expanded.request,
            pce_calls: 1,
            total_allocations: 0,
            rng,
        })
    }

    /// The current reservation topology.
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Mutable access to the topology, for tooling and tests.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topo
    }

    /// The provider client.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The plan expander.
    pub fn expander(&self) -> &X {
        &self.expander
    }

    /// Plan-expander calls consumed so far.
    pub fn pce_calls(&self) -> u32 {
        self.pce_calls
    }

    /// Drive all reservations to completion.
    pub fn run(&mut self, abort: Stopper) -> Result<StitchReport, StitchError> {
        let start = Instant::now();
        let mut queue: VecDeque<AggId> = VecDeque::new();

        loop {
            if abort.is_stop() {
                info!("Operation was aborted");
                return Err(StitchError::Abort);
            }
            if let Some(budget) = self.cfg.wall_clock_budget {
                if start.elapsed() > budget {
                    error!("Time budget used up before the circuit completed");
                    return Err(StitchError::Timeout);
                }
            }

            // promote everything whose dependencies are now satisfied
            for a in self.topo.agg_ids() {
                if self.topo.agg(a).is_schedulable()
                    && self.topo.deps_complete(a)
                    && !queue.contains(&a)
                {
                    self.topo.agg_mut(a).state = AggState::Ready;
                    queue.push_back(a);
                }
            }

            let next = match queue.pop_front() {
                Some(a) => a,
                None => {
                    let all_done = self
                        .topo
                        .agg_ids()
                        .iter()
                        .all(|a| self.topo.agg(*a).state == AggState::Completed);
                    if all_done {
                        info!(
                            "All {} aggregates completed ({} allocations, {} expander calls)",
                            self.topo.agg_ids().len(),
                            self.total_allocations,
                            self.pce_calls
                        );
                        return Ok(self.report());
                    }
                    return Err(StitchError::InternalInconsistent(
                        "no aggregate is ready but the plan is unsatisfied".to_string(),
                    ));
                }
            };

            // the queue may hold stale entries after a negotiation
            if !self.topo.agg(next).is_schedulable() || !self.topo.deps_complete(next) {
                continue;
            }

            self.total_allocations += 1;
            if self.total_allocations > self.cfg.max_total_allocations {
                error!("Allocation budget exhausted");
                return Err(StitchError::AllocateBudgetExhausted(self.total_allocations));
            }

            let agg_start = Instant::now();
            let result = self.topo.allocate_aggregate(
                next,
                &mut self.provider,
                &self.codec,
                &self.classifier,
                &self.cfg,
                &self.plan,
                self.pce_calls,
            );
            if let Some(budget) = self.cfg.per_aggregate_budget {
                if agg_start.elapsed() > budget {
                    self.topo.agg_mut(next).state = AggState::Failed;
                    error!("{} exceeded its reservation time budget", self.topo.agg(next).urn);
                    return Err(StitchError::Timeout);
                }
            }
            if abort.is_stop() {
                info!("Operation was aborted after an RPC returned");
                return Err(StitchError::Abort);
            }

            match result {
                Ok(AllocationOutcome::Completed) | Ok(AllocationOutcome::AlreadyDone) => {}
                Ok(AllocationOutcome::RetryImmediately(msg)) => {
                    info!("Retrying {} immediately: {}", self.topo.agg(next).urn, msg);
                    self.topo.agg_mut(next).state = AggState::Pending;
                    queue.retain(|a| *a != next);
                    queue.push_front(next);
                }
                Ok(AllocationOutcome::VlanUnavailable {
                    op,
                    err,
                    failed_hop,
                    suggested_was_null,
                }) => {
                    let mut negotiator = VlanNegotiator::new(
                        &mut self.topo,
                        &mut self.provider,
                        &self.classifier,
                        &self.cfg,
                        &mut self.rng,
                    );
                    match negotiator.handle_vlan_unavailable(
                        next,
                        op,
                        err.as_ref(),
                        failed_hop,
                        suggested_was_null,
                    ) {
                        Ok(NegotiationOutcome::RetryHere) => {}
                        Ok(NegotiationOutcome::RetryFromRoot(root)) => {
                            queue.retain(|a| *a != root);
                            queue.push_front(root);
                        }
                        Ok(NegotiationOutcome::EscalateToPce) => {
                            self.escalate_to_pce()?;
                            queue.clear();
                        }
                        Err(e) => {
                            self.topo.agg_mut(next).state = AggState::Failed;
                            return Err(e);
                        }
                    }
                }
                Ok(AllocationOutcome::SuggestedNotRequest) => {
                    let mut negotiator = VlanNegotiator::new(
                        &mut self.topo,
                        &mut self.provider,
                        &self.classifier,
                        &self.cfg,
                        &mut self.rng,
                    );
                    match negotiator.handle_suggested_not_request(next) {
                        Ok(NegotiationOutcome::RetryHere) => {}
                        Ok(NegotiationOutcome::RetryFromRoot(root)) => {
                            queue.retain(|a| *a != root);
                            queue.push_front(root);
                        }
                        Ok(NegotiationOutcome::EscalateToPce) => {
                            self.escalate_to_pce()?;
                            queue.clear();
                        }
                        Err(e) => {
                            self.topo.agg_mut(next).state = AggState::Failed;
                            return Err(e);
                        }
                    }
                }
                Ok(AllocationOutcome::CircuitFailed(msg)) => {
                    warn!("{}: {}", self.topo.agg(next).urn, msg);
                    self.exclude_if_over_budget(next);
                    self.escalate_to_pce()?;
                    queue.clear();
                }
                Err(StitchError::Transient(msg)) => {
                    warn!("Transient failure at {}: {}", self.topo.agg(next).urn, msg);
                    if self.topo.agg(next).allocate_tries >= self.cfg.max_allocate_tries {
                        self.exclude_if_over_budget(next);
                        self.escalate_to_pce()?;
                        queue.clear();
                    } else {
                        self.topo.agg_mut(next).state = AggState::Pending;
                    }
                }
                Err(StitchError::ManifestInconsistent(msg)) => {
                    error!("{}: {}", self.topo.agg(next).urn, msg);
                    self.topo
                        .delete_reservation(next, &mut self.provider, &self.cfg);
                    self.fatal_plan(next, &msg)?;
                    queue.clear();
                }
                Err(StitchError::FatalPlan(msg)) => {
                    self.fatal_plan(next, &msg)?;
                    queue.clear();
                }
                Err(e) => {
                    self.topo.agg_mut(next).state = AggState::Failed;
                    error!("Reservation failed at {}: {}", self.topo.agg(next).urn, e);
                    return Err(e);
                }
            }

            self.topo.check_invariants()?;
        }
    }

    /// A fatal-at-this-aggregate failure: the user's problem if they
    /// pinned the aggregate, otherwise exclude its hops and replan.
    fn fatal_plan(&mut self, agg: AggId, msg: &str) -> Result<(), StitchError> {
        if self.topo.agg(agg).user_requested {
            self.topo.agg_mut(agg).state = AggState::Failed;
            return Err(StitchError::FatalUser(format!(
                "reservation failed at user-pinned {}: {}",
                self.topo.agg(agg).urn,
                msg
            )));
        }
        debug!(
            "{} failed fatally; asking the expander for a plan without it",
            self.topo.agg(agg).urn
        );
        for hid in self.topo.hops_of(agg) {
            self.topo.hop_mut(hid).exclude_from_plan = true;
        }
        self.escalate_to_pce()
    }

    /// Mark an aggregate's hops for exclusion once it has burned its
    /// per-round attempt budget.
    fn exclude_if_over_budget(&mut self, agg: AggId) {
        if !self.topo.agg(agg).user_requested
            && self.topo.agg(agg).allocate_tries > self.cfg.max_allocate_tries
        {
            debug!(
                "{} failed {} times; excluding its hops from the next plan",
                self.topo.agg(agg).urn,
                self.topo.agg(agg).allocate_tries
            );
            for hid in self.topo.hops_of(agg) {
                self.topo.hop_mut(hid).exclude_from_plan = true;
            }
        }
    }

    /// Tear down everything reserved so far, re-expand the plan with the
    /// accumulated exclusion and unavailability hints, and rebuild the
    /// run state over the fresh plan.
    fn escalate_to_pce(&mut self) -> Result<(), StitchError> {
        if self.pce_calls >= self.cfg.max_pce_calls {
            error!(
                "Plan expansion budget ({}) exhausted",
                self.cfg.max_pce_calls
            );
            return Err(StitchError::PceBudgetExhausted(self.pce_calls));
        }
        self.pce_calls += 1;
        info!(
            "Going back to the plan expander (call {}/{})",
            self.pce_calls, self.cfg.max_pce_calls
        );

        // tear down the partial reservations; completed segments stay
        // up. A delete can ripple a completed dependent back to
        // needs-redo, so sweep until nothing is left to tear down.
        loop {
            let mut deleted = false;
            for a in self.topo.agg_ids() {
                if self.topo.agg(a).state != AggState::Completed && self.topo.agg(a).had_manifest {
                    self.topo
                        .delete_reservation(a, &mut self.provider, &self.cfg);
                    deleted = true;
                }
            }
            if !deleted {
                break;
            }
        }

        let carried = self.topo.carried_state();
        debug!(
            "Expander hints: {} excluded interface(s), {} unavailability set(s)",
            carried.excluded.len(),
            carried.unavailable.len()
        );
        let expanded = self.expander.expand(
            &self.original_request,
            &carried.excluded,
            &carried.unavailable,
        )?;
        let mut topo = Topology::from_plan(&expanded)?;
        topo.apply_carried_state(&carried);
        for a in topo.agg_ids() {
            topo.agg_mut(a).reset_for_new_round();
        }
        // completed segments survive the replan when the new plan keeps
        // them intact; anything reshaped or routed around is stale now
        let stale = topo.restore_completed(&self.topo);
        for urn in stale {
            if let Some(a) = self.topo.find_aggregate(&urn) {
                self.topo
                    .delete_reservation(a, &mut self.provider, &self.cfg);
            }
        }
        self.topo = topo;
        self.plan = expanded.request;
        Ok(())
    }

    fn report(&self) -> StitchReport {
        let aggregates = self
            .topo
            .agg_ids()
            .into_iter()
            .map(|a| {
                let agg = self.topo.agg(a);
                let hops = agg
                    .hops()
                    .iter()
                    .map(|hid| {
                        let hop = self.topo.hop(*hid);
                        HopReport {
                            path: self.topo.path(hop.path()).name.clone(),
                            urn: hop.urn.clone(),
                            tag: hop
                                .manifest_suggested
                                .as_ref()
                                .and_then(|m| m.single_tag()),
                            circuit_id: hop.global_id.clone(),
                        }
                    })
                    .collect();
                AggReport {
                    urn: agg.urn.clone(),
                    url: agg.url.clone(),
                    state: agg.state,
                    hops,
                    provider_log_url: agg.provider_log_url.clone(),
                }
            })
            .collect();
        StitchReport {
            pce_calls: self.pce_calls,
            total_allocations: self.total_allocations,
            aggregates,
        }
    }
}
