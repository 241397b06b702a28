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

//! # Aggregates and the allocation workhorse
//!
//! An aggregate is the unit of reservation: it owns the hops a provider
//! is responsible for, carries the per-aggregate retry counters, and runs
//! the allocate contract — import upstream tags and detect whether an old
//! reservation must be redone, sanity-check the request, fire the RPC
//! with busy-retry, ingest and validate the manifest, and wait for
//! delayed-commit providers to report ready.

use super::{AggId, HopId, PathId, Topology};
use crate::classify::{Classifier, ErrorClass};
use crate::error::StitchError;
use crate::family::ProviderFamily;
use crate::provider::{
    AggregatePlan, HopManifest, HopTagRequest, ManifestDoc, PlanDoc, ProviderClient,
    ProviderError, RspecCodec, SliverState,
};
use crate::scheduler::SchedulerConfig;
use crate::vlan::VlanRange;
use log::*;
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

/// Lifecycle state of an aggregate within one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggState {
    /// Waiting for its dependencies to complete.
    Pending,
    /// All dependencies completed; eligible for dispatch.
    Ready,
    /// A reservation attempt is in flight.
    Allocating,
    /// Every owned hop has a validated manifest tag.
    Completed,
    /// The reservation must be deleted and redone (tag renegotiation or
    /// an upstream ripple).
    NeedsRedo,
    /// Terminally failed; the run is over.
    Failed,
}

/// What one allocation attempt produced, beyond hard errors.
#[derive(Debug)]
pub enum AllocationOutcome {
    /// The aggregate reserved successfully and is complete.
    Completed,
    /// A previous reservation is still valid for the current inputs.
    AlreadyDone,
    /// The provider could not honor a tag; negotiate.
    VlanUnavailable {
        /// The operation that failed (for messages).
        op: &'static str,
        /// The provider error, when the failure came from an RPC.
        err: Option<ProviderError>,
        /// The hop known to have failed, when identifiable.
        failed_hop: Option<HopId>,
        /// True when the failure was an empty or placeholder suggested
        /// tag in an otherwise successful manifest.
        suggested_was_null: bool,
    },
    /// The manifest delivered a different single tag than requested.
    SuggestedNotRequest,
    /// Retry this aggregate right away, without a grace sleep.
    RetryImmediately(String),
    /// Unrecognized provider failure: give the plan expander a chance.
    CircuitFailed(String),
}

/// The unit of reservation: a resource provider owning one or more hops.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub(crate) id: AggId,
    /// Canonical URN of this aggregate.
    pub urn: String,
    /// URN synonyms this aggregate is also known under.
    pub urn_syns: Vec<String>,
    /// Provider RPC endpoint.
    pub url: String,
    /// Provider family; corrected on first RPC reply.
    pub family: ProviderFamily,
    /// Provider API version (2 or 3).
    pub api_version: u8,
    /// Owned hops.
    pub(crate) hops: Vec<HopId>,
    /// Paths this aggregate participates in.
    pub(crate) paths: Vec<PathId>,
    /// Aggregates that must complete before this one.
    pub(crate) depends_on: BTreeSet<AggId>,
    /// Aggregates that depend on this one (for the ripple delete).
    pub(crate) dependency_for: BTreeSet<AggId>,
    /// Lifecycle state.
    pub state: AggState,
    /// Reservation attempts since the last plan expansion.
    pub allocate_tries: u32,
    /// Local new-tag picks since the last plan expansion.
    pub local_vlan_tries: u32,
    /// Busy polls consumed by the current attempt.
    pub busy_polls: u32,
    /// The user pinned this aggregate; the expander must not drop it.
    pub user_requested: bool,
    /// Whether an allocation was attempted in the current expansion.
    pub tried_this_round: bool,
    /// Whether this aggregate currently holds a manifest.
    pub(crate) had_manifest: bool,
    /// Provider-side log URL from the last reply, when exposed.
    pub provider_log_url: Option<String>,
    /// Sliver expiration timestamps from the last reply, verbatim.
    pub sliver_expirations: Vec<String>,
}

impl Aggregate {
    pub(crate) fn new(
        id: AggId,
        plan: &AggregatePlan,
        family: ProviderFamily,
        urn_syns: Vec<String>,
    ) -> Self {
        Aggregate {
            id,
            urn: plan.urn.clone(),
            urn_syns,
            url: plan.url.clone(),
            family,
            api_version: plan.api_version,
            hops: Vec::new(),
            paths: Vec::new(),
            depends_on: BTreeSet::new(),
            dependency_for: BTreeSet::new(),
            state: AggState::Pending,
            allocate_tries: 0,
            local_vlan_tries: 0,
            busy_polls: 0,
            user_requested: plan.user_requested,
            tried_this_round: false,
            had_manifest: false,
            provider_log_url: None,
            sliver_expirations: Vec::new(),
        }
    }

    /// Arena id.
    pub fn id(&self) -> AggId {
        self.id
    }

    /// Owned hops.
    pub fn hops(&self) -> &[HopId] {
        &self.hops
    }

    /// Paths this aggregate participates in.
    pub fn paths(&self) -> &[PathId] {
        &self.paths
    }

    /// Aggregates that must complete before this one.
    pub fn depends_on(&self) -> &BTreeSet<AggId> {
        &self.depends_on
    }

    /// Aggregates depending on this one.
    pub fn dependency_for(&self) -> &BTreeSet<AggId> {
        &self.dependency_for
    }

    /// True for the states the scheduler may dispatch from.
    pub fn is_schedulable(&self) -> bool {
        matches!(self.state, AggState::Pending | AggState::Ready | AggState::NeedsRedo)
    }

    /// Reset the per-expansion counters after a plan-expander escalation.
    pub(crate) fn reset_for_new_round(&mut self) {
        self.state = AggState::Pending;
        self.allocate_tries = 0;
        self.local_vlan_tries = 0;
        self.busy_polls = 0;
        self.tried_this_round = false;
        self.had_manifest = false;
    }

    /// The operation name used for this provider's reserve call.
    pub fn op_name(&self) -> &'static str {
        if self.api_version > 2 {
            "allocate"
        } else {
            "createsliver"
        }
    }
}

fn pause(secs: u64, cfg: &SchedulerConfig) {
    if secs > 0 && !cfg.suppress_waits {
        thread::sleep(Duration::from_secs(secs));
    }
}

impl Topology {
    /// Run one allocation attempt at `agg`.
    ///
    /// This is the main workhorse: it imports upstream tags, deletes a
    /// stale reservation if the inputs changed, builds and persists the
    /// request, fires the RPC with busy-retry, validates the manifest,
    /// and waits for delayed-commit providers. Anything that needs tag
    /// renegotiation is reported through [`AllocationOutcome`]; hard
    /// failures come back as errors.
    pub fn allocate_aggregate<P: ProviderClient, C: RspecCodec>(
        &mut self,
        agg: AggId,
        provider: &mut P,
        codec: &C,
        classifier: &Classifier,
        cfg: &SchedulerConfig,
        plan: &PlanDoc,
        pce_calls: u32,
    ) -> Result<AllocationOutcome, StitchError> {
        if self.agg(agg).state == AggState::Completed {
            warn!("Allocate called on already completed {}", self.agg(agg).urn);
            return Ok(AllocationOutcome::AlreadyDone);
        }
        if !self.deps_complete(agg) {
            return Err(StitchError::InternalInconsistent(format!(
                "allocate called on {} although dependencies are not completed",
                self.agg(agg).urn
            )));
        }
        self.agg_mut(agg).state = AggState::Allocating;
        self.agg_mut(agg).tried_this_round = true;
        self.agg_mut(agg).busy_polls = 0;

        // Import VLANs, noting if an old reservation must be deleted first
        let (must_delete, already_done) = self.copy_vlans_and_detect_redo(agg)?;

        if must_delete {
            info!("Must delete previous reservation at {}", self.agg(agg).urn);
            self.delete_reservation(agg, provider, cfg);
            let grace = self.agg(agg).family.traits().grace_secs;
            info!("Pausing {}s to let {} free resources", grace, self.agg(agg).urn);
            pause(grace, cfg);
        } else if already_done {
            // an upstream redo worked its way down to here, but the prior
            // reservation still fits the new inputs
            info!("{} already has a matching reservation, not redoing", self.agg(agg).urn);
            self.complete_aggregate(agg);
            return Ok(AllocationOutcome::AlreadyDone);
        }

        self.check_request_sanity(agg)?;

        let op = self.agg(agg).op_name();
        self.agg_mut(agg).allocate_tries += 1;
        if self.agg(agg).allocate_tries == cfg.max_allocate_tries {
            warn!(
                "Allocating at {} for the {}th time",
                self.agg(agg).urn,
                self.agg(agg).allocate_tries
            );
        }

        let request = codec.splice(plan, &self.tag_requests(agg))?;
        self.persist_request(agg, cfg, &request, pce_calls)?;

        let reply = match self.reserve_rpc(agg, provider, classifier, cfg, &request, op)? {
            RpcResult::Reply(reply) => reply,
            RpcResult::Outcome(outcome) => return Ok(outcome),
        };

        if let Some(am_type) = reply.am_type.as_deref() {
            self.correct_family(agg, am_type);
        }
        self.agg_mut(agg).provider_log_url = reply.provider_log_url.clone();
        self.agg_mut(agg).sliver_expirations = reply.sliver_expirations.clone();

        // Delayed-commit providers only really succeed once status says so
        let manifest = if self.agg(agg).family.traits().needs_ready_poll {
            match self.wait_for_ready(agg, provider, classifier, cfg)? {
                DcnPoll::Ready(doc) => doc,
                DcnPoll::VlanFailure { failed_hop, message } => {
                    self.delete_reservation(agg, provider, cfg);
                    self.agg_mut(agg).state = AggState::NeedsRedo;
                    return Ok(AllocationOutcome::VlanUnavailable {
                        op,
                        err: Some(ProviderError::new(
                            crate::classify::VLAN_UNAVAILABLE_CODE,
                            message,
                        )),
                        failed_hop,
                        suggested_was_null: false,
                    });
                }
            }
        } else {
            reply.manifest
        };

        self.agg_mut(agg).had_manifest = true;
        match self.ingest_manifest(agg, codec, &manifest)? {
            IngestResult::Clean => {
                info!("... allocation at {} complete", self.agg(agg).urn);
                self.complete_aggregate(agg);
                Ok(AllocationOutcome::Completed)
            }
            IngestResult::SuggestedNotRequest => {
                self.agg_mut(agg).state = AggState::NeedsRedo;
                Ok(AllocationOutcome::SuggestedNotRequest)
            }
            IngestResult::SuggestedNull { failed_hop, message } => {
                error!("{}", message);
                self.delete_reservation(agg, provider, cfg);
                self.agg_mut(agg).state = AggState::NeedsRedo;
                Ok(AllocationOutcome::VlanUnavailable {
                    op,
                    err: None,
                    failed_hop: Some(failed_hop),
                    suggested_was_null: true,
                })
            }
        }
    }

    /// Mark `agg` complete and push its dependents back to pending so the
    /// scheduler re-evaluates them (a no-op unless their input changed).
    fn complete_aggregate(&mut self, agg: AggId) {
        self.agg_mut(agg).state = AggState::Completed;
        for dep in self.dependents(agg) {
            if self.agg(dep).state == AggState::Completed {
                self.agg_mut(dep).state = AggState::Pending;
            }
        }
    }

    /// Copy upstream manifest tags into this aggregate's hops and detect
    /// whether a previous reservation must be redone.
    ///
    /// Returns `(must_delete, already_done)`: whether an old reservation
    /// must be deleted first, and whether the old reservation still
    /// satisfies the new inputs so no RPC is needed. Both range and
    /// suggested divergence count as redo when the prior manifest no
    /// longer fits the new inputs.
    pub(crate) fn copy_vlans_and_detect_redo(
        &mut self,
        agg: AggId,
    ) -> Result<(bool, bool), StitchError> {
        let had_prev_manifest = self.agg(agg).had_manifest;
        let mut must_delete = false;
        let mut already_done = had_prev_manifest;

        for hid in self.hops_of(agg) {
            if !self.hop(hid).import_vlans {
                if self.hop(hid).manifest_suggested.is_none() {
                    already_done = false;
                }
                continue;
            }

            let (new_suggested, new_range) = self.resolve_import(hid)?;
            let hop_urn = self.hop(hid).urn.clone();

            // suggested tag: did the upstream pick change under us?
            let prior_manifest_sug = self.hop(hid).manifest_suggested.clone();
            match &prior_manifest_sug {
                Some(manifest_sug) => {
                    if !had_prev_manifest {
                        return Err(StitchError::InternalInconsistent(format!(
                            "{} had no previous manifest, but its hop {} did",
                            self.agg(agg).urn,
                            hop_urn
                        )));
                    }
                    if self.hop(hid).requested_suggested != new_suggested {
                        if *manifest_sug == new_suggested {
                            info!(
                                "{} request changed to {} but prior manifest already is that tag; keeping",
                                hop_urn, new_suggested
                            );
                        } else {
                            info!(
                                "Redo {}: hop {} had manifest {} but new request is {}",
                                self.agg(agg).urn,
                                hop_urn,
                                manifest_sug,
                                new_suggested
                            );
                            must_delete = true;
                            already_done = false;
                        }
                        self.hop_mut(hid).requested_suggested = new_suggested.clone();
                    }
                }
                None => {
                    already_done = false;
                    if had_prev_manifest {
                        return Err(StitchError::InternalInconsistent(format!(
                            "{} had a previous manifest but hop {} did not",
                            self.agg(agg).urn,
                            hop_urn
                        )));
                    }
                    if self.hop(hid).requested_suggested != new_suggested {
                        debug!("{} changing suggested to {}", hop_urn, new_suggested);
                        self.hop_mut(hid).requested_suggested = new_suggested.clone();
                    }
                }
            }

            // availability range: does the prior pick still fit?
            let prior_manifest_range = self.hop(hid).manifest_range.clone();
            if prior_manifest_range.is_some() {
                if self.hop(hid).requested_range != new_range {
                    let prior_sug_fits = match &self.hop(hid).manifest_suggested {
                        Some(sug) => new_range.contains(sug),
                        None => false,
                    };
                    if !prior_sug_fits {
                        warn!(
                            "{} new available range {} precludes the prior manifest tag; redoing",
                            hop_urn, new_range
                        );
                        must_delete = true;
                        already_done = false;
                    } else {
                        info!(
                            "{} prior manifest tag still fits new range {}; keeping",
                            hop_urn, new_range
                        );
                    }
                    self.hop_mut(hid).requested_range = new_range;
                }
            } else {
                already_done = false;
                if self.hop(hid).requested_range != new_range {
                    debug!("{} changing available range to {}", hop_urn, new_range);
                    self.hop_mut(hid).requested_range = new_range;
                }
            }
        }

        if must_delete {
            already_done = false;
        }
        Ok((must_delete, already_done))
    }

    /// Check that every owned hop asks for something sane before an RPC.
    fn check_request_sanity(&self, agg: AggId) -> Result<(), StitchError> {
        let a = self.agg(agg);
        for hid in &a.hops {
            let hop = self.hop(*hid);
            if !hop.requested_suggested.is_any()
                && !hop.requested_range.contains(&hop.requested_suggested)
            {
                return Err(StitchError::InternalInconsistent(format!(
                    "{} hop {} suggested {} not in available range {}",
                    a.urn, hop.urn, hop.requested_suggested, hop.requested_range
                )));
            }
        }
        for (i, a_id) in a.hops.iter().enumerate() {
            for b_id in a.hops.iter().skip(i + 1) {
                let (ha, hb) = (self.hop(*a_id), self.hop(*b_id));
                let both_concrete =
                    !ha.requested_suggested.is_any() && !hb.requested_suggested.is_any();
                if ha.urn == hb.urn
                    && both_concrete
                    && ha.requested_suggested == hb.requested_suggested
                {
                    return Err(StitchError::InternalInconsistent(format!(
                        "{}: hops on interface {} request the same tag {} on two paths",
                        a.urn, ha.urn, ha.requested_suggested
                    )));
                }
                if a.family == ProviderFamily::Pg
                    && ha.path != hb.path
                    && both_concrete
                    && ha.requested_suggested == hb.requested_suggested
                {
                    return Err(StitchError::InternalInconsistent(format!(
                        "{} (ProtoGENI): two paths request the same tag {}",
                        a.urn, ha.requested_suggested
                    )));
                }
            }
        }
        Ok(())
    }

    /// The tag state of every owned hop, for splicing into the request.
    pub fn tag_requests(&self, agg: AggId) -> Vec<HopTagRequest> {
        self.agg(agg)
            .hops
            .iter()
            .map(|hid| {
                let hop = self.hop(*hid);
                HopTagRequest {
                    path_id: self.path(hop.path).name.clone(),
                    hop_id: hop.hop_id.clone(),
                    urn: hop.urn.clone(),
                    suggested: hop.requested_suggested.clone(),
                    range: hop.requested_range.clone(),
                }
            })
            .collect()
    }

    /// Write the request document under the artifact directory as
    /// `<op>-request-<pceCalls><allocateTries>.xml`.
    fn persist_request(
        &self,
        agg: AggId,
        cfg: &SchedulerConfig,
        request: &crate::provider::RequestDoc,
        pce_calls: u32,
    ) -> Result<(), StitchError> {
        if let Some(dir) = &cfg.artifact_dir {
            let a = self.agg(agg);
            let fname = format!(
                "{}-request-{}{}.xml",
                a.op_name(),
                pce_calls,
                a.allocate_tries
            );
            let path = dir.join(&fname);
            std::fs::write(&path, request.0.as_bytes())?;
            debug!("Saved {} request to {}", a.urn, path.display());
        }
        Ok(())
    }

    /// Fire the reserve RPC with the busy-retry policy, classifying
    /// errors into outcomes or hard failures.
    fn reserve_rpc<P: ProviderClient>(
        &mut self,
        agg: AggId,
        provider: &mut P,
        classifier: &Classifier,
        cfg: &SchedulerConfig,
        request: &crate::provider::RequestDoc,
        op: &'static str,
    ) -> Result<RpcResult, StitchError> {
        let url = self.agg(agg).url.clone();
        let api = self.agg(agg).api_version;
        info!("Doing {} at {}...", op, self.agg(agg).urn);
        loop {
            match provider.allocate(&url, api, &cfg.slice_name, request) {
                Ok(reply) => return Ok(RpcResult::Reply(reply)),
                Err(err) => {
                    if let Some(am_type) = err.am_type.as_deref() {
                        self.correct_family(agg, am_type);
                    }
                    let family = self.agg(agg).family;
                    let tries = self.agg(agg).allocate_tries;
                    match classifier.classify(&err, family, tries) {
                        ErrorClass::Busy => {
                            self.agg_mut(agg).busy_polls += 1;
                            let polls = self.agg(agg).busy_polls;
                            if polls >= cfg.busy_max_polls {
                                self.agg_mut(agg).busy_polls = 0;
                                return Err(StitchError::Transient(format!(
                                    "{} still busy after {} polls",
                                    self.agg(agg).urn,
                                    polls
                                )));
                            }
                            info!("{} is busy, polling again shortly", self.agg(agg).urn);
                            pause(cfg.busy_poll_secs, cfg);
                        }
                        ErrorClass::VlanUnavailable => {
                            info!(
                                "A requested VLAN was unavailable doing {} at {}",
                                op,
                                self.agg(agg).urn
                            );
                            self.cleanup_on_error(agg, provider, cfg);
                            self.agg_mut(agg).state = AggState::NeedsRedo;
                            return Ok(RpcResult::Outcome(AllocationOutcome::VlanUnavailable {
                                op,
                                err: Some(err),
                                failed_hop: None,
                                suggested_was_null: false,
                            }));
                        }
                        ErrorClass::Transient => {
                            self.cleanup_on_error(agg, provider, cfg);
                            return Err(StitchError::Transient(err.to_string()));
                        }
                        ErrorClass::RetryImmediately(msg) => {
                            self.cleanup_on_error(agg, provider, cfg);
                            self.agg_mut(agg).state = AggState::NeedsRedo;
                            return Ok(RpcResult::Outcome(AllocationOutcome::RetryImmediately(
                                msg,
                            )));
                        }
                        ErrorClass::Fatal(msg) => {
                            self.cleanup_on_error(agg, provider, cfg);
                            return Err(StitchError::FatalPlan(msg));
                        }
                        ErrorClass::Escalate(msg) => {
                            self.cleanup_on_error(agg, provider, cfg);
                            self.agg_mut(agg).state = AggState::NeedsRedo;
                            return Ok(RpcResult::Outcome(AllocationOutcome::CircuitFailed(msg)));
                        }
                    }
                }
            }
        }
    }

    /// ExoGENI leaves a half-made reservation behind on a failed
    /// allocate; clean it up so a retry starts from nothing.
    fn cleanup_on_error<P: ProviderClient>(
        &mut self,
        agg: AggId,
        provider: &mut P,
        cfg: &SchedulerConfig,
    ) {
        if self.agg(agg).family == ProviderFamily::Eg {
            let url = self.agg(agg).url.clone();
            let api = self.agg(agg).api_version;
            if let Err(e) = provider.delete(&url, api, &cfg.slice_name) {
                warn!("Failed to delete failed reservation at {}: {}", self.agg(agg).urn, e);
            }
        }
    }

    /// Correct the URN-derived family guess from the provider's own
    /// family tag.
    fn correct_family(&mut self, agg: AggId, am_type: &str) {
        if let Some(family) = ProviderFamily::from_am_type(am_type) {
            if family != self.agg(agg).family {
                debug!(
                    "{} family corrected from {:?} to {:?} (am_type {})",
                    self.agg(agg).urn,
                    self.agg(agg).family,
                    family,
                    am_type
                );
                self.agg_mut(agg).family = family;
            }
        }
    }

    /// Parse and validate the delivered tags for every owned hop.
    fn ingest_manifest<C: RspecCodec>(
        &mut self,
        agg: AggId,
        codec: &C,
        manifest: &ManifestDoc,
    ) -> Result<IngestResult, StitchError> {
        let family = self.agg(agg).family;
        let mut suggested_not_request = false;

        for hid in self.hops_of(agg) {
            let (path_name, hop_id, hop_urn) = {
                let hop = self.hop(hid);
                (
                    self.path(hop.path).name.clone(),
                    hop.hop_id.clone(),
                    hop.urn.clone(),
                )
            };
            let parsed = codec.parse_manifest(manifest, &path_name, &hop_id, &hop_urn, family)?;
            let entry = match parsed {
                Some(entry) => entry,
                None if family == ProviderFamily::Eg => {
                    // aggregate-internal extension hops are absent from
                    // ExoGENI manifests; echo the request so downstream
                    // imports keep working
                    debug!(
                        "{} not in ExoGENI manifest, synthesizing echo entry",
                        hop_urn
                    );
                    HopManifest {
                        suggested: self.hop(hid).requested_suggested.clone(),
                        range: VlanRange::parse("2-4094")?,
                        global_id: None,
                    }
                }
                None => {
                    return Err(StitchError::ManifestInconsistent(format!(
                        "{} manifest has no entry for hop {} on path {}",
                        self.agg(agg).urn,
                        hop_urn,
                        path_name
                    )))
                }
            };

            if entry.suggested.is_any() || entry.suggested.is_empty() {
                return Ok(IngestResult::SuggestedNull {
                    failed_hop: hid,
                    message: format!(
                        "{} manifest suggested tag for {} is empty or a placeholder",
                        self.agg(agg).urn,
                        hop_urn
                    ),
                });
            }
            let tag = match entry.suggested.single_tag() {
                Some(tag) => tag,
                None => {
                    return Err(StitchError::ManifestInconsistent(format!(
                        "{} manifest for {} carries a tag set {} instead of a single tag",
                        self.agg(agg).urn,
                        hop_urn,
                        entry.suggested
                    )))
                }
            };
            if entry.range.is_empty() {
                return Err(StitchError::ManifestInconsistent(format!(
                    "{} manifest for {} carries an empty availability range",
                    self.agg(agg).urn,
                    hop_urn
                )));
            }
            if self.hop(hid).unavailable.contains_tag(tag) {
                return Err(StitchError::ManifestInconsistent(format!(
                    "{} assigned tag {} to {} which was explicitly marked unavailable",
                    self.agg(agg).urn,
                    tag,
                    hop_urn
                )));
            }

            if let Some(gid) = &entry.global_id {
                let hop = self.hop_mut(hid);
                if let Some(old) = &hop.global_id {
                    if old != gid {
                        warn!("Changing hop {} global id from {} to {}", hop_urn, old, gid);
                    }
                }
                hop.global_id = Some(gid.clone());
            }

            debug!(
                "Hop {} manifest suggested {}, range {}",
                hop_urn, entry.suggested, entry.range
            );
            {
                let hop = self.hop_mut(hid);
                hop.manifest_suggested = Some(entry.suggested.clone());
                hop.manifest_range = Some(entry.range.clone());
            }

            let requested = self.hop(hid).requested_suggested.clone();
            if !requested.is_any() && entry.suggested != requested {
                error!(
                    "{} gave tag {} for {} which is not the requested {}",
                    self.agg(agg).urn,
                    entry.suggested,
                    hop_urn,
                    requested
                );
                suggested_not_request = true;
            } else if requested.is_any() && !self.hop(hid).requested_range.contains_tag(tag) {
                return Err(StitchError::ManifestInconsistent(format!(
                    "{} picked tag {} for {} outside the offered range {}",
                    self.agg(agg).urn,
                    tag,
                    hop_urn,
                    self.hop(hid).requested_range
                )));
            }
        }

        // one interface must not end up with the same tag on two paths
        let hops = self.hops_of(agg);
        for (i, a) in hops.iter().enumerate() {
            for b in hops.iter().skip(i + 1) {
                let (ha, hb) = (self.hop(*a), self.hop(*b));
                if ha.urn == hb.urn
                    && ha.path != hb.path
                    && ha.manifest_suggested.is_some()
                    && ha.manifest_suggested == hb.manifest_suggested
                {
                    return Err(StitchError::ManifestInconsistent(format!(
                        "{} manifest assigned the same tag to interface {} on two paths",
                        self.agg(agg).urn,
                        ha.urn
                    )));
                }
            }
        }

        if suggested_not_request {
            Ok(IngestResult::SuggestedNotRequest)
        } else {
            Ok(IngestResult::Clean)
        }
    }

    /// Poll a delayed-commit provider until the circuit is ready, then
    /// fetch the authoritative manifest.
    fn wait_for_ready<P: ProviderClient>(
        &mut self,
        agg: AggId,
        provider: &mut P,
        classifier: &Classifier,
        cfg: &SchedulerConfig,
    ) -> Result<DcnPoll, StitchError> {
        let url = self.agg(agg).url.clone();
        let api = self.agg(agg).api_version;
        info!("{}: waiting for status ready...", self.agg(agg).urn);

        for poll in 1..=cfg.status_max_polls {
            pause(cfg.status_poll_secs, cfg);
            let reply = provider
                .status(&url, api, &cfg.slice_name)
                .map_err(|e| {
                    StitchError::FatalPlan(format!(
                        "status poll failed at {}: {}",
                        self.agg(agg).urn,
                        e
                    ))
                })?;

            for sliver in &reply.slivers {
                if let Some(circuit) = classifier.parse_circuit_id(&sliver.urn) {
                    self.record_circuit_id(agg, &circuit);
                }
                if sliver.state == SliverState::Failed {
                    let msg = sliver.error.clone().unwrap_or_else(|| {
                        format!("sliver {} failed without a message", sliver.urn)
                    });
                    if classifier.is_dcn_vlan_failure(&msg) {
                        let failed_hop = classifier
                            .parse_dcn_failed_link(&msg)
                            .and_then(|link| self.find_path_by_name(&link))
                            .and_then(|path| {
                                self.hops_of(agg)
                                    .into_iter()
                                    .find(|h| self.hop(*h).path == path)
                            });
                        return Ok(DcnPoll::VlanFailure {
                            failed_hop,
                            message: msg,
                        });
                    }
                    return Err(StitchError::FatalPlan(format!(
                        "circuit failed at {}: {}",
                        self.agg(agg).urn,
                        msg
                    )));
                }
            }

            match reply.overall {
                SliverState::Ready => {
                    let doc = provider
                        .describe(&url, api, &cfg.slice_name)
                        .map_err(|e| {
                            StitchError::FatalPlan(format!(
                                "describe failed at {} after ready: {}",
                                self.agg(agg).urn,
                                e
                            ))
                        })?;
                    return Ok(DcnPoll::Ready(doc));
                }
                SliverState::Failed => {
                    return Err(StitchError::FatalPlan(format!(
                        "circuit failed at {} without a sliver message",
                        self.agg(agg).urn
                    )))
                }
                _ => {
                    info!(
                        "{} not ready yet (poll {}/{}): {}",
                        self.agg(agg).urn,
                        poll,
                        cfg.status_max_polls,
                        reply.overall
                    );
                }
            }
        }
        Err(StitchError::FatalPlan(format!(
            "{} never reported ready after {} polls",
            self.agg(agg).urn,
            cfg.status_max_polls
        )))
    }

    /// Note a provider-assigned circuit id on the aggregate's hops that
    /// don't have one yet.
    fn record_circuit_id(&mut self, agg: AggId, circuit: &str) {
        for hid in self.hops_of(agg) {
            let hop = self.hop_mut(hid);
            if hop.global_id.is_none() {
                hop.global_id = Some(circuit.to_string());
            }
        }
    }

    /// Delete any reservation at `agg` and ripple the invalidation to
    /// every aggregate whose input may have depended on it. Deletion is
    /// idempotent at the provider, so failures are logged and ignored.
    pub fn delete_reservation<P: ProviderClient>(
        &mut self,
        agg: AggId,
        provider: &mut P,
        cfg: &SchedulerConfig,
    ) {
        let url = self.agg(agg).url.clone();
        let api = self.agg(agg).api_version;
        info!("Deleting reservation at {}", self.agg(agg).urn);
        if let Err(e) = provider.delete(&url, api, &cfg.slice_name) {
            warn!("Delete at {} reported: {}", self.agg(agg).urn, e);
        }
        self.agg_mut(agg).had_manifest = false;
        for hid in self.hops_of(agg) {
            self.hop_mut(hid).clear_manifest();
        }
        for dep in self.dependents_closure(agg) {
            if self.agg(dep).state == AggState::Completed {
                debug!(
                    "Ripple: {} must be redone because {} was deleted",
                    self.agg(dep).urn,
                    self.agg(agg).urn
                );
                self.agg_mut(dep).state = AggState::NeedsRedo;
            }
        }
    }
}

enum RpcResult {
    Reply(crate::provider::AllocateReply),
    Outcome(AllocationOutcome),
}

enum DcnPoll {
    Ready(ManifestDoc),
    VlanFailure {
        failed_hop: Option<HopId>,
        message: String,
    },
}

enum IngestResult {
    Clean,
    SuggestedNotRequest,
    SuggestedNull { failed_hop: HopId, message: String },
}
