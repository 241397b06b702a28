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

//! # VLAN negotiation
//!
//! When a provider reports a tag unavailable, or delivers a different tag
//! than requested, this module decides how to recover: pick new tags
//! locally at the failed aggregate, redo the upstream aggregate whose
//! free choice turned out not to work, or give up and send the run back
//! to the plan expander.
//!
//! The decision procedure mirrors the allocation failure handling of the
//! reservation workhorse: identify which hops actually failed (provider
//! messages often name the path and tag), grow their unavailability sets,
//! try the cheap recoveries first, and only escalate when the topology is
//! too entangled for a local fix.

use crate::classify::Classifier;
use crate::error::StitchError;
use crate::provider::{ProviderClient, ProviderError};
use crate::scheduler::SchedulerConfig;
use crate::topology::{AggId, AggState, HopId, Topology};
use crate::vlan::VlanRange;
use itertools::Itertools;
use log::*;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, BTreeSet};

/// How the scheduler should continue after a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// New tags were picked locally; requeue the same aggregate.
    RetryHere,
    /// An upstream aggregate was redone; requeue it immediately and let
    /// the ripple re-run everything below it. No plan-expander call.
    RetryFromRoot(AggId),
    /// Local recovery is not possible; re-expand the plan.
    EscalateToPce,
}

/// The negotiation engine, borrowed over the state of one recovery.
pub struct VlanNegotiator<'a, P: ProviderClient> {
    topo: &'a mut Topology,
    provider: &'a mut P,
    classifier: &'a Classifier,
    cfg: &'a SchedulerConfig,
    rng: &'a mut StdRng,
}

impl<'a, P: ProviderClient> VlanNegotiator<'a, P> {
    /// Borrow the run state for one negotiation.
    pub fn new(
        topo: &'a mut Topology,
        provider: &'a mut P,
        classifier: &'a Classifier,
        cfg: &'a SchedulerConfig,
        rng: &'a mut StdRng,
    ) -> Self {
        VlanNegotiator {
            topo,
            provider,
            classifier,
            cfg,
            rng,
        }
    }

    /// Recover from a provider that could not honor a VLAN tag.
    ///
    /// `failed_hop` is the hop known to have failed when the caller could
    /// identify one; `suggested_was_null` marks the manifest-side variant
    /// where the provider "succeeded" but delivered no usable tag.
    pub fn handle_vlan_unavailable(
        &mut self,
        agg: AggId,
        op: &str,
        err: Option<&ProviderError>,
        failed_hop: Option<HopId>,
        suggested_was_null: bool,
    ) -> Result<NegotiationOutcome, StitchError> {
        let err_msg = err
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("no suggested tag delivered doing {}", op));

        let failed_hop = self.identify_failed_hop(agg, err, failed_hop);
        let failed_hops = self.expand_failed_set(agg, failed_hop);
        debug!(
            "{}: treating [{}] as failed doing {}",
            self.topo.agg(agg).urn,
            failed_hops
                .iter()
                .map(|h| self.topo.hop(*h).urn.as_str())
                .join(", "),
            op
        );

        // Cheap recovery: a lone translating importer whose chain began
        // with a free provider choice. Redo the chain root with the bad
        // tag excluded, no expander involved.
        if failed_hops.len() == 1 {
            if let Some(outcome) = self.try_upstream_any_fast_path(agg, failed_hops[0])? {
                return Ok(outcome);
            }
        }

        self.mark_failed_tags_unavailable(agg, &failed_hops);

        let verdict =
            self.local_retry_feasible(agg, err, failed_hop, &failed_hops, suggested_was_null);
        match verdict {
            Feasibility::Yes => {}
            Feasibility::No(reason) => {
                info!(
                    "{} cannot locally pick new tags: {}",
                    self.topo.agg(agg).urn,
                    reason
                );
                return self.escalate(agg, &format!("{} ({})", reason, err_msg), false);
            }
            Feasibility::Exhausted(reason) => {
                warn!(
                    "{} has no tags left to try: {}",
                    self.topo.agg(agg).urn,
                    reason
                );
                return self.escalate(agg, &format!("{} ({})", reason, err_msg), true);
            }
        }

        match self.reselect_tags(agg, &failed_hops)? {
            true => {
                let tries = {
                    let a = self.topo.agg_mut(agg);
                    a.local_vlan_tries += 1;
                    a.state = AggState::Pending;
                    a.local_vlan_tries
                };
                info!(
                    "VLAN was unavailable; retrying {} (local pick {}) with new tags",
                    self.topo.agg(agg).urn,
                    tries
                );
                Ok(NegotiationOutcome::RetryHere)
            }
            false => self.escalate(
                agg,
                &format!("not enough available VLAN tags to retry locally ({})", err_msg),
                true,
            ),
        }
    }

    /// Recover from a provider that delivered a different single tag than
    /// the one requested. Walk the import chain up to the aggregate that
    /// chose freely, seed it with the delivered tag, and redo from there.
    pub fn handle_suggested_not_request(
        &mut self,
        agg: AggId,
    ) -> Result<NegotiationOutcome, StitchError> {
        // note what we tried that was not honored
        let mut mismatched: Vec<(HopId, u16, VlanRange)> = Vec::new();
        for hid in self.topo.hops_of(agg) {
            let hop = self.topo.hop(hid);
            let delivered = match hop.manifest_suggested.as_ref().and_then(|m| m.single_tag()) {
                Some(tag) => tag,
                None => continue,
            };
            let requested = hop.requested_suggested.clone();
            if !requested.is_any() && !requested.contains_tag(delivered) {
                mismatched.push((hid, delivered, requested));
            }
        }
        for (hid, delivered, requested) in &mismatched {
            debug!(
                "{} adding rejected request {} to unavailable",
                self.topo.hop(*hid).urn,
                requested
            );
            let hop = self.topo.hop_mut(*hid);
            hop.mark_unavailable(requested);
            // the hop will have to carry what the provider delivered
            let deliver_range = VlanRange::single(*delivered);
            hop.requested_range.absorb(&deliver_range);
            hop.requested_suggested = deliver_range;
        }

        for (hid, delivered, requested) in &mismatched {
            let chain = self.topo.import_chain(*hid);
            for ancestor in chain.iter().skip(1) {
                if !self.topo.hop(*ancestor).requested_suggested.is_any() {
                    continue;
                }
                // this ancestor chose the tag that was just rejected
                let ancestor_agg = self.topo.hop(*ancestor).aggregate();
                info!(
                    "{} picked a tag {} that {} would not honor; redoing it with the delivered {}",
                    self.topo.agg(ancestor_agg).urn,
                    requested,
                    self.topo.agg(agg).urn,
                    delivered
                );
                self.topo.delete_reservation(agg, self.provider, self.cfg);
                self.topo
                    .delete_reservation(ancestor_agg, self.provider, self.cfg);

                let deliver_range = VlanRange::single(*delivered);
                {
                    let hop = self.topo.hop_mut(*ancestor);
                    hop.requested_range.remove(requested);
                    // the delivered tag is provider guidance: make sure the
                    // seeded request can actually carry it
                    hop.requested_range.absorb(&deliver_range);
                    hop.requested_suggested = deliver_range;
                }
                self.topo.agg_mut(ancestor_agg).state = AggState::Pending;
                self.topo.agg_mut(agg).state = AggState::Pending;
                return Ok(NegotiationOutcome::RetryFromRoot(ancestor_agg));
            }
        }

        // nobody upstream chose freely; replanning is all that is left
        self.topo.delete_reservation(agg, self.provider, self.cfg);
        self.topo.agg_mut(agg).state = AggState::Pending;
        self.escalate(
            agg,
            "provider delivered a tag that was not requested and no upstream choice can be redone",
            false,
        )
    }

    /// Pick the representative failed hop: the caller's, the only hop, or
    /// one parsed from the provider's error message.
    fn identify_failed_hop(
        &mut self,
        agg: AggId,
        err: Option<&ProviderError>,
        failed_hop: Option<HopId>,
    ) -> Option<HopId> {
        if failed_hop.is_some() {
            return failed_hop;
        }
        let hops = self.topo.hops_of(agg);
        if hops.len() == 1 {
            return Some(hops[0]);
        }
        let err = err?;
        let detail = self.classifier.parse_failure_detail(err);
        let path_name = detail.failed_path.as_deref()?;
        let path = self.topo.find_path_by_name(path_name)?;

        let mut no_xlate_candidates: Vec<HopId> = Vec::new();
        for hid in hops {
            let on_path = self.topo.hop(hid).path() == path;
            if !on_path {
                continue;
            }
            if let Some(tag) = detail.failed_tag {
                if !self.topo.hop(hid).requested_suggested.contains_tag(tag) {
                    debug!(
                        "{} is on reported failed path {} but did not request tag {}",
                        self.topo.hop(hid).urn,
                        path_name,
                        tag
                    );
                    continue;
                }
                self.topo
                    .hop_mut(hid)
                    .mark_unavailable(&VlanRange::single(tag));
            }
            if !self.topo.hop(hid).xlates {
                no_xlate_candidates.push(hid);
            }
        }
        let picked = no_xlate_candidates.first().copied();
        if let Some(h) = picked {
            debug!(
                "Provider message names path {}; treating {} as the failed hop",
                path_name,
                self.topo.hop(h).urn
            );
        }
        picked
    }

    /// The failed hop plus everything on its path forced to share its tag;
    /// all owned hops when no single hop could be identified.
    fn expand_failed_set(&self, agg: AggId, failed_hop: Option<HopId>) -> Vec<HopId> {
        match failed_hop {
            Some(fh) => {
                let mut set = vec![fh];
                for hid in self.topo.agg(agg).hops() {
                    if *hid != fh && self.topo.hops_share_tag(fh, *hid) {
                        set.push(*hid);
                    }
                }
                set
            }
            None => self.topo.hops_of(agg),
        }
    }

    /// The simple upstream-`Any` case: the lone failed hop translates and
    /// imports, and the chain above it starts at an aggregate that asked
    /// for any tag. Exclude the bad tag at the root, reset the chain's
    /// ranges, delete its reservations, and rerun from the root.
    fn try_upstream_any_fast_path(
        &mut self,
        agg: AggId,
        failed: HopId,
    ) -> Result<Option<NegotiationOutcome>, StitchError> {
        {
            let hop = self.topo.hop(failed);
            if !hop.import_vlans || hop.import_from().is_none() {
                return Ok(None);
            }
        }
        let chain = self.topo.import_chain(failed);
        let root_hop = *chain.last().ok_or_else(|| {
            StitchError::InternalInconsistent("import chain cannot be empty".to_string())
        })?;
        if !self.topo.hop(root_hop).requested_suggested.is_any() {
            debug!(
                "Not the simple upstream-any case: chain root {} did not ask for any",
                self.topo.hop(root_hop).urn
            );
            return Ok(None);
        }

        let failed_tag = self.topo.hop(failed).requested_suggested.clone();
        info!(
            "Quick redo from chain root {}: marking failed tag {} unavailable",
            self.topo.agg(self.topo.hop(root_hop).aggregate()).urn,
            failed_tag
        );
        if !failed_tag.is_any() {
            self.topo.hop_mut(root_hop).mark_unavailable(&failed_tag);
            self.topo.hop_mut(failed).mark_unavailable(&failed_tag);
            // where the chain carries one shared tag (no translation on
            // either side of a link), the failed tag is bad at every hop
            // sharing it
            for pair in chain.windows(2) {
                let (child, parent) = (pair[0], pair[1]);
                if !self.topo.hop(child).xlates || !self.topo.hop(parent).xlates {
                    self.topo.hop_mut(parent).mark_unavailable(&failed_tag);
                    self.topo.hop_mut(child).mark_unavailable(&failed_tag);
                }
            }
        }

        // reset every chain hop's range to what the expander advised,
        // less everything we now know is bad; importers go back to a
        // free request and re-derive their tag from the redone root
        for hid in &chain {
            let hop = self.topo.hop_mut(*hid);
            let mut range = hop.scs_range.clone();
            range.remove(&hop.unavailable);
            hop.requested_range = range;
            if hop.import_vlans {
                hop.requested_suggested = VlanRange::Any;
            }
        }

        // delete every reserved aggregate along the chain, bottom up
        let mut chain_aggs: Vec<AggId> = Vec::new();
        chain_aggs.push(agg);
        for hid in &chain {
            let a = self.topo.hop(*hid).aggregate();
            if !chain_aggs.contains(&a) {
                chain_aggs.push(a);
            }
        }
        info!(
            "Deleting reservations along a {}-aggregate chain to retry around the failed VLAN",
            chain_aggs.len()
        );
        for a in &chain_aggs {
            if self.topo.agg(*a).had_manifest {
                self.topo.delete_reservation(*a, self.provider, self.cfg);
            }
            self.topo.agg_mut(*a).state = AggState::Pending;
        }

        let root_agg = self.topo.hop(root_hop).aggregate();
        Ok(Some(NegotiationOutcome::RetryFromRoot(root_agg)))
    }

    /// Record the failed tags as unavailable on the failed hops and on
    /// every same-interface hop of this aggregate.
    fn mark_failed_tags_unavailable(&mut self, agg: AggId, failed_hops: &[HopId]) {
        for hid in failed_hops {
            let (urn, bad) = {
                let hop = self.topo.hop(*hid);
                let bad = if hop.requested_suggested.is_any() {
                    // the provider was free to choose and still failed:
                    // everything we offered is suspect
                    hop.requested_range.clone()
                } else {
                    hop.requested_suggested.clone()
                };
                (hop.urn.clone(), bad)
            };
            if bad.is_empty() {
                continue;
            }
            self.topo.hop_mut(*hid).mark_unavailable(&bad);
            debug!(
                "{} marked {} unavailable; now {}",
                urn,
                bad,
                self.topo.hop(*hid).unavailable
            );
            for other in self.topo.hops_of(agg) {
                if other != *hid && self.topo.hop(other).urn == urn {
                    self.topo.hop_mut(other).mark_unavailable(&bad);
                }
            }
        }
    }

    /// Decide whether this aggregate may pick new tags locally.
    fn local_retry_feasible(
        &self,
        agg: AggId,
        err: Option<&ProviderError>,
        failed_hop: Option<HopId>,
        failed_hops: &[HopId],
        suggested_was_null: bool,
    ) -> Feasibility {
        let a = self.topo.agg(agg);
        let budget = a.family.traits().local_vlan_budget;
        if a.local_vlan_tries >= budget {
            return Feasibility::No(format!(
                "tried {} times to find a new tag (budget {})",
                a.local_vlan_tries, budget
            ));
        }

        for hid in &a.hops {
            if !failed_hops.contains(hid) {
                continue;
            }
            let hop = self.topo.hop(*hid);
            if hop.import_vlans {
                return Feasibility::No(format!(
                    "hop {} uses a tag picked at another aggregate; this is a negotiation across aggregates",
                    hop.urn
                ));
            }
            if hop.requested_suggested.is_any() {
                return Feasibility::Exhausted(format!(
                    "provider was free to pick any tag from {} for {} and none worked",
                    hop.requested_range, hop.urn
                ));
            }
            if hop.requested_range.len() <= 1 {
                return Feasibility::Exhausted(format!(
                    "hop {} has no alternative tags left (range {}, unavailable {})",
                    hop.urn, hop.requested_range, hop.unavailable
                ));
            }
        }

        // a provider error we cannot positively identify as a tag
        // availability problem is not something to retry blindly
        if !(failed_hop.is_some() && suggested_was_null) {
            match err {
                Some(e) => {
                    if !self.classifier.is_vlan_unavailable(e, a.family) {
                        return Feasibility::No(format!(
                            "provider error does not look like a tag availability problem: {}",
                            e
                        ));
                    }
                }
                None if !suggested_was_null => {
                    return Feasibility::No(
                        "no provider error to classify for a local retry".to_string(),
                    );
                }
                None => {}
            }
        }

        // too many coupled variables: a dependent that others depend on
        for dep in &a.dependency_for {
            let d = self.topo.agg(*dep);
            let imports_from_here = d.hops().iter().any(|h| {
                let hop = self.topo.hop(*h);
                if hop.xlates || !hop.import_vlans {
                    return false;
                }
                match hop.import_from() {
                    Some(parent) => {
                        self.topo.hop(parent).aggregate() == agg
                            && (failed_hop.is_none() || failed_hops.contains(&parent))
                    }
                    None => false,
                }
            });
            if imports_from_here && !d.dependency_for().is_empty() {
                return Feasibility::No(format!(
                    "dependent {} is itself a dependency of further aggregates; topology too entangled",
                    d.urn
                ));
            }
        }

        Feasibility::Yes
    }

    /// Pick a fresh tag for every failed hop, honoring interface and
    /// no-translation constraints. Returns false when some hop ran out of
    /// candidate tags.
    fn reselect_tags(&mut self, agg: AggId, failed_hops: &[HopId]) -> Result<bool, StitchError> {
        let all_hops = self.topo.hops_of(agg);
        let is_pg = self.topo.agg(agg).family == crate::family::ProviderFamily::Pg;

        // candidate range per failed hop: current request range minus the
        // tags other paths already use on the same interface
        let mut next_range: BTreeMap<HopId, VlanRange> = BTreeMap::new();
        let mut new_sug: BTreeMap<HopId, VlanRange> = BTreeMap::new();
        for hid in &all_hops {
            if !failed_hops.contains(hid) {
                new_sug.insert(*hid, self.topo.hop(*hid).requested_suggested.clone());
            }
        }
        for hid in failed_hops {
            let hop = self.topo.hop(*hid);
            let mut range = hop.requested_range.clone();
            let (urn, path) = (hop.urn.clone(), hop.path());
            for other in &all_hops {
                if other == hid {
                    continue;
                }
                let o = self.topo.hop(*other);
                if o.urn == urn && o.path() != path && !o.requested_suggested.is_any() {
                    range.remove(&o.requested_suggested);
                }
            }
            next_range.insert(*hid, range);
        }

        // hops forced to agree must pick from the shared intersection
        for a in failed_hops {
            for b in failed_hops {
                if a == b || !self.topo.hops_share_tag(*a, *b) {
                    continue;
                }
                let other_range = self.topo.hop(*b).requested_range.clone();
                if let Some(r) = next_range.get_mut(a) {
                    let narrowed = r.intersect(&other_range);
                    if narrowed != *r {
                        debug!(
                            "{} candidate range narrowed to {} by non-translating {}",
                            self.topo.hop(*a).urn,
                            narrowed,
                            self.topo.hop(*b).urn
                        );
                        *r = narrowed;
                    }
                }
            }
        }

        let mut new_sug_by_path: BTreeMap<crate::topology::PathId, u16> = BTreeMap::new();
        for hid in failed_hops {
            // ProtoGENI refuses a tag in use on any other path of the AM
            if is_pg {
                let mut taken: Vec<VlanRange> = Vec::new();
                for (other, sug) in &new_sug {
                    if self.topo.hop(*other).path() != self.topo.hop(*hid).path()
                        && !sug.is_any()
                    {
                        taken.push(sug.clone());
                    }
                }
                if let Some(r) = next_range.get_mut(hid) {
                    for t in taken {
                        r.remove(&t);
                    }
                }
            }

            if self.topo.hop(*hid).requested_range.is_empty() {
                debug!(
                    "{} request range is empty; unavailable {}",
                    self.topo.hop(*hid).urn,
                    self.topo.hop(*hid).unavailable
                );
                return Ok(false);
            }

            let path = self.topo.hop(*hid).path();
            let path_pick: Option<u16> = new_sug_by_path.get(&path).copied();
            let pick: VlanRange = match path_pick {
                Some(tag) if !self.topo.hop(*hid).xlates => {
                    debug!(
                        "{} re-using tag {} picked for its path",
                        self.topo.hop(*hid).urn,
                        tag
                    );
                    VlanRange::single(tag)
                }
                _ => self.pick_one(*hid, &next_range, &mut new_sug_by_path)?,
            };
            if pick.is_empty() {
                return Ok(false);
            }

            // tell every conflicting candidate range about the pick
            if let Some(tag) = pick.single_tag() {
                let urn = self.topo.hop(*hid).urn.clone();
                let tag_range = VlanRange::single(tag);
                for other in failed_hops {
                    if other == hid {
                        continue;
                    }
                    let o = self.topo.hop(*other);
                    if o.urn == urn && o.path() != path {
                        if new_sug.get(other) == Some(&tag_range) {
                            return Err(StitchError::InternalInconsistent(format!(
                                "picked the same new tag {} on interface {} twice",
                                tag, urn
                            )));
                        }
                        let other = *other;
                        if let Some(r) = next_range.get_mut(&other) {
                            r.remove(&tag_range);
                        }
                        for third in failed_hops {
                            if third != &other
                                && third != hid
                                && self.topo.hops_share_tag(other, *third)
                            {
                                if let Some(r) = next_range.get_mut(third) {
                                    r.remove(&tag_range);
                                }
                            }
                        }
                    }
                }
            }

            debug!(
                "{} retrying with suggested {} (was {})",
                self.topo.hop(*hid).urn,
                pick,
                self.topo.hop(*hid).requested_suggested
            );
            new_sug.insert(*hid, pick.clone());
            self.topo.hop_mut(*hid).requested_suggested = pick;
        }

        // final cross-checks over everything now requested
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        for (hid, sug) in &new_sug {
            if sug.is_any() {
                continue;
            }
            let hop = self.topo.hop(*hid);
            if !seen.insert((hop.urn.clone(), sug.to_string())) {
                return Err(StitchError::InternalInconsistent(format!(
                    "two hops on interface {} ended up requesting tag {}",
                    hop.urn, sug
                )));
            }
        }
        if is_pg {
            let mut by_tag: BTreeMap<String, crate::topology::PathId> = BTreeMap::new();
            for (hid, sug) in &new_sug {
                if sug.is_any() {
                    continue;
                }
                let path = self.topo.hop(*hid).path();
                if let Some(prev) = by_tag.insert(sug.to_string(), path) {
                    if prev != path {
                        return Err(StitchError::InternalInconsistent(format!(
                            "ProtoGENI aggregate ended up requesting tag {} on two paths",
                            sug
                        )));
                    }
                }
            }
        }
        Ok(true)
    }

    /// Pick a new tag for one failed hop: producers go back to a free
    /// choice, consumers draw a random member of the candidate range.
    fn pick_one(
        &mut self,
        hid: HopId,
        next_range: &BTreeMap<HopId, VlanRange>,
        new_sug_by_path: &mut BTreeMap<crate::topology::PathId, u16>,
    ) -> Result<VlanRange, StitchError> {
        let hop = self.topo.hop(hid);
        if hop.producer {
            debug!("{} is a producer; asking for any tag", hop.urn);
            return Ok(VlanRange::Any);
        }
        let range = next_range.get(&hid).cloned().unwrap_or_else(VlanRange::empty);
        match range.pick_random(self.rng) {
            Some(tag) => {
                new_sug_by_path.insert(hop.path(), tag);
                Ok(VlanRange::single(tag))
            }
            None => {
                debug!(
                    "{} has an empty candidate range (request range {})",
                    hop.urn, hop.requested_range
                );
                Ok(VlanRange::empty())
            }
        }
    }

    /// Local recovery is off the table: mark the hints the expander needs
    /// and report upward. A user-pinned aggregate cannot be replanned
    /// around, so the failure becomes the user's.
    fn escalate(
        &mut self,
        agg: AggId,
        reason: &str,
        tags_exhausted: bool,
    ) -> Result<NegotiationOutcome, StitchError> {
        if self.topo.agg(agg).user_requested {
            return Err(StitchError::FatalUser(format!(
                "reservation failed at user-pinned {}: {}",
                self.topo.agg(agg).urn,
                reason
            )));
        }
        let over_budget = self.topo.agg(agg).allocate_tries > self.cfg.max_allocate_tries;
        for hid in self.topo.hops_of(agg) {
            if over_budget {
                self.topo.hop_mut(hid).exclude_from_plan = true;
            }
            if tags_exhausted {
                self.topo.hop_mut(hid).loose = true;
            }
        }
        if over_budget {
            debug!(
                "{} failed {} times; asking the expander for a path without it",
                self.topo.agg(agg).urn,
                self.topo.agg(agg).allocate_tries
            );
        }
        Ok(NegotiationOutcome::EscalateToPce)
    }
}

enum Feasibility {
    Yes,
    No(String),
    Exhausted(String),
}
