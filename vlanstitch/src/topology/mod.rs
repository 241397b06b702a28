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

//! # The reservation topology
//!
//! Hops, paths and aggregates are created once per plan expansion and form
//! a cyclic reference structure (hops point at their path and aggregate,
//! both point back). They live in flat arenas inside [`Topology`] and are
//! addressed by the integer handles [`HopId`], [`PathId`] and [`AggId`].
//! The aggregate dependency partial order is kept as a petgraph directed
//! graph, with an edge from each dependency to its dependent.
//!
//! A [`Topology`] is the per-run context object: there is no process-wide
//! registry. After a plan-expander escalation the arena is rebuilt from
//! the fresh plan, carrying the accumulated unavailability knowledge and
//! exclusion marks across by interface URN.

pub mod aggregate;
pub mod hop;
pub mod path;

pub use aggregate::{AggState, Aggregate, AllocationOutcome};
pub use hop::Hop;
pub use path::Path;

use crate::error::StitchError;
use crate::family::ProviderFamily;
use crate::provider::ExpandedPlan;
use crate::vlan::VlanRange;
use log::*;
use petgraph::algo::toposort;
use petgraph::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Handle of a hop in the topology arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HopId(pub(crate) usize);

/// Handle of a path in the topology arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId(pub(crate) usize);

/// Handle of an aggregate in the topology arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggId(pub(crate) usize);

impl fmt::Display for HopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{}", self.0)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl fmt::Display for AggId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// State carried across a plan-expander escalation, keyed by interface
/// URN so it survives the rebuild of the arena.
#[derive(Debug, Clone, Default)]
pub struct CarriedState {
    /// Union of `unavailable` per interface URN.
    pub unavailable: BTreeMap<String, VlanRange>,
    /// Interface URNs the expander should route around.
    pub excluded: Vec<String>,
}

/// Produce the URN synonyms under which one aggregate may be known: the
/// authority-manager / compute-manager suffix swap, and the vmsite/Net
/// aliasing some racks use.
pub fn urn_synonyms(urn: &str) -> Vec<String> {
    fn swap_suffix(u: &str) -> Option<String> {
        if let Some(stem) = u.strip_suffix("cm") {
            Some(format!("{}am", stem))
        } else {
            u.strip_suffix("am").map(|stem| format!("{}cm", stem))
        }
    }

    let urn = urn.trim();
    let mut syns: Vec<String> = vec![urn.to_string()];
    if let Some(s) = swap_suffix(urn) {
        syns.push(s);
    }
    let aliased = if urn.contains("vmsite") {
        urn.replace("vmsite", "Net")
    } else {
        urn.replace("Net", "vmsite")
    };
    if aliased != urn {
        if let Some(s) = swap_suffix(&aliased) {
            syns.push(s);
        }
        syns.push(aliased);
    }
    syns.dedup();
    syns
}

/// The per-run reservation topology: hop/path/aggregate arenas plus the
/// aggregate dependency graph and the canonical-URN table.
#[derive(Debug)]
pub struct Topology {
    pub(crate) hops: Vec<Hop>,
    pub(crate) paths: Vec<Path>,
    pub(crate) aggs: Vec<Aggregate>,
    dep_graph: DiGraph<AggId, ()>,
    node_of: Vec<NodeIndex>,
    urn_canon: HashMap<String, AggId>,
}

impl Topology {
    /// Build the arena from an expanded plan. Fails with
    /// `InternalInconsistent` when the plan references unknown aggregates
    /// or hops, carries a suggestion outside its own range, or contains a
    /// dependency cycle.
    pub fn from_plan(plan: &ExpandedPlan) -> Result<Topology, StitchError> {
        let mut topo = Topology {
            hops: Vec::new(),
            paths: Vec::new(),
            aggs: Vec::new(),
            dep_graph: DiGraph::new(),
            node_of: Vec::new(),
            urn_canon: HashMap::new(),
        };

        for ap in &plan.aggregates {
            let id = AggId(topo.aggs.len());
            let syns = urn_synonyms(&ap.urn);
            let family = ProviderFamily::from_urn(&ap.urn);
            for syn in &syns {
                topo.urn_canon.entry(syn.clone()).or_insert(id);
            }
            let node = topo.dep_graph.add_node(id);
            topo.node_of.push(node);
            topo.aggs.push(Aggregate::new(id, ap, family, syns));
        }

        for pp in &plan.paths {
            let pid = PathId(topo.paths.len());
            let mut path_hops: Vec<HopId> = Vec::with_capacity(pp.hops.len());
            let mut by_hop_id: HashMap<&str, HopId> = HashMap::new();
            for hp in &pp.hops {
                let agg = topo.find_aggregate(&hp.aggregate_urn).ok_or_else(|| {
                    StitchError::InternalInconsistent(format!(
                        "plan hop {} names unknown aggregate {}",
                        hp.hop_id, hp.aggregate_urn
                    ))
                })?;
                if !hp.suggested.is_any() && !hp.range.contains(&hp.suggested) {
                    return Err(StitchError::InternalInconsistent(format!(
                        "plan hop {} suggested {} outside advised range {}",
                        hp.hop_id, hp.suggested, hp.range
                    )));
                }
                let hid = HopId(topo.hops.len());
                topo.hops.push(Hop {
                    id: hid,
                    hop_id: hp.hop_id.clone(),
                    urn: hp.urn.clone(),
                    path: pid,
                    aggregate: agg,
                    import_vlans: hp.import_vlans,
                    import_from: None,
                    xlates: hp.xlates,
                    producer: hp.producer,
                    consumer: hp.consumer,
                    requested_suggested: hp.suggested.clone(),
                    requested_range: hp.range.clone(),
                    scs_range: hp.range.clone(),
                    manifest_suggested: None,
                    manifest_range: None,
                    unavailable: VlanRange::empty(),
                    loose: false,
                    exclude_from_plan: false,
                    global_id: None,
                });
                path_hops.push(hid);
                by_hop_id.insert(hp.hop_id.as_str(), hid);
                topo.aggs[agg.0].hops.push(hid);
                if !topo.aggs[agg.0].paths.contains(&pid) {
                    topo.aggs[agg.0].paths.push(pid);
                }
            }
            // second pass: wire the import references and the implied
            // cross-aggregate dependencies
            for (idx, hp) in pp.hops.iter().enumerate() {
                if let Some(from) = &hp.import_from {
                    let child = path_hops[idx];
                    let parent = *by_hop_id.get(from.as_str()).ok_or_else(|| {
                        StitchError::InternalInconsistent(format!(
                            "plan hop {} imports from unknown hop {} on path {}",
                            hp.hop_id, from, pp.id
                        ))
                    })?;
                    topo.hops[child.0].import_from = Some(parent);
                    let parent_agg = topo.hops[parent.0].aggregate;
                    let child_agg = topo.hops[child.0].aggregate;
                    if parent_agg != child_agg {
                        topo.add_dependency(child_agg, parent_agg);
                    }
                }
            }
            topo.paths.push(Path {
                id: pid,
                name: pp.id.clone(),
                global_id: pp.global_id.clone(),
                hops: path_hops,
            });
        }

        for (idx, ap) in plan.aggregates.iter().enumerate() {
            for dep_urn in &ap.depends_on {
                let dep = topo.find_aggregate(dep_urn).ok_or_else(|| {
                    StitchError::InternalInconsistent(format!(
                        "aggregate {} depends on unknown aggregate {}",
                        ap.urn, dep_urn
                    ))
                })?;
                topo.add_dependency(AggId(idx), dep);
            }
        }

        if toposort(&topo.dep_graph, None).is_err() {
            return Err(StitchError::InternalInconsistent(
                "aggregate dependency graph contains a cycle".to_string(),
            ));
        }

        debug!(
            "Built topology: {} aggregates, {} paths, {} hops",
            topo.aggs.len(),
            topo.paths.len(),
            topo.hops.len()
        );
        Ok(topo)
    }

    fn add_dependency(&mut self, dependent: AggId, dependency: AggId) {
        if dependent == dependency || self.aggs[dependent.0].depends_on.contains(&dependency) {
            return;
        }
        self.aggs[dependent.0].depends_on.insert(dependency);
        self.aggs[dependency.0].dependency_for.insert(dependent);
        self.dep_graph
            .add_edge(self.node_of[dependency.0], self.node_of[dependent.0], ());
    }

    /// The aggregate known under `urn`, modulo the synonym relation.
    pub fn find_aggregate(&self, urn: &str) -> Option<AggId> {
        if let Some(id) = self.urn_canon.get(urn.trim()) {
            return Some(*id);
        }
        urn_synonyms(urn)
            .iter()
            .find_map(|syn| self.urn_canon.get(syn))
            .copied()
    }

    /// Borrow a hop.
    pub fn hop(&self, id: HopId) -> &Hop {
        &self.hops[id.0]
    }

    /// Mutably borrow a hop.
    pub fn hop_mut(&mut self, id: HopId) -> &mut Hop {
        &mut self.hops[id.0]
    }

    /// Borrow a path.
    pub fn path(&self, id: PathId) -> &Path {
        &self.paths[id.0]
    }

    /// Borrow an aggregate.
    pub fn agg(&self, id: AggId) -> &Aggregate {
        &self.aggs[id.0]
    }

    /// Mutably borrow an aggregate.
    pub fn agg_mut(&mut self, id: AggId) -> &mut Aggregate {
        &mut self.aggs[id.0]
    }

    /// All aggregate handles, in arena order.
    pub fn agg_ids(&self) -> Vec<AggId> {
        (0..self.aggs.len()).map(AggId).collect()
    }

    /// All hop handles, in arena order.
    pub fn hop_ids(&self) -> Vec<HopId> {
        (0..self.hops.len()).map(HopId).collect()
    }

    /// The hops owned by one aggregate.
    pub fn hops_of(&self, agg: AggId) -> Vec<HopId> {
        self.aggs[agg.0].hops.clone()
    }

    /// Find a hop on a path by its interface URN.
    pub fn find_hop_on_path(&self, path: PathId, urn: &str) -> Option<HopId> {
        self.paths[path.0]
            .hops
            .iter()
            .copied()
            .find(|h| self.hops[h.0].urn == urn)
    }

    /// Find a hop on a path by its stable hop id.
    pub fn find_hop_on_path_by_id(&self, path: PathId, hop_id: &str) -> Option<HopId> {
        self.paths[path.0]
            .hops
            .iter()
            .copied()
            .find(|h| self.hops[h.0].hop_id == hop_id)
    }

    /// The path whose external name matches, if any.
    pub fn find_path_by_name(&self, name: &str) -> Option<PathId> {
        self.paths.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// True when every dependency of `agg` is completed.
    pub fn deps_complete(&self, agg: AggId) -> bool {
        self.aggs[agg.0]
            .depends_on
            .iter()
            .all(|d| self.aggs[d.0].state == AggState::Completed)
    }

    /// The aggregates directly depending on `agg`.
    pub fn dependents(&self, agg: AggId) -> Vec<AggId> {
        self.aggs[agg.0].dependency_for.iter().copied().collect()
    }

    /// The transitive closure of aggregates depending on `agg`, used by
    /// the ripple delete.
    pub fn dependents_closure(&self, agg: AggId) -> Vec<AggId> {
        let mut seen: BTreeSet<AggId> = BTreeSet::new();
        let mut work: Vec<AggId> = self.dependents(agg);
        while let Some(a) = work.pop() {
            if seen.insert(a) {
                work.extend(self.dependents(a));
            }
        }
        seen.into_iter().collect()
    }

    /// True when the two hops sit on the same path and at least one of
    /// them cannot translate: they then belong to the same tag
    /// equivalence class and must carry the same tag.
    pub fn hops_share_tag(&self, a: HopId, b: HopId) -> bool {
        let (ha, hb) = (&self.hops[a.0], &self.hops[b.0]);
        a != b && ha.path == hb.path && (!ha.xlates || !hb.xlates)
    }

    /// The hops on the same path as `hop` that are forced to share its
    /// tag (not including `hop` itself).
    pub fn tag_group_of(&self, hop: HopId) -> Vec<HopId> {
        let path = self.hops[hop.0].path;
        self.paths[path.0]
            .hops
            .iter()
            .copied()
            .filter(|h| self.hops_share_tag(hop, *h))
            .collect()
    }

    /// Walk the import chain of a hop upward: `[hop, parent, …, root]`.
    pub fn import_chain(&self, hop: HopId) -> Vec<HopId> {
        let mut chain = vec![hop];
        let mut cur = hop;
        while let Some(parent) = self.hops[cur.0].import_from {
            // a malformed plan could have a loop; the chain is bounded by
            // the hop count
            if chain.contains(&parent) || chain.len() > self.hops.len() {
                break;
            }
            chain.push(parent);
            cur = parent;
        }
        chain
    }

    /// Compute `(new_suggested, new_range)` for an importing hop from its
    /// upstream parent's manifest.
    pub fn resolve_import(&self, hop: HopId) -> Result<(VlanRange, VlanRange), StitchError> {
        let h = &self.hops[hop.0];
        let parent = h.import_from.ok_or_else(|| {
            StitchError::InternalInconsistent(format!(
                "hop {} imports VLANs but has no import-from reference",
                h.urn
            ))
        })?;
        let p = &self.hops[parent.0];

        let new_suggested = match &p.manifest_suggested {
            Some(sug) => sug.clone(),
            None => {
                return Err(StitchError::InternalInconsistent(format!(
                    "hop {} imports from {} which has no manifest tag",
                    h.urn, p.urn
                )))
            }
        };
        let parent_range = p
            .manifest_range
            .clone()
            .unwrap_or(VlanRange::Any);
        let mut new_range = parent_range.intersect(&h.requested_range);
        new_range.remove(&h.unavailable);

        if new_range.is_empty() {
            return Err(StitchError::InternalInconsistent(format!(
                "hop {} computed an empty available range importing from {}",
                h.urn, p.urn
            )));
        }
        if !new_suggested.is_any() && !new_range.contains(&new_suggested) {
            return Err(StitchError::InternalInconsistent(format!(
                "hop {} computed suggested {} outside available range {}",
                h.urn, new_suggested, new_range
            )));
        }
        Ok((new_suggested, new_range))
    }

    /// Collect the hints to hand the plan expander on escalation, and the
    /// state to re-apply after the rebuild.
    pub fn carried_state(&self) -> CarriedState {
        let mut unavailable: BTreeMap<String, VlanRange> = BTreeMap::new();
        let mut excluded: Vec<String> = Vec::new();
        for hop in &self.hops {
            if !hop.unavailable.is_empty() {
                unavailable
                    .entry(hop.urn.clone())
                    .and_modify(|r| r.absorb(&hop.unavailable))
                    .or_insert_with(|| hop.unavailable.clone());
            }
            if hop.exclude_from_plan && !excluded.contains(&hop.urn) {
                excluded.push(hop.urn.clone());
            }
        }
        CarriedState { unavailable, excluded }
    }

    /// Re-apply carried unavailability knowledge to a freshly built
    /// arena. A suggestion the expander placed on a now-unavailable tag is
    /// replaced by the smallest workable one.
    pub fn apply_carried_state(&mut self, carried: &CarriedState) {
        for hop in self.hops.iter_mut() {
            if let Some(unavail) = carried.unavailable.get(&hop.urn) {
                hop.unavailable.absorb(unavail);
                hop.requested_range.remove(&hop.unavailable);
                let sug = hop.requested_suggested.clone();
                if !sug.is_any() && !hop.requested_range.contains(&sug) {
                    let replacement = hop
                        .requested_range
                        .min_tag()
                        .map(VlanRange::single)
                        .unwrap_or(VlanRange::Any);
                    warn!(
                        "Expander suggested {} on {} which is known unavailable; using {}",
                        sug, hop.urn, replacement
                    );
                    hop.requested_suggested = replacement;
                }
            }
        }
    }

    /// Carry completed reservations from the previous arena into this
    /// freshly rebuilt one. An aggregate keeps its committed tags when
    /// the new plan still names it with the same hops (matched by path
    /// name and interface URN) and every dependency could be kept as
    /// well. Returns the URNs of previously completed aggregates that
    /// could not be carried; their provider-side reservations are stale
    /// and the caller must tear them down.
    pub fn restore_completed(&mut self, old: &Topology) -> Vec<String> {
        let mut dropped: Vec<String> = Vec::new();
        let mut remaining: Vec<AggId> = old
            .agg_ids()
            .into_iter()
            .filter(|a| old.agg(*a).state == AggState::Completed)
            .collect();

        loop {
            let mut progressed = false;
            let mut deferred: Vec<AggId> = Vec::new();
            for old_a in remaining {
                let urn = old.agg(old_a).urn.clone();
                let new_a = match self.find_aggregate(&urn) {
                    Some(a) => a,
                    None => {
                        debug!("{} is no longer part of the plan; its reservation is stale", urn);
                        dropped.push(urn);
                        progressed = true;
                        continue;
                    }
                };
                if !self.deps_complete(new_a) {
                    // may become restorable once its dependencies are
                    deferred.push(old_a);
                    continue;
                }
                if self.adopt_reservation(new_a, old, old_a) {
                    progressed = true;
                } else {
                    debug!("{} was complete but the new plan reshapes it; redoing", urn);
                    dropped.push(urn);
                    progressed = true;
                }
            }
            if deferred.is_empty() || !progressed {
                for old_a in &deferred {
                    dropped.push(old.agg(*old_a).urn.clone());
                }
                break;
            }
            remaining = deferred;
        }
        dropped
    }

    /// Copy one completed reservation from the old arena onto the
    /// matching aggregate here. False when the hop sets differ.
    fn adopt_reservation(&mut self, new_a: AggId, old: &Topology, old_a: AggId) -> bool {
        let new_hops = self.hops_of(new_a);
        if new_hops.len() != old.hops_of(old_a).len() {
            return false;
        }
        let mut pairs: Vec<(HopId, HopId)> = Vec::with_capacity(new_hops.len());
        for hid in &new_hops {
            let path_name = self.path(self.hop(*hid).path()).name.clone();
            let matched = old
                .find_path_by_name(&path_name)
                .and_then(|p| old.find_hop_on_path(p, &self.hop(*hid).urn))
                .filter(|oh| {
                    old.hop(*oh).aggregate() == old_a && old.hop(*oh).manifest_suggested.is_some()
                });
            match matched {
                Some(oh) => pairs.push((*hid, oh)),
                None => return false,
            }
        }
        for (new_h, old_h) in pairs {
            let src = old.hop(old_h);
            let requested_suggested = src.requested_suggested.clone();
            let requested_range = src.requested_range.clone();
            let manifest_suggested = src.manifest_suggested.clone();
            let manifest_range = src.manifest_range.clone();
            let global_id = src.global_id.clone();
            let unavailable = src.unavailable.clone();
            let dst = self.hop_mut(new_h);
            dst.requested_suggested = requested_suggested;
            dst.requested_range = requested_range;
            dst.manifest_suggested = manifest_suggested;
            dst.manifest_range = manifest_range;
            dst.global_id = global_id;
            dst.unavailable.absorb(&unavailable);
        }
        self.agg_mut(new_a).state = AggState::Completed;
        self.agg_mut(new_a).had_manifest = true;
        debug!(
            "Kept the completed reservation at {} across the replan",
            self.agg(new_a).urn
        );
        true
    }

    /// Verify the cross-cutting invariants that must hold after every
    /// aggregate transition.
    pub fn check_invariants(&self) -> Result<(), StitchError> {
        for hop in &self.hops {
            // a requested tag is never one we know to be unavailable
            if !hop.requested_suggested.is_any()
                && !hop.unavailable.is_disjoint(&hop.requested_suggested)
            {
                return Err(StitchError::InternalInconsistent(format!(
                    "hop {} requests {} which overlaps its unavailable set {}",
                    hop.urn, hop.requested_suggested, hop.unavailable
                )));
            }
        }

        for agg in &self.aggs {
            if agg.state == AggState::Completed {
                for hid in &agg.hops {
                    let hop = &self.hops[hid.0];
                    let sug = hop.manifest_suggested.as_ref().ok_or_else(|| {
                        StitchError::InternalInconsistent(format!(
                            "{} is complete but hop {} has no manifest tag",
                            agg.urn, hop.urn
                        ))
                    })?;
                    let tag = sug.single_tag().ok_or_else(|| {
                        StitchError::InternalInconsistent(format!(
                            "{} is complete but hop {} manifest tag {} is not a single tag",
                            agg.urn, hop.urn, sug
                        ))
                    })?;
                    if !hop.requested_range.contains_tag(tag) || hop.unavailable.contains_tag(tag) {
                        return Err(StitchError::InternalInconsistent(format!(
                            "{} is complete but hop {} manifest tag {} violates its ranges",
                            agg.urn, hop.urn, tag
                        )));
                    }
                }
            }

            // same interface on two paths must not carry the same tag
            for (i, a) in agg.hops.iter().enumerate() {
                for b in agg.hops.iter().skip(i + 1) {
                    let (ha, hb) = (&self.hops[a.0], &self.hops[b.0]);
                    if ha.urn == hb.urn
                        && !ha.requested_suggested.is_any()
                        && ha.requested_suggested == hb.requested_suggested
                    {
                        return Err(StitchError::InternalInconsistent(format!(
                            "{}: hops on paths {} and {} request the same tag {} on interface {}",
                            agg.urn,
                            self.paths[ha.path.0].name,
                            self.paths[hb.path.0].name,
                            ha.requested_suggested,
                            ha.urn
                        )));
                    }
                    if agg.family == ProviderFamily::Pg
                        && ha.path != hb.path
                        && !ha.requested_suggested.is_any()
                        && ha.requested_suggested == hb.requested_suggested
                    {
                        return Err(StitchError::InternalInconsistent(format!(
                            "{} (ProtoGENI): paths {} and {} request the same tag {}",
                            agg.urn,
                            self.paths[ha.path.0].name,
                            self.paths[hb.path.0].name,
                            ha.requested_suggested
                        )));
                    }
                }
            }

            // scheduling order: anything past pending has completed deps
            if matches!(agg.state, AggState::Allocating | AggState::Completed)
                && !self.deps_complete(agg.id)
            {
                return Err(StitchError::InternalInconsistent(format!(
                    "{} is {:?} although a dependency is not completed",
                    agg.urn, agg.state
                )));
            }
        }

        // completed non-translating groups agree on the tag
        for path in &self.paths {
            for (i, a) in path.hops.iter().enumerate() {
                for b in path.hops.iter().skip(i + 1) {
                    if !self.hops_share_tag(*a, *b) {
                        continue;
                    }
                    let (ha, hb) = (&self.hops[a.0], &self.hops[b.0]);
                    let done = self.aggs[ha.aggregate.0].state == AggState::Completed
                        && self.aggs[hb.aggregate.0].state == AggState::Completed;
                    if !done {
                        continue;
                    }
                    if let (Some(sa), Some(sb)) = (&ha.manifest_suggested, &hb.manifest_suggested) {
                        if sa != sb {
                            return Err(StitchError::InternalInconsistent(format!(
                                "path {}: non-translating hops {} and {} carry different tags {} and {}",
                                path.name, ha.urn, hb.urn, sa, sb
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
