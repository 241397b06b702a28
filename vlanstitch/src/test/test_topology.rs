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

use crate::error::StitchError;
use crate::sample;
use crate::topology::{urn_synonyms, AggState, Topology};
use crate::vlan::VlanRange;

fn vr(s: &str) -> VlanRange {
    VlanRange::parse(s).unwrap()
}

#[test]
fn build_linear_two() {
    let topo = Topology::from_plan(&sample::linear_two_aggregates()).unwrap();
    assert_eq!(topo.agg_ids().len(), 2);
    assert_eq!(topo.hop_ids().len(), 2);

    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = topo.find_aggregate(sample::AGG_TWO).unwrap();
    assert_ne!(a1, a2);

    // the import edge implies the dependency
    assert!(topo.agg(a2).depends_on().contains(&a1));
    assert!(topo.agg(a1).dependency_for().contains(&a2));
    assert!(topo.deps_complete(a1));
    assert!(!topo.deps_complete(a2));
    assert_eq!(topo.dependents(a1), vec![a2]);
}

#[test]
fn urn_synonyms_cover_am_cm_and_vmsite() {
    let syns = urn_synonyms("urn:publicid:IDN+site+authority+am");
    assert!(syns.contains(&"urn:publicid:IDN+site+authority+cm".to_string()));
    let syns = urn_synonyms("urn:publicid:IDN+exo-vmsite+authority+am");
    assert!(syns.iter().any(|s| s.contains("exo-Net")));
}

#[test]
fn find_aggregate_modulo_synonyms() {
    let topo = Topology::from_plan(&sample::linear_two_aggregates()).unwrap();
    let direct = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let via_syn = topo
        .find_aggregate("urn:publicid:IDN+agg-one+authority+cm")
        .unwrap();
    assert_eq!(direct, via_syn);
    assert!(topo.find_aggregate("urn:publicid:IDN+nowhere+authority+am").is_none());
}

#[test]
fn cyclic_dependencies_are_rejected() {
    let mut plan = sample::linear_two_aggregates();
    plan.aggregates[0].depends_on.push(sample::AGG_TWO.to_string());
    match Topology::from_plan(&plan) {
        Err(StitchError::InternalInconsistent(msg)) => assert!(msg.contains("cycle")),
        other => panic!("expected a cycle error, got {:?}", other),
    }
}

#[test]
fn plan_suggestion_outside_range_is_rejected() {
    let mut plan = sample::linear_two_aggregates();
    plan.paths[0].hops[0].suggested = vr("500");
    Topology::from_plan(&plan).unwrap_err();
}

#[test]
fn resolve_import_follows_the_parent_manifest() {
    let mut topo = Topology::from_plan(&sample::linear_two_aggregates()).unwrap();
    let a2 = topo.find_aggregate(sample::AGG_TWO).unwrap();
    let h2 = topo.hops_of(a2)[0];
    let h1 = topo.hop(h2).import_from().unwrap();

    // parent has no manifest yet
    topo.resolve_import(h2).unwrap_err();

    topo.hop_mut(h1).manifest_suggested = Some(vr("150"));
    topo.hop_mut(h1).manifest_range = Some(vr("100-180"));
    let (sug, range) = topo.resolve_import(h2).unwrap();
    assert_eq!(sug, vr("150"));
    assert_eq!(range, vr("100-180"));

    // known-bad tags are carved out of the computed range
    topo.hop_mut(h2).unavailable = vr("100-120");
    let (_, range) = topo.resolve_import(h2).unwrap();
    assert_eq!(range, vr("121-180"));

    // a suggestion that lands on a known-bad tag is an inconsistency
    topo.hop_mut(h2).unavailable = vr("150");
    match topo.resolve_import(h2) {
        Err(StitchError::InternalInconsistent(_)) => {}
        other => panic!("expected inconsistency, got {:?}", other),
    }

    // an empty computed range is an inconsistency
    topo.hop_mut(h2).unavailable = vr("100-200");
    topo.resolve_import(h2).unwrap_err();
}

#[test]
fn tag_sharing_across_non_translating_hops() {
    let topo = Topology::from_plan(&sample::no_translation_pair()).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = topo.find_aggregate(sample::AGG_TWO).unwrap();
    let h1 = topo.hops_of(a1)[0];
    let h2 = topo.hops_of(a2)[0];
    assert!(topo.hops_share_tag(h1, h2));
    assert_eq!(topo.tag_group_of(h1), vec![h2]);

    // translating hops on the same path are unconstrained
    let topo = Topology::from_plan(&sample::linear_two_aggregates()).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = topo.find_aggregate(sample::AGG_TWO).unwrap();
    let h1 = topo.hops_of(a1)[0];
    let h2 = topo.hops_of(a2)[0];
    assert!(!topo.hops_share_tag(h1, h2));
}

#[test]
fn import_chain_walks_to_the_root() {
    let topo = Topology::from_plan(&sample::linear_three_aggregates()).unwrap();
    let a3 = topo.find_aggregate(sample::AGG_THREE).unwrap();
    let h3 = topo.hops_of(a3)[0];
    let chain = topo.import_chain(h3);
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0], h3);
    let root = *chain.last().unwrap();
    assert!(topo.hop(root).import_from().is_none());
}

#[test]
fn invariants_hold_on_a_fresh_topology() {
    let topo = Topology::from_plan(&sample::linear_two_aggregates()).unwrap();
    topo.check_invariants().unwrap();
}

#[test]
fn invariants_catch_a_requested_unavailable_tag() {
    let mut topo = Topology::from_plan(&sample::two_paths_same_interface()).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let h = topo.hops_of(a1)[0];
    topo.hop_mut(h).unavailable = vr("100");
    topo.check_invariants().unwrap_err();
}

#[test]
fn invariants_catch_an_incomplete_completed_aggregate() {
    let mut topo = Topology::from_plan(&sample::linear_two_aggregates()).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    topo.agg_mut(a1).state = AggState::Completed;
    topo.check_invariants().unwrap_err();
}

#[test]
fn invariants_catch_disagreeing_non_translating_tags() {
    let mut topo = Topology::from_plan(&sample::no_translation_pair()).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = topo.find_aggregate(sample::AGG_TWO).unwrap();
    let h1 = topo.hops_of(a1)[0];
    let h2 = topo.hops_of(a2)[0];
    for &(h, tag) in &[(h1, "150"), (h2, "151")] {
        topo.hop_mut(h).requested_suggested = vr(tag);
        topo.hop_mut(h).manifest_suggested = Some(vr(tag));
        topo.hop_mut(h).manifest_range = Some(vr("100-200"));
    }
    topo.agg_mut(a1).state = AggState::Completed;
    topo.agg_mut(a2).state = AggState::Completed;
    topo.check_invariants().unwrap_err();
}

#[test]
fn carried_state_survives_a_rebuild() {
    let plan = sample::linear_two_aggregates();
    let mut topo = Topology::from_plan(&plan).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let h1 = topo.hops_of(a1)[0];
    let urn = topo.hop(h1).urn.clone();
    topo.hop_mut(h1).mark_unavailable(&vr("100-110"));
    topo.hop_mut(h1).exclude_from_plan = true;

    let carried = topo.carried_state();
    assert_eq!(carried.unavailable.get(&urn), Some(&vr("100-110")));
    assert_eq!(carried.excluded, vec![urn]);

    let mut fresh = Topology::from_plan(&plan).unwrap();
    fresh.apply_carried_state(&carried);
    let h1 = fresh.hops_of(fresh.find_aggregate(sample::AGG_ONE).unwrap())[0];
    assert_eq!(fresh.hop(h1).unavailable, vr("100-110"));
    assert_eq!(fresh.hop(h1).requested_range, vr("111-200"));
}

#[test]
fn carried_state_replaces_a_doomed_suggestion() {
    let mut plan = sample::linear_two_aggregates();
    plan.paths[0].hops[0].suggested = vr("105");
    let mut topo = Topology::from_plan(&plan).unwrap();
    let a1 = topo.find_aggregate(sample::AGG_ONE).unwrap();
    let h1 = topo.hops_of(a1)[0];
    topo.hop_mut(h1).mark_unavailable(&vr("100-110"));

    let carried = topo.carried_state();
    let mut fresh = Topology::from_plan(&plan).unwrap();
    fresh.apply_carried_state(&carried);
    let h1 = fresh.hops_of(fresh.find_aggregate(sample::AGG_ONE).unwrap())[0];
    // the expander's 105 is known bad; the smallest workable tag stands in
    assert_eq!(fresh.hop(h1).requested_suggested, vr("111"));
}
