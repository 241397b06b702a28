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

use crate::classify::Classifier;
use crate::error::StitchError;
use crate::negotiate::{NegotiationOutcome, VlanNegotiator};
use crate::provider::{PlanDoc, ProviderError};
use crate::sample::{self, AllocateAction, EchoCodec, ScriptedProvider};
use crate::scheduler::SchedulerConfig;
use crate::topology::{AggId, AggState, Topology};
use crate::vlan::VlanRange;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn vr(s: &str) -> VlanRange {
    VlanRange::parse(s).unwrap()
}

fn cfg() -> SchedulerConfig {
    SchedulerConfig {
        slice_name: "testslice".to_string(),
        suppress_waits: true,
        seed: Some(1),
        ..SchedulerConfig::default()
    }
}

fn vlan_unavailable_err() -> ProviderError {
    ProviderError::new(24, "vlan unavailable")
}

struct Rig {
    topo: Topology,
    provider: ScriptedProvider,
    classifier: Classifier,
    cfg: SchedulerConfig,
    plan: PlanDoc,
    rng: StdRng,
}

impl Rig {
    fn new(plan: crate::provider::ExpandedPlan) -> Self {
        Rig {
            topo: Topology::from_plan(&plan).unwrap(),
            provider: ScriptedProvider::echo(),
            classifier: Classifier::new(),
            cfg: cfg(),
            plan: plan.request,
            rng: StdRng::seed_from_u64(7),
        }
    }

    fn allocate(&mut self, agg: AggId) -> crate::topology::AllocationOutcome {
        self.topo
            .allocate_aggregate(
                agg,
                &mut self.provider,
                &EchoCodec,
                &self.classifier,
                &self.cfg,
                &self.plan,
                1,
            )
            .unwrap()
    }

    fn negotiate_unavailable(
        &mut self,
        agg: AggId,
        err: Option<&ProviderError>,
    ) -> Result<NegotiationOutcome, StitchError> {
        let mut negotiator = VlanNegotiator::new(
            &mut self.topo,
            &mut self.provider,
            &self.classifier,
            &self.cfg,
            &mut self.rng,
        );
        negotiator.handle_vlan_unavailable(agg, "createsliver", err, None, false)
    }
}

#[test]
fn upstream_any_fast_path_redoes_the_chain_root() {
    let mut rig = Rig::new(sample::linear_two_aggregates());
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = rig.topo.find_aggregate(sample::AGG_TWO).unwrap();
    rig.allocate(a1);
    rig.allocate(a2); // sets H2's request to the granted 100
    // pretend the provider rejected that second reservation
    rig.topo.agg_mut(a2).state = AggState::NeedsRedo;
    let h2 = rig.topo.hops_of(a2)[0];
    rig.topo.hop_mut(h2).clear_manifest();
    rig.topo.agg_mut(a2).had_manifest = false;

    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a2, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::RetryFromRoot(a1));

    let h1 = rig.topo.hops_of(a1)[0];
    // the failed tag is now excluded at both ends of the chain
    assert!(rig.topo.hop(h1).unavailable.contains_tag(100));
    assert!(rig.topo.hop(h2).unavailable.contains_tag(100));
    assert_eq!(rig.topo.hop(h1).requested_range, vr("101-200"));
    assert_eq!(rig.topo.hop(h2).requested_range, vr("101-200"));
    // the reserved chain root was torn down and requeued
    assert!(rig.provider.delete_calls.contains(&sample::url_of(sample::AGG_ONE)));
    assert_eq!(rig.topo.agg(a1).state, AggState::Pending);
    assert_eq!(rig.topo.agg(a2).state, AggState::Pending);
}

#[test]
fn fast_path_requires_an_any_root() {
    let mut plan = sample::linear_two_aggregates();
    plan.paths[0].hops[0].suggested = vr("150");
    plan.paths[0].hops[0].producer = false;
    let mut rig = Rig::new(plan);
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = rig.topo.find_aggregate(sample::AGG_TWO).unwrap();
    rig.allocate(a1);
    rig.allocate(a2);
    rig.topo.agg_mut(a2).state = AggState::NeedsRedo;
    let h2 = rig.topo.hops_of(a2)[0];
    rig.topo.hop_mut(h2).clear_manifest();
    rig.topo.agg_mut(a2).had_manifest = false;

    // the root asked for a concrete tag, and the failed hop imports, so
    // neither the fast path nor a local retry applies
    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a2, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::EscalateToPce);
}

#[test]
fn local_reselection_avoids_unavailable_and_sibling_tags() {
    let mut rig = Rig::new(sample::two_paths_same_interface());
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    let hops = rig.topo.hops_of(a1);
    let old: Vec<VlanRange> = hops
        .iter()
        .map(|h| rig.topo.hop(*h).requested_suggested.clone())
        .collect();

    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::RetryHere);
    assert_eq!(rig.topo.agg(a1).state, AggState::Pending);
    assert_eq!(rig.topo.agg(a1).local_vlan_tries, 1);

    let new: Vec<VlanRange> = hops
        .iter()
        .map(|h| rig.topo.hop(*h).requested_suggested.clone())
        .collect();
    for (hid, (old_tag, new_tag)) in hops.iter().zip(old.iter().zip(new.iter())) {
        assert_ne!(old_tag, new_tag, "hop must change its tag");
        let hop = rig.topo.hop(*hid);
        assert!(hop.unavailable.contains(old_tag));
        assert!(hop.requested_range.contains(new_tag));
    }
    // same interface on two paths must not collide
    assert_ne!(new[0], new[1]);
    rig.topo.check_invariants().unwrap();
}

#[test]
fn producers_fall_back_to_a_free_choice() {
    let mut plan = sample::two_paths_same_interface();
    plan.paths[0].hops[0].producer = true;
    let mut rig = Rig::new(plan);
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    let hops = rig.topo.hops_of(a1);

    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::RetryHere);
    assert!(rig.topo.hop(hops[0]).requested_suggested.is_any());
    assert!(!rig.topo.hop(hops[1]).requested_suggested.is_any());
}

#[test]
fn budget_exhaustion_escalates() {
    let mut rig = Rig::new(sample::two_paths_same_interface());
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    rig.topo.agg_mut(a1).local_vlan_tries = 50;
    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::EscalateToPce);
}

#[test]
fn dcn_budget_is_three() {
    let mut rig = Rig::new(sample::single_dcn_aggregate());
    let a1 = rig.topo.find_aggregate(sample::AGG_DCN).unwrap();
    rig.topo.agg_mut(a1).local_vlan_tries = 3;
    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::EscalateToPce);

    let mut rig = Rig::new(sample::single_dcn_aggregate());
    let a1 = rig.topo.find_aggregate(sample::AGG_DCN).unwrap();
    rig.topo.agg_mut(a1).local_vlan_tries = 2;
    let err = vlan_unavailable_err();
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::RetryHere);
}

#[test]
fn unrecognized_error_signature_escalates() {
    let mut rig = Rig::new(sample::two_paths_same_interface());
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    let err = ProviderError::new(2, "some unrelated failure");
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::EscalateToPce);
}

#[test]
fn user_pinned_aggregate_escalation_is_fatal() {
    let mut plan = sample::two_paths_same_interface();
    plan.aggregates[0].user_requested = true;
    let mut rig = Rig::new(plan);
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    rig.topo.agg_mut(a1).local_vlan_tries = 50;
    let err = vlan_unavailable_err();
    match rig.negotiate_unavailable(a1, Some(&err)) {
        Err(StitchError::FatalUser(msg)) => assert!(msg.contains("user-pinned")),
        other => panic!("expected fatal user, got {:?}", other),
    }
}

#[test]
fn exhausted_attempts_mark_hops_for_exclusion() {
    let mut rig = Rig::new(sample::two_paths_same_interface());
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    rig.topo.agg_mut(a1).local_vlan_tries = 50;
    rig.topo.agg_mut(a1).allocate_tries = 11;
    let err = vlan_unavailable_err();
    rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    for h in rig.topo.hops_of(a1) {
        assert!(rig.topo.hop(h).exclude_from_plan);
    }
}

#[test]
fn pg_error_message_narrows_the_failed_hops() {
    let mut rig = Rig::new(sample::pg_two_paths());
    let a1 = rig.topo.find_aggregate(sample::AGG_PG).unwrap();
    let err = ProviderError::new(1, "vlan tag 100 for 'circuit-a' not available")
        .with_am(1, "protogeni");
    let outcome = rig.negotiate_unavailable(a1, Some(&err)).unwrap();
    assert_eq!(outcome, NegotiationOutcome::RetryHere);

    let hops = rig.topo.hops_of(a1);
    let on_a = hops
        .iter()
        .find(|h| rig.topo.path(rig.topo.hop(**h).path()).name == "circuit-a")
        .copied()
        .unwrap();
    assert!(rig.topo.hop(on_a).unavailable.contains_tag(100));

    // a ProtoGENI aggregate must not reuse a tag across paths
    let tags: Vec<VlanRange> = hops
        .iter()
        .map(|h| rig.topo.hop(*h).requested_suggested.clone())
        .collect();
    assert_ne!(tags[0], tags[1]);
    rig.topo.check_invariants().unwrap();
}

#[test]
fn suggested_not_request_redoes_the_any_ancestor() {
    let mut rig = Rig::new(sample::linear_two_aggregates());
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    let a2 = rig.topo.find_aggregate(sample::AGG_TWO).unwrap();
    rig.allocate(a1);
    // the second provider ignores the imported 100 and grants 175
    rig.provider.push_action(
        &sample::url_of(sample::AGG_TWO),
        AllocateAction::EchoWith(maplit::btreemap! {"2".to_string() => 175}),
    );
    match rig.allocate(a2) {
        crate::topology::AllocationOutcome::SuggestedNotRequest => {}
        other => panic!("expected suggested-not-request, got {:?}", other),
    }

    let mut negotiator = VlanNegotiator::new(
        &mut rig.topo,
        &mut rig.provider,
        &rig.classifier,
        &rig.cfg,
        &mut rig.rng,
    );
    let outcome = negotiator.handle_suggested_not_request(a2).unwrap();
    assert_eq!(outcome, NegotiationOutcome::RetryFromRoot(a1));

    let h1 = rig.topo.hops_of(a1)[0];
    let h2 = rig.topo.hops_of(a2)[0];
    // the ancestor that chose freely is reseeded with the delivered tag
    assert_eq!(rig.topo.hop(h1).requested_suggested, vr("175"));
    assert!(!rig.topo.hop(h1).requested_range.contains_tag(100));
    // the tag nobody honored is remembered as bad here
    assert!(rig.topo.hop(h2).unavailable.contains_tag(100));
    assert_eq!(rig.topo.agg(a1).state, AggState::Pending);
    assert_eq!(rig.topo.agg(a2).state, AggState::Pending);
    // both stale reservations are gone
    assert!(rig.provider.delete_calls.contains(&sample::url_of(sample::AGG_ONE)));
    assert!(rig.provider.delete_calls.contains(&sample::url_of(sample::AGG_TWO)));
}

#[test]
fn suggested_not_request_without_an_any_ancestor_escalates() {
    let mut plan = sample::linear_two_aggregates();
    plan.paths[0].hops[0].suggested = vr("150");
    plan.paths[0].hops[0].producer = false;
    let mut rig = Rig::new(plan);
    let a1 = rig.topo.find_aggregate(sample::AGG_ONE).unwrap();
    rig.provider.push_action(
        &sample::url_of(sample::AGG_ONE),
        AllocateAction::EchoWith(maplit::btreemap! {"1".to_string() => 175}),
    );
    match rig.allocate(a1) {
        crate::topology::AllocationOutcome::SuggestedNotRequest => {}
        other => panic!("expected suggested-not-request, got {:?}", other),
    }

    let mut negotiator = VlanNegotiator::new(
        &mut rig.topo,
        &mut rig.provider,
        &rig.classifier,
        &rig.cfg,
        &mut rig.rng,
    );
    let outcome = negotiator.handle_suggested_not_request(a1).unwrap();
    assert_eq!(outcome, NegotiationOutcome::EscalateToPce);
    let h1 = rig.topo.hops_of(a1)[0];
    assert!(rig.topo.hop(h1).unavailable.contains_tag(150));
}
