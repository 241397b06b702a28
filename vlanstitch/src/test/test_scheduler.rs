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
use crate::provider::{PlanDoc, ProviderError};
use crate::sample::{
    self, status_failed, status_not_ready, AllocateAction, EchoCodec, ScriptedExpander,
    ScriptedProvider,
};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::topology::AggState;
use crate::vlan::VlanRange;
use crate::Stopper;

fn vr(s: &str) -> VlanRange {
    VlanRange::parse(s).unwrap()
}

fn cfg() -> SchedulerConfig {
    let _ = pretty_env_logger::try_init();
    SchedulerConfig {
        slice_name: "testslice".to_string(),
        suppress_waits: true,
        seed: Some(17),
        ..SchedulerConfig::default()
    }
}

fn scheduler_for(
    plan: crate::provider::ExpandedPlan,
    provider: ScriptedProvider,
    cfg: SchedulerConfig,
) -> Scheduler<ScriptedProvider, ScriptedExpander, EchoCodec> {
    Scheduler::new(
        PlanDoc("user request".to_string()),
        provider,
        ScriptedExpander::fixed(plan),
        EchoCodec,
        cfg,
    )
    .unwrap()
}

fn tag_of(report: &crate::scheduler::StitchReport, agg_urn: &str) -> u16 {
    report
        .aggregates
        .iter()
        .find(|a| a.urn == agg_urn)
        .and_then(|a| a.hops.first())
        .and_then(|h| h.tag)
        .expect("aggregate should have a committed tag")
}

// Linear two-aggregate path, both translating: two RPCs, no expander
// escalation, matching tags at both ends.
#[test]
fn linear_chain_completes_in_two_rpcs() {
    let mut scheduler = scheduler_for(
        sample::linear_two_aggregates(),
        ScriptedProvider::echo(),
        cfg(),
    );
    let report = scheduler.run(Stopper::new()).unwrap();

    assert_eq!(report.pce_calls, 1);
    assert_eq!(report.total_allocations, 2);
    assert_eq!(tag_of(&report, sample::AGG_ONE), 100);
    assert_eq!(tag_of(&report, sample::AGG_TWO), 100);
    for agg in &report.aggregates {
        assert_eq!(agg.state, AggState::Completed);
    }
}

// Downstream reports the tag unavailable; the chain is redone from the
// root with the failed tag excluded. One redo, no expander call.
#[test]
fn downstream_rejection_is_redone_from_the_root() {
    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_TWO),
        AllocateAction::Fail(ProviderError::new(24, "vlan 100 is taken")),
    );
    let mut scheduler = scheduler_for(sample::linear_two_aggregates(), provider, cfg());
    let report = scheduler.run(Stopper::new()).unwrap();

    assert_eq!(report.pce_calls, 1);
    // one wasted attempt at each end plus the successful pair
    assert_eq!(report.total_allocations, 4);
    assert_eq!(tag_of(&report, sample::AGG_ONE), 101);
    assert_eq!(tag_of(&report, sample::AGG_TWO), 101);

    let topo = scheduler.topology();
    for h in topo.hop_ids() {
        assert!(topo.hop(h).unavailable.contains_tag(100));
    }
}

// The provider delivers a tag nobody requested and no upstream choice
// can be redone: the run goes back to the expander with the rejected
// tag recorded as a hint, then completes.
#[test]
fn undeliverable_suggestion_escalates_to_the_expander() {
    let mut plan = sample::linear_two_aggregates();
    plan.paths[0].hops[0].suggested = vr("150");
    plan.paths[0].hops[0].producer = false;
    let urn_h1 = plan.paths[0].hops[0].urn.clone();

    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_ONE),
        AllocateAction::EchoWith(maplit::btreemap! {"1".to_string() => 175}),
    );
    let mut scheduler = scheduler_for(plan, provider, cfg());
    let report = scheduler.run(Stopper::new()).unwrap();

    assert_eq!(report.pce_calls, 2);
    // the second expansion was told which tag failed where
    let hints = &scheduler.expander().calls[1];
    assert!(hints.unavailable.get(&urn_h1).unwrap().contains_tag(150));
    assert!(tag_of(&report, sample::AGG_ONE) != 150);
}

// Non-translating pair across two aggregates: the shared tag is redone
// end to end when the downstream aggregate rejects it.
#[test]
fn non_translating_pair_renegotiates_the_shared_tag() {
    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_TWO),
        AllocateAction::Fail(ProviderError::new(24, "vlan 100 is taken")),
    );
    let mut scheduler = scheduler_for(sample::no_translation_pair(), provider, cfg());
    let report = scheduler.run(Stopper::new()).unwrap();

    assert_eq!(report.pce_calls, 1);
    let t1 = tag_of(&report, sample::AGG_ONE);
    let t2 = tag_of(&report, sample::AGG_TWO);
    assert_eq!(t1, t2, "a non-translating pair must agree on the tag");
    assert_eq!(t1, 101);

    let topo = scheduler.topology();
    for h in topo.hop_ids() {
        assert!(topo.hop(h).unavailable.contains_tag(100));
    }
}

// A user-pinned aggregate failing fatally terminates the run with the
// provider message surfaced.
#[test]
fn user_pinned_fatal_failure_terminates() {
    let mut plan = sample::linear_two_aggregates();
    plan.aggregates[0].user_requested = true;
    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_ONE),
        AllocateAction::Fail(ProviderError::new(25, "Insufficient bandwidth on trunk")),
    );
    let mut scheduler = scheduler_for(plan, provider, cfg());
    match scheduler.run(Stopper::new()) {
        Err(StitchError::FatalUser(msg)) => {
            assert!(msg.contains("bandwidth"));
            assert!(msg.contains("user-pinned"));
        }
        other => panic!("expected fatal user error, got {:?}", other),
    }
}

// Delayed-commit provider succeeds at allocate, then reports the VLAN
// failure through status. Reclassified, renegotiated locally, retried.
#[test]
fn delayed_commit_failure_is_renegotiated() {
    let url = sample::url_of(sample::AGG_DCN);
    let mut provider = ScriptedProvider::echo();
    provider.push_status(&url, Ok(status_not_ready()));
    provider.push_status(
        &url,
        Ok(status_failed(
            "urn:publicid:IDN+dcncore+sliver+circ_vlan_ion-42",
            "no VLANs available on link link-ion VLAN PCE PCE_CREATE_FAILED",
        )),
    );
    let mut scheduler = scheduler_for(sample::single_dcn_aggregate(), provider, cfg());
    let report = scheduler.run(Stopper::new()).unwrap();

    assert_eq!(report.pce_calls, 1);
    let tag = tag_of(&report, sample::AGG_DCN);
    assert_ne!(tag, 150);
    assert!(vr("100-200").contains_tag(tag));

    let topo = scheduler.topology();
    let a = topo.find_aggregate(sample::AGG_DCN).unwrap();
    let h = topo.hops_of(a)[0];
    assert!(topo.hop(h).unavailable.contains_tag(150));
}

// A replan triggered downstream leaves already-completed reservations
// untouched: the first aggregate is neither deleted nor re-reserved,
// and the redone downstream imports its surviving tag.
#[test]
fn escalation_preserves_completed_reservations() {
    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_TWO),
        AllocateAction::Fail(ProviderError::new(2, "some brand new failure mode")),
    );
    let mut scheduler = scheduler_for(sample::linear_two_aggregates(), provider, cfg());
    let report = scheduler.run(Stopper::new()).unwrap();

    assert_eq!(report.pce_calls, 2);
    assert_eq!(
        scheduler.provider().allocates_at(&sample::url_of(sample::AGG_ONE)),
        1
    );
    assert!(!scheduler
        .provider()
        .delete_calls
        .contains(&sample::url_of(sample::AGG_ONE)));
    assert_eq!(tag_of(&report, sample::AGG_ONE), 100);
    assert_eq!(tag_of(&report, sample::AGG_TWO), 100);
    for agg in &report.aggregates {
        assert_eq!(agg.state, AggState::Completed);
    }
}

#[test]
fn allocation_budget_is_enforced() {
    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_TWO),
        AllocateAction::Fail(ProviderError::new(24, "vlan 100 is taken")),
    );
    let mut config = cfg();
    config.max_total_allocations = 2;
    let mut scheduler = scheduler_for(sample::linear_two_aggregates(), provider, config);
    match scheduler.run(Stopper::new()) {
        Err(StitchError::AllocateBudgetExhausted(_)) => {}
        other => panic!("expected allocation budget exhaustion, got {:?}", other),
    }
}

#[test]
fn expander_budget_is_enforced() {
    let mut plan = sample::linear_two_aggregates();
    plan.paths[0].hops[0].suggested = vr("150");
    plan.paths[0].hops[0].producer = false;
    let mut provider = ScriptedProvider::echo();
    // every attempt at the first aggregate delivers the wrong tag
    for _ in 0..10 {
        provider.push_action(
            &sample::url_of(sample::AGG_ONE),
            AllocateAction::EchoWith(maplit::btreemap! {"1".to_string() => 175}),
        );
    }
    let mut config = cfg();
    config.max_pce_calls = 1;
    let mut scheduler = scheduler_for(plan, provider, config);
    match scheduler.run(Stopper::new()) {
        Err(StitchError::PceBudgetExhausted(_)) => {}
        other => panic!("expected expander budget exhaustion, got {:?}", other),
    }
}

#[test]
fn an_aborted_run_stops_cleanly() {
    let mut scheduler = scheduler_for(
        sample::linear_two_aggregates(),
        ScriptedProvider::echo(),
        cfg(),
    );
    let stopper = Stopper::new();
    stopper.send_stop();
    match scheduler.run(stopper) {
        Err(StitchError::Abort) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

// Re-running an already satisfied topology must not re-reserve: the
// redo detection reports everything as already done.
#[test]
fn a_second_run_is_idempotent() {
    let mut scheduler = scheduler_for(
        sample::linear_three_aggregates(),
        ScriptedProvider::echo(),
        cfg(),
    );
    scheduler.run(Stopper::new()).unwrap();
    let allocations_before = scheduler.provider().allocate_calls.len();

    // mark everything for a recheck, as a ripple would
    let ids = scheduler.topology().agg_ids();
    for a in ids {
        scheduler.topology_mut().agg_mut(a).state = AggState::Pending;
    }
    let report = scheduler.run(Stopper::new()).unwrap();
    assert_eq!(
        scheduler.provider().allocate_calls.len(),
        allocations_before
    );
    for agg in &report.aggregates {
        assert_eq!(agg.state, AggState::Completed);
    }
}

#[test]
fn transient_failures_are_retried_in_place() {
    let mut provider = ScriptedProvider::echo();
    provider.push_action(
        &sample::url_of(sample::AGG_ONE),
        AllocateAction::Fail(ProviderError::new(
            crate::provider::TRANSPORT_ERROR,
            "connection reset",
        )),
    );
    let mut scheduler = scheduler_for(sample::linear_two_aggregates(), provider, cfg());
    let report = scheduler.run(Stopper::new()).unwrap();
    assert_eq!(report.pce_calls, 1);
    assert_eq!(report.total_allocations, 3);
    for agg in &report.aggregates {
        assert_eq!(agg.state, AggState::Completed);
    }
}
