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

//! Demo driver: runs the reservation engine against scripted providers.

use clap::{Parser, Subcommand};
use log::*;
use std::error::Error;
use std::path::PathBuf;
use vlanstitch::provider::{PlanDoc, ProviderError};
use vlanstitch::sample::{
    self, status_failed, status_not_ready, AllocateAction, EchoCodec, ScriptedExpander,
    ScriptedProvider,
};
use vlanstitch::scheduler::{Scheduler, SchedulerConfig, StitchReport};
use vlanstitch::Stopper;

#[derive(Parser)]
#[clap(name = "vlanstitch", about = "Reserve a multi-segment VLAN circuit (demo scenarios)")]
struct CommandLineArguments {
    /// RNG seed for tag picks
    #[clap(long)]
    seed: Option<u64>,
    /// Directory to save per-attempt request documents into
    #[clap(long)]
    artifact_dir: Option<PathBuf>,
    /// Slice name used in provider calls
    #[clap(long, default_value = "demo-slice")]
    slice: String,
    #[clap(subcommand)]
    cmd: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Linear two-aggregate path; everything succeeds first try
    Linear,
    /// The downstream aggregate rejects the first tag; redo from the root
    Retry,
    /// Non-translating pair renegotiating its shared tag
    SharedTag,
    /// A provider delivers a tag nobody asked for; replan via the expander
    Replan,
    /// Delayed-commit provider fails through status polling, then retries
    Dcn,
}

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();
    let args = CommandLineArguments::parse();

    let cfg = SchedulerConfig {
        slice_name: args.slice.clone(),
        artifact_dir: args.artifact_dir.clone(),
        suppress_waits: true,
        seed: args.seed,
        ..SchedulerConfig::default()
    };

    let (plan, provider) = match args.cmd {
        Scenario::Linear => (sample::linear_two_aggregates(), ScriptedProvider::echo()),
        Scenario::Retry => {
            let mut provider = ScriptedProvider::echo();
            provider.push_action(
                &sample::url_of(sample::AGG_TWO),
                AllocateAction::Fail(ProviderError::new(24, "vlan tag not available")),
            );
            (sample::linear_two_aggregates(), provider)
        }
        Scenario::SharedTag => {
            let mut provider = ScriptedProvider::echo();
            provider.push_action(
                &sample::url_of(sample::AGG_TWO),
                AllocateAction::Fail(ProviderError::new(24, "vlan tag not available")),
            );
            (sample::no_translation_pair(), provider)
        }
        Scenario::Replan => {
            let mut plan = sample::linear_two_aggregates();
            plan.paths[0].hops[0].suggested = vlanstitch::vlan::VlanRange::parse("150")?;
            plan.paths[0].hops[0].producer = false;
            let mut provider = ScriptedProvider::echo();
            let mut grant = std::collections::BTreeMap::new();
            grant.insert("1".to_string(), 175);
            provider.push_action(
                &sample::url_of(sample::AGG_ONE),
                AllocateAction::EchoWith(grant),
            );
            (plan, provider)
        }
        Scenario::Dcn => {
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
            (sample::single_dcn_aggregate(), provider)
        }
    };

    info!("Reserving the circuit...");
    let mut scheduler = Scheduler::new(
        PlanDoc("demo request".to_string()),
        provider,
        ScriptedExpander::fixed(plan),
        EchoCodec,
        cfg,
    )?;

    match scheduler.run(Stopper::new()) {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            error!("Reservation failed: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_report(report: &StitchReport) {
    println!(
        "Circuit reserved: {} aggregate(s), {} allocation attempt(s), {} expander call(s)",
        report.aggregates.len(),
        report.total_allocations,
        report.pce_calls
    );
    for agg in &report.aggregates {
        println!("  {} [{:?}]", agg.urn, agg.state);
        for hop in &agg.hops {
            match (hop.tag, &hop.circuit_id) {
                (Some(tag), Some(cid)) => {
                    println!("    {} on {}: tag {} (circuit {})", hop.urn, hop.path, tag, cid)
                }
                (Some(tag), None) => println!("    {} on {}: tag {}", hop.urn, hop.path, tag),
                _ => println!("    {} on {}: no tag committed", hop.urn, hop.path),
            }
        }
    }
}
