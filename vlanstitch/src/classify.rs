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

//! # Provider error classification
//!
//! Providers report failures through a numeric code plus free-form text,
//! and much of the vocabulary is family dialect. This module maps a
//! [`ProviderError`] onto the small set of classes the scheduler and
//! negotiator act on, and parses the failure details (path, tag, link)
//! that some messages carry.
//!
//! The string patterns are surface-level by necessity; they are locked in
//! place by tests against recorded provider responses.

use crate::family::ProviderFamily;
use crate::provider::{ProviderError, TRANSPORT_ERROR};
use regex::Regex;

/// Protocol error code shared by all families for an unavailable VLAN.
pub const VLAN_UNAVAILABLE_CODE: i32 = 24;
/// Protocol error code for insufficient bandwidth.
pub const INSUFFICIENT_BANDWIDTH_CODE: i32 = 25;
/// Protocol error code for a busy provider.
pub const BUSY_CODE: i32 = 14;

/// What the scheduler should do with a provider error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The requested tag could not be honored; negotiate.
    VlanUnavailable,
    /// The provider is busy; poll again shortly.
    Busy,
    /// Transport-level or otherwise retriable failure; retry as-is.
    Transient,
    /// Retry the same aggregate immediately, without a grace sleep.
    RetryImmediately(String),
    /// Reservation cannot succeed at this aggregate as requested. The
    /// plan expander may route around it unless the user pinned it.
    Fatal(String),
    /// Unrecognized failure; give the plan expander a chance to produce
    /// a different plan.
    Escalate(String),
}

/// Messages a ProtoGENI provider uses for an unavailable VLAN.
const PG_VLAN_UNAVAILABLE_MSGS: [&str; 4] = [
    "Could not reserve vlan tags",
    "Error reserving vlan tag for ",
    "Could not find a free vlan tag for ",
    "Could not reserve a vlan tag for ",
];

/// Failure details parsed out of a provider error message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FailureDetail {
    /// The path (link) the provider named as failed.
    pub failed_path: Option<String>,
    /// The concrete tag the provider named as unavailable.
    pub failed_tag: Option<u16>,
}

/// Error classifier with its compiled message patterns.
#[derive(Debug)]
pub struct Classifier {
    pg_reserving_re: Regex,
    pg_free_tag_re: Regex,
    pg_reserve_a_tag_re: Regex,
    pg_tag_unavail_re: Regex,
    dcn_no_vlans_re: Regex,
    sliver_circuit_re: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Compile the message patterns.
    pub fn new() -> Self {
        Self {
            pg_reserving_re: Regex::new(r"^Error reserving vlan tag for '(.+)'").unwrap(),
            pg_free_tag_re: Regex::new(r"^Could not find a free vlan tag for '(.+)'").unwrap(),
            pg_reserve_a_tag_re: Regex::new(r"^Could not reserve a vlan tag for '(.+)'").unwrap(),
            pg_tag_unavail_re: Regex::new(r"^vlan tag (\d+) for '(.+)' not available").unwrap(),
            dcn_no_vlans_re: Regex::new(r"no VLANs available on link (\S+)").unwrap(),
            sliver_circuit_re: Regex::new(
                r"^urn:publicid:IDN\+[^+]+\+sliver\+.+_vlan_[^-]+-(\d+)$",
            )
            .unwrap(),
        }
    }

    /// Classify a provider error for an aggregate of the given family.
    /// `allocate_tries` disambiguates errors that are only retriable the
    /// first few times.
    pub fn classify(
        &self,
        err: &ProviderError,
        family: ProviderFamily,
        allocate_tries: u32,
    ) -> ErrorClass {
        if err.code == TRANSPORT_ERROR {
            return ErrorClass::Transient;
        }
        if err.code == BUSY_CODE || err.message.to_ascii_lowercase().contains("busy") {
            return ErrorClass::Busy;
        }
        if self.is_vlan_unavailable(err, family) {
            return ErrorClass::VlanUnavailable;
        }

        let am_code = err.am_code.unwrap_or(err.code);
        let is_pg = family == ProviderFamily::Pg || err.am_type.as_deref() == Some("protogeni");
        let msg = err.message.as_str();

        // Insufficient bandwidth is fatal at this aggregate for every family.
        if err.code == INSUFFICIENT_BANDWIDTH_CODE
            || (is_pg && am_code == INSUFFICIENT_BANDWIDTH_CODE)
        {
            return ErrorClass::Fatal(format!(
                "insufficient bandwidth for the request: {}",
                msg
            ));
        }

        if is_pg {
            if let Some(class) = self.classify_pg(err, am_code) {
                return class;
            }
        }
        match family {
            ProviderFamily::Eg => {
                if let Some(class) = self.classify_eg(msg) {
                    return class;
                }
            }
            ProviderFamily::Dcn => {
                if let Some(class) = self.classify_dcn(err, am_code, allocate_tries) {
                    return class;
                }
            }
            ProviderFamily::Gram => {
                if msg.contains("Rspec error: VM with name ") && msg.contains(" already exists") {
                    return ErrorClass::Fatal(format!(
                        "a reservation with this node client_id already exists here: {}",
                        msg
                    ));
                }
            }
            _ => {}
        }

        ErrorClass::Escalate(format!("circuit reservation failed: {}", err))
    }

    /// True when the error is one of the recognized VLAN-unavailability
    /// signatures. The negotiator refuses to locally re-pick tags for
    /// anything else.
    pub fn is_vlan_unavailable(&self, err: &ProviderError, family: ProviderFamily) -> bool {
        if err.code == VLAN_UNAVAILABLE_CODE {
            return true;
        }
        let am_code = err.am_code.unwrap_or(err.code);
        let is_pg = family == ProviderFamily::Pg || err.am_type.as_deref() == Some("protogeni");
        let msg = err.message.as_str();
        if is_pg {
            if am_code == VLAN_UNAVAILABLE_CODE {
                return true;
            }
            let code_matches = (err.code == 1 || err.code == 2)
                && (am_code == 1 || am_code == 2 || am_code == VLAN_UNAVAILABLE_CODE);
            if code_matches
                && (PG_VLAN_UNAVAILABLE_MSGS.iter().any(|p| msg.contains(*p))
                    || (msg.contains("vlan tag ") && msg.contains(" not available")))
            {
                return true;
            }
        }
        if family == ProviderFamily::Eg
            && msg.contains("Error in building the dependency tree, probably not available vlan path")
        {
            return true;
        }
        false
    }

    fn classify_pg(&self, err: &ProviderError, am_code: i32) -> Option<ErrorClass> {
        let msg = err.message.as_str();
        let val = err.value.as_str();
        let code = err.code;
        if code == 2 && am_code == 2 && msg.contains("does not run on this hardware type") {
            return Some(ErrorClass::Fatal(format!(
                "requested sliver type cannot run on this hardware: {}",
                msg
            )));
        }
        let mapper = val.starts_with("Could not map to resources")
            || msg.starts_with("*** ERROR: mapper")
            || msg.contains("Could not verify topo")
            || msg.contains("Inconsistent ifacemap")
            || msg.contains("Not enough bandwidth to connect some nodes")
            || msg.contains("Too many VMs requested on physical host")
            || msg.contains("Not enough nodes with fast enough interfaces");
        if am_code == 25 || am_code == 26 || ((code == 2 || code == 26) && mapper) {
            return Some(ErrorClass::Fatal(format!(
                "malformed request or insufficient resources: {}",
                msg
            )));
        }
        if code == 6 && am_code == 6 && msg.starts_with("Hostname > 63 char") {
            return Some(ErrorClass::Fatal(format!(
                "hostname too long; use a shorter client_id or slice name: {}",
                msg
            )));
        }
        if code == 1 && am_code == 1 && msg.starts_with("Duplicate link ") {
            return Some(ErrorClass::Fatal(format!("duplicate link in request: {}", msg)));
        }
        if code == 7 && am_code == 7 && msg.contains("Must delete existing sli") {
            return Some(ErrorClass::Fatal(format!(
                "a reservation already exists in this slice here; delete it first: {}",
                msg
            )));
        }
        if code == 1 && am_code == 1 && msg == "Malformed keys" {
            return Some(ErrorClass::Fatal("malformed SSH keys".to_string()));
        }
        if code == 1 && am_code == 1 && msg == "Signer certificate does not have a URL" {
            return Some(ErrorClass::Fatal(
                "signer certificate has no URL; use a different authority".to_string(),
            ));
        }
        if code == 2 && am_code == 2 && msg.contains("Edge iface mismatch when stitching") {
            return Some(ErrorClass::Fatal(format!(
                "two nodes at one aggregate share a named link: {}",
                msg
            )));
        }
        if code == 2 && am_code == 2 && msg.contains("no edge hop") {
            return Some(ErrorClass::Fatal(format!(
                "the aggregate has no interface on the named link: {}",
                msg
            )));
        }
        if code == 2 && am_code == 2 && msg.contains("Need node id for links") {
            return Some(ErrorClass::Fatal(format!(
                "a link client_id likely has a typo: {}",
                msg
            )));
        }
        if code == 2
            && am_code == 2
            && (msg.contains("No possible mapping for ") || val.contains("Could not map to resources"))
        {
            return Some(ErrorClass::Fatal(format!("malformed request: {}", msg)));
        }
        None
    }

    fn classify_eg(&self, msg: &str) -> Option<ErrorClass> {
        if msg.contains("edge domain does not exist")
            || msg.contains("check_image_size error")
            || msg.contains("incorrect image URL in ImageProxy")
            || msg.contains("Insufficient numCPUCores")
        {
            return Some(ErrorClass::Fatal(format!(
                "sliver status contained a fatal provisioning error: {}",
                msg
            )));
        }
        None
    }

    fn classify_dcn(
        &self,
        err: &ProviderError,
        am_code: i32,
        allocate_tries: u32,
    ) -> Option<ErrorClass> {
        let msg = err.message.as_str();
        // An SFA-based provider rejects the first request from a project it
        // has never seen; the second attempt succeeds.
        if msg.contains("AddPersonToSite: Invalid argument: No such site") && allocate_tries < 4 {
            return Some(ErrorClass::RetryImmediately(format!(
                "provider had not seen this project before, retrying: {}",
                msg
            )));
        }
        if err.code == 7 && am_code == 7 && msg.contains("CreateSliver: Existing record") {
            return Some(ErrorClass::Fatal(format!(
                "a reservation already exists in this slice here: {}",
                msg
            )));
        }
        if err.code == 5
            && am_code == 5
            && msg.contains("AddSite: Invalid argument: Login base must be specified")
        {
            return Some(ErrorClass::Fatal(format!(
                "project name not usable here; try a shorter name without hyphens: {}",
                msg
            )));
        }
        if err.code == 5 && am_code == 5 && msg.starts_with("Internal API error") {
            return Some(ErrorClass::Fatal(format!(
                "provider had an internal error: {}",
                msg
            )));
        }
        None
    }

    /// Parse the failed path (and tag, when named) out of a ProtoGENI
    /// VLAN-unavailability message.
    pub fn parse_failure_detail(&self, err: &ProviderError) -> FailureDetail {
        let msg = err.message.as_str();
        let mut detail = FailureDetail::default();
        if let Some(caps) = self.pg_tag_unavail_re.captures(msg) {
            detail.failed_tag = caps.get(1).and_then(|m| m.as_str().parse().ok());
            detail.failed_path = caps.get(2).map(|m| m.as_str().trim().to_string());
            return detail;
        }
        for re in &[
            &self.pg_reserving_re,
            &self.pg_free_tag_re,
            &self.pg_reserve_a_tag_re,
        ] {
            if let Some(caps) = re.captures(msg) {
                detail.failed_path = caps.get(1).map(|m| m.as_str().trim().to_string());
                return detail;
            }
        }
        detail
    }

    /// True when a delayed-commit provider's failed sliver status means the
    /// VLAN path could not be set up (and the reservation must be treated
    /// as a VLAN-unavailability failure).
    pub fn is_dcn_vlan_failure(&self, status_msg: &str) -> bool {
        self.dcn_no_vlans_re.is_match(status_msg) && status_msg.contains("PCE_CREATE_FAILED")
    }

    /// The link name out of a delayed-commit "no VLANs available" status
    /// message.
    pub fn parse_dcn_failed_link(&self, status_msg: &str) -> Option<String> {
        self.dcn_no_vlans_re
            .captures(status_msg)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Derive a circuit id from a sliver URN.
    pub fn parse_circuit_id(&self, sliver_urn: &str) -> Option<String> {
        self.sliver_circuit_re
            .captures(sliver_urn)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}
