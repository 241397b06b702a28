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

//! # External collaborator interfaces
//!
//! The engine talks to three external parties, each behind a trait so the
//! test suite can script them: the per-aggregate RPC client
//! ([`ProviderClient`]), the path computation service ([`PlanExpander`]),
//! and the request/manifest document codec ([`RspecCodec`]). Documents are
//! opaque newtypes over strings; the engine never inspects their contents
//! outside the codec.

use crate::error::StitchError;
use crate::family::ProviderFamily;
use crate::vlan::VlanRange;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The expanded plan document as produced by the plan expander. Spliced
/// per aggregate into a [`RequestDoc`] before each reservation RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDoc(pub String);

/// A provider-facing request document with tag choices spliced in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDoc(pub String);

/// A manifest document returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDoc(pub String);

/// A typed provider error, as surfaced by the RPC layer.
///
/// `code` is the protocol-level error code (`24` denotes an unavailable
/// VLAN across families); `am_code` and `am_type` carry the provider's own
/// code and family tag when present. Transport-level failures (connection
/// refused, RPC timeout) are surfaced with `code == TRANSPORT_ERROR`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("provider error {code} (am {am_code:?} {am_type:?}): {message}")]
pub struct ProviderError {
    /// Protocol error code.
    pub code: i32,
    /// Provider-specific error code, if the provider reported one.
    pub am_code: Option<i32>,
    /// Provider family tag as reported by the provider itself.
    pub am_type: Option<String>,
    /// Human-readable provider message.
    pub message: String,
    /// Additional provider payload, if any.
    pub value: String,
}

/// Sentinel `code` for transport-level failures the RPC layer could not
/// attribute to the provider (timeouts, connection errors).
pub const TRANSPORT_ERROR: i32 = -1;

impl ProviderError {
    /// A bare error with only a protocol code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ProviderError {
            code,
            am_code: None,
            am_type: None,
            message: message.into(),
            value: String::new(),
        }
    }

    /// Attach a provider-specific code and family tag.
    pub fn with_am(mut self, am_code: i32, am_type: &str) -> Self {
        self.am_code = Some(am_code);
        self.am_type = Some(am_type.to_string());
        self
    }
}

/// Successful reply of an allocate RPC. For API version 3 providers the
/// client has already extracted the manifest from the wrapping structure
/// (`value.geni_rspec` of the single-URL entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateReply {
    /// The manifest document describing what was reserved.
    pub manifest: ManifestDoc,
    /// A provider-side log URL, when the provider exposes one.
    pub provider_log_url: Option<String>,
    /// The provider's self-reported family tag, used to correct the
    /// URN-derived family guess.
    pub am_type: Option<String>,
    /// Sliver expiration timestamps found in the reply, verbatim.
    pub sliver_expirations: Vec<String>,
}

/// Per-sliver state as reported by a status RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliverState {
    /// The circuit is up.
    Ready,
    /// The circuit failed; the per-sliver error message says why.
    Failed,
    /// Allocated but not yet provisioned.
    Allocated,
    /// Provisioned, not yet ready.
    Provisioned,
    /// Not ready yet, keep polling.
    NotReady,
    /// Anything the client could not map.
    Unknown,
}

impl fmt::Display for SliverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SliverState::Ready => "ready",
            SliverState::Failed => "failed",
            SliverState::Allocated => "allocated",
            SliverState::Provisioned => "provisioned",
            SliverState::NotReady => "notready",
            SliverState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One sliver entry of a status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliverStatus {
    /// The sliver URN; circuit ids are derived from it.
    pub urn: String,
    /// The sliver state.
    pub state: SliverState,
    /// The provider's per-sliver error message, if any.
    pub error: Option<String>,
}

/// Reply of a status RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    /// Overall reservation state.
    pub overall: SliverState,
    /// Per-sliver detail.
    pub slivers: Vec<SliverStatus>,
}

/// Blocking RPC client for one or more resource providers.
///
/// All calls take the provider URL and API version explicitly so a single
/// client instance can serve every aggregate of a run.
pub trait ProviderClient {
    /// Reserve resources. Returns the manifest (or extracted manifest for
    /// API version 3) on success.
    fn allocate(
        &mut self,
        url: &str,
        api_version: u8,
        slice: &str,
        request: &RequestDoc,
    ) -> Result<AllocateReply, ProviderError>;

    /// Query reservation status.
    fn status(&mut self, url: &str, api_version: u8, slice: &str)
        -> Result<StatusReply, ProviderError>;

    /// Delete any reservation. Idempotent: "nothing to delete" is success.
    fn delete(&mut self, url: &str, api_version: u8, slice: &str) -> Result<(), ProviderError>;

    /// Fetch the current manifest for an existing reservation.
    fn describe(
        &mut self,
        url: &str,
        api_version: u8,
        slice: &str,
    ) -> Result<ManifestDoc, ProviderError>;
}

/// One hop of one path in an expanded plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPlan {
    /// Stable hop identifier, unique within its path.
    pub hop_id: String,
    /// Interface URN; may repeat across paths at one aggregate.
    pub urn: String,
    /// URN of the owning aggregate.
    pub aggregate_urn: String,
    /// Whether this hop can translate tags between its two sides.
    pub xlates: bool,
    /// Whether this hop may freely produce a tag.
    pub producer: bool,
    /// Whether this hop must be given a tag.
    pub consumer: bool,
    /// Whether this hop adopts the tag chosen upstream.
    pub import_vlans: bool,
    /// `hop_id` of the upstream hop whose manifest seeds this hop.
    pub import_from: Option<String>,
    /// Tag suggested by the plan expander.
    pub suggested: VlanRange,
    /// Tag range advised by the plan expander.
    pub range: VlanRange,
}

/// One path of an expanded plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPlan {
    /// Path (link) identifier.
    pub id: String,
    /// Opaque global circuit id, when the expander assigns one.
    pub global_id: Option<String>,
    /// Hops in path order.
    pub hops: Vec<HopPlan>,
}

/// One aggregate of an expanded plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatePlan {
    /// Aggregate URN.
    pub urn: String,
    /// Provider RPC endpoint.
    pub url: String,
    /// Provider API version (2 or 3).
    pub api_version: u8,
    /// True if the user pinned this aggregate; the expander must not
    /// route around it and fatal errors here go to the user.
    pub user_requested: bool,
    /// URNs of aggregates that must complete before this one.
    pub depends_on: Vec<String>,
}

/// The expanded plan: the document to splice requests from, plus the hop
/// graph the engine schedules over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedPlan {
    /// The expanded request document.
    pub request: PlanDoc,
    /// Paths with their hops.
    pub paths: Vec<PathPlan>,
    /// Participating aggregates.
    pub aggregates: Vec<AggregatePlan>,
}

/// Path computation service adapter. Deterministic for fixed inputs.
pub trait PlanExpander {
    /// Expand a request into a plan, routing around `exclude_hops`
    /// (interface URNs) and honoring per-hop unavailable-tag hints.
    fn expand(
        &mut self,
        request: &PlanDoc,
        exclude_hops: &[String],
        hop_unavailable: &BTreeMap<String, VlanRange>,
    ) -> Result<ExpandedPlan, StitchError>;
}

/// Tag state of one hop as spliced into a request document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopTagRequest {
    /// Path the hop belongs to.
    pub path_id: String,
    /// Stable hop id within the path.
    pub hop_id: String,
    /// Interface URN.
    pub urn: String,
    /// `suggestedVLANRange` to write.
    pub suggested: VlanRange,
    /// `vlanRangeAvailability` to write.
    pub range: VlanRange,
}

/// Per-hop tag values extracted from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopManifest {
    /// The `suggestedVLANRange` the provider committed to.
    pub suggested: VlanRange,
    /// The `vlanRangeAvailability` the provider reported.
    pub range: VlanRange,
    /// Global circuit id found alongside the hop, if any.
    pub global_id: Option<String>,
}

/// Opaque request/manifest codec.
///
/// The engine hands it the current per-hop tag choices and gets back a
/// provider-facing document; after a reservation it hands back the
/// manifest and a hop address and gets the delivered tags. Locating a hop
/// is family-dependent: the EG family rewrites hop ids in manifests, so
/// lookups there go by the underlying link URN instead, and may legitimately
/// find nothing (`Ok(None)`) for aggregate-internal extension hops.
pub trait RspecCodec {
    /// Splice per-hop tag requests into the plan document, producing the
    /// request for one aggregate.
    fn splice(&self, plan: &PlanDoc, requests: &[HopTagRequest])
        -> Result<RequestDoc, StitchError>;

    /// Extract the delivered tags for one hop. Returns `Ok(None)` when the
    /// hop cannot be located in the manifest.
    fn parse_manifest(
        &self,
        manifest: &ManifestDoc,
        path_id: &str,
        hop_id: &str,
        link_urn: &str,
        family: ProviderFamily,
    ) -> Result<Option<HopManifest>, StitchError>;
}
