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

//! # Prepared plans and scripted collaborators
//!
//! A collection of small stitching scenarios, plus provider/expander/codec
//! implementations driven from queued replies. The test suite exercises
//! the engine against these, and the demo binary runs them end to end.
//!
//! The scripted documents use a trivial line format (one `hop|…` line per
//! hop) so the "XML" stays opaque to the engine while remaining easy to
//! assert on in tests.

use crate::error::StitchError;
use crate::family::ProviderFamily;
use crate::provider::{
    AggregatePlan, AllocateReply, ExpandedPlan, HopManifest, HopPlan, HopTagRequest, ManifestDoc,
    PathPlan, PlanDoc, ProviderClient, ProviderError, RequestDoc, RspecCodec, SliverState,
    SliverStatus, StatusReply,
};
use crate::vlan::VlanRange;
use std::collections::{BTreeMap, VecDeque};

fn vr(s: &str) -> VlanRange {
    match VlanRange::parse(s) {
        Ok(r) => r,
        Err(_) => VlanRange::empty(),
    }
}

fn hop_plan(
    hop_id: &str,
    urn: &str,
    agg_urn: &str,
    xlates: bool,
    producer: bool,
    import_from: Option<&str>,
    suggested: &str,
    range: &str,
) -> HopPlan {
    HopPlan {
        hop_id: hop_id.to_string(),
        urn: urn.to_string(),
        aggregate_urn: agg_urn.to_string(),
        xlates,
        producer,
        consumer: !producer,
        import_vlans: import_from.is_some(),
        import_from: import_from.map(|s| s.to_string()),
        suggested: vr(suggested),
        range: vr(range),
    }
}

fn agg_plan(urn: &str, url: &str) -> AggregatePlan {
    AggregatePlan {
        urn: urn.to_string(),
        url: url.to_string(),
        api_version: 2,
        user_requested: false,
        depends_on: Vec::new(),
    }
}

/// URN of the first sample aggregate.
pub const AGG_ONE: &str = "urn:publicid:IDN+agg-one+authority+am";
/// URN of the second sample aggregate.
pub const AGG_TWO: &str = "urn:publicid:IDN+agg-two+authority+am";
/// URN of the third sample aggregate.
pub const AGG_THREE: &str = "urn:publicid:IDN+agg-three+authority+am";
/// URN of the delayed-commit sample aggregate.
pub const AGG_DCN: &str = "urn:publicid:IDN+dcn-core+authority+am";
/// URN of the ProtoGENI-flavored sample aggregate.
pub const AGG_PG: &str = "urn:publicid:IDN+emulab-site+authority+cm";

/// Endpoint for a sample aggregate URN.
pub fn url_of(urn: &str) -> String {
    format!("https://{}/rpc", urn)
}

/// A linear path across two translating aggregates: the first is free to
/// pick a tag, the second imports it.
pub fn linear_two_aggregates() -> ExpandedPlan {
    ExpandedPlan {
        request: PlanDoc("plan linear-two".to_string()),
        paths: vec![PathPlan {
            id: "link-one-two".to_string(),
            global_id: None,
            hops: vec![
                hop_plan("1", "urn:ifc+agg-one+if0", AGG_ONE, true, true, None, "any", "100-200"),
                hop_plan(
                    "2",
                    "urn:ifc+agg-two+if0",
                    AGG_TWO,
                    true,
                    false,
                    Some("1"),
                    "any",
                    "100-200",
                ),
            ],
        }],
        aggregates: vec![
            agg_plan(AGG_ONE, &url_of(AGG_ONE)),
            agg_plan(AGG_TWO, &url_of(AGG_TWO)),
        ],
    }
}

/// A linear path across three translating aggregates, imports chained.
pub fn linear_three_aggregates() -> ExpandedPlan {
    ExpandedPlan {
        request: PlanDoc("plan linear-three".to_string()),
        paths: vec![PathPlan {
            id: "link-one-three".to_string(),
            global_id: None,
            hops: vec![
                hop_plan("1", "urn:ifc+agg-one+if0", AGG_ONE, true, true, None, "any", "100-200"),
                hop_plan(
                    "2",
                    "urn:ifc+agg-two+if0",
                    AGG_TWO,
                    true,
                    false,
                    Some("1"),
                    "any",
                    "100-200",
                ),
                hop_plan(
                    "3",
                    "urn:ifc+agg-three+if0",
                    AGG_THREE,
                    true,
                    false,
                    Some("2"),
                    "any",
                    "100-200",
                ),
            ],
        }],
        aggregates: vec![
            agg_plan(AGG_ONE, &url_of(AGG_ONE)),
            agg_plan(AGG_TWO, &url_of(AGG_TWO)),
            agg_plan(AGG_THREE, &url_of(AGG_THREE)),
        ],
    }
}

/// Two aggregates on one path, neither able to translate: both must end
/// up with the same tag. The first may pick freely.
pub fn no_translation_pair() -> ExpandedPlan {
    ExpandedPlan {
        request: PlanDoc("plan no-xlate-pair".to_string()),
        paths: vec![PathPlan {
            id: "link-shared-tag".to_string(),
            global_id: None,
            hops: vec![
                hop_plan("1", "urn:ifc+agg-one+if0", AGG_ONE, false, true, None, "any", "100-200"),
                hop_plan(
                    "2",
                    "urn:ifc+agg-two+if0",
                    AGG_TWO,
                    false,
                    false,
                    Some("1"),
                    "any",
                    "100-220",
                ),
            ],
        }],
        aggregates: vec![
            agg_plan(AGG_ONE, &url_of(AGG_ONE)),
            agg_plan(AGG_TWO, &url_of(AGG_TWO)),
        ],
    }
}

/// One aggregate carrying two paths over the same interface; the tags on
/// the two paths must differ.
pub fn two_paths_same_interface() -> ExpandedPlan {
    ExpandedPlan {
        request: PlanDoc("plan same-interface".to_string()),
        paths: vec![
            PathPlan {
                id: "circuit-a".to_string(),
                global_id: None,
                hops: vec![hop_plan(
                    "1",
                    "urn:ifc+agg-one+trunk",
                    AGG_ONE,
                    true,
                    false,
                    None,
                    "100",
                    "100-110",
                )],
            },
            PathPlan {
                id: "circuit-b".to_string(),
                global_id: None,
                hops: vec![hop_plan(
                    "1",
                    "urn:ifc+agg-one+trunk",
                    AGG_ONE,
                    true,
                    false,
                    None,
                    "101",
                    "100-110",
                )],
            },
        ],
        aggregates: vec![agg_plan(AGG_ONE, &url_of(AGG_ONE))],
    }
}

/// The same two-path shape at a ProtoGENI-flavored aggregate, where tags
/// must differ across paths even on different interfaces.
pub fn pg_two_paths() -> ExpandedPlan {
    ExpandedPlan {
        request: PlanDoc("plan pg-two-paths".to_string()),
        paths: vec![
            PathPlan {
                id: "circuit-a".to_string(),
                global_id: None,
                hops: vec![hop_plan(
                    "1",
                    "urn:ifc+emulab-site+if0",
                    AGG_PG,
                    true,
                    false,
                    None,
                    "100",
                    "100-110",
                )],
            },
            PathPlan {
                id: "circuit-b".to_string(),
                global_id: None,
                hops: vec![hop_plan(
                    "1",
                    "urn:ifc+emulab-site+if1",
                    AGG_PG,
                    true,
                    false,
                    None,
                    "101",
                    "100-110",
                )],
            },
        ],
        aggregates: vec![agg_plan(AGG_PG, &url_of(AGG_PG))],
    }
}

/// A single delayed-commit aggregate with one concrete-tag hop.
pub fn single_dcn_aggregate() -> ExpandedPlan {
    ExpandedPlan {
        request: PlanDoc("plan dcn-single".to_string()),
        paths: vec![PathPlan {
            id: "link-ion".to_string(),
            global_id: None,
            hops: vec![hop_plan(
                "1",
                "urn:ifc+dcn-core+if0",
                AGG_DCN,
                true,
                false,
                None,
                "150",
                "100-200",
            )],
        }],
        aggregates: vec![agg_plan(AGG_DCN, &url_of(AGG_DCN))],
    }
}

/// One line of a scripted request or manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocLine {
    /// Path the hop belongs to.
    pub path_id: String,
    /// Stable hop id within the path.
    pub hop_id: String,
    /// Interface URN.
    pub urn: String,
    /// Suggested tag field.
    pub suggested: VlanRange,
    /// Availability range field.
    pub range: VlanRange,
    /// Optional circuit id.
    pub global_id: Option<String>,
}

impl DocLine {
    fn format(&self) -> String {
        match &self.global_id {
            Some(gid) => format!(
                "hop|{}|{}|{}|{}|{}|{}",
                self.path_id, self.hop_id, self.urn, self.suggested, self.range, gid
            ),
            None => format!(
                "hop|{}|{}|{}|{}|{}",
                self.path_id, self.hop_id, self.urn, self.suggested, self.range
            ),
        }
    }
}

/// Parse the `hop|…` lines out of a scripted document body.
pub fn parse_doc_lines(doc: &str) -> Result<Vec<DocLine>, StitchError> {
    let mut lines = Vec::new();
    for line in doc.lines() {
        if !line.starts_with("hop|") {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 6 {
            return Err(StitchError::InternalInconsistent(format!(
                "malformed scripted document line: {}",
                line
            )));
        }
        lines.push(DocLine {
            path_id: fields[1].to_string(),
            hop_id: fields[2].to_string(),
            urn: fields[3].to_string(),
            suggested: VlanRange::parse(fields[4])?,
            range: VlanRange::parse(fields[5])?,
            global_id: fields.get(6).map(|s| s.to_string()),
        });
    }
    Ok(lines)
}

/// Line-format codec for the scripted documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCodec;

impl RspecCodec for EchoCodec {
    fn splice(
        &self,
        plan: &PlanDoc,
        requests: &[HopTagRequest],
    ) -> Result<RequestDoc, StitchError> {
        let mut body = format!("request from {}\n", plan.0);
        for req in requests {
            let line = DocLine {
                path_id: req.path_id.clone(),
                hop_id: req.hop_id.clone(),
                urn: req.urn.clone(),
                suggested: req.suggested.clone(),
                range: req.range.clone(),
                global_id: None,
            };
            body.push_str(&line.format());
            body.push('\n');
        }
        Ok(RequestDoc(body))
    }

    fn parse_manifest(
        &self,
        manifest: &ManifestDoc,
        path_id: &str,
        hop_id: &str,
        link_urn: &str,
        family: ProviderFamily,
    ) -> Result<Option<HopManifest>, StitchError> {
        let lines = parse_doc_lines(&manifest.0)?;
        let found = lines.into_iter().find(|l| {
            if family == ProviderFamily::Eg {
                // ExoGENI manifests rewrite hop ids; locate by link URN
                l.urn == link_urn
            } else {
                l.path_id == path_id && l.hop_id == hop_id
            }
        });
        Ok(found.map(|l| HopManifest {
            suggested: l.suggested,
            range: l.range,
            global_id: l.global_id,
        }))
    }
}

/// What a scripted provider should do with one allocate call.
#[derive(Debug, Clone)]
pub enum AllocateAction {
    /// Grant exactly what was requested; a free choice gets the smallest
    /// tag of the offered range.
    Echo,
    /// Like `Echo`, but override the granted tag for the named hop ids.
    EchoWith(BTreeMap<String, u16>),
    /// Fail with a provider error.
    Fail(ProviderError),
    /// Return a fully scripted reply.
    Reply(AllocateReply),
}

/// A provider client driven by queued per-endpoint actions. Endpoints
/// without a queue (or with a drained one) behave as [`AllocateAction::Echo`].
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    actions: BTreeMap<String, VecDeque<AllocateAction>>,
    status: BTreeMap<String, VecDeque<Result<StatusReply, ProviderError>>>,
    describe: BTreeMap<String, VecDeque<ManifestDoc>>,
    last_manifest: BTreeMap<String, ManifestDoc>,
    am_types: BTreeMap<String, String>,
    /// Every allocate call, in order.
    pub allocate_calls: Vec<(String, RequestDoc)>,
    /// Every delete call, in order.
    pub delete_calls: Vec<String>,
    /// Every status call, in order.
    pub status_calls: Vec<String>,
}

impl ScriptedProvider {
    /// A provider that echoes every request.
    pub fn echo() -> Self {
        ScriptedProvider::default()
    }

    /// Queue an action for an endpoint.
    pub fn push_action(&mut self, url: &str, action: AllocateAction) {
        self.actions.entry(url.to_string()).or_default().push_back(action);
    }

    /// Queue a status reply for an endpoint.
    pub fn push_status(&mut self, url: &str, reply: Result<StatusReply, ProviderError>) {
        self.status.entry(url.to_string()).or_default().push_back(reply);
    }

    /// Queue a describe manifest for an endpoint.
    pub fn push_describe(&mut self, url: &str, doc: ManifestDoc) {
        self.describe.entry(url.to_string()).or_default().push_back(doc);
    }

    /// Report this `am_type` in replies from an endpoint.
    pub fn set_am_type(&mut self, url: &str, am_type: &str) {
        self.am_types.insert(url.to_string(), am_type.to_string());
    }

    /// Number of allocate calls made against an endpoint.
    pub fn allocates_at(&self, url: &str) -> usize {
        self.allocate_calls.iter().filter(|(u, _)| u == url).count()
    }

    fn echo_manifest(
        request: &RequestDoc,
        overrides: Option<&BTreeMap<String, u16>>,
    ) -> Result<ManifestDoc, StitchError> {
        let mut body = String::from("manifest\n");
        for line in parse_doc_lines(&request.0)? {
            let granted = overrides
                .and_then(|o| o.get(&line.hop_id).copied())
                .or_else(|| line.suggested.single_tag())
                .or_else(|| line.range.min_tag());
            let suggested = match granted {
                Some(tag) => VlanRange::single(tag),
                None => VlanRange::Any,
            };
            let out = DocLine {
                suggested,
                ..line
            };
            body.push_str(&out.format());
            body.push('\n');
        }
        Ok(ManifestDoc(body))
    }
}

/// A ready status reply with no per-sliver detail.
pub fn status_ready() -> StatusReply {
    StatusReply {
        overall: SliverState::Ready,
        slivers: Vec::new(),
    }
}

/// A not-ready status reply.
pub fn status_not_ready() -> StatusReply {
    StatusReply {
        overall: SliverState::NotReady,
        slivers: Vec::new(),
    }
}

/// A failed status reply carrying one sliver error message.
pub fn status_failed(sliver_urn: &str, message: &str) -> StatusReply {
    StatusReply {
        overall: SliverState::Failed,
        slivers: vec![SliverStatus {
            urn: sliver_urn.to_string(),
            state: SliverState::Failed,
            error: Some(message.to_string()),
        }],
    }
}

impl ProviderClient for ScriptedProvider {
    fn allocate(
        &mut self,
        url: &str,
        _api_version: u8,
        _slice: &str,
        request: &RequestDoc,
    ) -> Result<AllocateReply, ProviderError> {
        self.allocate_calls.push((url.to_string(), request.clone()));
        let action = self
            .actions
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or(AllocateAction::Echo);
        let reply = match action {
            AllocateAction::Echo => {
                let manifest = Self::echo_manifest(request, None)
                    .map_err(|e| ProviderError::new(2, e.to_string()))?;
                AllocateReply {
                    manifest,
                    provider_log_url: None,
                    am_type: self.am_types.get(url).cloned(),
                    sliver_expirations: Vec::new(),
                }
            }
            AllocateAction::EchoWith(overrides) => {
                let manifest = Self::echo_manifest(request, Some(&overrides))
                    .map_err(|e| ProviderError::new(2, e.to_string()))?;
                AllocateReply {
                    manifest,
                    provider_log_url: None,
                    am_type: self.am_types.get(url).cloned(),
                    sliver_expirations: Vec::new(),
                }
            }
            AllocateAction::Fail(err) => return Err(err),
            AllocateAction::Reply(reply) => reply,
        };
        self.last_manifest.insert(url.to_string(), reply.manifest.clone());
        Ok(reply)
    }

    fn status(
        &mut self,
        url: &str,
        _api_version: u8,
        _slice: &str,
    ) -> Result<StatusReply, ProviderError> {
        self.status_calls.push(url.to_string());
        self.status
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(status_ready()))
    }

    fn delete(&mut self, url: &str, _api_version: u8, _slice: &str) -> Result<(), ProviderError> {
        self.delete_calls.push(url.to_string());
        Ok(())
    }

    fn describe(
        &mut self,
        url: &str,
        _api_version: u8,
        _slice: &str,
    ) -> Result<ManifestDoc, ProviderError> {
        if let Some(doc) = self.describe.get_mut(url).and_then(|q| q.pop_front()) {
            return Ok(doc);
        }
        self.last_manifest
            .get(url)
            .cloned()
            .ok_or_else(|| ProviderError::new(12, "nothing reserved here"))
    }
}

/// One recorded call to the scripted expander.
#[derive(Debug, Clone)]
pub struct ExpandCall {
    /// Interface URNs the caller asked to route around.
    pub exclude: Vec<String>,
    /// Per-URN unavailable-tag hints.
    pub unavailable: BTreeMap<String, VlanRange>,
}

/// A plan expander answering from a queue of prepared plans. The last
/// plan is repeated once the queue drains.
#[derive(Debug)]
pub struct ScriptedExpander {
    plans: VecDeque<ExpandedPlan>,
    /// Every expansion request, in order.
    pub calls: Vec<ExpandCall>,
}

impl ScriptedExpander {
    /// Always answer with the same plan.
    pub fn fixed(plan: ExpandedPlan) -> Self {
        ScriptedExpander {
            plans: vec![plan].into_iter().collect(),
            calls: Vec::new(),
        }
    }

    /// Answer from a sequence of plans, repeating the last one.
    pub fn sequence(plans: Vec<ExpandedPlan>) -> Self {
        ScriptedExpander {
            plans: plans.into_iter().collect(),
            calls: Vec::new(),
        }
    }
}

impl crate::provider::PlanExpander for ScriptedExpander {
    fn expand(
        &mut self,
        _request: &PlanDoc,
        exclude_hops: &[String],
        hop_unavailable: &BTreeMap<String, VlanRange>,
    ) -> Result<ExpandedPlan, StitchError> {
        self.calls.push(ExpandCall {
            exclude: exclude_hops.to_vec(),
            unavailable: hop_unavailable.clone(),
        });
        let plan = if self.plans.len() > 1 {
            self.plans.pop_front()
        } else {
            self.plans.front().cloned()
        };
        plan.ok_or_else(|| {
            StitchError::InternalInconsistent("scripted expander has no plan to serve".to_string())
        })
    }
}
