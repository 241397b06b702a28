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

//! Module containing all error types

use crate::vlan::VlanParseError;
use thiserror::Error;

/// Main error type of the reservation engine.
///
/// The variants mirror the classification the scheduler acts on: transient
/// conditions are retried in place, `FatalPlan` sends the run back to the
/// plan expander, and `FatalUser` terminates the run with the provider
/// message surfaced to the caller.
#[derive(Debug, Error)]
pub enum StitchError {
    /// A provider could not honor the requested VLAN tag. Routed to the
    /// negotiator, never surfaced directly unless negotiation also fails.
    #[error("VLAN tag unavailable: {0}")]
    VlanUnavailable(String),
    /// The provider stayed busy through every poll of the busy-retry loop.
    #[error("Provider still busy after {0} polls")]
    ProviderBusy(u32),
    /// A retriable provider failure (RPC timeout, transport error, 5xx).
    /// The scheduler retries the aggregate without renegotiating tags.
    #[error("Transient provider failure: {0}")]
    Transient(String),
    /// The request can never succeed as stated; the user must change it.
    #[error("Reservation cannot succeed as requested: {0}")]
    FatalUser(String),
    /// The reservation cannot succeed at this aggregate, but the plan
    /// expander may be able to route around it.
    #[error("Reservation cannot succeed at this aggregate: {0}")]
    FatalPlan(String),
    /// The provider reported success but its manifest violates the
    /// reservation invariants.
    #[error("Manifest violates reservation invariants: {0}")]
    ManifestInconsistent(String),
    /// An invariant was violated in our own state.
    #[error("Internal state inconsistent: {0}")]
    InternalInconsistent(String),
    /// Used up all of the wall-clock budget.
    #[error("The time budget was used up before the circuit completed")]
    Timeout,
    /// On an operation abort.
    #[error("The operation was aborted")]
    Abort,
    /// The plan-expansion call budget is exhausted.
    #[error("Plan expansion budget exhausted after {0} calls")]
    PceBudgetExhausted(u32),
    /// The global allocation-attempt budget is exhausted.
    #[error("Allocation attempt budget exhausted after {0} attempts")]
    AllocateBudgetExhausted(u32),
    /// A VLAN range string could not be parsed.
    #[error("Invalid VLAN range: {0}")]
    VlanParse(#[from] VlanParseError),
    /// Failed to persist a request artifact.
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StitchError {
    /// True for the error kinds that terminate the whole run instead of
    /// being recovered by retry or renegotiation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StitchError::FatalUser(_)
                | StitchError::InternalInconsistent(_)
                | StitchError::Timeout
                | StitchError::Abort
                | StitchError::PceBudgetExhausted(_)
                | StitchError::AllocateBudgetExhausted(_)
                | StitchError::VlanParse(_)
                | StitchError::Io(_)
        )
    }
}
