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

//! # VLAN tag ranges
//!
//! A [`VlanRange`] is either the sentinel `Any` ("the provider chooses") or
//! a finite set of 802.1Q tags in `[1, 4094]`. The engine never mixes the
//! sentinel with concrete members; the enum representation makes that
//! structural. Parsing accepts the wire form used by stitching extensions
//! (`"100-200,300"` or `"any"`), and printing canonicalizes to sorted,
//! coalesced ranges.

use rand::Rng;
use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;
use thiserror::Error;

/// Smallest valid 802.1Q tag.
pub const MIN_TAG: u16 = 1;
/// Largest valid 802.1Q tag.
pub const MAX_TAG: u16 = 4094;

/// Error parsing a VLAN range string.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("cannot parse VLAN range '{0}': {1}")]
pub struct VlanParseError(pub String, pub &'static str);

/// A set of VLAN tags, or the sentinel `Any` meaning the provider chooses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VlanRange {
    /// The provider is free to pick any tag.
    Any,
    /// A concrete (possibly empty) set of tags in `[1, 4094]`.
    Tags(BTreeSet<u16>),
}

impl VlanRange {
    /// The empty concrete set.
    pub fn empty() -> Self {
        VlanRange::Tags(BTreeSet::new())
    }

    /// A single concrete tag.
    pub fn single(tag: u16) -> Self {
        let mut s = BTreeSet::new();
        s.insert(tag);
        VlanRange::Tags(s)
    }

    /// The full tag space `1-4094` as a concrete set.
    pub fn full() -> Self {
        VlanRange::Tags((MIN_TAG..=MAX_TAG).collect())
    }

    /// Parse `"a-b,c,d"` or `"any"`. Whitespace around separators is
    /// tolerated; tags outside `[1, 4094]` are rejected.
    pub fn parse(s: &str) -> Result<Self, VlanParseError> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("any") {
            return Ok(VlanRange::Any);
        }
        let mut tags = BTreeSet::new();
        if trimmed.is_empty() {
            return Ok(VlanRange::Tags(tags));
        }
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(VlanParseError(s.to_string(), "empty element"));
            }
            let (lo, hi) = match part.find('-') {
                Some(dash) => {
                    let lo = part[..dash].trim();
                    let hi = part[dash + 1..].trim();
                    (
                        lo.parse::<u16>()
                            .map_err(|_| VlanParseError(s.to_string(), "not a number"))?,
                        hi.parse::<u16>()
                            .map_err(|_| VlanParseError(s.to_string(), "not a number"))?,
                    )
                }
                None => {
                    let v = part
                        .parse::<u16>()
                        .map_err(|_| VlanParseError(s.to_string(), "not a number"))?;
                    (v, v)
                }
            };
            if lo > hi {
                return Err(VlanParseError(s.to_string(), "descending range"));
            }
            if lo < MIN_TAG || hi > MAX_TAG {
                return Err(VlanParseError(s.to_string(), "tag outside [1, 4094]"));
            }
            for t in lo..=hi {
                tags.insert(t);
            }
        }
        Ok(VlanRange::Tags(tags))
    }

    /// True if this is the `Any` sentinel.
    pub fn is_any(&self) -> bool {
        matches!(self, VlanRange::Any)
    }

    /// True for the empty concrete set. `Any` is never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            VlanRange::Any => false,
            VlanRange::Tags(t) => t.is_empty(),
        }
    }

    /// Number of concrete tags. `Any` counts as the full tag space.
    pub fn len(&self) -> usize {
        match self {
            VlanRange::Any => (MAX_TAG - MIN_TAG + 1) as usize,
            VlanRange::Tags(t) => t.len(),
        }
    }

    /// The tag if this is a concrete set with exactly one member.
    pub fn single_tag(&self) -> Option<u16> {
        match self {
            VlanRange::Tags(t) if t.len() == 1 => t.iter().next().copied(),
            _ => None,
        }
    }

    /// Membership of one concrete tag. `Any` contains every tag.
    pub fn contains_tag(&self, tag: u16) -> bool {
        match self {
            VlanRange::Any => true,
            VlanRange::Tags(t) => t.contains(&tag),
        }
    }

    /// Set containment: `other ⊆ self`. `Any` contains everything, but is
    /// contained only in `Any` — callers test the sentinel explicitly, as
    /// the negotiation rules treat it as a distinguished value rather than
    /// a set.
    pub fn contains(&self, other: &VlanRange) -> bool {
        match (self, other) {
            (VlanRange::Any, _) => true,
            (VlanRange::Tags(_), VlanRange::Any) => false,
            (VlanRange::Tags(a), VlanRange::Tags(b)) => b.is_subset(a),
        }
    }

    /// Set union. `Any` absorbs everything.
    pub fn union(&self, other: &VlanRange) -> VlanRange {
        match (self, other) {
            (VlanRange::Any, _) | (_, VlanRange::Any) => VlanRange::Any,
            (VlanRange::Tags(a), VlanRange::Tags(b)) => {
                VlanRange::Tags(a.union(b).copied().collect())
            }
        }
    }

    /// Set intersection. `Any` is the identity.
    pub fn intersect(&self, other: &VlanRange) -> VlanRange {
        match (self, other) {
            (VlanRange::Any, o) => o.clone(),
            (s, VlanRange::Any) => s.clone(),
            (VlanRange::Tags(a), VlanRange::Tags(b)) => {
                VlanRange::Tags(a.intersection(b).copied().collect())
            }
        }
    }

    /// Set difference `self \ other`. Subtracting from `Any` leaves `Any`:
    /// the sentinel is not enumerable, and the engine only ever subtracts
    /// from concrete ranges.
    pub fn subtract(&self, other: &VlanRange) -> VlanRange {
        match (self, other) {
            (VlanRange::Any, _) => VlanRange::Any,
            (s, VlanRange::Any) => s.clone(),
            (VlanRange::Tags(a), VlanRange::Tags(b)) => {
                VlanRange::Tags(a.difference(b).copied().collect())
            }
        }
    }

    /// Grow this set in place by the members of `other`.
    pub fn absorb(&mut self, other: &VlanRange) {
        *self = self.union(other);
    }

    /// Remove the members of `other` in place.
    pub fn remove(&mut self, other: &VlanRange) {
        *self = self.subtract(other);
    }

    /// True when the two sets share no member. `Any` overlaps everything
    /// except the empty set.
    pub fn is_disjoint(&self, other: &VlanRange) -> bool {
        match (self, other) {
            (VlanRange::Any, o) | (o, VlanRange::Any) => o.is_empty(),
            (VlanRange::Tags(a), VlanRange::Tags(b)) => a.is_disjoint(b),
        }
    }

    /// A uniformly random member of a concrete set; `None` for `Any` or
    /// the empty set.
    pub fn pick_random<R: Rng>(&self, rng: &mut R) -> Option<u16> {
        match self {
            VlanRange::Any => None,
            VlanRange::Tags(t) => {
                if t.is_empty() {
                    None
                } else {
                    let idx = rng.gen_range(0, t.len());
                    t.iter().nth(idx).copied()
                }
            }
        }
    }

    /// Iterate the concrete members in ascending order (empty for `Any`).
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        match self {
            VlanRange::Any => None,
            VlanRange::Tags(t) => Some(t.iter().copied()),
        }
        .into_iter()
        .flatten()
    }

    /// The smallest concrete member, if any.
    pub fn min_tag(&self) -> Option<u16> {
        match self {
            VlanRange::Any => None,
            VlanRange::Tags(t) => t.iter().next().copied(),
        }
    }
}

impl FromIterator<u16> for VlanRange {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        VlanRange::Tags(iter.into_iter().collect())
    }
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VlanRange::Any => write!(f, "any"),
            VlanRange::Tags(tags) => {
                let mut first = true;
                let mut iter = tags.iter().copied().peekable();
                while let Some(lo) = iter.next() {
                    let mut hi = lo;
                    while iter.peek() == Some(&(hi + 1)) {
                        hi = iter.next().unwrap();
                    }
                    if !first {
                        write!(f, ",")?;
                    }
                    first = false;
                    if lo == hi {
                        write!(f, "{}", lo)?;
                    } else {
                        write!(f, "{}-{}", lo, hi)?;
                    }
                }
                Ok(())
            }
        }
    }
}
