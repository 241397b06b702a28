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

use crate::vlan::{VlanRange, MAX_TAG, MIN_TAG};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn r(s: &str) -> VlanRange {
    VlanRange::parse(s).unwrap()
}

#[test]
fn parse_and_print_round_trip() {
    for s in &["100-200", "1", "any", "100-200,300", "1-5,7,9-11", "4094"] {
        let parsed = r(s);
        assert_eq!(VlanRange::parse(&parsed.to_string()).unwrap(), parsed, "{}", s);
    }
}

#[test]
fn print_is_canonical() {
    assert_eq!(r("1,2,3").to_string(), "1-3");
    assert_eq!(r("3,1,2").to_string(), "1-3");
    assert_eq!(r("5, 7 , 6").to_string(), "5-7");
    assert_eq!(r("10,12").to_string(), "10,12");
    assert_eq!(r("100-105,106-110").to_string(), "100-110");
    assert_eq!(VlanRange::Any.to_string(), "any");
    assert_eq!(VlanRange::empty().to_string(), "");
}

#[test]
fn parse_rejects_bad_input() {
    VlanRange::parse("0").unwrap_err();
    VlanRange::parse("4095").unwrap_err();
    VlanRange::parse("1-4095").unwrap_err();
    VlanRange::parse("5-2").unwrap_err();
    VlanRange::parse("abc").unwrap_err();
    VlanRange::parse("1,,2").unwrap_err();
}

#[test]
fn parse_accepts_any_case_insensitively() {
    assert!(r("any").is_any());
    assert!(r("ANY").is_any());
    assert!(r(" Any ").is_any());
}

#[test]
fn set_algebra_laws() {
    let a = r("100-150");
    let b = r("140-200");
    let c = r("1-4094");
    let empty = VlanRange::empty();

    assert_eq!(a.union(&b), b.union(&a));
    assert_eq!(a.intersect(&b), b.intersect(&a));
    assert_eq!(a.union(&b).union(&c), a.union(&b.union(&c)));
    assert_eq!(a.intersect(&b).intersect(&c), a.intersect(&b.intersect(&c)));
    assert_eq!(a.subtract(&empty), a);
    assert_eq!(a.intersect(&a), a);
    assert_eq!(a.intersect(&b), r("140-150"));
    assert_eq!(a.subtract(&b), r("100-139"));
}

#[test]
fn any_equals_only_any() {
    assert_eq!(VlanRange::Any, VlanRange::Any);
    assert_ne!(VlanRange::Any, r("1-4094"));
    assert_ne!(VlanRange::Any, VlanRange::empty());
}

#[test]
fn any_sentinel_behavior() {
    let a = r("100-150");
    assert_eq!(VlanRange::Any.intersect(&a), a);
    assert_eq!(a.intersect(&VlanRange::Any), a);
    assert_eq!(VlanRange::Any.union(&a), VlanRange::Any);
    assert_eq!(VlanRange::Any.subtract(&a), VlanRange::Any);
    assert!(VlanRange::Any.contains(&a));
    assert!(!a.contains(&VlanRange::Any));
    assert!(VlanRange::Any.contains_tag(1));
    assert!(VlanRange::Any.contains_tag(4094));
    assert!(!VlanRange::Any.is_empty());
}

#[test]
fn containment_and_membership() {
    let a = r("100-200");
    assert!(a.contains(&r("150-160")));
    assert!(!a.contains(&r("150-201")));
    assert!(a.contains(&VlanRange::empty()));
    assert!(a.contains_tag(100));
    assert!(!a.contains_tag(99));
    assert!(a.is_disjoint(&r("300-400")));
    assert!(!a.is_disjoint(&r("200-300")));
}

#[test]
fn single_tag_and_min() {
    assert_eq!(r("150").single_tag(), Some(150));
    assert_eq!(r("150-151").single_tag(), None);
    assert_eq!(VlanRange::Any.single_tag(), None);
    assert_eq!(r("100-200").min_tag(), Some(100));
    assert_eq!(VlanRange::empty().min_tag(), None);
}

#[test]
fn absorb_and_remove_mutate_in_place() {
    let mut a = r("100-110");
    a.absorb(&r("120"));
    assert_eq!(a, r("100-110,120"));
    a.remove(&r("105-120"));
    assert_eq!(a, r("100-104"));
}

#[test]
fn pick_random_stays_in_set() {
    let a = r("100-110,500");
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..50 {
        let tag = a.pick_random(&mut rng).unwrap();
        assert!(a.contains_tag(tag));
    }
    assert_eq!(VlanRange::empty().pick_random(&mut rng), None);
    assert_eq!(VlanRange::Any.pick_random(&mut rng), None);
}

#[test]
fn full_range_covers_the_tag_space() {
    let full = VlanRange::full();
    assert_eq!(full.len(), (MAX_TAG - MIN_TAG + 1) as usize);
    assert!(full.contains_tag(MIN_TAG));
    assert!(full.contains_tag(MAX_TAG));
}

#[test]
fn iter_is_ascending() {
    let tags: Vec<u16> = r("5,3,9").iter().collect();
    assert_eq!(tags, vec![3, 5, 9]);
}
