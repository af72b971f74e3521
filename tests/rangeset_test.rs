// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Range set invariants over a corpus of representative expressions.

use muster::rangeset::{RangeSet, RangeSetND};

const SAMPLES: &[&str] = &[
    "0",
    "1-5",
    "1-5,8,10-12",
    "001-128",
    "01-10",
    "0-100/10",
    "2,01,001",
    "5,05,005",
    "9-11,013-015",
    "0-10/2,1-11/2",
];

#[test]
fn test_parse_format_roundtrip() {
    for sample in SAMPLES {
        let rs: RangeSet = sample.parse().unwrap();
        let folded = rs.to_string();
        let back: RangeSet = folded.parse().unwrap();
        assert_eq!(rs, back, "roundtrip failed: {sample} -> {folded}");
        // folding is idempotent
        assert_eq!(back.to_string(), folded);
    }
}

#[test]
fn test_set_algebra_laws() {
    let pairs = [("1-100", "50-150"), ("0-10/2", "1-11/2"), ("001-050", "025-075")];
    for (sa, sb) in pairs {
        let a: RangeSet = sa.parse().unwrap();
        let b: RangeSet = sb.parse().unwrap();

        let union = a.union(&b);
        let inter = a.intersection(&b);
        assert_eq!(union.len() + inter.len(), a.len() + b.len());

        let ab = a.difference(&b);
        let ba = b.difference(&a);
        assert!(!ab.intersects(&ba) || ab.is_empty() || ba.is_empty());

        let xor = a.symmetric_difference(&b);
        assert_eq!(xor, union.difference(&inter));
    }
}

#[test]
fn test_autostep_no_overlap() {
    // stepped clauses never overlap other emitted items of the same group
    let mut rs = RangeSet::from_ints([0, 2, 4, 6, 8, 9, 10, 11]);
    rs.set_autostep(Some(4));
    let folded = rs.to_string();
    assert_eq!(folded, "0-8/2,9-11");

    // every element must appear exactly once after reparse
    let back: RangeSet = folded.parse().unwrap();
    assert_eq!(back.len(), 8);
    assert_eq!(rs, back);
}

#[test]
fn test_autostep_threshold_boundary() {
    // threshold k: runs of exactly k qualify, k-1 do not
    let mut rs = RangeSet::from_ints([10, 20, 30]);
    rs.set_autostep(Some(3));
    assert_eq!(rs.to_string(), "10-30/10");

    let mut rs = RangeSet::from_ints([10, 20]);
    rs.set_autostep(Some(3));
    assert_eq!(rs.to_string(), "10,20");
}

#[test]
fn test_step_never_one_in_output() {
    let mut rs = RangeSet::from_ints(0..=50);
    rs.set_autostep(Some(2));
    assert!(!rs.to_string().contains('/'));
    assert_eq!(rs.to_string(), "0-50");
}

#[test]
fn test_mixed_width_iteration_order() {
    let rs: RangeSet = "010,9,99,2".parse().unwrap();
    let strs: Vec<String> = rs.strings().collect();
    assert_eq!(strs, vec!["2", "9", "99", "010"]);
}

#[test]
fn test_nd_difference_cardinality() {
    let a = RangeSetND::from_veins(vec![vec![
        "1-10".parse().unwrap(),
        "1-44".parse().unwrap(),
    ]]);
    let b = RangeSetND::from_veins(vec![vec![
        "5-10".parse().unwrap(),
        "1-34".parse().unwrap(),
    ]]);
    let d = a.difference(&b);
    assert_eq!(d.len(), a.len() - a.intersection(&b).len());
    assert!(a.is_superset(&d));
    assert!(d.intersection(&b).is_empty());
}

#[test]
fn test_nd_union_and_xor_laws() {
    let a = RangeSetND::from_veins(vec![vec!["1-4".parse().unwrap(), "1-4".parse().unwrap()]]);
    let b = RangeSetND::from_veins(vec![vec!["3-6".parse().unwrap(), "3-6".parse().unwrap()]]);
    let union = a.union(&b);
    let inter = a.intersection(&b);
    assert_eq!(union.len() + inter.len(), a.len() + b.len());
    assert_eq!(a.symmetric_difference(&b), union.difference(&inter));
}

#[test]
fn test_split_covers_whole_set() {
    let rs: RangeSet = "1-17".parse().unwrap();
    let parts = rs.split(4);
    assert_eq!(parts.len(), 4);
    let total: usize = parts.iter().map(RangeSet::len).sum();
    assert_eq!(total, rs.len());
    let mut merged = RangeSet::new();
    for p in &parts {
        assert!(!merged.intersects(p));
        merged.union_update(p);
    }
    assert_eq!(merged, rs);
}
