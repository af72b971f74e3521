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

//! Node set end-to-end behavior: folding, expansion, extended operators,
//! groups and wildcards.

use muster::nodeset::{NodeSet, NodeSetError, StaticGroupResolver};

fn ns(s: &str) -> NodeSet {
    s.parse().unwrap()
}

#[test]
fn test_fold_expand_roundtrip() {
    let set = NodeSet::from_nodes(["node1", "node2", "node3", "node5"]).unwrap();
    assert_eq!(set.to_string(), "node[1-3,5]");
    let names: Vec<String> = set.iter().collect();
    assert_eq!(names, vec!["node1", "node2", "node3", "node5"]);
}

#[test]
fn test_parse_format_roundtrip() {
    for sample in [
        "node[1-99]",
        "node[01-10]",
        "rack[1-2]-node[01-44]",
        "a[1-3]b[2-5]c[1-2]",
        "login1,node[1-64],mgmt[1-2]",
        "c-[1-4]-[1-44],c-[5-10]-[35-44]",
        "standalone",
        "n[2,01,001]",
    ] {
        let set = ns(sample);
        let folded = set.to_string();
        assert_eq!(ns(&folded), set, "roundtrip failed for {sample}");
        assert_eq!(set.len(), set.iter().count());
    }
}

#[test]
fn test_multidimensional_difference_fold() {
    let diff = &ns("c-[1-10]-[1-44]") - &ns("c-[5-10]-[1-34]");
    assert_eq!(diff.to_string(), "c-[1-4]-[1-44],c-[5-10]-[35-44]");
}

#[test]
fn test_mixed_padding_order() {
    let set = ns("n[2,01,001]");
    assert_eq!(
        set.iter().collect::<Vec<_>>(),
        vec!["n2", "n01", "n001"]
    );
}

#[test]
fn test_extended_pattern_left_to_right() {
    // operators of equal precedence evaluate left to right
    let set = ns("node[1-10]!node[5-10]&node[1-8]^node[3-4]");
    // ((1-10 ! 5-10) & 1-8) ^ 3-4 = (1-4) ^ (3-4) = 1-2
    assert_eq!(set.to_string(), "node[1-2]");
}

#[test]
fn test_group_algebra() {
    let mut resolver = StaticGroupResolver::new();
    resolver.add("a", "n[1-9]");
    resolver.add("b", "n[6-11]");
    let set = NodeSet::parse_with("@a^@b", &resolver, None).unwrap();
    assert_eq!(set.to_string(), "n[1-5,10-11]");
}

#[test]
fn test_group_ranges_in_names() {
    let mut resolver = StaticGroupResolver::new();
    resolver.add("rack1", "r1n[1-4]");
    resolver.add("rack2", "r2n[1-4]");
    let set = NodeSet::parse_with("@rack[1-2]", &resolver, None).unwrap();
    assert_eq!(set.len(), 8);
}

#[test]
fn test_nested_groups() {
    let mut resolver = StaticGroupResolver::new();
    resolver.add("all-compute", "@rack1,@rack2");
    resolver.add("rack1", "r1n[1-2]");
    resolver.add("rack2", "r2n[1-2]");
    let set = NodeSet::parse_with("@all-compute", &resolver, None).unwrap();
    assert_eq!(set.to_string(), "r1n[1-2],r2n[1-2]");
}

#[test]
fn test_wildcard_against_all() {
    let mut resolver = StaticGroupResolver::new();
    resolver.add("all", "web[1-3],db[1-2]");
    let set = NodeSet::parse_with("db?", &resolver, None).unwrap();
    assert_eq!(set.to_string(), "db[1-2]");
    // wildcards compose with operators
    let set = NodeSet::parse_with("*!db*", &resolver, None).unwrap();
    assert_eq!(set.to_string(), "web[1-3]");
}

#[test]
fn test_grammar_errors() {
    assert!(matches!(
        "node[1-".parse::<NodeSet>(),
        Err(NodeSetError::MissingBracket { .. })
    ));
    assert!(matches!(
        "node[5-1]".parse::<NodeSet>(),
        Err(NodeSetError::BadRange { .. })
    ));
    assert!(matches!(
        "node[1-3]!".parse::<NodeSet>(),
        Err(NodeSetError::MissingOperand { .. })
    ));
    assert!(matches!(
        "node[1-6/2]7".parse::<NodeSet>(),
        Err(NodeSetError::TrailingDigitsAfterStep { .. })
    ));
}

#[test]
fn test_cardinality_invariants() {
    let a = ns("node[1-100],mgmt[1-4]");
    let b = ns("node[50-150]");
    assert_eq!((&a | &b).len() + (&a & &b).len(), a.len() + b.len());
    assert_eq!(&a ^ &b, &(&a | &b) - &(&a & &b));
}

#[test]
fn test_split_balanced() {
    let parts = ns("foo[1-5]").split(3);
    let strs: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    assert_eq!(strs, vec!["foo[1-2]", "foo[3-4]", "foo5"]);
}

#[test]
fn test_contiguous_split() {
    let parts = ns("n[1-3,7,9-10]").contiguous();
    let strs: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    assert_eq!(strs, vec!["n[1-3]", "n7", "n[9-10]"]);
}

#[test]
fn test_regroup_largest_first() {
    let mut resolver = StaticGroupResolver::new();
    resolver.add("big", "n[1-8]");
    resolver.add("small", "n[9-10]");
    let set = NodeSet::parse_with("n[1-10]", &resolver, None).unwrap();
    let regrouped = set.regroup(&resolver, None, false, false).unwrap();
    assert_eq!(regrouped, "@big,@small");
}

#[test]
fn test_autostep_from_nodeset() {
    let set = NodeSet::parse_with("n[2,4,6,8]", &muster::nodeset::NullResolver, Some(3)).unwrap();
    assert_eq!(set.to_string(), "n[2-8/2]");
}
