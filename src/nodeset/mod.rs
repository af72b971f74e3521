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

//! Cluster node set support
//!
//! A [`NodeSet`] is a set of host names with a compact folded textual form,
//! e.g. `node[1-99]` or `rack[1-2]-node[01-44]`. It supports the extended
//! pattern grammar with union (`,`), difference (`!`), intersection (`&`)
//! and symmetric difference (`^`) evaluated left to right, node group
//! references (`@group`, `@source:group`, `@@source`, `@*`) resolved
//! through an injected [`GroupResolver`], and shell wildcards matched
//! against the resolver's "all nodes" set.
//!
//! # Examples
//!
//! ```rust
//! use muster::nodeset::NodeSet;
//!
//! let ns: NodeSet = "node[1-3],node5".parse().unwrap();
//! assert_eq!(ns.len(), 4);
//! assert_eq!(ns.to_string(), "node[1-3,5]");
//! assert!(ns.contains("node2").unwrap());
//!
//! let other: NodeSet = "node[3-9]".parse().unwrap();
//! assert_eq!(ns.intersection(&other).to_string(), "node[3,5]");
//! ```

mod error;
mod parser;
pub mod resolver;

pub use error::NodeSetError;
pub use resolver::{
    default_resolver, set_default_resolver, GroupResolver, NullResolver, ResolverError,
    StaticGroupResolver,
};

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Sub};
use std::str::FromStr;

use crate::rangeset::{RangeSet, RangeSetND};

/// Per-pattern index storage: one axis keeps a plain [`RangeSet`], several
/// axes keep a [`RangeSetND`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ranges {
    One(RangeSet),
    Many(RangeSetND),
}

impl Ranges {
    fn from_vec(mut rsets: Vec<RangeSet>, autostep: Option<usize>) -> Option<Ranges> {
        match rsets.len() {
            0 => None,
            1 => Some(Ranges::One(rsets.pop().expect("one element"))),
            _ => {
                let mut nd = RangeSetND::from_veins(vec![rsets]);
                nd.set_autostep(autostep);
                Some(Ranges::Many(nd))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Ranges::One(rs) => rs.len(),
            Ranges::Many(nd) => nd.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        match self {
            Ranges::One(_) => 1,
            Ranges::Many(nd) => nd.dim(),
        }
    }

    fn set_autostep(&mut self, autostep: Option<usize>) {
        match self {
            Ranges::One(rs) => rs.set_autostep(autostep),
            Ranges::Many(nd) => nd.set_autostep(autostep),
        }
    }

    fn update(&mut self, other: &Ranges) {
        match (self, other) {
            (Ranges::One(a), Ranges::One(b)) => a.union_update(b),
            (Ranges::Many(a), Ranges::Many(b)) => a.update(b),
            _ => unreachable!("pattern dimension mismatch"),
        }
    }

    fn difference_update(&mut self, other: &Ranges) {
        match (self, other) {
            (Ranges::One(a), Ranges::One(b)) => a.difference_update(b),
            (Ranges::Many(a), Ranges::Many(b)) => a.difference_update(b),
            _ => unreachable!("pattern dimension mismatch"),
        }
    }

    fn intersection_update(&mut self, other: &Ranges) {
        match (self, other) {
            (Ranges::One(a), Ranges::One(b)) => a.intersection_update(b),
            (Ranges::Many(a), Ranges::Many(b)) => a.intersection_update(b),
            _ => unreachable!("pattern dimension mismatch"),
        }
    }

    fn symmetric_difference_update(&mut self, other: &Ranges) {
        match (self, other) {
            (Ranges::One(a), Ranges::One(b)) => a.symmetric_difference_update(b),
            (Ranges::Many(a), Ranges::Many(b)) => a.symmetric_difference_update(b),
            _ => unreachable!("pattern dimension mismatch"),
        }
    }

    fn is_superset(&self, other: &Ranges) -> bool {
        match (self, other) {
            (Ranges::One(a), Ranges::One(b)) => a.is_superset(b),
            (Ranges::Many(a), Ranges::Many(b)) => a.is_superset(b),
            _ => false,
        }
    }

    /// Per-element argument tuples for pattern formatting, in canonical
    /// order.
    fn element_args(&self) -> Vec<Vec<String>> {
        match self {
            Ranges::One(rs) => rs.strings().map(|s| vec![s]).collect(),
            Ranges::Many(nd) => nd
                .iter()
                .map(|tuple| tuple.iter().map(|i| i.to_string()).collect())
                .collect(),
        }
    }

    fn slice(&self, start: usize, stop: usize) -> Ranges {
        match self {
            Ranges::One(rs) => Ranges::One(rs.slice(start, stop)),
            Ranges::Many(nd) => Ranges::Many(nd.slice(start, stop)),
        }
    }

    fn contiguous(&self) -> Vec<Ranges> {
        match self {
            Ranges::One(rs) => rs.contiguous().into_iter().map(Ranges::One).collect(),
            Ranges::Many(nd) => nd.contiguous().into_iter().map(Ranges::Many).collect(),
        }
    }
}

/// Set of cluster node names with folded range support.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    /// pattern skeleton (`%s` per bracket group) -> indexes;
    /// `None` marks a bare unnumbered name
    patterns: BTreeMap<String, Option<Ranges>>,
    autostep: Option<usize>,
    /// restrict folding to these nD axes (negatives count from the right)
    fold_axis: Option<Vec<i64>>,
}

impl NodeSet {
    /// Create an empty node set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a node set expression using the process-wide default group
    /// resolver.
    pub fn parse(nodes: &str) -> Result<Self, NodeSetError> {
        parser::parse(nodes, default_resolver().as_ref(), None)
    }

    /// Parse a node set expression with an explicit resolver and autostep.
    pub fn parse_with(
        nodes: &str,
        resolver: &dyn GroupResolver,
        autostep: Option<usize>,
    ) -> Result<Self, NodeSetError> {
        let mut ns = parser::parse(nodes, resolver, autostep)?;
        ns.autostep = autostep;
        Ok(ns)
    }

    /// Build a node set from single node names (no operators expanded).
    pub fn from_nodes<I, S>(nodes: I) -> Result<Self, NodeSetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ns = NodeSet::new();
        for node in nodes {
            ns.update(&parser::parse_single(node.as_ref(), None)?);
        }
        Ok(ns)
    }

    /// Build the "all nodes" set of a group source.
    pub fn from_all(
        resolver: &dyn GroupResolver,
        namespace: Option<&str>,
    ) -> Result<Self, NodeSetError> {
        let mut ns = NodeSet::new();
        for part in parser::all_nodes(resolver, namespace)? {
            ns.update(&parser::parse(&part, resolver, None)?);
        }
        Ok(ns)
    }

    pub(crate) fn from_pattern(pattern: String, ranges: Option<Ranges>) -> Self {
        let mut ns = NodeSet::new();
        if !pattern.is_empty() || ranges.is_some() {
            ns.patterns.insert(pattern, ranges);
        }
        ns
    }

    pub fn autostep(&self) -> Option<usize> {
        self.autostep
    }

    pub fn set_autostep(&mut self, autostep: Option<usize>) {
        self.autostep = autostep;
        for ranges in self.patterns.values_mut().flatten() {
            ranges.set_autostep(autostep);
        }
    }

    /// Restrict nD folding to the given axes (negatives count from the
    /// right); `None` folds along all axes.
    pub fn set_fold_axis(&mut self, fold_axis: Option<Vec<i64>>) {
        self.fold_axis = fold_axis;
    }

    /// Number of nodes in the set.
    pub fn len(&self) -> usize {
        self.patterns
            .values()
            .map(|r| r.as_ref().map_or(1, Ranges::len))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Iterate over node names, patterns in sorted order, indexes in
    /// canonical range order.
    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        self.patterns.iter().flat_map(|(pat, ranges)| {
            let items: Vec<String> = match ranges {
                None => vec![format_pattern(pat, &[])],
                Some(r) => r
                    .element_args()
                    .into_iter()
                    .map(|args| format_pattern(pat, &args))
                    .collect(),
            };
            items
        })
    }

    /// Membership test for a single node name.
    pub fn contains(&self, node: &str) -> Result<bool, NodeSetError> {
        let single = parser::parse_single(node, self.autostep)?;
        Ok(self.is_superset(&single))
    }

    pub fn is_superset(&self, other: &NodeSet) -> bool {
        for (pat, eranges) in &other.patterns {
            match (self.patterns.get(pat), eranges) {
                (Some(Some(mine)), Some(theirs)) => {
                    if !mine.is_superset(theirs) {
                        return false;
                    }
                }
                (Some(None), None) => {}
                _ => return false,
            }
        }
        true
    }

    pub fn is_subset(&self, other: &NodeSet) -> bool {
        other.is_superset(self)
    }

    /// Add all nodes of `other` to this set.
    pub fn update(&mut self, other: &NodeSet) {
        use std::collections::btree_map::Entry;
        for (pat, eranges) in &other.patterns {
            match self.patterns.entry(pat.clone()) {
                Entry::Occupied(mut entry) => {
                    if let (Some(mine), Some(theirs)) = (entry.get_mut().as_mut(), eranges) {
                        mine.update(theirs);
                    }
                }
                Entry::Vacant(entry) => {
                    let mut cpy = eranges.clone();
                    if let Some(r) = cpy.as_mut() {
                        r.set_autostep(self.autostep);
                    }
                    entry.insert(cpy);
                }
            }
        }
    }

    /// Parse and add an expression (default resolver).
    pub fn update_str(&mut self, nodes: &str) -> Result<(), NodeSetError> {
        let other = parser::parse(nodes, default_resolver().as_ref(), self.autostep)?;
        self.update(&other);
        Ok(())
    }

    /// Remove all nodes of `other` from this set.
    pub fn difference_update(&mut self, other: &NodeSet) {
        let mut purge = Vec::new();
        for (pat, eranges) in &other.patterns {
            match (self.patterns.get_mut(pat), eranges) {
                (Some(Some(mine)), Some(theirs)) => {
                    mine.difference_update(theirs);
                    if mine.is_empty() {
                        purge.push(pat.clone());
                    }
                }
                (Some(None), None) => purge.push(pat.clone()),
                _ => {}
            }
        }
        for pat in purge {
            self.patterns.remove(&pat);
        }
    }

    /// Keep only nodes also found in `other`.
    pub fn intersection_update(&mut self, other: &NodeSet) {
        let mut result = BTreeMap::new();
        for (pat, eranges) in &other.patterns {
            match (self.patterns.get(pat), eranges) {
                (Some(Some(mine)), Some(theirs)) => {
                    let mut irs = mine.clone();
                    irs.intersection_update(theirs);
                    if !irs.is_empty() {
                        result.insert(pat.clone(), Some(irs));
                    }
                }
                (Some(None), None) => {
                    result.insert(pat.clone(), None);
                }
                _ => {}
            }
        }
        self.patterns = result;
    }

    /// Keep only nodes found in exactly one of the sets.
    pub fn symmetric_difference_update(&mut self, other: &NodeSet) {
        let mut purge = Vec::new();
        for (pat, ranges) in self.patterns.iter_mut() {
            match (ranges, other.patterns.get(pat)) {
                (Some(mine), Some(Some(theirs))) => {
                    mine.symmetric_difference_update(theirs);
                }
                (None, Some(None)) => purge.push(pat.clone()),
                _ => {}
            }
        }
        for (pat, eranges) in &other.patterns {
            if !self.patterns.contains_key(pat) {
                self.patterns.insert(pat.clone(), eranges.clone());
            }
        }
        for (pat, ranges) in &self.patterns {
            if let Some(r) = ranges {
                if r.is_empty() {
                    purge.push(pat.clone());
                }
            }
        }
        for pat in purge {
            self.patterns.remove(&pat);
        }
    }

    pub fn union(&self, other: &NodeSet) -> NodeSet {
        let mut ns = self.clone();
        ns.update(other);
        ns
    }

    pub fn difference(&self, other: &NodeSet) -> NodeSet {
        let mut ns = self.clone();
        ns.difference_update(other);
        ns
    }

    pub fn intersection(&self, other: &NodeSet) -> NodeSet {
        let mut ns = self.clone();
        ns.intersection_update(other);
        ns
    }

    pub fn symmetric_difference(&self, other: &NodeSet) -> NodeSet {
        let mut ns = self.clone();
        ns.symmetric_difference_update(other);
        ns
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    /// Node name at position `n` in iteration order.
    pub fn nth(&self, n: usize) -> Option<String> {
        self.iter().nth(n)
    }

    /// Sub-set of the nodes at positions `[start, stop)`.
    pub fn slice(&self, start: usize, stop: usize) -> NodeSet {
        let mut ns = NodeSet {
            patterns: BTreeMap::new(),
            autostep: self.autostep,
            fold_axis: self.fold_axis.clone(),
        };
        let mut offset = 0;
        for (pat, ranges) in &self.patterns {
            let cnt = ranges.as_ref().map_or(1, Ranges::len);
            let lo = start.saturating_sub(offset).min(cnt);
            let hi = stop.saturating_sub(offset).min(cnt);
            if lo < hi {
                match ranges {
                    None => {
                        ns.patterns.insert(pat.clone(), None);
                    }
                    Some(r) => {
                        ns.patterns.insert(pat.clone(), Some(r.slice(lo, hi)));
                    }
                }
            }
            offset += cnt;
            if offset >= stop {
                break;
            }
        }
        ns
    }

    /// Split into at most `n` sets of balanced sizes, in order.
    pub fn split(&self, n: usize) -> Vec<NodeSet> {
        assert!(n > 0);
        let len = self.len();
        let chunk = len / n;
        let left = len % n;
        let mut out = Vec::new();
        let mut begin = 0;
        for i in 0..n.min(len) {
            let length = chunk + usize::from(i < left);
            out.push(self.slice(begin, begin + length));
            begin += length;
        }
        out
    }

    /// Keep only the `n` first nodes in iteration order.
    pub fn pick(&mut self, n: usize) {
        if self.len() > n {
            *self = self.slice(0, n);
        }
    }

    /// Iterate over contiguous sub-sets (same pattern, contiguous index
    /// range on every axis).
    pub fn contiguous(&self) -> Vec<NodeSet> {
        let mut out = Vec::new();
        for (pat, ranges) in &self.patterns {
            match ranges {
                None => out.push(NodeSet::from_pattern(pat.clone(), None)),
                Some(r) => {
                    for part in r.contiguous() {
                        out.push(NodeSet::from_pattern(pat.clone(), Some(part)));
                    }
                }
            }
        }
        out
    }

    /// Find the node groups this set intersects.
    ///
    /// Returns `(group_key, group_nodeset, intersection_with_self)`
    /// entries; `group_key` carries the `@` prefix (and the source name
    /// unless `noprefix` is set).
    pub fn groups(
        &self,
        resolver: &dyn GroupResolver,
        namespace: Option<&str>,
        noprefix: bool,
    ) -> Result<Vec<(String, NodeSet, NodeSet)>, NodeSetError> {
        let info = self.groups_info(resolver, namespace)?;
        let mut out = Vec::new();
        for (grp, (_count, nodes)) in info {
            let key = group_key(&grp, namespace, noprefix);
            let inter = self.intersection(&nodes);
            out.push((key, nodes, inter));
        }
        Ok(out)
    }

    /// group name -> (number of member nodes inside self, full group set)
    fn groups_info(
        &self,
        resolver: &dyn GroupResolver,
        namespace: Option<&str>,
    ) -> Result<BTreeMap<String, (usize, NodeSet)>, NodeSetError> {
        let allgrplist = parser::grouplist(resolver, namespace, self.autostep).ok();

        // external reverse is only worth it when there are more groups
        // than nodes in this set
        let use_reverse = resolver.has_reverse(namespace)
            && allgrplist
                .as_ref()
                .map_or(true, |l| l.is_empty() || l.len() >= self.len());

        let mut allgroups: BTreeMap<String, NodeSet> = BTreeMap::new();
        if !use_reverse {
            let Some(grplist) = allgrplist else {
                return Ok(BTreeMap::new()); // list query failed, no reverse
            };
            for grp in grplist {
                let nodes = resolver.group_nodes(&grp, namespace)?;
                let ns = parser::parse(&nodes.join(","), resolver, self.autostep)?;
                allgroups.insert(grp, ns);
            }
        }

        let mut info: BTreeMap<String, (usize, NodeSet)> = BTreeMap::new();
        for node in self.iter() {
            let found: Vec<String> = if use_reverse {
                resolver.node_groups(&node, namespace)?
            } else {
                allgroups
                    .iter()
                    .filter(|(_, ns)| ns.contains(&node).unwrap_or(false))
                    .map(|(grp, _)| grp.clone())
                    .collect()
            };
            for grp in found {
                use std::collections::btree_map::Entry;
                match info.entry(grp) {
                    Entry::Occupied(mut entry) => entry.get_mut().0 += 1,
                    Entry::Vacant(entry) => {
                        let ns = match allgroups.get(entry.key()) {
                            Some(ns) => ns.clone(),
                            None => {
                                let nodes = resolver.group_nodes(entry.key(), namespace)?;
                                parser::parse(&nodes.join(","), resolver, self.autostep)?
                            }
                        };
                        entry.insert((1, ns));
                    }
                }
            }
        }
        Ok(info)
    }

    /// Regroup this set using node groups: find fully matching groups and
    /// return a string naming them, largest groups first, with any
    /// remainder folded normally.
    pub fn regroup(
        &self,
        resolver: &dyn GroupResolver,
        namespace: Option<&str>,
        overlap: bool,
        noprefix: bool,
    ) -> Result<String, NodeSetError> {
        let info = self.groups_info(resolver, namespace)?;
        if info.is_empty() {
            return Ok(self.to_string());
        }

        // keep only groups entirely contained in this set
        let mut fulls: Vec<(usize, String)> = info
            .iter()
            .filter(|(_, (count, nodes))| *count == nodes.len())
            .map(|(grp, (count, _))| (*count, grp.clone()))
            .collect();
        fulls.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut rest = self.clone();
        let mut regrouped = Vec::new();

        for (_, grp) in fulls {
            let nodes = &info[&grp].1;
            if !overlap && !rest.is_superset(nodes) {
                continue;
            }
            regrouped.push(group_key(&grp, namespace, noprefix));
            rest.difference_update(nodes);
            if rest.is_empty() {
                return Ok(regrouped.join(","));
            }
        }

        if regrouped.is_empty() {
            Ok(rest.to_string())
        } else {
            Ok(format!("{},{}", regrouped.join(","), rest))
        }
    }
}

fn group_key(group: &str, namespace: Option<&str>, noprefix: bool) -> String {
    match namespace {
        Some(src) if !noprefix => format!("@{src}:{group}"),
        _ => format!("@{group}"),
    }
}

/// Format a `%s` skeleton with argument strings; `%%` is a literal `%`.
fn format_pattern(pattern: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut argi = 0;
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.next() {
                Some('s') => {
                    if let Some(arg) = args.get(argi) {
                        out.push_str(arg);
                    }
                    argi += 1;
                }
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl fmt::Display for NodeSet {
    /// Folded ranges-based form of the node set.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut results: Vec<String> = Vec::new();
        for (pat, ranges) in &self.patterns {
            match ranges {
                None => results.push(format_pattern(pat, &[])),
                Some(Ranges::One(rs)) => {
                    let fold_1d = self
                        .fold_axis
                        .as_ref()
                        .map_or(true, |fa| fa.iter().any(|x| (-1..1).contains(x)));
                    if fold_1d {
                        let rgs = if rs.len() > 1 {
                            format!("[{rs}]")
                        } else {
                            rs.to_string()
                        };
                        results.push(format_pattern(pat, &[rgs]));
                    } else {
                        results.extend(rs.strings().map(|s| format_pattern(pat, &[s])));
                    }
                }
                Some(Ranges::Many(nd)) => {
                    let dim = nd.dim() as i64;
                    let folded_axes: Vec<usize> = match &self.fold_axis {
                        None => (0..dim as usize).collect(),
                        Some(fa) => fa
                            .iter()
                            .filter(|x| (-dim..dim).contains(*x))
                            .map(|x| (((x % dim) + dim) % dim) as usize)
                            .collect(),
                    };
                    for vein in nd.vectors() {
                        // per axis: folded bracket form, or expansion
                        let mut combos: Vec<Vec<String>> = vec![Vec::new()];
                        for (axis, rg) in vein.iter().enumerate() {
                            let arg_strings: Vec<String> = if rg.len() > 1 {
                                if folded_axes.contains(&axis) {
                                    vec![format!("[{rg}]")]
                                } else {
                                    rg.strings().collect()
                                }
                            } else {
                                vec![rg.to_string()]
                            };
                            let mut next = Vec::new();
                            for prefix in &combos {
                                for s in &arg_strings {
                                    let mut t = prefix.clone();
                                    t.push(s.clone());
                                    next.push(t);
                                }
                            }
                            combos = next;
                        }
                        for args in combos {
                            results.push(format_pattern(pat, &args));
                        }
                    }
                }
            }
        }
        f.write_str(&results.join(","))
    }
}

impl FromStr for NodeSet {
    type Err = NodeSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeSet::parse(s)
    }
}

impl PartialEq for NodeSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_superset(other)
    }
}

impl Eq for NodeSet {}

impl BitOr for &NodeSet {
    type Output = NodeSet;
    fn bitor(self, rhs: Self) -> NodeSet {
        self.union(rhs)
    }
}

impl BitAnd for &NodeSet {
    type Output = NodeSet;
    fn bitand(self, rhs: Self) -> NodeSet {
        self.intersection(rhs)
    }
}

impl Sub for &NodeSet {
    type Output = NodeSet;
    fn sub(self, rhs: Self) -> NodeSet {
        self.difference(rhs)
    }
}

impl BitXor for &NodeSet {
    type Output = NodeSet;
    fn bitxor(self, rhs: Self) -> NodeSet {
        self.symmetric_difference(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> NodeSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_fold_expand_roundtrip() {
        let set = NodeSet::from_nodes(["node1", "node2", "node3", "node5"]).unwrap();
        assert_eq!(set.to_string(), "node[1-3,5]");
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["node1", "node2", "node3", "node5"]
        );
        assert_eq!(ns("node[1-3,5]"), set);
    }

    #[test]
    fn test_multidimensional_fold() {
        let a = ns("c-[1-10]-[1-44]");
        let b = ns("c-[5-10]-[1-34]");
        let d = &a - &b;
        assert_eq!(d.to_string(), "c-[1-4]-[1-44],c-[5-10]-[35-44]");
        assert_eq!(d.len(), 10 * 44 - 6 * 34);
    }

    #[test]
    fn test_mixed_padding() {
        let set = ns("n[2,01,001]");
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["n2", "n01", "n001"]
        );
        assert_eq!(set.to_string(), "n[2,01,001]");
    }

    #[test]
    fn test_extended_operators() {
        assert_eq!(ns("node[0-10]!node[8-10]").to_string(), "node[0-7]");
        assert_eq!(ns("node[0-10]&node[5-13]").to_string(), "node[5-10]");
        assert_eq!(ns("node[0-10]^node[5-13]").to_string(), "node[0-4,11-13]");
        assert_eq!(ns("node[0-2],node[5-6]").len(), 5);
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
    fn test_group_source_and_list() {
        let mut resolver = StaticGroupResolver::new();
        resolver.add_group("sitea", "oss", "o[1-4]");
        resolver.add_group("sitea", "mds", "m1");
        let set = NodeSet::parse_with("@sitea:oss", &resolver, None).unwrap();
        assert_eq!(set.to_string(), "o[1-4]");
        // @@source lists raw group names
        let names = NodeSet::parse_with("@@sitea", &resolver, None).unwrap();
        assert_eq!(names.to_string(), "mds,oss");
        // @source:* resolves all nodes via list + map fallback
        let all = NodeSet::parse_with("@sitea:*", &resolver, None).unwrap();
        assert_eq!(all.to_string(), "m1,o[1-4]");
    }

    #[test]
    fn test_wildcards() {
        let mut resolver = StaticGroupResolver::new();
        resolver.add("all", "web[1-3],db[1-2],gw1");
        let set = NodeSet::parse_with("web*", &resolver, None).unwrap();
        assert_eq!(set.to_string(), "web[1-3]");
        let set = NodeSet::parse_with("*1", &resolver, None).unwrap();
        assert_eq!(set.to_string(), "db1,gw1,web1");
    }

    #[test]
    fn test_heterogeneous_fold_order() {
        let set = ns("rack[1-2],node[1-3]");
        assert_eq!(set.to_string(), "node[1-3],rack[1-2]");
    }

    #[test]
    fn test_bare_names() {
        let set = ns("gateway,node[1-2]");
        assert_eq!(set.len(), 3);
        assert!(set.contains("gateway").unwrap());
        let diff = &set - &ns("gateway");
        assert_eq!(diff.to_string(), "node[1-2]");
    }

    #[test]
    fn test_cardinality_invariants() {
        let a = ns("node[1-40]");
        let b = ns("node[30-50]");
        assert_eq!(
            (&a | &b).len() + (&a & &b).len(),
            a.len() + b.len()
        );
        let ab = &a - &b;
        let ba = &b - &a;
        assert!((&ab & &ba).is_empty());
        assert_eq!(&a ^ &b, &(&a | &b) - &(&a & &b));
    }

    #[test]
    fn test_split_and_contiguous() {
        let parts = ns("foo[1-5]").split(3);
        let strs: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        assert_eq!(strs, vec!["foo[1-2]", "foo[3-4]", "foo5"]);

        let parts = ns("bar[1-3,7]").contiguous();
        let strs: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        assert_eq!(strs, vec!["bar[1-3]", "bar7"]);
    }

    #[test]
    fn test_slice_and_pick() {
        let set = ns("node[1-10]");
        assert_eq!(set.nth(2).unwrap(), "node3");
        assert_eq!(set.slice(2, 5).to_string(), "node[3-5]");
        let mut set = ns("node[1-10]");
        set.pick(2);
        assert_eq!(set.to_string(), "node[1-2]");
    }

    #[test]
    fn test_regroup() {
        let mut resolver = StaticGroupResolver::new();
        resolver.add("oss", "n[1-4]");
        resolver.add("mds", "n5");
        let set = NodeSet::parse_with("n[1-5],x1", &resolver, None).unwrap();
        let regrouped = set.regroup(&resolver, None, false, false).unwrap();
        assert_eq!(regrouped, "@oss,@mds,x1");
    }

    #[test]
    fn test_groups() {
        let mut resolver = StaticGroupResolver::new();
        resolver.add("oss", "n[1-4]");
        resolver.add("mds", "n5");
        let set = NodeSet::parse_with("n[4-5]", &resolver, None).unwrap();
        let groups = set.groups(&resolver, None, false).unwrap();
        let keys: Vec<&str> = groups.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["@mds", "@oss"]);
        let (_, _, inter) = &groups[1];
        assert_eq!(inter.to_string(), "n4");
    }

    #[test]
    fn test_fold_axis() {
        let mut set = ns("rack[1-2]-node[1-3]");
        set.set_fold_axis(Some(vec![-1]));
        assert_eq!(
            set.to_string(),
            "rack1-node[1-3],rack2-node[1-3]"
        );
    }

    #[test]
    fn test_nd_roundtrip() {
        for s in ["a[1-3]b[2-5]", "x[1-2]y[1-2]z[1-2]", "c-[1-4]-[1-44],c-[5-10]-[35-44]"] {
            let set = ns(s);
            let folded = set.to_string();
            assert_eq!(ns(&folded), set, "roundtrip failed for {s}");
        }
    }
}
