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

//! Multidimensional range set support
//!
//! A [`RangeSetND`] stores tuples of indexes as a list of "veins", one
//! [`RangeSet`] per axis, e.g. the two veins `[1-4; 1-44]` and
//! `[5-10; 35-44]`. Folding keeps the vein list minimal: veins that differ
//! on at most one axis are merged until a fixed point is reached.

use std::collections::BTreeSet;
use std::fmt;

use super::{Index, RangeSet};

/// N-dimensional set of index tuples, stored as folded veins.
#[derive(Debug, Clone, Default)]
pub struct RangeSetND {
    veins: Vec<Vec<RangeSet>>,
    autostep: Option<usize>,
    multivar_hint: bool,
}

impl RangeSetND {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of veins (one `RangeSet` per axis per vein).
    /// All veins must have the same number of axes.
    pub fn from_veins(veins: Vec<Vec<RangeSet>>) -> Self {
        let mut nd = RangeSetND::new();
        for vein in veins {
            nd.push_vein(vein);
        }
        nd.fold();
        nd
    }

    /// Build from a single index tuple.
    pub fn from_tuple(tuple: &[Index]) -> Self {
        let vein = tuple
            .iter()
            .map(|i| RangeSet::from_index(i.value(), i.width()))
            .collect();
        let mut nd = RangeSetND::new();
        nd.push_vein(vein);
        nd
    }

    fn push_vein(&mut self, vein: Vec<RangeSet>) {
        if vein.iter().any(|rg| rg.is_empty()) {
            return;
        }
        debug_assert!(self.veins.is_empty() || self.veins[0].len() == vein.len());
        self.veins.push(vein);
    }

    pub fn autostep(&self) -> Option<usize> {
        self.autostep
    }

    pub fn set_autostep(&mut self, autostep: Option<usize>) {
        self.autostep = autostep;
        for vein in &mut self.veins {
            for rg in vein {
                rg.set_autostep(autostep);
            }
        }
    }

    /// Number of axes (0 when empty).
    pub fn dim(&self) -> usize {
        self.veins.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.veins.is_empty()
    }

    /// Count unique tuples.
    pub fn len(&self) -> usize {
        self.veins
            .iter()
            .map(|vein| vein.iter().map(RangeSet::len).product::<usize>())
            .sum()
    }

    /// Largest padding length per axis.
    pub fn pads(&self) -> Vec<u32> {
        let dim = self.dim();
        let mut pads = vec![0u32; dim];
        for vein in &self.veins {
            for (axis, rg) in vein.iter().enumerate() {
                pads[axis] = pads[axis].max(rg.padding().unwrap_or(0));
            }
        }
        pads
    }

    /// Access the folded veins.
    pub fn vectors(&self) -> &[Vec<RangeSet>] {
        &self.veins
    }

    /// Iterate over tuples, vein by vein, cartesian order within a vein.
    pub fn iter(&self) -> impl Iterator<Item = Vec<Index>> + '_ {
        self.veins.iter().flat_map(cartesian)
    }

    /// Tuple at position `n` in iteration order.
    pub fn nth(&self, n: usize) -> Option<Vec<Index>> {
        self.iter().nth(n)
    }

    /// Sub-set of the tuples at positions `[start, stop)`.
    pub fn slice(&self, start: usize, stop: usize) -> RangeSetND {
        let mut nd = RangeSetND {
            veins: Vec::new(),
            autostep: self.autostep,
            multivar_hint: false,
        };
        for tuple in self.iter().skip(start).take(stop.saturating_sub(start)) {
            nd.push_vein(
                tuple
                    .iter()
                    .map(|i| RangeSet::from_index(i.value(), i.width()))
                    .collect(),
            );
        }
        nd.fold();
        nd
    }

    /// Iterate over contiguous sub-sets along every axis.
    pub fn contiguous(&self) -> Vec<RangeSetND> {
        let dim = self.dim();
        let mut veins: Vec<Vec<RangeSet>> = self.veins.clone();
        for axis in 0..dim {
            let mut next = Vec::new();
            for vein in &veins {
                for part in vein[axis].contiguous() {
                    let mut v = vein.clone();
                    v[axis] = part;
                    next.push(v);
                }
            }
            veins = next;
        }
        veins
            .into_iter()
            .map(|v| {
                let mut nd = RangeSetND::new();
                nd.autostep = self.autostep;
                nd.push_vein(v);
                nd
            })
            .collect()
    }

    pub fn contains_tuple(&self, tuple: &[Index]) -> bool {
        self.is_superset(&RangeSetND::from_tuple(tuple))
    }

    pub fn is_superset(&self, other: &RangeSetND) -> bool {
        if other.veins.is_empty() {
            return true;
        }
        if self.dim() == 1 && other.dim() == 1 {
            let mine = &self.veins[0][0];
            return other.veins.iter().all(|v| mine.is_superset(&v[0]));
        }
        let mut test = other.clone();
        test.difference_update(self);
        test.is_empty()
    }

    pub fn is_subset(&self, other: &RangeSetND) -> bool {
        other.is_superset(self)
    }

    /// Add all tuples of `other` to this set.
    pub fn update(&mut self, other: &RangeSetND) {
        for vein in &other.veins {
            let mut cpy: Vec<RangeSet> = vein.to_vec();
            for rg in &mut cpy {
                rg.set_autostep(self.autostep);
            }
            self.push_vein(cpy);
        }
        self.fold();
    }

    pub fn union(&self, other: &RangeSetND) -> RangeSetND {
        let mut nd = self.clone();
        nd.update(other);
        nd
    }

    /// Remove all tuples of `other`, refining veins axis by axis.
    pub fn difference_update(&mut self, other: &RangeSetND) {
        let mut result: Vec<Vec<RangeSet>> = Vec::new();
        for vein1 in &self.veins {
            // refine this vein against every vein of `other`
            let mut pending: Vec<Vec<RangeSet>> = vec![vein1.clone()];
            for vein2 in &other.veins {
                let mut next: Vec<Vec<RangeSet>> = Vec::new();
                for current in pending {
                    let mut pieces: Vec<Vec<RangeSet>> = Vec::new();
                    let mut disjoint = false;
                    for (axis, (rg1, rg2)) in current.iter().zip(vein2.iter()).enumerate() {
                        if rg1.is_subset(rg2) {
                            continue;
                        } else if rg1.intersects(rg2) {
                            let mut piece = current.clone();
                            piece[axis] = rg1.difference(rg2);
                            pieces.push(piece);
                        } else {
                            disjoint = true;
                            break;
                        }
                    }
                    if disjoint {
                        next.push(current);
                    } else {
                        next.extend(pieces);
                    }
                }
                pending = next;
            }
            result.extend(pending);
        }
        self.veins = result;
        self.fold();
    }

    pub fn difference(&self, other: &RangeSetND) -> RangeSetND {
        let mut nd = self.clone();
        nd.difference_update(other);
        nd
    }

    /// Keep only tuples also found in `other` (pairwise per-axis
    /// intersection of veins).
    pub fn intersection_update(&mut self, other: &RangeSetND) {
        let mut result: Vec<Vec<RangeSet>> = Vec::new();
        for vein1 in &self.veins {
            for vein2 in &other.veins {
                let ivein: Vec<RangeSet> = vein1
                    .iter()
                    .zip(vein2.iter())
                    .map(|(a, b)| a.intersection(b))
                    .collect();
                if ivein.iter().all(|rg| !rg.is_empty()) {
                    result.push(ivein);
                }
            }
        }
        self.veins = result;
        self.fold();
    }

    pub fn intersection(&self, other: &RangeSetND) -> RangeSetND {
        let mut nd = self.clone();
        nd.intersection_update(other);
        nd
    }

    pub fn symmetric_difference_update(&mut self, other: &RangeSetND) {
        let only_other = other.difference(self);
        self.difference_update(other);
        self.update(&only_other);
    }

    pub fn symmetric_difference(&self, other: &RangeSetND) -> RangeSetND {
        let mut nd = self.clone();
        nd.symmetric_difference_update(other);
        nd
    }

    /// N-dimensional vein sort: larger veins first, then per axis larger
    /// axis first, lower first index, lower last index.
    fn sort_veins(&mut self) {
        self.veins.sort_by(|a, b| {
            let size_a: usize = a.iter().map(RangeSet::len).product();
            let size_b: usize = b.iter().map(RangeSet::len).product();
            size_b.cmp(&size_a).then_with(|| {
                for (ra, rb) in a.iter().zip(b.iter()) {
                    let ord = rb
                        .len()
                        .cmp(&ra.len())
                        .then_with(|| ra.nth(0).cmp(&rb.nth(0)))
                        .then_with(|| ra.nth(ra.len() - 1).cmp(&rb.nth(rb.len() - 1)));
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            })
        });
    }

    /// In-place folding to the minimal vein list.
    fn fold(&mut self) {
        if self.veins.len() <= 1 {
            return;
        }
        if !self.fold_univariate() {
            self.fold_multivariate();
        }
    }

    /// Fast path: when at most one axis varies across veins, merge
    /// everything into the first vein. Returns false when the full
    /// multivariate merge is required.
    fn fold_univariate(&mut self) -> bool {
        let dim = self.dim();
        let mut vardim = 0;
        let mut dimdiff = 0;
        if dim > 1 {
            for axis in 0..dim {
                let first = &self.veins[0][axis];
                if self.veins.iter().any(|v| &v[axis] != first) {
                    dimdiff += 1;
                    if dimdiff > 1 {
                        break;
                    }
                    vardim = axis;
                }
            }
        }
        let univar = dim <= 1 || dimdiff <= 1;
        if univar {
            let (head, tail) = self.veins.split_at_mut(1);
            for vein in tail.iter() {
                head[0][vardim].union_update(&vein[vardim]);
            }
            self.veins.truncate(1);
        }
        self.multivar_hint = !univar;
        univar
    }

    /// Full multivariate fold: expand to unique tuples, then merge veins
    /// that differ on at most one axis until a fixed point.
    fn fold_multivariate(&mut self) {
        // phase 1: expand with respect to uniqueness
        let tuples: BTreeSet<Vec<Index>> = self.iter().collect();
        self.veins = tuples
            .into_iter()
            .map(|tuple| {
                tuple
                    .iter()
                    .map(|i| {
                        let mut rg = RangeSet::from_index(i.value(), i.width());
                        rg.set_autostep(self.autostep);
                        rg
                    })
                    .collect()
            })
            .collect();

        // phase 2: merge
        let mut full = false; // easy O(n) passes first
        let mut chg = true;
        while chg {
            chg = false;
            self.sort_veins();
            let mut index1 = 0;
            while index1 + 1 < self.veins.len() {
                let mut item1 = self.veins[index1].clone();
                index1 += 1;
                let mut index2 = index1;
                while index2 < self.veins.len() {
                    let merged = merge_veins(&item1, &self.veins[index2]);
                    match merged {
                        Some(new_item) => {
                            chg = true;
                            item1 = new_item.clone();
                            self.veins[index1 - 1] = new_item;
                            self.veins.remove(index2);
                        }
                        None => {
                            index2 += 1;
                            if !full {
                                // easy pass: do not scan all of index2
                                break;
                            }
                        }
                    }
                }
            }
            if !chg && !full {
                // final full O(n^2) pass, once cheap passes are exhausted
                chg = true;
                full = true;
            }
        }
    }
}

/// Merge two veins when they differ on at most one axis; returns the
/// merged vein, or None when they are not mergeable.
fn merge_veins(item1: &[RangeSet], item2: &[RangeSet]) -> Option<Vec<RangeSet>> {
    let mut new_item: Vec<RangeSet> = Vec::with_capacity(item1.len());
    let mut nb_diff = 0;
    for (rg1, rg2) in item1.iter().zip(item2.iter()) {
        if rg1 == rg2 {
            new_item.push(rg1.clone());
        } else if !rg1.intersects(rg2) {
            nb_diff += 1;
            if nb_diff > 1 {
                return None;
            }
            new_item.push(rg1.union(rg2));
        } else if rg1.is_superset(rg2) || rg1.is_subset(rg2) {
            nb_diff += 1;
            if nb_diff > 1 {
                return None;
            }
            if rg1.len() >= rg2.len() {
                new_item.push(rg1.clone());
            } else {
                new_item.push(rg2.clone());
            }
        } else {
            // partial overlap: not mergeable on this pass
            return None;
        }
    }
    Some(new_item)
}

fn cartesian(vein: &Vec<RangeSet>) -> Vec<Vec<Index>> {
    let mut out: Vec<Vec<Index>> = vec![Vec::new()];
    for rg in vein {
        let mut next = Vec::with_capacity(out.len() * rg.len());
        for prefix in &out {
            for idx in rg.iter() {
                let mut t = prefix.clone();
                t.push(idx);
                next.push(t);
            }
        }
        out = next;
    }
    out
}

impl PartialEq for RangeSetND {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_superset(other)
    }
}

impl Eq for RangeSetND {}

impl fmt::Display for RangeSetND {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for vein in &self.veins {
            let axes: Vec<String> = vein.iter().map(|rg| rg.to_string()).collect();
            writeln!(f, "{}", axes.join("; "))?;
        }
        Ok(())
    }
}
