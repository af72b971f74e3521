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

//! Cluster range set support
//!
//! A [`RangeSet`] is a set of zero-padding-aware integer indexes with a
//! compact textual form, e.g. `1-5,7,10-20/2` or `001-128`. It is the
//! numeric backbone of [`crate::nodeset::NodeSet`].
//!
//! # Syntax
//!
//! - Single index: `5`
//! - Range: `5-10` (inclusive)
//! - Stepped range: `0-10/2`
//! - Union: `1-5,8,10-12`
//! - Zero padding: `001-100` (both endpoints must have the same length
//!   when either is padded)
//!
//! # Examples
//!
//! ```rust
//! use muster::rangeset::RangeSet;
//!
//! let rs: RangeSet = "5,10-12".parse().unwrap();
//! assert_eq!(rs.len(), 4);
//! assert_eq!(rs.to_string(), "5,10-12");
//!
//! let padded: RangeSet = "01-03".parse().unwrap();
//! assert_eq!(padded.strings().collect::<Vec<_>>(), vec!["01", "02", "03"]);
//! ```

mod error;
pub mod nd;

pub use error::RangeSetError;
pub use nd::RangeSetND;

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Sub};
use std::str::FromStr;

/// Upper bound on the number of indexes a single subrange may expand to.
const MAX_RANGE_SIZE: u64 = 100_000_000;

/// One set element: an integer index with a display width.
///
/// `width` is the number of characters of the textual form; it exceeds the
/// natural digit count only for zero-padded indexes. Ordering is by
/// `(width, value)`, which puts `2` before `01` before `001` and keeps
/// plain numeric order for unpadded indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index {
    width: u32,
    value: u64,
}

fn digit_count(value: u64) -> u32 {
    value.checked_ilog10().unwrap_or(0) + 1
}

impl Index {
    /// Build an index from a value and a zero-padding length (0 = no pad).
    pub fn new(value: u64, pad: u32) -> Self {
        Index {
            width: pad.max(digit_count(value)),
            value,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// True when the textual form carries leading zeros.
    pub fn is_padded(&self) -> bool {
        self.width > digit_count(self.value)
    }

    fn parse(s: &str) -> Result<Self, RangeSetError> {
        if s.is_empty() {
            return Err(RangeSetError::EmptyRange {
                subrange: s.to_string(),
            });
        }
        let value: u64 = s.parse().map_err(|_| RangeSetError::InvalidNumber {
            subrange: s.to_string(),
        })?;
        Ok(Index {
            width: s.len() as u32,
            value,
        })
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.value, width = self.width as usize)
    }
}

/// Mutable set of cluster node indexes with a fast range-based textual form.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    indexes: BTreeSet<Index>,
    autostep: Option<usize>,
}

/// A folded run of indexes, as printed: `start`, `start-end` or
/// `start-end/step`, zero-padded to `pad` characters when `pad > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    start: u64,
    end: u64,
    step: u64,
    pad: u32,
}

impl RangeSet {
    /// Create an empty range set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a range set expression with an explicit autostep threshold.
    pub fn parse_with(pattern: &str, autostep: Option<usize>) -> Result<Self, RangeSetError> {
        let mut rs = RangeSet {
            indexes: BTreeSet::new(),
            autostep,
        };
        rs.update_from_str(pattern)?;
        Ok(rs)
    }

    /// Build a set holding a single index.
    pub fn from_index(value: u64, pad: u32) -> Self {
        let mut rs = RangeSet::new();
        rs.indexes.insert(Index::new(value, pad));
        rs
    }

    /// Build a set from plain integer values (no padding).
    pub fn from_ints<I: IntoIterator<Item = u64>>(values: I) -> Self {
        let mut rs = RangeSet::new();
        for v in values {
            rs.indexes.insert(Index::new(v, 0));
        }
        rs
    }

    /// Parse and merge a range set expression into this set.
    pub fn update_from_str(&mut self, pattern: &str) -> Result<(), RangeSetError> {
        for subrange in pattern.split(',') {
            let subrange = subrange.trim();
            self.add_subrange(subrange)?;
        }
        Ok(())
    }

    /// Parse one `a`, `a-b` or `a-b/step` subrange.
    fn add_subrange(&mut self, subrange: &str) -> Result<(), RangeSetError> {
        let err_sub = || subrange.to_string();

        let (baserange, step) = match subrange.split_once('/') {
            Some((base, step_str)) => {
                let step: u64 = step_str.parse().map_err(|_| RangeSetError::InvalidNumber {
                    subrange: err_sub(),
                })?;
                (base, step)
            }
            None => (subrange, 1),
        };

        let (begin, end) = match baserange.split_once('-') {
            Some((b, e)) => (b.trim(), e.trim()),
            None => {
                if step != 1 {
                    return Err(RangeSetError::InvalidStep { subrange: err_sub() });
                }
                (baserange, baserange)
            }
        };

        if begin.is_empty() || end.is_empty() {
            return Err(RangeSetError::EmptyRange { subrange: err_sub() });
        }

        let start = Index::parse(begin).map_err(|_| RangeSetError::InvalidNumber {
            subrange: err_sub(),
        })?;
        let stop = Index::parse(end).map_err(|_| RangeSetError::InvalidNumber {
            subrange: err_sub(),
        })?;

        // A padded endpoint fixes the width of the whole subrange.
        let pad = if start.is_padded() || stop.is_padded() {
            if begin.len() != end.len() {
                return Err(RangeSetError::PaddingMismatch { subrange: err_sub() });
            }
            begin.len() as u32
        } else {
            0
        };

        if start.value > stop.value || step < 1 {
            return Err(RangeSetError::ReversedRange { subrange: err_sub() });
        }

        self.add_range(start.value, stop.value + 1, step, pad)
            .map_err(|_| RangeSetError::RangeTooLarge { subrange: err_sub() })
    }

    /// Add a `[start, stop)` range of indexes with the given step and
    /// zero-padding length.
    pub fn add_range(&mut self, start: u64, stop: u64, step: u64, pad: u32) -> Result<(), ()> {
        if start >= stop || step == 0 || stop - start > MAX_RANGE_SIZE {
            return Err(());
        }
        let mut v = start;
        while v < stop {
            self.indexes.insert(Index::new(v, pad));
            v = match v.checked_add(step) {
                Some(n) => n,
                None => break,
            };
        }
        Ok(())
    }

    /// Autostep threshold: the minimum number of equally-spaced indexes
    /// required before `a-b/step` syntax is used when folding.
    pub fn autostep(&self) -> Option<usize> {
        self.autostep
    }

    pub fn set_autostep(&mut self, autostep: Option<usize>) {
        self.autostep = autostep;
    }

    /// Set the autostep threshold as a fraction of the set length,
    /// converted with `ceil(len * percent)`.
    pub fn set_autostep_percent(&mut self, percent: f64) {
        let count = (self.len() as f64 * percent).ceil() as usize;
        self.autostep = Some(count.max(1));
    }

    /// Largest zero-padding length in the set, if any index is padded.
    pub fn padding(&self) -> Option<u32> {
        self.indexes
            .iter()
            .filter(|i| i.is_padded())
            .map(|i| i.width)
            .max()
    }

    /// Force a zero-padding length on every index of the set.
    pub fn set_padding(&mut self, pad: u32) {
        let values: Vec<u64> = self.indexes.iter().map(|i| i.value).collect();
        self.indexes.clear();
        for v in values {
            self.indexes.insert(Index::new(v, pad));
        }
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Iterate over indexes in canonical `(width, value)` order.
    pub fn iter(&self) -> impl Iterator<Item = Index> + '_ {
        self.indexes.iter().copied()
    }

    /// Iterate over integer values, padding ignored.
    pub fn ints(&self) -> impl Iterator<Item = u64> + '_ {
        self.indexes.iter().map(|i| i.value)
    }

    /// Iterate over indexes as zero-padded strings.
    pub fn strings(&self) -> impl Iterator<Item = String> + '_ {
        self.indexes.iter().map(|i| i.to_string())
    }

    pub fn insert(&mut self, index: Index) {
        self.indexes.insert(index);
    }

    /// Add a single index with padding length.
    pub fn add(&mut self, value: u64, pad: u32) {
        self.indexes.insert(Index::new(value, pad));
    }

    /// Remove an index; report whether it was present.
    pub fn discard(&mut self, value: u64, pad: u32) -> bool {
        self.indexes.remove(&Index::new(value, pad))
    }

    pub fn clear(&mut self) {
        self.indexes.clear();
    }

    /// Membership test on an unpadded integer value.
    pub fn contains(&self, value: u64) -> bool {
        self.indexes.contains(&Index::new(value, 0))
    }

    /// Membership test on a textual index (`"05"` only matches a
    /// width-2 element).
    pub fn contains_str(&self, s: &str) -> bool {
        match Index::parse(s) {
            Ok(idx) => self.indexes.contains(&idx),
            Err(_) => false,
        }
    }

    pub fn is_superset(&self, other: &RangeSet) -> bool {
        other.indexes.is_subset(&self.indexes)
    }

    pub fn is_subset(&self, other: &RangeSet) -> bool {
        self.indexes.is_subset(&other.indexes)
    }

    pub fn intersects(&self, other: &RangeSet) -> bool {
        !self.indexes.is_disjoint(&other.indexes)
    }

    // Set arithmetic. Functional forms return a new set carrying this
    // set's autostep; in-place forms mutate self.

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut rs = self.clone();
        rs.union_update(other);
        rs
    }

    pub fn union_update(&mut self, other: &RangeSet) {
        self.indexes.extend(other.indexes.iter().copied());
    }

    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        let mut rs = self.clone();
        rs.intersection_update(other);
        rs
    }

    pub fn intersection_update(&mut self, other: &RangeSet) {
        self.indexes = self
            .indexes
            .intersection(&other.indexes)
            .copied()
            .collect();
    }

    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let mut rs = self.clone();
        rs.difference_update(other);
        rs
    }

    pub fn difference_update(&mut self, other: &RangeSet) {
        self.indexes = self.indexes.difference(&other.indexes).copied().collect();
    }

    pub fn symmetric_difference(&self, other: &RangeSet) -> RangeSet {
        let mut rs = self.clone();
        rs.symmetric_difference_update(other);
        rs
    }

    pub fn symmetric_difference_update(&mut self, other: &RangeSet) {
        self.indexes = self
            .indexes
            .symmetric_difference(&other.indexes)
            .copied()
            .collect();
    }

    /// Index at position `n` in canonical order.
    pub fn nth(&self, n: usize) -> Option<Index> {
        self.indexes.iter().nth(n).copied()
    }

    /// Sub-set of the elements at positions `[start, stop)`.
    pub fn slice(&self, start: usize, stop: usize) -> RangeSet {
        let mut rs = RangeSet {
            indexes: BTreeSet::new(),
            autostep: self.autostep,
        };
        for idx in self.indexes.iter().skip(start).take(stop.saturating_sub(start)) {
            rs.indexes.insert(*idx);
        }
        rs
    }

    /// Split into at most `n` sets of balanced sizes, in order.
    pub fn split(&self, n: usize) -> Vec<RangeSet> {
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

    /// Keep only the `n` first indexes in canonical order.
    pub fn pick(&mut self, n: usize) {
        if self.len() > n {
            *self = self.slice(0, n);
        }
    }

    /// Iterate over maximal contiguous sub-sets.
    pub fn contiguous(&self) -> Vec<RangeSet> {
        self.runs(None)
            .into_iter()
            .map(|run| {
                let mut rs = RangeSet {
                    indexes: BTreeSet::new(),
                    autostep: self.autostep,
                };
                // contiguous runs always have step 1
                let _ = rs.add_range(run.start, run.end + 1, run.step, run.pad);
                rs
            })
            .collect()
    }

    /// Fold the sorted indexes into printable runs.
    ///
    /// Indexes are first cut into pad-compatible segments: a segment
    /// opened by a padded index only accepts indexes of the same width,
    /// while a segment opened unpadded only accepts unpadded indexes.
    /// Within a segment, contiguous values fold to `a-b`; when `autostep`
    /// is set, a leftmost maximal equally-stepped run of at least that
    /// many values folds to `a-b/step`.
    fn runs(&self, autostep: Option<usize>) -> Vec<Run> {
        let mut out = Vec::new();
        let mut seg: Vec<u64> = Vec::new();
        let mut seg_pad = 0u32;
        let mut seg_padded = false;
        let mut seg_width = 0u32;

        let flush = |seg: &mut Vec<u64>, pad: u32, out: &mut Vec<Run>| {
            Self::fold_segment(seg, pad, autostep, out);
            seg.clear();
        };

        for idx in &self.indexes {
            let padded = idx.is_padded();
            if seg.is_empty() {
                seg_padded = padded;
                seg_width = idx.width;
                seg_pad = if padded { idx.width } else { 0 };
            } else {
                let mismatch = if seg_padded {
                    idx.width != seg_width
                } else {
                    padded
                };
                if mismatch {
                    flush(&mut seg, seg_pad, &mut out);
                    seg_padded = padded;
                    seg_width = idx.width;
                    seg_pad = if padded { idx.width } else { 0 };
                }
            }
            seg.push(idx.value);
        }
        flush(&mut seg, seg_pad, &mut out);
        out
    }

    fn fold_segment(values: &[u64], pad: u32, autostep: Option<usize>, out: &mut Vec<Run>) {
        let n = values.len();
        let mut i = 0;
        while i < n {
            // longest equal-step run starting at i
            let mut j = i;
            let step = if i + 1 < n { values[i + 1] - values[i] } else { 0 };
            if step > 0 {
                while j + 1 < n && values[j + 1] - values[j] == step {
                    j += 1;
                }
            }
            let runlen = j - i + 1;

            if step == 1 && runlen >= 2 {
                out.push(Run {
                    start: values[i],
                    end: values[j],
                    step: 1,
                    pad,
                });
                i = j + 1;
            } else if step > 1 && autostep.is_some_and(|k| runlen >= k.max(1)) {
                out.push(Run {
                    start: values[i],
                    end: values[j],
                    step,
                    pad,
                });
                i = j + 1;
            } else {
                out.push(Run {
                    start: values[i],
                    end: values[i],
                    step: 1,
                    pad,
                });
                i += 1;
            }
        }
    }
}

impl PartialEq for RangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.indexes == other.indexes
    }
}

impl Eq for RangeSet {}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for run in self.runs(self.autostep) {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            let pad = run.pad as usize;
            if run.start == run.end {
                write!(f, "{:0pad$}", run.start)?;
            } else if run.step == 1 {
                write!(f, "{:0pad$}-{:0pad$}", run.start, run.end)?;
            } else {
                write!(f, "{:0pad$}-{:0pad$}/{}", run.start, run.end, run.step)?;
            }
        }
        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = RangeSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RangeSet::parse_with(s, None)
    }
}

impl<'a> BitOr for &'a RangeSet {
    type Output = RangeSet;
    fn bitor(self, rhs: Self) -> RangeSet {
        self.union(rhs)
    }
}

impl<'a> BitAnd for &'a RangeSet {
    type Output = RangeSet;
    fn bitand(self, rhs: Self) -> RangeSet {
        self.intersection(rhs)
    }
}

impl<'a> Sub for &'a RangeSet {
    type Output = RangeSet;
    fn sub(self, rhs: Self) -> RangeSet {
        self.difference(rhs)
    }
}

impl<'a> BitXor for &'a RangeSet {
    type Output = RangeSet;
    fn bitxor(self, rhs: Self) -> RangeSet {
        self.symmetric_difference(rhs)
    }
}
