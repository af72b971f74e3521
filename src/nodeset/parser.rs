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

//! Node set expression scanner
//!
//! Parses extended node set strings with left-to-right evaluation of the
//! `,` (union), `!` (difference), `&` (intersection) and `^` (symmetric
//! difference) operators, bracket ranges, `@` group references and shell
//! wildcards.

use std::collections::BTreeSet;

use crate::rangeset::RangeSet;

use super::error::NodeSetError;
use super::resolver::{GroupResolver, ResolverError};
use super::{NodeSet, Ranges};

/// Parse an extended node set expression.
pub(crate) fn parse(
    nsstr: &str,
    resolver: &dyn GroupResolver,
    autostep: Option<usize>,
) -> Result<NodeSet, NodeSetError> {
    let escaped = nsstr.trim().replace('%', "%%");
    parse_in_namespace(&escaped, resolver, autostep, true, None)
}

/// Parse a single node name (no operators, no brackets) into a one-node set.
pub(crate) fn parse_single(
    nsstr: &str,
    autostep: Option<usize>,
) -> Result<NodeSet, NodeSetError> {
    let escaped = nsstr.trim().replace('%', "%%");
    let (pat, rsets) = scan_single(&escaped, autostep)?;
    Ok(NodeSet::from_pattern(pat, Ranges::from_vec(rsets, autostep)))
}

fn parse_in_namespace(
    nsstr: &str,
    resolver: &dyn GroupResolver,
    autostep: Option<usize>,
    wildcards: bool,
    namespace: Option<&str>,
) -> Result<NodeSet, NodeSetError> {
    let mut nodeset = NodeSet::new();
    let mut alln_cache: Option<BTreeSet<String>> = None;

    for (op, pat, rsets) in scan_string(nsstr, autostep)? {
        let operand = NodeSet::from_pattern(pat.clone(), Ranges::from_vec(rsets, autostep));

        if pat.starts_with('@') && resolver.has_groups() {
            // group reference: expand each group name (ranges allowed in
            // group names, e.g. @rack[1-3]) and parse the resolved strings,
            // which may themselves contain groups
            let mut group_ns = NodeSet::new();
            for nodegroup in operand.iter() {
                let (ext_str, ext_namespace) =
                    parse_group_string(&nodegroup, namespace, resolver, autostep)?;
                if !ext_str.is_empty() {
                    let sub = parse_in_namespace(
                        &ext_str.replace('%', "%%"),
                        resolver,
                        autostep,
                        wildcards,
                        ext_namespace.as_deref(),
                    )?;
                    group_ns.update(&sub);
                }
            }
            apply(&mut nodeset, op, group_ns);
        } else if wildcards
            && resolver.has_groups()
            && (pat.contains('*') || pat.contains('?'))
        {
            // wildcard mask matched against the "all nodes" reference set
            if alln_cache.is_none() {
                let mut nsb = NodeSet::new();
                for res in all_nodes(resolver, namespace)? {
                    // wildcard support disabled here to avoid recursion
                    let sub = parse_in_namespace(
                        &res.replace('%', "%%"),
                        resolver,
                        autostep,
                        false,
                        namespace,
                    )?;
                    nsb.update(&sub);
                }
                alln_cache = Some(nsb.iter().collect());
            }
            let mut avail = alln_cache.clone().unwrap_or_default();

            let mut wcns = NodeSet::new();
            for wcmask in operand.iter() {
                let pattern =
                    glob::Pattern::new(&wcmask).map_err(|_| NodeSetError::Parse {
                        part: wcmask.clone(),
                    })?;
                let matched: Vec<String> = avail
                    .iter()
                    .filter(|node| pattern.matches(node))
                    .cloned()
                    .collect();
                for node in matched {
                    avail.remove(&node);
                    let (wcp, wcr) = scan_single(&node.replace('%', "%%"), autostep)?;
                    wcns.update(&NodeSet::from_pattern(
                        wcp,
                        Ranges::from_vec(wcr, autostep),
                    ));
                }
            }
            apply(&mut nodeset, op, wcns);
        } else {
            apply(&mut nodeset, op, operand);
        }
    }
    Ok(nodeset)
}

fn apply(nodeset: &mut NodeSet, op: char, operand: NodeSet) {
    match op {
        ',' => nodeset.update(&operand),
        '!' => nodeset.difference_update(&operand),
        '&' => nodeset.intersection_update(&operand),
        '^' => nodeset.symmetric_difference_update(&operand),
        _ => unreachable!("unknown operator"),
    }
}

/// Resolve one `@...` reference into a node set string (one pass; the
/// result may still contain groups). Returns the string and the namespace
/// to parse it in.
fn parse_group_string(
    nodegroup: &str,
    namespace: Option<&str>,
    resolver: &dyn GroupResolver,
    autostep: Option<usize>,
) -> Result<(String, Option<String>), NodeSetError> {
    debug_assert!(nodegroup.starts_with('@'));
    let grpstr = &nodegroup[1..];
    let (namespace, group): (Option<String>, &str) = match grpstr.split_once(':') {
        // specified namespace does always override
        Some((ns, grp)) => (Some(ns.to_string()), grp),
        None => (namespace.map(str::to_string), grpstr),
    };

    let reslist = if group == "*" {
        // @* or @source:* magic
        all_nodes(resolver, namespace.as_deref())?
    } else if let Some(src) = group.strip_prefix('@') {
        // @@source group name list
        grouplist(resolver, Some(src), autostep)?
    } else {
        resolver.group_nodes(group, namespace.as_deref())?
    };
    Ok((reslist.join(","), namespace))
}

/// Sorted group names of a source, ranges in group names expanded.
pub(crate) fn grouplist(
    resolver: &dyn GroupResolver,
    namespace: Option<&str>,
    autostep: Option<usize>,
) -> Result<Vec<String>, NodeSetError> {
    let mut grpset = NodeSet::new();
    for grpstr in resolver.group_list(namespace)? {
        let escaped = grpstr.trim().replace('%', "%%");
        for (op, pat, rsets) in scan_string(&escaped, autostep)? {
            apply(
                &mut grpset,
                op,
                NodeSet::from_pattern(pat, Ranges::from_vec(rsets, autostep)),
            );
        }
    }
    Ok(grpset.iter().collect())
}

/// All nodes of a source, using the `all` upcall or falling back to
/// `list` + `map`.
pub(crate) fn all_nodes(
    resolver: &dyn GroupResolver,
    namespace: Option<&str>,
) -> Result<Vec<String>, NodeSetError> {
    match resolver.all_nodes(namespace) {
        Ok(alln) => Ok(alln),
        Err(ResolverError::NoUpcall { .. }) => {
            let mut alln = Vec::new();
            match grouplist(resolver, namespace, None) {
                Ok(groups) => {
                    for grp in groups {
                        alln.extend(resolver.group_nodes(&grp, namespace)?);
                    }
                    Ok(alln)
                }
                Err(NodeSetError::External {
                    source: ResolverError::NoUpcall { .. },
                }) => Err(NodeSetError::AllNodesUnavailable {
                    group_source: namespace.unwrap_or("default").to_string(),
                }),
                Err(other) => Err(other),
            }
        }
        Err(other) => Err(NodeSetError::External { source: other }),
    }
}

fn next_op(s: &str) -> Option<(usize, char)> {
    s.char_indices()
        .find(|(_, c)| matches!(c, ',' | '!' | '&' | '^'))
}

/// Scan an extended pattern string into `(operator, pattern, rangesets)`
/// triples. The pattern is a skeleton with one `%s` per bracket group.
fn scan_string(
    nsstr: &str,
    autostep: Option<usize>,
) -> Result<Vec<(char, String, Vec<RangeSet>)>, NodeSetError> {
    let mut out = Vec::new();
    let mut next_op_code = ','; // default operator is union
    let mut rest: Option<String> = Some(nsstr.to_string());

    while let Some(cur) = rest.take() {
        let cur = cur.trim_start().to_string();
        if cur.is_empty() {
            break;
        }
        let op_code = next_op_code;

        let op_idx = next_op(&cur).map(|(i, _)| i);
        let bracket_idx = cur.find('[');
        let has_pattern = match (bracket_idx, op_idx) {
            (Some(b), Some(o)) => o > b,
            (Some(_), None) => true,
            _ => false,
        };

        if has_pattern {
            // a pattern of potentially several nodes, e.g. "web[3,4-10]-ilo"
            let mut newpat = String::new();
            let mut rsets: Vec<RangeSet> = Vec::new();
            let mut sfx: String = cur.clone();

            loop {
                let bracket_idx = sfx.find('[');
                let op_idx = next_op(&sfx).map(|(i, _)| i);
                let proceed = match (bracket_idx, op_idx) {
                    (Some(b), Some(o)) => o > b,
                    (Some(_), None) => true,
                    _ => false,
                };
                if !proceed {
                    break;
                }

                let (pfx0, after) = sfx.split_once('[').expect("bracket present");
                let mut pfx = pfx0.to_string();
                let (rng0, sfx0) =
                    after
                        .split_once(']')
                        .ok_or_else(|| NodeSetError::MissingBracket {
                            part: cur.clone(),
                        })?;
                let mut rng = rng0.to_string();
                let mut sfx_new = sfx0.to_string();

                if pfx.contains(']') {
                    return Err(NodeSetError::IllegalClosingBracket { part: pfx });
                }
                if !sfx_new.is_empty() {
                    let bra_end = sfx_new.find(']');
                    let bra_start = sfx_new
                        .find('[')
                        .unwrap_or_else(|| bra_end.map_or(usize::MAX, |e| e + 1));
                    if let Some(e) = bra_end {
                        if e < bra_start {
                            return Err(NodeSetError::IllegalClosingBracket { part: sfx_new });
                        }
                    }
                }

                if !sfx_new.is_empty() {
                    // amending trailing digits generates /steps
                    let (s, r) = amend_trailing_digits(&sfx_new, &rng)?;
                    sfx_new = s;
                    rng = r;
                }

                if !pfx.is_empty() {
                    let (p, r) = amend_leading_digits(&pfx, &rng)?;
                    pfx = p;
                    rng = r;
                    if !pfx.is_empty() {
                        // scan any nonempty prefix as a single node
                        let (ppat, prvec) = scan_single(&pfx, autostep)?;
                        pfx = ppat;
                        rsets.extend(prvec);
                    }
                }

                if sfx_new.starts_with('[') {
                    return Err(NodeSetError::IllegalReopeningBracket { part: sfx_new });
                }

                newpat.push_str(&pfx);
                newpat.push_str("%s");
                rsets.push(
                    RangeSet::parse_with(&rng, autostep)
                        .map_err(|e| NodeSetError::bad_range(&rng, e))?,
                );
                sfx = sfx_new;
            }

            // check for a next op-separated node or pattern
            let (sfx_last, new_rest, consumed) = split_at_op(&sfx)?;
            let sfx_t = sfx_last.trim_end();
            if !sfx_t.is_empty() {
                let (spat, srvec) = scan_single(sfx_t, autostep)?;
                newpat.push_str(&spat);
                rsets.extend(srvec);
            }
            out.push((op_code, newpat, rsets));
            if let Some(c) = consumed {
                next_op_code = c;
            }
            rest = new_rest;
        } else {
            // plain node, or the bracket is after the operator
            let (node, new_rest, consumed) = split_at_op(&cur)?;
            if node.trim().is_empty() {
                return Err(NodeSetError::MissingOperand {
                    op: consumed.unwrap_or(op_code),
                });
            }
            if node.contains(']') {
                return Err(NodeSetError::IllegalClosingBracket { part: node });
            }
            let node = node.trim_end();
            let (pat, rsets) = scan_single(node, autostep)?;
            out.push((op_code, pat, rsets));
            if let Some(c) = consumed {
                next_op_code = c;
            }
            rest = new_rest;
        }
    }
    Ok(out)
}

/// Split a string at its first operator; a detected operator makes the
/// right operand mandatory.
fn split_at_op(s: &str) -> Result<(String, Option<String>, Option<char>), NodeSetError> {
    match next_op(s) {
        None => Ok((s.to_string(), None, None)),
        Some((i, c)) => {
            let left = s[..i].to_string();
            let right = s[i + 1..].to_string();
            if right.trim().is_empty() {
                return Err(NodeSetError::MissingOperand { op: c });
            }
            Ok((left, Some(right), Some(c)))
        }
    }
}

/// Scan a single node name into a `%s` skeleton and its rangesets, one per
/// digit run (`web12-eth0` -> `web%s-eth%s` + [12] + [0]).
pub(crate) fn scan_single(
    nsstr: &str,
    autostep: Option<usize>,
) -> Result<(String, Vec<RangeSet>), NodeSetError> {
    let mut pat = String::new();
    let mut rsets = Vec::new();
    let bytes = nsstr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let pfx = &nsstr[start..i];
        let dstart = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let idx = &nsstr[dstart..i];
        pat.push_str(pfx);
        if !idx.is_empty() {
            let value: u64 = idx.parse().map_err(|_| NodeSetError::Parse {
                part: nsstr.to_string(),
            })?;
            pat.push_str("%s");
            let mut rg = RangeSet::from_index(value, idx.len() as u32);
            rg.set_autostep(autostep);
            rsets.push(rg);
        }
    }
    Ok((pat, rsets))
}

/// Fuse digits glued before a bracket into the range:
/// `0[1-5]` becomes `[01-05]`.
fn amend_leading_digits(outer: &str, inner: &str) -> Result<(String, String), NodeSetError> {
    let stripped = outer.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.len() == outer.len() {
        return Ok((outer.to_string(), inner.to_string()));
    }
    let digits = &outer[stripped.len()..];
    let rs =
        RangeSet::parse_with(inner, None).map_err(|e| NodeSetError::bad_range(inner, e))?;
    let parts: Vec<String> = rs
        .contiguous()
        .iter()
        .map(|part| {
            part.to_string()
                .split('-')
                .map(|bound| format!("{digits}{bound}"))
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect();
    Ok((stripped.to_string(), parts.join(",")))
}

/// Fuse digits glued after a bracket into the range by shifting:
/// `[1-5]0` becomes `[10-50/10]`. Incompatible with explicit `/step`.
fn amend_trailing_digits(outer: &str, inner: &str) -> Result<(String, String), NodeSetError> {
    let stripped = outer.trim_start_matches(|c: char| c.is_ascii_digit());
    if stripped.len() == outer.len() {
        return Ok((outer.to_string(), inner.to_string()));
    }
    if inner.contains('/') {
        return Err(NodeSetError::TrailingDigitsAfterStep {
            part: outer.to_string(),
        });
    }
    let digits = &outer[..outer.len() - stripped.len()];
    let power = digits.len();
    let parts: Vec<String> = inner
        .split(',')
        .map(|elem| {
            let shifted = elem
                .split('-')
                .map(|bound| format!("{bound}{digits}"))
                .collect::<Vec<_>>()
                .join("-");
            if elem.contains('-') {
                // shifted ranges only hold every 10^power index
                format!("{shifted}/1{}", "0".repeat(power))
            } else {
                shifted
            }
        })
        .collect();
    Ok((stripped.to_string(), parts.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_single() {
        let (pat, rsets) = scan_single("web12-eth0", None).unwrap();
        assert_eq!(pat, "web%s-eth%s");
        assert_eq!(rsets.len(), 2);
        assert!(rsets[0].contains(12));
        assert!(rsets[1].contains(0));
    }

    #[test]
    fn test_scan_single_padded() {
        let (_, rsets) = scan_single("node007", None).unwrap();
        assert_eq!(rsets[0].strings().collect::<Vec<_>>(), vec!["007"]);
    }

    #[test]
    fn test_scan_string_brackets() {
        let scanned = scan_string("node[1-3]", None).unwrap();
        assert_eq!(scanned.len(), 1);
        let (op, pat, rsets) = &scanned[0];
        assert_eq!(*op, ',');
        assert_eq!(pat, "node%s");
        assert_eq!(rsets[0].to_string(), "1-3");
    }

    #[test]
    fn test_scan_string_operators() {
        let scanned = scan_string("a[1-4]!a[2-3]&a[1-9]^b7", None).unwrap();
        let ops: Vec<char> = scanned.iter().map(|(op, _, _)| *op).collect();
        assert_eq!(ops, vec![',', '!', '&', '^']);
    }

    #[test]
    fn test_scan_string_leading_digits() {
        let scanned = scan_string("node0[1-5]", None).unwrap();
        let (_, pat, rsets) = &scanned[0];
        assert_eq!(pat, "node%s");
        assert_eq!(rsets[0].to_string(), "01-05");
    }

    #[test]
    fn test_scan_string_trailing_digits() {
        let scanned = scan_string("node[1-2]0", None).unwrap();
        let (_, pat, rsets) = &scanned[0];
        assert_eq!(pat, "node%s");
        assert_eq!(rsets[0].ints().collect::<Vec<_>>(), vec![10, 20]);
    }

    #[test]
    fn test_trailing_digits_with_step_rejected() {
        assert!(matches!(
            scan_string("node[1-6/2]0", None),
            Err(NodeSetError::TrailingDigitsAfterStep { .. })
        ));
    }

    #[test]
    fn test_scan_string_errors() {
        assert!(matches!(
            scan_string("node[1-3", None),
            Err(NodeSetError::MissingBracket { .. })
        ));
        assert!(matches!(
            scan_string("node]1-3[", None),
            Err(NodeSetError::IllegalClosingBracket { .. })
        ));
        assert!(matches!(
            scan_string("node[1-3],", None),
            Err(NodeSetError::MissingOperand { .. })
        ));
        assert!(matches!(
            scan_string("node[1][2]", None),
            Err(NodeSetError::IllegalReopeningBracket { .. })
        ));
    }
}
