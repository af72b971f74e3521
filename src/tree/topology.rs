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

//! Propagation topology: routes table and first-hop resolution.
//!
//! Routes map a parent node set to a child node set, one per line:
//!
//! ```text
//! # adminnode fans out through two gateway racks
//! admin: gw[1-2]
//! gw[1-2]: node[1-128]
//! ```
//!
//! A router rooted at one node resolves, for any destination, the first
//! hop to go through; destinations absent from the graph are contacted
//! directly.

use std::collections::{BTreeSet, HashMap, VecDeque};

use thiserror::Error;

use crate::nodeset::{NodeSet, NodeSetError};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid routes line {lineno}: \"{line}\"")]
    BadLine { lineno: usize, line: String },

    #[error("invalid node set in routes: {0}")]
    BadNodeSet(#[from] NodeSetError),

    #[error("topology cycle detected through \"{node}\"")]
    Cycle { node: String },

    #[error("no reachable route to \"{node}\"")]
    Unreachable { node: String },

    /// Channel payload encoding failed while planning the propagation
    #[error(transparent)]
    Protocol(#[from] super::codec::ProtocolError),
}

/// Parsed routes table.
#[derive(Debug, Clone, Default)]
pub struct RoutesTable {
    routes: Vec<(NodeSet, NodeSet)>,
    source: String,
}

impl RoutesTable {
    /// Parse a routes table from text. `#` starts a comment; a bracketed
    /// section header line (e.g. `[routes]`) is accepted and skipped.
    pub fn parse(text: &str) -> Result<Self, TopologyError> {
        let mut routes = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() || (line.starts_with('[') && line.ends_with(']')) {
                continue;
            }
            let (parents, children) =
                line.split_once(':').ok_or_else(|| TopologyError::BadLine {
                    lineno: lineno + 1,
                    line: raw.to_string(),
                })?;
            let parents = NodeSet::parse(parents.trim())?;
            let children = NodeSet::parse(children.trim())?;
            if parents.is_empty() || children.is_empty() {
                return Err(TopologyError::BadLine {
                    lineno: lineno + 1,
                    line: raw.to_string(),
                });
            }
            routes.push((parents, children));
        }
        Ok(RoutesTable {
            routes,
            source: text.to_string(),
        })
    }

    /// Original text, forwarded verbatim to gateways for recursion.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Children node set directly connected below `node`.
    fn children_of(&self, node: &NodeSet) -> NodeSet {
        let mut out = NodeSet::new();
        for (parents, children) in &self.routes {
            if !parents.intersection(node).is_empty() {
                out.update(children);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// First-hop resolver for one root node.
#[derive(Debug, Clone)]
pub struct Router {
    root: String,
    /// node -> first hop from the root (first hop == node for direct
    /// children of the root)
    first_hop: HashMap<String, String>,
    /// gateways flagged unreachable at runtime
    dead: BTreeSet<String>,
    table: RoutesTable,
}

impl Router {
    /// Build the spanning tree below `root`. Rejects cyclic topologies.
    pub fn new(root: &str, table: &RoutesTable) -> Result<Self, TopologyError> {
        let mut first_hop: HashMap<String, String> = HashMap::new();
        let root_ns = single(root)?;

        // BFS from the root, propagating the first hop downward;
        // reconverging edges keep their first-seen hop
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();
        queue.push_back((root.to_string(), None));

        while let Some((node, hop)) = queue.pop_front() {
            let node_ns = if node == root {
                root_ns.clone()
            } else {
                single(&node)?
            };
            for child in table.children_of(&node_ns).iter() {
                if child == root || node == child {
                    return Err(TopologyError::Cycle { node: child });
                }
                if first_hop.contains_key(&child) {
                    continue;
                }
                let child_hop = hop.clone().unwrap_or_else(|| child.clone());
                first_hop.insert(child.clone(), child_hop.clone());
                queue.push_back((child.clone(), Some(child_hop)));
            }
        }

        Ok(Router {
            root: root.to_string(),
            first_hop,
            dead: BTreeSet::new(),
            table: table.clone(),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// First hop toward `dst`:
    /// - `Ok(None)`: contact directly (off-graph node or direct child)
    /// - `Ok(Some(gw))`: relay through gateway `gw`
    /// - `Err(Unreachable)`: in the graph but behind dead gateways only
    pub fn next_hop(&self, dst: &str) -> Result<Option<String>, TopologyError> {
        match self.first_hop.get(dst) {
            None => Ok(None), // not in the graph: direct contact
            Some(hop) if hop == dst => Ok(None), // direct child of the root
            Some(hop) if !self.dead.contains(hop) => Ok(Some(hop.clone())),
            Some(_) => Err(TopologyError::Unreachable {
                node: dst.to_string(),
            }),
        }
    }

    /// Flag a gateway as unreachable; targets behind it resolve to
    /// `Unreachable` from now on.
    pub fn mark_unreachable(&mut self, gateway: &str) {
        self.dead.insert(gateway.to_string());
    }

    /// All first-hop gateways currently alive.
    pub fn gateways(&self) -> BTreeSet<String> {
        self.first_hop
            .values()
            .filter(|gw| !self.dead.contains(*gw))
            .cloned()
            .collect()
    }

    pub fn table(&self) -> &RoutesTable {
        &self.table
    }
}

fn single(node: &str) -> Result<NodeSet, TopologyError> {
    Ok(NodeSet::parse(node)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
# two-level tree
admin: gw[1-2]
gw1: node[1-4]
gw2: node[5-8]
";

    #[test]
    fn test_parse_routes() {
        let table = RoutesTable::parse(ROUTES).unwrap();
        assert!(!table.is_empty());
    }

    #[test]
    fn test_first_hop() {
        let table = RoutesTable::parse(ROUTES).unwrap();
        let router = Router::new("admin", &table).unwrap();
        assert_eq!(router.next_hop("node3").unwrap(), Some("gw1".to_string()));
        assert_eq!(router.next_hop("node7").unwrap(), Some("gw2".to_string()));
        // gateways are direct children
        assert_eq!(router.next_hop("gw1").unwrap(), None);
        // off-graph node: direct contact
        assert_eq!(router.next_hop("other9").unwrap(), None);
    }

    #[test]
    fn test_three_levels() {
        let table = RoutesTable::parse(
            "admin: gw[1-2]\ngw[1-2]: relay[1-4]\nrelay[1-4]: node[1-16]\n",
        )
        .unwrap();
        let router = Router::new("admin", &table).unwrap();
        // every node resolves to a first-level gateway
        let hop = router.next_hop("node10").unwrap().unwrap();
        assert!(hop == "gw1" || hop == "gw2");
        // a gateway's own router sees one less level
        let sub = Router::new("gw1", &table).unwrap();
        assert_eq!(sub.next_hop("relay2").unwrap(), None);
        let hop = sub.next_hop("node3").unwrap().unwrap();
        assert!(hop.starts_with("relay"));
    }

    #[test]
    fn test_mark_unreachable() {
        let table = RoutesTable::parse(ROUTES).unwrap();
        let mut router = Router::new("admin", &table).unwrap();
        router.mark_unreachable("gw1");
        assert!(matches!(
            router.next_hop("node1"),
            Err(TopologyError::Unreachable { .. })
        ));
        // the sibling subtree is unaffected
        assert_eq!(router.next_hop("node5").unwrap(), Some("gw2".to_string()));
    }

    #[test]
    fn test_cycle_rejected() {
        let table = RoutesTable::parse("a1: b1\nb1: a1\n").unwrap();
        assert!(matches!(
            Router::new("a1", &table),
            Err(TopologyError::Cycle { .. })
        ));
    }

    #[test]
    fn test_bad_line() {
        assert!(matches!(
            RoutesTable::parse("no-colon-here\n"),
            Err(TopologyError::BadLine { .. })
        ));
    }
}
