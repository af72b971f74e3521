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

//! Node group resolution
//!
//! Group references (`@name`, `@source:name`, `@@source`, `@*`) in node set
//! expressions are resolved through a [`GroupResolver`]. The library only
//! requires the interface; backing the upcalls with files, YAML or external
//! commands is up to the embedding application.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use thiserror::Error;

/// Failure of a group source upcall.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// The group source does not implement this upcall.
    #[error("group source '{name}' has no '{upcall}' upcall")]
    NoUpcall { name: String, upcall: &'static str },

    /// The group source failed to answer.
    #[error("group source '{name}' query '{upcall}' failed: {reason}")]
    QueryFailed {
        name: String,
        upcall: &'static str,
        reason: String,
    },

    /// Unknown group source name.
    #[error("unknown group source '{name}'")]
    UnknownSource { name: String },
}

/// Interface consumed by node set parsing for `@` group references.
///
/// All upcalls are optional; an unimplemented one returns
/// [`ResolverError::NoUpcall`]. Returned node lists may themselves contain
/// folded ranges and are re-parsed by the caller.
pub trait GroupResolver {
    /// Map a group name to its nodes.
    fn group_nodes(
        &self,
        group: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ResolverError>;

    /// All nodes of a group source.
    fn all_nodes(&self, namespace: Option<&str>) -> Result<Vec<String>, ResolverError>;

    /// List the group names of a group source.
    fn group_list(&self, namespace: Option<&str>) -> Result<Vec<String>, ResolverError>;

    /// Reverse upcall: groups a node belongs to.
    fn node_groups(&self, node: &str, namespace: Option<&str>)
        -> Result<Vec<String>, ResolverError>;

    /// Whether this resolver can answer group queries at all. When false,
    /// `@` keeps no special meaning in node set expressions.
    fn has_groups(&self) -> bool {
        true
    }

    /// Whether the reverse upcall is available for a source.
    fn has_reverse(&self, _namespace: Option<&str>) -> bool {
        false
    }
}

fn source_name(namespace: Option<&str>) -> String {
    namespace.unwrap_or("default").to_string()
}

/// Resolver that knows no groups; `@` is treated as a regular character.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl GroupResolver for NullResolver {
    fn group_nodes(
        &self,
        _group: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ResolverError> {
        Err(ResolverError::NoUpcall {
            name: source_name(namespace),
            upcall: "map",
        })
    }

    fn all_nodes(&self, namespace: Option<&str>) -> Result<Vec<String>, ResolverError> {
        Err(ResolverError::NoUpcall {
            name: source_name(namespace),
            upcall: "all",
        })
    }

    fn group_list(&self, namespace: Option<&str>) -> Result<Vec<String>, ResolverError> {
        Err(ResolverError::NoUpcall {
            name: source_name(namespace),
            upcall: "list",
        })
    }

    fn node_groups(
        &self,
        _node: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ResolverError> {
        Err(ResolverError::NoUpcall {
            name: source_name(namespace),
            upcall: "reverse",
        })
    }

    fn has_groups(&self) -> bool {
        false
    }
}

/// In-memory group resolver backed by per-source group maps.
///
/// Mostly useful for tests and for embedders that load group data
/// themselves. Group values are node set expressions (ranges allowed).
#[derive(Debug, Default, Clone)]
pub struct StaticGroupResolver {
    default_source: String,
    sources: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticGroupResolver {
    pub fn new() -> Self {
        StaticGroupResolver {
            default_source: "local".to_string(),
            sources: BTreeMap::new(),
        }
    }

    /// Add a group mapping to a source (created on first use).
    pub fn add_group(&mut self, source: &str, group: &str, nodes: &str) {
        self.sources
            .entry(source.to_string())
            .or_default()
            .insert(group.to_string(), nodes.to_string());
    }

    /// Add a group mapping to the default source.
    pub fn add(&mut self, group: &str, nodes: &str) {
        let source = self.default_source.clone();
        self.add_group(&source, group, nodes);
    }

    pub fn set_default_source(&mut self, source: &str) {
        self.default_source = source.to_string();
    }

    fn source(&self, namespace: Option<&str>) -> Result<&BTreeMap<String, String>, ResolverError> {
        let name = namespace.unwrap_or(&self.default_source);
        self.sources
            .get(name)
            .ok_or_else(|| ResolverError::UnknownSource {
                name: name.to_string(),
            })
    }
}

impl GroupResolver for StaticGroupResolver {
    fn group_nodes(
        &self,
        group: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ResolverError> {
        let groups = self.source(namespace)?;
        match groups.get(group) {
            Some(nodes) => Ok(vec![nodes.clone()]),
            None => Ok(Vec::new()),
        }
    }

    fn all_nodes(&self, namespace: Option<&str>) -> Result<Vec<String>, ResolverError> {
        // no explicit "all" upcall: the caller falls back to list + map
        Err(ResolverError::NoUpcall {
            name: source_name(namespace),
            upcall: "all",
        })
    }

    fn group_list(&self, namespace: Option<&str>) -> Result<Vec<String>, ResolverError> {
        Ok(self.source(namespace)?.keys().cloned().collect())
    }

    fn node_groups(
        &self,
        _node: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ResolverError> {
        Err(ResolverError::NoUpcall {
            name: source_name(namespace),
            upcall: "reverse",
        })
    }
}

type SharedResolver = Arc<dyn GroupResolver + Send + Sync>;

static DEFAULT_RESOLVER: Lazy<RwLock<SharedResolver>> =
    Lazy::new(|| RwLock::new(Arc::new(NullResolver)));

/// Process-wide resolver used by `@` references when none is passed
/// explicitly. Defaults to [`NullResolver`].
pub fn default_resolver() -> SharedResolver {
    DEFAULT_RESOLVER.read().expect("resolver lock").clone()
}

/// Install the process-wide default group resolver.
pub fn set_default_resolver(resolver: SharedResolver) {
    *DEFAULT_RESOLVER.write().expect("resolver lock") = resolver;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_resolver() {
        let r = NullResolver;
        assert!(!r.has_groups());
        assert!(matches!(
            r.group_nodes("oss", None),
            Err(ResolverError::NoUpcall { upcall: "map", .. })
        ));
    }

    #[test]
    fn test_static_resolver() {
        let mut r = StaticGroupResolver::new();
        r.add("oss", "n[1-4]");
        r.add("mds", "n5");
        assert_eq!(r.group_nodes("oss", None).unwrap(), vec!["n[1-4]"]);
        assert_eq!(r.group_list(None).unwrap(), vec!["mds", "oss"]);
        assert!(r.group_nodes("none", None).unwrap().is_empty());
        assert!(matches!(
            r.group_nodes("oss", Some("other")),
            Err(ResolverError::UnknownSource { .. })
        ));
    }
}
