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

//! Message tree aggregation
//!
//! [`MsgTree`] maps keys (node names) to multi-line byte messages. Lines
//! are organized as a trie internally so that identical output from many
//! nodes is stored once; [`MsgTree::walk`] retrieves one entry per
//! distinct message together with the set of keys that produced it.

use std::collections::{HashMap, HashSet};

/// Tree behavior modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    /// Messages are stored immediately; key-to-element bindings are
    /// resolved lazily on first walk. Cheapest for bulk gathering.
    Defer,
    /// Keys follow their element on every add.
    Shift,
    /// Like shift, but keys are kept on every traversed element so the
    /// full trace can be walked.
    Trace,
}

const ROOT: usize = 0;

#[derive(Debug, Clone)]
struct TreeElem {
    msgline: Option<Vec<u8>>,
    parent: usize,
    children: HashMap<Vec<u8>, usize>,
    keys: Option<HashSet<String>>,
}

impl TreeElem {
    fn new(msgline: Option<Vec<u8>>, parent: usize) -> Self {
        TreeElem {
            msgline,
            parent,
            children: HashMap::new(),
            keys: None,
        }
    }
}

/// Trie of output lines, deduplicated across keys.
#[derive(Debug, Clone)]
pub struct MsgTree {
    mode: TreeMode,
    elems: Vec<TreeElem>,
    keys: HashMap<String, usize>,
}

impl Default for MsgTree {
    fn default() -> Self {
        MsgTree::new(TreeMode::Defer)
    }
}

impl MsgTree {
    pub fn new(mode: TreeMode) -> Self {
        MsgTree {
            mode,
            elems: vec![TreeElem::new(None, ROOT)],
            keys: HashMap::new(),
        }
    }

    pub fn mode(&self) -> TreeMode {
        self.mode
    }

    /// Remove all items from the tree.
    pub fn clear(&mut self) {
        self.elems = vec![TreeElem::new(None, ROOT)];
        self.keys.clear();
    }

    /// Number of keys in the tree.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Add a message line for a key.
    pub fn add(&mut self, key: &str, msgline: &[u8]) {
        let cur = self.keys.get(key).copied().unwrap_or(ROOT);

        // get or create the child element holding this line
        let child = match self.elems[cur].children.get(msgline) {
            Some(&idx) => idx,
            None => {
                let idx = self.elems.len();
                self.elems.push(TreeElem::new(Some(msgline.to_vec()), cur));
                self.elems[cur].children.insert(msgline.to_vec(), idx);
                idx
            }
        };

        match self.mode {
            TreeMode::Defer => {}
            TreeMode::Shift => self.shift_key(key, cur, child),
            TreeMode::Trace => {
                self.elems[child]
                    .keys
                    .get_or_insert_with(HashSet::new)
                    .insert(key.to_string());
            }
        }
        self.keys.insert(key.to_string(), child);
    }

    /// Move one key binding from `cur` down to `child`.
    fn shift_key(&mut self, key: &str, cur: usize, child: usize) {
        if cur != ROOT {
            let elem = &mut self.elems[cur];
            if let Some(keys) = elem.keys.as_mut() {
                if keys.len() == 1 && keys.contains(key) {
                    elem.keys = None;
                } else {
                    keys.remove(key);
                }
            }
        }
        self.elems[child]
            .keys
            .get_or_insert_with(HashSet::new)
            .insert(key.to_string());
    }

    /// Bind deferred keys to their elements and switch to shift mode.
    fn update_keys(&mut self) {
        if self.mode != TreeMode::Defer {
            return;
        }
        let bindings: Vec<(String, usize)> =
            self.keys.iter().map(|(k, &e)| (k.clone(), e)).collect();
        for (key, elem) in bindings {
            self.elems[elem]
                .keys
                .get_or_insert_with(HashSet::new)
                .insert(key);
        }
        self.mode = TreeMode::Shift;
    }

    /// Message lines for a key, in arrival order.
    pub fn lines(&self, key: &str) -> Option<Vec<Vec<u8>>> {
        let &elem = self.keys.get(key)?;
        Some(self.lines_to(elem))
    }

    fn lines_to(&self, mut elem: usize) -> Vec<Vec<u8>> {
        let mut bottom_up = Vec::new();
        while let Some(line) = &self.elems[elem].msgline {
            bottom_up.push(line.clone());
            elem = self.elems[elem].parent;
        }
        bottom_up.reverse();
        bottom_up
    }

    /// Whole message buffer for a key (lines joined with `\n`).
    pub fn message(&self, key: &str) -> Option<Vec<u8>> {
        self.lines(key).map(|lines| lines.join(&b'\n'))
    }

    /// Iterate over `(key, message)` pairs.
    pub fn items(&self) -> impl Iterator<Item = (&str, Vec<u8>)> {
        self.keys
            .iter()
            .map(|(k, &e)| (k.as_str(), self.lines_to(e).join(&b'\n')))
    }

    /// Walk the tree: one `(message, keys)` entry per distinct message,
    /// keys sorted for stable output.
    pub fn walk(&mut self) -> Vec<(Vec<u8>, Vec<String>)> {
        self.update_keys();
        let mut out = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(elem) = stack.pop() {
            stack.extend(self.elems[elem].children.values().copied());
            if let Some(keys) = &self.elems[elem].keys {
                if !keys.is_empty() {
                    let mut sorted: Vec<String> = keys.iter().cloned().collect();
                    sorted.sort();
                    out.push((self.lines_to(elem).join(&b'\n'), sorted));
                }
            }
        }
        out
    }

    /// Walk in trace mode: `(line, keys, depth, num_children)` entries.
    pub fn walk_trace(&self) -> Vec<(Vec<u8>, Vec<String>, usize, usize)> {
        assert!(
            self.mode == TreeMode::Trace,
            "walk_trace() is only callable in trace mode"
        );
        let mut out = Vec::new();
        let mut stack = vec![(ROOT, 0usize)];
        while let Some((elem, depth)) = stack.pop() {
            let children = &self.elems[elem].children;
            stack.extend(children.values().map(|&c| (c, depth + 1)));
            if let Some(keys) = &self.elems[elem].keys {
                if !keys.is_empty() {
                    let mut sorted: Vec<String> = keys.iter().cloned().collect();
                    sorted.sort();
                    if let Some(line) = &self.elems[elem].msgline {
                        out.push((line.clone(), sorted, depth, children.len()));
                    }
                }
            }
        }
        out
    }

    /// Remove every key matching the predicate from the tree.
    pub fn remove<F: Fn(&str) -> bool>(&mut self, matcher: F) {
        if self.mode != TreeMode::Defer {
            for elem in &mut self.elems {
                if let Some(keys) = elem.keys.as_mut() {
                    keys.retain(|k| !matcher(k));
                    if keys.is_empty() {
                        elem.keys = None;
                    }
                }
            }
        }
        self.keys.retain(|k, _| !matcher(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut tree = MsgTree::default();
        tree.add("n1", b"line1");
        tree.add("n1", b"line2");
        assert_eq!(tree.message("n1").unwrap(), b"line1\nline2".to_vec());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_per_key_stream_reconstruction() {
        let mut tree = MsgTree::default();
        let streams = [
            ("n1", vec!["a", "b", "c"]),
            ("n2", vec!["a", "b", "d"]),
            ("n3", vec!["a", "b", "c"]),
        ];
        for (key, lines) in &streams {
            for line in lines {
                tree.add(key, line.as_bytes());
            }
        }
        for (key, lines) in &streams {
            let got = tree.lines(key).unwrap();
            let want: Vec<Vec<u8>> = lines.iter().map(|l| l.as_bytes().to_vec()).collect();
            assert_eq!(got, want, "stream mismatch for {key}");
        }
    }

    #[test]
    fn test_walk_aggregates_identical_output() {
        let mut tree = MsgTree::default();
        for key in ["n40", "n41", "n42"] {
            tree.add(key, b"2.6.32");
        }
        tree.add("n133", b"3.10.0");

        let mut walked = tree.walk();
        walked.sort();
        assert_eq!(walked.len(), 2);
        assert_eq!(
            walked[0],
            (b"2.6.32".to_vec(), vec!["n40".into(), "n41".into(), "n42".into()])
        );
        assert_eq!(walked[1], (b"3.10.0".to_vec(), vec!["n133".into()]));
    }

    #[test]
    fn test_walk_after_defer_tracks_updates() {
        let mut tree = MsgTree::default();
        tree.add("n1", b"x");
        assert_eq!(tree.walk().len(), 1);
        // tree switched to shift mode; further adds keep working
        tree.add("n1", b"y");
        tree.add("n2", b"x");
        let walked = tree.walk();
        assert_eq!(walked.len(), 2);
        assert_eq!(tree.message("n1").unwrap(), b"x\ny".to_vec());
    }

    #[test]
    fn test_shared_storage_diverges() {
        let mut tree = MsgTree::new(TreeMode::Shift);
        tree.add("a", b"common");
        tree.add("b", b"common");
        tree.add("a", b"only-a");
        let walked = tree.walk();
        assert_eq!(walked.len(), 2);
        let a_msg = tree.message("a").unwrap();
        assert_eq!(a_msg, b"common\nonly-a".to_vec());
        assert_eq!(tree.message("b").unwrap(), b"common".to_vec());
    }

    #[test]
    fn test_remove() {
        let mut tree = MsgTree::default();
        tree.add("n1", b"x");
        tree.add("n2", b"x");
        tree.remove(|k| k == "n1");
        assert_eq!(tree.len(), 1);
        assert!(tree.message("n1").is_none());
        assert!(tree.message("n2").is_some());
    }

    #[test]
    fn test_trace_mode() {
        let mut tree = MsgTree::new(TreeMode::Trace);
        tree.add("n1", b"a");
        tree.add("n1", b"b");
        tree.add("n2", b"a");
        let trace = tree.walk_trace();
        // element "a" holds both keys in trace mode
        let a_entry = trace
            .iter()
            .find(|(line, _, _, _)| line == b"a")
            .expect("line a");
        assert_eq!(a_entry.1, vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(a_entry.2, 1);
    }
}
