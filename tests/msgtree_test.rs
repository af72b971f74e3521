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

//! Message tree aggregation properties.

use muster::msgtree::{MsgTree, TreeMode};

#[test]
fn test_interleaved_streams_reconstruct() {
    // interleave adds across keys; each key's stream must reconstruct in
    // arrival order
    let mut tree = MsgTree::default();
    let keys = ["n1", "n2", "n3", "n4"];
    for round in 0..10 {
        for (i, key) in keys.iter().enumerate() {
            // n1/n3 share a stream, n2/n4 share another
            let line = format!("round{round}-{}", i % 2);
            tree.add(key, line.as_bytes());
        }
    }
    for (i, key) in keys.iter().enumerate() {
        let lines = tree.lines(key).unwrap();
        assert_eq!(lines.len(), 10);
        for (round, line) in lines.iter().enumerate() {
            assert_eq!(line, format!("round{round}-{}", i % 2).as_bytes());
        }
    }
    // two equivalence classes only
    assert_eq!(tree.walk().len(), 2);
}

#[test]
fn test_walk_equivalence_classes() {
    let mut tree = MsgTree::default();
    for key in ["node40", "node41", "node42"] {
        tree.add(key, b"2.6.32");
    }
    tree.add("node133", b"3.10.0");

    let mut walked = tree.walk();
    walked.sort();
    assert_eq!(walked.len(), 2);
    assert_eq!(walked[0].0, b"2.6.32");
    assert_eq!(walked[0].1, vec!["node40", "node41", "node42"]);
    assert_eq!(walked[1].0, b"3.10.0");
    assert_eq!(walked[1].1, vec!["node133"]);
}

#[test]
fn test_large_fanin_memory_sharing() {
    // identical output from many keys shares storage: the tree only ever
    // allocates one element chain regardless of key count
    let mut tree = MsgTree::new(TreeMode::Shift);
    for i in 0..1000 {
        let key = format!("n{i}");
        tree.add(&key, b"common line 1");
        tree.add(&key, b"common line 2");
    }
    let walked = tree.walk();
    assert_eq!(walked.len(), 1);
    assert_eq!(walked[0].1.len(), 1000);
    assert_eq!(walked[0].0, b"common line 1\ncommon line 2".to_vec());
}

#[test]
fn test_empty_lines_and_binary_bytes() {
    let mut tree = MsgTree::default();
    tree.add("n1", b"");
    tree.add("n1", b"\xff\xfe");
    tree.add("n1", b"");
    let lines = tree.lines("n1").unwrap();
    assert_eq!(lines, vec![b"".to_vec(), b"\xff\xfe".to_vec(), b"".to_vec()]);
}

#[test]
fn test_remove_keys() {
    let mut tree = MsgTree::default();
    for key in ["a1", "a2", "b1"] {
        tree.add(key, b"x");
    }
    tree.remove(|k| k.starts_with('a'));
    assert_eq!(tree.len(), 1);
    let walked = tree.walk();
    assert_eq!(walked.len(), 1);
    assert_eq!(walked[0].1, vec!["b1"]);
}
