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

//! Tree propagation end-to-end, driving the real `muster-gateway` binary
//! through the framed channel (the "remote shell" is plain local exec so
//! no ssh infrastructure is required).

use std::time::Duration;

use muster::task::Task;
use muster::worker::WorkerOptions;
use muster::NodeSet;

const GATEWAY_BIN: &str = env!("CARGO_BIN_EXE_muster-gateway");

fn tree_task(gateway_cmd: &str) -> Task {
    let task = Task::new().unwrap();
    let cmd = gateway_cmd.to_string();
    task.set_info(move |c| {
        c.distant_worker = "exec".to_string();
        c.gw_invoke_cmd = Some(cmd.clone());
        c.grooming_delay = 0.05;
    });
    task
}

fn nodes(s: &str) -> NodeSet {
    s.parse().unwrap()
}

#[test]
fn test_gateway_relays_command() {
    let task = tree_task(GATEWAY_BIN);
    task.load_topology("admin: gwnode1\ngwnode1: leaf[1-2]\n", "admin")
        .unwrap();
    task.shell(
        "echo tree-ok",
        &nodes("leaf[1-2],solo1"),
        WorkerOptions::default(),
    )
    .unwrap();
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(60)))
        .unwrap();

    // relayed targets and the direct sibling all report through the same
    // surface
    assert_eq!(task.node_buffer("leaf1").unwrap(), b"tree-ok".to_vec());
    assert_eq!(task.node_buffer("leaf2").unwrap(), b"tree-ok".to_vec());
    assert_eq!(task.node_buffer("solo1").unwrap(), b"tree-ok".to_vec());
    assert_eq!(task.node_retcode("leaf1"), Some(0));
    assert_eq!(task.node_retcode("solo1"), Some(0));
    assert_eq!(task.max_retcode(), Some(0));
}

#[test]
fn test_gateway_grooms_identical_output() {
    let task = tree_task(GATEWAY_BIN);
    task.load_topology("admin: gwnode1\ngwnode1: leaf[1-4]\n", "admin")
        .unwrap();
    task.shell("echo same-output", &nodes("leaf[1-4]"), WorkerOptions::default())
        .unwrap();
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(60)))
        .unwrap();

    let buffers = task.iter_buffers();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].0, b"same-output".to_vec());
    assert_eq!(buffers[0].1.to_string(), "leaf[1-4]");
}

#[test]
fn test_gateway_relays_retcodes() {
    let task = tree_task(GATEWAY_BIN);
    task.load_topology("admin: gwnode1\ngwnode1: leaf[1-3]\n", "admin")
        .unwrap();
    // %n expands on the gateway side, per destination rank
    task.shell("exit %n", &nodes("leaf[1-3]"), WorkerOptions::default())
        .unwrap();
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(60)))
        .unwrap();

    let rcs: Vec<i32> = (1..=3)
        .map(|i| task.node_retcode(&format!("leaf{i}")).unwrap())
        .collect();
    assert_eq!(rcs, vec![0, 1, 2]);
    assert_eq!(task.max_retcode(), Some(2));
}

#[test]
fn test_unreachable_gateway_fails_subtree_only() {
    // a gateway command that dies immediately: its subtree gets a
    // synthetic failure, the direct sibling still succeeds
    let task = tree_task("exit 7");
    task.load_topology("admin: gwnode1\ngwnode1: leaf[1-2]\n", "admin")
        .unwrap();
    task.shell(
        "echo alive",
        &nodes("leaf[1-2],solo1"),
        WorkerOptions::default(),
    )
    .unwrap();
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(60)))
        .unwrap();

    assert_eq!(task.node_retcode("leaf1"), Some(255));
    assert_eq!(task.node_retcode("leaf2"), Some(255));
    assert_eq!(task.node_buffer("solo1").unwrap(), b"alive".to_vec());
    assert_eq!(task.node_retcode("solo1"), Some(0));
    assert_eq!(task.max_retcode(), Some(255));
}

#[test]
fn test_gateway_garbage_output_fails_channel() {
    // a fake gateway that emits garbage instead of frames: framing error,
    // unacknowledged targets fail, no retry
    let task = tree_task("echo not-a-frame-at-all; sleep 0.2");
    task.load_topology("admin: gwnode1\ngwnode1: leaf[1-2]\n", "admin")
        .unwrap();
    task.shell("echo x", &nodes("leaf[1-2]"), WorkerOptions::default())
        .unwrap();
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(60)))
        .unwrap();

    assert_eq!(task.node_retcode("leaf1"), Some(255));
    assert_eq!(task.node_retcode("leaf2"), Some(255));
}

#[test]
fn test_tree_stdin_forwarding() {
    let task = tree_task(GATEWAY_BIN);
    task.load_topology("admin: gwnode1\ngwnode1: leaf[1-2]\n", "admin")
        .unwrap();
    let id = task
        .shell("cat", &nodes("leaf[1-2]"), WorkerOptions::default())
        .unwrap();
    task.write_worker(id, b"through the tree\n");
    task.set_write_eof(id);
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(60)))
        .unwrap();

    assert_eq!(
        task.node_buffer("leaf1").unwrap(),
        b"through the tree".to_vec()
    );
    assert_eq!(
        task.node_buffer("leaf2").unwrap(),
        b"through the tree".to_vec()
    );
    assert_eq!(task.max_retcode(), Some(0));
}
