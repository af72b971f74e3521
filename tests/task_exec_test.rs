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

//! Task execution against real local processes.

use std::time::Duration;

use anyhow::Result;
use muster::event::{EventHandler, StreamKind, WorkerId};
use muster::task::{Task, TaskError};
use muster::worker::{ExecWorker, PopenWorker, WorkerOptions};
use muster::NodeSet;

/// Records every event as a readable line, in delivery order.
#[derive(Default)]
struct Recorder {
    events: Vec<String>,
}

impl Recorder {
    fn position(&self, needle: &str) -> Option<usize> {
        self.events.iter().position(|e| e == needle)
    }
}

impl EventHandler for Recorder {
    fn on_start(&mut self, _worker: WorkerId) -> Result<()> {
        self.events.push("start".to_string());
        Ok(())
    }

    fn on_pickup(&mut self, _worker: WorkerId, node: &str) -> Result<()> {
        self.events.push(format!("pickup {node}"));
        Ok(())
    }

    fn on_read(
        &mut self,
        _worker: WorkerId,
        node: &str,
        stream: StreamKind,
        data: &[u8],
    ) -> Result<()> {
        let tag = match stream {
            StreamKind::Stdout => "read",
            StreamKind::Stderr => "readerr",
        };
        self.events
            .push(format!("{tag} {node} {}", String::from_utf8_lossy(data)));
        Ok(())
    }

    fn on_written(&mut self, _worker: WorkerId, node: &str, bytes: usize) -> Result<()> {
        self.events.push(format!("written {node} {bytes}"));
        Ok(())
    }

    fn on_hup(&mut self, _worker: WorkerId, node: &str, rc: i32) -> Result<()> {
        self.events.push(format!("hup {node} {rc}"));
        Ok(())
    }

    fn on_close(&mut self, _worker: WorkerId, timed_out: bool) -> Result<()> {
        self.events.push(format!("close {timed_out}"));
        Ok(())
    }
}

fn local_task() -> Task {
    let task = Task::new().unwrap();
    task.set_info(|c| c.distant_worker = "exec".to_string());
    task
}

fn nodes(s: &str) -> NodeSet {
    s.parse().unwrap()
}

#[test]
fn test_exec_placeholders_and_buffers() {
    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n[1-3]"), "echo hello %h"));
    let mut rec = Recorder::default();
    task.resume(&mut rec, Some(Duration::from_secs(30))).unwrap();

    assert_eq!(task.node_buffer("n1").unwrap(), b"hello n1".to_vec());
    assert_eq!(task.node_buffer("n3").unwrap(), b"hello n3".to_vec());
    assert_eq!(task.max_retcode(), Some(0));
    assert_eq!(rec.events.iter().filter(|e| e.starts_with("hup")).count(), 3);
}

#[test]
fn test_event_order_per_destination() {
    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n[1-2]"), "echo out-%h"));
    let mut rec = Recorder::default();
    task.resume(&mut rec, Some(Duration::from_secs(30))).unwrap();

    assert_eq!(rec.events[0], "start");
    for node in ["n1", "n2"] {
        let pickup = rec.position(&format!("pickup {node}")).unwrap();
        let read = rec.position(&format!("read {node} out-{node}")).unwrap();
        let hup = rec.position(&format!("hup {node} 0")).unwrap();
        assert!(pickup < read, "pickup before read for {node}");
        assert!(read < hup, "read before hup for {node}");
    }
    // close is the very last event
    assert_eq!(rec.events.last().unwrap(), "close false");
}

#[test]
fn test_output_aggregation_two_classes() {
    let task = local_task();
    task.schedule(ExecWorker::new(nodes("node[40-42]"), "echo 2.6.32"));
    task.schedule(ExecWorker::new(nodes("node133"), "echo 3.10.0"));
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();

    let mut buffers = task.iter_buffers();
    buffers.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(buffers.len(), 2);
    assert_eq!(buffers[0].0, b"2.6.32".to_vec());
    assert_eq!(buffers[0].1.to_string(), "node[40-42]");
    assert_eq!(buffers[1].0, b"3.10.0".to_vec());
    assert_eq!(buffers[1].1.to_string(), "node133");
}

#[test]
fn test_fanout_one_sequentialises() {
    let task = local_task();
    task.set_info(|c| c.fanout = 1);
    task.schedule(ExecWorker::new(nodes("n[1-3]"), "echo go-%h"));
    let mut rec = Recorder::default();
    task.resume(&mut rec, Some(Duration::from_secs(30))).unwrap();

    // with a window of one, each destination fully terminates before the
    // next one starts
    let hup1 = rec.position("hup n1 0").unwrap();
    let pickup2 = rec.position("pickup n2").unwrap();
    let hup2 = rec.position("hup n2 0").unwrap();
    let pickup3 = rec.position("pickup n3").unwrap();
    assert!(hup1 < pickup2);
    assert!(hup2 < pickup3);
}

#[test]
fn test_retcodes_per_rank() {
    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n[1-3]"), "exit %n"));
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();

    assert_eq!(task.node_retcode("n1"), Some(0));
    assert_eq!(task.node_retcode("n2"), Some(1));
    assert_eq!(task.node_retcode("n3"), Some(2));
    assert_eq!(task.max_retcode(), Some(2));

    let retcodes = task.iter_retcodes();
    assert_eq!(retcodes.len(), 3);
    assert_eq!(retcodes[0].0, 0);
    assert_eq!(retcodes[0].1.to_string(), "n1");
    assert_eq!(retcodes[2].0, 2);
}

#[test]
fn test_stderr_separated_when_enabled() {
    let task = local_task();
    let options = WorkerOptions {
        stderr: Some(true),
        ..WorkerOptions::default()
    };
    task.schedule(
        ExecWorker::new(nodes("n1"), "echo out; echo err 1>&2").with_options(options),
    );
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();

    assert_eq!(task.node_buffer("n1").unwrap(), b"out".to_vec());
    assert_eq!(task.node_error("n1").unwrap(), b"err".to_vec());
}

#[test]
fn test_stderr_merged_by_default() {
    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n1"), "echo err 1>&2"));
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();

    assert_eq!(task.node_buffer("n1").unwrap(), b"err".to_vec());
    assert!(task.node_error("n1").is_none());
}

#[test]
fn test_write_worker_stdin() {
    let task = local_task();
    let id = task.schedule(ExecWorker::new(nodes("n[1-2]"), "cat"));
    task.write_worker(id, b"ping\n");
    task.set_write_eof(id);
    let mut rec = Recorder::default();
    task.resume(&mut rec, Some(Duration::from_secs(30))).unwrap();

    assert_eq!(task.node_buffer("n1").unwrap(), b"ping".to_vec());
    assert_eq!(task.node_buffer("n2").unwrap(), b"ping".to_vec());
    assert!(rec.position("written n1 5").is_some());
}

#[test]
fn test_popen_local_key() {
    let task = local_task();
    task.schedule(PopenWorker::new("echo local-out"));
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();
    assert_eq!(
        task.node_buffer(muster::worker::LOCAL_KEY).unwrap(),
        b"local-out".to_vec()
    );
}

#[test]
fn test_shell_selects_exec_worker() {
    let task = local_task();
    task.shell("echo via-shell", &nodes("n1"), WorkerOptions::default())
        .unwrap();
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();
    assert_eq!(task.node_buffer("n1").unwrap(), b"via-shell".to_vec());
}

#[test]
fn test_handler_error_reraised_after_loop() {
    struct Failing;
    impl EventHandler for Failing {
        fn on_read(
            &mut self,
            _worker: WorkerId,
            _node: &str,
            _stream: StreamKind,
            _data: &[u8],
        ) -> Result<()> {
            anyhow::bail!("boom");
        }
    }

    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n[1-2]"), "echo x"));
    let err = task
        .resume(&mut Failing, Some(Duration::from_secs(30)))
        .unwrap_err();
    assert!(matches!(err, TaskError::Handler(_)));
    // the loop still completed: results were aggregated
    assert_eq!(task.node_buffer("n1").unwrap(), b"x".to_vec());
}

#[test]
fn test_abort_from_handler() {
    struct Aborter {
        task: Task,
        closes: usize,
    }
    impl EventHandler for Aborter {
        fn on_pickup(&mut self, _worker: WorkerId, _node: &str) -> Result<()> {
            self.task.abort();
            Ok(())
        }
        fn on_close(&mut self, _worker: WorkerId, _timed_out: bool) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n[1-3]"), "sleep 30"));
    let mut handler = Aborter {
        task: task.clone(),
        closes: 0,
    };
    let started = std::time::Instant::now();
    task.resume(&mut handler, Some(Duration::from_secs(30))).unwrap();
    assert!(started.elapsed() < Duration::from_secs(10), "abort was slow");
    assert_eq!(handler.closes, 1);
}

#[test]
fn test_timer_fires_during_run() {
    struct TimerSpy {
        fired: usize,
    }
    impl EventHandler for TimerSpy {
        fn on_timer(&mut self, _timer: muster::TimerId) -> Result<()> {
            self.fired += 1;
            Ok(())
        }
    }

    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n1"), "sleep 0.4"));
    task.timer(Duration::from_millis(50), Some(Duration::from_millis(100)));
    let mut spy = TimerSpy { fired: 0 };
    task.resume(&mut spy, Some(Duration::from_secs(30))).unwrap();
    assert!(spy.fired >= 2, "periodic timer fired {} times", spy.fired);
}

#[test]
fn test_port_delivery_from_foreign_thread() {
    struct PortSpy {
        received: Vec<String>,
    }
    impl EventHandler for PortSpy {
        fn on_port(
            &mut self,
            _port: muster::event::PortId,
            message: muster::event::PortMessage,
        ) -> Result<()> {
            if let Ok(text) = message.downcast::<String>() {
                self.received.push(*text);
            }
            Ok(())
        }
    }

    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n1"), "sleep 0.5"));
    let port = task.port();
    let sender = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        port.send(Box::new("hello from afar".to_string())).ok();
    });
    let mut spy = PortSpy { received: Vec::new() };
    task.resume(&mut spy, Some(Duration::from_secs(30))).unwrap();
    sender.join().unwrap();
    assert_eq!(spy.received, vec!["hello from afar"]);
}

#[test]
fn test_join_handle_from_foreign_thread() {
    let task = local_task();
    task.schedule(ExecWorker::new(nodes("n1"), "sleep 0.3"));
    let handle = task.join_handle();
    let waiter = std::thread::spawn(move || {
        handle.join();
    });
    task.resume(&mut muster::NullHandler, Some(Duration::from_secs(30)))
        .unwrap();
    waiter.join().unwrap();
}
