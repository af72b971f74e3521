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

//! Task façade
//!
//! A [`Task`] owns one engine and schedules workers and timers on it.
//! Calling [`Task::resume`] runs the event loop on the current thread,
//! dispatching events to the supplied handler and aggregating results
//! (stdout/stderr message trees, return codes, timed-out keys).
//!
//! One task per OS thread: `Task` is a cheap `Rc` handle and is
//! deliberately not `Send`; [`task_self`] returns the calling thread's
//! lazily-created task. Foreign threads may only wait through
//! [`Task::join_handle`] or the module-level [`task_wait`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use muster::event::NullHandler;
//! use muster::nodeset::NodeSet;
//! use muster::task::task_self;
//! use muster::worker::WorkerOptions;
//!
//! let task = task_self();
//! let nodes: NodeSet = "node[1-32]".parse().unwrap();
//! task.shell("uname -r", &nodes, WorkerOptions::default()).unwrap();
//! task.resume(&mut NullHandler, None).unwrap();
//! for (buf, nodeset) in task.iter_buffers() {
//!     println!("{}: {}", nodeset, String::from_utf8_lossy(&buf));
//! }
//! ```

mod config;

pub use config::TaskConfig;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::LocalSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    run_client, run_timer, ClientSpec, CommandLine, Engine, EngineHandle, EngineMessage, Port,
    StdinMsg,
};
use crate::event::{EventHandler, PortId, StreamKind, TimerId, WorkerId};
use crate::msgtree::MsgTree;
use crate::nodeset::{NodeSet, NodeSetError};
use crate::tree::propagation::{TreeAction, TreeState, TreeWorker, GW_SYNTHETIC_RC};
use crate::tree::topology::{Router, RoutesTable, TopologyError};
use crate::worker::{
    ssh::ssh_argv, CopyTransport, CopyWorker, ExecWorker, PopenWorker, RshWorker, SshWorker,
    WorkerError, WorkerKind, WorkerOptions,
};

/// Task-level failures surfaced from `resume()` or setup calls.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task is already running")]
    AlreadyRunning,

    #[error("task run timed out")]
    RunTimeout,

    #[error("engine fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    NodeSet(#[from] NodeSetError),

    /// First error returned by the user event handler, re-raised after
    /// the run loop terminated.
    #[error("event handler failed: {0}")]
    Handler(anyhow::Error),
}

/// Worker accepted by [`Task::schedule`].
pub enum TaskWorker {
    Exec(ExecWorker),
    Ssh(SshWorker),
    Rsh(RshWorker),
    Popen(PopenWorker),
    Copy(CopyWorker),
    Tree(TreeWorker),
}

macro_rules! impl_from_worker {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        $(impl From<$ty> for TaskWorker {
            fn from(w: $ty) -> TaskWorker {
                TaskWorker::$variant(w)
            }
        })+
    };
}

impl_from_worker!(
    Exec(ExecWorker),
    Ssh(SshWorker),
    Rsh(RshWorker),
    Popen(PopenWorker),
    Copy(CopyWorker),
    Tree(TreeWorker),
);

/// Flat (non-tree) worker wrapper used by the launch path.
enum WorkerVariant {
    Exec(ExecWorker),
    Ssh(SshWorker),
    Rsh(RshWorker),
    Popen(PopenWorker),
    Copy(CopyWorker),
}

impl WorkerVariant {
    fn as_kind(&self) -> &dyn WorkerKind {
        match self {
            WorkerVariant::Exec(w) => w,
            WorkerVariant::Ssh(w) => w,
            WorkerVariant::Rsh(w) => w,
            WorkerVariant::Popen(w) => w,
            WorkerVariant::Copy(w) => w,
        }
    }
}

/// Worker queued until the next resume.
enum Scheduled {
    Command {
        id: WorkerId,
        worker: WorkerVariant,
        writes: Vec<Vec<u8>>,
        write_eof: bool,
    },
    Tree {
        id: WorkerId,
        worker: TreeWorker,
        writes: Vec<Vec<u8>>,
        write_eof: bool,
    },
}

impl Scheduled {
    fn id(&self) -> WorkerId {
        match self {
            Scheduled::Command { id, .. } | Scheduled::Tree { id, .. } => *id,
        }
    }

    fn writes_mut(&mut self) -> &mut Vec<Vec<u8>> {
        match self {
            Scheduled::Command { writes, .. } | Scheduled::Tree { writes, .. } => writes,
        }
    }

    fn set_write_eof(&mut self) {
        match self {
            Scheduled::Command { write_eof, .. } | Scheduled::Tree { write_eof, .. } => {
                *write_eof = true
            }
        }
    }
}

/// Bookkeeping of one launched worker.
struct ActiveWorker {
    remaining: usize,
    timed_out: bool,
    tree: Option<TreeState>,
}

#[derive(Default)]
struct TaskResults {
    stdout: MsgTree,
    stderr: MsgTree,
    retcodes: HashMap<String, i32>,
    max_rc: Option<i32>,
    timeouts: BTreeSet<String>,
}

impl TaskResults {
    fn record_rc(&mut self, key: &str, rc: i32) {
        self.retcodes
            .entry(key.to_string())
            .and_modify(|v| *v = (*v).max(rc))
            .or_insert(rc);
        self.max_rc = Some(self.max_rc.map_or(rc, |m| m.max(rc)));
    }
}

/// Cross-thread completion signal of a task.
#[derive(Default)]
struct TaskSync {
    running: Mutex<bool>,
    cond: Condvar,
}

impl TaskSync {
    fn set_running(&self, value: bool) {
        *self.running.lock().expect("task sync lock") = value;
        if !value {
            self.cond.notify_all();
        }
    }

    fn wait_done(&self) {
        let mut guard = self.running.lock().expect("task sync lock");
        while *guard {
            guard = self.cond.wait(guard).expect("task sync wait");
        }
    }
}

/// `Send` handle to wait for a task's run loop from another thread.
#[derive(Clone)]
pub struct TaskJoinHandle {
    sync: Arc<TaskSync>,
}

impl TaskJoinHandle {
    /// Block until the task's current run (if any) has finished.
    pub fn join(&self) {
        self.sync.wait_done();
    }
}

static TASK_REGISTRY: Lazy<Mutex<Vec<Weak<TaskSync>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Block until every live task in the process has left its run loop.
pub fn task_wait() {
    let handles: Vec<Arc<TaskSync>> = {
        let mut registry = TASK_REGISTRY.lock().expect("task registry");
        registry.retain(|w| w.strong_count() > 0);
        registry.iter().filter_map(Weak::upgrade).collect()
    };
    for sync in handles {
        sync.wait_done();
    }
}

struct Topology {
    table: RoutesTable,
    root: String,
}

struct TaskShared {
    engine: Engine,
    config: RefCell<TaskConfig>,
    scheduled: RefCell<VecDeque<Scheduled>>,
    pending_timers: RefCell<Vec<(TimerId, Duration, Option<Duration>)>>,
    timer_guards: RefCell<HashMap<TimerId, crate::engine::TimerGuard>>,
    active: RefCell<HashMap<WorkerId, ActiveWorker>>,
    writers: RefCell<HashMap<WorkerId, Vec<(String, UnboundedSender<StdinMsg>)>>>,
    results: RefCell<TaskResults>,
    topology: RefCell<Option<Topology>>,
    cancel: RefCell<CancellationToken>,
    event_tx: UnboundedSender<EngineMessage>,
    event_rx: RefCell<Option<UnboundedReceiver<EngineMessage>>>,
    running: Cell<bool>,
    fd_limit_raised: Cell<bool>,
    next_worker: Cell<u64>,
    next_timer: Cell<u64>,
    next_port: Cell<u64>,
    sync: Arc<TaskSync>,
}

/// Per-thread execution façade; a cheap clonable handle.
#[derive(Clone)]
pub struct Task {
    shared: Rc<TaskShared>,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Task>> = const { RefCell::new(None) };
}

/// The calling thread's task, created lazily on first use.
pub fn task_self() -> Task {
    CURRENT_TASK.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(task) => task.clone(),
            None => {
                let task = Task::new().expect("task engine initialization");
                *slot = Some(task.clone());
                task
            }
        }
    })
}

impl Task {
    pub fn new() -> Result<Task, TaskError> {
        Task::with_config(TaskConfig::default())
    }

    pub fn with_config(config: TaskConfig) -> Result<Task, TaskError> {
        let engine = Engine::new().map_err(|e| TaskError::Fatal(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sync = Arc::new(TaskSync::default());
        TASK_REGISTRY
            .lock()
            .expect("task registry")
            .push(Arc::downgrade(&sync));
        Ok(Task {
            shared: Rc::new(TaskShared {
                engine,
                config: RefCell::new(config),
                scheduled: RefCell::new(VecDeque::new()),
                pending_timers: RefCell::new(Vec::new()),
                timer_guards: RefCell::new(HashMap::new()),
                active: RefCell::new(HashMap::new()),
                writers: RefCell::new(HashMap::new()),
                results: RefCell::new(TaskResults::default()),
                topology: RefCell::new(None),
                cancel: RefCell::new(CancellationToken::new()),
                event_tx: tx,
                event_rx: RefCell::new(Some(rx)),
                running: Cell::new(false),
                fd_limit_raised: Cell::new(false),
                next_worker: Cell::new(0),
                next_timer: Cell::new(0),
                next_port: Cell::new(0),
                sync,
            }),
        })
    }

    /// Read a copy of the task configuration.
    pub fn info(&self) -> TaskConfig {
        self.shared.config.borrow().clone()
    }

    /// Adjust the task configuration in place.
    pub fn set_info<F: FnOnce(&mut TaskConfig)>(&self, f: F) {
        f(&mut self.shared.config.borrow_mut());
    }

    /// Load a propagation routes table and declare this task's root node
    /// name within it. Subsequent `shell()` calls relay through gateways.
    pub fn load_topology(&self, text: &str, root: &str) -> Result<(), TaskError> {
        let table = RoutesTable::parse(text)?;
        // validate the spanning tree up front
        Router::new(root, &table)?;
        *self.shared.topology.borrow_mut() = Some(Topology {
            table,
            root: root.to_string(),
        });
        Ok(())
    }

    pub fn has_topology(&self) -> bool {
        self.shared.topology.borrow().is_some()
    }

    pub fn running(&self) -> bool {
        self.shared.running.get()
    }

    fn next_worker_id(&self) -> WorkerId {
        let id = self.shared.next_worker.get() + 1;
        self.shared.next_worker.set(id);
        WorkerId(id)
    }

    /// Schedule a worker; it starts on the next `resume()`.
    pub fn schedule(&self, worker: impl Into<TaskWorker>) -> WorkerId {
        let id = self.next_worker_id();
        let scheduled = match worker.into() {
            TaskWorker::Tree(w) => Scheduled::Tree {
                id,
                worker: w,
                writes: Vec::new(),
                write_eof: false,
            },
            TaskWorker::Exec(w) => command(id, WorkerVariant::Exec(w)),
            TaskWorker::Ssh(w) => command(id, WorkerVariant::Ssh(w)),
            TaskWorker::Rsh(w) => command(id, WorkerVariant::Rsh(w)),
            TaskWorker::Popen(w) => command(id, WorkerVariant::Popen(w)),
            TaskWorker::Copy(w) => command(id, WorkerVariant::Copy(w)),
        };
        self.shared.scheduled.borrow_mut().push_back(scheduled);
        id
    }

    /// Schedule `command` on `nodes`, selecting the tree worker when a
    /// topology is loaded and the configured distant worker otherwise.
    pub fn shell(
        &self,
        command: &str,
        nodes: &NodeSet,
        options: WorkerOptions,
    ) -> Result<WorkerId, TaskError> {
        if nodes.is_empty() {
            return Err(TaskError::Worker(WorkerError::NoTargets));
        }
        let worker: TaskWorker = if self.has_topology() {
            TreeWorker::new(nodes.clone(), command)
                .with_options(options)
                .into()
        } else {
            distant_worker(&self.info(), nodes.clone(), command, options)
        };
        Ok(self.schedule(worker))
    }

    /// Schedule a single local command.
    pub fn shell_local(&self, command: &str, options: WorkerOptions) -> WorkerId {
        self.schedule(PopenWorker::new(command).with_options(options))
    }

    /// Schedule a file copy to `nodes`.
    pub fn copy(
        &self,
        source: &str,
        dest: &str,
        nodes: &NodeSet,
        options: WorkerOptions,
    ) -> Result<WorkerId, TaskError> {
        let transport = copy_transport(&self.info());
        Ok(self.schedule(
            CopyWorker::new(nodes.clone(), source, dest, transport).with_options(options),
        ))
    }

    /// Schedule a reverse file copy: gather `source` from `nodes` into
    /// the local `dest` directory.
    pub fn rcopy(
        &self,
        source: &str,
        dest: &str,
        nodes: &NodeSet,
        options: WorkerOptions,
    ) -> Result<WorkerId, TaskError> {
        let transport = copy_transport(&self.info());
        Ok(self.schedule(
            CopyWorker::new(nodes.clone(), source, dest, transport)
                .reverse()
                .with_options(options),
        ))
    }

    /// Register a timer firing after `delay`, then every `interval` when
    /// given. Timers fire while the run loop is active.
    pub fn timer(&self, delay: Duration, interval: Option<Duration>) -> TimerId {
        let id = TimerId(self.shared.next_timer.get() + 1);
        self.shared.next_timer.set(id.0);
        self.shared
            .timer_guards
            .borrow_mut()
            .insert(id, crate::engine::TimerGuard::default());
        self.shared
            .pending_timers
            .borrow_mut()
            .push((id, delay, interval));
        id
    }

    /// Stop a timer from firing again.
    pub fn invalidate_timer(&self, id: TimerId) {
        if let Some(guard) = self.shared.timer_guards.borrow().get(&id) {
            guard.invalidate();
        }
    }

    /// Create a cross-thread port delivering `on_port` events, bounded
    /// by the `port_qlimit` info key.
    pub fn port(&self) -> Port {
        let id = PortId(self.shared.next_port.get() + 1);
        self.shared.next_port.set(id.0);
        let qlimit = self.shared.config.borrow().port_qlimit;
        Port::new(id, self.shared.event_tx.clone(), qlimit)
    }

    /// Enqueue bytes for the standard input of every open destination of
    /// a worker.
    pub fn write_worker(&self, id: WorkerId, bytes: &[u8]) {
        {
            let writers = self.shared.writers.borrow();
            if let Some(senders) = writers.get(&id) {
                let active = self.shared.active.borrow();
                let tree = active.get(&id).and_then(|w| w.tree.as_ref());
                for (key, tx) in senders {
                    let payload = match tree {
                        Some(state) if state.is_gateway(key) => {
                            match state.stdin_frame(key, bytes) {
                                Some(frame) => frame,
                                None => continue,
                            }
                        }
                        _ => bytes.to_vec(),
                    };
                    let _ = tx.send(StdinMsg::Bytes(payload));
                }
                return;
            }
        }
        let mut scheduled = self.shared.scheduled.borrow_mut();
        for entry in scheduled.iter_mut() {
            if entry.id() == id {
                entry.writes_mut().push(bytes.to_vec());
            }
        }
    }

    /// Signal end of input on every open destination of a worker.
    pub fn set_write_eof(&self, id: WorkerId) {
        {
            let writers = self.shared.writers.borrow();
            if let Some(senders) = writers.get(&id) {
                let mut active = self.shared.active.borrow_mut();
                let mut tree = active.get_mut(&id).and_then(|w| w.tree.as_mut());
                for (key, tx) in senders {
                    match tree.as_deref_mut() {
                        Some(state) if state.is_gateway(key) => {
                            if let Some(frame) = state.write_eof_frame(key) {
                                let _ = tx.send(StdinMsg::Bytes(frame));
                            }
                        }
                        _ => {
                            let _ = tx.send(StdinMsg::Eof);
                        }
                    }
                }
                return;
            }
        }
        let mut scheduled = self.shared.scheduled.borrow_mut();
        for entry in scheduled.iter_mut() {
            if entry.id() == id {
                entry.set_write_eof();
            }
        }
    }

    /// Abort the running task: children are killed best-effort, close
    /// events still fire. Remote processes already launched may keep
    /// running; the library does not reap them.
    pub fn abort(&self) {
        self.shared.cancel.borrow().cancel();
    }

    /// `Send` handle for foreign threads to wait on this task.
    pub fn join_handle(&self) -> TaskJoinHandle {
        TaskJoinHandle {
            sync: self.shared.sync.clone(),
        }
    }

    /// Schedule `command` on `nodes` and run to completion.
    pub fn run(
        &self,
        command: &str,
        nodes: &NodeSet,
        options: WorkerOptions,
        handler: &mut dyn EventHandler,
        timeout: Option<Duration>,
    ) -> Result<WorkerId, TaskError> {
        let id = self.shell(command, nodes, options)?;
        self.resume(handler, timeout)?;
        Ok(id)
    }

    /// Run the event loop until every scheduled worker has closed or
    /// `timeout` expires. All handler callbacks run on this thread.
    pub fn resume(
        &self,
        handler: &mut dyn EventHandler,
        timeout: Option<Duration>,
    ) -> Result<(), TaskError> {
        if self.shared.running.get() {
            return Err(TaskError::AlreadyRunning);
        }
        self.raise_fd_limit();

        // fresh cancellation scope per run
        let cancel = CancellationToken::new();
        *self.shared.cancel.borrow_mut() = cancel.clone();

        let mut rx = self
            .shared
            .event_rx
            .borrow_mut()
            .take()
            .ok_or(TaskError::AlreadyRunning)?;
        // leftovers of a previous (aborted) run are meaningless now, but
        // dropped port messages must still release their queue slots
        while let Ok(msg) = rx.try_recv() {
            if let EngineMessage::Port { pending, .. } = msg {
                pending.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            }
        }

        let fanout = self.shared.config.borrow().fanout;
        let handle = EngineHandle::new(self.shared.event_tx.clone(), fanout, cancel.clone());

        self.shared.running.set(true);
        self.shared.sync.set_running(true);

        let local = LocalSet::new();
        let result = self
            .shared
            .engine
            .runtime()
            .block_on(local.run_until(run_loop(self, handler, &mut rx, handle, timeout)));

        // kill any stragglers from an error unwind before leaving
        cancel.cancel();
        self.shared.active.borrow_mut().clear();
        self.shared.writers.borrow_mut().clear();
        *self.shared.event_rx.borrow_mut() = Some(rx);
        self.shared.running.set(false);
        self.shared.sync.set_running(false);

        result
    }

    /// Raise the soft fd limit to `fd_max` once per task.
    fn raise_fd_limit(&self) {
        if self.shared.fd_limit_raised.replace(true) {
            return;
        }
        let fd_max = self.shared.config.borrow().fd_max;
        #[cfg(unix)]
        {
            use nix::sys::resource::{getrlimit, setrlimit, Resource};
            match getrlimit(Resource::RLIMIT_NOFILE) {
                Ok((soft, hard)) => {
                    let want = fd_max.min(hard);
                    if want > soft {
                        if let Err(err) = setrlimit(Resource::RLIMIT_NOFILE, want, hard) {
                            tracing::debug!(%err, "could not raise fd limit");
                        }
                    }
                }
                Err(err) => tracing::debug!(%err, "could not read fd limit"),
            }
        }
    }

    // Result retrieval.

    /// Aggregated stdout of one key.
    pub fn node_buffer(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.results.borrow().stdout.message(key)
    }

    /// Aggregated stderr of one key.
    pub fn node_error(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.results.borrow().stderr.message(key)
    }

    /// Return code of one key, when its child exited.
    pub fn node_retcode(&self, key: &str) -> Option<i32> {
        self.shared.results.borrow().retcodes.get(key).copied()
    }

    /// Largest return code received.
    pub fn max_retcode(&self) -> Option<i32> {
        self.shared.results.borrow().max_rc
    }

    /// One `(buffer, nodeset)` entry per distinct stdout.
    pub fn iter_buffers(&self) -> Vec<(Vec<u8>, NodeSet)> {
        fold_walk(self.shared.results.borrow_mut().stdout.walk())
    }

    /// One `(buffer, nodeset)` entry per distinct stderr.
    pub fn iter_errors(&self) -> Vec<(Vec<u8>, NodeSet)> {
        fold_walk(self.shared.results.borrow_mut().stderr.walk())
    }

    /// One `(rc, nodeset)` entry per distinct return code, ascending.
    pub fn iter_retcodes(&self) -> Vec<(i32, NodeSet)> {
        let results = self.shared.results.borrow();
        let mut by_rc: BTreeMap<i32, Vec<&str>> = BTreeMap::new();
        for (key, rc) in &results.retcodes {
            by_rc.entry(*rc).or_default().push(key.as_str());
        }
        by_rc
            .into_iter()
            .map(|(rc, keys)| (rc, NodeSet::from_nodes(keys).unwrap_or_default()))
            .collect()
    }

    /// Number of destinations that hit a timeout.
    pub fn num_timeout(&self) -> usize {
        self.shared.results.borrow().timeouts.len()
    }

    /// Keys that hit a timeout.
    pub fn iter_keys_timeout(&self) -> Vec<String> {
        self.shared
            .results
            .borrow()
            .timeouts
            .iter()
            .cloned()
            .collect()
    }

    /// Drop all aggregated buffers and return codes.
    pub fn flush_buffers(&self) {
        let mut results = self.shared.results.borrow_mut();
        results.stdout.clear();
        results.stderr.clear();
        results.retcodes.clear();
        results.max_rc = None;
        results.timeouts.clear();
    }
}

fn command(id: WorkerId, worker: WorkerVariant) -> Scheduled {
    Scheduled::Command {
        id,
        worker,
        writes: Vec::new(),
        write_eof: false,
    }
}

fn fold_walk(walked: Vec<(Vec<u8>, Vec<String>)>) -> Vec<(Vec<u8>, NodeSet)> {
    walked
        .into_iter()
        .map(|(buf, keys)| (buf, NodeSet::from_nodes(keys).unwrap_or_default()))
        .collect()
}

fn copy_transport(config: &TaskConfig) -> CopyTransport {
    if config.distant_worker == "rsh" {
        CopyTransport::Rcp
    } else {
        CopyTransport::Scp
    }
}

/// Select the distant worker class from the task configuration.
fn distant_worker(
    config: &TaskConfig,
    nodes: NodeSet,
    command: &str,
    options: WorkerOptions,
) -> TaskWorker {
    match config.distant_worker.as_str() {
        "exec" => ExecWorker::new(nodes, command).with_options(options).into(),
        "rsh" => RshWorker::new(nodes, command).with_options(options).into(),
        _ => SshWorker::new(nodes, command).with_options(options).into(),
    }
}

/// Command line launching the gateway process on a gateway node.
fn gateway_command(config: &TaskConfig, gateway: &str) -> CommandLine {
    let invoke = config
        .gw_invoke_cmd
        .clone()
        .unwrap_or_else(|| "muster-gateway".to_string());
    match config.distant_worker.as_str() {
        "exec" => CommandLine::Shell(invoke),
        "rsh" => CommandLine::Argv(crate::worker::rsh::rsh_argv(config, gateway, &invoke)),
        _ => CommandLine::Argv(ssh_argv(config, gateway, &invoke)),
    }
}

fn duration_override(override_secs: Option<f64>, default: Option<Duration>) -> Option<Duration> {
    match override_secs {
        Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(_) => None,
        None => default,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

fn note_handler_error(herr: &mut Option<anyhow::Error>, result: anyhow::Result<()>) {
    if let Err(err) = result {
        tracing::error!(error = %err, "event handler error");
        if herr.is_none() {
            *herr = Some(err);
        }
    }
}

/// The reactor loop: launch scheduled work, drain engine events, dispatch
/// to the handler, account worker completion.
async fn run_loop(
    task: &Task,
    handler: &mut dyn EventHandler,
    rx: &mut UnboundedReceiver<EngineMessage>,
    handle: EngineHandle,
    timeout: Option<Duration>,
) -> Result<(), TaskError> {
    let mut herr: Option<anyhow::Error> = None;
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut run_timed_out = false;

    loop {
        launch_timers(task, &handle);
        launch_scheduled(task, handler, &handle, &mut herr)?;

        let no_work = task.shared.active.borrow().is_empty()
            && task.shared.scheduled.borrow().is_empty();
        if no_work {
            break;
        }

        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => dispatch(task, handler, &handle, msg, &mut herr),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                run_timed_out = true;
                break;
            }
        }
        // drain immediately available events before relaunching
        while let Ok(msg) = rx.try_recv() {
            dispatch(task, handler, &handle, msg, &mut herr);
        }
    }

    if run_timed_out {
        // global timeout: unwind all clients
        handle.cancel.cancel();
        let grace = Instant::now() + Duration::from_millis(500);
        while !task.shared.active.borrow().is_empty() && Instant::now() < grace {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => dispatch(task, handler, &handle, msg, &mut herr),
                    None => break,
                },
                _ = sleep_until(grace) => break,
            }
        }
        let leftover: Vec<WorkerId> =
            task.shared.active.borrow().keys().copied().collect();
        for id in leftover {
            task.shared.active.borrow_mut().remove(&id);
            task.shared.writers.borrow_mut().remove(&id);
            note_handler_error(&mut herr, handler.on_close(id, true));
        }
        return Err(TaskError::RunTimeout);
    }

    match herr {
        Some(err) => Err(TaskError::Handler(err)),
        None => Ok(()),
    }
}

fn launch_timers(task: &Task, handle: &EngineHandle) {
    let pending: Vec<_> = task.shared.pending_timers.borrow_mut().drain(..).collect();
    for (id, delay, interval) in pending {
        let guard = task
            .shared
            .timer_guards
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        tokio::task::spawn_local(run_timer(id, delay, interval, handle.clone(), guard));
    }
}

/// Launch everything scheduled since the last pass.
fn launch_scheduled(
    task: &Task,
    handler: &mut dyn EventHandler,
    handle: &EngineHandle,
    herr: &mut Option<anyhow::Error>,
) -> Result<(), TaskError> {
    let drained: Vec<Scheduled> = task.shared.scheduled.borrow_mut().drain(..).collect();
    let config = task.shared.config.borrow().clone();

    for entry in drained {
        match entry {
            Scheduled::Command {
                id,
                worker,
                writes,
                write_eof,
            } => {
                let kind = worker.as_kind();
                let clients = kind.build_clients(&config)?;
                note_handler_error(herr, handler.on_start(id));

                let options = kind.options().clone();
                let split_stderr = options.stderr.unwrap_or(config.stderr);
                let use_stdin = options.stdin.unwrap_or(config.stdin);
                let connect_timeout = duration_override(
                    options.connect_timeout,
                    config.connect_timeout_duration(),
                );
                let command_timeout = duration_override(
                    options.command_timeout,
                    config.command_timeout_duration(),
                );

                let mut senders = Vec::with_capacity(clients.len());
                for build in clients {
                    let (stx, srx) = mpsc::unbounded_channel();
                    for chunk in &writes {
                        let _ = stx.send(StdinMsg::Bytes(chunk.clone()));
                    }
                    if write_eof {
                        let _ = stx.send(StdinMsg::Eof);
                    }
                    let spec = ClientSpec {
                        worker: id,
                        key: build.key.clone(),
                        command: build.command,
                        env: build.env,
                        buffered: true,
                        split_stderr,
                        use_stdin,
                        connect_timeout,
                        command_timeout,
                    };
                    tokio::task::spawn_local(run_client(spec, handle.clone(), srx));
                    senders.push((build.key, stx));
                }
                task.shared.active.borrow_mut().insert(
                    id,
                    ActiveWorker {
                        remaining: senders.len(),
                        timed_out: false,
                        tree: None,
                    },
                );
                task.shared.writers.borrow_mut().insert(id, senders);
            }
            Scheduled::Tree {
                id,
                worker,
                writes,
                write_eof,
            } => {
                launch_tree(
                    task, handler, handle, herr, &config, id, worker, writes, write_eof,
                )?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn launch_tree(
    task: &Task,
    handler: &mut dyn EventHandler,
    handle: &EngineHandle,
    herr: &mut Option<anyhow::Error>,
    config: &TaskConfig,
    id: WorkerId,
    worker: TreeWorker,
    writes: Vec<Vec<u8>>,
    write_eof: bool,
) -> Result<(), TaskError> {
    let router = {
        let topology = task.shared.topology.borrow();
        let topo = topology
            .as_ref()
            .ok_or_else(|| TaskError::Fatal("tree worker without topology".to_string()))?;
        Router::new(&topo.root, &topo.table)?
    };
    let (mut state, plan) = TreeState::plan(worker.nodes(), &router, config, worker.command())?;
    note_handler_error(herr, handler.on_start(id));

    // targets behind no reachable gateway fail synthetically right away
    for node in plan.unreachable.iter() {
        task.shared
            .results
            .borrow_mut()
            .record_rc(&node, GW_SYNTHETIC_RC);
        note_handler_error(herr, handler.on_hup(id, &node, GW_SYNTHETIC_RC));
    }

    let options = worker.options().clone();
    let split_stderr = options.stderr.unwrap_or(config.stderr);
    let use_stdin = options.stdin.unwrap_or(config.stdin);
    let connect_timeout =
        duration_override(options.connect_timeout, config.connect_timeout_duration());
    let command_timeout =
        duration_override(options.command_timeout, config.command_timeout_duration());

    let mut senders = Vec::new();

    // direct remainder runs through the regular distant worker
    if !plan.direct.is_empty() {
        let direct = distant_worker(config, plan.direct.clone(), worker.command(), options);
        let variant = match direct {
            TaskWorker::Exec(w) => WorkerVariant::Exec(w),
            TaskWorker::Ssh(w) => WorkerVariant::Ssh(w),
            TaskWorker::Rsh(w) => WorkerVariant::Rsh(w),
            _ => unreachable!("distant worker is exec, ssh or rsh"),
        };
        for build in variant.as_kind().build_clients(config)? {
            let (stx, srx) = mpsc::unbounded_channel();
            for chunk in &writes {
                let _ = stx.send(StdinMsg::Bytes(chunk.clone()));
            }
            if write_eof {
                let _ = stx.send(StdinMsg::Eof);
            }
            let spec = ClientSpec {
                worker: id,
                key: build.key.clone(),
                command: build.command,
                env: build.env,
                buffered: true,
                split_stderr,
                use_stdin,
                connect_timeout,
                command_timeout,
            };
            tokio::task::spawn_local(run_client(spec, handle.clone(), srx));
            senders.push((build.key, stx));
        }
    }

    // one framed channel per gateway
    for (gateway, _targets, ctl_frame) in &plan.launches {
        let (stx, srx) = mpsc::unbounded_channel();
        let _ = stx.send(StdinMsg::Bytes(ctl_frame.clone()));
        for chunk in &writes {
            if let Some(frame) = state.stdin_frame(gateway, chunk) {
                let _ = stx.send(StdinMsg::Bytes(frame));
            }
        }
        if write_eof {
            if let Some(frame) = state.write_eof_frame(gateway) {
                let _ = stx.send(StdinMsg::Bytes(frame));
            }
        }
        let spec = ClientSpec {
            worker: id,
            key: gateway.clone(),
            command: gateway_command(config, gateway),
            env: Vec::new(),
            // the channel is a byte stream of frames, not lines
            buffered: false,
            split_stderr: true,
            use_stdin: true,
            connect_timeout,
            // channels stay open for the whole remote run
            command_timeout: None,
        };
        tokio::task::spawn_local(run_client(spec, handle.clone(), srx));
        senders.push((gateway.clone(), stx));
    }

    if senders.is_empty() {
        note_handler_error(herr, handler.on_close(id, false));
        return Ok(());
    }
    task.shared.active.borrow_mut().insert(
        id,
        ActiveWorker {
            remaining: senders.len(),
            timed_out: false,
            tree: Some(state),
        },
    );
    task.shared.writers.borrow_mut().insert(id, senders);
    Ok(())
}

/// Dispatch one engine event to the handler and the result stores.
fn dispatch(
    task: &Task,
    handler: &mut dyn EventHandler,
    handle: &EngineHandle,
    msg: EngineMessage,
    herr: &mut Option<anyhow::Error>,
) {
    let cancelled = handle.cancel.is_cancelled();
    // ignore worker-scoped events of workers no longer accounted for
    if let Some(worker) = msg.worker() {
        if !task.shared.active.borrow().contains_key(&worker) {
            return;
        }
    }
    match msg {
        EngineMessage::Pickup { worker, key } => {
            let is_gateway = gateway_key(task, worker, &key);
            if !is_gateway {
                note_handler_error(herr, handler.on_pickup(worker, &key));
            }
        }
        EngineMessage::Read {
            worker,
            key,
            stream,
            data,
        } => {
            if cancelled {
                return; // aborted tasks do not deliver pending reads
            }
            let tree_actions = {
                let mut active = task.shared.active.borrow_mut();
                match active.get_mut(&worker).and_then(|w| w.tree.as_mut()) {
                    Some(state) if state.is_gateway(&key) => {
                        if stream == StreamKind::Stderr {
                            tracing::debug!(gateway = %key, "gw: {}", String::from_utf8_lossy(&data));
                            return;
                        }
                        Some(state.feed(&key, &data))
                    }
                    _ => None,
                }
            };
            match tree_actions {
                Some(actions) => apply_tree_actions(task, handler, worker, actions, herr),
                None => {
                    aggregate(task, &key, stream, &data);
                    note_handler_error(herr, handler.on_read(worker, &key, stream, &data));
                }
            }
        }
        EngineMessage::Written { worker, key, bytes } => {
            if !gateway_key(task, worker, &key) {
                note_handler_error(herr, handler.on_written(worker, &key, bytes));
            }
        }
        EngineMessage::Hup { worker, key, rc } => {
            if gateway_key(task, worker, &key) {
                // gateway process ended; unfinished channels fail their
                // remaining targets, siblings are unaffected
                let pending = {
                    let mut active = task.shared.active.borrow_mut();
                    match active.get_mut(&worker).and_then(|w| w.tree.as_mut()) {
                        Some(state) if !state.finished(&key) => state.fail_pending(&key),
                        _ => Vec::new(),
                    }
                };
                if !pending.is_empty() {
                    tracing::warn!(gateway = %key, rc, "gateway failed, failing its targets");
                }
                for node in pending {
                    task.shared
                        .results
                        .borrow_mut()
                        .record_rc(&node, GW_SYNTHETIC_RC);
                    note_handler_error(herr, handler.on_hup(worker, &node, GW_SYNTHETIC_RC));
                }
            } else {
                task.shared.results.borrow_mut().record_rc(&key, rc);
                note_handler_error(herr, handler.on_hup(worker, &key, rc));
            }
        }
        EngineMessage::NodeTimeout { worker, key } => {
            if gateway_key(task, worker, &key) {
                let pending = {
                    let mut active = task.shared.active.borrow_mut();
                    match active.get_mut(&worker).and_then(|w| w.tree.as_mut()) {
                        Some(state) => state.fail_pending(&key),
                        None => Vec::new(),
                    }
                };
                for node in pending {
                    task.shared
                        .results
                        .borrow_mut()
                        .record_rc(&node, GW_SYNTHETIC_RC);
                    note_handler_error(herr, handler.on_hup(worker, &node, GW_SYNTHETIC_RC));
                }
            } else {
                task.shared.results.borrow_mut().timeouts.insert(key);
                if let Some(w) = task.shared.active.borrow_mut().get_mut(&worker) {
                    w.timed_out = true;
                }
            }
        }
        EngineMessage::ClientDone { worker, .. } => {
            let close_flag = {
                let mut active = task.shared.active.borrow_mut();
                let finished = match active.get_mut(&worker) {
                    None => None,
                    Some(w) => {
                        w.remaining = w.remaining.saturating_sub(1);
                        if w.remaining == 0 {
                            Some(w.timed_out || cancelled)
                        } else {
                            None
                        }
                    }
                };
                if finished.is_some() {
                    active.remove(&worker);
                }
                finished
            };
            if let Some(timed_out) = close_flag {
                task.shared.writers.borrow_mut().remove(&worker);
                note_handler_error(herr, handler.on_close(worker, timed_out));
            }
        }
        EngineMessage::Timer { id } => {
            note_handler_error(herr, handler.on_timer(id));
        }
        EngineMessage::Port {
            id,
            message,
            pending,
        } => {
            pending.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            note_handler_error(herr, handler.on_port(id, message));
        }
    }
}

fn gateway_key(task: &Task, worker: WorkerId, key: &str) -> bool {
    task.shared
        .active
        .borrow()
        .get(&worker)
        .and_then(|w| w.tree.as_ref())
        .map(|state| state.is_gateway(key))
        .unwrap_or(false)
}

fn apply_tree_actions(
    task: &Task,
    handler: &mut dyn EventHandler,
    worker: WorkerId,
    actions: Vec<TreeAction>,
    herr: &mut Option<anyhow::Error>,
) {
    for action in actions {
        match action {
            TreeAction::Deliver { node, stream, data } => {
                aggregate(task, &node, stream, &data);
                note_handler_error(herr, handler.on_read(worker, &node, stream, &data));
            }
            TreeAction::Hup { node, rc } => {
                task.shared.results.borrow_mut().record_rc(&node, rc);
                note_handler_error(herr, handler.on_hup(worker, &node, rc));
            }
            TreeAction::Timeout { node } => {
                task.shared.results.borrow_mut().timeouts.insert(node);
                if let Some(w) = task.shared.active.borrow_mut().get_mut(&worker) {
                    w.timed_out = true;
                }
            }
            TreeAction::ChannelError { gateway, reason } => {
                tracing::warn!(%gateway, %reason, "gateway channel failed");
                let pending = {
                    let mut active = task.shared.active.borrow_mut();
                    match active.get_mut(&worker).and_then(|w| w.tree.as_mut()) {
                        Some(state) => state.fail_pending(&gateway),
                        None => Vec::new(),
                    }
                };
                for node in pending {
                    task.shared
                        .results
                        .borrow_mut()
                        .record_rc(&node, GW_SYNTHETIC_RC);
                    note_handler_error(herr, handler.on_hup(worker, &node, GW_SYNTHETIC_RC));
                }
            }
        }
    }
}

fn aggregate(task: &Task, key: &str, stream: StreamKind, data: &[u8]) {
    let (stdout_tree, stderr_tree) = {
        let config = task.shared.config.borrow();
        (config.stdout_msgtree, config.stderr_msgtree)
    };
    let mut results = task.shared.results.borrow_mut();
    match stream {
        StreamKind::Stdout if stdout_tree => results.stdout.add(key, data),
        StreamKind::Stderr if stderr_tree => results.stderr.add(key, data),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_record_rc_keeps_max() {
        let mut results = TaskResults::default();
        results.record_rc("n1", 0);
        results.record_rc("n2", 1);
        results.record_rc("n1", 0);
        assert_eq!(results.retcodes["n1"], 0);
        assert_eq!(results.max_rc, Some(1));
    }

    #[test]
    fn test_schedule_assigns_increasing_ids() {
        let task = Task::new().unwrap();
        let a = task.schedule(PopenWorker::new("true"));
        let b = task.schedule(PopenWorker::new("true"));
        assert!(b > a);
    }

    #[test]
    fn test_duration_override() {
        let default = Some(Duration::from_secs(10));
        assert_eq!(duration_override(None, default), default);
        assert_eq!(
            duration_override(Some(2.0), default),
            Some(Duration::from_secs(2))
        );
        // explicit zero disables the deadline
        assert_eq!(duration_override(Some(0.0), default), None);
    }

    #[test]
    fn test_shell_requires_targets() {
        let task = Task::new().unwrap();
        assert!(matches!(
            task.shell("true", &NodeSet::new(), WorkerOptions::default()),
            Err(TaskError::Worker(WorkerError::NoTargets))
        ));
    }

    #[test]
    fn test_copy_transport_selection() {
        let mut config = TaskConfig::default();
        assert!(matches!(copy_transport(&config), CopyTransport::Scp));
        config.distant_worker = "rsh".to_string();
        assert!(matches!(copy_transport(&config), CopyTransport::Rcp));
    }
}
