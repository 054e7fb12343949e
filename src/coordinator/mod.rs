use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use serde_json::{json, Value};

use crate::channel::TransportContext;
use crate::dispatch::panic_message;
use crate::logging::LogLevel;
use crate::shutdown::ShutdownSignal;
use crate::worker::{WorkerError, WorkerHandle, WorkerLoop, WorkerSpec, WorkerStatsSnapshot};

type Task = Box<dyn FnOnce(ShutdownSignal) + Send>;

#[derive(Debug)]
pub enum CoordinatorError {
    Worker(WorkerError),
    DuplicateWorker { coordinator: String, worker: String },
    AlreadyStarted { coordinator: String },
    Stopped { coordinator: String },
    SpawnTask { task: String, source: io::Error },
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker(source) => write!(f, "{source}"),
            Self::DuplicateWorker {
                coordinator,
                worker,
            } => write!(f, "coordinator '{coordinator}' already has a worker named '{worker}'"),
            Self::AlreadyStarted { coordinator } => {
                write!(f, "coordinator '{coordinator}' was already started")
            }
            Self::Stopped { coordinator } => write!(f, "coordinator '{coordinator}' is stopped"),
            Self::SpawnTask { task, source } => {
                write!(f, "failed to spawn thread for task '{task}': {source}")
            }
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Worker(source) => Some(source),
            Self::SpawnTask { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<WorkerError> for CoordinatorError {
    fn from(value: WorkerError) -> Self {
        Self::Worker(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Configuring,
    Running,
    Stopped,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// Outcome of [`ThreadCoordinator::stop_all`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Queue entries that were still waiting when the queues closed.
    pub undelivered: u64,
    pub workers: BTreeMap<String, WorkerStatsSnapshot>,
    /// Threads that ended with a panic.
    pub failures: Vec<String>,
}

struct TaskHandle {
    name: String,
    join: JoinHandle<()>,
}

struct CoordinatorState {
    phase: Phase,
    pending_workers: Vec<WorkerLoop>,
    pending_tasks: Vec<(String, Task)>,
    workers: Vec<WorkerHandle>,
    tasks: Vec<TaskHandle>,
    listening: BTreeMap<String, SocketAddr>,
    report: Option<StopReport>,
}

/// Starts and stops every worker thread of one process role as a unit.
///
/// Workers are opened (listeners bound) when added and spawned by
/// [`start_all`](Self::start_all). All of them share the context's shutdown
/// signal, which [`stop_all`](Self::stop_all) triggers before closing queues
/// and joining threads.
pub struct ThreadCoordinator {
    name: String,
    log_context: String,
    ctx: TransportContext,
    state: Mutex<CoordinatorState>,
    stopping: Mutex<()>,
}

impl ThreadCoordinator {
    pub fn new(name: impl Into<String>, ctx: TransportContext) -> Self {
        let name = name.into();
        Self {
            log_context: format!("coordinator::{name}"),
            name,
            ctx,
            state: Mutex::new(CoordinatorState {
                phase: Phase::Configuring,
                pending_workers: Vec::new(),
                pending_tasks: Vec::new(),
                workers: Vec::new(),
                tasks: Vec::new(),
                listening: BTreeMap::new(),
                report: None,
            }),
            stopping: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &TransportContext {
        &self.ctx
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.ctx.shutdown().clone()
    }

    pub fn add_worker(&self, spec: WorkerSpec) -> Result<(), CoordinatorError> {
        let mut state = self.lock_state();
        self.ensure_configuring(&state)?;
        if state.pending_workers.iter().any(|worker| worker.name() == spec.name) {
            return Err(CoordinatorError::DuplicateWorker {
                coordinator: self.name.clone(),
                worker: spec.name,
            });
        }

        let worker = WorkerLoop::open(spec, self.ctx.clone())?;
        for (channel, addr) in worker.local_addrs() {
            self.ctx.logger().log(
                LogLevel::Info,
                Some(&self.log_context),
                "listening",
                Some(json!({"worker": worker.name(), "channel": channel, "address": addr.to_string()})),
            );
            state.listening.insert(channel, addr);
        }
        state.pending_workers.push(worker);
        Ok(())
    }

    /// Registers a plain thread that runs alongside the workers, such as a
    /// simulator. The task must return once the signal fires.
    pub fn add_task<F>(&self, name: impl Into<String>, task: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(ShutdownSignal) + Send + 'static,
    {
        let mut state = self.lock_state();
        self.ensure_configuring(&state)?;
        state.pending_tasks.push((name.into(), Box::new(task)));
        Ok(())
    }

    /// Bound address of a listening channel, useful with port 0.
    pub fn local_addr(&self, channel: &str) -> Option<SocketAddr> {
        self.lock_state().listening.get(channel).copied()
    }

    pub fn start_all(&self) -> Result<(), CoordinatorError> {
        let mut state = self.lock_state();
        match state.phase {
            Phase::Configuring => {}
            Phase::Running => {
                return Err(CoordinatorError::AlreadyStarted {
                    coordinator: self.name.clone(),
                })
            }
            Phase::Stopped => {
                return Err(CoordinatorError::Stopped {
                    coordinator: self.name.clone(),
                })
            }
        }
        state.phase = Phase::Running;

        for worker in std::mem::take(&mut state.pending_workers) {
            let handle = worker.spawn()?;
            state.workers.push(handle);
        }
        for (name, task) in std::mem::take(&mut state.pending_tasks) {
            let signal = self.shutdown_signal();
            let join = thread::Builder::new()
                .name(format!("task-{name}"))
                .spawn(move || task(signal))
                .map_err(|source| CoordinatorError::SpawnTask {
                    task: name.clone(),
                    source,
                })?;
            state.tasks.push(TaskHandle { name, join });
        }

        self.ctx.logger().log(
            LogLevel::Info,
            Some(&self.log_context),
            "all workers started",
            Some(json!({"workers": state.workers.len(), "tasks": state.tasks.len()})),
        );
        Ok(())
    }

    /// Stops every thread and returns what was left undone. Later calls,
    /// from any thread, return the first report.
    pub fn stop_all(&self) -> StopReport {
        let _stopping = self.stopping.lock().expect("coordinator stop lock poisoned");

        let (workers, tasks) = {
            let mut state = self.lock_state();
            if let Some(report) = state.report.as_ref() {
                return report.clone();
            }
            state.phase = Phase::Stopped;
            state.pending_workers.clear();
            state.pending_tasks.clear();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.tasks),
            )
        };

        self.ctx.shutdown().trigger();

        let mut report = StopReport::default();
        for worker in &workers {
            if let Some(queue) = worker.queue() {
                let undelivered = queue.close().len() as u64;
                worker.stats().add_dropped(undelivered);
                report.undelivered += undelivered;
            }
        }

        for worker in workers {
            let name = worker.name().to_owned();
            match worker.join() {
                Ok(stats) => {
                    report.workers.insert(name, stats);
                }
                Err(error) => {
                    self.ctx.logger().error(Some(&self.log_context), &error.to_string());
                    report.failures.push(name);
                }
            }
        }
        for task in tasks {
            if let Err(panic) = task.join.join() {
                self.ctx.logger().log(
                    LogLevel::Error,
                    Some(&self.log_context),
                    "task panicked",
                    Some(json!({"task": task.name, "panic": panic_message(panic.as_ref())})),
                );
                report.failures.push(task.name);
            }
        }

        self.ctx.logger().log(
            LogLevel::Info,
            Some(&self.log_context),
            "all workers stopped",
            Some(json!({"undelivered_dropped": report.undelivered, "failures": report.failures})),
        );
        self.lock_state().report = Some(report.clone());
        report
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().phase == Phase::Running
    }

    pub fn status(&self) -> Value {
        let state = self.lock_state();
        json!({
            "coordinator": self.name,
            "phase": state.phase.as_str(),
            "listening": state
                .listening
                .iter()
                .map(|(channel, addr)| (channel.clone(), Value::String(addr.to_string())))
                .collect::<serde_json::Map<String, Value>>(),
            "workers": state.workers.iter().map(WorkerHandle::status).collect::<Vec<_>>(),
            "tasks": state
                .tasks
                .iter()
                .map(|task| json!({"name": task.name, "running": !task.join.is_finished()}))
                .collect::<Vec<_>>(),
        })
    }

    fn ensure_configuring(&self, state: &CoordinatorState) -> Result<(), CoordinatorError> {
        match state.phase {
            Phase::Configuring => Ok(()),
            Phase::Running => Err(CoordinatorError::AlreadyStarted {
                coordinator: self.name.clone(),
            }),
            Phase::Stopped => Err(CoordinatorError::Stopped {
                coordinator: self.name.clone(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().expect("coordinator state lock poisoned")
    }
}

impl Drop for ThreadCoordinator {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop_all();
        }
    }
}

impl fmt::Debug for ThreadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCoordinator")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::channel::testing::test_context;
    use crate::channel::{ChannelSpec, ReplyChannel, RequestChannel};
    use crate::dispatch::DispatchTable;
    use crate::queue::OutboundQueue;
    use crate::wire::envelope::{message_argument, Envelope};
    use crate::worker::testing::wait_until;
    use crate::worker::WorkerSpec;

    use super::{CoordinatorError, ThreadCoordinator};

    const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

    fn unused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("bound").to_string();
        drop(listener);
        address
    }

    #[test]
    fn start_is_single_shot_and_stop_is_idempotent_across_threads() {
        let (ctx, _sink) = test_context(None);
        let coordinator = Arc::new(ThreadCoordinator::new("imm", ctx));
        coordinator
            .add_worker(WorkerSpec::new("rds_commands").forward_requests(
                ChannelSpec::dial("rds_commands", unused_address()),
                OutboundQueue::new("rds_commands"),
            ))
            .expect("worker should open");
        let ran = Arc::new(AtomicBool::new(false));
        let task_ran = Arc::clone(&ran);
        coordinator
            .add_task("drone", move |signal| {
                task_ran.store(true, Ordering::SeqCst);
                while !signal.wait_timeout(Duration::from_secs(1), Duration::from_millis(5)) {}
            })
            .expect("task should register");

        coordinator.start_all().expect("first start");
        assert!(matches!(
            coordinator.start_all(),
            Err(CoordinatorError::AlreadyStarted { .. })
        ));
        assert!(matches!(
            coordinator.add_worker(WorkerSpec::new("late")),
            Err(CoordinatorError::AlreadyStarted { .. })
        ));

        let remote = Arc::clone(&coordinator);
        let first = thread::spawn(move || remote.stop_all())
            .join()
            .expect("stopper thread");
        let second = coordinator.stop_all();

        assert_eq!(first, second);
        assert!(first.failures.is_empty());
        assert!(first.workers.contains_key("rds_commands"));
        assert!(ran.load(Ordering::SeqCst));
        assert!(!coordinator.is_running());
        assert!(matches!(
            coordinator.start_all(),
            Err(CoordinatorError::Stopped { .. })
        ));
    }

    #[test]
    fn duplicate_worker_names_are_rejected() {
        let (ctx, _sink) = test_context(None);
        let coordinator = ThreadCoordinator::new("rds", ctx);
        let table = Arc::new(DispatchTable::new("info", Arc::clone(coordinator.context().logger())));
        coordinator
            .add_worker(
                WorkerSpec::new("info").respond(ChannelSpec::listen("info", "127.0.0.1:0"), Arc::clone(&table)),
            )
            .expect("first worker");

        let err = coordinator
            .add_worker(WorkerSpec::new("info").respond(ChannelSpec::listen("info2", "127.0.0.1:0"), table))
            .expect_err("duplicate name");

        assert!(matches!(err, CoordinatorError::DuplicateWorker { .. }));
        assert!(coordinator.local_addr("info").is_some());
    }

    #[test]
    fn stop_drops_undelivered_entries() {
        let (ctx, sink) = test_context(None);
        let coordinator = ThreadCoordinator::new("imm", ctx);
        let queue = OutboundQueue::new("rds_commands");
        coordinator
            .add_worker(
                WorkerSpec::new("rds_commands")
                    .forward_requests(ChannelSpec::dial("rds_commands", unused_address()), queue.clone()),
            )
            .expect("worker should open");
        coordinator.start_all().expect("start");

        for function in ["A", "B", "C"] {
            queue.push(Envelope::call(function)).expect("push");
        }
        assert!(wait_until(|| queue.len() == 2));

        let report = coordinator.stop_all();

        assert_eq!(report.undelivered, 2);
        assert_eq!(report.workers["rds_commands"].dropped, 3);
        assert_eq!(report.workers["rds_commands"].forwarded, 0);
        assert!(queue.push(Envelope::call("D")).is_err());
        assert!(sink.contains("all workers stopped"));
    }

    #[test]
    fn gui_request_is_acknowledged_and_forwarded_downstream() {
        let (rds_ctx, _rds_sink) = test_context(Some(REPLY_TIMEOUT));
        let mut rds = ReplyChannel::open(ChannelSpec::listen("rds_commands", "127.0.0.1:0"), rds_ctx)
            .expect("rds should bind");
        let rds_address = rds.local_addr().expect("bound").to_string();
        let rds_thread = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Ok(Some(request)) = rds.receive_request() {
                    let _ = rds.send_reply(&Envelope::message_reply("Image added to queue"));
                    return Some(request);
                }
            }
            None
        });

        let (ctx, _sink) = test_context(Some(REPLY_TIMEOUT));
        let coordinator = ThreadCoordinator::new("imm", ctx);
        let downstream = OutboundQueue::new("rds_commands");
        let handoff = downstream.clone();
        let mut table = DispatchTable::new("gui_requests", Arc::clone(coordinator.context().logger()));
        table
            .register("add_poi", move |argument| {
                handoff
                    .push(Envelope::new("add_poi", argument.clone()))
                    .map_err(|err| err.to_string())?;
                Ok(Some(message_argument("Poi added")))
            })
            .expect("register");
        coordinator
            .add_worker(
                WorkerSpec::new("gui_requests")
                    .respond(ChannelSpec::listen("gui_requests", "127.0.0.1:0"), Arc::new(table)),
            )
            .expect("gui worker");
        coordinator
            .add_worker(
                WorkerSpec::new("rds_commands")
                    .forward_requests(ChannelSpec::dial("rds_commands", rds_address), downstream),
            )
            .expect("rds worker");
        let gui_address = coordinator
            .local_addr("gui_requests")
            .expect("gui listener bound")
            .to_string();
        coordinator.start_all().expect("start");

        let coordinates = json!({"center": {"lat": 58.123456, "long": 16.123456}});
        let (client_ctx, _client_sink) = test_context(Some(REPLY_TIMEOUT));
        let mut gui = RequestChannel::open(ChannelSpec::dial("gui", gui_address), client_ctx)
            .expect("gui client");
        let reply = gui
            .request(&Envelope::from_json("add_poi", json!({"coordinates": coordinates})).expect("object"))
            .expect("reply");

        assert_eq!(reply, Envelope::message_reply("Poi added"));
        let forwarded = rds_thread
            .join()
            .expect("rds thread")
            .expect("downstream worker should forward the request");
        assert_eq!(forwarded.function, "add_poi");
        assert_eq!(forwarded.argument.get("coordinates"), Some(&coordinates));

        let status = coordinator.status();
        assert_eq!(status["phase"], json!("running"));
        assert_eq!(status["workers"].as_array().map(Vec::len), Some(2));
        assert!(wait_until(
            || coordinator.status()["workers"][1]["stats"]["forwarded"] == json!(1)
        ));

        let report = coordinator.stop_all();
        assert_eq!(report.workers["gui_requests"].served, 1);
        assert_eq!(report.workers["rds_commands"].forwarded, 1);
    }
}
