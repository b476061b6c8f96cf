//! Process supervisor.
//!
//! Keeps a static table of managed workers and restarts the ones that die.
//!
//! The supervisor is an actor: one task owns the worker table and reacts to
//! - the check tick (reap exited children, run the registry staleness sweep)
//! - expired restart timers (one `DelayQueue` entry per pending restart)
//! - control requests from [`SupervisorHandle`]
//!
//! It is itself a [`WorkerNode`] named `supervisor`, so consoles reach its
//! `start_worker`/`stop_worker`/`restart_worker`/`list_workers`/`get_state`
//! verbs through the same registry and command transport as any worker.
//!
//! Workers are launched detached (own process group, never killed on drop)
//! with their output captured and re-emitted under the `vjbus::worker`
//! tracing target.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::bridge::command::{Command, CommandError, CommandReply, handler_fn};
use crate::config::{
    BusConfig, ConfigError, ENV_COMMAND_PORT, ENV_GENERATION, ENV_REGISTRY, ENV_TELEMETRY_PORT,
    ENV_WORKER_NAME, SupervisorConfig, WorkerSpec,
};
use crate::envelope::EventLevel;
use crate::node::{NodeError, NodeSender, WorkerNode};
use crate::policy::{CrashHistory, RestartDecision, RestartPolicy};
use crate::registry::{Registry, RegistryError, ServicePorts, ServiceRecord, ServiceStatus};

/// Registry name of the supervisor's own node.
pub const SUPERVISOR_NAME: &str = "supervisor";

const CONTROL_QUEUE: usize = 16;

/// Liveness poll while waiting for a leftover worker to exit.
const ORPHAN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),
    #[error("failed to start worker {worker}: {source}")]
    Spawn { worker: String, source: SpawnError },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("supervisor is not running")]
    Closed,
}

/// Everything a spawner needs to launch one instance of a worker slot.
#[derive(Debug, Clone)]
pub struct WorkerLaunch<'a> {
    pub spec: &'a WorkerSpec,
    pub generation: u64,
    pub registry_path: &'a Path,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch<'_>) -> Result<Child, SpawnError>;
}

/// Spawns the configured program as a detached child process.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, launch: &WorkerLaunch<'_>) -> Result<Child, SpawnError> {
        let spec = launch.spec;
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .env(ENV_WORKER_NAME, &spec.name)
            .env(ENV_GENERATION, launch.generation.to_string())
            .env(ENV_REGISTRY, launch.registry_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(port) = spec.command_port {
            cmd.env(ENV_COMMAND_PORT, port.to_string());
        }
        if let Some(port) = spec.telemetry_port {
            cmd.env(ENV_TELEMETRY_PORT, port.to_string());
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        // Own process group: a ^C aimed at the supervisor does not reach workers.
        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd.spawn()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Stopped,
    Running,
    /// Crashed, restart scheduled.
    Backoff,
    /// Crashed too often; stays down until started by hand.
    CircuitOpen,
}

/// Point-in-time view of one managed worker, as returned by `list_workers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub name: String,
    pub enabled: bool,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub generation: u64,
    pub restart_count: u32,
    pub recent_crashes: usize,
    pub last_exit: Option<String>,
    pub next_restart_in_ms: Option<u64>,
}

struct ManagedWorker {
    spec: WorkerSpec,
    enabled: bool,
    status: WorkerStatus,
    child: Option<Child>,
    pid: Option<u32>,
    generation: u64,
    last_start: Option<Instant>,
    history: CrashHistory,
    restart_key: Option<delay_queue::Key>,
    next_restart_at: Option<Instant>,
    last_exit: Option<String>,
}

impl ManagedWorker {
    fn new(spec: WorkerSpec, generation: u64) -> Self {
        Self {
            enabled: spec.enabled,
            spec,
            status: WorkerStatus::Stopped,
            child: None,
            pid: None,
            generation,
            last_start: None,
            history: CrashHistory::new(),
            restart_key: None,
            next_restart_at: None,
            last_exit: None,
        }
    }

    fn snapshot(&self, policy: &RestartPolicy, now: Instant) -> WorkerState {
        WorkerState {
            name: self.spec.name.clone(),
            enabled: self.enabled,
            status: self.status,
            pid: self.pid,
            generation: self.generation,
            restart_count: self.history.restart_count(),
            recent_crashes: self.history.recent_crashes(now, policy.crash_window),
            last_exit: self.last_exit.clone(),
            next_restart_in_ms: self
                .next_restart_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

enum Control {
    Start {
        worker: String,
        reply: oneshot::Sender<Result<WorkerState, SupervisorError>>,
    },
    Stop {
        worker: String,
        reply: oneshot::Sender<Result<WorkerState, SupervisorError>>,
    },
    Restart {
        worker: String,
        reply: oneshot::Sender<Result<WorkerState, SupervisorError>>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkerState>>,
    },
}

/// Cloneable handle to a running supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Control>,
}

impl SupervisorHandle {
    fn channel() -> (Self, mpsc::Receiver<Control>) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        (Self { tx }, rx)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        reply_rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Enable and start `worker`. Closes an open circuit breaker.
    pub async fn start_worker(&self, worker: &str) -> Result<WorkerState, SupervisorError> {
        let worker = worker.to_string();
        self.call(|reply| Control::Start { worker, reply }).await?
    }

    /// Disable and stop `worker`: terminate, bounded wait, kill.
    pub async fn stop_worker(&self, worker: &str) -> Result<WorkerState, SupervisorError> {
        let worker = worker.to_string();
        self.call(|reply| Control::Stop { worker, reply }).await?
    }

    pub async fn restart_worker(&self, worker: &str) -> Result<WorkerState, SupervisorError> {
        let worker = worker.to_string();
        self.call(|reply| Control::Restart { worker, reply }).await?
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerState>, SupervisorError> {
        self.call(|reply| Control::List { reply }).await
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    policy: RestartPolicy,
    registry: Registry,
    spawner: Arc<dyn WorkerSpawner>,
    events: Option<NodeSender>,
    workers: BTreeMap<String, ManagedWorker>,
    restarts: DelayQueue<String>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, registry: Registry) -> Self {
        let policy = config.restart_policy();
        let registry = registry.with_heartbeat_timeout(config.heartbeat_timeout());
        let workers = config
            .workers
            .iter()
            .map(|spec| (spec.name.clone(), ManagedWorker::new(spec.clone(), 0)))
            .collect();
        Self {
            config,
            policy,
            registry,
            spawner: Arc::new(ProcessSpawner),
            events: None,
            workers,
            restarts: DelayQueue::new(),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Publish `worker_crashed`/`worker_circuit_open` events through `sender`.
    pub fn with_events(mut self, sender: NodeSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Start the actor. It stops every worker and exits when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> (SupervisorHandle, JoinHandle<()>) {
        let (handle, control) = SupervisorHandle::channel();
        let task = tokio::spawn(self.run(control, cancel));
        (handle, task)
    }

    async fn run(mut self, mut control: mpsc::Receiver<Control>, cancel: CancellationToken) {
        tracing::info!(
            workers = self.workers.len(),
            check_interval_ms = self.config.check_interval_ms,
            "Supervisor starting"
        );
        self.recover_previous().await;
        let names: Vec<String> = self.workers.keys().cloned().collect();
        for name in names {
            if self.workers.get(&name).is_some_and(|w| w.enabled)
                && let Err(e) = self.spawn_worker(&name).await
            {
                tracing::error!(worker = %name, error = %e, "Initial start failed");
                self.schedule_after_crash(&name, format!("spawn failed: {e}")).await;
            }
        }

        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check().await,
                Some(expired) = self.restarts.next(), if !self.restarts.is_empty() => {
                    self.restart_due(expired.into_inner()).await;
                }
                msg = control.recv() => match msg {
                    Some(msg) => self.handle_control(msg).await,
                    None => break,
                },
            }
        }

        tracing::info!("Supervisor shutting down, stopping workers");
        let names: Vec<String> = self.workers.keys().cloned().collect();
        for name in names {
            self.stop_process(&name).await;
        }
    }

    /// Continue each slot's generation sequence from the registry and
    /// terminate workers a previous supervisor left running.
    ///
    /// Only records that are live with a fresh heartbeat count as left
    /// running, so a recycled pid behind an old record is never signalled.
    async fn recover_previous(&mut self) {
        let records = match self.registry.run_blocking(|r| r.get_services(true)).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read previous worker records");
                return;
            }
        };
        let now = Utc::now();
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let stop_timeout = self.config.stop_timeout();

        for record in records {
            let Some(worker) = self.workers.get_mut(&record.name) else {
                continue;
            };
            worker.generation = worker.generation.max(record.generation);

            let live = matches!(record.status, ServiceStatus::Running | ServiceStatus::Starting)
                && record.is_healthy_at(now, heartbeat_timeout);
            let Some(pid) = record.pid.filter(|&pid| live && pid != std::process::id()) else {
                continue;
            };
            if !process_alive(pid) {
                continue;
            }

            tracing::warn!(
                worker = %record.name,
                pid,
                generation = record.generation,
                "Terminating worker left running by a previous supervisor"
            );
            let exit = terminate_pid(pid, stop_timeout).await;
            tracing::info!(worker = %record.name, pid, %exit, "Leftover worker gone");
            worker.last_exit = Some(exit);

            let name = record.name.clone();
            let result = self
                .registry
                .run_blocking(move |r| {
                    r.update(&name, |rec| {
                        if rec.pid == Some(pid) {
                            rec.status = ServiceStatus::Stopped;
                        }
                    })
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to record leftover worker stop");
            }
        }
    }

    async fn handle_control(&mut self, msg: Control) {
        match msg {
            Control::Start { worker, reply } => {
                let result = self.start_worker(&worker).await;
                let _ = reply.send(result);
            }
            Control::Stop { worker, reply } => {
                let result = self.stop_worker(&worker).await;
                let _ = reply.send(result);
            }
            Control::Restart { worker, reply } => {
                let result = self.restart_worker(&worker).await;
                let _ = reply.send(result);
            }
            Control::List { reply } => {
                let _ = reply.send(self.states());
            }
        }
    }

    fn states(&self) -> Vec<WorkerState> {
        let now = Instant::now();
        self.workers
            .values()
            .map(|w| w.snapshot(&self.policy, now))
            .collect()
    }

    fn state_of(&self, name: &str) -> Result<WorkerState, SupervisorError> {
        self.workers
            .get(name)
            .map(|w| w.snapshot(&self.policy, Instant::now()))
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))
    }

    /// Drop any pending restart and forget crash history.
    fn reset_worker(&mut self, name: &str) -> Result<(), SupervisorError> {
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
        worker.enabled = true;
        worker.history.reset();
        worker.next_restart_at = None;
        if let Some(key) = worker.restart_key.take() {
            self.restarts.remove(&key);
        }
        Ok(())
    }

    async fn start_worker(&mut self, name: &str) -> Result<WorkerState, SupervisorError> {
        self.reset_worker(name)?;
        if self.workers.get(name).is_some_and(|w| w.child.is_some()) {
            tracing::debug!(worker = %name, "Start requested for running worker");
            return self.state_of(name);
        }
        self.spawn_worker(name).await?;
        self.state_of(name)
    }

    async fn stop_worker(&mut self, name: &str) -> Result<WorkerState, SupervisorError> {
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
        worker.enabled = false;
        worker.next_restart_at = None;
        if let Some(key) = worker.restart_key.take() {
            self.restarts.remove(&key);
        }
        self.stop_process(name).await;
        self.state_of(name)
    }

    async fn restart_worker(&mut self, name: &str) -> Result<WorkerState, SupervisorError> {
        self.reset_worker(name)?;
        self.stop_process(name).await;
        self.spawn_worker(name).await?;
        self.state_of(name)
    }

    async fn spawn_worker(&mut self, name: &str) -> Result<(), SupervisorError> {
        let registry_path = self.registry.path().to_path_buf();
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;

        let generation = worker.generation + 1;
        let launch = WorkerLaunch {
            spec: &worker.spec,
            generation,
            registry_path: &registry_path,
        };
        let mut child = self
            .spawner
            .spawn(&launch)
            .map_err(|source| SupervisorError::Spawn {
                worker: name.to_string(),
                source,
            })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_string(), "stderr", stderr);
        }

        worker.generation = generation;
        worker.child = Some(child);
        worker.pid = pid;
        worker.last_start = Some(Instant::now());
        worker.status = WorkerStatus::Running;
        worker.next_restart_at = None;
        let ports = ServicePorts {
            command: worker.spec.command_port,
            telemetry: worker.spec.telemetry_port,
        };
        tracing::info!(worker = %name, pid = ?pid, generation, "Spawned worker");

        let name = name.to_string();
        let result = self
            .registry
            .run_blocking(move |r| record_launch(r, &name, pid, generation, ports))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to record worker launch");
        }
        Ok(())
    }

    /// Terminate, wait up to `stop_timeout`, kill. Always followed by a
    /// registry write of the final state.
    async fn stop_process(&mut self, name: &str) {
        let timeout = self.config.stop_timeout();
        let Some(worker) = self.workers.get_mut(name) else {
            return;
        };
        worker.status = WorkerStatus::Stopped;
        worker.pid = None;
        let Some(mut child) = worker.child.take() else {
            return;
        };

        tracing::info!(worker = %name, pid = ?child.id(), "Stopping worker");
        terminate(&mut child);
        let exit = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => describe_exit(status),
            Ok(Err(e)) => format!("wait failed: {e}"),
            Err(_) => {
                tracing::warn!(worker = %name, ?timeout, "Worker ignored terminate, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(worker = %name, error = %e, "Kill failed");
                }
                "killed".to_string()
            }
        };
        tracing::info!(worker = %name, %exit, "Worker stopped");
        worker.last_exit = Some(exit);

        let name = name.to_string();
        let result = self
            .registry
            .run_blocking(move |r| r.set_status(&name, ServiceStatus::Stopped))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to record worker stop");
        }
    }

    async fn check(&mut self) {
        let mut exited = Vec::new();
        for (name, worker) in self.workers.iter_mut() {
            let Some(child) = worker.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    worker.child = None;
                    worker.pid = None;
                    exited.push((name.clone(), describe_exit(status)));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(worker = %name, error = %e, "Failed to poll worker"),
            }
        }
        for (name, exit) in exited {
            self.schedule_after_crash(&name, exit).await;
        }

        let stale = match self.registry.run_blocking(|r| r.cleanup_stale_services()).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Registry staleness sweep failed");
                return;
            }
        };
        let timeout = self.config.heartbeat_timeout();
        for name in stale {
            let Some(worker) = self.workers.get_mut(&name) else {
                continue;
            };
            let grace_over = worker
                .last_start
                .is_some_and(|t| t.elapsed() >= timeout);
            if !grace_over {
                continue;
            }
            let Some(mut child) = worker.child.take() else {
                continue;
            };
            // Alive but silent: treat as hung.
            tracing::warn!(worker = %name, pid = ?child.id(), "Worker heartbeat timed out, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(worker = %name, error = %e, "Kill failed");
            }
            worker.pid = None;
            self.schedule_after_crash(&name, "heartbeat timeout".to_string())
                .await;
        }
    }

    /// Record a crash of `name` and apply the restart policy.
    async fn schedule_after_crash(&mut self, name: &str, exit: String) {
        let now = Instant::now();
        let Some(worker) = self.workers.get_mut(name) else {
            return;
        };
        worker.last_exit = Some(exit.clone());
        let generation = worker.generation;
        let last_start = worker.last_start.unwrap_or(now);
        let decision = worker.history.record_crash(&self.policy, now, last_start);

        tracing::warn!(worker = %name, %exit, generation, "Worker crashed");
        let mut details = Map::new();
        details.insert("worker".into(), json!(name));
        details.insert("exit".into(), json!(exit));
        details.insert("generation".into(), json!(generation));

        match decision {
            RestartDecision::Restart { attempt, delay, due } => {
                worker.status = WorkerStatus::Backoff;
                worker.next_restart_at = Some(due);
                if let Some(key) = worker.restart_key.take() {
                    self.restarts.remove(&key);
                }
                worker.restart_key = Some(
                    self.restarts
                        .insert_at(name.to_string(), tokio::time::Instant::from_std(due)),
                );
                tracing::info!(worker = %name, attempt, ?delay, "Restart scheduled");
                details.insert("restart_attempt".into(), json!(attempt));
                details.insert("restart_delay_ms".into(), json!(delay.as_millis() as u64));
                self.emit(EventLevel::Error, "worker_crashed", details);
            }
            RestartDecision::CircuitOpen { recent_crashes } => {
                worker.status = WorkerStatus::CircuitOpen;
                worker.next_restart_at = None;
                tracing::error!(
                    worker = %name,
                    recent_crashes,
                    "Worker crashing repeatedly, not restarting"
                );
                self.emit(EventLevel::Error, "worker_crashed", details.clone());
                details.insert("recent_crashes".into(), json!(recent_crashes));
                self.emit(EventLevel::Critical, "worker_circuit_open", details);
            }
        }

        let name = name.to_string();
        let result = self
            .registry
            .run_blocking(move |r| r.set_status(&name, ServiceStatus::Crashed))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to record worker crash");
        }
    }

    async fn restart_due(&mut self, name: String) {
        let Some(worker) = self.workers.get_mut(&name) else {
            return;
        };
        worker.restart_key = None;
        if !worker.enabled || worker.child.is_some() || worker.status != WorkerStatus::Backoff {
            return;
        }
        tracing::info!(worker = %name, "Restarting worker");
        if let Err(e) = self.spawn_worker(&name).await {
            tracing::error!(worker = %name, error = %e, "Restart failed");
            self.schedule_after_crash(&name, format!("spawn failed: {e}"))
                .await;
        }
    }

    fn emit(&self, level: EventLevel, message: &str, details: Map<String, Value>) {
        if let Some(events) = &self.events
            && let Err(e) = events.send_event(level, message, details)
        {
            tracing::debug!(error = %e, "Supervisor event not published");
        }
    }
}

/// Write the `starting` record for a freshly spawned instance, unless that
/// instance already registered itself.
fn record_launch(
    registry: &Registry,
    name: &str,
    pid: Option<u32>,
    generation: u64,
    ports: ServicePorts,
) -> Result<(), RegistryError> {
    registry.transaction(|doc| {
        if doc
            .services
            .get(name)
            .is_some_and(|r| r.generation >= generation && r.instance_id.is_some())
        {
            return;
        }
        let mut record = ServiceRecord::new(name).with_ports(ports);
        record.pid = pid;
        record.generation = generation;
        doc.services.insert(name.to_string(), record);
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id()
        && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
    {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM a process that is not our child, wait up to `timeout` for it to
/// go away, then SIGKILL it.
#[cfg(unix)]
async fn terminate_pid(pid: u32, timeout: Duration) -> String {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    if let Err(e) = kill(target, Signal::SIGTERM) {
        return format!("terminate failed: {e}");
    }
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return "terminated".to_string();
        }
        tokio::time::sleep(ORPHAN_POLL).await;
    }
    tracing::warn!(pid, ?timeout, "Leftover worker ignored terminate, killing");
    match kill(target, Signal::SIGKILL) {
        Ok(()) => "killed".to_string(),
        Err(e) => format!("kill failed: {e}"),
    }
}

#[cfg(not(unix))]
async fn terminate_pid(_pid: u32, _timeout: Duration) -> String {
    "not supported".to_string()
}

/// How long a console should wait for `verb` sent to the supervisor.
///
/// `stop_worker` and `restart_worker` may block for the full stop timeout
/// before they answer.
pub fn control_timeout(verb: &str, command_timeout: Duration, stop_timeout: Duration) -> Duration {
    match verb {
        "stop_worker" | "restart_worker" => command_timeout + stop_timeout,
        _ => command_timeout,
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    status.to_string()
}

/// Re-emit a child's output line by line under the `vjbus::worker` target.
fn forward_output<R>(worker: String, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "vjbus::worker", worker = %worker, stream, "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(worker = %worker, stream, error = %e, "Worker output closed");
                    break;
                }
            }
        }
    });
}

#[derive(Deserialize)]
struct WorkerTarget {
    worker: String,
}

fn control_reply<T: Serialize>(result: Result<T, SupervisorError>) -> Result<CommandReply, CommandError> {
    match result {
        Ok(value) => serde_json::to_value(value)
            .map(CommandReply::data)
            .map_err(|e| CommandError::failed(e.to_string())),
        Err(e) => Err(CommandError::failed(e.to_string())),
    }
}

/// Expose `handle` as the supervisor's command verbs on `node`.
pub fn register_control_verbs(node: &WorkerNode, handle: &SupervisorHandle) {
    let targeted = [
        ("start_worker", ControlVerb::Start),
        ("stop_worker", ControlVerb::Stop),
        ("restart_worker", ControlVerb::Restart),
    ];
    for (verb, kind) in targeted {
        let handle = handle.clone();
        node.command(
            verb,
            handler_fn(move |cmd: Command| {
                let handle = handle.clone();
                async move {
                    let target: WorkerTarget = match cmd.data_as() {
                        Ok(target) => target,
                        Err(e) => return Err(e),
                    };
                    let result = match kind {
                        ControlVerb::Start => handle.start_worker(&target.worker).await,
                        ControlVerb::Stop => handle.stop_worker(&target.worker).await,
                        ControlVerb::Restart => handle.restart_worker(&target.worker).await,
                    };
                    control_reply(result)
                }
            }),
        );
    }

    let list = handle.clone();
    node.command(
        "list_workers",
        handler_fn(move |_cmd: Command| {
            let handle = list.clone();
            async move { control_reply(handle.list_workers().await) }
        }),
    );

    let state = handle.clone();
    node.command(
        "get_state",
        handler_fn(move |_cmd: Command| {
            let handle = state.clone();
            async move {
                let result = handle
                    .list_workers()
                    .await
                    .map(|workers| json!({ "workers": workers }));
                control_reply(result)
            }
        }),
    );
}

#[derive(Clone, Copy)]
enum ControlVerb {
    Start,
    Stop,
    Restart,
}

/// Run a supervisor with its own `supervisor` node until `cancel` fires.
pub async fn serve(
    config: SupervisorConfig,
    bus: BusConfig,
    cancel: CancellationToken,
) -> Result<(), SupervisorError> {
    config.validate()?;
    let bus = bus.with_heartbeat_timeout(config.heartbeat_timeout());
    let registry = bus.registry()?;

    let mut node = WorkerNode::new(SUPERVISOR_NAME, bus, registry.clone())?;
    let supervisor = Supervisor::new(config, registry).with_events(node.sender());
    let (handle, control) = SupervisorHandle::channel();
    register_control_verbs(&node, &handle);
    node.start().await?;

    let actor = tokio::spawn(supervisor.run(control, cancel.clone()));
    cancel.cancelled().await;
    if let Err(e) = actor.await {
        tracing::error!(error = %e, "Supervisor task failed");
    }
    node.stop().await?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RestartConfig;

    fn sh(name: &str, script: &str) -> WorkerSpec {
        WorkerSpec::new(name, "/bin/sh").with_args(["-c", script])
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig::new()
            .with_check_interval(Duration::from_millis(50))
            .with_heartbeat_timeout(Duration::from_secs(60))
            .with_stop_timeout(Duration::from_millis(300))
            .with_restart(RestartConfig {
                base_backoff_ms: 50,
                max_backoff_ms: 200,
                crash_window_ms: 60_000,
                crash_threshold: 5,
            })
    }

    fn temp_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.json")).unwrap();
        (dir, registry)
    }

    async fn wait_for<F>(handle: &SupervisorHandle, worker: &str, mut pred: F) -> WorkerState
    where
        F: FnMut(&WorkerState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let states = handle.list_workers().await.unwrap();
            let state = states.into_iter().find(|s| s.name == worker).unwrap();
            if pred(&state) {
                return state;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition never met, last state: {state:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn process_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn crashed_worker_is_restarted_with_new_generation() {
        let (_dir, registry) = temp_registry();
        let config = fast_config().with_worker(sh("flaky", "sleep 0.1; exit 3"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry.clone()).spawn(cancel.clone());

        let state = wait_for(&handle, "flaky", |s| s.restart_count >= 2 && s.status == WorkerStatus::Running).await;
        assert!(state.generation >= 3);
        assert_eq!(state.last_exit.as_deref(), Some("exit code 3"));

        let record = registry.get_service("flaky").unwrap().unwrap();
        assert!(record.generation >= 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn circuit_breaker_stops_restarts_until_manual_start() {
        let (_dir, registry) = temp_registry();
        let config = fast_config()
            .with_restart(RestartConfig {
                base_backoff_ms: 10,
                max_backoff_ms: 20,
                crash_window_ms: 60_000,
                crash_threshold: 2,
            })
            .with_worker(sh("doomed", "exit 1"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry.clone()).spawn(cancel.clone());

        let open = wait_for(&handle, "doomed", |s| s.status == WorkerStatus::CircuitOpen).await;
        assert_eq!(open.restart_count, 2);
        assert_eq!(open.recent_crashes, 3);
        assert_eq!(open.generation, 3);

        // Stays down.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let still = wait_for(&handle, "doomed", |_| true).await;
        assert_eq!(still.status, WorkerStatus::CircuitOpen);
        assert_eq!(still.generation, 3);
        assert_eq!(
            registry.get_service("doomed").unwrap().unwrap().status,
            ServiceStatus::Crashed
        );

        let started = handle.start_worker("doomed").await.unwrap();
        assert_eq!(started.generation, 4);
        assert_eq!(started.restart_count, 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_terminates_and_records_final_state() {
        let (_dir, registry) = temp_registry();
        let config = fast_config().with_worker(sh("sleepy", "exec sleep 30"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry.clone()).spawn(cancel.clone());

        let running = wait_for(&handle, "sleepy", |s| s.pid.is_some()).await;
        let pid = running.pid.unwrap();
        assert!(process_alive(pid));

        let stopped = handle.stop_worker("sleepy").await.unwrap();
        assert_eq!(stopped.status, WorkerStatus::Stopped);
        assert!(!stopped.enabled);
        assert_eq!(stopped.last_exit.as_deref(), Some("signal 15"));
        assert!(!process_alive(pid));
        assert_eq!(
            registry.get_service("sleepy").unwrap().unwrap().status,
            ServiceStatus::Stopped
        );

        // A stopped worker is not restarted by the check loop.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let later = wait_for(&handle, "sleepy", |_| true).await;
        assert_eq!(later.status, WorkerStatus::Stopped);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stubborn_worker_is_killed_after_timeout() {
        let (_dir, registry) = temp_registry();
        let config = fast_config().with_worker(sh(
            "stubborn",
            "trap '' TERM; while true; do sleep 0.05; done",
        ));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry).spawn(cancel.clone());

        wait_for(&handle, "stubborn", |s| s.pid.is_some()).await;
        let started = std::time::Instant::now();
        let stopped = handle.stop_worker("stubborn").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(stopped.last_exit.as_deref(), Some("killed"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn restart_replaces_the_process() {
        let (_dir, registry) = temp_registry();
        let config = fast_config().with_worker(sh("sleepy", "exec sleep 30"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry).spawn(cancel.clone());

        let before = wait_for(&handle, "sleepy", |s| s.pid.is_some()).await;
        let after = handle.restart_worker("sleepy").await.unwrap();
        assert_ne!(after.pid, before.pid);
        assert_eq!(after.generation, before.generation + 1);
        assert!(!process_alive(before.pid.unwrap()));

        cancel.cancel();
        task.await.unwrap();
        assert!(!process_alive(after.pid.unwrap()));
    }

    #[tokio::test]
    async fn unknown_and_disabled_workers() {
        let (_dir, registry) = temp_registry();
        let config = fast_config().with_worker(sh("idle", "exec sleep 30").with_enabled(false));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry).spawn(cancel.clone());

        assert!(matches!(
            handle.stop_worker("ghost").await,
            Err(SupervisorError::UnknownWorker(name)) if name == "ghost"
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let idle = wait_for(&handle, "idle", |_| true).await;
        assert_eq!(idle.status, WorkerStatus::Stopped);
        assert!(idle.pid.is_none());

        let started = handle.start_worker("idle").await.unwrap();
        assert!(started.enabled);
        assert!(started.pid.is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn worker_left_by_previous_supervisor_is_terminated() {
        use crate::envelope::InstanceId;
        use std::os::unix::process::ExitStatusExt;

        let (_dir, registry) = temp_registry();
        let mut leftover = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let leftover_pid = leftover.id().unwrap();
        let exited = tokio::spawn(async move { leftover.wait().await });
        registry
            .register(
                ServiceRecord::new("sleepy")
                    .with_pid(leftover_pid)
                    .with_status(ServiceStatus::Running)
                    .with_instance(InstanceId::new(), 4),
            )
            .unwrap();

        let config = fast_config().with_worker(sh("sleepy", "exec sleep 30"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry.clone()).spawn(cancel.clone());

        let running = wait_for(&handle, "sleepy", |s| s.pid.is_some()).await;
        assert_eq!(running.generation, 5);
        assert_ne!(running.pid, Some(leftover_pid));
        assert!(matches!(running.last_exit.as_deref(), Some("terminated" | "killed")));

        let status = tokio::time::timeout(Duration::from_secs(5), exited)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(15));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stale_record_pid_is_not_signalled() {
        use crate::envelope::InstanceId;

        let (_dir, registry) = temp_registry();
        let mut bystander = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let bystander_pid = bystander.id().unwrap();
        let long_ago = Utc::now() - chrono::TimeDelta::seconds(600);
        registry
            .register(
                ServiceRecord::new_at("sleepy", long_ago)
                    .with_pid(bystander_pid)
                    .with_status(ServiceStatus::Running)
                    .with_instance(InstanceId::new(), 2),
            )
            .unwrap();

        let config = fast_config().with_worker(sh("sleepy", "exec sleep 30"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry).spawn(cancel.clone());

        let running = wait_for(&handle, "sleepy", |s| s.pid.is_some()).await;
        assert_eq!(running.generation, 3);
        assert!(running.last_exit.is_none());
        assert!(bystander.try_wait().unwrap().is_none());

        cancel.cancel();
        task.await.unwrap();
        bystander.kill().await.unwrap();
    }

    #[test]
    fn control_verbs_that_stop_wait_for_the_stop_timeout() {
        let command = Duration::from_secs(2);
        let stop = Duration::from_secs(5);
        assert_eq!(control_timeout("stop_worker", command, stop), Duration::from_secs(7));
        assert_eq!(control_timeout("restart_worker", command, stop), Duration::from_secs(7));
        assert_eq!(control_timeout("list_workers", command, stop), command);
    }

    #[tokio::test]
    async fn spawn_failure_is_treated_as_crash() {
        let (_dir, registry) = temp_registry();
        let config = fast_config().with_worker(WorkerSpec::new("missing", "/nonexistent/worker-binary"));
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry).spawn(cancel.clone());

        let state = wait_for(&handle, "missing", |s| s.status == WorkerStatus::CircuitOpen).await;
        assert!(state.last_exit.unwrap().starts_with("spawn failed"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn control_verbs_over_the_command_transport() {
        use crate::bridge::command::CommandClient;
        use crate::envelope::EnvelopeBuilder;

        let dir = tempfile::tempdir().unwrap();
        let bus = BusConfig::new().with_registry_path(dir.path().join("registry.json"));
        let registry = bus.registry().unwrap();
        let config = fast_config().with_worker(sh("sleepy", "exec sleep 30"));

        let mut node = WorkerNode::new(SUPERVISOR_NAME, bus, registry.clone()).unwrap();
        let cancel = CancellationToken::new();
        let (handle, task) = Supervisor::new(config, registry).spawn(cancel.clone());
        register_control_verbs(&node, &handle);
        node.start().await.unwrap();

        let mut client = CommandClient::new(
            node.command_addr().unwrap(),
            Arc::new(EnvelopeBuilder::new("console", 0)),
        );
        let list = client
            .request("list_workers", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        let workers: Vec<WorkerState> =
            serde_json::from_value(list.as_ack().unwrap().data.clone().unwrap()).unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "sleepy");

        let mut data = Map::new();
        data.insert("worker".into(), json!("ghost"));
        let unknown = client
            .request("stop_worker", data, Duration::from_secs(2))
            .await
            .unwrap();
        let ack = unknown.as_ack().unwrap();
        assert!(!ack.is_ok());
        assert_eq!(ack.message.as_deref(), Some("unknown worker: ghost"));

        let missing_arg = client
            .request("restart_worker", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!missing_arg.as_ack().unwrap().is_ok());

        let state = client
            .request("get_state", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(state.as_ack().unwrap().data.as_ref().unwrap()["workers"].is_array());

        cancel.cancel();
        task.await.unwrap();
        node.stop().await.unwrap();
    }
}
