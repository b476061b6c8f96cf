//! WorkerNode: the piece every worker process embeds.
//!
//! A node owns one command endpoint, one telemetry publisher and a heartbeat
//! loop. The heartbeat runs on its own task and its own schedule, so a stuck
//! command handler never silences the liveness signal the supervisor watches.
//!
//! ```text
//! start():  bind command + telemetry  ->  register in registry
//!           spawn command loop, telemetry accept loop, heartbeat loop
//!           publish `worker_started`
//! stop():   cancel  ->  join each loop (bounded)  ->  registry: stopped
//! ```
//!
//! A stopped node can be started again in the same process; it keeps its
//! instance id and generation.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bridge::command::{
    Command, CommandError, CommandHandler, CommandReply, CommandServer, Dispatcher, Handlers,
    handler_fn,
};
use crate::bridge::osc::OscMirror;
use crate::bridge::telemetry::TelemetryPublisher;
use crate::config::BusConfig;
use crate::envelope::{
    EnvelopeBuilder, EventLevel, HeartbeatPayload, InstanceId, ProtocolError,
};
use crate::health::HealthReport;
use crate::registry::{
    Heartbeat, Registry, RegistryError, ServicePorts, ServiceRecord, ServiceStatus,
};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {endpoint} endpoint: {source}")]
    Bind {
        endpoint: &'static str,
        source: io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker {0} has not been started")]
    NotStarted(String),
    #[error("worker {0} is already started")]
    AlreadyStarted(String),
}

/// Last state reported through `send_state`.
#[derive(Debug, Clone, Default, PartialEq)]
struct StateSnapshot {
    config_version: Option<u64>,
    state: Value,
}

struct Shared {
    name: String,
    builder: Arc<EnvelopeBuilder>,
    run: RwLock<Option<RunInfo>>,
    state: Mutex<StateSnapshot>,
    version: VersionInfo,
}

/// What exists only between `start()` and `stop()`.
#[derive(Clone)]
struct RunInfo {
    publisher: Arc<TelemetryPublisher>,
    started_at: Instant,
    ports: ServicePorts,
}

impl Shared {
    fn run_info(&self) -> Result<RunInfo, NodeError> {
        self.run
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| NodeError::NotStarted(self.name.clone()))
    }

    fn publisher(&self) -> Result<Arc<TelemetryPublisher>, NodeError> {
        self.run_info().map(|run| run.publisher)
    }

    fn set_run(&self, run: Option<RunInfo>) {
        *self.run.write().unwrap_or_else(PoisonError::into_inner) = run;
    }

    /// Registry record for this running instance.
    fn record(&self) -> Result<ServiceRecord, NodeError> {
        let ports = self.run_info()?.ports;
        Ok(ServiceRecord::new(self.name.clone())
            .with_pid(std::process::id())
            .with_status(ServiceStatus::Running)
            .with_ports(ports)
            .with_instance(self.builder.instance_id(), self.builder.generation())
            .with_metadata("vjbus_version", json!(self.version.vjbus)))
    }

    fn uptime(&self) -> Duration {
        self.run_info()
            .map(|run| run.started_at.elapsed())
            .unwrap_or_default()
    }
}

/// Cloneable handle for publishing from handlers and worker tasks.
///
/// Can be taken before `start()`; publishing fails with
/// [`NodeError::NotStarted`] until the node is running.
#[derive(Clone)]
pub struct NodeSender {
    shared: Arc<Shared>,
}

impl NodeSender {
    /// Publish one telemetry sample on `stream`. Never blocks.
    pub fn send_telemetry(&self, stream: &str, data: Value) -> Result<(), NodeError> {
        let publisher = self.shared.publisher()?;
        publisher.publish(&self.shared.builder.telemetry(stream, data))?;
        Ok(())
    }

    pub fn send_event(
        &self,
        level: EventLevel,
        message: &str,
        details: Map<String, Value>,
    ) -> Result<(), NodeError> {
        let publisher = self.shared.publisher()?;
        publisher.publish(&self.shared.builder.event(level, message, details))?;
        Ok(())
    }

    /// Record the state returned by `get_state` and publish it as `state_sync`.
    pub fn send_state(&self, config_version: Option<u64>, state: Value) -> Result<(), NodeError> {
        {
            let mut current = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            current.config_version = config_version;
            current.state = state.clone();
        }
        let publisher = self.shared.publisher()?;
        publisher.publish(&self.shared.builder.state_sync(config_version, state))?;
        Ok(())
    }
}

struct Running {
    command_addr: SocketAddr,
    telemetry_addr: SocketAddr,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct WorkerNode {
    config: BusConfig,
    registry: Registry,
    handlers: Handlers,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    running: Option<Running>,
}

impl WorkerNode {
    /// Build a node for worker slot `name`.
    ///
    /// The generation is taken from the config (set by the supervisor) or
    /// else one past the generation of the previous registry record.
    pub fn new(name: impl Into<String>, config: BusConfig, registry: Registry) -> Result<Self, NodeError> {
        let name = name.into();
        let generation = match config.generation {
            Some(generation) => generation,
            None => registry
                .get_service(&name)?
                .map(|previous| previous.generation + 1)
                .unwrap_or(1),
        };
        let builder = Arc::new(EnvelopeBuilder::new(name.clone(), generation));
        tracing::debug!(worker = %name, generation, instance_id = %builder.instance_id(), "Created worker node");

        Ok(Self {
            config,
            registry,
            handlers: Handlers::new(),
            shared: Arc::new(Shared {
                name,
                builder,
                run: RwLock::new(None),
                state: Mutex::new(StateSnapshot::default()),
                version: VersionInfo::new(),
            }),
            cancel: CancellationToken::new(),
            running: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn generation(&self) -> u64 {
        self.shared.builder.generation()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.shared.builder.instance_id()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.command_addr)
    }

    pub fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.telemetry_addr)
    }

    /// Fires when the node is stopping. Worker loops should select on it.
    ///
    /// Each `start()` after a `stop()` runs under a fresh token, so take it
    /// after starting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sender(&self) -> NodeSender {
        NodeSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register the handler for `verb`, replacing any earlier one (including
    /// the built-in `ping`, `health` and `get_state`).
    pub fn command(&self, verb: impl Into<String>, handler: impl CommandHandler) {
        self.handlers.insert(verb, handler);
    }

    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.running.is_some() {
            return Err(NodeError::AlreadyStarted(self.shared.name.clone()));
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let name = self.shared.name.clone();
        self.install_builtin_verbs();

        let server = CommandServer::bind(self.config.command_port)
            .await
            .map_err(|source| NodeError::Bind {
                endpoint: "command",
                source,
            })?;
        let osc = match self.config.osc_target {
            Some(target) if self.config.capabilities.osc_mirror => match OscMirror::bind(target).await {
                Ok(mirror) => Some(mirror),
                Err(e) => {
                    tracing::warn!(worker = %name, %target, error = %e, "OSC mirror unavailable");
                    None
                }
            },
            _ => None,
        };
        let (publisher, accept_task) =
            TelemetryPublisher::bind(name.clone(), self.config.telemetry_port, osc, self.cancel.clone())
                .await
                .map_err(|source| NodeError::Bind {
                    endpoint: "telemetry",
                    source,
                })?;

        let command_addr = server.local_addr();
        let telemetry_addr = publisher.local_addr();
        self.shared.set_run(Some(RunInfo {
            publisher,
            started_at: Instant::now(),
            ports: ServicePorts {
                command: Some(command_addr.port()),
                telemetry: Some(telemetry_addr.port()),
            },
        }));
        let record = self.shared.record()?;
        if let Err(e) = self.registry.run_blocking(move |r| r.register(record)).await {
            self.cancel.cancel();
            self.shared.set_run(None);
            return Err(e.into());
        }

        let dispatcher = Dispatcher::new(self.handlers.clone(), Arc::clone(&self.shared.builder));
        let command_task = tokio::spawn(server.serve(dispatcher, self.cancel.clone()));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.shared),
            self.registry.clone(),
            self.config.clone(),
            self.cancel.clone(),
        ));

        self.running = Some(Running {
            command_addr,
            telemetry_addr,
            tasks: vec![
                ("command", command_task),
                ("telemetry", accept_task),
                ("heartbeat", heartbeat_task),
            ],
        });

        tracing::info!(
            worker = %name,
            generation = self.generation(),
            instance_id = %self.instance_id(),
            %command_addr,
            %telemetry_addr,
            "Worker started"
        );
        let mut details = Map::new();
        details.insert("generation".into(), json!(self.generation()));
        details.insert("instance_id".into(), json!(self.instance_id()));
        details.insert("pid".into(), json!(std::process::id()));
        self.sender()
            .send_event(EventLevel::Info, "worker_started", details)?;
        Ok(())
    }

    pub fn send_telemetry(&self, stream: &str, data: Value) -> Result<(), NodeError> {
        self.sender().send_telemetry(stream, data)
    }

    pub fn send_event(
        &self,
        level: EventLevel,
        message: &str,
        details: Map<String, Value>,
    ) -> Result<(), NodeError> {
        self.sender().send_event(level, message, details)
    }

    pub fn send_state(&self, config_version: Option<u64>, state: Value) -> Result<(), NodeError> {
        self.sender().send_state(config_version, state)
    }

    /// Stop every loop and mark the registry record stopped.
    ///
    /// Each loop gets `shutdown_timeout` to finish; one that does not is
    /// aborted and left behind. Calling `stop` twice is a no-op.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let name = self.shared.name.clone();
        tracing::info!(worker = %name, "Stopping worker");
        self.cancel.cancel();

        let timeout = self.config.shutdown_timeout;
        for (task_name, handle) in running.tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(worker = %name, task = task_name, error = %e, "Loop ended abnormally"),
                Err(_) => {
                    tracing::warn!(worker = %name, task = task_name, ?timeout, "Loop did not stop in time, abandoning");
                    abort.abort();
                }
            }
        }

        self.shared.set_run(None);
        let registry_name = name.clone();
        let instance = self.instance_id();
        let marked = self
            .registry
            .run_blocking(move |r| r.set_instance_status(&registry_name, instance, ServiceStatus::Stopped))
            .await?;
        if !marked {
            tracing::debug!(worker = %name, "Registry record belongs to another instance, left as is");
        }
        tracing::info!(worker = %name, "Worker stopped");
        Ok(())
    }

    fn install_builtin_verbs(&self) {
        let shared = Arc::clone(&self.shared);
        self.handlers.insert_default(
            "ping",
            handler_fn(move |_cmd: Command| {
                let shared = Arc::clone(&shared);
                async move {
                    Ok(CommandReply::data(json!({
                        "pong": true,
                        "worker": shared.name,
                        "generation": shared.builder.generation(),
                    })))
                }
            }),
        );

        let shared = Arc::clone(&self.shared);
        self.handlers.insert_default(
            "health",
            handler_fn(move |_cmd: Command| {
                let shared = Arc::clone(&shared);
                async move {
                    let mut report = HealthReport::healthy(shared.name.clone());
                    report.pid = Some(std::process::id());
                    report.instance_id = Some(shared.builder.instance_id());
                    report.generation = Some(shared.builder.generation());
                    report.uptime_sec = Some(shared.uptime().as_secs_f64());
                    report.version = Some(shared.version.clone());
                    serde_json::to_value(report)
                        .map(CommandReply::data)
                        .map_err(|e| CommandError::failed(e.to_string()))
                }
            }),
        );

        let shared = Arc::clone(&self.shared);
        self.handlers.insert_default(
            "get_state",
            handler_fn(move |_cmd: Command| {
                let shared = Arc::clone(&shared);
                async move {
                    let snapshot = shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    let mut reply = CommandReply::data(json!({
                        "config_version": snapshot.config_version,
                        "state": snapshot.state,
                    }));
                    if let Some(version) = snapshot.config_version {
                        reply = reply.with_applied_config_version(version);
                    }
                    Ok(reply)
                }
            }),
        );
    }
}

impl Drop for WorkerNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// cpu/mem of this process, if the platform supports sampling.
struct ProcessStats {
    system: Option<(sysinfo::System, sysinfo::Pid)>,
}

impl ProcessStats {
    fn new(enabled: bool) -> Self {
        let system = if enabled {
            sysinfo::get_current_pid()
                .ok()
                .map(|pid| (sysinfo::System::new(), pid))
        } else {
            None
        };
        Self { system }
    }

    fn sample(&mut self) -> (f32, u64) {
        let Some((system, pid)) = self.system.as_mut() else {
            return (0.0, 0);
        };
        system.refresh_process(*pid);
        system
            .process(*pid)
            .map(|p| (p.cpu_usage(), p.memory()))
            .unwrap_or((0.0, 0))
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, registry: Registry, config: BusConfig, cancel: CancellationToken) {
    let mut stats = ProcessStats::new(config.capabilities.process_stats);
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let instance = shared.builder.instance_id();
    let mut superseded = false;

    loop {
        let scheduled = tokio::select! {
            _ = cancel.cancelled() => break,
            scheduled = ticker.tick() => scheduled,
        };
        let lag = tokio::time::Instant::now().saturating_duration_since(scheduled);

        let name = shared.name.clone();
        match registry.run_blocking(move |r| r.update_heartbeat(&name, instance)).await {
            Ok(Heartbeat::Stamped) => superseded = false,
            Ok(Heartbeat::Missing) => {
                // Record vanished (unregistered or registry reset); put it back.
                superseded = false;
                if let Err(e) = reregister(&shared, &registry).await {
                    tracing::warn!(worker = %shared.name, error = %e, "Failed to re-register");
                }
            }
            Ok(Heartbeat::Superseded { owner }) => {
                if !superseded {
                    tracing::warn!(
                        worker = %shared.name,
                        %instance,
                        owner = ?owner,
                        "Registry slot taken by another instance, heartbeat not recorded"
                    );
                }
                superseded = true;
            }
            Err(e) => tracing::warn!(worker = %shared.name, error = %e, "Heartbeat registry write failed"),
        }

        let (cpu, mem) = stats.sample();
        let heartbeat = shared.builder.heartbeat(HeartbeatPayload {
            cpu,
            mem,
            uptime_sec: shared.uptime().as_secs_f64(),
            lag_ms: lag.as_secs_f64() * 1000.0,
        });
        if let Ok(publisher) = shared.publisher()
            && let Err(e) = publisher.publish(&heartbeat)
        {
            tracing::debug!(worker = %shared.name, error = %e, "Heartbeat publish failed");
        }
        tracing::trace!(worker = %shared.name, cpu, mem, lag_ms = lag.as_millis() as u64, "Heartbeat");
    }
    tracing::debug!(worker = %shared.name, "Heartbeat loop exiting");
}

async fn reregister(shared: &Shared, registry: &Registry) -> Result<(), NodeError> {
    let record = shared.record()?;
    registry.run_blocking(move |r| r.register(record)).await?;
    Ok(())
}
