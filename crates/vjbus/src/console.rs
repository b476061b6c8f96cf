//! Console client: discovers workers through the registry, sends them
//! commands and follows their telemetry.
//!
//! Failures are reported tri-state through [`ConsoleError`]:
//! `UnknownWorker` (not registered), `Unhealthy` (registered but stale or
//! unreachable) and `Application` (reachable, answered with an error ack).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bridge::command::{CommandClient, TransportError};
use crate::bridge::telemetry::{TelemetryHandler, TelemetrySubscriber};
use crate::bridge::topic::TopicPattern;
use crate::config::DEFAULT_COMMAND_TIMEOUT;
use crate::envelope::{AckPayload, Envelope, EnvelopeBuilder};
use crate::health::{HealthReport, HealthStatus};
use crate::registry::{Registry, RegistryError, ServiceRecord, ServiceStatus};

pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("worker {0} is not registered")]
    UnknownWorker(String),
    #[error("worker {worker} is unhealthy: {reason}")]
    Unhealthy { worker: String, reason: String },
    #[error("worker {worker} returned an error: {message}")]
    Application { worker: String, message: String },
    #[error("worker {worker} unreachable: {source}")]
    Transport {
        worker: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConsoleError {
    /// Health status a failed call implies for the worker.
    pub fn health_status(&self) -> HealthStatus {
        match self {
            Self::UnknownWorker(_) => HealthStatus::Unknown,
            Self::Unhealthy { .. } | Self::Transport { .. } | Self::Registry(_) => {
                HealthStatus::Unhealthy
            }
            Self::Application { .. } => HealthStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Worker name stamped on outgoing commands.
    pub name: String,
    /// Deadline for the fan-out commands (`health`, `get_state`).
    pub command_timeout: Duration,
    pub discovery_interval: Duration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            name: "console".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }
}

impl ConsoleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }
}

/// One worker's entry in [`Console::get_all_states`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStateReport {
    pub worker: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
struct Subscription {
    pattern: TopicPattern,
    handler: TelemetryHandler,
    worker: Option<String>,
}

impl Subscription {
    fn applies_to(&self, worker: &str) -> bool {
        self.worker.as_deref().is_none_or(|w| w == worker)
    }
}

/// Telemetry connection to one worker's publisher.
struct Feed {
    subscriber: TelemetrySubscriber,
    /// Subscriptions with a lower index are already attached.
    attached: usize,
}

type SharedClient = Arc<tokio::sync::Mutex<CommandClient>>;

pub struct Console {
    registry: Registry,
    config: ConsoleConfig,
    builder: Arc<EnvelopeBuilder>,
    clients: DashMap<String, SharedClient>,
    subscriptions: Mutex<Vec<Subscription>>,
    feeds: Mutex<HashMap<String, Feed>>,
    cancel: CancellationToken,
}

impl Console {
    pub fn new(registry: Registry, config: ConsoleConfig) -> Self {
        let builder = Arc::new(EnvelopeBuilder::new(config.name.clone(), 0));
        Self {
            registry,
            config,
            builder,
            clients: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
            feeds: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub async fn discover_workers(&self, include_stale: bool) -> Result<Vec<ServiceRecord>, ConsoleError> {
        Ok(self
            .registry
            .run_blocking(move |r| r.get_services(include_stale))
            .await?)
    }

    /// Send `verb` to `worker` and wait up to `timeout` for its ack.
    ///
    /// Returns the ack only when it reports success; an error ack becomes
    /// [`ConsoleError::Application`].
    pub async fn send_command(
        &self,
        worker: &str,
        verb: &str,
        data: Map<String, Value>,
        timeout: Duration,
    ) -> Result<AckPayload, ConsoleError> {
        let name = worker.to_string();
        let record = self
            .registry
            .run_blocking(move |r| r.get_service(&name))
            .await?
            .ok_or_else(|| ConsoleError::UnknownWorker(worker.to_string()))?;
        self.send_to(&record, verb, data, timeout).await
    }

    async fn send_to(
        &self,
        record: &ServiceRecord,
        verb: &str,
        data: Map<String, Value>,
        timeout: Duration,
    ) -> Result<AckPayload, ConsoleError> {
        let worker = record.name.as_str();
        let addr = self.command_endpoint(record)?;
        let client = self.client_for(worker, addr);

        let result = client.lock().await.request(verb, data, timeout).await;
        let reply = match result {
            Ok(reply) => reply,
            Err(source) => {
                self.clients.remove_if(worker, |_, cached| Arc::ptr_eq(cached, &client));
                return Err(ConsoleError::Transport {
                    worker: worker.to_string(),
                    source,
                });
            }
        };

        let Some(ack) = reply.as_ack() else {
            return Err(ConsoleError::Application {
                worker: worker.to_string(),
                message: format!("expected ack, got {}", reply.kind().as_str()),
            });
        };
        if !ack.is_ok() {
            return Err(ConsoleError::Application {
                worker: worker.to_string(),
                message: ack.message.clone().unwrap_or_else(|| "command failed".to_string()),
            });
        }
        Ok(ack.clone())
    }

    fn command_endpoint(&self, record: &ServiceRecord) -> Result<SocketAddr, ConsoleError> {
        let unhealthy = |reason: String| ConsoleError::Unhealthy {
            worker: record.name.clone(),
            reason,
        };
        if matches!(record.status, ServiceStatus::Stopped | ServiceStatus::Crashed) {
            return Err(unhealthy(format!("status {}", record.status)));
        }
        let now = Utc::now();
        if !record.is_healthy_at(now, self.registry.heartbeat_timeout()) {
            let age = record.heartbeat_age_at(now);
            return Err(unhealthy(format!("no heartbeat for {:.1}s", age.as_secs_f64())));
        }
        record
            .command_addr()
            .ok_or_else(|| unhealthy("no command endpoint registered".to_string()))
    }

    /// Cached client for `worker`, replaced when its endpoint moved.
    fn client_for(&self, worker: &str, addr: SocketAddr) -> SharedClient {
        if let Some(cached) = self.clients.get(worker) {
            // try_lock: a busy client is mid-request, so its endpoint is current.
            let current = cached
                .try_lock()
                .map(|client| client.addr() == addr)
                .unwrap_or(true);
            if current {
                return cached.value().clone();
            }
        }
        let client: SharedClient = Arc::new(tokio::sync::Mutex::new(CommandClient::new(
            addr,
            Arc::clone(&self.builder),
        )));
        self.clients.insert(worker.to_string(), Arc::clone(&client));
        client
    }

    /// Follow telemetry matching `topic` from `worker`, or from every worker
    /// when `worker` is `None`. Workers that register later are attached by
    /// the next [`Console::refresh`].
    pub async fn subscribe<F>(&self, topic: &str, handler: F, worker: Option<&str>) -> Result<(), ConsoleError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                pattern: TopicPattern::parse(topic),
                handler: Arc::new(handler),
                worker: worker.map(str::to_string),
            });
        self.refresh().await.map(|_| ())
    }

    /// One discovery cycle: re-read the registry and attach subscriptions to
    /// new or moved telemetry endpoints. Returns the workers with a fresh
    /// heartbeat.
    pub async fn refresh(&self) -> Result<Vec<ServiceRecord>, ConsoleError> {
        let records = self.discover_workers(true).await?;
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.retain(|name, _| records.iter().any(|r| &r.name == name));
        for record in &records {
            let Some(addr) = record.telemetry_addr() else {
                continue;
            };
            if !subscriptions.iter().any(|s| s.applies_to(&record.name)) {
                continue;
            }
            let moved = feeds
                .get(&record.name)
                .is_none_or(|feed| feed.subscriber.addr() != addr);
            if moved {
                tracing::debug!(worker = %record.name, %addr, "Following telemetry");
                // Replacing drops the old subscriber, which cancels it.
                feeds.insert(
                    record.name.clone(),
                    Feed {
                        subscriber: TelemetrySubscriber::new(addr),
                        attached: 0,
                    },
                );
            }
            let Some(feed) = feeds.get_mut(&record.name) else {
                continue;
            };
            for sub in subscriptions.iter().skip(feed.attached) {
                if sub.applies_to(&record.name) {
                    feed.subscriber
                        .subscribe_shared(sub.pattern.clone(), Arc::clone(&sub.handler));
                }
            }
            feed.attached = subscriptions.len();
        }
        drop(feeds);

        let now = Utc::now();
        let timeout = self.registry.heartbeat_timeout();
        Ok(records
            .into_iter()
            .filter(|r| r.is_healthy_at(now, timeout))
            .collect())
    }

    /// Refresh every `interval` until [`Console::shutdown`].
    pub async fn run_discovery(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(error = %e, "Worker discovery failed");
                    }
                }
            }
        }
        tracing::debug!("Discovery stopped");
    }

    /// Ask every registered worker for `health`. One worker failing yields a
    /// non-healthy entry, never an error for the whole call.
    pub async fn health_check_all(&self) -> Result<Vec<HealthReport>, ConsoleError> {
        let records = self.discover_workers(true).await?;
        Ok(join_all(records.iter().map(|r| self.health_of(r))).await)
    }

    async fn health_of(&self, record: &ServiceRecord) -> HealthReport {
        let result = self
            .send_to(record, "health", Map::new(), self.config.command_timeout)
            .await;
        let mut report = match result {
            Ok(ack) => match ack.data.map(serde_json::from_value::<HealthReport>) {
                Some(Ok(report)) => report,
                Some(Err(e)) => HealthReport::failed(
                    &record.name,
                    HealthStatus::Degraded,
                    format!("malformed health report: {e}"),
                ),
                None => HealthReport::healthy(&record.name),
            },
            Err(e) => HealthReport::failed(&record.name, e.health_status(), e.to_string()),
        };
        report.pid = report.pid.or(record.pid);
        report.instance_id = report.instance_id.or(record.instance_id);
        report.generation = report.generation.or(Some(record.generation));
        report
    }

    /// `get_state` from every registered worker.
    pub async fn get_all_states(&self) -> Result<Vec<WorkerStateReport>, ConsoleError> {
        let records = self.discover_workers(true).await?;
        Ok(join_all(records.iter().map(|r| self.state_of(r))).await)
    }

    async fn state_of(&self, record: &ServiceRecord) -> WorkerStateReport {
        let result = self
            .send_to(record, "get_state", Map::new(), self.config.command_timeout)
            .await;
        match result {
            Ok(ack) => {
                let data = ack.data.unwrap_or(Value::Null);
                let config_version = ack
                    .applied_config_version
                    .or_else(|| data.get("config_version").and_then(Value::as_u64));
                let state = match data {
                    Value::Object(mut map) if map.contains_key("state") => map.remove("state"),
                    other => Some(other),
                };
                WorkerStateReport {
                    worker: record.name.clone(),
                    status: HealthStatus::Healthy,
                    config_version,
                    state,
                    error: None,
                }
            }
            Err(e) => WorkerStateReport {
                worker: record.name.clone(),
                status: e.health_status(),
                config_version: None,
                state: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stop discovery and drop every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.clients.clear();
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
