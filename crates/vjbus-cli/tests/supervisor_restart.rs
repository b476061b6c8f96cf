//! Supervisor + real worker processes, driven through the console.
#![cfg(unix)]

use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Map, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vjbus::config::RestartConfig;
use vjbus::{
    Console, ConsoleConfig, Envelope, HealthStatus, InstanceId, Registry, ServiceRecord,
    ServiceStatus, Supervisor, SupervisorConfig, SupervisorHandle, WorkerSpec,
};

const WORKER: &str = "echo";

fn echo_spec() -> WorkerSpec {
    WorkerSpec::new(WORKER, env!("CARGO_BIN_EXE_vjbus-echo-worker"))
        .with_env("VJBUS_HEARTBEAT_INTERVAL_MS", "100")
        .with_env("VJBUS_LOG", "warn")
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig::new()
        .with_check_interval(Duration::from_millis(100))
        .with_heartbeat_timeout(Duration::from_secs(10))
        .with_stop_timeout(Duration::from_secs(2))
        .with_restart(RestartConfig {
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            crash_window_ms: 60_000,
            crash_threshold: 5,
        })
        .with_worker(echo_spec())
}

struct Harness {
    _dir: tempfile::TempDir,
    registry: Registry,
    handle: SupervisorHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.json"))
            .unwrap()
            .with_heartbeat_timeout(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let (handle, task) =
            Supervisor::new(supervisor_config(), registry.clone()).spawn(cancel.clone());
        Self {
            _dir: dir,
            registry,
            handle,
            cancel,
            task,
        }
    }

    fn console(&self) -> Console {
        Console::new(self.registry.clone(), ConsoleConfig::new())
    }

    /// Wait until the worker has registered itself and satisfies `pred`.
    async fn wait_for_record<F>(&self, mut pred: F) -> ServiceRecord
    where
        F: FnMut(&ServiceRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(record) = self.registry.get_service(WORKER).unwrap()
                && record.status == ServiceStatus::Running
                && record.instance_id.is_some()
                && pred(&record)
            {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

/// Refresh discovery until a tick from `instance` arrives; returns it.
async fn next_tick_from(
    console: &Console,
    rx: &mut mpsc::UnboundedReceiver<(InstanceId, u64, u64)>,
    instance: InstanceId,
) -> (InstanceId, u64, u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            console.refresh().await.unwrap();
            let wait = tokio::time::sleep(Duration::from_millis(200));
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    Some(tick) = rx.recv() => if tick.0 == instance {
                        return tick;
                    },
                    _ = &mut wait => break,
                }
            }
        }
    })
    .await
    .expect("no tick from the expected instance")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_worker_is_replaced_by_a_new_instance() {
    let harness = Harness::start();
    let first = harness.wait_for_record(|_| true).await;
    let first_instance = first.instance_id.unwrap();
    let first_pid = first.pid.unwrap();

    let console = harness.console();
    let (tx, mut rx) = mpsc::unbounded_channel();
    console
        .subscribe(
            "echo.tick",
            move |env: &Envelope| {
                if let Some(t) = env.as_telemetry() {
                    let _ = tx.send((env.instance_id(), env.generation(), t.sequence));
                }
            },
            Some(WORKER),
        )
        .await
        .unwrap();
    next_tick_from(&console, &mut rx, first_instance).await;

    kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).unwrap();

    let second = harness
        .wait_for_record(|r| r.instance_id != Some(first_instance))
        .await;
    assert_ne!(second.pid, Some(first_pid));
    assert!(second.generation > first.generation);
    let second_instance = second.instance_id.unwrap();

    let (_, generation, _) = next_tick_from(&console, &mut rx, second_instance).await;
    assert_eq!(generation, second.generation);

    // Once the new instance is heard from, the old one never is again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok((instance, _, _)) = rx.try_recv() {
        assert_eq!(instance, second_instance);
    }

    let workers = harness.handle.list_workers().await.unwrap();
    assert_eq!(workers[0].restart_count, 1);
    assert_eq!(workers[0].last_exit.as_deref(), Some("signal 9"));

    console.shutdown();
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_commands_reach_a_supervised_worker() {
    let harness = Harness::start();
    harness.wait_for_record(|_| true).await;
    let console = harness.console();
    let timeout = Duration::from_secs(2);

    let mut data = Map::new();
    data.insert("hello".into(), json!("world"));
    let echoed = console
        .send_command(WORKER, "echo", data, timeout)
        .await
        .unwrap();
    assert_eq!(echoed.data, Some(json!({"hello": "world"})));

    let mut config = Map::new();
    config.insert("config_version".into(), json!(4));
    config.insert("gain".into(), json!(0.25));
    let applied = console
        .send_command(WORKER, "set_config", config, timeout)
        .await
        .unwrap();
    assert_eq!(applied.applied_config_version, Some(4));

    let states = console.get_all_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].config_version, Some(4));
    assert_eq!(states[0].state.as_ref().unwrap()["gain"], json!(0.25));

    let health = console.health_check_all().await.unwrap();
    assert_eq!(health[0].status, HealthStatus::Healthy);

    // Stopping through the supervisor leaves a stopped record behind.
    harness.handle.stop_worker(WORKER).await.unwrap();
    let record = harness.registry.get_service(WORKER).unwrap().unwrap();
    assert_eq!(record.status, ServiceStatus::Stopped);
    let err = console
        .send_command(WORKER, "echo", Map::new(), timeout)
        .await
        .unwrap_err();
    assert_eq!(err.health_status(), HealthStatus::Unhealthy);

    console.shutdown();
    harness.shutdown().await;
}
