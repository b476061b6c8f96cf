//! File-backed service registry.
//!
//! One JSON document shared by every process on the host. Mutations hold an
//! exclusive `flock(2)` on a sidecar `<file>.lock` for the whole
//! read-modify-write cycle and publish the new document with an atomic rename,
//! so readers never take the lock and never see a torn write.
//!
//! Health is derived from `heartbeat_at` at read time. Nothing caches it.
//!
//! The API is synchronous. Async callers go through [`Registry::run_blocking`]
//! so the lock is never held on a runtime worker thread.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::config::{DEFAULT_HEARTBEAT_TIMEOUT, ENV_REGISTRY};
use crate::envelope::InstanceId;

/// On-disk document format version.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePorts {
    #[serde(default)]
    pub command: Option<u16>,
    #[serde(default)]
    pub telemetry: Option<u16>,
}

/// Last known location and liveness of one worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: ServiceStatus,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub ports: ServicePorts,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(default)]
    pub generation: u64,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self::new_at(name, Utc::now())
    }

    pub fn new_at(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            status: ServiceStatus::Starting,
            started_at: now,
            heartbeat_at: now,
            ports: ServicePorts::default(),
            metadata: Map::new(),
            instance_id: None,
            generation: 0,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_ports(mut self, ports: ServicePorts) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_instance(mut self, instance_id: InstanceId, generation: u64) -> Self {
        self.instance_id = Some(instance_id);
        self.generation = generation;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Time since the last heartbeat; zero if the heartbeat is in the future.
    pub fn heartbeat_age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.heartbeat_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_healthy_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age_at(now) < timeout
    }

    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.ports
            .command
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.ports
            .telemetry
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}

/// The whole registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecord>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            updated_at: None,
            services: BTreeMap::new(),
        }
    }
}

/// Outcome of a heartbeat write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Stamped,
    /// No record under the name.
    Missing,
    /// The record belongs to another instance and was left untouched.
    Superseded { owner: Option<InstanceId> },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry i/o error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to lock registry {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("registry task failed: {0}")]
    Task(String),
}

/// Handle to the registry file. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    heartbeat_timeout: Duration,
}

impl Registry {
    /// Open (and if needed create the directory of) the registry at `path`.
    /// The file itself is created by the first mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Ok(Self {
            path,
            lock_path: PathBuf::from(lock_path),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        })
    }

    /// `$VJBUS_REGISTRY`, else `$TMPDIR/vjbus/registry.json`.
    pub fn default_path() -> PathBuf {
        match std::env::var_os(ENV_REGISTRY) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => std::env::temp_dir().join("vjbus").join("registry.json"),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Run a registry operation on the blocking pool.
    pub async fn run_blocking<R, F>(&self, op: F) -> Result<R, RegistryError>
    where
        R: Send + 'static,
        F: FnOnce(&Registry) -> Result<R, RegistryError> + Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| RegistryError::Task(e.to_string()))?
    }

    /// Insert or replace the record for `record.name`.
    pub fn register(&self, record: ServiceRecord) -> Result<(), RegistryError> {
        tracing::debug!(
            worker = %record.name,
            pid = ?record.pid,
            generation = record.generation,
            status = %record.status,
            "Registering service"
        );
        self.mutate(|doc| {
            doc.services.insert(record.name.clone(), record);
        })
    }

    /// Remove the record for `name`. Returns whether one existed.
    pub fn unregister(&self, name: &str) -> Result<bool, RegistryError> {
        let removed = self.mutate(|doc| doc.services.remove(name).is_some())?;
        if removed {
            tracing::debug!(worker = %name, "Unregistered service");
        }
        Ok(removed)
    }

    pub fn update_heartbeat(&self, name: &str, instance: InstanceId) -> Result<Heartbeat, RegistryError> {
        self.update_heartbeat_at(name, instance, Utc::now())
    }

    /// Stamp `heartbeat_at` and mark the record running, but only while the
    /// record still belongs to `instance`.
    pub fn update_heartbeat_at(
        &self,
        name: &str,
        instance: InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Heartbeat, RegistryError> {
        self.mutate(|doc| match doc.services.get_mut(name) {
            None => Heartbeat::Missing,
            Some(record) if record.instance_id != Some(instance) => Heartbeat::Superseded {
                owner: record.instance_id,
            },
            Some(record) => {
                record.heartbeat_at = now;
                record.status = ServiceStatus::Running;
                Heartbeat::Stamped
            }
        })
    }

    pub fn set_status(&self, name: &str, status: ServiceStatus) -> Result<bool, RegistryError> {
        self.update(name, |record| record.status = status)
    }

    /// Like [`Registry::set_status`], but a record owned by another instance
    /// is left alone.
    pub fn set_instance_status(
        &self,
        name: &str,
        instance: InstanceId,
        status: ServiceStatus,
    ) -> Result<bool, RegistryError> {
        self.mutate(|doc| match doc.services.get_mut(name) {
            Some(record) if record.instance_id == Some(instance) => {
                record.status = status;
                true
            }
            _ => false,
        })
    }

    /// Apply `f` to the record for `name` under the lock.
    pub fn update<F>(&self, name: &str, f: F) -> Result<bool, RegistryError>
    where
        F: FnOnce(&mut ServiceRecord),
    {
        self.mutate(|doc| match doc.services.get_mut(name) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        })
    }

    pub fn get_services(&self, include_stale: bool) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.get_services_at(include_stale, Utc::now())
    }

    /// Every record, or only those with a fresh heartbeat.
    pub fn get_services_at(
        &self,
        include_stale: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<ServiceRecord>, RegistryError> {
        let doc = self.read_document()?;
        Ok(doc
            .services
            .into_values()
            .filter(|r| include_stale || r.is_healthy_at(now, self.heartbeat_timeout))
            .collect())
    }

    pub fn get_service(&self, name: &str) -> Result<Option<ServiceRecord>, RegistryError> {
        Ok(self.read_document()?.services.remove(name))
    }

    pub fn is_worker_healthy(&self, name: &str) -> Result<bool, RegistryError> {
        self.is_worker_healthy_at(name, Utc::now())
    }

    pub fn is_worker_healthy_at(&self, name: &str, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        Ok(self
            .get_service(name)?
            .is_some_and(|r| r.is_healthy_at(now, self.heartbeat_timeout)))
    }

    pub fn cleanup_stale_services(&self) -> Result<Vec<String>, RegistryError> {
        self.cleanup_stale_services_at(Utc::now())
    }

    /// Flip live-looking records whose heartbeat timed out to `crashed`.
    /// Records are kept. Returns the names that were flipped.
    pub fn cleanup_stale_services_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, RegistryError> {
        let timeout = self.heartbeat_timeout;
        let flipped = self.mutate(|doc| {
            let mut flipped = Vec::new();
            for record in doc.services.values_mut() {
                let live = matches!(record.status, ServiceStatus::Running | ServiceStatus::Starting);
                if live && !record.is_healthy_at(now, timeout) {
                    record.status = ServiceStatus::Crashed;
                    flipped.push(record.name.clone());
                }
            }
            flipped
        })?;
        for name in &flipped {
            tracing::warn!(worker = %name, "Heartbeat timed out, marked crashed");
        }
        Ok(flipped)
    }

    /// Current document. Missing file reads as empty; unreadable JSON is
    /// logged and read as empty until the next write replaces it.
    pub fn read_document(&self) -> Result<RegistryDocument, RegistryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RegistryDocument::default()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Registry file is corrupt, treating as empty"
                );
                Ok(RegistryDocument::default())
            }
        }
    }

    /// Run `f` against the document under the exclusive lock and write the
    /// result back atomically.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut RegistryDocument) -> R) -> Result<R, RegistryError> {
        self.mutate(f)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut RegistryDocument) -> R) -> Result<R, RegistryError> {
        let _lock = self.lock()?;
        let mut doc = self.read_document()?;
        let result = f(&mut doc);
        doc.version = REGISTRY_VERSION;
        doc.updated_at = Some(Utc::now());
        self.write_document(&doc)?;
        Ok(result)
    }

    fn write_document(&self, doc: &RegistryDocument) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn open_lock_file(&self) -> Result<File, RegistryError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| RegistryError::Io {
                path: self.lock_path.clone(),
                source,
            })
    }

    #[cfg(unix)]
    fn lock(&self) -> Result<nix::fcntl::Flock<File>, RegistryError> {
        use nix::fcntl::{Flock, FlockArg};

        let file = self.open_lock_file()?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, errno)| RegistryError::Lock {
            path: self.lock_path.clone(),
            source: io::Error::from(errno),
        })
    }

    // No advisory locking off unix; the rename still keeps readers safe.
    #[cfg(not(unix))]
    fn lock(&self) -> Result<File, RegistryError> {
        self.open_lock_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn temp_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.json")).unwrap();
        (dir, registry)
    }

    fn record(name: &str, now: DateTime<Utc>) -> ServiceRecord {
        ServiceRecord::new_at(name, now)
            .with_pid(4242)
            .with_status(ServiceStatus::Running)
            .with_ports(ServicePorts {
                command: Some(5550),
                telemetry: Some(5551),
            })
            .with_instance(InstanceId::new(), 1)
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let (_dir, registry) = temp_registry();
        assert!(registry.get_services(true).unwrap().is_empty());
        assert!(registry.get_service("audio").unwrap().is_none());
        assert!(!registry.is_worker_healthy("audio").unwrap());
    }

    #[test]
    fn register_then_unregister() {
        let (_dir, registry) = temp_registry();
        let now = Utc::now();
        registry.register(record("audio", now)).unwrap();

        let found = registry.get_service("audio").unwrap().unwrap();
        assert_eq!(found.pid, Some(4242));
        assert_eq!(
            found.command_addr(),
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 5550)))
        );

        assert!(registry.unregister("audio").unwrap());
        assert!(!registry.unregister("audio").unwrap());
        assert!(registry.get_service("audio").unwrap().is_none());
    }

    #[test]
    fn health_follows_elapsed_time() {
        let (_dir, registry) = temp_registry();
        let registry = registry.with_heartbeat_timeout(Duration::from_secs(15));
        let t0 = Utc::now();
        let audio = record("audio", t0);
        let id = audio.instance_id.unwrap();
        registry.register(audio).unwrap();

        assert!(registry.is_worker_healthy_at("audio", t0 + TimeDelta::seconds(14)).unwrap());
        assert!(!registry.is_worker_healthy_at("audio", t0 + TimeDelta::seconds(15)).unwrap());

        let beat = registry
            .update_heartbeat_at("audio", id, t0 + TimeDelta::seconds(20))
            .unwrap();
        assert_eq!(beat, Heartbeat::Stamped);
        assert!(registry.is_worker_healthy_at("audio", t0 + TimeDelta::seconds(30)).unwrap());
        assert!(!registry.is_worker_healthy_at("audio", t0 + TimeDelta::seconds(36)).unwrap());
    }

    #[test]
    fn stale_records_are_filtered_unless_requested() {
        let (_dir, registry) = temp_registry();
        let t0 = Utc::now();
        registry.register(record("audio", t0)).unwrap();
        registry
            .register(record("midi", t0 - TimeDelta::seconds(60)))
            .unwrap();

        let fresh: Vec<String> = registry
            .get_services_at(false, t0)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(fresh, vec!["audio".to_string()]);
        assert_eq!(registry.get_services_at(true, t0).unwrap().len(), 2);
    }

    #[test]
    fn cleanup_marks_crashed_without_deleting() {
        let (_dir, registry) = temp_registry();
        let t0 = Utc::now();
        let audio = record("audio", t0);
        let id = audio.instance_id.unwrap();
        registry.register(audio).unwrap();
        registry
            .register(record("lyrics", t0).with_status(ServiceStatus::Stopped))
            .unwrap();

        let later = t0 + TimeDelta::seconds(16);
        let flipped = registry.cleanup_stale_services_at(later).unwrap();
        assert_eq!(flipped, vec!["audio".to_string()]);

        let audio = registry.get_service("audio").unwrap().unwrap();
        assert_eq!(audio.status, ServiceStatus::Crashed);
        assert_eq!(audio.ports.command, Some(5550));
        // Already stopped records are left alone.
        let lyrics = registry.get_service("lyrics").unwrap().unwrap();
        assert_eq!(lyrics.status, ServiceStatus::Stopped);

        // A later heartbeat revives it.
        registry.update_heartbeat_at("audio", id, later).unwrap();
        let audio = registry.get_service("audio").unwrap().unwrap();
        assert_eq!(audio.status, ServiceStatus::Running);
    }

    #[test]
    fn heartbeat_for_unknown_worker_is_noop() {
        let (_dir, registry) = temp_registry();
        assert_eq!(
            registry.update_heartbeat("ghost", InstanceId::new()).unwrap(),
            Heartbeat::Missing
        );
        assert!(!registry.set_status("ghost", ServiceStatus::Stopped).unwrap());
    }

    #[test]
    fn heartbeat_from_replaced_instance_leaves_record_alone() {
        let (_dir, registry) = temp_registry();
        let registry = registry.with_heartbeat_timeout(Duration::from_secs(15));
        let t0 = Utc::now();
        let old = record("audio", t0);
        let old_id = old.instance_id.unwrap();
        registry.register(old).unwrap();

        // A second instance takes the slot, then goes silent.
        let new = record("audio", t0).with_instance(InstanceId::new(), 2);
        let new_id = new.instance_id.unwrap();
        registry.register(new).unwrap();

        let later = t0 + TimeDelta::seconds(20);
        assert_eq!(
            registry.update_heartbeat_at("audio", old_id, later).unwrap(),
            Heartbeat::Superseded {
                owner: Some(new_id)
            }
        );
        let found = registry.get_service("audio").unwrap().unwrap();
        assert_eq!(found.instance_id, Some(new_id));
        assert_eq!(found.heartbeat_at, t0);
        assert!(!registry.is_worker_healthy_at("audio", later).unwrap());

        assert_eq!(registry.cleanup_stale_services_at(later).unwrap(), vec!["audio".to_string()]);
        assert_eq!(
            registry.update_heartbeat_at("audio", old_id, later).unwrap(),
            Heartbeat::Superseded {
                owner: Some(new_id)
            }
        );
        assert_eq!(
            registry.get_service("audio").unwrap().unwrap().status,
            ServiceStatus::Crashed
        );

        assert!(!registry
            .set_instance_status("audio", old_id, ServiceStatus::Stopped)
            .unwrap());
        assert!(registry
            .set_instance_status("audio", new_id, ServiceStatus::Stopped)
            .unwrap());
    }

    #[test]
    fn corrupt_file_reads_empty_and_heals() {
        let (_dir, registry) = temp_registry();
        fs::write(registry.path(), b"{\"version\": 1, \"services\": {").unwrap();
        assert!(registry.get_services(true).unwrap().is_empty());

        registry.register(record("audio", Utc::now())).unwrap();
        let raw = fs::read(registry.path()).unwrap();
        let doc: RegistryDocument = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc.version, REGISTRY_VERSION);
        assert!(doc.services.contains_key("audio"));
    }

    #[test]
    fn metadata_is_persisted() {
        let (_dir, registry) = temp_registry();
        registry
            .register(record("audio", Utc::now()).with_metadata("device", json!("hw:1")))
            .unwrap();
        let found = registry.get_service("audio").unwrap().unwrap();
        assert_eq!(found.metadata.get("device"), Some(&json!("hw:1")));
    }

    #[test]
    fn concurrent_writers_never_tear_the_file() {
        let (_dir, registry) = temp_registry();
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut reads = 0usize;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    if let Ok(raw) = fs::read(registry.path()) {
                        serde_json::from_slice::<RegistryDocument>(&raw)
                            .expect("reader observed a torn registry file");
                        reads += 1;
                    }
                }
                reads
            })
        };

        let writers: Vec<_> = (0..6)
            .map(|w| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let name = format!("worker-{w}");
                    for _ in 0..20 {
                        let rec = record(&name, Utc::now());
                        let id = rec.instance_id.unwrap();
                        registry.register(rec).unwrap();
                        registry.update_heartbeat(&name, id).unwrap();
                        registry.unregister(&name).unwrap();
                        registry.register(record(&name, Utc::now())).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        reader.join().unwrap();

        // Every writer's last register survived: no lost updates.
        let names: Vec<String> = registry
            .get_services(true)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names.len(), 6);
    }

    #[tokio::test]
    async fn run_blocking_from_async() {
        let (_dir, registry) = temp_registry();
        registry
            .run_blocking(|r| r.register(record("audio", Utc::now())))
            .await
            .unwrap();
        let healthy = registry
            .run_blocking(|r| r.is_worker_healthy("audio"))
            .await
            .unwrap();
        assert!(healthy);
    }

    #[test]
    fn document_shape() {
        let t0: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        let id = InstanceId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let mut doc = RegistryDocument {
            updated_at: Some(t0),
            ..RegistryDocument::default()
        };
        doc.services.insert(
            "audio".into(),
            ServiceRecord::new_at("audio", t0)
                .with_pid(4242)
                .with_status(ServiceStatus::Running)
                .with_ports(ServicePorts {
                    command: Some(5550),
                    telemetry: Some(5551),
                })
                .with_instance(id, 2),
        );
        insta::assert_json_snapshot!(doc);
    }
}
