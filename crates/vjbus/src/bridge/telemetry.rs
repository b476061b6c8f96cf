//! Fire-and-forget telemetry fan-out.
//!
//! The publisher encodes each envelope once into a `[worker, envelope]` frame
//! and hands it to a broadcast channel; one writer task per subscriber drains
//! its own receiver. A subscriber that falls behind loses the oldest frames,
//! the publisher is never slowed down.
//!
//! The last `state_sync` and the last `worker_*` lifecycle event are latched
//! and replayed to every subscriber when it connects, so a console that
//! attaches after `start()` still sees how the worker came up.
//!
//! The subscriber connects lazily and keeps retrying in the background until
//! the publisher shows up, so callers never see a connection error.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

use super::codec::{JsonCodec, frame_codec};
use super::osc::OscMirror;
use super::topic::TopicPattern;
use crate::envelope::{Envelope, ProtocolError};

/// Frames buffered per subscriber before the oldest are dropped.
const SUBSCRIBER_BUFFER: usize = 1024;

/// Event messages with this prefix describe the worker's lifecycle.
pub const LIFECYCLE_PREFIX: &str = "worker_";

const RETRY_MIN: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_millis(500);

/// Telemetry wire frame: serialized as the two-element array
/// `[worker_name, envelope]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame(pub String, pub Envelope);

impl TelemetryFrame {
    /// Reject frames whose topic does not name the envelope's sender.
    pub fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        let TelemetryFrame(worker, envelope) = self;
        if worker != envelope.worker() {
            return Err(ProtocolError::FrameMismatch {
                frame: worker,
                worker: envelope.worker().to_string(),
            });
        }
        Ok(envelope)
    }
}

/// Frame kinds a late subscriber is brought up to date with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Latch {
    Lifecycle,
    State,
}

impl Latch {
    fn of(envelope: &Envelope) -> Option<Self> {
        if envelope.as_state_sync().is_some() {
            return Some(Self::State);
        }
        envelope
            .as_event()
            .filter(|event| event.message.starts_with(LIFECYCLE_PREFIX))
            .map(|_| Self::Lifecycle)
    }
}

pub struct TelemetryPublisher {
    worker: String,
    local_addr: SocketAddr,
    frames: broadcast::Sender<Bytes>,
    /// Held while a latched frame is sent and while a subscriber attaches,
    /// so each subscriber gets a latched frame exactly once.
    latched: Mutex<BTreeMap<Latch, Bytes>>,
    osc: Option<OscMirror>,
}

impl TelemetryPublisher {
    /// Bind the publish endpoint on loopback and start accepting subscribers.
    ///
    /// The returned handle completes once `cancel` fires.
    pub async fn bind(
        worker: impl Into<String>,
        port: u16,
        osc: Option<OscMirror>,
        cancel: CancellationToken,
    ) -> io::Result<(Arc<Self>, JoinHandle<()>)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let local_addr = listener.local_addr()?;
        let (frames, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let publisher = Arc::new(Self {
            worker: worker.into(),
            local_addr,
            frames,
            latched: Mutex::new(BTreeMap::new()),
            osc,
        });
        tracing::debug!(worker = %publisher.worker, %local_addr, "Telemetry publisher bound");

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&publisher), cancel));
        Ok((publisher, accept))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Broadcast `envelope` to every connected subscriber. Never blocks.
    pub fn publish(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        if envelope.worker() != self.worker {
            return Err(ProtocolError::FrameMismatch {
                frame: self.worker.clone(),
                worker: envelope.worker().to_string(),
            });
        }

        if let Some(osc) = &self.osc
            && envelope.as_telemetry().is_some()
        {
            osc.mirror(envelope, &envelope.encode()?);
        }

        let body = serde_json::to_vec(&(&self.worker, envelope))?;
        let mut framed = BytesMut::with_capacity(body.len() + 4);
        frame_codec()
            .encode(Bytes::from(body), &mut framed)
            .map_err(|e| ProtocolError::Malformed(serde_json::Error::io(e)))?;

        let framed = framed.freeze();
        match Latch::of(envelope) {
            Some(slot) => {
                let mut latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
                latched.insert(slot, framed.clone());
                let _ = self.frames.send(framed);
            }
            // No receivers is not an error: telemetry is best effort.
            None => {
                let _ = self.frames.send(framed);
            }
        }
        Ok(())
    }

    /// Receiver for live frames plus the latched frames it would have missed.
    fn attach(&self) -> (Vec<Bytes>, broadcast::Receiver<Bytes>) {
        let latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
        (latched.values().cloned().collect(), self.frames.subscribe())
    }
}

async fn accept_loop(listener: TcpListener, publisher: Arc<TelemetryPublisher>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(worker = %publisher.worker, %peer, "Telemetry subscriber connected");
                    let _ = stream.set_nodelay(true);
                    let (replay, frames) = publisher.attach();
                    tokio::spawn(feed_subscriber(stream, peer, replay, frames, cancel.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Telemetry accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!(worker = %publisher.worker, "Telemetry publisher stopped");
}

async fn feed_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    replay: Vec<Bytes>,
    mut frames: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    for bytes in replay {
        if let Err(e) = stream.write_all(&bytes).await {
            tracing::debug!(%peer, error = %e, "Telemetry subscriber went away");
            return;
        }
    }
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(bytes) => {
                if let Err(e) = stream.write_all(&bytes).await {
                    tracing::debug!(%peer, error = %e, "Telemetry subscriber went away");
                    break;
                }
            }
            Err(RecvError::Lagged(dropped)) => {
                tracing::warn!(%peer, dropped, "Telemetry subscriber lagging, frames dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Callback invoked for every matching envelope, on the receive task.
pub type TelemetryHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
struct Routes {
    handlers: RwLock<Vec<(TopicPattern, TelemetryHandler)>>,
    /// Highest generation seen per worker.
    generations: DashMap<String, u64>,
}

impl Routes {
    fn deliver(&self, envelope: &Envelope) {
        {
            let mut latest = self
                .generations
                .entry(envelope.worker().to_string())
                .or_insert(envelope.generation());
            if envelope.is_stale_for(*latest) {
                tracing::trace!(
                    worker = envelope.worker(),
                    generation = envelope.generation(),
                    latest = *latest,
                    "Dropping telemetry from replaced instance"
                );
                return;
            }
            *latest = envelope.generation();
        }

        let topic = envelope.topic();
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for (pattern, handler) in handlers.iter() {
            if !pattern.matches(&topic) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                tracing::error!(%topic, %pattern, "Telemetry handler panicked");
            }
        }
    }
}

pub struct TelemetrySubscriber {
    addr: SocketAddr,
    routes: Arc<Routes>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetrySubscriber {
    /// Subscriber for the publisher at `addr`. Nothing connects until the
    /// first subscription.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            routes: Arc::new(Routes::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register `handler` for topics matching `topic`. Must be called from
    /// within a tokio runtime.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_shared(TopicPattern::parse(topic), Arc::new(handler));
    }

    pub fn subscribe_shared(&self, pattern: TopicPattern, handler: TelemetryHandler) {
        tracing::debug!(addr = %self.addr, %pattern, "Subscribing to telemetry");
        self.routes
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pattern, handler));

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(tokio::spawn(receive_loop(
                self.addr,
                Arc::clone(&self.routes),
                self.cancel.clone(),
            )));
        }
    }

    /// Highest generation delivered (or skipped) for `worker` so far.
    pub fn latest_generation(&self, worker: &str) -> Option<u64> {
        self.routes.generations.get(worker).map(|g| *g)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TelemetrySubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(addr: SocketAddr, routes: Arc<Routes>, cancel: CancellationToken) {
    let mut retry = RETRY_MIN;
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = TcpStream::connect(addr) => connected,
        };
        match connected {
            Ok(stream) => {
                tracing::debug!(%addr, "Telemetry subscriber connected");
                retry = RETRY_MIN;
                let mut frames = FramedRead::new(stream, JsonCodec::<TelemetryFrame>::new());
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = frames.next() => frame,
                    };
                    match frame {
                        Some(Ok(Ok(frame))) => match frame.into_envelope() {
                            Ok(envelope) => routes.deliver(&envelope),
                            Err(e) => tracing::warn!(%addr, error = %e, "Dropping telemetry frame"),
                        },
                        Some(Ok(Err(e))) => {
                            tracing::warn!(%addr, error = %e, "Dropping malformed telemetry frame");
                        }
                        Some(Err(e)) => {
                            tracing::debug!(%addr, error = %e, "Telemetry connection error");
                            break;
                        }
                        None => {
                            tracing::debug!(%addr, "Telemetry publisher closed connection");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::trace!(%addr, error = %e, "Telemetry publisher not reachable yet");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry) => {}
        }
        retry = (retry * 2).min(RETRY_MAX);
    }
}
