//! Command request/reply transport.
//!
//! Server side: every accepted connection reads one request at a time and
//! forwards it into a single dispatch loop, so a worker never has two command
//! handlers in flight. Handler errors and panics turn into error acks; the loop
//! itself keeps running.
//!
//! Client side: one connection, one outstanding request. A timeout or any
//! transport error drops the connection; the next request reconnects.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use crate::envelope::{AckPayload, CommandPayload, Envelope, EnvelopeBuilder, MessageType, ProtocolError};

/// Requests queued for the dispatch loop before connections stop reading.
const REQUEST_QUEUE: usize = 32;

/// A decoded command as seen by a handler.
#[derive(Debug, Clone)]
pub struct Command {
    envelope: Envelope,
    payload: CommandPayload,
}

impl Command {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let payload = envelope
            .as_command()
            .cloned()
            .ok_or(ProtocolError::UnexpectedType {
                expected: MessageType::Command,
                actual: envelope.kind(),
            })?;
        Ok(Self { envelope, payload })
    }

    pub fn verb(&self) -> &str {
        &self.payload.verb
    }

    pub fn config_version(&self) -> Option<u64> {
        self.payload.config_version
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.payload.data
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Typed view of the command data, validated once at the handler boundary.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CommandError> {
        serde_json::from_value(Value::Object(self.payload.data.clone()))
            .map_err(|e| CommandError::InvalidData(format!("{}: {}", self.payload.verb, e)))
    }
}

/// Successful handler outcome, turned into an `ok` ack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandReply {
    pub data: Option<Value>,
    pub message: Option<String>,
    pub applied_config_version: Option<u64>,
}

impl CommandReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_applied_config_version(mut self, version: u64) -> Self {
        self.applied_config_version = Some(version);
        self
    }

    fn into_ack(self) -> AckPayload {
        let mut ack = AckPayload::ok(self.data).with_applied_config_version(self.applied_config_version);
        ack.message = self.message;
        ack
    }
}

/// Handler failures, reported to the caller as `error` acks.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
    #[error("invalid command data: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handler for one command verb.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> Result<CommandReply, CommandError>;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandReply, CommandError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandReply, CommandError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<CommandReply, CommandError> {
        (self.0)(command).await
    }
}

/// Verb → handler table, shared between a node and its command server.
#[derive(Clone, Default)]
pub struct Handlers {
    inner: Arc<DashMap<String, Arc<dyn CommandHandler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `verb`.
    pub fn insert(&self, verb: impl Into<String>, handler: impl CommandHandler) {
        self.inner.insert(verb.into(), Arc::new(handler));
    }

    /// Register `handler` only if `verb` has no handler yet.
    pub fn insert_default(&self, verb: impl Into<String>, handler: impl CommandHandler) {
        self.inner
            .entry(verb.into())
            .or_insert_with(|| Arc::new(handler));
    }

    pub fn get(&self, verb: &str) -> Option<Arc<dyn CommandHandler>> {
        self.inner.get(verb).map(|h| Arc::clone(h.value()))
    }

    pub fn verbs(&self) -> Vec<String> {
        let mut verbs: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        verbs.sort();
        verbs
    }
}

/// Turns command envelopes into ack envelopes.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Handlers,
    builder: Arc<EnvelopeBuilder>,
}

impl Dispatcher {
    pub fn new(handlers: Handlers, builder: Arc<EnvelopeBuilder>) -> Self {
        Self { handlers, builder }
    }

    /// Handle one command envelope. Never fails: every outcome is an ack.
    pub async fn dispatch(&self, envelope: Envelope) -> Envelope {
        let command = match Command::from_envelope(envelope.clone()) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "Non-command message on command endpoint");
                return self.builder.ack_for(&envelope, AckPayload::error(e.to_string()));
            }
        };
        let verb = command.verb().to_string();
        let correlation_id = command.envelope().correlation_id().unwrap_or_default().to_string();

        let Some(handler) = self.handlers.get(&verb) else {
            tracing::debug!(%verb, "Unknown verb");
            return self.builder.ack_for(
                &envelope,
                AckPayload::error(CommandError::UnknownVerb(verb).to_string()),
            );
        };

        tracing::debug!(%verb, %correlation_id, "Dispatching command");
        // Run on its own task so a panicking handler surfaces as a JoinError.
        let outcome = tokio::spawn(async move { handler.handle(command).await }).await;
        let ack = match outcome {
            Ok(Ok(reply)) => reply.into_ack(),
            Ok(Err(e)) => {
                tracing::debug!(%verb, error = %e, "Command handler returned error");
                AckPayload::error(e.to_string())
            }
            Err(join_error) => {
                tracing::error!(%verb, error = %join_error, "Command handler panicked");
                AckPayload::error(format!("handler for {verb} panicked"))
            }
        };
        self.builder.ack_for(&envelope, ack)
    }

    async fn run(self, mut requests: mpsc::Receiver<PendingRequest>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    let Some(PendingRequest { envelope, reply }) = request else {
                        break;
                    };
                    let ack = self.dispatch(envelope).await;
                    if reply.send(ack).is_err() {
                        tracing::debug!("Requester went away before ack was ready");
                    }
                }
            }
        }
        tracing::debug!("Command dispatch loop exiting");
    }
}

struct PendingRequest {
    envelope: Envelope,
    reply: oneshot::Sender<Envelope>,
}

/// Reply endpoint of one worker.
pub struct CommandServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl CommandServer {
    /// Bind on loopback; port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "Command server bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections and answer commands until `cancel` fires.
    pub async fn serve(self, dispatcher: Dispatcher, cancel: CancellationToken) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let dispatch = tokio::spawn(dispatcher.run(request_rx, cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::trace!(%peer, "Command connection accepted");
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(serve_connection(stream, peer, request_tx.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Command accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        drop(request_tx);
        let _ = dispatch.await;
        tracing::debug!(addr = %self.local_addr, "Command server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    requests: mpsc::Sender<PendingRequest>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, JsonCodec::<Envelope>::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let envelope = match frame {
            Some(Ok(Ok(envelope))) => envelope,
            Some(Ok(Err(e))) => {
                tracing::warn!(%peer, error = %e, "Dropping malformed command frame");
                continue;
            }
            Some(Err(e)) => {
                tracing::debug!(%peer, error = %e, "Command connection error");
                break;
            }
            None => break,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if requests
            .send(PendingRequest {
                envelope,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            break;
        }
        let ack = tokio::select! {
            _ = cancel.cancelled() => break,
            ack = reply_rx => match ack {
                Ok(ack) => ack,
                Err(_) => break,
            },
        };
        if let Err(e) = framed.send(ack).await {
            tracing::debug!(%peer, error = %e, "Failed to write ack");
            break;
        }
    }
    tracing::trace!(%peer, "Command connection closed");
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {addr} failed: {source}")]
    Connection { addr: SocketAddr, source: io::Error },
    #[error("no response from {addr} within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("connection to {addr} closed before a response arrived")]
    Closed { addr: SocketAddr },
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

type ClientConnection = Framed<TcpStream, JsonCodec<Envelope>>;

/// Request side of the command transport.
pub struct CommandClient {
    addr: SocketAddr,
    builder: Arc<EnvelopeBuilder>,
    conn: Option<ClientConnection>,
}

impl CommandClient {
    /// Create a client for `addr`. Nothing connects until the first request.
    pub fn new(addr: SocketAddr, builder: Arc<EnvelopeBuilder>) -> Self {
        Self {
            addr,
            builder,
            conn: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Drop the current connection; the next request reconnects.
    pub fn reset(&mut self) {
        if self.conn.take().is_some() {
            tracing::debug!(addr = %self.addr, "Discarded command connection");
        }
    }

    /// Build and send a command for `verb`.
    pub async fn request(
        &mut self,
        verb: &str,
        data: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let command = self.builder.command(verb, data, None);
        self.send(command, timeout).await
    }

    /// Send `command` and wait up to `timeout` for its ack.
    ///
    /// On timeout or any other error the connection is discarded, never
    /// reused: a late ack for this request must not be read as the answer to
    /// the next one.
    pub async fn send(
        &mut self,
        command: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let addr = self.addr;
        let result = match tokio::time::timeout(timeout, self.exchange(&command)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { addr, timeout }),
        };
        if let Err(ref e) = result {
            tracing::debug!(%addr, error = %e, "Command failed, dropping connection");
            self.reset();
        }
        result
    }

    async fn exchange(&mut self, command: &Envelope) -> Result<Envelope, TransportError> {
        let addr = self.addr;
        if self.conn.is_none() {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| TransportError::Connection { addr, source })?;
            let _ = stream.set_nodelay(true);
            tracing::trace!(%addr, "Command connection established");
            self.conn = Some(Framed::new(stream, JsonCodec::new()));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::Closed { addr });
        };

        conn.send(command.clone()).await?;
        let ack = match conn.next().await {
            Some(Ok(Ok(ack))) => ack,
            Some(Ok(Err(e))) => return Err(e.into()),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Closed { addr }),
        };

        if ack.kind() != MessageType::Ack {
            return Err(ProtocolError::UnexpectedType {
                expected: MessageType::Ack,
                actual: ack.kind(),
            }
            .into());
        }
        if ack.correlation_id() != command.correlation_id() {
            return Err(ProtocolError::CorrelationMismatch {
                expected: command.correlation_id().unwrap_or_default().to_string(),
                actual: ack.correlation_id().unwrap_or_default().to_string(),
            }
            .into());
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Instant;

    fn echo_handlers() -> Handlers {
        let handlers = Handlers::new();
        handlers.insert(
            "echo",
            handler_fn(|cmd: Command| async move {
                Ok(CommandReply::data(Value::Object(cmd.data().clone())))
            }),
        );
        handlers.insert(
            "fail",
            handler_fn(|_cmd: Command| async move { Err(CommandError::failed("boom")) }),
        );
        handlers.insert(
            "panic",
            handler_fn(|_cmd: Command| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok(CommandReply::ok())
            }),
        );
        handlers.insert(
            "sleep",
            handler_fn(|cmd: Command| async move {
                let ms = cmd.data().get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(CommandReply::data(json!({"slept_ms": ms})))
            }),
        );
        handlers
    }

    async fn start_server(handlers: Handlers) -> (SocketAddr, CancellationToken) {
        let server = CommandServer::bind(0).await.unwrap();
        let addr = server.local_addr();
        let cancel = CancellationToken::new();
        let builder = Arc::new(EnvelopeBuilder::new("test-worker", 1));
        tokio::spawn(server.serve(Dispatcher::new(handlers, builder), cancel.clone()));
        (addr, cancel)
    }

    fn client(addr: SocketAddr) -> CommandClient {
        CommandClient::new(addr, Arc::new(EnvelopeBuilder::new("console", 0)))
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn ack_matches_command_correlation() {
        let (addr, cancel) = start_server(echo_handlers()).await;
        let mut client = client(addr);

        let builder = EnvelopeBuilder::new("console", 0);
        let cmd = builder.command("echo", data(json!({"x": 1})), Some(4));
        let ack = client.send(cmd.clone(), Duration::from_secs(2)).await.unwrap();

        assert_eq!(ack.correlation_id(), cmd.correlation_id());
        assert_eq!(ack.worker(), "test-worker");
        let payload = ack.as_ack().unwrap();
        assert!(payload.is_ok());
        assert_eq!(payload.data, Some(json!({"x": 1})));
        cancel.cancel();
    }

    #[tokio::test]
    async fn back_to_back_commands_get_their_own_acks() {
        let (addr, cancel) = start_server(echo_handlers()).await;
        let mut client = client(addr);

        let first = client
            .request("echo", data(json!({"n": 1})), Duration::from_secs(2))
            .await
            .unwrap();
        let second = client
            .request("echo", data(json!({"n": 2})), Duration::from_secs(2))
            .await
            .unwrap();

        assert_ne!(first.correlation_id(), second.correlation_id());
        assert_eq!(first.as_ack().unwrap().data, Some(json!({"n": 1})));
        assert_eq!(second.as_ack().unwrap().data, Some(json!({"n": 2})));
        cancel.cancel();
    }

    #[tokio::test]
    async fn concurrent_clients_are_answered_one_at_a_time() {
        let (addr, cancel) = start_server(echo_handlers()).await;

        let mut tasks = Vec::new();
        for n in 0..4 {
            tasks.push(tokio::spawn(async move {
                let mut c = client(addr);
                let ack = c
                    .request("echo", data(json!({ "n": n })), Duration::from_secs(2))
                    .await
                    .unwrap();
                (n, ack)
            }));
        }
        for task in tasks {
            let (n, ack) = task.await.unwrap();
            assert_eq!(ack.as_ack().unwrap().data, Some(json!({ "n": n })));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_verb_yields_error_ack() {
        let (addr, cancel) = start_server(echo_handlers()).await;
        let mut client = client(addr);

        let ack = client
            .request("launch_rockets", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        let payload = ack.as_ack().unwrap();
        assert!(!payload.is_ok());
        assert_eq!(payload.message.as_deref(), Some("unknown verb: launch_rockets"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_error_acks() {
        let (addr, cancel) = start_server(echo_handlers()).await;
        let mut client = client(addr);

        let failed = client
            .request("fail", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(failed.as_ack().unwrap().message.as_deref(), Some("boom"));

        let panicked = client
            .request("panic", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!panicked.as_ack().unwrap().is_ok());

        // The loop survived both.
        let ok = client
            .request("echo", Map::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(ok.as_ack().unwrap().is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn timeout_is_not_early_and_discards_connection() {
        let (addr, cancel) = start_server(echo_handlers()).await;
        let mut client = client(addr);

        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let err = client
            .request("sleep", data(json!({"ms": 600})), timeout)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
        assert!(!client.is_connected());

        // The late ack for the slow request must not be read as this answer.
        let ack = client
            .request("echo", data(json!({"fresh": true})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ack.as_ack().unwrap().data, Some(json!({"fresh": true})));
        cancel.cancel();
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut client = client(addr);
        let timeout = Duration::from_millis(150);
        let started = Instant::now();
        let err = client.request("ping", Map::new(), timeout).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= timeout);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = client(addr);
        let err = client
            .request("ping", Map::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
    }

    #[test]
    fn typed_data_accessor() {
        #[derive(Deserialize)]
        struct Target {
            worker: String,
        }
        let builder = EnvelopeBuilder::new("console", 0);
        let cmd = Command::from_envelope(builder.command(
            "stop_worker",
            data(json!({"worker": "audio"})),
            None,
        ))
        .unwrap();
        assert_eq!(cmd.data_as::<Target>().unwrap().worker, "audio");

        let bad = Command::from_envelope(builder.command("stop_worker", Map::new(), None)).unwrap();
        assert!(matches!(
            bad.data_as::<Target>(),
            Err(CommandError::InvalidData(_))
        ));
    }

    #[test]
    fn non_command_envelope_is_rejected() {
        let builder = EnvelopeBuilder::new("audio", 1);
        let event = builder.event(crate::envelope::EventLevel::Info, "x", Map::new());
        assert!(Command::from_envelope(event).is_err());
    }
}
