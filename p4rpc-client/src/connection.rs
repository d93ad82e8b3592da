//! Connection engine.
//!
//! The server runs one command at a time per connection and calls back into
//! the client while it does. A [`Connection`] therefore queues submitted
//! commands and drives them with two tasks:
//!
//! - the dispatch loop sends the next queued command whenever none is in
//!   flight
//! - the read loop handles every frame from the server, answering flushes,
//!   running client functions against the current command's handler and
//!   completing the command on `release`
//!
//! Every frame is written whole while holding the write half's lock, so
//! frames from the two tasks never interleave.

use crate::command::{Command, RequestContext};
use crate::env::IdentityProvider;
use crate::error::ClientError;
use crate::handler::{CallbackContext, ClientFunction, Handler, CLIENT_PREFIX};
use p4rpc_protocol::{
    write_message, FrameReader, Message, ProtocolError, ServerAddress, API_LEVEL, CLIENT_LEVEL,
    DEFAULT_MAX_BODY_SIZE, FUNC,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub address: ServerAddress,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Program name sent as `prog`.
    pub program: String,
    /// Program version sent as `version`.
    pub version: String,
    /// Largest frame body accepted from the server.
    pub max_body_size: u32,
}

impl ConnectionConfig {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            program: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Builds a configuration for the identity's server address.
    pub fn from_identity(identity: &dyn IdentityProvider) -> Result<Self, ClientError> {
        let address = ServerAddress::parse(&identity.server_address())?;
        Ok(Self::new(address))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>, version: impl Into<String>) -> Self {
        self.program = program.into();
        self.version = version.into();
        self
    }

    pub fn with_max_body_size(mut self, size: u32) -> Self {
        self.max_body_size = size;
        self
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    /// Connected with no command in flight.
    Idle,
    /// Connected with a command in flight.
    Executing,
    /// Closed by either side.
    Closed,
    /// Failed on a framing or transport error.
    Faulted,
}

impl ConnectionState {
    /// Returns whether the connection can no longer run commands.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Idle => "idle",
            ConnectionState::Executing => "executing",
            ConnectionState::Closed => "closed",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

type Completion = oneshot::Sender<Result<(), ClientError>>;

struct Queued {
    command: Command,
    done: Completion,
}

/// The command in flight.
struct Active {
    verb: String,
    /// Taken out while a client function runs.
    handler: Option<Handler>,
    error: Option<ClientError>,
    done: Completion,
}

impl Active {
    fn new(queued: Queued) -> Self {
        Self {
            verb: queued.command.verb,
            handler: Some(queued.command.handler),
            error: None,
            done: queued.done,
        }
    }

    /// Records a failure. The first one is what the command reports.
    fn record(&mut self, error: ClientError) {
        if self.error.is_none() {
            tracing::debug!("Command {} failed: {}", self.verb, error);
            self.error = Some(error);
        } else {
            tracing::warn!("Command {} already failed, dropping: {}", self.verb, error);
        }
    }

    fn complete(self) {
        let result = match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        let _ = self.done.send(result);
    }

    fn fail(self, error: ClientError) {
        if let Some(earlier) = self.error {
            tracing::warn!("Command {} failed earlier with: {}", self.verb, earlier);
        }
        let _ = self.done.send(Err(error));
    }
}

/// Orphaned errors kept for the next command; later ones are only logged.
const MAX_ORPHANED_ERRORS: usize = 16;

struct EngineState {
    phase: ConnectionState,
    queue: VecDeque<Queued>,
    current: Option<Active>,
    /// Errors raised with no command in flight, reported by the next one.
    orphans: Vec<ClientError>,
    peer_addr: Option<SocketAddr>,
}

struct Shared {
    config: ConnectionConfig,
    identity: Arc<dyn IdentityProvider>,
    request: RequestContext,
    state: Mutex<EngineState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    wake: Notify,
}

enum Dispatch {
    Send(Message),
    Wait,
    Stop,
}

/// A connection to a server.
pub struct Connection {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        let request = RequestContext {
            client: identity.client(),
            host: identity.host(),
            user: identity.user(),
            cwd: identity.cwd(),
            program: config.program.clone(),
            version: config.version.clone(),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                identity,
                request,
                state: Mutex::new(EngineState {
                    phase: ConnectionState::Disconnected,
                    queue: VecDeque::new(),
                    current: None,
                    orphans: Vec::new(),
                    peer_addr: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                wake: Notify::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Creates a connection and connects it.
    pub async fn open(
        config: ConnectionConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, ClientError> {
        let conn = Self::new(config, identity);
        conn.connect().await?;
        Ok(conn)
    }

    /// Connects to the server and sends the protocol handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                ConnectionState::Disconnected => state.phase = ConnectionState::Connecting,
                ConnectionState::Closed | ConnectionState::Faulted => {
                    return Err(ClientError::ConnectionClosed)
                }
                // Another connect is still in progress
                ConnectionState::Connecting | ConnectionState::Handshaking => {
                    return Err(ClientError::NotConnected)
                }
                ConnectionState::Idle | ConnectionState::Executing => return Ok(()),
            }
        }

        if let Err(e) = self.establish().await {
            tracing::debug!("Connection failed: {}", e);
            self.shared.shutdown(ConnectionState::Faulted, None);
            return Err(e);
        }
        Ok(())
    }

    async fn establish(&self) -> Result<(), ClientError> {
        let config = &self.shared.config;
        tracing::debug!("Connecting to {}...", config.address);
        if config.address.encrypted {
            tracing::warn!(
                "{} requests an encrypted transport, connecting without encryption",
                config.address
            );
        }

        let stream = tokio::time::timeout(config.connect_timeout, open_socket(&config.address))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })??;
        let (stream, rcvbuf, sndbuf) = socket_buffer_sizes(stream)?;

        stream.set_nodelay(true).ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);
        {
            let mut state = self.shared.state.lock();
            state.peer_addr = peer_addr;
            state.phase = ConnectionState::Handshaking;
        }

        let handshake = Message::function("protocol")
            .with_symbol("host", self.shared.request.host.clone())
            .with_symbol("port", config.address.port.clone())
            .with_symbol("rcvbuf", rcvbuf.to_string())
            .with_symbol("sndbuf", sndbuf.to_string())
            .with_symbol("api", API_LEVEL)
            .with_symbol("enableStreams", "")
            .with_symbol("enableGraph", "")
            .with_symbol("expandAndmaps", "")
            .with_symbol("cmpfile", "")
            .with_symbol("client", CLIENT_LEVEL);
        self.shared.send(&handshake).await?;

        {
            let mut state = self.shared.state.lock();
            if state.phase != ConnectionState::Handshaking {
                return Err(ClientError::ConnectionClosed);
            }
            state.phase = ConnectionState::Idle;
        }

        let reader = FrameReader::new(read_half).with_max_body_size(config.max_body_size);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(read_loop(self.shared.clone(), reader)));
        tasks.push(tokio::spawn(dispatch_loop(self.shared.clone())));

        tracing::info!(
            "Connected to {} ({})",
            config.address,
            crate::crypto::daddr(peer_addr)
        );
        Ok(())
    }

    /// Queues a command. The returned future resolves when the server
    /// releases it, or with an error if the connection ends first.
    pub fn run(&self, command: Command) -> PendingCommand {
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                ConnectionState::Closed | ConnectionState::Faulted => {
                    let _ = done.send(Err(ClientError::ConnectionClosed));
                }
                ConnectionState::Disconnected => {
                    let _ = done.send(Err(ClientError::NotConnected));
                }
                _ => {
                    tracing::debug!("Queued command {}", command.verb);
                    state.queue.push_back(Queued { command, done });
                }
            }
        }
        self.shared.wake.notify_one();
        PendingCommand { rx }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().phase
    }

    /// Returns whether the connection can accept commands.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Idle | ConnectionState::Executing
        )
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().peer_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Returns the number of commands queued or in flight.
    pub fn pending_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + usize::from(state.current.is_some())
    }

    /// Returns the number of errors waiting for the next command.
    pub fn orphaned_errors(&self) -> usize {
        self.shared.state.lock().orphans.len()
    }

    /// Closes the connection, failing every queued and in-flight command.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.shared.shutdown(ConnectionState::Closed, None);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }

        tracing::debug!("Connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl Shared {
    /// Writes one frame.
    async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::ConnectionClosed)?;
        let n = write_message(writer, message).await?;
        tracing::debug!("> {} ({} bytes)", message, n);
        Ok(())
    }

    /// Promotes the next queued command if none is in flight.
    fn start_next(&self) -> Dispatch {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase.is_terminal() {
            return Dispatch::Stop;
        }
        if state.current.is_some() {
            return Dispatch::Wait;
        }
        let Some(queued) = state.queue.pop_front() else {
            return Dispatch::Wait;
        };

        let request = self.request.request(&queued.command);
        let mut active = Active::new(queued);
        for error in state.orphans.drain(..) {
            active.record(error);
        }
        tracing::debug!("Starting command {}", active.verb);
        state.current = Some(active);
        state.phase = ConnectionState::Executing;
        Dispatch::Send(request)
    }

    async fn handle_frame(&self, mut message: Message) -> Result<(), ClientError> {
        let func = match message.func() {
            Some(func) => String::from_utf8_lossy(func).into_owned(),
            None => return Err(ProtocolError::MissingFunction.into()),
        };

        match func.as_str() {
            "protocol" => Ok(()),
            "release" | "release2" => self.complete_current(),
            "flush1" => {
                message.set(FUNC, "flush2");
                self.send(&message).await
            }
            _ => match func.strip_prefix(CLIENT_PREFIX) {
                Some(name) => {
                    self.call_client_function(ClientFunction::from_name(name), &message)
                        .await
                }
                None => Err(ProtocolError::UnhandledFunction(func.clone()).into()),
            },
        }
    }

    fn complete_current(&self) -> Result<(), ClientError> {
        let active = {
            let mut state = self.state.lock();
            let active = state
                .current
                .take()
                .ok_or(ProtocolError::UnsolicitedRelease)?;
            if state.phase == ConnectionState::Executing {
                state.phase = ConnectionState::Idle;
            }
            active
        };
        tracing::debug!("Command {} released", active.verb);
        active.complete();
        self.wake.notify_one();
        Ok(())
    }

    async fn call_client_function(
        &self,
        function: ClientFunction,
        message: &Message,
    ) -> Result<(), ClientError> {
        let (mut handler, peer_addr) = {
            let mut state = self.state.lock();
            let peer_addr = state.peer_addr;
            match state.current.as_mut().and_then(|active| active.handler.take()) {
                Some(handler) => (handler, peer_addr),
                None => return Err(ProtocolError::NoActiveCommand(function.to_string()).into()),
            }
        };

        let mut ctx = CallbackContext::new(peer_addr, self.identity.as_ref());
        let result = handler.call(&function, &mut ctx, message);

        if let Some(active) = self.state.lock().current.as_mut() {
            active.handler = Some(handler);
        }

        for reply in ctx.into_replies() {
            self.send(&reply).await?;
        }
        result
    }

    /// Attaches a non-fatal error to the current command, or keeps it for
    /// the next one.
    fn record_error(&self, error: ClientError) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.current.as_mut() {
            Some(active) => active.record(error),
            None if state.orphans.len() >= MAX_ORPHANED_ERRORS => {
                tracing::warn!("Dropping error with no command in flight: {}", error);
            }
            None => {
                tracing::warn!("Error with no command in flight: {}", error);
                state.orphans.push(error);
            }
        }
    }

    /// Moves to a terminal state and fails all outstanding commands. The
    /// command in flight gets `error` (or `ConnectionClosed`), queued ones
    /// get `ConnectionClosed`.
    fn shutdown(&self, phase: ConnectionState, error: Option<ClientError>) {
        let (current, queued) = {
            let mut state = self.state.lock();
            if !state.phase.is_terminal() || phase == ConnectionState::Closed {
                state.phase = phase;
            }
            (state.current.take(), std::mem::take(&mut state.queue))
        };

        match current {
            Some(active) => active.fail(error.unwrap_or(ClientError::ConnectionClosed)),
            None => {
                if let Some(e) = error {
                    tracing::warn!("Connection failed with no command in flight: {}", e);
                }
            }
        }
        for queued in queued {
            let _ = queued.done.send(Err(ClientError::ConnectionClosed));
        }
        self.wake.notify_one();
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        match shared.start_next() {
            Dispatch::Send(request) => {
                if let Err(e) = shared.send(&request).await {
                    tracing::error!("Failed to send request: {}", e);
                    shared.shutdown(ConnectionState::Faulted, Some(e));
                    return;
                }
            }
            Dispatch::Wait => shared.wake.notified().await,
            Dispatch::Stop => return,
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader<OwnedReadHalf>) {
    loop {
        let message = match reader.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::info!("Server closed the connection");
                shared.shutdown(ConnectionState::Closed, None);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to read frame: {}", e);
                shared.shutdown(ConnectionState::Faulted, Some(e.into()));
                return;
            }
        };
        tracing::debug!("< {}", message);

        if let Err(e) = shared.handle_frame(message).await {
            if e.is_fatal() {
                tracing::error!("Connection failed: {}", e);
                shared.shutdown(ConnectionState::Faulted, Some(e));
                return;
            }
            shared.record_error(e);
        }
    }
}

/// Resolves the address and connects to the first reachable candidate.
async fn open_socket(address: &ServerAddress) -> Result<TcpStream, ClientError> {
    let port: u16 = address.port.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid port {:?}", address.port),
        )
    })?;

    let mut last_error = None;
    for addr in tokio::net::lookup_host((address.host.as_str(), port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    let error = last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", address.host),
        )
    });
    Err(error.into())
}

/// Reads the receive and send buffer sizes of a connected stream.
fn socket_buffer_sizes(stream: TcpStream) -> io::Result<(TcpStream, u32, u32)> {
    let std_stream = stream.into_std()?;
    let (rcvbuf, sndbuf) = {
        let socket = TcpSocket::from_std_stream(std_stream.try_clone()?);
        (socket.recv_buffer_size()?, socket.send_buffer_size()?)
    };
    Ok((TcpStream::from_std(std_stream)?, rcvbuf, sndbuf))
}

/// Completion of a queued command.
#[must_use = "commands are reported through the returned future"]
pub struct PendingCommand {
    rx: oneshot::Receiver<Result<(), ClientError>>,
}

impl Future for PendingCommand {
    type Output = Result<(), ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(ClientError::ConnectionClosed)))
    }
}
