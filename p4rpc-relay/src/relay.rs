//! Logging relay.
//!
//! Each accepted client gets its own upstream connection. Frames are
//! decoded, logged with a direction marker (`>` client to server, `<`
//! server to client) and re-encoded unchanged. The relay has no protocol
//! awareness beyond framing.

use crate::config::{Config, ConfigError};
use crate::error::RelayError;
use p4rpc_protocol::{write_message, FrameReader, ServerAddress};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Runtime relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to accept clients on.
    pub bind_addr: SocketAddr,
    /// Server every client is relayed to.
    pub upstream: ServerAddress,
    /// Maximum concurrent relayed connections.
    pub max_connections: usize,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Largest frame body relayed.
    pub max_body_size: u32,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr, upstream: ServerAddress) -> Self {
        let defaults = Config::default();
        Self {
            bind_addr,
            upstream,
            max_connections: defaults.network.max_connections,
            connect_timeout: defaults.upstream.connect_timeout(),
            max_body_size: defaults.upstream.max_body_size,
        }
    }

    /// Builds runtime settings from a validated file configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            bind_addr: config.network.bind_addr,
            upstream: config.upstream.server_address()?,
            max_connections: config.network.max_connections,
            connect_timeout: config.upstream.connect_timeout(),
            max_body_size: config.upstream.max_body_size,
        })
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Relay statistics.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    ToServer,
    /// Server to client.
    ToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToServer => f.write_str(">"),
            Direction::ToClient => f.write_str("<"),
        }
    }
}

/// Logging relay between clients and one server.
pub struct Relay {
    config: RelayConfig,
    stats: Arc<RelayStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            stats: Arc::new(RelayStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves clients from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Relay listening on {}, forwarding to {}",
            listener.local_addr()?,
            self.config.upstream
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((client, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);
                                let result = tokio::select! {
                                    result = Self::relay_connection(client, addr, &config, &stats) => result,
                                    _ = conn_shutdown.recv() => Err(RelayError::ShuttingDown(addr)),
                                };

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!(
                                    "Client disconnected: {} ({} frames relayed in total)",
                                    addr,
                                    stats.frames_forwarded.load(Ordering::Relaxed)
                                );
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Relay shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn relay_connection(
        client: TcpStream,
        addr: SocketAddr,
        config: &RelayConfig,
        stats: &RelayStats,
    ) -> Result<(), RelayError> {
        let upstream = connect_upstream(config).await?;
        client.set_nodelay(true).ok();
        upstream.set_nodelay(true).ok();
        tracing::debug!("[{}] Upstream connected: {}", addr, config.upstream);

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let (outbound, inbound) = tokio::join!(
            forward(
                Direction::ToServer,
                addr,
                client_read,
                upstream_write,
                config.max_body_size,
                stats
            ),
            forward(
                Direction::ToClient,
                addr,
                upstream_read,
                client_write,
                config.max_body_size,
                stats
            ),
        );

        let sent = outbound?;
        let received = inbound?;
        tracing::debug!("[{}] Relayed {} frames out, {} back", addr, sent, received);
        Ok(())
    }

    /// Initiates relay shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the relay is accepting clients.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

async fn connect_upstream(config: &RelayConfig) -> Result<TcpStream, RelayError> {
    let target = config.upstream.host_port();
    let port: u16 = config
        .upstream
        .port
        .parse()
        .map_err(|_| RelayError::UnresolvedUpstream(target.clone()))?;

    tokio::time::timeout(
        config.connect_timeout,
        connect_any(&config.upstream.host, port),
    )
    .await
    .map_err(|_| RelayError::UpstreamTimeout(target))?
}

/// Connects to the first reachable address the host resolves to.
async fn connect_any(host: &str, port: u16) -> Result<TcpStream, RelayError> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) => Err(RelayError::Io(e)),
        None => Err(RelayError::UnresolvedUpstream(format!("{}:{}", host, port))),
    }
}

/// Copies frames from `reader` to `writer`, logging each one. Shuts the
/// writer down when the reader ends, so a close propagates to the other
/// side. Returns the number of frames forwarded.
pub async fn forward<R, W>(
    direction: Direction,
    peer: SocketAddr,
    reader: R,
    mut writer: W,
    max_body_size: u32,
    stats: &RelayStats,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader).with_max_body_size(max_body_size);
    let mut frames = 0;

    let result = loop {
        match reader.read_message().await {
            Ok(Some(message)) => {
                tracing::info!("[{}] {} {}", peer, direction, message);
                if let Err(e) = write_message(&mut writer, &message).await {
                    break Err(e.into());
                }
                frames += 1;
                stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => break Ok(frames),
            Err(e) => {
                tracing::warn!("[{}] {} stream failed: {}", peer, direction, e);
                break Err(e.into());
            }
        }
    };

    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use p4rpc_protocol::Message;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn sample() -> Message {
        Message::function("user-info")
            .with_arg("-s")
            .with_symbol("client", "ws")
            .with_symbol("empty", "")
    }

    #[tokio::test]
    async fn test_forward_copies_frames_verbatim() {
        let first = sample().encode().unwrap();
        let second = Message::function("release").encode().unwrap();
        let mut input = first.to_vec();
        input.extend_from_slice(&second);

        let reader = tokio_test::io::Builder::new().read(&input).build();
        let (writer, mut sink) = tokio::io::duplex(4096);
        let stats = RelayStats::default();

        let frames = forward(Direction::ToServer, peer(), reader, writer, 1024, &stats)
            .await
            .unwrap();
        assert_eq!(frames, 2);
        assert_eq!(stats.frames_forwarded.load(Ordering::Relaxed), 2);

        let mut output = Vec::new();
        sink.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_forward_stops_on_bad_frame() {
        let reader = tokio_test::io::Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00])
            .build();
        let (writer, mut sink) = tokio::io::duplex(64);
        let stats = RelayStats::default();

        let result = forward(Direction::ToClient, peer(), reader, writer, 1024, &stats).await;
        assert!(matches!(result, Err(RelayError::Wire(_))));

        let mut output = Vec::new();
        sink.read_to_end(&mut output).await.unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_direction_markers() {
        assert_eq!(Direction::ToServer.to_string(), ">");
        assert_eq!(Direction::ToClient.to_string(), "<");
    }

    #[test]
    fn test_config_from_file_config() {
        let mut config = Config::default();
        config.upstream.address = "p4.example.com:1666".to_string();
        let relay = RelayConfig::from_config(&config).unwrap();
        assert_eq!(relay.upstream.host, "p4.example.com");
        assert_eq!(relay.max_connections, config.network.max_connections);

        config.upstream.address = "ssl:p4.example.com:1666".to_string();
        assert!(RelayConfig::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_relay_end_to_end() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        let config = RelayConfig::new(
            relay_addr,
            ServerAddress::parse(&upstream_addr.to_string()).unwrap(),
        );
        let relay = Arc::new(Relay::new(config));
        let serving = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.serve(listener).await })
        };

        let client = TcpStream::connect(relay_addr).await.unwrap();
        let (server, _) = upstream.accept().await.unwrap();
        let (client_read, mut client_write) = client.into_split();
        let (server_read, mut server_write) = server.into_split();
        let mut client_frames = FrameReader::new(client_read);
        let mut server_frames = FrameReader::new(server_read);

        write_message(&mut client_write, &sample()).await.unwrap();
        assert_eq!(server_frames.read_message().await.unwrap(), Some(sample()));

        let reply = Message::function("release");
        write_message(&mut server_write, &reply).await.unwrap();
        assert_eq!(client_frames.read_message().await.unwrap(), Some(reply));

        drop(server_write);
        assert_eq!(client_frames.read_message().await.unwrap(), None);
        assert_eq!(relay.stats().frames_forwarded.load(Ordering::Relaxed), 2);
        assert_eq!(relay.stats().connections_total.load(Ordering::Relaxed), 1);

        relay.shutdown();
        serving.await.unwrap().unwrap();
        assert!(!relay.is_running());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_closes_client() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = unused.local_addr().unwrap();
        drop(unused);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let config = RelayConfig::new(
            relay_addr,
            ServerAddress::parse(&upstream_addr.to_string()).unwrap(),
        );
        let relay = Arc::new(Relay::new(config));
        let serving = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.serve(listener).await })
        };

        let client = TcpStream::connect(relay_addr).await.unwrap();
        let mut frames = FrameReader::new(client);
        assert_eq!(frames.read_message().await.unwrap(), None);

        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.stats().errors_total.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        relay.shutdown();
        serving.await.unwrap().unwrap();
    }
}
