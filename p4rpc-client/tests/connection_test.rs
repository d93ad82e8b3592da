//! Connection engine tests against a scripted server.

use p4rpc_client::crypto::response_digest;
use p4rpc_client::{
    ClientError, ClientFunction, Command, Connection, ConnectionConfig, ConnectionState, Handler,
    MemorySink, Severity, StaticIdentity,
};
use p4rpc_protocol::{write_message, FrameError, FrameReader, Message, ProtocolError, ServerAddress};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// The server end of one connection.
struct Peer {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer,
        }
    }

    async fn recv(&mut self) -> Message {
        timeout(WAIT, self.reader.read_message())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("client closed the connection")
    }

    /// Asserts that nothing arrives for a short while.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(100), self.reader.read_message()).await;
        assert!(result.is_err(), "unexpected frame: {:?}", result);
    }

    async fn send(&mut self, message: Message) {
        write_message(&mut self.writer, &message).await.unwrap();
    }

    async fn release(&mut self) {
        self.send(Message::function("release")).await;
    }
}

fn identity(addr: SocketAddr) -> Arc<StaticIdentity> {
    Arc::new(StaticIdentity {
        server_address: addr.to_string(),
        host: "box".into(),
        user: "alice".into(),
        client: "ws".into(),
        cwd: "/work".into(),
        ticket: None,
        password: Some("pw".into()),
    })
}

fn config(addr: SocketAddr) -> ConnectionConfig {
    ConnectionConfig::new(ServerAddress::parse(&addr.to_string()).unwrap())
        .with_program("p4rpc-test", "1.0")
}

/// Connects a client and accepts it, consuming the handshake.
async fn connect_with(config: ConnectionConfig, listener: &TcpListener) -> (Connection, Peer) {
    let addr = listener.local_addr().unwrap();
    let conn = Connection::open(config, identity(addr)).await.unwrap();
    let mut peer = Peer::accept(listener).await;
    let handshake = peer.recv().await;
    assert_eq!(handshake.func().unwrap(), "protocol");
    (conn, peer)
}

async fn setup() -> (Connection, Peer, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn, peer) = connect_with(config(addr), &listener).await;
    (conn, peer, listener)
}

fn keys(message: &Message) -> Vec<String> {
    message
        .symbols
        .keys()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect()
}

#[tokio::test]
async fn test_handshake_symbols() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let conn = Connection::open(config(addr), identity(addr)).await.unwrap();
    let mut peer = Peer::accept(&listener).await;

    let handshake = peer.recv().await;
    assert_eq!(
        keys(&handshake),
        vec![
            "func",
            "host",
            "port",
            "rcvbuf",
            "sndbuf",
            "api",
            "enableStreams",
            "enableGraph",
            "expandAndmaps",
            "cmpfile",
            "client"
        ]
    );
    assert_eq!(handshake.get("host").unwrap(), "box");
    assert_eq!(handshake.get("port").unwrap(), addr.port().to_string().as_str());
    assert_eq!(handshake.get("api").unwrap(), "99999");
    assert_eq!(handshake.get("client").unwrap(), "84");
    assert_eq!(handshake.get("enableStreams").unwrap(), "");
    assert!(handshake.get_str("rcvbuf").unwrap().parse::<u32>().is_ok());
    assert!(handshake.get_str("sndbuf").unwrap().parse::<u32>().is_ok());

    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(conn.peer_addr(), Some(addr));
}

#[tokio::test]
async fn test_request_and_release() {
    let (conn, mut peer, _listener) = setup().await;

    let pending = conn.run(
        Command::new("fstat")
            .with_args(["-Ol", "//depot/a"])
            .with_symbol("tag", ""),
    );
    let request = peer.recv().await;
    assert_eq!(
        keys(&request),
        vec![
            "func",
            "client",
            "host",
            "user",
            "cwd",
            "prog",
            "version",
            "os",
            "clientCase",
            "charset",
            "tag"
        ]
    );
    assert_eq!(request.func().unwrap(), "user-fstat");
    assert_eq!(request.get("client").unwrap(), "ws");
    assert_eq!(request.get("user").unwrap(), "alice");
    assert_eq!(request.get("prog").unwrap(), "p4rpc-test");
    assert_eq!(request.get("version").unwrap(), "1.0");
    assert_eq!(request.args, vec!["-Ol", "//depot/a"]);
    assert_eq!(conn.state(), ConnectionState::Executing);

    peer.release().await;
    pending.await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_commands_run_one_at_a_time() {
    let (conn, mut peer, _listener) = setup().await;

    let first = conn.run(Command::new("info"));
    let second = conn.run(Command::new("changes"));

    assert_eq!(peer.recv().await.func().unwrap(), "user-info");
    peer.expect_silence().await;
    assert_eq!(conn.pending_count(), 2);

    peer.release().await;
    first.await.unwrap();

    assert_eq!(peer.recv().await.func().unwrap(), "user-changes");
    peer.send(Message::function("release2")).await;
    second.await.unwrap();
}

#[tokio::test]
async fn test_flush_is_answered() {
    let (conn, mut peer, _listener) = setup().await;
    let pending = conn.run(Command::new("sync"));
    peer.recv().await;

    peer.send(
        Message::function("flush1")
            .with_symbol("fseq", "3")
            .with_symbol("himark", "2000"),
    )
    .await;
    let reply = peer.recv().await;
    assert_eq!(reply.func().unwrap(), "flush2");
    assert_eq!(reply.get("fseq").unwrap(), "3");
    assert_eq!(reply.get("himark").unwrap(), "2000");

    peer.release().await;
    pending.await.unwrap();
}

#[tokio::test]
async fn test_login_challenge() {
    let (conn, mut peer, listener) = setup().await;
    let pending = conn.run(Command::new("login"));
    peer.recv().await;

    peer.send(
        Message::function("client-Crypto")
            .with_symbol("token", "TOK")
            .with_symbol("confirm", "dm-Login"),
    )
    .await;
    let reply = peer.recv().await;

    let daddr = listener.local_addr().unwrap().to_string();
    assert_eq!(reply.func().unwrap(), "dm-Login");
    assert_eq!(reply.get_str("daddr").unwrap(), daddr);
    assert_eq!(
        reply.get_str("token").unwrap(),
        response_digest(b"pw", b"TOK", &daddr)
    );
    assert!(!reply.contains("token2"));

    peer.release().await;
    pending.await.unwrap();
}

#[tokio::test]
async fn test_output_reaches_sink() {
    let (conn, mut peer, _listener) = setup().await;
    let sink = Arc::new(MemorySink::new());
    let pending = conn.run(Command::new("fstat").with_handler(Handler::with_sink(sink.clone())));
    peer.recv().await;

    peer.send(
        Message::function("client-Message")
            .with_symbol("code0", (1u32 << 28).to_string())
            .with_symbol("fmt0", "Hello %name%")
            .with_symbol("name", "world"),
    )
    .await;
    peer.send(
        Message::function("client-FstatPartial")
            .with_symbol("depotFile", "//depot/a")
            .with_symbol("headRev", "1"),
    )
    .await;
    peer.send(Message::function("client-FstatInfo").with_symbol("headType", "text"))
        .await;
    peer.release().await;
    pending.await.unwrap();

    assert_eq!(
        sink.messages(),
        vec![(Severity::INFO, "Hello world".to_string())]
    );
    let records = sink.records();
    assert_eq!(records.len(), 1);
    let fields: Vec<_> = records[0].keys().cloned().collect();
    assert_eq!(fields, vec!["depotFile", "headRev", "headType"]);
}

#[tokio::test]
async fn test_custom_callback_replies() {
    let (conn, mut peer, _listener) = setup().await;
    let handler = Handler::new().with_callback(
        ClientFunction::from_name("Prompt"),
        |ctx, message| {
            let reply = Message::function("dm-Prompt")
                .with_symbol("data", message.get("data").cloned().unwrap_or_default());
            ctx.reply(reply);
            Ok(())
        },
    );
    let pending = conn.run(Command::new("passwd").with_handler(handler));
    peer.recv().await;

    peer.send(Message::function("client-Prompt").with_symbol("data", "secret"))
        .await;
    let reply = peer.recv().await;
    assert_eq!(reply.func().unwrap(), "dm-Prompt");
    assert_eq!(reply.get("data").unwrap(), "secret");

    peer.release().await;
    pending.await.unwrap();
}

#[tokio::test]
async fn test_unhandled_function_fails_command_only() {
    let (conn, mut peer, _listener) = setup().await;
    let pending = conn.run(Command::new("sync"));
    peer.recv().await;

    peer.send(Message::function("client-ReceiveFiles")).await;
    peer.send(Message::function("server-Bogus")).await;
    peer.send(Message::new().with_symbol("x", "y")).await;
    peer.release().await;

    let err = pending.await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol(ProtocolError::UnhandledClientFunction(ref name)) if name == "ReceiveFiles"
    ));
    assert_eq!(conn.state(), ConnectionState::Idle);

    let next = conn.run(Command::new("info"));
    assert_eq!(peer.recv().await.func().unwrap(), "user-info");
    peer.release().await;
    next.await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_release_reported_by_next_command() {
    let (conn, mut peer, _listener) = setup().await;

    peer.release().await;
    timeout(WAIT, async {
        while conn.orphaned_errors() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let pending = conn.run(Command::new("info"));
    peer.recv().await;
    peer.release().await;
    assert!(matches!(
        pending.await,
        Err(ClientError::Protocol(ProtocolError::UnsolicitedRelease))
    ));
    assert_eq!(conn.orphaned_errors(), 0);
}

#[tokio::test]
async fn test_server_close_fails_outstanding_commands() {
    let (conn, mut peer, _listener) = setup().await;
    let first = conn.run(Command::new("info"));
    let second = conn.run(Command::new("info"));
    peer.recv().await;

    drop(peer);

    assert!(matches!(first.await, Err(ClientError::ConnectionClosed)));
    assert!(matches!(second.await, Err(ClientError::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        conn.run(Command::new("info")).await,
        Err(ClientError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_bad_checksum_faults_connection() {
    let (conn, mut peer, _listener) = setup().await;
    let first = conn.run(Command::new("info"));
    let second = conn.run(Command::new("info"));
    peer.recv().await;

    peer.writer
        .write_all(&[0xff, 0x01, 0x00, 0x00, 0x00, 0x00])
        .await
        .unwrap();

    assert!(matches!(
        first.await,
        Err(ClientError::Frame(FrameError::ChecksumMismatch { .. }))
    ));
    assert!(matches!(second.await, Err(ClientError::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Faulted);
}

#[tokio::test]
async fn test_oversized_frame_faults_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn, mut peer) = connect_with(config(addr).with_max_body_size(64), &listener).await;
    let pending = conn.run(Command::new("info"));
    peer.recv().await;

    peer.send(Message::function("client-Message").with_symbol("fmt0", "x".repeat(256)))
        .await;

    assert!(matches!(
        pending.await,
        Err(ClientError::Frame(FrameError::TooLarge { .. }))
    ));
    assert_eq!(conn.state(), ConnectionState::Faulted);
}

#[tokio::test]
async fn test_close_fails_queued_commands() {
    let (conn, mut peer, _listener) = setup().await;
    let first = conn.run(Command::new("info"));
    let second = conn.run(Command::new("info"));
    peer.recv().await;

    conn.close().await.unwrap();

    assert!(matches!(first.await, Err(ClientError::ConnectionClosed)));
    assert!(matches!(second.await, Err(ClientError::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        conn.run(Command::new("info")).await,
        Err(ClientError::ConnectionClosed)
    ));
}
