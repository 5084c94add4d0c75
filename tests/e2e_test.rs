use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use rift_cli::client::{Client, ClientOptions};
use rift_cli::registry::Registry;
use rift_cli::server::Server;
use rift_cli::shared::{
    Binding, ClientMessage, Delimited, HelloRequest, ServerMessage, SessionLimits, ShutdownHandle,
};
use rstest::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

lazy_static! {
    /// Guard to make sure that tests are run serially, not concurrently.
    static ref SERIAL_GUARD: Mutex<()> = Mutex::new(());
}

const SERVER_ADDR: &str = "127.0.0.1:7835";

struct TestServer {
    registry: Arc<Registry>,
    shutdown: ShutdownHandle,
    handle: JoinHandle<Result<()>>,
}

/// Spawn the server, giving some time for the control port TcpListener to start.
async fn spawn_server(password: Option<&str>, port_passwords: &[&str]) -> Result<TestServer> {
    let port_passwords: Vec<String> = port_passwords.iter().map(|s| s.to_string()).collect();
    launch(Server::new(SERVER_ADDR, password, &port_passwords)?).await
}

async fn launch(server: Server) -> Result<TestServer> {
    let registry = server.registry();
    let shutdown = server.shutdown_handle();
    let handle = tokio::spawn(server.listen());
    time::sleep(Duration::from_millis(50)).await;
    Ok(TestServer {
        registry,
        shutdown,
        handle,
    })
}

fn options(
    password: Option<&str>,
    port: u16,
    target: &str,
    limits: SessionLimits,
) -> ClientOptions {
    ClientOptions {
        server: SERVER_ADDR.into(),
        password: password.map(String::from),
        server_port: port,
        server_domain: None,
        client_server: target.into(),
        limits,
    }
}

/// Connect a client and start it in the background, returning its public address.
async fn start_client(options: ClientOptions) -> Result<(SocketAddr, ShutdownHandle)> {
    let client = Client::new(options).await?;
    let remote_addr = ([127, 0, 0, 1], client.remote_port()).into();
    let shutdown = client.shutdown_handle();
    tokio::spawn(client.listen());
    Ok((remote_addr, shutdown))
}

/// Spawns a client with randomly assigned ports, returning the listener and remote address.
async fn spawn_client(password: Option<&str>) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let target = listener.local_addr()?.to_string();
    let (remote_addr, _) =
        start_client(options(password, 0, &target, SessionLimits::default())).await?;
    Ok((listener, remote_addr))
}

/// Spawn a TCP echo service, returning its address.
async fn spawn_echo() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(addr)
}

async fn echo(stream: &mut TcpStream, msg: &[u8]) -> Result<()> {
    stream.write_all(msg).await?;
    let mut buf = vec![0u8; msg.len()];
    time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
    assert_eq!(buf, msg);
    Ok(())
}

async fn assert_closed(stream: &mut TcpStream, within: Duration) {
    let mut buf = [0u8; 64];
    match time::timeout(within, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => (),
        Ok(Ok(n)) => panic!("unexpected {n} bytes on a closed connection"),
        Err(_) => panic!("connection still open after {within:?}"),
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        time::sleep(Duration::from_millis(20)).await;
    }
}

/// Open a control connection by hand, returning it with the granted port.
async fn raw_control(limits: SessionLimits) -> Result<(Delimited<TcpStream>, u16)> {
    let mut conn = Delimited::new(TcpStream::connect(SERVER_ADDR).await?);
    conn.send(ClientMessage::Hello(HelloRequest {
        binding: Binding::Port(0),
        limits,
    }))
    .await?;
    match conn.recv_timeout().await? {
        Some(ServerMessage::Hello(port)) => Ok((conn, port)),
        other => Err(anyhow!("unexpected reply {other:?}")),
    }
}

/// Next server message that is not a heartbeat, answering heartbeats on the way.
async fn next_event(conn: &mut Delimited<TcpStream>) -> Result<ServerMessage> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match time::timeout_at(deadline, conn.recv()).await?? {
            Some(ServerMessage::Heartbeat) => conn.send(ClientMessage::Pong).await?,
            Some(msg) => return Ok(msg),
            None => return Err(anyhow!("control connection closed")),
        }
    }
}

/// Returns an address with nothing listening on it.
async fn unreachable_addr() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.to_string())
}

#[rstest]
#[tokio::test]
async fn basic_proxy(#[values(None, Some(""), Some("abc"))] secret: Option<&str>) -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    spawn_server(secret, &[]).await?;
    let (listener, addr) = spawn_client(secret).await?;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await?;
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hello world");

        stream.write_all(b"I can send a message too!").await?;
        anyhow::Ok(())
    });

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"hello world").await?;

    let mut buf = [0u8; 25];
    stream.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"I can send a message too!");

    // Ensure that the client end of the stream is closed now.
    assert_eq!(stream.read(&mut buf).await?, 0);

    // Also ensure that additional connections do not produce any data.
    let mut stream = TcpStream::connect(addr).await?;
    assert_eq!(stream.read(&mut buf).await?, 0);

    Ok(())
}

#[rstest]
#[case(None, Some("my secret"))]
#[case(Some("my secret"), None)]
#[case(Some("my secret"), Some("not my secret"))]
#[tokio::test]
async fn mismatched_secret(
    #[case] server_secret: Option<&str>,
    #[case] client_secret: Option<&str>,
) {
    let _guard = SERIAL_GUARD.lock().await;

    spawn_server(server_secret, &[]).await.unwrap();
    assert!(spawn_client(client_secret).await.is_err());
}

#[tokio::test]
async fn port_password_allow_list() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(Some("ignored"), &["18080 secret"]).await?;
    let target = spawn_echo().await?;
    let limits = SessionLimits::default();

    let (addr, first) = start_client(options(Some("secret"), 18080, &target, limits)).await?;
    assert_eq!(addr.port(), 18080);

    // The port is taken while the first client is connected.
    assert!(start_client(options(Some("secret"), 18080, &target, limits))
        .await
        .is_err());
    // Not in the allow-list, even with a valid password.
    assert!(start_client(options(Some("secret"), 19090, &target, limits))
        .await
        .is_err());
    // The server-wide password is ignored when an allow-list exists.
    assert!(start_client(options(Some("ignored"), 18080, &target, limits))
        .await
        .is_err());
    assert!(start_client(options(Some("wrong"), 18080, &target, limits))
        .await
        .is_err());

    let mut stream = TcpStream::connect(addr).await?;
    echo(&mut stream, b"still served by the first client").await?;
    drop(stream);

    first.shutdown();
    wait_until(|| server.registry.control_count() == 0).await;
    let (addr, _) = start_client(options(Some("secret"), 18080, &target, limits)).await?;
    assert_eq!(addr.port(), 18080);
    Ok(())
}

#[tokio::test]
async fn unreachable_target_closes_public_connection() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(None, &[]).await?;
    let target = unreachable_addr().await?;
    let (addr, _) = start_client(options(None, 0, &target, SessionLimits::default())).await?;

    let mut stream = TcpStream::connect(addr).await?;
    assert_closed(&mut stream, Duration::from_secs(2)).await;
    assert_eq!(server.registry.session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn idle_relay_is_closed() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    spawn_server(None, &[]).await?;
    let target = spawn_echo().await?;
    let limits = SessionLimits {
        tcp_timeout: Duration::from_millis(500),
        ..SessionLimits::default()
    };
    let (addr, _) = start_client(options(None, 0, &target, limits)).await?;

    let mut stream = TcpStream::connect(addr).await?;
    for i in 0..8 {
        if i > 0 {
            time::sleep(Duration::from_millis(150)).await;
        }
        echo(&mut stream, b"keepalive").await?;
    }

    let stopped = Instant::now();
    assert_closed(&mut stream, Duration::from_secs(2)).await;
    assert!(stopped.elapsed() >= Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn deadline_closes_busy_relay() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    spawn_server(None, &[]).await?;
    let target = spawn_echo().await?;
    let limits = SessionLimits {
        tcp_timeout: Duration::ZERO,
        tcp_deadline: Duration::from_millis(800),
        ..SessionLimits::default()
    };
    let (addr, _) = start_client(options(None, 0, &target, limits)).await?;

    let start = Instant::now();
    let mut stream = TcpStream::connect(addr).await?;
    while echo(&mut stream, b"busy").await.is_ok() {
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "deadline did not close the session"
        );
        time::sleep(Duration::from_millis(50)).await;
    }
    assert!(start.elapsed() >= Duration::from_millis(700));
    Ok(())
}

#[tokio::test]
async fn closing_control_closes_only_its_sessions() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(None, &[]).await?;
    let target = spawn_echo().await?;
    let limits = SessionLimits::default();
    let (first_addr, first) = start_client(options(None, 0, &target, limits)).await?;
    let (second_addr, _second) = start_client(options(None, 0, &target, limits)).await?;

    let mut first_stream = TcpStream::connect(first_addr).await?;
    let mut second_stream = TcpStream::connect(second_addr).await?;
    echo(&mut first_stream, b"first").await?;
    echo(&mut second_stream, b"second").await?;
    assert_eq!(server.registry.session_count(), 2);

    first.shutdown();
    assert_closed(&mut first_stream, Duration::from_secs(2)).await;

    echo(&mut second_stream, b"unaffected").await?;
    wait_until(|| server.registry.control_count() == 1).await;
    assert_eq!(server.registry.session_count(), 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_in_flight_sessions() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(None, &[]).await?;
    let target = spawn_echo().await?;
    let limits = SessionLimits {
        tcp_timeout: Duration::from_secs(1),
        ..SessionLimits::default()
    };
    let (addr, _) = start_client(options(None, 0, &target, limits)).await?;

    let mut stream = TcpStream::connect(addr).await?;
    echo(&mut stream, b"before").await?;

    server.shutdown.shutdown();
    time::sleep(Duration::from_millis(300)).await;
    assert!(!server.handle.is_finished(), "stopped before draining");
    echo(&mut stream, b"during").await?;
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "accepted a new session while draining"
    );

    drop(stream);
    time::timeout(Duration::from_secs(3), server.handle).await???;
    Ok(())
}

#[tokio::test]
async fn domain_binding_is_rejected() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    spawn_server(None, &[]).await?;
    let mut options = options(None, 0, "127.0.0.1:80", SessionLimits::default());
    options.server_domain = Some("myapp".into());
    let err = Client::new(options).await.err().unwrap();
    assert!(err.to_string().contains("does not route domains"));
    Ok(())
}

#[tokio::test]
async fn port_and_domain_are_exclusive() {
    let mut options = options(None, 8080, "127.0.0.1:80", SessionLimits::default());
    options.server_domain = Some("myapp".into());
    assert!(options.binding().is_err());
}

#[tokio::test]
async fn udp_round_trip_and_eviction() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(None, &[]).await?;
    let echo_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let target = echo_socket.local_addr()?.to_string();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo_socket.recv_from(&mut buf).await {
            let _ = echo_socket.send_to(&buf[..n], from).await;
        }
    });
    let limits = SessionLimits {
        udp_deadline: Duration::from_millis(300),
        ..SessionLimits::default()
    };
    let (addr, _) = start_client(options(None, 0, &target, limits)).await?;

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let other_peer = UdpSocket::bind("127.0.0.1:0").await?;
    let mut buf = [0u8; 64];
    let exchanges = [
        (&peer, &b"ping"[..]),
        (&other_peer, &b"pong"[..]),
        (&peer, &b"again"[..]),
    ];
    for (socket, msg) in exchanges {
        socket.send_to(msg, addr).await?;
        let (n, from) = time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await??;
        assert_eq!(&buf[..n], msg);
        assert_eq!(from, addr);
    }
    assert_eq!(server.registry.session_count(), 2);

    time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(server.registry.session_count(), 0);

    peer.send_to(b"after eviction", addr).await?;
    let (n, _) = time::timeout(Duration::from_secs(3), peer.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..n], b"after eviction");
    Ok(())
}

#[tokio::test]
async fn invalid_address() -> Result<()> {
    // We don't need the serial guard for this test because it doesn't create a server.
    async fn check_address(to: &str, use_secret: bool) -> Result<()> {
        let options = ClientOptions {
            server: to.into(),
            password: use_secret.then(|| "a secret".into()),
            client_server: "localhost:5000".into(),
            ..ClientOptions::default()
        };
        match Client::new(options).await {
            Ok(_) => Err(anyhow!("expected error for {to}, use_secret={use_secret}")),
            Err(_) => Ok(()),
        }
    }
    tokio::try_join!(
        check_address("nonexistent.domain.for.demonstration:7835", false),
        check_address("nonexistent.domain.for.demonstration:7835", true),
        check_address("malformed !$uri$%", false),
        check_address("malformed !$uri$%", true),
    )?;
    Ok(())
}

#[tokio::test]
async fn very_long_frame() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    spawn_server(None, &[]).await?;
    let mut attacker = TcpStream::connect(SERVER_ADDR).await?;

    // Slowly send a very long frame.
    for _ in 0..10 {
        let result = attacker.write_all(&[42u8; 100000]).await;
        if result.is_err() {
            return Ok(());
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("did not exit after a 1 MB frame");
}

#[tokio::test]
async fn silent_control_connection_is_dropped() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(None, &[]).await?;
    let limits = SessionLimits {
        tcp_timeout: Duration::from_millis(500),
        ..SessionLimits::default()
    };
    let (_silent, _) = raw_control(limits).await?;
    let start = Instant::now();
    assert_eq!(server.registry.control_count(), 1);

    wait_until(|| server.registry.control_count() == 0).await;
    assert!(start.elapsed() >= Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn answered_heartbeats_keep_control_alive() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let server = spawn_server(None, &[]).await?;
    let limits = SessionLimits {
        tcp_timeout: Duration::from_millis(500),
        ..SessionLimits::default()
    };
    let (mut conn, _) = raw_control(limits).await?;

    let end = Instant::now() + Duration::from_millis(1500);
    let mut heartbeats = 0;
    while let Ok(msg) = time::timeout_at(end, conn.recv::<ServerMessage>()).await {
        match msg? {
            Some(ServerMessage::Heartbeat) => {
                heartbeats += 1;
                conn.send(ClientMessage::Pong).await?;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(heartbeats >= 3, "only {heartbeats} heartbeats");
    assert_eq!(server.registry.control_count(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_connect_back_closes_public_connection() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;

    let mut server = Server::new(SERVER_ADDR, None, &[])?;
    server.set_connect_back_timeout(Duration::from_millis(300));
    let server = launch(server).await?;
    let (mut conn, port) = raw_control(SessionLimits::default()).await?;

    let mut public = TcpStream::connect(("127.0.0.1", port)).await?;
    let id = match next_event(&mut conn).await? {
        ServerMessage::Connection(id) => id,
        other => panic!("expected a connection, got {other:?}"),
    };
    assert_eq!(server.registry.session_count(), 1);

    match next_event(&mut conn).await? {
        ServerMessage::Close(closed) => assert_eq!(closed, id),
        other => panic!("expected a close, got {other:?}"),
    }
    assert_closed(&mut public, Duration::from_secs(1)).await;
    assert_eq!(server.registry.session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn client_gives_up_on_silent_server() -> Result<()> {
    // We don't need the serial guard for this test because it doesn't use the control port.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut conn = Delimited::new(stream);
        conn.recv_timeout::<ClientMessage>().await?;
        conn.send(ServerMessage::Hello(4000)).await?;
        time::sleep(Duration::from_secs(10)).await;
        anyhow::Ok(())
    });

    let client = Client::new(ClientOptions {
        server,
        client_server: "127.0.0.1:80".into(),
        limits: SessionLimits {
            tcp_timeout: Duration::from_millis(300),
            ..SessionLimits::default()
        },
        ..ClientOptions::default()
    })
    .await?;
    let start = Instant::now();
    let err = time::timeout(Duration::from_secs(2), client.listen())
        .await?
        .unwrap_err();
    assert!(err.to_string().contains("heartbeats"));
    assert!(start.elapsed() >= Duration::from_millis(250));
    Ok(())
}
