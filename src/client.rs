//! Client implementation for the `rift` service.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::error::TunnelError;
use crate::relay::relay;
use crate::shared::{
    connect_with_timeout, Binding, ClientMessage, Delimited, HelloRequest, ServerMessage,
    SessionLimits, ShutdownHandle, NETWORK_TIMEOUT,
};
use crate::udp;

/// Settings for a client connection.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Address of the relay server, like `1.2.3.4:7835`.
    pub server: String,

    /// Optional password for authentication.
    pub password: Option<String>,

    /// Public port to bind on the server; zero lets the server choose.
    pub server_port: u16,

    /// Subdomain to bind instead of a port, on servers that route domains.
    pub server_domain: Option<String>,

    /// Address of the service to expose, like `127.0.0.1:8080`.
    pub client_server: String,

    /// Timeouts for relayed sessions.
    pub limits: SessionLimits,
}

impl ClientOptions {
    /// The binding these options request. Port and domain are mutually exclusive.
    pub fn binding(&self) -> Result<Binding> {
        match (&self.server_domain, self.server_port) {
            (Some(domain), 0) => Ok(Binding::Domain(domain.clone())),
            (Some(_), _) => bail!("server port and server domain are mutually exclusive"),
            (None, port) => Ok(Binding::Port(port)),
        }
    }
}

/// State structure for the client.
pub struct Client {
    /// Control connection to the server.
    conn: Option<Delimited<TcpStream>>,

    /// Destination address of the server.
    server: String,

    /// Forwarding target that relayed sessions are dialed to.
    target: String,

    /// Port that is publicly available on the remote.
    remote_port: u16,

    /// Timeouts applied to relayed sessions.
    limits: SessionLimits,

    /// Optional password used to authenticate with the server.
    auth: Option<Authenticator>,

    /// In-flight sessions, so the server can close them individually.
    sessions: DashMap<Uuid, CancellationToken>,

    /// Cancelled when shutdown is requested.
    shutdown: CancellationToken,
}

impl Client {
    /// Create a new client, connecting and authenticating with the server.
    pub async fn new(options: ClientOptions) -> Result<Self> {
        let binding = options.binding()?;
        let mut stream = Delimited::new(connect_with_timeout(&options.server).await?);
        let auth = options.password.as_deref().map(Authenticator::new);

        stream
            .send(ClientMessage::Hello(HelloRequest {
                binding,
                limits: options.limits,
            }))
            .await?;
        if let Some(auth) = &auth {
            auth.client_handshake(&mut stream).await?;
        }
        let remote_port = match stream.recv_timeout().await? {
            Some(ServerMessage::Hello(remote_port)) => remote_port,
            Some(ServerMessage::Error(message)) => bail!("server error: {message}"),
            Some(ServerMessage::Challenge(_)) => {
                bail!("server requires authentication, but no client password was provided");
            }
            Some(_) => bail!("unexpected initial non-hello message"),
            None => bail!("unexpected EOF"),
        };
        info!(remote_port, "connected to server");
        info!("listening at {}:{remote_port}", server_host(&options.server));

        Ok(Client {
            conn: Some(stream),
            server: options.server,
            target: options.client_server,
            remote_port,
            limits: options.limits,
            auth,
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the port publicly available on the remote.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Returns a handle that stops the client once triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.shutdown.clone())
    }

    /// Start the client, listening for new connections.
    pub async fn listen(mut self) -> Result<()> {
        let mut conn = self.conn.take().context("client is already listening")?;
        let this = Arc::new(self);
        let (closes_tx, mut closes_rx) = mpsc::channel(64);
        let grace = this.limits.liveness_grace();
        let mut last_seen = Instant::now();

        loop {
            let msg = tokio::select! {
                msg = conn.recv::<ServerMessage>() => {
                    last_seen = Instant::now();
                    msg?
                }
                Some(id) = closes_rx.recv() => {
                    conn.send(ClientMessage::Close(id)).await?;
                    continue;
                }
                _ = sleep_until(last_seen + grace) => bail!("server stopped sending heartbeats"),
                _ = this.shutdown.cancelled() => {
                    info!("shutting down");
                    for session in this.sessions.iter() {
                        session.value().cancel();
                    }
                    return Ok(());
                }
            };
            match msg {
                Some(ServerMessage::Hello(_)) => warn!("unexpected hello"),
                Some(ServerMessage::Challenge(_)) => warn!("unexpected challenge"),
                Some(ServerMessage::Heartbeat) => conn.send(ClientMessage::Pong).await?,
                Some(ServerMessage::Connection(id)) => {
                    let this = Arc::clone(&this);
                    let closes = closes_tx.clone();
                    tokio::spawn(
                        async move {
                            info!("new connection");
                            match this.handle_connection(id, closes).await {
                                Ok(_) => info!("connection exited"),
                                Err(err) => warn!(%err, "connection exited with error"),
                            }
                        }
                        .instrument(info_span!("proxy", %id)),
                    );
                }
                Some(ServerMessage::Datagram(id)) => {
                    let this = Arc::clone(&this);
                    let closes = closes_tx.clone();
                    tokio::spawn(
                        async move {
                            info!("new udp session");
                            match this.handle_datagrams(id, closes).await {
                                Ok(_) => info!("udp session exited"),
                                Err(err) => warn!(%err, "udp session exited with error"),
                            }
                        }
                        .instrument(info_span!("udp", %id)),
                    );
                }
                Some(ServerMessage::Close(id)) => {
                    if let Some((_, session)) = this.sessions.remove(&id) {
                        session.cancel();
                    }
                    info!(%id, "session closed by server");
                }
                Some(ServerMessage::Error(err)) => error!(%err, "server error"),
                None => return Ok(()),
            }
        }
    }

    async fn handle_connection(&self, id: Uuid, closes: mpsc::Sender<Uuid>) -> Result<()> {
        let (mut local_conn, remote_conn) = match self.pair_tcp(id).await {
            Ok(pair) => pair,
            Err(err) => {
                closes.send(id).await.ok();
                return Err(err);
            }
        };
        let parts = remote_conn.into_parts();
        debug_assert!(parts.write_buf.is_empty(), "framed write buffer not empty");
        local_conn.write_all(&parts.read_buf).await?; // mostly of the cases, this will be empty

        let cancel = self.track(id);
        let result = relay(local_conn, parts.io, &self.limits, cancel).await;
        self.sessions.remove(&id);
        let reason = result?;
        info!(?reason, "relay finished");
        Ok(())
    }

    /// Dial the forwarding target, then connect back to the server for session `id`.
    async fn pair_tcp(&self, id: Uuid) -> Result<(TcpStream, Delimited<TcpStream>)> {
        let local_conn = dial_target(&self.target).await?;
        let remote_conn = self.connect_back(id).await?;
        Ok((local_conn, remote_conn))
    }

    async fn handle_datagrams(&self, id: Uuid, closes: mpsc::Sender<Uuid>) -> Result<()> {
        let socket = match udp::dial(&self.target).await {
            Ok(socket) => socket,
            Err(source) => {
                closes.send(id).await.ok();
                return Err(TunnelError::Dial {
                    addr: self.target.clone(),
                    source,
                }
                .into());
            }
        };
        let remote_conn = match self.connect_back(id).await {
            Ok(conn) => conn,
            Err(err) => {
                closes.send(id).await.ok();
                return Err(err);
            }
        };

        let cancel = self.track(id);
        let result = udp::forward(
            remote_conn.into_datagrams(),
            socket,
            self.limits.udp_deadline,
            cancel,
        )
        .await;
        self.sessions.remove(&id);
        result
    }

    async fn connect_back(&self, id: Uuid) -> Result<Delimited<TcpStream>> {
        let mut remote_conn = Delimited::new(connect_with_timeout(&self.server).await?);
        remote_conn.send(ClientMessage::Accept(id)).await?;
        if let Some(auth) = &self.auth {
            auth.client_handshake(&mut remote_conn).await?;
        }
        Ok(remote_conn)
    }

    fn track(&self, id: Uuid) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.sessions.insert(id, cancel.clone());
        cancel
    }
}

async fn dial_target(addr: &str) -> Result<TcpStream, TunnelError> {
    let conn = match timeout(NETWORK_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out")),
    };
    conn.map_err(|source| TunnelError::Dial {
        addr: addr.to_string(),
        source,
    })
}

fn server_host(server: &str) -> &str {
    server.rsplit_once(':').map_or(server, |(host, _)| host)
}
