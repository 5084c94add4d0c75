//! Server implementation for the `rift` service.

use std::future::pending;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::authority::{Authority, BindingGuard};
use crate::error::TunnelError;
use crate::registry::Registry;
use crate::relay::relay;
use crate::shared::{
    Binding, ClientMessage, Delimited, HelloRequest, ServerMessage, SessionLimits,
    ShutdownHandle, CONNECT_BACK_TIMEOUT,
};
use crate::udp;

/// Lifecycle of a control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Connection accepted, no message read yet.
    Connecting,
    /// Hello received, credentials being checked.
    Authenticating,
    /// Binding active, public connections being relayed.
    Active,
    /// Shutdown requested; no new sessions, in-flight relays finishing.
    Draining,
    /// Connection finished and all owned sessions released.
    Closed,
}

/// One client's control connection as seen by the server.
struct ControlSession {
    id: Uuid,
    addr: SocketAddr,
    created: Instant,
    state: ControlState,
}

impl ControlSession {
    fn new(addr: SocketAddr) -> Self {
        ControlSession {
            id: Uuid::new_v4(),
            addr,
            created: Instant::now(),
            state: ControlState::Connecting,
        }
    }

    fn transition(&mut self, next: ControlState) {
        debug!(id = %self.id, from = ?self.state, to = ?next, "control state");
        self.state = next;
    }
}

/// Public listeners reserved for an admitted control session.
struct Admission {
    guard: BindingGuard,
    listener: TcpListener,
    socket: Option<UdpSocket>,
}

/// State structure for the server.
pub struct Server {
    /// Address the server accepts control and data connections on.
    listen_addr: String,

    /// Decides which ports may be bound, and with which password.
    authority: Authority,

    /// Concurrent table of live sessions.
    registry: Arc<Registry>,

    /// Cancelled when shutdown is requested.
    shutdown: CancellationToken,

    /// How long a public connection waits for the client to connect back.
    connect_back_timeout: Duration,

    /// Tracks connection tasks so shutdown can wait for them to drain.
    tasks: TaskTracker,
}

impl Server {
    /// Create a new server.
    ///
    /// Each entry of `port_passwords` has the form `"port password"`. If any are
    /// given they form an exclusive allow-list and `password` is ignored.
    pub fn new(
        listen_addr: &str,
        password: Option<&str>,
        port_passwords: &[String],
    ) -> Result<Self> {
        Ok(Server {
            listen_addr: listen_addr.to_string(),
            authority: Authority::new(password, port_passwords)?,
            registry: Arc::new(Registry::new()),
            connect_back_timeout: CONNECT_BACK_TIMEOUT,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Returns the session registry, shared with running connections.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Change how long a public connection waits for the client to connect back.
    pub fn set_connect_back_timeout(&mut self, timeout: Duration) {
        self.connect_back_timeout = timeout;
    }

    /// Returns a handle that stops the server once triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.shutdown.clone())
    }

    /// Start the server, listening for new connections until shutdown.
    ///
    /// After shutdown is requested no new connections are accepted, and this
    /// returns once every control session has drained.
    pub async fn listen(self) -> Result<()> {
        let this = Arc::new(self);
        let listener = TcpListener::bind(&this.listen_addr)
            .await
            .with_context(|| format!("could not bind to {}", this.listen_addr))?;
        let local = listener.local_addr()?;
        info!(addr = ?local, "server listening");

        loop {
            let (stream, addr) = tokio::select! {
                res = listener.accept() => res?,
                _ = this.shutdown.cancelled() => break,
            };
            let server = Arc::clone(&this);
            this.tasks.spawn(
                async move {
                    info!("incoming connection");
                    if let Err(err) = server.handle_connection(stream, addr, local.ip()).await {
                        warn!(%err, "connection exited with error");
                    } else {
                        info!("connection exited");
                    }
                }
                .instrument(info_span!("control", ?addr)),
            );
        }

        drop(listener);
        info!(
            controls = this.registry.control_count(),
            sessions = this.registry.session_count(),
            "shutting down, draining control sessions"
        );
        this.tasks.close();
        this.tasks.wait().await;
        info!("server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        public_ip: IpAddr,
    ) -> Result<()> {
        let mut stream = Delimited::new(stream);
        match stream.recv_timeout().await? {
            Some(ClientMessage::Hello(hello)) => {
                self.handle_control(stream, hello, addr, public_ip).await
            }
            Some(ClientMessage::Accept(id)) => self.handle_accept(stream, id).await,
            Some(msg) => {
                Err(TunnelError::Protocol(format!("unexpected {msg:?} before hello")).into())
            }
            None => {
                warn!("unexpected EOF");
                Ok(())
            }
        }
    }

    async fn handle_control(
        &self,
        mut stream: Delimited<TcpStream>,
        hello: HelloRequest,
        addr: SocketAddr,
        public_ip: IpAddr,
    ) -> Result<()> {
        let mut control = ControlSession::new(addr);
        control.transition(ControlState::Authenticating);

        let admitted = match hello.binding {
            Binding::Port(port) => self.admit(&mut stream, port, control.id, public_ip).await,
            Binding::Domain(domain) => Err(TunnelError::Capacity(format!(
                "subdomain {domain:?} requested, but this server does not route domains"
            ))),
        };
        let admission = match admitted {
            Ok(admission) => admission,
            Err(err) => {
                warn!(%err, "control session rejected");
                control.transition(ControlState::Closed);
                stream.send(ServerMessage::Error(err.to_string())).await?;
                return Ok(());
            }
        };

        let port = admission.guard.port();
        let cancel = CancellationToken::new();
        self.registry
            .register_control(control.id, port, hello.limits, cancel.clone());
        control.transition(ControlState::Active);
        info!(port, id = %control.id, "new client");

        let result = match stream.send(ServerMessage::Hello(port)).await {
            Ok(()) => {
                self.run_control(&mut control, stream, admission, hello.limits, cancel)
                    .await
            }
            Err(err) => Err(err),
        };
        self.registry.remove_control(control.id);
        control.transition(ControlState::Closed);
        info!(
            port,
            lifetime = ?control.created.elapsed(),
            addr = %control.addr,
            "client disconnected"
        );
        result
    }

    /// Check credentials, reserve the port, and bind its public listeners.
    async fn admit(
        &self,
        stream: &mut Delimited<TcpStream>,
        port: u16,
        owner: Uuid,
        public_ip: IpAddr,
    ) -> Result<Admission, TunnelError> {
        if let Some(auth) = self.authority.authenticator(port)? {
            auth.server_handshake(stream)
                .await
                .map_err(|err| TunnelError::Authentication(err.to_string()))?;
        }

        let reserved = match port {
            0 => None,
            port => Some(self.authority.claim(port, owner)?),
        };
        let listener = TcpListener::bind((public_ip, port))
            .await
            .map_err(|_| TunnelError::Capacity("port already in use".into()))?;
        let port = listener.local_addr()?.port();
        let guard = match reserved {
            Some(guard) => guard,
            None => self.authority.claim(port, owner)?,
        };

        let socket = match UdpSocket::bind((public_ip, port)).await {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(port, %err, "could not bind udp port, relaying tcp only");
                None
            }
        };
        Ok(Admission {
            guard,
            listener,
            socket,
        })
    }

    async fn run_control(
        &self,
        control: &mut ControlSession,
        mut stream: Delimited<TcpStream>,
        admission: Admission,
        limits: SessionLimits,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Admission {
            guard,
            listener,
            socket,
        } = admission;
        let port = guard.port();
        let owner = control.id;
        let mut listener = Some(listener);

        let udp_cancel = cancel.child_token();
        let (new_udp_tx, mut new_udp_rx) = mpsc::channel(64);
        if let Some(socket) = socket {
            let serve = udp::serve_public(
                Arc::new(socket),
                owner,
                Arc::clone(&self.registry),
                limits,
                new_udp_tx,
                udp_cancel.clone(),
            );
            self.tasks.spawn(
                async move {
                    if let Err(err) = serve.await {
                        warn!(%err, "udp relay exited with error");
                    }
                }
                .instrument(info_span!("udp", port)),
            );
            if let Some(period) = limits.udp_sweep_interval() {
                self.tasks.spawn(udp::sweep(
                    owner,
                    Arc::clone(&self.registry),
                    limits.udp_deadline,
                    period,
                    udp_cancel.clone(),
                ));
            }
        }

        let (expired_tx, mut expired_rx) = mpsc::channel(64);
        let grace = limits.liveness_grace();
        let mut heartbeat = interval(limits.heartbeat_interval());
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                res = accept_public(&listener) => {
                    let (public, addr) = res?;
                    let Some(id) = self.registry.insert_pending(owner, public) else {
                        return Ok(());
                    };
                    info!(%id, ?addr, port, "new connection");
                    let registry = Arc::clone(&self.registry);
                    let expired_tx = expired_tx.clone();
                    let wait = self.connect_back_timeout;
                    tokio::spawn(async move {
                        sleep(wait).await;
                        if registry.expire_pending(id) {
                            warn!(%id, "removed stale connection");
                            expired_tx.send(id).await.ok();
                        }
                    });
                    stream.send(ServerMessage::Connection(id)).await?;
                }
                Some(id) = new_udp_rx.recv() => {
                    stream.send(ServerMessage::Datagram(id)).await?;
                }
                Some(id) = expired_rx.recv() => {
                    stream.send(ServerMessage::Close(id)).await?;
                }
                msg = stream.recv::<ClientMessage>() => {
                    last_seen = Instant::now();
                    match msg? {
                        Some(ClientMessage::Pong) => (),
                        Some(ClientMessage::Close(id)) => {
                            if self.registry.close_session(owner, id) {
                                info!(%id, "session closed by client");
                            } else {
                                debug!(%id, "close for unknown session");
                            }
                        }
                        Some(msg) => warn!(?msg, "unexpected control message"),
                        None => return Ok(()),
                    }
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > grace {
                        warn!(?grace, "client missed heartbeats");
                        return Ok(());
                    }
                    let draining = control.state == ControlState::Draining;
                    if draining && self.registry.relay_count(owner) == 0 {
                        info!("drained");
                        return Ok(());
                    }
                    if stream.send(ServerMessage::Heartbeat).await.is_err() {
                        // Assume that the TCP connection has been dropped.
                        return Ok(());
                    }
                }
                _ = self.shutdown.cancelled(), if control.state == ControlState::Active => {
                    control.transition(ControlState::Draining);
                    listener = None;
                    udp_cancel.cancel();
                    self.registry.drop_udp(owner);
                    let dropped = self.registry.drop_pending(owner);
                    info!(dropped, remaining = self.registry.relay_count(owner), "draining");
                    if self.registry.relay_count(owner) == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_accept(&self, mut stream: Delimited<TcpStream>, id: Uuid) -> Result<()> {
        let Some(owner) = self.registry.session_owner(id) else {
            warn!(%id, "missing connection");
            return Ok(());
        };
        let Some(control) = self.registry.control(owner) else {
            warn!(%id, "connection owner is gone");
            return Ok(());
        };
        if let Some(auth) = self.authority.authenticator(control.port)? {
            auth.server_handshake(&mut stream).await?;
        }

        if let Some(session) = self.registry.accept_relay(id) {
            info!(%id, "forwarding connection");
            let parts = stream.into_parts();
            debug_assert!(parts.write_buf.is_empty(), "framed write buffer not empty");
            let mut public = session.public;
            public.write_all(&parts.read_buf).await?;
            let result = relay(public, parts.io, &session.limits, session.cancel).await;
            self.registry.finish_relay(id);
            let reason = result?;
            info!(%id, ?reason, "relay session closed");
        } else if let Some(session) = self.registry.accept_udp(id) {
            info!(%id, peer = %session.peer, "forwarding datagrams");
            let result = udp::serve_data(
                stream.into_datagrams(),
                id,
                session,
                Arc::clone(&self.registry),
            )
            .await;
            self.registry.evict_udp(id);
            result?;
            info!(%id, "udp session closed");
        } else {
            warn!(%id, "session is not waiting for a connection");
        }
        Ok(())
    }
}

async fn accept_public(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}
