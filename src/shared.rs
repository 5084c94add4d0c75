//! Shared data structures, utilities, and protocol definitions.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, Framed, FramedParts, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

/// Default TCP port used for control connections with the server.
pub const CONTROL_PORT: u16 = 7835;

/// Maximum byte length for a JSON frame in the stream.
pub const MAX_FRAME_LENGTH: usize = 256;

/// Maximum byte length of a single relayed UDP datagram.
pub const MAX_DATAGRAM_LENGTH: usize = 65_535;

/// Timeout for network connections and initial protocol messages.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a public connection waits for the client to connect back.
pub const CONNECT_BACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness grace window used when the client disables the TCP idle timeout.
pub const DEFAULT_LIVENESS_GRACE: Duration = Duration::from_secs(60);

/// Exposure requested by a client for its control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// A fixed public port; zero lets the server pick one.
    Port(u16),

    /// A subdomain on a server that performs domain routing.
    Domain(String),
}

/// Timeouts requested by the client, applied to every session it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Idle timeout of a TCP relay session, reset on every byte. Zero disables it.
    pub tcp_timeout: Duration,

    /// Hard cap on the lifetime of a TCP relay session. Zero means unbounded.
    pub tcp_deadline: Duration,

    /// Idle lifetime of a UDP session mapping. Zero disables eviction.
    pub udp_deadline: Duration,
}

impl SessionLimits {
    /// Build limits from whole seconds, as accepted on the command line.
    pub fn from_secs(tcp_timeout: u64, tcp_deadline: u64, udp_deadline: u64) -> Self {
        SessionLimits {
            tcp_timeout: Duration::from_secs(tcp_timeout),
            tcp_deadline: Duration::from_secs(tcp_deadline),
            udp_deadline: Duration::from_secs(udp_deadline),
        }
    }

    /// Silence on the control connection longer than this marks it dead.
    pub fn liveness_grace(&self) -> Duration {
        if self.tcp_timeout.is_zero() {
            DEFAULT_LIVENESS_GRACE
        } else {
            self.tcp_timeout
        }
    }

    /// Interval between heartbeats on the control connection.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.liveness_grace() / 3).max(Duration::from_millis(100))
    }

    /// Interval of the UDP eviction sweep, if eviction is enabled.
    pub fn udp_sweep_interval(&self) -> Option<Duration> {
        if self.udp_deadline.is_zero() {
            None
        } else {
            Some((self.udp_deadline / 2).max(Duration::from_millis(50)))
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits::from_secs(60, 0, 60)
    }
}

/// Initial request of a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Port or domain to expose.
    pub binding: Binding,

    /// Timeouts for sessions created on this binding.
    pub limits: SessionLimits,
}

/// A message from the client on the control connection.
#[derive(Debug, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Response to an authentication challenge from the server.
    Authenticate(String),

    /// Initial client message specifying the binding to expose.
    Hello(HelloRequest),

    /// Accepts a relay session, using this stream as its data path.
    Accept(Uuid),

    /// Reply to a server heartbeat.
    Pong,

    /// The client could not serve, or has finished, a relay session.
    Close(Uuid),
}

/// A message from the server on the control connection.
#[derive(Debug, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Authentication challenge, sent when the requested binding needs a password.
    Challenge(Uuid),

    /// Response to a client's initial message, with actual public port.
    Hello(u16),

    /// Liveness probe, answered with a pong.
    Heartbeat,

    /// Asks the client to accept a forwarded TCP connection.
    Connection(Uuid),

    /// Asks the client to accept a new UDP peer mapping.
    Datagram(Uuid),

    /// The server dropped a relay session.
    Close(Uuid),

    /// Indicates a server error that terminates the connection.
    Error(String),
}

/// Transport stream with JSON frames delimited by null characters.
pub struct Delimited<U>(Framed<U, AnyDelimiterCodec>);

impl<U: AsyncRead + AsyncWrite + Unpin> Delimited<U> {
    /// Construct a new delimited stream.
    pub fn new(stream: U) -> Self {
        let codec = AnyDelimiterCodec::new_with_max_length(vec![0], vec![0], MAX_FRAME_LENGTH);
        Self(Framed::new(stream, codec))
    }

    /// Read the next null-delimited JSON instruction from a stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        trace!("waiting to receive json message");
        if let Some(next_message) = self.0.next().await {
            let byte_message = next_message.context("frame error, invalid byte length")?;
            let serialized_obj =
                serde_json::from_slice(&byte_message).context("unable to parse message")?;
            Ok(serialized_obj)
        } else {
            Ok(None)
        }
    }

    /// Read the next null-delimited JSON instruction, with a default timeout.
    ///
    /// This is useful for parsing the initial message of a stream for handshake or
    /// other protocol purposes, where we do not want to wait indefinitely.
    pub async fn recv_timeout<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        timeout(NETWORK_TIMEOUT, self.recv())
            .await
            .context("timed out waiting for initial message")?
    }

    /// Send a null-terminated JSON instruction on a stream.
    pub async fn send<T: Serialize>(&mut self, msg: T) -> Result<()> {
        trace!("sending json message");
        self.0.send(serde_json::to_string(&msg)?).await?;
        Ok(())
    }

    /// Consume this object, returning current buffers and the inner transport.
    pub fn into_parts(self) -> FramedParts<U, AnyDelimiterCodec> {
        self.0.into_parts()
    }

    /// Switch this stream to length-delimited datagram frames, keeping buffered bytes.
    pub fn into_datagrams(self) -> Framed<U, LengthDelimitedCodec> {
        let parts = self.0.into_parts();
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_DATAGRAM_LENGTH)
            .new_codec();
        let mut datagrams = FramedParts::new::<bytes::Bytes>(parts.io, codec);
        datagrams.read_buf = parts.read_buf;
        datagrams.write_buf = parts.write_buf;
        Framed::from_parts(datagrams)
    }
}

/// Open a TCP connection to `addr`, failing after [`NETWORK_TIMEOUT`].
pub async fn connect_with_timeout(addr: &str) -> Result<TcpStream> {
    match timeout(NETWORK_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(err) => Err(err.into()),
    }
    .with_context(|| format!("could not connect to {addr}"))
}

/// Requests a graceful shutdown of a running server or client.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    /// Stop accepting new work and let in-flight sessions drain.
    pub fn shutdown(&self) {
        self.0.cancel();
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.0.is_cancelled()
    }
}
