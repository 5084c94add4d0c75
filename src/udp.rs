//! UDP relay engine.
//!
//! UDP has no connection setup, so each public peer address gets a soft-state
//! mapping in the [`Registry`]. The server reads the public socket in a single
//! loop, queues each datagram on its peer's session, and tells the client about
//! new peers. The client connects back once per peer; the data path then carries
//! one length-delimited frame per datagram.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::interval;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::registry::{EstablishedUdp, Registry, UdpRoute};
use crate::relay::Activity;
use crate::shared::{SessionLimits, MAX_DATAGRAM_LENGTH};

/// Datagram channel over a data connection.
pub type DatagramStream<U> = Framed<U, LengthDelimitedCodec>;

/// Read the public UDP socket of a control session until cancelled.
///
/// Ids of newly created sessions are sent on `new_sessions` so the control
/// loop can notify the client.
pub async fn serve_public(
    socket: Arc<UdpSocket>,
    owner: Uuid,
    registry: Arc<Registry>,
    limits: SessionLimits,
    new_sessions: mpsc::Sender<Uuid>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LENGTH];
    loop {
        let (n, peer) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                // ICMP errors from earlier replies surface here on some platforms.
                Err(err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => return Err(err).context("public udp socket failed"),
            },
            _ = cancel.cancelled() => return Ok(()),
        };
        let payload = Bytes::copy_from_slice(&buf[..n]);
        match registry.route_udp(owner, peer, &socket, limits.udp_deadline) {
            Some(UdpRoute::Existing(id, queue)) => enqueue(id, &queue, payload),
            Some(UdpRoute::New(id, queue)) => {
                info!(%id, %peer, "new udp session");
                enqueue(id, &queue, payload);
                if new_sessions.send(id).await.is_err() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}

fn enqueue(id: Uuid, queue: &mpsc::Sender<Bytes>, payload: Bytes) {
    match queue.try_send(payload) {
        Ok(()) => (),
        Err(TrySendError::Full(_)) => trace!(%id, "udp queue full, dropping datagram"),
        Err(TrySendError::Closed(_)) => trace!(%id, "udp session gone, dropping datagram"),
    }
}

/// Periodically evict UDP sessions of `owner` idle for longer than `deadline`.
pub async fn sweep(
    owner: Uuid,
    registry: Arc<Registry>,
    deadline: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.sweep_udp(owner, deadline);
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "evicted idle udp sessions");
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Server end of a UDP data path: peer datagrams go to the client, replies go to the peer.
pub async fn serve_data<U>(
    data: DatagramStream<U>,
    id: Uuid,
    session: EstablishedUdp,
    registry: Arc<Registry>,
) -> Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    let EstablishedUdp {
        peer,
        socket,
        mut inbound,
        limits,
        cancel,
        ..
    } = session;
    let (mut sink, mut stream) = data.split();
    loop {
        tokio::select! {
            datagram = inbound.recv() => match datagram {
                Some(payload) => sink.send(payload).await?,
                None => return Ok(()),
            },
            frame = stream.next() => match frame {
                Some(frame) => {
                    let frame = frame?;
                    if !registry.touch_udp(id, limits.udp_deadline) {
                        debug!(%id, "dropping reply for evicted udp session");
                        return Ok(());
                    }
                    socket.send_to(&frame, peer).await?;
                }
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// Open a UDP socket connected to the forwarding target.
pub async fn dial(target: &str) -> io::Result<UdpSocket> {
    let addr = lookup_host(target).await?.next().ok_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("no address found for {target}"))
    })?;
    let local: SocketAddr = match addr {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Client end of a UDP data path, relaying to and from the forwarding target.
///
/// Ends after `idle_deadline` without traffic in either direction, mirroring
/// the server's eviction.
pub async fn forward<U>(
    data: DatagramStream<U>,
    socket: UdpSocket,
    idle_deadline: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let (mut sink, mut stream) = data.split();
    let mut buf = vec![0u8; MAX_DATAGRAM_LENGTH];
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(frame) => {
                    if let Err(err) = socket.send(&frame?).await {
                        warn!(%err, "could not send datagram to target");
                    }
                    activity.touch();
                }
                None => return Ok(()),
            },
            res = socket.recv(&mut buf) => match res {
                Ok(n) => {
                    sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
                    activity.touch();
                }
                // The target is not listening right now; later datagrams may still land.
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    trace!("target refused datagram");
                }
                Err(err) => return Err(err.into()),
            },
            _ = activity.expired(idle_deadline) => {
                debug!("udp session idle");
                return Ok(());
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}
