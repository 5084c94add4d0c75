//! Session registry: every live relay session and UDP mapping, keyed by id.
//!
//! Sessions are always owned by exactly one control session. Removing the
//! control session cancels and drops everything it owns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::shared::SessionLimits;

/// Datagrams buffered per UDP session while the client connects back.
const UDP_QUEUE_DEPTH: usize = 64;

/// Lifecycle of a TCP relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Public connection accepted, waiting for the client to connect back.
    Pending,
    /// Both ends paired and copying.
    Established,
    /// Close requested, copy loops shutting down.
    Closing,
    /// Removed from the registry.
    Closed,
}

/// Registry view of one control session.
#[derive(Debug, Clone)]
pub struct ControlEntry {
    /// Public port granted to the control session.
    pub port: u16,
    /// Timeouts requested by the client.
    pub limits: SessionLimits,
    /// Cancelled when the control session closes; parent of all session tokens.
    pub cancel: CancellationToken,
    /// When the control session was admitted.
    pub created: Instant,
}

struct RelayEntry {
    owner: Uuid,
    state: SessionState,
    public: Option<TcpStream>,
    cancel: CancellationToken,
}

struct UdpEntry {
    owner: Uuid,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    last_activity: Instant,
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
    cancel: CancellationToken,
}

impl UdpEntry {
    fn is_expired(&self, deadline: Duration, now: Instant) -> bool {
        !deadline.is_zero() && now.saturating_duration_since(self.last_activity) > deadline
    }
}

/// A TCP relay session handed over to its data path.
pub struct EstablishedRelay {
    /// Owning control session.
    pub owner: Uuid,
    /// The public peer's connection.
    pub public: TcpStream,
    /// Timeouts of the owning control session.
    pub limits: SessionLimits,
    /// Cancelled when the session or its owner closes.
    pub cancel: CancellationToken,
}

/// A UDP session handed over to its data path.
pub struct EstablishedUdp {
    /// Owning control session.
    pub owner: Uuid,
    /// Address replies are sent back to.
    pub peer: SocketAddr,
    /// Public socket the peer talks to.
    pub socket: Arc<UdpSocket>,
    /// Datagrams received from the peer, in arrival order.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Timeouts of the owning control session.
    pub limits: SessionLimits,
    /// Cancelled when the mapping is evicted or its owner closes.
    pub cancel: CancellationToken,
}

/// Where an inbound datagram from a public peer should go.
pub enum UdpRoute {
    /// The peer already has a mapping.
    Existing(Uuid, mpsc::Sender<Bytes>),
    /// A new mapping was created; the client must be told about it.
    New(Uuid, mpsc::Sender<Bytes>),
}

/// Concurrent table of control sessions, relay sessions and UDP mappings.
#[derive(Default)]
pub struct Registry {
    controls: DashMap<Uuid, ControlEntry>,
    relays: DashMap<Uuid, RelayEntry>,
    udp: DashMap<Uuid, UdpEntry>,
    udp_peers: DashMap<(Uuid, SocketAddr), Uuid>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admitted control session.
    pub fn register_control(
        &self,
        id: Uuid,
        port: u16,
        limits: SessionLimits,
        cancel: CancellationToken,
    ) {
        self.controls.insert(
            id,
            ControlEntry {
                port,
                limits,
                cancel,
                created: Instant::now(),
            },
        );
    }

    /// Look up a control session.
    pub fn control(&self, id: Uuid) -> Option<ControlEntry> {
        self.controls.get(&id).map(|entry| entry.clone())
    }

    /// Remove a control session, cancelling and dropping every session it owns.
    pub fn remove_control(&self, id: Uuid) {
        if let Some((_, control)) = self.controls.remove(&id) {
            control.cancel.cancel();
        }
        self.relays.retain(|_, relay| {
            if relay.owner == id {
                relay.cancel.cancel();
                false
            } else {
                true
            }
        });
        self.udp.retain(|_, udp| {
            if udp.owner == id {
                udp.cancel.cancel();
                false
            } else {
                true
            }
        });
        self.udp_peers.retain(|(owner, _), _| *owner != id);
        debug!(%id, "control session removed from registry");
    }

    /// Number of control sessions currently registered.
    pub fn control_count(&self) -> usize {
        self.controls.len()
    }

    /// Returns the control session owning a relay or UDP session.
    pub fn session_owner(&self, id: Uuid) -> Option<Uuid> {
        if let Some(relay) = self.relays.get(&id) {
            return Some(relay.owner);
        }
        self.udp.get(&id).map(|udp| udp.owner)
    }

    /// Allocate a pending relay session for a public connection.
    ///
    /// Returns `None` if the owner is no longer registered.
    pub fn insert_pending(&self, owner: Uuid, public: TcpStream) -> Option<Uuid> {
        let cancel = self.controls.get(&owner)?.cancel.child_token();
        let id = Uuid::new_v4();
        self.relays.insert(
            id,
            RelayEntry {
                owner,
                state: SessionState::Pending,
                public: Some(public),
                cancel,
            },
        );
        Some(id)
    }

    /// Pair a pending relay session with its data path, marking it established.
    pub fn accept_relay(&self, id: Uuid) -> Option<EstablishedRelay> {
        let mut relay = self.relays.get_mut(&id)?;
        if relay.state != SessionState::Pending {
            return None;
        }
        let limits = self.controls.get(&relay.owner)?.limits;
        let public = relay.public.take()?;
        relay.state = SessionState::Established;
        Some(EstablishedRelay {
            owner: relay.owner,
            public,
            limits,
            cancel: relay.cancel.clone(),
        })
    }

    /// Returns the state of a relay session; closed if it is not registered.
    pub fn relay_state(&self, id: Uuid) -> SessionState {
        self.relays
            .get(&id)
            .map(|relay| relay.state)
            .unwrap_or(SessionState::Closed)
    }

    /// Drop a relay session if the client never connected back.
    pub fn expire_pending(&self, id: Uuid) -> bool {
        self.relays
            .remove_if(&id, |_, relay| relay.state == SessionState::Pending)
            .is_some()
    }

    /// Drop every pending relay session of a control session.
    pub fn drop_pending(&self, owner: Uuid) -> usize {
        let before = self.relays.len();
        self.relays
            .retain(|_, relay| !(relay.owner == owner && relay.state == SessionState::Pending));
        before.saturating_sub(self.relays.len())
    }

    /// Remove a relay session whose copy loops have finished.
    pub fn finish_relay(&self, id: Uuid) {
        if let Some((_, relay)) = self.relays.remove(&id) {
            relay.cancel.cancel();
        }
    }

    /// Close one session on behalf of its owner, leaving other sessions alone.
    ///
    /// Pending sessions are dropped at once, closing the public connection.
    /// Established sessions move to closing and are removed when their copy
    /// loops exit. Returns false if `owner` does not own session `id`.
    pub fn close_session(&self, owner: Uuid, id: Uuid) -> bool {
        let pending = self.relays.remove_if(&id, |_, relay| {
            relay.owner == owner && relay.state == SessionState::Pending
        });
        if pending.is_some() {
            return true;
        }
        if let Some(mut relay) = self.relays.get_mut(&id) {
            if relay.owner == owner {
                relay.state = SessionState::Closing;
                relay.cancel.cancel();
                return true;
            }
            return false;
        }
        let udp_owner = self.udp.get(&id).map(|udp| udp.owner);
        match udp_owner {
            Some(udp_owner) if udp_owner == owner => self.evict_udp(id),
            _ => false,
        }
    }

    /// Number of relay sessions owned by a control session.
    pub fn relay_count(&self, owner: Uuid) -> usize {
        self.relays.iter().filter(|relay| relay.owner == owner).count()
    }

    /// Number of UDP sessions owned by a control session.
    pub fn udp_count(&self, owner: Uuid) -> usize {
        self.udp.iter().filter(|udp| udp.owner == owner).count()
    }

    /// Number of relay and UDP sessions across all control sessions.
    pub fn session_count(&self) -> usize {
        self.relays.len() + self.udp.len()
    }

    /// Find or create the UDP session for a peer, refreshing its idle timestamp.
    ///
    /// A mapping idle for longer than `deadline` is evicted here and replaced.
    /// Returns `None` if the owner is no longer registered.
    pub fn route_udp(
        &self,
        owner: Uuid,
        peer: SocketAddr,
        socket: &Arc<UdpSocket>,
        deadline: Duration,
    ) -> Option<UdpRoute> {
        let now = Instant::now();
        let existing = self.udp_peers.get(&(owner, peer)).map(|id| *id);
        if let Some(id) = existing {
            if let Some(mut udp) = self.udp.get_mut(&id) {
                if !udp.is_expired(deadline, now) {
                    udp.last_activity = now;
                    return Some(UdpRoute::Existing(id, udp.tx.clone()));
                }
            }
            debug!(%id, %peer, "udp session expired on arrival");
            self.evict_udp(id);
        }

        let cancel = self.controls.get(&owner)?.cancel.child_token();
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(UDP_QUEUE_DEPTH);
        self.udp.insert(
            id,
            UdpEntry {
                owner,
                peer,
                socket: Arc::clone(socket),
                last_activity: now,
                tx: tx.clone(),
                rx: Some(rx),
                cancel,
            },
        );
        self.udp_peers.insert((owner, peer), id);
        // The owner may have been removed between the lookup and the insert.
        if !self.controls.contains_key(&owner) {
            self.evict_udp(id);
            return None;
        }
        Some(UdpRoute::New(id, tx))
    }

    /// Hand a UDP session's inbound queue over to its data path.
    pub fn accept_udp(&self, id: Uuid) -> Option<EstablishedUdp> {
        let mut udp = self.udp.get_mut(&id)?;
        let inbound = udp.rx.take()?;
        let limits = self.controls.get(&udp.owner)?.limits;
        udp.last_activity = Instant::now();
        Some(EstablishedUdp {
            owner: udp.owner,
            peer: udp.peer,
            socket: Arc::clone(&udp.socket),
            inbound,
            limits,
            cancel: udp.cancel.clone(),
        })
    }

    /// Refresh a UDP session's idle timestamp.
    ///
    /// A mapping idle for longer than `deadline` is evicted instead. Returns
    /// false if the session is gone.
    pub fn touch_udp(&self, id: Uuid, deadline: Duration) -> bool {
        let now = Instant::now();
        {
            let Some(mut udp) = self.udp.get_mut(&id) else {
                return false;
            };
            if !udp.is_expired(deadline, now) {
                udp.last_activity = now;
                return true;
            }
        }
        debug!(%id, "udp session expired on reply");
        self.evict_udp(id);
        false
    }

    /// Returns true if a UDP session is registered.
    pub fn has_udp(&self, id: Uuid) -> bool {
        self.udp.contains_key(&id)
    }

    /// Drop a UDP mapping. There is no close handshake for UDP.
    pub fn evict_udp(&self, id: Uuid) -> bool {
        match self.udp.remove(&id) {
            Some((_, udp)) => {
                udp.cancel.cancel();
                self.udp_peers
                    .remove_if(&(udp.owner, udp.peer), |_, mapped| *mapped == id);
                true
            }
            None => false,
        }
    }

    /// Evict every UDP session of `owner` idle for longer than `deadline`.
    pub fn sweep_udp(&self, owner: Uuid, deadline: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.udp.retain(|id, udp| {
            if udp.owner == owner && udp.is_expired(deadline, now) {
                udp.cancel.cancel();
                evicted.push((*id, udp.peer));
                false
            } else {
                true
            }
        });
        for (id, peer) in &evicted {
            self.udp_peers
                .remove_if(&(owner, *peer), |_, mapped| mapped == id);
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// Drop every UDP session of a control session.
    pub fn drop_udp(&self, owner: Uuid) {
        self.udp.retain(|_, udp| {
            if udp.owner == owner {
                udp.cancel.cancel();
                false
            } else {
                true
            }
        });
        self.udp_peers.retain(|(mapped_owner, _), _| *mapped_owner != owner);
    }
}
