//! Port/password authority: decides which ports may be bound, and by whom.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::error::{Result, TunnelError};

/// Admission control for control connections.
///
/// When an allow-list of `"port password"` entries is configured it is
/// exclusive: only those ports may be bound, each with its own password, and
/// the server-wide password is ignored. Otherwise any port may be bound with
/// the server-wide password, or with none if the server has no password.
pub struct Authority {
    /// Exclusive per-port passwords.
    allow_list: HashMap<u16, Authenticator>,

    /// Server-wide password, used only when the allow-list is empty.
    password: Option<Authenticator>,

    /// Ports currently bound, keyed to the owning control session.
    bindings: Arc<DashMap<u16, Uuid>>,
}

impl Authority {
    /// Build an authority from the server password and `"port password"` entries.
    pub fn new(password: Option<&str>, port_passwords: &[String]) -> anyhow::Result<Self> {
        let mut allow_list = HashMap::new();
        for entry in port_passwords {
            let (port, secret) = parse_entry(entry)?;
            if allow_list.insert(port, Authenticator::new(secret)).is_some() {
                bail!("port {port} appears more than once in the port password list");
            }
        }
        Ok(Authority {
            password: match allow_list.is_empty() {
                true => password.map(Authenticator::new),
                false => None,
            },
            allow_list,
            bindings: Arc::new(DashMap::new()),
        })
    }

    /// Returns true if an exclusive allow-list is configured.
    pub fn has_allow_list(&self) -> bool {
        !self.allow_list.is_empty()
    }

    /// Returns the authenticator a client must satisfy to bind `port`.
    ///
    /// `Ok(None)` means the binding needs no password.
    pub fn authenticator(&self, port: u16) -> Result<Option<&Authenticator>> {
        if self.has_allow_list() {
            match self.allow_list.get(&port) {
                Some(auth) => Ok(Some(auth)),
                None => Err(TunnelError::Capacity(format!(
                    "port {port} is not in the allow-list"
                ))),
            }
        } else {
            Ok(self.password.as_ref())
        }
    }

    /// Decide whether `password` may bind `port`, returning the granted port.
    ///
    /// This does not reserve the port; see [`Authority::claim`].
    pub fn authorize(&self, port: u16, password: Option<&str>) -> Result<u16> {
        match (self.authenticator(port)?, password) {
            (None, None) => (),
            (Some(auth), Some(password)) if auth.accepts(password) => (),
            (None, Some(_)) => {
                return Err(TunnelError::Authentication(
                    "server does not use a password".into(),
                ))
            }
            (Some(_), _) => return Err(TunnelError::Authentication("invalid password".into())),
        }
        if self.is_bound(port) {
            return Err(TunnelError::Capacity(format!("port {port} is already bound")));
        }
        Ok(port)
    }

    /// Returns true if an active control session holds `port`.
    pub fn is_bound(&self, port: u16) -> bool {
        self.bindings.contains_key(&port)
    }

    /// Reserve `port` for `owner` until the returned guard is dropped.
    pub fn claim(&self, port: u16, owner: Uuid) -> Result<BindingGuard> {
        match self.bindings.entry(port) {
            Entry::Occupied(_) => Err(TunnelError::Capacity(format!(
                "port {port} is already bound"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                debug!(port, %owner, "port claimed");
                Ok(BindingGuard {
                    port,
                    owner,
                    bindings: Arc::clone(&self.bindings),
                })
            }
        }
    }
}

/// Exclusive reservation of a public port, released on drop.
pub struct BindingGuard {
    port: u16,
    owner: Uuid,
    bindings: Arc<DashMap<u16, Uuid>>,
}

impl BindingGuard {
    /// The reserved port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.bindings.remove_if(&self.port, |_, owner| *owner == self.owner);
        debug!(port = self.port, owner = %self.owner, "port released");
    }
}

fn parse_entry(entry: &str) -> anyhow::Result<(u16, &str)> {
    let (port, password) = entry
        .trim()
        .split_once(char::is_whitespace)
        .with_context(|| format!("expected \"port password\", got {entry:?}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {entry:?}"))?;
    if port == 0 {
        bail!("port must be between 1 and 65535 in {entry:?}");
    }
    let password = password.trim_start();
    if password.is_empty() {
        bail!("missing password in {entry:?}");
    }
    Ok((port, password))
}
