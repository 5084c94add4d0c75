//! Error taxonomy for tunnel sessions.

use std::io;

use thiserror::Error;

/// Failures surfaced at the granularity of one session or control connection.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Bad password, or a port the password does not cover.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The client could not reach its forwarding target.
    #[error("could not reach forwarding target {addr}: {source}")]
    Dial {
        /// Forwarding target that was dialed.
        addr: String,
        /// Underlying connect failure.
        #[source]
        source: io::Error,
    },

    /// I/O failure on a control or data connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Binding outside the allow-list, a port already bound, or an unsupported binding.
    #[error("binding rejected: {0}")]
    Capacity(String),

    /// Peer sent something the protocol does not allow at this point.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result type for operations that fail with a [`TunnelError`].
pub type Result<T> = std::result::Result<T, TunnelError>;
