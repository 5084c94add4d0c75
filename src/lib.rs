//! Expose a service running behind NAT to the public internet through a
//! cooperating relay server.
//!
//! This is the library crate documentation. If you're looking for usage
//! information about the binary, see the command below.
//!
//! ```shell
//! $ rift help
//! ```
//!
//! A client, running next to the private service, keeps a control connection
//! open to a public server. The server binds a public TCP and UDP port for the
//! client and relays every public connection or datagram flow back through
//! it. Both halves are public members and can be run programmatically with a
//! Tokio 1.0 runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod authority;
pub mod client;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod shared;
pub mod udp;
