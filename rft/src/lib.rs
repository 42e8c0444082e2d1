//! Remote file transfer for SAM hosts.
//!
//! `rftd` serves a small set of file, directory and removable media
//! operations to remote clients; [`client::Session`] is the client side,
//! one stub per operation. Every session has one control connection
//! carrying text commands and replies, and a crew of dataports carrying
//! bulk data (see the `remote` crate for the wire format).
//!
//! ```text
//! rft (client::Session)                      rftd (server::Server)
//!   open / write / read ... --- control --->  dispatch -> host::LocalHost
//!                           <== dataports ==>  crew
//! ```
//!
//! Operations run on the serving host by [`host::LocalHost`], which a
//! client session also uses directly when the host is `localhost`.

pub mod archive;
pub mod client;
pub mod fsinfo;
pub mod handles;
pub mod host;
pub mod server;
pub mod volume;

pub use client::{ClientConfig, Session, is_accessible};
pub use host::{HostConfig, LocalHost};
pub use server::{Server, ServerConfig};
