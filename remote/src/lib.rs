//! Remote file transfer protocol plumbing shared by the `rft` client stubs
//! and the `rftd` server.
//!
//! # Overview
//!
//! A session consists of one control connection and a *crew* of one or more
//! dataports:
//!
//! ```text
//! client                                   server
//!   | --- CONNECT ------------------------->  |
//!   | <-- CONNECT 0 0 ----------------------  |
//!   | --- CONFIG <hostname> --------------->  |
//!   | <-- CONFIG 0 <ndataports> <blksize> <window>
//!   | --- DPORT6 <seq> <af> <addr16> <p1> <p2>  (one per dataport)
//!   |        <== server connects back ==     |
//!   | <-- DPORT6 0 0 -----------------------  |
//!   | --- OPEN / SEND / RECV / ... -------->  |
//! ```
//!
//! Control lines are handled by [`streams::ControlConnection`] using the
//! vocabulary in [`protocol`]. Bulk data never travels on the control
//! connection; it is striped across the dataports by a [`crew::Crew`] as
//! length prefixed frames, each transfer terminated by an empty frame per
//! dataport.

pub mod crew;
pub mod dataport;
pub mod error;
pub mod protocol;
pub mod streams;
mod worker;

pub use crew::{Crew, CrewConfig, Inbound, Outbound};
pub use dataport::{PortRangeError, PortRanges, configure_tcp_buffers};
pub use error::{Error, Result, errno_of};
pub use worker::Frame;
