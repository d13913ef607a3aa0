//! Gateways own OS resources and expose them only through bus messages
//!
//! Each gateway is one long-lived worker task:
//! - `udp` - many UDP sockets multiplexed by one worker
//! - `tcp` - outbound TCP connections, one task per connection
//! - `process` - external processes with streamed stdin/stdout/stderr
//!
//! Every resource is named by a [`ResourceId`] allocated through a
//! `GetNextId` request before the resource is created. All later messages
//! about that resource carry the id.

pub mod process;
pub mod tcp;
pub mod udp;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use process::{ProcessEvent, ProcessGateway, ProcessRequest, StreamTag};
pub use tcp::{TcpEvent, TcpGateway, TcpRequest};
pub use udp::{UdpEvent, UdpGateway, UdpRequest};

/// Correlation key naming one socket, connection or process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Raw integer value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source, one per gateway instance
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub(crate) fn next_id(&mut self) -> ResourceId {
        self.next += 1;
        ResourceId(self.next)
    }
}
