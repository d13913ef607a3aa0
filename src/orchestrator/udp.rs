//! UDP orchestration
//!
//! One socket per distinct source address, shared by every exchange from that
//! source. Each round writes all still-pending requests and then collects
//! datagrams until the round's deadline. A datagram is offered to the pending
//! exchanges on its socket in insertion order; the first codec that matches it
//! keeps it.

use super::AttemptSchedule;
use crate::bus::{self, Bus, Inbox};
use crate::codec::{Codec, Decoded};
use crate::config::Config;
use crate::gateway::{ResourceId, UdpEvent, UdpRequest};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How many responses an exchange may collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// At most one response, and only from the exact destination
    #[default]
    Unicast,
    /// Any number of responses from any sender on the socket
    ///
    /// Used for multicast/broadcast discovery. When several broadcast
    /// exchanges share a socket, which one accepts a given datagram is
    /// unspecified beyond "the first whose codec matches".
    Broadcast,
}

/// One logical request sent over UDP
pub struct UdpExchange<C: Codec> {
    /// Local address to send from
    pub source: IpAddr,
    /// Peer to send to
    pub destination: SocketAddr,
    /// Logical request handed to the codec
    pub request: C::Request,
    /// Wire conversion for this exchange
    pub codec: C,
    /// Accepted responses in arrival order
    pub responses: Vec<C::Response>,
}

impl<C: Codec> UdpExchange<C> {
    /// Create an exchange with no responses yet
    pub fn new(source: IpAddr, destination: SocketAddr, request: C::Request, codec: C) -> Self {
        Self {
            source,
            destination,
            request,
            codec,
            responses: Vec::new(),
        }
    }

    /// First accepted response, if any
    pub fn response(&self) -> Option<&C::Response> {
        self.responses.first()
    }

    /// Whether anything answered
    pub fn is_answered(&self) -> bool {
        !self.responses.is_empty()
    }
}

/// Drives UDP exchanges through a UDP gateway
#[derive(Debug, Clone)]
pub struct UdpOrchestrator {
    gateway: Bus<UdpRequest>,
    provisioning_timeout: Duration,
}

impl UdpOrchestrator {
    /// Use `gateway`, allowing `provisioning_timeout` to set sockets up
    pub fn new(gateway: Bus<UdpRequest>, provisioning_timeout: Duration) -> Self {
        Self {
            gateway,
            provisioning_timeout,
        }
    }

    /// Use `gateway` with timeouts taken from `config`
    pub fn from_config(gateway: Bus<UdpRequest>, config: &Config) -> Self {
        Self::new(gateway, config.provisioning_timeout())
    }

    /// Run every exchange through `schedule` and return them with responses
    ///
    /// Exchanges whose destination is the unspecified address are never sent.
    /// Exchanges whose socket could not be created come back unanswered.
    /// Never fails: an exchange without responses is the caller's signal
    /// that its destination did not respond.
    pub async fn run<C: Codec>(
        &self,
        mut exchanges: Vec<UdpExchange<C>>,
        delivery: Delivery,
        schedule: &AttemptSchedule,
    ) -> Vec<UdpExchange<C>> {
        let (listener, mut events) = bus::channel();

        let groups = group_by_source(&exchanges);
        if groups.is_empty() {
            debug!("No sendable UDP exchanges");
            return exchanges;
        }

        let (allocated, mut pending) = self.provision(groups, &listener, &mut events).await;
        let payloads: Vec<Bytes> = exchanges
            .iter()
            .map(|exchange| exchange.codec.encode(&exchange.request))
            .collect();

        'rounds: for (round, wait) in schedule.iter().enumerate() {
            if delivery == Delivery::Unicast && pending.is_settled() {
                break;
            }

            let mut sent = 0;
            for (&id, indices) in &pending.waiting {
                for &index in indices {
                    let write = UdpRequest::Write {
                        id,
                        destination: exchanges[index].destination,
                        payload: payloads[index].clone(),
                    };
                    if let Err(e) = self.gateway.send(write) {
                        warn!("UDP gateway unavailable, abandoning exchanges: {}", e);
                        break 'rounds;
                    }
                    sent += 1;
                }
            }
            debug!(
                "Round {}/{}: sent {} requests, waiting {:?}",
                round + 1,
                schedule.len(),
                sent,
                wait
            );

            let deadline = Instant::now() + *wait;
            while let Some(event) = events.recv_until(deadline).await {
                match event {
                    UdpEvent::Read {
                        id,
                        sender,
                        payload,
                    } => {
                        if !pending.correlate(&mut exchanges, id, sender, &payload, delivery) {
                            trace!("Unmatched datagram on socket {} from {}", id, sender);
                        }
                    }
                    UdpEvent::Error { id, error } => debug!("Socket {}: {}", id, error),
                    UdpEvent::Created { id, .. } => trace!("Late creation of socket {}", id),
                }

                if delivery == Delivery::Unicast && pending.is_settled() {
                    break 'rounds;
                }
            }
        }

        for id in allocated {
            let _ = self.gateway.send(UdpRequest::Close { id });
        }

        let answered = exchanges.iter().filter(|e| e.is_answered()).count();
        info!(
            "UDP orchestration finished: {}/{} exchanges answered",
            answered,
            exchanges.len()
        );
        exchanges
    }

    /// Allocate and create one socket per source
    ///
    /// Returns every allocated id (all must be closed) and the pending table
    /// for the sockets that actually came up before the deadline.
    async fn provision(
        &self,
        groups: Vec<(IpAddr, Vec<usize>)>,
        listener: &Bus<UdpEvent>,
        events: &mut Inbox<UdpEvent>,
    ) -> (Vec<ResourceId>, PendingTable) {
        let deadline = Instant::now() + self.provisioning_timeout;
        let mut allocated = Vec::with_capacity(groups.len());
        let mut requested: HashMap<ResourceId, (IpAddr, Vec<usize>)> = HashMap::new();

        for (source, indices) in groups {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let id = match self
                .gateway
                .call(|reply| UdpRequest::GetNextId { reply }, remaining)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warn!("No socket id for source {}: {}", source, e);
                    continue;
                }
            };
            allocated.push(id);

            let create = UdpRequest::CreateSocket {
                id,
                source: SocketAddr::new(source, 0),
                listener: listener.clone(),
            };
            if let Err(e) = self.gateway.send(create) {
                warn!("Could not request socket for source {}: {}", source, e);
                continue;
            }
            requested.insert(id, (source, indices));
        }

        let mut pending = PendingTable::default();
        while !requested.is_empty() {
            match events.recv_until(deadline).await {
                Some(UdpEvent::Created { id, local_addr }) => {
                    if let Some((source, indices)) = requested.remove(&id) {
                        debug!("Socket {} ready on {}", id, local_addr);
                        pending.insert(id, source, indices);
                    }
                }
                Some(UdpEvent::Error { id, error }) => {
                    if let Some((source, _)) = requested.remove(&id) {
                        warn!("Socket for source {} unavailable: {}", source, error);
                    }
                }
                Some(UdpEvent::Read { id, .. }) => {
                    trace!("Datagram on socket {} before any request was sent", id)
                }
                None => break,
            }
        }

        for (id, (source, _)) in requested {
            warn!(
                "Socket {} for source {} not ready within {:?}",
                id, source, self.provisioning_timeout
            );
        }

        (allocated, pending)
    }
}

/// Exchanges still waiting, keyed by the socket they were sent from
#[derive(Debug, Default)]
struct PendingTable {
    waiting: HashMap<ResourceId, Vec<usize>>,
    sockets: HashMap<IpAddr, ResourceId>,
}

impl PendingTable {
    fn insert(&mut self, id: ResourceId, source: IpAddr, indices: Vec<usize>) {
        self.sockets.insert(source, id);
        self.waiting.insert(id, indices);
    }

    /// Nothing left to wait for
    fn is_settled(&self) -> bool {
        self.waiting.values().all(Vec::is_empty)
    }

    /// Offer a datagram to the exchanges pending on socket `id`
    ///
    /// Returns whether some exchange accepted it.
    fn correlate<C: Codec>(
        &mut self,
        exchanges: &mut [UdpExchange<C>],
        id: ResourceId,
        sender: SocketAddr,
        payload: &[u8],
        delivery: Delivery,
    ) -> bool {
        let Some(indices) = self.waiting.get_mut(&id) else {
            return false;
        };

        for position in 0..indices.len() {
            let exchange = &mut exchanges[indices[position]];
            if delivery == Delivery::Unicast && exchange.destination != sender {
                continue;
            }

            match exchange.codec.decode(payload) {
                Decoded::Matched(response) => {
                    exchange.responses.push(response);
                    if delivery == Delivery::Unicast {
                        indices.remove(position);
                    }
                    return true;
                }
                Decoded::Rejected => continue,
            }
        }
        false
    }
}

/// Sendable exchange indices grouped by source, in first-seen order
fn group_by_source<C: Codec>(exchanges: &[UdpExchange<C>]) -> Vec<(IpAddr, Vec<usize>)> {
    let mut groups: Vec<(IpAddr, Vec<usize>)> = Vec::new();
    for (index, exchange) in exchanges.iter().enumerate() {
        if exchange.destination.ip().is_unspecified() {
            debug!(
                "Skipping exchange to unspecified destination {}",
                exchange.destination
            );
            continue;
        }
        match groups.iter_mut().find(|(source, _)| *source == exchange.source) {
            Some((_, indices)) => indices.push(index),
            None => groups.push((exchange.source, vec![index])),
        }
    }
    groups
}
