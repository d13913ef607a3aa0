//! TCP orchestration
//!
//! One connection per request. A request is written as soon as its connection
//! is requested (the gateway buffers it until the connect completes) and the
//! response is everything read until the connection ends. At most
//! `max_per_authority` connections to one destination are open at a time;
//! the rest queue behind them within the round.
//!
//! A failed or unfinished request is retried on a fresh connection in the
//! next round. A round with unanswered requests lasts its full duration so
//! the schedule still acts as backoff against peers that refuse quickly.

use super::AttemptSchedule;
use crate::bus::{self, Bus, Inbox};
use crate::codec::{Codec, Decoded};
use crate::config::Config;
use crate::gateway::{ResourceId, TcpEvent, TcpRequest};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// One logical request sent over its own TCP connection
pub struct TcpExchange<C: Codec> {
    /// Peer to connect to; also the authority the concurrency cap applies to
    pub destination: SocketAddr,
    /// Logical request handed to the codec
    pub request: C::Request,
    /// Wire conversion for this exchange
    pub codec: C,
    /// Accepted response, if any
    pub response: Option<C::Response>,
}

impl<C: Codec> TcpExchange<C> {
    /// Create an exchange with no response yet
    pub fn new(destination: SocketAddr, request: C::Request, codec: C) -> Self {
        Self {
            destination,
            request,
            codec,
            response: None,
        }
    }

    /// Whether a response was accepted
    pub fn is_answered(&self) -> bool {
        self.response.is_some()
    }
}

/// Drives TCP exchanges through a TCP gateway
#[derive(Debug, Clone)]
pub struct TcpOrchestrator {
    gateway: Bus<TcpRequest>,
    provisioning_timeout: Duration,
    max_per_authority: usize,
}

impl TcpOrchestrator {
    /// Use `gateway` with at most `max_per_authority` concurrent connections
    /// to any one destination
    pub fn new(
        gateway: Bus<TcpRequest>,
        provisioning_timeout: Duration,
        max_per_authority: usize,
    ) -> Self {
        Self {
            gateway,
            provisioning_timeout,
            max_per_authority: max_per_authority.max(1),
        }
    }

    /// Use `gateway` with limits taken from `config`
    pub fn from_config(gateway: Bus<TcpRequest>, config: &Config) -> Self {
        Self::new(
            gateway,
            config.provisioning_timeout(),
            config.tcp_max_connections_per_authority,
        )
    }

    /// Run every exchange through `schedule` and return them with responses
    pub async fn run<C: Codec>(
        &self,
        mut exchanges: Vec<TcpExchange<C>>,
        schedule: &AttemptSchedule,
    ) -> Vec<TcpExchange<C>> {
        let (listener, mut events) = bus::channel();
        let payloads: Vec<Bytes> = exchanges
            .iter()
            .map(|exchange| exchange.codec.encode(&exchange.request))
            .collect();

        for (round, wait) in schedule.iter().enumerate() {
            let mut state = RoundState::default();
            for (index, exchange) in exchanges.iter().enumerate() {
                if exchange.is_answered() {
                    continue;
                }
                if exchange.destination.ip().is_unspecified() {
                    trace!(
                        "Skipping exchange to unspecified destination {}",
                        exchange.destination
                    );
                    continue;
                }
                state
                    .queues
                    .entry(exchange.destination)
                    .or_default()
                    .push_back(index);
            }
            if state.queues.is_empty() {
                break;
            }

            let deadline = Instant::now() + *wait;
            debug!(
                "Round {}/{}: {} authorities, waiting {:?}",
                round + 1,
                schedule.len(),
                state.queues.len(),
                wait
            );

            let authorities: Vec<SocketAddr> = state.queues.keys().copied().collect();
            for authority in authorities {
                self.fill(&mut state, authority, &payloads, &listener, deadline)
                    .await;
            }

            self.collect(&mut state, &mut exchanges, &mut events, &payloads, &listener, deadline)
                .await;

            for (id, flight) in state.in_flight.drain() {
                trace!("Abandoning connection {} to {}", id, flight.authority);
                let _ = self.gateway.send(TcpRequest::Close { id });
            }

            let unanswered = exchanges.iter().any(|e| !e.is_answered());
            if unanswered && round + 1 < schedule.len() {
                tokio::time::sleep_until(deadline).await;
            }
        }

        let answered = exchanges.iter().filter(|e| e.is_answered()).count();
        info!(
            "TCP orchestration finished: {}/{} exchanges answered",
            answered,
            exchanges.len()
        );
        exchanges
    }

    /// Handle connection events until nothing is in flight or the round ends
    async fn collect<C: Codec>(
        &self,
        state: &mut RoundState,
        exchanges: &mut [TcpExchange<C>],
        events: &mut Inbox<TcpEvent>,
        payloads: &[Bytes],
        listener: &Bus<TcpEvent>,
        deadline: Instant,
    ) {
        while !state.in_flight.is_empty() {
            let Some(event) = events.recv_until(deadline).await else {
                break;
            };

            let (id, outcome) = match event {
                TcpEvent::Connected { id, local_addr } => {
                    trace!("Connection {} open from {}", id, local_addr);
                    continue;
                }
                TcpEvent::Read { id, bytes } => {
                    if let Some(flight) = state.in_flight.get_mut(&id) {
                        flight.body.extend_from_slice(&bytes);
                    }
                    continue;
                }
                TcpEvent::Eof { id } => (id, None),
                TcpEvent::Error { id, error } => (id, Some(error)),
            };

            // Events for connections abandoned in an earlier round.
            let Some(flight) = state.in_flight.remove(&id) else {
                continue;
            };
            let _ = self.gateway.send(TcpRequest::Close { id });
            state.release(flight.authority);

            if let Some(error) = &outcome {
                debug!(
                    "Connection to {} ended with error after {} bytes: {}",
                    flight.authority,
                    flight.body.len(),
                    error
                );
            }

            // A peer may reset right after a complete response.
            let exchange = &mut exchanges[flight.index];
            if flight.body.is_empty() {
                debug!("No response from {}", flight.authority);
            } else {
                match exchange.codec.decode(&flight.body) {
                    Decoded::Matched(response) => exchange.response = Some(response),
                    Decoded::Rejected => debug!(
                        "Response from {} rejected ({} bytes)",
                        flight.authority,
                        flight.body.len()
                    ),
                }
            }

            self.fill(state, flight.authority, payloads, listener, deadline)
                .await;
        }
    }

    /// Open connections for queued requests up to the per-authority cap
    async fn fill(
        &self,
        state: &mut RoundState,
        authority: SocketAddr,
        payloads: &[Bytes],
        listener: &Bus<TcpEvent>,
        deadline: Instant,
    ) {
        while state.open(authority) < self.max_per_authority && Instant::now() < deadline {
            let Some(index) = state.queues.get_mut(&authority).and_then(VecDeque::pop_front) else {
                return;
            };

            let timeout = self
                .provisioning_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let id = match self
                .gateway
                .call(|reply| TcpRequest::GetNextId { reply }, timeout)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warn!("No connection id for {}: {}", authority, e);
                    continue;
                }
            };

            let connect = TcpRequest::Connect {
                id,
                destination: authority,
                listener: listener.clone(),
            };
            let write = TcpRequest::Write {
                id,
                payload: payloads[index].clone(),
            };
            if let Err(e) = self.gateway.send(connect).and_then(|_| self.gateway.send(write)) {
                warn!("Could not open connection to {}: {}", authority, e);
                continue;
            }

            state.in_flight.insert(
                id,
                InFlight {
                    index,
                    authority,
                    body: BytesMut::new(),
                },
            );
            *state.open_per_authority.entry(authority).or_default() += 1;
        }
    }
}

/// A request whose connection has been asked for
#[derive(Debug)]
struct InFlight {
    index: usize,
    authority: SocketAddr,
    body: BytesMut,
}

#[derive(Debug, Default)]
struct RoundState {
    queues: HashMap<SocketAddr, VecDeque<usize>>,
    in_flight: HashMap<ResourceId, InFlight>,
    open_per_authority: HashMap<SocketAddr, usize>,
}

impl RoundState {
    fn open(&self, authority: SocketAddr) -> usize {
        self.open_per_authority.get(&authority).copied().unwrap_or(0)
    }

    fn release(&mut self, authority: SocketAddr) {
        if let Some(open) = self.open_per_authority.get_mut(&authority) {
            *open = open.saturating_sub(1);
        }
    }
}
