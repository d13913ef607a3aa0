//! UDP gateway
//!
//! One worker task hosts any number of independently bound UDP sockets. Each
//! loop iteration drains the inbox, then waits until some socket is readable,
//! some socket with queued datagrams is writable, or a new request arrives.
//! A readable socket yields one datagram per iteration and a writable socket
//! sends one queued datagram, so a single slow destination never stalls the
//! rest.
//!
//! Binding to the unspecified address is refused: sends from a wildcard
//! socket fail ambiguously for multicast and any-address destinations.

use super::{IdAllocator, ResourceId};
use crate::bus::{self, Bus, Inbox, TryRecv};
use crate::config::Config;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Requests accepted by the UDP gateway
#[derive(Debug)]
pub enum UdpRequest {
    /// Allocate a fresh resource id
    GetNextId {
        /// Where to send the id
        reply: Bus<ResourceId>,
    },
    /// Bind a socket and register it under `id`
    ///
    /// Answered on `listener` with [`UdpEvent::Created`] or [`UdpEvent::Error`].
    /// Every later datagram received on the socket goes to `listener` too.
    CreateSocket {
        /// Id obtained from `GetNextId`
        id: ResourceId,
        /// Local address to bind; must not be unspecified
        source: SocketAddr,
        /// Receiver of this socket's notifications
        listener: Bus<UdpEvent>,
    },
    /// Queue a datagram on socket `id`
    Write {
        /// Socket to send from
        id: ResourceId,
        /// Peer address
        destination: SocketAddr,
        /// Datagram contents
        payload: Bytes,
    },
    /// Deregister and close socket `id`, discarding queued datagrams
    Close {
        /// Socket to close
        id: ResourceId,
    },
    /// List non-loopback, non-unspecified interface addresses
    GetLocalIpAddresses {
        /// Where to send the addresses
        reply: Bus<Vec<IpAddr>>,
    },
    /// Close every socket and stop the worker
    Shutdown,
}

/// Notifications posted by the UDP gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpEvent {
    /// Socket bound and registered
    Created {
        /// Socket id
        id: ResourceId,
        /// Address the OS actually bound
        local_addr: SocketAddr,
    },
    /// Datagram received
    Read {
        /// Socket id
        id: ResourceId,
        /// Peer that sent the datagram
        sender: SocketAddr,
        /// Datagram contents
        payload: Bytes,
    },
    /// Creation, send or receive failed on this socket only
    Error {
        /// Socket id
        id: ResourceId,
        /// Description of the failure
        error: String,
    },
}

impl UdpEvent {
    /// Socket this notification is about
    pub fn id(&self) -> ResourceId {
        match self {
            UdpEvent::Created { id, .. } | UdpEvent::Read { id, .. } | UdpEvent::Error { id, .. } => {
                *id
            }
        }
    }
}

/// Handle to a running UDP gateway worker
#[derive(Debug)]
pub struct UdpGateway {
    bus: Bus<UdpRequest>,
    worker: JoinHandle<()>,
}

impl UdpGateway {
    /// Spawn the worker task
    pub fn spawn(config: &Config) -> Self {
        let (bus, inbox) = bus::channel();
        let worker = tokio::spawn(UdpWorker::new(inbox, config.max_datagram_size).run());
        Self { bus, worker }
    }

    /// Inbox handle for posting requests
    pub fn bus(&self) -> Bus<UdpRequest> {
        self.bus.clone()
    }

    /// Allocate a resource id
    pub async fn next_id(&self, timeout: Duration) -> Result<ResourceId> {
        self.bus
            .call(|reply| UdpRequest::GetNextId { reply }, timeout)
            .await
    }

    /// Local interface addresses as seen by the gateway
    pub async fn local_ip_addresses(&self, timeout: Duration) -> Result<Vec<IpAddr>> {
        self.bus
            .call(|reply| UdpRequest::GetLocalIpAddresses { reply }, timeout)
            .await
    }

    /// Stop the worker and wait for it to close its sockets
    pub async fn shutdown(self) -> Result<()> {
        // The worker may already be gone if every bus handle was dropped.
        let _ = self.bus.send(UdpRequest::Shutdown);
        self.worker
            .await
            .map_err(|e| Error::Gateway(format!("UDP worker failed: {}", e)))
    }
}

/// Registry entry for one socket
struct SocketEntry {
    socket: UdpSocket,
    outbound: VecDeque<(SocketAddr, Bytes)>,
    listener: Bus<UdpEvent>,
}

/// Something the multiplexer wait produced
enum Readiness {
    Request(UdpRequest),
    InboxClosed,
    Datagram {
        id: ResourceId,
        sender: SocketAddr,
        payload: Bytes,
    },
    ReceiveFailed {
        id: ResourceId,
        error: io::Error,
    },
    Sent {
        id: ResourceId,
        destination: SocketAddr,
        result: io::Result<usize>,
    },
}

struct UdpWorker {
    inbox: Inbox<UdpRequest>,
    ids: IdAllocator,
    sockets: HashMap<ResourceId, SocketEntry>,
    scratch: Vec<u8>,
}

impl UdpWorker {
    fn new(inbox: Inbox<UdpRequest>, max_datagram_size: usize) -> Self {
        Self {
            inbox,
            ids: IdAllocator::default(),
            sockets: HashMap::new(),
            scratch: vec![0u8; max_datagram_size.max(1)],
        }
    }

    async fn run(mut self) {
        info!("UDP gateway started");

        'worker: loop {
            loop {
                match self.inbox.try_recv() {
                    TryRecv::Message(request) => {
                        if self.apply(request).is_break() {
                            break 'worker;
                        }
                    }
                    TryRecv::Empty => break,
                    TryRecv::Closed => break 'worker,
                }
            }

            let ready = poll_fn(|cx| self.poll_ready(cx)).await;

            for readiness in ready {
                if self.dispatch(readiness).is_break() {
                    break 'worker;
                }
            }
        }

        let open = self.sockets.len();
        self.sockets.clear();
        info!("UDP gateway stopped ({} sockets closed)", open);
    }

    /// Wait for the inbox or any registered socket
    ///
    /// Every socket is polled for reads; sockets with a non-empty queue are
    /// also polled for writes. All polls register the same waker, so a new
    /// inbox message interrupts the wait.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<Readiness>> {
        let mut ready = Vec::new();

        match self.inbox.poll_recv(cx) {
            Poll::Ready(Some(request)) => ready.push(Readiness::Request(request)),
            Poll::Ready(None) => ready.push(Readiness::InboxClosed),
            Poll::Pending => {}
        }

        for (&id, entry) in self.sockets.iter_mut() {
            let mut buf = ReadBuf::new(&mut self.scratch);
            match entry.socket.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(sender)) => ready.push(Readiness::Datagram {
                    id,
                    sender,
                    payload: Bytes::copy_from_slice(buf.filled()),
                }),
                Poll::Ready(Err(error)) => ready.push(Readiness::ReceiveFailed { id, error }),
                Poll::Pending => {}
            }

            let sent = match entry.outbound.front() {
                Some((destination, payload)) => {
                    match entry.socket.poll_send_to(cx, payload, *destination) {
                        Poll::Ready(result) => Some((*destination, result)),
                        Poll::Pending => None,
                    }
                }
                None => None,
            };
            if let Some((destination, result)) = sent {
                entry.outbound.pop_front();
                ready.push(Readiness::Sent {
                    id,
                    destination,
                    result,
                });
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    fn dispatch(&mut self, readiness: Readiness) -> ControlFlow<()> {
        match readiness {
            Readiness::Request(request) => return self.apply(request),
            Readiness::InboxClosed => return ControlFlow::Break(()),
            Readiness::Datagram {
                id,
                sender,
                payload,
            } => {
                // Closed earlier in this batch.
                let Some(entry) = self.sockets.get(&id) else {
                    return ControlFlow::Continue(());
                };
                trace!(
                    "Socket {} received {} bytes from {}: {}",
                    id,
                    payload.len(),
                    sender,
                    hex::encode(&payload)
                );
                notify(
                    &entry.listener,
                    UdpEvent::Read {
                        id,
                        sender,
                        payload,
                    },
                );
            }
            Readiness::ReceiveFailed { id, error } => {
                if let Some(entry) = self.sockets.get(&id) {
                    debug!("Receive failed on socket {}: {}", id, error);
                    notify(
                        &entry.listener,
                        UdpEvent::Error {
                            id,
                            error: format!("receive failed: {}", error),
                        },
                    );
                }
            }
            Readiness::Sent {
                id,
                destination,
                result,
            } => match result {
                Ok(len) => trace!("Socket {} sent {} bytes to {}", id, len, destination),
                Err(error) => {
                    warn!(
                        "Dropping datagram from socket {} to {}: {}",
                        id, destination, error
                    );
                    if let Some(entry) = self.sockets.get(&id) {
                        notify(
                            &entry.listener,
                            UdpEvent::Error {
                                id,
                                error: format!("send to {} failed: {}", destination, error),
                            },
                        );
                    }
                }
            },
        }
        ControlFlow::Continue(())
    }

    fn apply(&mut self, request: UdpRequest) -> ControlFlow<()> {
        match request {
            UdpRequest::GetNextId { reply } => {
                let id = self.ids.next_id();
                if reply.send(id).is_err() {
                    debug!("Caller went away before receiving id {}", id);
                }
            }
            UdpRequest::CreateSocket {
                id,
                source,
                listener,
            } => {
                if self.sockets.contains_key(&id) {
                    notify(
                        &listener,
                        UdpEvent::Error {
                            id,
                            error: format!("socket {} already exists", id),
                        },
                    );
                    return ControlFlow::Continue(());
                }

                match bind_socket(source) {
                    Ok(socket) => {
                        let local_addr = socket.local_addr().unwrap_or(source);
                        debug!("Created socket {} bound to {}", id, local_addr);
                        notify(&listener, UdpEvent::Created { id, local_addr });
                        self.sockets.insert(
                            id,
                            SocketEntry {
                                socket,
                                outbound: VecDeque::new(),
                                listener,
                            },
                        );
                    }
                    Err(e) => {
                        warn!("Failed to create socket {} on {}: {}", id, source, e);
                        notify(
                            &listener,
                            UdpEvent::Error {
                                id,
                                error: format!("bind {} failed: {}", source, e),
                            },
                        );
                    }
                }
            }
            UdpRequest::Write {
                id,
                destination,
                payload,
            } => match self.sockets.get_mut(&id) {
                Some(entry) => entry.outbound.push_back((destination, payload)),
                None => warn!("Write to unknown socket {} ignored", id),
            },
            UdpRequest::Close { id } => match self.sockets.remove(&id) {
                Some(entry) => debug!(
                    "Closed socket {} ({} queued datagrams discarded)",
                    id,
                    entry.outbound.len()
                ),
                None => debug!("Close of unknown socket {} ignored", id),
            },
            UdpRequest::GetLocalIpAddresses { reply } => {
                let _ = reply.send(local_ip_addresses());
            }
            UdpRequest::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

/// Post a notification; a vanished listener is not the gateway's problem
fn notify(listener: &Bus<UdpEvent>, event: UdpEvent) {
    if listener.send(event).is_err() {
        debug!("Listener dropped, notification discarded");
    }
}

fn bind_socket(source: SocketAddr) -> io::Result<UdpSocket> {
    if source.ip().is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "binding to the unspecified address is not allowed",
        ));
    }

    let socket = std::net::UdpSocket::bind(source)?;
    socket.set_nonblocking(true)?;
    if source.is_ipv4() {
        // Needed for discovery sends to 255.255.255.255; harmless otherwise.
        if let Err(e) = socket.set_broadcast(true) {
            debug!("Could not enable broadcast on {}: {}", source, e);
        }
    }
    UdpSocket::from_std(socket)
}

/// Non-loopback, non-unspecified addresses of this host's interfaces
pub fn local_ip_addresses() -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = Vec::new();
    for interface in netdev::get_interfaces() {
        addresses.extend(interface.ipv4.iter().map(|net| IpAddr::V4(net.addr())));
        addresses.extend(interface.ipv6.iter().map(|net| IpAddr::V6(net.addr())));
    }
    addresses.retain(|ip| !ip.is_loopback() && !ip.is_unspecified());
    addresses.sort();
    addresses.dedup();
    addresses
}
