//! TCP gateway
//!
//! Outbound connections for request/response exchanges over TCP (UPnP SOAP
//! control requests and similar). Each connection is its own task; the
//! gateway worker only owns the registry. Writes posted before the
//! connection completes are buffered and flushed once it does.

use super::{IdAllocator, ResourceId};
use crate::bus::{self, Bus, Inbox};
use crate::config::Config;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Requests accepted by the TCP gateway
#[derive(Debug)]
pub enum TcpRequest {
    /// Allocate a fresh resource id
    GetNextId {
        /// Where to send the id
        reply: Bus<ResourceId>,
    },
    /// Open a connection registered under `id`
    Connect {
        /// Id obtained from `GetNextId`
        id: ResourceId,
        /// Remote address
        destination: SocketAddr,
        /// Receiver of this connection's notifications
        listener: Bus<TcpEvent>,
    },
    /// Queue bytes for sending on connection `id`
    Write {
        /// Connection id
        id: ResourceId,
        /// Bytes to send
        payload: Bytes,
    },
    /// Drop connection `id`; its socket is closed before the next request is handled
    Close {
        /// Connection id
        id: ResourceId,
    },
    /// Drop every connection and stop the worker
    Shutdown,
}

/// Notifications posted by the TCP gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpEvent {
    /// Connection established
    Connected {
        /// Connection id
        id: ResourceId,
        /// Local end of the connection
        local_addr: SocketAddr,
    },
    /// Bytes received
    Read {
        /// Connection id
        id: ResourceId,
        /// Bytes exactly as read
        bytes: Bytes,
    },
    /// Peer closed its side
    Eof {
        /// Connection id
        id: ResourceId,
    },
    /// Connect, read or write failed; the connection is finished
    Error {
        /// Connection id
        id: ResourceId,
        /// Description of the failure
        error: String,
    },
}

impl TcpEvent {
    /// Connection this notification is about
    pub fn id(&self) -> ResourceId {
        match self {
            TcpEvent::Connected { id, .. }
            | TcpEvent::Read { id, .. }
            | TcpEvent::Eof { id }
            | TcpEvent::Error { id, .. } => *id,
        }
    }
}

/// Handle to a running TCP gateway worker
#[derive(Debug)]
pub struct TcpGateway {
    bus: Bus<TcpRequest>,
    worker: JoinHandle<()>,
}

impl TcpGateway {
    /// Spawn the worker task
    pub fn spawn(config: &Config) -> Self {
        let (bus, inbox) = bus::channel();
        let worker = tokio::spawn(TcpWorker::new(inbox, config.read_chunk_size).run());
        Self { bus, worker }
    }

    /// Inbox handle for posting requests
    pub fn bus(&self) -> Bus<TcpRequest> {
        self.bus.clone()
    }

    /// Allocate a resource id
    pub async fn next_id(&self, timeout: Duration) -> Result<ResourceId> {
        self.bus
            .call(|reply| TcpRequest::GetNextId { reply }, timeout)
            .await
    }

    /// Stop the worker, dropping every open connection
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.bus.send(TcpRequest::Shutdown);
        self.worker
            .await
            .map_err(|e| Error::Gateway(format!("TCP worker failed: {}", e)))
    }
}

struct ConnectionRecord {
    writes: Bus<Bytes>,
    task: JoinHandle<()>,
}

struct TcpWorker {
    inbox: Inbox<TcpRequest>,
    ids: IdAllocator,
    connections: HashMap<ResourceId, ConnectionRecord>,
    finished_bus: Bus<ResourceId>,
    finished: Inbox<ResourceId>,
    read_chunk_size: usize,
}

impl TcpWorker {
    fn new(inbox: Inbox<TcpRequest>, read_chunk_size: usize) -> Self {
        let (finished_bus, finished) = bus::channel();
        Self {
            inbox,
            ids: IdAllocator::default(),
            connections: HashMap::new(),
            finished_bus,
            finished,
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    async fn run(mut self) {
        info!("TCP gateway started");

        loop {
            tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => {
                        if self.apply(request).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(id) = self.finished.recv() => {
                    if self.connections.remove(&id).is_some() {
                        trace!("Connection {} finished", id);
                    }
                }
            }
        }

        let open = self.connections.len();
        for (_, record) in self.connections.drain() {
            record.task.abort();
        }
        info!("TCP gateway stopped ({} connections dropped)", open);
    }

    async fn apply(&mut self, request: TcpRequest) -> ControlFlow<()> {
        match request {
            TcpRequest::GetNextId { reply } => {
                let id = self.ids.next_id();
                if reply.send(id).is_err() {
                    debug!("Caller went away before receiving id {}", id);
                }
            }
            TcpRequest::Connect {
                id,
                destination,
                listener,
            } => {
                if self.connections.contains_key(&id) {
                    let _ = listener.send(TcpEvent::Error {
                        id,
                        error: format!("connection {} already exists", id),
                    });
                    return ControlFlow::Continue(());
                }

                let (writes, pending_writes) = bus::channel();
                let task = tokio::spawn(run_connection(
                    id,
                    destination,
                    listener,
                    pending_writes,
                    self.finished_bus.clone(),
                    self.read_chunk_size,
                ));
                self.connections.insert(id, ConnectionRecord { writes, task });
            }
            TcpRequest::Write { id, payload } => match self.connections.get(&id) {
                Some(record) => {
                    // Fails only if the connection task already ended.
                    let _ = record.writes.send(payload);
                }
                None => debug!("Write to unknown connection {} ignored", id),
            },
            TcpRequest::Close { id } => {
                if let Some(record) = self.connections.remove(&id) {
                    // The socket is gone before any later request is handled.
                    record.task.abort();
                    let _ = record.task.await;
                    debug!("Closed connection {}", id);
                }
            }
            TcpRequest::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

async fn run_connection(
    id: ResourceId,
    destination: SocketAddr,
    listener: Bus<TcpEvent>,
    writes: Inbox<Bytes>,
    finished: Bus<ResourceId>,
    read_chunk_size: usize,
) {
    let event = drive_connection(id, destination, &listener, writes, read_chunk_size).await;
    let _ = listener.send(event);
    let _ = finished.send(id);
}

/// Pump one connection until EOF or failure; returns the terminal event
async fn drive_connection(
    id: ResourceId,
    destination: SocketAddr,
    listener: &Bus<TcpEvent>,
    mut writes: Inbox<Bytes>,
    read_chunk_size: usize,
) -> TcpEvent {
    let stream = match TcpStream::connect(destination).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Connection {} to {} failed: {}", id, destination, e);
            return TcpEvent::Error {
                id,
                error: format!("connect to {} failed: {}", destination, e),
            };
        }
    };

    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            return TcpEvent::Error {
                id,
                error: format!("local address unavailable: {}", e),
            };
        }
    };
    debug!("Connection {} established {} -> {}", id, local_addr, destination);
    let _ = listener.send(TcpEvent::Connected { id, local_addr });

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; read_chunk_size];
    let mut writes_open = true;

    loop {
        tokio::select! {
            chunk = writes.recv(), if writes_open => match chunk {
                Some(chunk) => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        return TcpEvent::Error {
                            id,
                            error: format!("write failed: {}", e),
                        };
                    }
                    trace!("Connection {} sent {} bytes", id, chunk.len());
                }
                None => writes_open = false,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => return TcpEvent::Eof { id },
                Ok(n) => {
                    let _ = listener.send(TcpEvent::Read {
                        id,
                        bytes: Bytes::copy_from_slice(&buf[..n]),
                    });
                }
                Err(e) => {
                    return TcpEvent::Error {
                        id,
                        error: format!("read failed: {}", e),
                    };
                }
            },
        }
    }
}
