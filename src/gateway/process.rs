//! Process gateway
//!
//! Runs external commands and streams their I/O back over the bus. Each
//! process gets four tasks:
//! - a reader per output stream, posting exactly the bytes of each read
//! - a writer owning a private inbox of stdin chunks
//! - a monitor that waits for exit, joins both readers, and only then posts
//!   [`ProcessEvent::Terminated`]
//!
//! Joining the readers first means a consumer never sees `Terminated` before
//! the output that preceded it.

use super::{IdAllocator, ResourceId};
use crate::bus::{self, Bus, Inbox, TryRecv};
use crate::config::Config;
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Which output stream a read came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamTag {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTag::Stdout => f.write_str("stdout"),
            StreamTag::Stderr => f.write_str("stderr"),
        }
    }
}

/// Requests accepted by the process gateway
#[derive(Debug)]
pub enum ProcessRequest {
    /// Allocate a fresh resource id
    GetNextId {
        /// Where to send the id
        reply: Bus<ResourceId>,
    },
    /// Launch `command` with `args` under `id`
    ///
    /// Answered on `listener` with [`ProcessEvent::Started`] or
    /// [`ProcessEvent::Error`]; all later notifications go there too.
    Create {
        /// Id obtained from `GetNextId`
        id: ResourceId,
        /// Program to run
        command: String,
        /// Arguments, passed through untouched
        args: Vec<String>,
        /// Receiver of this process's notifications
        listener: Bus<ProcessEvent>,
    },
    /// Queue bytes for the process's stdin
    WriteStdin {
        /// Process id
        id: ResourceId,
        /// Bytes to write
        bytes: Bytes,
    },
    /// Close stdin once queued chunks are written
    CloseStdin {
        /// Process id
        id: ResourceId,
    },
    /// Tear the process down, killing it if still running
    Close {
        /// Process id
        id: ResourceId,
    },
    /// Kill every process and stop the worker
    Shutdown,
}

/// Notifications posted by the process gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Process launched
    Started {
        /// Process id
        id: ResourceId,
        /// OS process id, if still known
        pid: Option<u32>,
    },
    /// Bytes read from stdout or stderr
    Read {
        /// Process id
        id: ResourceId,
        /// Stream the bytes came from
        stream: StreamTag,
        /// Bytes exactly as read
        bytes: Bytes,
    },
    /// The stdin writer has nothing queued
    WriteQueueEmpty {
        /// Process id
        id: ResourceId,
    },
    /// Process ended and all of its output has been delivered
    Terminated {
        /// Process id
        id: ResourceId,
        /// OS exit code; `None` when killed by cancellation
        exit_code: Option<i32>,
    },
    /// Launch or stdin write failed
    Error {
        /// Process id
        id: ResourceId,
        /// Description of the failure
        error: String,
    },
}

impl ProcessEvent {
    /// Process this notification is about
    pub fn id(&self) -> ResourceId {
        match self {
            ProcessEvent::Started { id, .. }
            | ProcessEvent::Read { id, .. }
            | ProcessEvent::WriteQueueEmpty { id }
            | ProcessEvent::Terminated { id, .. }
            | ProcessEvent::Error { id, .. } => *id,
        }
    }
}

/// Handle to a running process gateway worker
#[derive(Debug)]
pub struct ProcessGateway {
    bus: Bus<ProcessRequest>,
    worker: JoinHandle<()>,
}

impl ProcessGateway {
    /// Spawn the worker task
    pub fn spawn(config: &Config) -> Self {
        let (bus, inbox) = bus::channel();
        let worker = ProcessWorker::new(inbox, config.read_chunk_size, config.reader_join_timeout());
        let worker = tokio::spawn(worker.run());
        Self { bus, worker }
    }

    /// Inbox handle for posting requests
    pub fn bus(&self) -> Bus<ProcessRequest> {
        self.bus.clone()
    }

    /// Allocate a resource id
    pub async fn next_id(&self, timeout: Duration) -> Result<ResourceId> {
        self.bus
            .call(|reply| ProcessRequest::GetNextId { reply }, timeout)
            .await
    }

    /// Allocate an id and launch `command`, reporting to `listener`
    pub async fn launch(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
        listener: Bus<ProcessEvent>,
        timeout: Duration,
    ) -> Result<ResourceId> {
        let id = self.next_id(timeout).await?;
        self.bus.send(ProcessRequest::Create {
            id,
            command: command.into(),
            args,
            listener,
        })?;
        Ok(id)
    }

    /// Kill every process and wait for the worker to stop
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.bus.send(ProcessRequest::Shutdown);
        self.worker
            .await
            .map_err(|e| Error::Gateway(format!("Process worker failed: {}", e)))
    }
}

enum WriterCommand {
    Chunk(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Terminated { exit_code: Option<i32> },
}

struct ProcessRecord {
    listener: Bus<ProcessEvent>,
    writer: Option<Bus<WriterCommand>>,
    cancel: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
    state: ProcessState,
}

/// Posted by a monitor once its process is fully torn down
struct Exited {
    id: ResourceId,
    exit_code: Option<i32>,
}

struct ProcessWorker {
    inbox: Inbox<ProcessRequest>,
    ids: IdAllocator,
    processes: HashMap<ResourceId, ProcessRecord>,
    exits_bus: Bus<Exited>,
    exits: Inbox<Exited>,
    read_chunk_size: usize,
    reader_join_timeout: Duration,
}

impl ProcessWorker {
    fn new(inbox: Inbox<ProcessRequest>, read_chunk_size: usize, reader_join_timeout: Duration) -> Self {
        let (exits_bus, exits) = bus::channel();
        Self {
            inbox,
            ids: IdAllocator::default(),
            processes: HashMap::new(),
            exits_bus,
            exits,
            read_chunk_size: read_chunk_size.max(1),
            reader_join_timeout,
        }
    }

    async fn run(mut self) {
        info!("Process gateway started");

        loop {
            tokio::select! {
                biased;
                Some(exited) = self.exits.recv() => self.reap(exited),
                request = self.inbox.recv() => match request {
                    Some(request) => {
                        if self.apply(request).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.shutdown().await;
    }

    fn apply(&mut self, request: ProcessRequest) -> ControlFlow<()> {
        match request {
            ProcessRequest::GetNextId { reply } => {
                let id = self.ids.next_id();
                if reply.send(id).is_err() {
                    debug!("Caller went away before receiving id {}", id);
                }
            }
            ProcessRequest::Create {
                id,
                command,
                args,
                listener,
            } => self.create(id, command, args, listener),
            ProcessRequest::WriteStdin { id, bytes } => {
                self.forward(id, WriterCommand::Chunk(bytes));
            }
            ProcessRequest::CloseStdin { id } => {
                self.forward(id, WriterCommand::Close);
            }
            ProcessRequest::Close { id } => match self.processes.remove(&id) {
                Some(mut record) => {
                    if let Some(cancel) = record.cancel.take() {
                        debug!("Cancelling process {}", id);
                        let _ = cancel.send(());
                    }
                }
                None => debug!("Close of unknown process {} ignored", id),
            },
            ProcessRequest::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn create(&mut self, id: ResourceId, command: String, args: Vec<String>, listener: Bus<ProcessEvent>) {
        if self.processes.contains_key(&id) {
            let _ = listener.send(ProcessEvent::Error {
                id,
                error: format!("process {} already exists", id),
            });
            return;
        }

        let spawned = Command::new(&command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch process {} ({}): {}", id, command, e);
                let _ = listener.send(ProcessEvent::Error {
                    id,
                    error: format!("failed to launch {}: {}", command, e),
                });
                return;
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            // Unreachable with piped stdio; the child is killed on drop.
            let _ = listener.send(ProcessEvent::Error {
                id,
                error: "process stdio unavailable".to_string(),
            });
            return;
        };

        let pid = child.id();
        info!("Launched process {} ({} {:?}, pid {:?})", id, command, args, pid);
        let _ = listener.send(ProcessEvent::Started { id, pid });

        let readers = [
            tokio::spawn(read_stream(
                id,
                StreamTag::Stdout,
                stdout,
                listener.clone(),
                self.read_chunk_size,
            )),
            tokio::spawn(read_stream(
                id,
                StreamTag::Stderr,
                stderr,
                listener.clone(),
                self.read_chunk_size,
            )),
        ];

        let (writer, writer_inbox) = bus::channel();
        tokio::spawn(write_stdin(id, stdin, writer_inbox, listener.clone()));

        let (cancel, cancelled) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            id,
            child,
            readers,
            cancelled,
            listener.clone(),
            self.exits_bus.clone(),
            self.reader_join_timeout,
        ));

        self.processes.insert(
            id,
            ProcessRecord {
                listener,
                writer: Some(writer),
                cancel: Some(cancel),
                monitor,
                state: ProcessState::Running,
            },
        );
    }

    fn forward(&mut self, id: ResourceId, command: WriterCommand) {
        let Some(record) = self.processes.get(&id) else {
            warn!("Stdin request for unknown process {} ignored", id);
            return;
        };

        let error = match (&record.state, &record.writer) {
            (ProcessState::Running, Some(writer)) => match writer.send(command) {
                Ok(()) => return,
                Err(_) => "stdin is closed".to_string(),
            },
            (ProcessState::Running, None) => "stdin is closed".to_string(),
            (ProcessState::Terminated { exit_code }, _) => {
                format!("stdin is closed: process exited with {:?}", exit_code)
            }
        };
        let _ = record.listener.send(ProcessEvent::Error { id, error });
    }

    fn reap(&mut self, exited: Exited) {
        // Records stay until Close so late stdin writes get a clear error.
        if let Some(record) = self.processes.get_mut(&exited.id) {
            record.state = ProcessState::Terminated {
                exit_code: exited.exit_code,
            };
            record.writer = None;
            record.cancel = None;
            debug!("Process {} exited with {:?}", exited.id, exited.exit_code);
        }
    }

    async fn shutdown(&mut self) {
        let count = self.processes.len();
        let mut monitors = Vec::with_capacity(count);
        for (_, mut record) in self.processes.drain() {
            if let Some(cancel) = record.cancel.take() {
                let _ = cancel.send(());
            }
            monitors.push(record.monitor);
        }
        for monitor in monitors {
            let _ = monitor.await;
        }
        info!("Process gateway stopped ({} processes torn down)", count);
    }
}

/// Forward every read as-is; stop silently at end-of-stream
async fn read_stream<R>(
    id: ResourceId,
    stream: StreamTag,
    mut source: R,
    listener: Bus<ProcessEvent>,
    chunk_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!("Process {} {} produced {} bytes", id, stream, n);
                // Keep draining even without a listener so the child never
                // blocks on a full pipe.
                let _ = listener.send(ProcessEvent::Read {
                    id,
                    stream,
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                });
            }
            Err(e) => {
                debug!("Process {} {} read failed: {}", id, stream, e);
                break;
            }
        }
    }
    drop(source);
    trace!("Process {} {} reached end of stream", id, stream);
}

async fn write_stdin(
    id: ResourceId,
    mut stdin: ChildStdin,
    mut commands: Inbox<WriterCommand>,
    listener: Bus<ProcessEvent>,
) {
    loop {
        let command = match commands.try_recv() {
            TryRecv::Message(command) => command,
            TryRecv::Empty => {
                let _ = listener.send(ProcessEvent::WriteQueueEmpty { id });
                match commands.recv().await {
                    Some(command) => command,
                    None => break,
                }
            }
            TryRecv::Closed => break,
        };

        match command {
            WriterCommand::Chunk(bytes) => {
                let written = match stdin.write_all(&bytes).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    debug!("Process {} stdin write failed: {}", id, e);
                    let _ = listener.send(ProcessEvent::Error {
                        id,
                        error: format!("stdin write failed: {}", e),
                    });
                    break;
                }
            }
            WriterCommand::Close => break,
        }
    }
    trace!("Process {} stdin closed", id);
}

async fn monitor(
    id: ResourceId,
    mut child: Child,
    mut readers: [JoinHandle<()>; 2],
    mut cancelled: oneshot::Receiver<()>,
    listener: Bus<ProcessEvent>,
    exits: Bus<Exited>,
    reader_join_timeout: Duration,
) {
    // A dropped sender means the gateway is gone: tear down as well.
    let exit_code = tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Waiting on process {} failed: {}", id, e);
                    None
                }
            };
            // Descendants may hold the output pipes open after the child exits.
            tokio::select! {
                _ = join_readers(&mut readers, None) => code,
                _ = &mut cancelled => {
                    debug!("Process {} cancelled while draining output", id);
                    join_readers(&mut readers, Some(reader_join_timeout)).await;
                    None
                }
            }
        }
        _ = &mut cancelled => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill process {}: {}", id, e);
            }
            join_readers(&mut readers, Some(reader_join_timeout)).await;
            None
        }
    };

    debug!("Process {} terminated (exit code {:?})", id, exit_code);
    // The worker records the exit before the listener can react to it.
    let _ = exits.send(Exited { id, exit_code });
    let _ = listener.send(ProcessEvent::Terminated { id, exit_code });
}

/// Wait for both readers; with a `timeout`, abort whichever is still running
async fn join_readers(readers: &mut [JoinHandle<()>; 2], timeout: Option<Duration>) {
    for reader in readers.iter_mut() {
        // Joined handles must not be polled again.
        if reader.is_finished() {
            continue;
        }
        match timeout {
            None => {
                let _ = reader.await;
            }
            Some(timeout) => {
                if tokio::time::timeout(timeout, &mut *reader).await.is_err() {
                    reader.abort();
                }
            }
        }
    }
}
