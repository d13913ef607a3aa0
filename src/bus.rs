//! Message bus
//!
//! A bus is a one-way, asynchronous, multi-producer/single-consumer channel.
//! Every stateful component owns an [`Inbox`] and hands out cloneable [`Bus`]
//! handles to it. Components never share mutable state; they post messages.
//!
//! Replies follow the request/reply-address pattern: the caller creates a
//! private bus, embeds its [`Bus`] handle in the request, and waits on the
//! matching [`Inbox`] with a deadline. [`Bus::call`] wraps that pattern.

use crate::{Error, Result};
use std::any::type_name;
use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{timeout_at, Instant};

/// Sending half of a bus
pub struct Bus<M> {
    tx: mpsc::UnboundedSender<M>,
}

/// Receiving half of a bus, owned by exactly one worker
pub struct Inbox<M> {
    rx: mpsc::UnboundedReceiver<M>,
}

/// Outcome of a non-blocking inbox read
#[derive(Debug, PartialEq, Eq)]
pub enum TryRecv<M> {
    /// A message was waiting
    Message(M),
    /// Nothing queued right now
    Empty,
    /// Every [`Bus`] handle has been dropped
    Closed,
}

/// Create a new bus and its inbox
pub fn channel<M>() -> (Bus<M>, Inbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Bus { tx }, Inbox { rx })
}

impl<M> Bus<M> {
    /// Enqueue a message for the owning worker
    ///
    /// Never blocks. Fails only when the inbox has been dropped.
    pub fn send(&self, message: M) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::BusClosed(short_type_name::<M>().to_string()))
    }

    /// Whether the owning worker has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a request carrying a private reply bus and wait for the answer
    ///
    /// The reply bus lives only for this call.
    pub async fn call<R>(
        &self,
        make_request: impl FnOnce(Bus<R>) -> M,
        timeout: Duration,
    ) -> Result<R> {
        let (reply, mut inbox) = channel();
        self.send(make_request(reply))?;
        inbox
            .recv_timeout(timeout)
            .await
            .ok_or_else(|| Error::Timeout(format!("reply to {}", short_type_name::<M>())))
    }
}

impl<M> Clone for Bus<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for Bus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("message", &short_type_name::<M>())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<M> Inbox<M> {
    /// Wait for the next message; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Wait for the next message until `deadline`
    ///
    /// Returns `None` when the deadline passes or every sender is gone.
    /// Expiry is not an error.
    pub async fn recv_until(&mut self, deadline: Instant) -> Option<M> {
        timeout_at(deadline, self.rx.recv()).await.ok().flatten()
    }

    /// Wait for the next message for at most `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<M> {
        self.recv_until(Instant::now() + timeout).await
    }

    /// Take a message if one is already queued
    pub fn try_recv(&mut self) -> TryRecv<M> {
        match self.rx.try_recv() {
            Ok(message) => TryRecv::Message(message),
            Err(TryRecvError::Empty) => TryRecv::Empty,
            Err(TryRecvError::Disconnected) => TryRecv::Closed,
        }
    }

    /// Poll for the next message, registering the task for wakeup
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<M>> {
        self.rx.poll_recv(cx)
    }
}

impl<M> fmt::Debug for Inbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("message", &short_type_name::<M>())
            .finish()
    }
}

fn short_type_name<M>() -> &'static str {
    let full = type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}
