//! Bounded command queue between the request context and the serial forwarder
//!
//! One producer role, one consumer role. A full queue makes the producer wait
//! up to the configured enqueue timeout and then fail with backpressure; an
//! empty queue parks the consumer.
//!
//! Producers that must change shared state only once a command is certain to
//! be accepted take a [`CommandSlot`] first and send through it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::command::WriteCommand;
use crate::error::{GwError, Result};

/// Create the queue. Capacity 0 is a startup error.
pub fn command_queue(
    capacity: usize,
    enqueue_timeout: Duration,
) -> Result<(CommandSender, CommandReceiver)> {
    if capacity == 0 {
        return Err(GwError::config("command queue capacity must be at least 1"));
    }
    let (tx, rx) = mpsc::channel(capacity);
    debug!(
        "Command queue created: capacity={}, enqueue_timeout={:?}",
        capacity, enqueue_timeout
    );
    Ok((
        CommandSender {
            tx,
            timeout: enqueue_timeout,
        },
        CommandReceiver { rx },
    ))
}

/// Producer half, cloned into every connection handler
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<WriteCommand>,
    timeout: Duration,
}

impl CommandSender {
    /// Wait up to the enqueue timeout for a free slot
    pub async fn reserve(&self) -> Result<CommandSlot<'_>> {
        match timeout(self.timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => Ok(CommandSlot { permit }),
            Ok(Err(_)) => Err(GwError::QueueClosed),
            Err(_) => {
                warn!("Command queue full for {:?}, rejecting write", self.timeout);
                Err(GwError::QueueBackpressure(self.timeout))
            },
        }
    }

    pub async fn enqueue(&self, command: WriteCommand) -> Result<()> {
        self.reserve().await?.send(command);
        Ok(())
    }

    /// Commands currently waiting
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// A reserved queue position; sending through it cannot fail
pub struct CommandSlot<'a> {
    permit: mpsc::Permit<'a, WriteCommand>,
}

impl CommandSlot<'_> {
    pub fn send(self, command: WriteCommand) {
        debug!(address = command.address(), len = command.len(), "Command enqueued");
        self.permit.send(command);
    }
}

/// Consumer half, owned by the serial forwarder
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<WriteCommand>,
}

impl CommandReceiver {
    /// Wait for the next command; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<WriteCommand> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WriteCommand> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
