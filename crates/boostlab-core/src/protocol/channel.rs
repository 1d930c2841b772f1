//! Serialized ECU channel
//!
//! One dedicated worker thread owns the link and codec, so exactly one
//! request/reply cycle is in flight at a time (the protocol is half-duplex).
//! Map-write transmissions are queued at a higher priority than telemetry
//! polls: a pending write preempts the next poll, but a request already in
//! flight is never interrupted. Transient errors are retried a bounded
//! number of times; heartbeats are sent when the link sits idle.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::codec::{self, Message, Request};
use super::link::{Link, LinkState};
use super::ProtocolError;
use crate::params::ParameterTable;

/// Retries for transient failures before a request is surfaced as failed
const TRANSIENT_RETRIES: u32 = 2;

/// Scheduling class for submitted requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Telemetry polling; yields to pending writes
    Poll,
    /// Map cell transmission; runs before the next poll
    Write,
}

type Reply = mpsc::Sender<Result<Message, ProtocolError>>;

enum Command {
    Submit {
        request: Request,
        priority: Priority,
        reply: Reply,
    },
    Shutdown,
}

struct Pending {
    request: Request,
    reply: Reply,
}

/// Cloneable handle for submitting requests to the channel worker
#[derive(Clone)]
pub struct EcuHandle {
    tx: mpsc::Sender<Command>,
}

impl EcuHandle {
    /// Submit a request and block until its reply (or failure) arrives
    pub fn execute(
        &self,
        request: Request,
        priority: Priority,
    ) -> Result<Message, ProtocolError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Command::Submit {
                request,
                priority,
                reply: reply_tx,
            })
            .map_err(|_| ProtocolError::ChannelClosed)?;
        reply_rx.recv().map_err(|_| ProtocolError::ChannelClosed)?
    }
}

/// The serialized ECU channel
pub struct EcuChannel {
    tx: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl EcuChannel {
    /// Spawn the worker thread that owns the link
    pub fn spawn(link: Link, table: Arc<ParameterTable>) -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("ecu-channel".to_string())
            .spawn(move || worker_loop(link, table, rx))
            .ok();
        Self { tx, worker }
    }

    /// Handle for submitting requests from other threads
    pub fn handle(&self) -> EcuHandle {
        EcuHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop the worker and wait for it to exit
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EcuChannel {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(mut link: Link, table: Arc<ParameterTable>, rx: mpsc::Receiver<Command>) {
    let mut write_queue: VecDeque<Pending> = VecDeque::new();
    let mut poll_queue: VecDeque<Pending> = VecDeque::new();
    let heartbeat_idle = link.config().heartbeat_idle;

    info!("ECU channel worker started");

    loop {
        // Drain everything already queued without blocking
        loop {
            match rx.try_recv() {
                Ok(Command::Submit {
                    request,
                    priority,
                    reply,
                }) => enqueue(&mut write_queue, &mut poll_queue, request, priority, reply),
                Ok(Command::Shutdown) => {
                    info!("ECU channel worker shutting down");
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return,
            }
        }

        if write_queue.is_empty() && poll_queue.is_empty() {
            // Idle: wait for work, probing the ECU if the link sits quiet
            match rx.recv_timeout(heartbeat_idle) {
                Ok(Command::Submit {
                    request,
                    priority,
                    reply,
                }) => {
                    enqueue(&mut write_queue, &mut poll_queue, request, priority, reply);
                    continue;
                }
                Ok(Command::Shutdown) => {
                    info!("ECU channel worker shutting down");
                    return;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if link.heartbeat_due() && !link.needs_reconnect() {
                        debug!("sending idle heartbeat");
                        let _ = execute_once(&mut link, &table, &Request::Heartbeat);
                    }
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }

        // Writes preempt the next pending poll
        let pending = write_queue
            .pop_front()
            .or_else(|| poll_queue.pop_front())
            .unwrap_or_else(|| unreachable!("queues checked non-empty"));

        let result = execute_with_retry(&mut link, &table, &pending.request);
        // Receiver may have given up; that is their choice
        let _ = pending.reply.send(result);
    }
}

fn enqueue(
    write_queue: &mut VecDeque<Pending>,
    poll_queue: &mut VecDeque<Pending>,
    request: Request,
    priority: Priority,
    reply: Reply,
) {
    let pending = Pending { request, reply };
    match priority {
        Priority::Write => write_queue.push_back(pending),
        Priority::Poll => poll_queue.push_back(pending),
    }
}

fn execute_with_retry(
    link: &mut Link,
    table: &ParameterTable,
    request: &Request,
) -> Result<Message, ProtocolError> {
    if link.needs_reconnect() {
        let backoff = link.next_backoff();
        thread::sleep(backoff);
        if let Err(e) = link.try_reconnect() {
            return Err(e);
        }
    }

    let mut last_err = ProtocolError::Timeout;
    for attempt in 0..=TRANSIENT_RETRIES {
        match execute_once(link, table, request) {
            Ok(message) => return Ok(message),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "transient failure, retrying");
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(error = %last_err, ?request, "request failed after retries, link degraded");
    if link.state() == LinkState::Connected {
        link.mark_degraded();
    }
    Err(last_err)
}

fn execute_once(
    link: &mut Link,
    table: &ParameterTable,
    request: &Request,
) -> Result<Message, ProtocolError> {
    let frame = codec::encode(request);
    let reply = link.request(&frame)?;
    codec::decode(&reply, table)
}
