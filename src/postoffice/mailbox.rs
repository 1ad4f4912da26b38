//! Mailbox - one logical channel on a PostOffice
//!
//! A mailbox holds a FIFO of fully reassembled messages plus per-message
//! reassembly buffers for fragments still in flight. Receivers suspend on a
//! `Notify` until something is queued, the mailbox is closed, or they are
//! cancelled.

use crate::postoffice::wire::WireFrame;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Highest transient mailbox id (exclusive). Permanent ids live above it.
pub const MAX_TRANSIENT: u32 = 1_000_000;

/// Address of a mailbox on one PostOffice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId(pub u32);

impl MailboxId {
    /// Permanent mailbox for a well-known channel number.
    pub fn permanent(well_known: u16) -> Self {
        MailboxId(well_known as u32 + MAX_TRANSIENT)
    }

    pub fn is_transient(self) -> bool {
        self.0 < MAX_TRANSIENT
    }

    pub fn is_permanent(self) -> bool {
        !self.is_transient()
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_permanent() {
            write!(f, "P{}", self.0 - MAX_TRANSIENT)
        } else {
            write!(f, "T{}", self.0)
        }
    }
}

/// A complete, reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    pub mailbox_id: MailboxId,
    pub protocol_id: u32,
    pub message_id: u32,
    /// Message this one answers, or 0.
    pub reply_to_id: u32,
    pub payload: Vec<u8>,
}

impl MailboxMessage {
    pub fn new(mailbox_id: MailboxId, protocol_id: u32, payload: Vec<u8>) -> Self {
        Self { mailbox_id, protocol_id, message_id: 0, reply_to_id: 0, payload }
    }

    pub fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn replying_to(mut self, reply_to_id: u32) -> Self {
        self.reply_to_id = reply_to_id;
        self
    }
}

/// Errors raised by a single mailbox
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("Protocol error: fragment for message {message_id} on {mailbox} without a BEGIN")]
    OrphanFragment { mailbox: MailboxId, message_id: u32 },

    #[error("Protocol error: duplicate BEGIN for message {message_id} on {mailbox}")]
    DuplicateBegin { mailbox: MailboxId, message_id: u32 },

    #[error("Mailbox {0} is closed")]
    Closed(MailboxId),

    #[error("Receive on mailbox {0} was cancelled")]
    Cancelled(MailboxId),
}

struct PartialMessage {
    protocol_id: u32,
    reply_to_id: u32,
    payload: Vec<u8>,
}

struct MailboxState {
    id: MailboxId,
    inbound: VecDeque<MailboxMessage>,
    partial: HashMap<u32, PartialMessage>,
    last_activity: Instant,
    waiters: usize,
    closed: bool,
}

pub struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Notify,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Mailbox")
            .field("id", &state.id)
            .field("queued", &state.inbound.len())
            .field("partial", &state.partial.len())
            .finish()
    }
}

/// Decrements the waiter count when a receive finishes, however it finishes.
pub(crate) struct WaiterGuard<'a>(&'a Mailbox);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.waiters = state.waiters.saturating_sub(1);
        state.last_activity = Instant::now();
    }
}

impl Mailbox {
    pub fn new(id: MailboxId) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                id,
                inbound: VecDeque::new(),
                partial: HashMap::new(),
                last_activity: Instant::now(),
                waiters: 0,
                closed: false,
            }),
            arrived: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MailboxState> {
        // State stays consistent across a panicking holder; keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> MailboxId {
        self.lock().id
    }

    /// Sort one fragment into this mailbox, completing a message when it can.
    pub fn put_fragment(&self, frame: WireFrame) -> Result<(), MailboxError> {
        if frame.is_single() {
            self.put_message(MailboxMessage {
                mailbox_id: frame.mailbox_id,
                protocol_id: frame.protocol_id,
                message_id: frame.message_id,
                reply_to_id: frame.reply_to_id,
                payload: frame.payload,
            });
            return Ok(());
        }

        let completed = {
            let mut state = self.lock();
            let id = state.id;
            if frame.is_begin() {
                let stale = state.partial.insert(
                    frame.message_id,
                    PartialMessage {
                        protocol_id: frame.protocol_id,
                        reply_to_id: frame.reply_to_id,
                        payload: frame.payload,
                    },
                );
                if stale.is_some() {
                    return Err(MailboxError::DuplicateBegin { mailbox: id, message_id: frame.message_id });
                }
                None
            } else {
                let Some(partial) = state.partial.get_mut(&frame.message_id) else {
                    return Err(MailboxError::OrphanFragment { mailbox: id, message_id: frame.message_id });
                };
                partial.payload.extend_from_slice(&frame.payload);
                if frame.is_end() {
                    state.partial.remove(&frame.message_id).map(|p| MailboxMessage {
                        mailbox_id: id,
                        protocol_id: p.protocol_id,
                        message_id: frame.message_id,
                        reply_to_id: p.reply_to_id,
                        payload: p.payload,
                    })
                } else {
                    None
                }
            }
        };

        if let Some(message) = completed {
            self.put_message(message);
        }
        Ok(())
    }

    pub fn put_message(&self, message: MailboxMessage) {
        {
            let mut state = self.lock();
            state.inbound.push_back(message);
            state.last_activity = Instant::now();
        }
        self.arrived.notify_waiters();
    }

    /// Pop the oldest queued message without waiting.
    pub fn try_take(&self) -> Option<MailboxMessage> {
        self.lock().inbound.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait for the next message.
    pub async fn get_message(&self, cancel: &CancellationToken) -> Result<MailboxMessage, MailboxError> {
        let _waiting = self.enter_wait();
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(message) = state.inbound.pop_front() {
                    return Ok(message);
                }
                if state.closed {
                    return Err(MailboxError::Closed(state.id));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(MailboxError::Cancelled(self.id())),
                _ = &mut notified => {}
            }
        }
    }

    /// Wait up to `timeout` for the next message; `None` on timeout or cancellation.
    pub async fn try_get_message(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<MailboxMessage>, MailboxError> {
        match tokio::time::timeout(timeout, self.get_message(cancel)).await {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(MailboxError::Cancelled(_))) | Err(_) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Wait until a message is queued or the mailbox closes, without taking it.
    pub(crate) async fn wait_for_arrival(&self) {
        let notified = self.arrived.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = self.lock();
            if !state.inbound.is_empty() || state.closed {
                return;
            }
        }
        notified.await;
    }

    pub(crate) fn enter_wait(&self) -> WaiterGuard<'_> {
        let mut state = self.lock();
        state.waiters += 1;
        state.last_activity = Instant::now();
        WaiterGuard(self)
    }

    /// True when nothing arrived within `max_lifetime` and nobody is waiting.
    pub fn is_expired(&self, max_lifetime: Duration, now: Instant) -> bool {
        let state = self.lock();
        state.waiters == 0 && now.saturating_duration_since(state.last_activity) > max_lifetime
    }

    /// Clear all state for reuse under a new id.
    pub fn reinitialize(&self, new_id: MailboxId) {
        let mut state = self.lock();
        state.id = new_id;
        state.inbound.clear();
        state.partial.clear();
        state.last_activity = Instant::now();
        state.waiters = 0;
        state.closed = false;
    }

    /// Wake every waiter with `Closed`. Queued messages can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.arrived.notify_waiters();
    }
}

// =============================================================================
// TESTS
// =============================================================================
