//! PostOffice - many mailboxes over one duplex byte stream
//!
//! The PostOffice owns both halves of a stream. Outbound messages are
//! fragmented and written under an exclusive write gate. Inbound bytes run
//! through the resilient [`FrameScanner`] and validated fragments are sorted
//! into mailboxes, auto-creating any mailbox the peer references first.
//!
//! ## Reader strategies
//!
//! - **Dedicated**: one background task owns the read half and scans
//!   continuously. Receivers just wait on their mailbox.
//! - **Carpool**: no background task. Whichever receiver wins the
//!   single-flight gate performs one read pass for everybody; the others wait
//!   for the lap to end and re-check their own mailbox.
//!
//! ## Transient mailbox lifecycle
//!
//! ```text
//!   create ──▶ live ──(idle > lifetime, nobody waiting)──▶ pruned ──▶ pool
//!                ▲                                                   │
//!                └──────────────── reinitialize(new id) ◀────────────┘
//! ```

use crate::postoffice::carpool::Carpool;
use crate::postoffice::mailbox::{Mailbox, MailboxError, MailboxId, MailboxMessage, MAX_TRANSIENT};
use crate::postoffice::scanner::FrameScanner;
use crate::postoffice::wire::{encode_fragment, fragments, WireFrame};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bytes requested from the stream per read pass.
pub const READ_CHUNK: usize = 64 * 1024;

/// Transient creations between prune passes.
const PRUNE_INTERVAL: u64 = 5;

/// Most mailboxes evicted in one prune pass.
const PRUNE_CAP: usize = 10;

/// Window over which the transient creation rate is measured.
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Headroom over the expected live-mailbox count before pruning starts.
const PRUNE_HEADROOM: f64 = 1.1;

const MAX_POOLED: usize = 64;

/// Default idle lifetime of a transient mailbox.
pub const DEFAULT_MAILBOX_LIFETIME: Duration = Duration::from_secs(30);

/// Idle lifetime used when debug timeouts are on.
pub const DEBUG_MAILBOX_LIFETIME: Duration = Duration::from_secs(600);

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Transport-level failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PostOfficeError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Stream closed by peer")]
    StreamClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Send deadline exceeded")]
    DeadlineExceeded,

    #[error("Post office has been shut down")]
    Shutdown,

    #[error("All {0} transient mailbox ids are in use")]
    MailboxesExhausted(u32),
}

impl From<std::io::Error> for PostOfficeError {
    fn from(e: std::io::Error) -> Self {
        PostOfficeError::Io(e.to_string())
    }
}

// =============================================================================
// OPTIONS AND STATS
// =============================================================================

#[derive(Debug, Clone)]
pub struct PostOfficeOptions {
    /// Label used in log lines.
    pub name: String,
    /// Server side allocates transient ids from the bottom of the range, client from the middle.
    pub is_server: bool,
    pub dedicated_reader: bool,
    pub mailbox_lifetime: Duration,
}

impl Default for PostOfficeOptions {
    fn default() -> Self {
        Self {
            name: "postoffice".to_string(),
            is_server: false,
            dedicated_reader: false,
            mailbox_lifetime: DEFAULT_MAILBOX_LIFETIME,
        }
    }
}

/// Point-in-time counters for one PostOffice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostOfficeStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub checksum_failures: u64,
    pub junk_bytes: u64,
    pub orphan_fragments: u64,
    pub transient_mailboxes: usize,
    pub permanent_mailboxes: usize,
    pub pooled_mailboxes: usize,
    pub pruned_mailboxes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    checksum_failures: AtomicU64,
    junk_bytes: AtomicU64,
    orphan_fragments: AtomicU64,
    pruned: AtomicU64,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

struct ReadSide {
    stream: BoxReader,
    scanner: FrameScanner,
    chunk: Vec<u8>,
}

struct Registry {
    transient: HashMap<u32, Arc<Mailbox>>,
    permanent: HashMap<u32, Arc<Mailbox>>,
    pool: Vec<Arc<Mailbox>>,
    next_transient: u32,
    /// Transient ids handed out locally stay below this.
    transient_range: u32,
    creations: u64,
    recent_creations: VecDeque<Instant>,
}

struct Shared {
    name: String,
    is_server: bool,
    dedicated_reader: bool,
    mailbox_lifetime: Duration,
    writer: tokio::sync::Mutex<BoxWriter>,
    reader: tokio::sync::Mutex<ReadSide>,
    registry: Mutex<Registry>,
    new_mailbox_tx: mpsc::UnboundedSender<MailboxId>,
    new_mailbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MailboxId>>,
    carpool: Carpool,
    next_message_id: AtomicU32,
    closed: CancellationToken,
    close_reason: Mutex<Option<PostOfficeError>>,
    counters: Counters,
}

/// Multiplexes addressable mailboxes over one duplex stream.
pub struct PostOffice {
    shared: Arc<Shared>,
    reader_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOffice")
            .field("name", &self.shared.name)
            .field("is_server", &self.shared.is_server)
            .field("dedicated_reader", &self.shared.dedicated_reader)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl PostOffice {
    /// Create a PostOffice over separate read and write halves.
    ///
    /// With `dedicated_reader` set this spawns the reader task, so it must be
    /// called from within a Tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, options: PostOfficeOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (new_mailbox_tx, new_mailbox_rx) = mpsc::unbounded_channel();
        let first_transient = if options.is_server { 0 } else { MAX_TRANSIENT / 2 };
        let shared = Arc::new(Shared {
            name: options.name,
            is_server: options.is_server,
            dedicated_reader: options.dedicated_reader,
            mailbox_lifetime: options.mailbox_lifetime,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            reader: tokio::sync::Mutex::new(ReadSide {
                stream: Box::new(reader),
                scanner: FrameScanner::new(),
                chunk: vec![0u8; READ_CHUNK],
            }),
            registry: Mutex::new(Registry {
                transient: HashMap::new(),
                permanent: HashMap::new(),
                pool: Vec::new(),
                next_transient: first_transient,
                transient_range: MAX_TRANSIENT,
                creations: 0,
                recent_creations: VecDeque::new(),
            }),
            new_mailbox_tx,
            new_mailbox_rx: tokio::sync::Mutex::new(new_mailbox_rx),
            carpool: Carpool::new(),
            next_message_id: AtomicU32::new(0),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            counters: Counters::default(),
        });

        let reader_task = shared.dedicated_reader.then(|| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.reader_loop().await })
        });

        tracing::debug!(
            "[PostOffice.new] {} ready (server={}, dedicated_reader={})",
            shared.name,
            shared.is_server,
            shared.dedicated_reader
        );
        Self { shared, reader_task }
    }

    /// Create a PostOffice over one bidirectional stream.
    pub fn from_stream<S>(stream: S, options: PostOfficeOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, options)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Allocate the next free transient mailbox.
    ///
    /// Fails with [`PostOfficeError::MailboxesExhausted`] when every transient
    /// id is live and none has expired.
    pub fn create_transient_mailbox(&self) -> Result<MailboxId, PostOfficeError> {
        self.shared.create_transient()
    }

    /// Get or create the permanent mailbox for a well-known channel number.
    pub fn create_permanent_mailbox(&self, well_known: u16) -> MailboxId {
        let id = MailboxId::permanent(well_known);
        self.shared.get_or_create(id);
        id
    }

    /// Next message id. Never zero.
    pub fn generate_message_id(&self) -> u32 {
        loop {
            let id = self.shared.next_message_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Fragment and write one message.
    ///
    /// All fragments go out under the write gate, followed by one flush.
    /// A cancelled send may leave a partial fragment on the wire; the peer's
    /// scanner discards it as noise.
    pub async fn send_message(
        &self,
        message: &MailboxMessage,
        cancel: &CancellationToken,
    ) -> Result<(), PostOfficeError> {
        self.shared.check_open()?;
        self.shared.get_or_create(message.mailbox_id);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PostOfficeError::Cancelled),
            result = self.shared.write_message(message) => result,
        }
    }

    /// `send_message` that gives up at `deadline`.
    pub async fn send_message_before(
        &self,
        message: &MailboxMessage,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), PostOfficeError> {
        tokio::time::timeout_at(deadline, self.send_message(message, cancel))
            .await
            .unwrap_or(Err(PostOfficeError::DeadlineExceeded))
    }

    /// Wait for the next message on `mailbox_id`.
    pub async fn receive_message(
        &self,
        mailbox_id: MailboxId,
        cancel: &CancellationToken,
    ) -> Result<MailboxMessage, PostOfficeError> {
        let mailbox = self.shared.get_or_create(mailbox_id);

        if self.shared.dedicated_reader {
            return match mailbox.get_message(cancel).await {
                Ok(message) => Ok(message),
                Err(MailboxError::Cancelled(_)) => Err(PostOfficeError::Cancelled),
                Err(_) => Err(self.shared.close_error()),
            };
        }

        let _waiting = mailbox.enter_wait();
        self.shared.carpool_until(cancel, || mailbox.try_take()).await
    }

    /// Like `receive_message`, but `Ok(None)` on timeout or cancellation.
    pub async fn try_receive_message(
        &self,
        mailbox_id: MailboxId,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<MailboxMessage>, PostOfficeError> {
        match tokio::time::timeout(timeout, self.receive_message(mailbox_id, cancel)).await {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(PostOfficeError::Cancelled)) | Err(_) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Id of the next transient mailbox the peer opened by sending to it.
    pub async fn wait_for_messages_on_new_mailbox(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MailboxId, PostOfficeError> {
        let shared = &self.shared;
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return Err(PostOfficeError::Cancelled),
            rx = shared.new_mailbox_rx.lock() => rx,
        };

        if shared.dedicated_reader {
            if let Ok(id) = rx.try_recv() {
                return Ok(id);
            }
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PostOfficeError::Cancelled),
                id = rx.recv() => id.ok_or(PostOfficeError::Shutdown),
                _ = shared.closed.cancelled() => Err(shared.close_error()),
            };
        }

        shared.carpool_until(cancel, || rx.try_recv().ok()).await
    }

    /// Run one prune pass now, regardless of the creation interval.
    pub fn prune_expired_mailboxes(&self) -> usize {
        let mut registry = self.shared.lock_registry();
        self.shared.prune(&mut registry, Instant::now())
    }

    pub fn stats(&self) -> PostOfficeStats {
        let c = &self.shared.counters;
        let registry = self.shared.lock_registry();
        PostOfficeStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            checksum_failures: c.checksum_failures.load(Ordering::Relaxed),
            junk_bytes: c.junk_bytes.load(Ordering::Relaxed),
            orphan_fragments: c.orphan_fragments.load(Ordering::Relaxed),
            transient_mailboxes: registry.transient.len(),
            permanent_mailboxes: registry.permanent.len(),
            pooled_mailboxes: registry.pool.len(),
            pruned_mailboxes: c.pruned.load(Ordering::Relaxed),
        }
    }

    /// Stop reading and fail every current and future receiver.
    pub fn shutdown(&self) {
        self.shared.mark_closed(PostOfficeError::Shutdown);
    }

    /// Shut down and wait for the dedicated reader to exit.
    pub async fn close(mut self) {
        self.shutdown();
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PostOffice {
    fn drop(&mut self) {
        self.shared.mark_closed(PostOfficeError::Shutdown);
    }
}

// =============================================================================
// SHARED IMPLEMENTATION
// =============================================================================

/// Next transient id after `next_transient` that is not live, wrapping within the range.
fn free_transient(registry: &Registry) -> Option<u32> {
    let range = registry.transient_range;
    let mut candidate = registry.next_transient;
    for _ in 0..range {
        candidate = (candidate + 1) % range;
        if !registry.transient.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}

impl Shared {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> Result<(), PostOfficeError> {
        if self.closed.is_cancelled() {
            Err(self.close_error())
        } else {
            Ok(())
        }
    }

    fn close_error(&self) -> PostOfficeError {
        self.close_reason
            .lock()
            .ok()
            .and_then(|reason| reason.clone())
            .unwrap_or(PostOfficeError::Shutdown)
    }

    fn mark_closed(&self, reason: PostOfficeError) {
        {
            let mut slot = self.close_reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        tracing::debug!("[PostOffice.mark_closed] {} closed: {}", self.name, reason);
        self.closed.cancel();
        let registry = self.lock_registry();
        for mailbox in registry.transient.values().chain(registry.permanent.values()) {
            mailbox.close();
        }
    }

    fn create_transient(&self) -> Result<MailboxId, PostOfficeError> {
        let mut registry = self.lock_registry();
        let now = Instant::now();
        self.count_creation(&mut registry, now);
        let candidate = match free_transient(&registry) {
            Some(candidate) => candidate,
            None => {
                // Whole range live: evict anything expired before giving up.
                self.evict_expired(&mut registry, now, PRUNE_CAP);
                free_transient(&registry).ok_or_else(|| {
                    tracing::error!("[PostOffice.create_transient] {} has no free transient ids", self.name);
                    PostOfficeError::MailboxesExhausted(registry.transient_range)
                })?
            }
        };
        registry.next_transient = candidate;
        let id = MailboxId(candidate);
        self.insert_transient(&mut registry, id);
        Ok(id)
    }

    /// Look up a mailbox, creating it if unseen. Returns the mailbox and whether it is new.
    fn lookup(&self, id: MailboxId) -> (Arc<Mailbox>, bool) {
        let mut registry = self.lock_registry();
        if id.is_permanent() {
            if let Some(existing) = registry.permanent.get(&id.0) {
                return (Arc::clone(existing), false);
            }
            let mailbox = Arc::new(Mailbox::new(id));
            if self.closed.is_cancelled() {
                mailbox.close();
            }
            registry.permanent.insert(id.0, Arc::clone(&mailbox));
            return (mailbox, true);
        }

        if let Some(existing) = registry.transient.get(&id.0) {
            return (Arc::clone(existing), false);
        }
        self.count_creation(&mut registry, Instant::now());
        (self.insert_transient(&mut registry, id), true)
    }

    fn get_or_create(&self, id: MailboxId) -> Arc<Mailbox> {
        self.lookup(id).0
    }

    fn insert_transient(&self, registry: &mut Registry, id: MailboxId) -> Arc<Mailbox> {
        let mailbox = match registry.pool.pop() {
            Some(recycled) => {
                recycled.reinitialize(id);
                recycled
            }
            None => Arc::new(Mailbox::new(id)),
        };
        if self.closed.is_cancelled() {
            mailbox.close();
        }
        registry.transient.insert(id.0, Arc::clone(&mailbox));
        mailbox
    }

    /// Record one transient creation, pruning every few before the new mailbox is added.
    fn count_creation(&self, registry: &mut Registry, now: Instant) {
        registry.creations += 1;
        registry.recent_creations.push_back(now);
        if registry.creations % PRUNE_INTERVAL == 0 {
            self.prune(registry, now);
        }
    }

    /// Evict expired transient mailboxes when there are more than the creation rate explains.
    fn prune(&self, registry: &mut Registry, now: Instant) -> usize {
        while let Some(oldest) = registry.recent_creations.front() {
            if now.saturating_duration_since(*oldest) > RATE_WINDOW {
                registry.recent_creations.pop_front();
            } else {
                break;
            }
        }

        let rate = registry.recent_creations.len() as f64 / RATE_WINDOW.as_secs_f64();
        let expected = rate * self.mailbox_lifetime.as_secs_f64() * PRUNE_HEADROOM;
        let excess = registry.transient.len() as f64 - expected;
        if excess < 1.0 {
            return 0;
        }
        let budget = (excess as usize).min(PRUNE_CAP);
        self.evict_expired(registry, now, budget)
    }

    /// Move up to `budget` expired, unreferenced transient mailboxes to the pool.
    fn evict_expired(&self, registry: &mut Registry, now: Instant, budget: usize) -> usize {
        if registry.transient.is_empty() {
            return 0;
        }
        let keys: Vec<u32> = registry.transient.keys().copied().collect();
        let offset = rand::thread_rng().gen_range(0..keys.len());
        let mut evicted = 0;
        for key in keys.iter().cycle().skip(offset).take(keys.len()) {
            if evicted >= budget {
                break;
            }
            let Some(mailbox) = registry.transient.get(key) else { continue };
            // Someone outside the registry still holds it; leave it alone.
            if Arc::strong_count(mailbox) > 1 || !mailbox.is_expired(self.mailbox_lifetime, now) {
                continue;
            }
            if let Some(mailbox) = registry.transient.remove(key) {
                if registry.pool.len() < MAX_POOLED {
                    registry.pool.push(mailbox);
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.counters.pruned.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::trace!(
                "[PostOffice.prune] {} evicted {} idle mailboxes ({} live)",
                self.name,
                evicted,
                registry.transient.len()
            );
        }
        evicted
    }

    async fn write_message(&self, message: &MailboxMessage) -> Result<(), PostOfficeError> {
        let mut writer = self.writer.lock().await;
        let mut buffer = Vec::new();
        let mut frames = 0u64;
        for (flags, chunk) in fragments(&message.payload) {
            buffer.clear();
            encode_fragment(
                &mut buffer,
                message.mailbox_id,
                message.protocol_id,
                message.message_id,
                message.reply_to_id,
                flags,
                chunk,
            );
            if let Err(e) = writer.write_all(&buffer).await {
                self.mark_closed(e.into());
                return Err(self.close_error());
            }
            frames += 1;
            self.counters.bytes_sent.fetch_add(buffer.len() as u64, Ordering::Relaxed);
        }
        if let Err(e) = writer.flush().await {
            self.mark_closed(e.into());
            return Err(self.close_error());
        }
        self.counters.frames_sent.fetch_add(frames, Ordering::Relaxed);
        Ok(())
    }

    /// Read once from the stream and sort whatever fragments complete.
    async fn read_pass(&self) -> Result<(), PostOfficeError> {
        let mut side = self.reader.lock().await;
        let ReadSide { stream, scanner, chunk } = &mut *side;

        let n = match stream.read(chunk).await {
            Ok(0) => {
                self.mark_closed(PostOfficeError::StreamClosed);
                return Err(PostOfficeError::StreamClosed);
            }
            Ok(n) => n,
            Err(e) => {
                let err = PostOfficeError::from(e);
                self.mark_closed(err.clone());
                return Err(err);
            }
        };
        self.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

        let frames = scanner.push(&chunk[..n]);
        let scan = scanner.stats();
        self.counters.frames_received.store(scan.frames, Ordering::Relaxed);
        self.counters.checksum_failures.store(scan.checksum_failures, Ordering::Relaxed);
        self.counters.junk_bytes.store(scan.junk_bytes, Ordering::Relaxed);
        drop(side);

        for frame in frames {
            self.route(frame);
        }
        Ok(())
    }

    fn route(&self, frame: WireFrame) {
        let id = frame.mailbox_id;
        let message_id = frame.message_id;
        let (mailbox, created) = self.lookup(id);
        if let Err(e) = mailbox.put_fragment(frame) {
            self.counters.orphan_fragments.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("[PostOffice.route] {} dropped fragment of message {}: {}", self.name, message_id, e);
        }
        if created && id.is_transient() {
            tracing::trace!("[PostOffice.route] {} peer opened mailbox {}", self.name, id);
            let _ = self.new_mailbox_tx.send(id);
        }
    }

    async fn reader_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                result = self.read_pass() => {
                    if let Err(e) = result {
                        tracing::debug!("[PostOffice.reader_loop] {} reader exiting: {}", self.name, e);
                        break;
                    }
                }
            }
        }
    }

    /// Share read passes until `check` yields a value.
    async fn carpool_until<T>(
        &self,
        cancel: &CancellationToken,
        mut check: impl FnMut() -> Option<T>,
    ) -> Result<T, PostOfficeError> {
        loop {
            if let Some(found) = check() {
                return Ok(found);
            }
            self.check_open()?;
            if cancel.is_cancelled() {
                return Err(PostOfficeError::Cancelled);
            }

            match self.carpool.try_drive() {
                Some(_driver) => {
                    if let Some(found) = check() {
                        return Ok(found);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PostOfficeError::Cancelled),
                        _ = self.closed.cancelled() => {}
                        result = self.read_pass() => result?,
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PostOfficeError::Cancelled),
                        _ = self.carpool.wait_for_lap() => {}
                    }
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
