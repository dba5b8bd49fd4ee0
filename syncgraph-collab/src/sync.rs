//! Bridges a session's local operation stream to a [`Transport`].
//!
//! ```text
//!  DocumentSession ── raw listener ──► Outbox (bounded, FIFO)
//!        ▲                                  │ flush() in batches of max_batch
//!        │ apply_remote                     ▼
//!  apply_incoming() ◄── RemoteBatch ◄── Transport ──► relay / hub
//! ```
//!
//! Local edits never wait on the network: the raw listener only enqueues.
//! Publishing happens in [`SyncWrapper::flush`], which retries with
//! exponential backoff and, on give-up, leaves the batch at the head of
//! the outbox so a later [`SyncWrapper::reconnect`] sends it first.
//!
//! Saving the session marks everything queued so far as already in the
//! stored history; those batches go out flagged so the relay relays them
//! without appending them again.
//!
//! The wrapper remembers the last relay [`Cursor`] it applied. Every
//! (re)subscription resumes from it, so batches published while this
//! replica was away arrive before live ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use syncgraph_core::{DocumentSession, Operation, SessionEvent, SubscriptionId};
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::protocol::{Cursor, OperationBatch};
use crate::transport::{RemoteBatch, Transport, TransportError};

/// Reconnection and publish-retry parameters.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.min(7);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Sync wrapper configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub reconnect: ReconnectPolicy,
    /// Operations kept while unpublished; the oldest is dropped past this.
    pub max_backlog: usize,
    /// Operations per published batch.
    pub max_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            max_backlog: 10_000,
            max_batch: 256,
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_attempts: 3,
            },
            max_backlog: 1_000,
            max_batch: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Created, not started.
    Idle,
    Connected,
    /// Gave up after retries; call `reconnect`.
    Disconnected,
    Shutdown,
}

#[derive(Default)]
struct Queue {
    ops: VecDeque<Operation>,
    /// Leading operations that are already in the stored history.
    saved: usize,
}

/// Unpublished operations, shared with the session's listeners.
struct Outbox {
    queue: Mutex<Queue>,
    max_backlog: usize,
    closed: AtomicBool,
}

impl Outbox {
    fn new(max_backlog: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            max_backlog,
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, op: Operation) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.lock();
        if queue.ops.len() >= self.max_backlog {
            if let Some(dropped) = queue.ops.pop_front() {
                queue.saved = queue.saved.saturating_sub(1);
                log::warn!(
                    "sync backlog full ({}), dropping oldest {} on `{}`",
                    self.max_backlog,
                    dropped.kind().as_str(),
                    dropped.target()
                );
            }
        }
        queue.ops.push_back(op);
    }

    /// Everything queued is now part of the stored history.
    fn mark_saved(&self) {
        let mut queue = self.lock();
        queue.saved = queue.ops.len();
    }

    /// Up to `max` operations from the head, and whether they are already
    /// stored. Saved and unsaved operations never share a batch.
    fn take(&self, max: usize) -> (Vec<Operation>, bool) {
        let mut queue = self.lock();
        let saved = queue.saved > 0;
        let available = match saved {
            true => queue.saved,
            false => queue.ops.len(),
        };
        let n = max.min(available);
        if saved {
            queue.saved -= n;
        }
        (queue.ops.drain(..n).collect(), saved)
    }

    /// Put an unpublished batch back at the head, preserving order.
    fn restore(&self, ops: Vec<Operation>, saved: bool) {
        let mut queue = self.lock();
        if saved {
            queue.saved += ops.len();
        }
        for op in ops.into_iter().rev() {
            queue.ops.push_front(op);
        }
    }

    fn len(&self) -> usize {
        self.lock().ops.len()
    }

    fn saved_len(&self) -> usize {
        self.lock().saved
    }

    fn clear(&self) -> usize {
        let mut queue = self.lock();
        let n = queue.ops.len();
        queue.ops.clear();
        queue.saved = 0;
        n
    }
}

/// Publishes one session's local operations and applies everyone else's.
pub struct SyncWrapper<T: Transport> {
    transport: T,
    config: SyncConfig,
    outbox: Arc<Outbox>,
    doc_id: Option<String>,
    listeners: Vec<SubscriptionId>,
    incoming: Option<mpsc::UnboundedReceiver<RemoteBatch>>,
    state: SyncState,
    paused: bool,
    next_batch_id: u64,
    /// Last relay position applied, `None` before the first subscription.
    cursor: Option<Cursor>,
    /// Set when a resubscription could not replay everything missed.
    resync_needed: bool,
}

impl<T: Transport> SyncWrapper<T> {
    pub fn new(transport: T, config: SyncConfig) -> Self {
        let outbox = Arc::new(Outbox::new(config.max_backlog));
        Self {
            transport,
            config,
            outbox,
            doc_id: None,
            listeners: Vec::new(),
            incoming: None,
            state: SyncState::Idle,
            paused: false,
            next_batch_id: 1,
            cursor: None,
            resync_needed: false,
        }
    }

    /// Start recording `session`'s published operations (local, undo, redo)
    /// and tracking its saves.
    pub fn attach(&mut self, session: &mut DocumentSession) {
        self.detach(session);
        let outbox = self.outbox.clone();
        self.listeners.push(session.on_raw_change(move |change| {
            if change.origin.is_published() {
                outbox.push(change.op.clone());
            }
        }));
        let outbox = self.outbox.clone();
        self.listeners.push(session.on_session_event(move |event| {
            if let SessionEvent::Saved { doc_id } = event {
                outbox.mark_saved();
                log::trace!("{doc_id} saved, queued operations are stored");
            }
        }));
        self.doc_id = Some(session.doc_id().to_string());
    }

    pub fn detach(&mut self, session: &mut DocumentSession) {
        for id in self.listeners.drain(..) {
            session.remove_listener(id);
        }
    }

    /// Subscribe to the attached document's channel, then publish any
    /// backlog unless paused.
    pub async fn start(&mut self) -> Result<usize, TransportError> {
        self.connect_with_retry().await?;
        self.flush().await
    }

    /// Stop publishing. Local operations keep being queued.
    pub fn pause(&mut self) {
        log::debug!("sync paused");
        self.paused = true;
    }

    /// Resume publishing and send everything queued while paused.
    pub async fn unpause(&mut self) -> Result<usize, TransportError> {
        log::debug!("sync unpaused");
        self.paused = false;
        self.flush().await
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Publish the outbox in order. Returns the number of operations sent.
    ///
    /// A no-op while paused or not connected. Each batch is retried with
    /// backoff; after `max_attempts` failures the batch goes back to the
    /// head of the outbox, the state becomes `Disconnected` and the last
    /// error is returned.
    pub async fn flush(&mut self) -> Result<usize, TransportError> {
        if self.paused || self.state != SyncState::Connected {
            return Ok(0);
        }

        let mut sent = 0;
        loop {
            let (ops, saved) = self.outbox.take(self.config.max_batch);
            if ops.is_empty() {
                break;
            }
            let mut batch = OperationBatch::new(self.next_batch_id, ops);
            if saved {
                batch = batch.already_saved();
            }
            self.next_batch_id += 1;

            match self.publish_with_retry(&batch).await {
                Ok(seq) => {
                    log::trace!("batch {} published as seq {seq}", batch.batch_id);
                    sent += batch.len();
                }
                Err(e) => {
                    log::error!(
                        "giving up on batch {} ({} ops): {e}",
                        batch.batch_id,
                        batch.len()
                    );
                    self.outbox.restore(batch.operations, batch.saved);
                    self.state = SyncState::Disconnected;
                    return Err(e);
                }
            }
        }
        if sent > 0 {
            log::debug!("flushed {sent} operations");
        }
        Ok(sent)
    }

    async fn publish_with_retry(&mut self, batch: &OperationBatch) -> Result<u64, TransportError> {
        let policy = self.config.reconnect.clone();
        let mut failures = 0;
        loop {
            match self.transport.publish(batch).await {
                Ok(seq) => return Ok(seq),
                Err(e) => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        return Err(e);
                    }
                    let delay = policy.delay_for(failures);
                    log::warn!(
                        "publish of batch {} failed ({e}), retry {failures} in {delay:?}",
                        batch.batch_id
                    );
                    tokio::time::sleep(delay).await;
                    if !self.transport.is_connected() {
                        if let Err(e) = self.connect_once().await {
                            log::debug!("resubscribe failed: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Result<(), TransportError> {
        let doc_id = self.doc_id.clone().ok_or(TransportError::NotConnected)?;
        let subscription = self.transport.connect(&doc_id, self.cursor).await?;
        if self.cursor.is_some() && !subscription.caught_up {
            log::warn!(
                "relay could not replay everything missed on {doc_id}, resync needed"
            );
            self.resync_needed = true;
        }
        self.incoming = Some(subscription.incoming);
        self.cursor = Some(subscription.cursor);
        self.state = SyncState::Connected;
        log::info!(
            "sync connected to {doc_id}, resuming after seq {}",
            subscription.cursor.seq
        );
        Ok(())
    }

    async fn connect_with_retry(&mut self) -> Result<(), TransportError> {
        if self.state == SyncState::Shutdown {
            return Err(TransportError::ConnectionClosed);
        }
        let policy = self.config.reconnect.clone();
        let mut failures = 0;
        loop {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        log::error!("could not connect after {failures} attempts: {e}");
                        self.state = SyncState::Disconnected;
                        return Err(e);
                    }
                    let delay = policy.delay_for(failures);
                    log::warn!("connect failed ({e}), retry {failures} in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Re-subscribe after an outage and flush the backlog in order.
    pub async fn reconnect(&mut self) -> Result<usize, TransportError> {
        log::info!("reconnecting with {} queued operations", self.backlog_len());
        self.connect_with_retry().await?;
        self.flush().await
    }

    /// Apply every remote batch received so far, in channel order.
    ///
    /// Operations the local graph rejects are logged and skipped. Returns
    /// the number of operations applied. Also mirrors the connection state
    /// onto the session.
    pub fn apply_incoming(&mut self, session: &mut DocumentSession) -> usize {
        let mut applied = 0;
        if let Some(rx) = self.incoming.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(batch) => {
                        let Some(cursor) = self.cursor.as_mut() else {
                            continue;
                        };
                        if batch.seq <= cursor.seq {
                            log::debug!("skipping stale batch seq {}", batch.seq);
                            continue;
                        }
                        cursor.seq = batch.seq;
                        for op in batch.operations {
                            match session.apply_remote(op) {
                                Ok(()) => applied += 1,
                                Err(e) => log::warn!(
                                    "skipping remote op from {} (seq {}): {e}",
                                    batch.peer_id,
                                    batch.seq
                                ),
                            }
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        log::warn!("remote channel closed");
                        self.incoming = None;
                        if self.state == SyncState::Connected {
                            self.state = SyncState::Disconnected;
                        }
                        break;
                    }
                }
            }
        }
        session.set_connected(self.state == SyncState::Connected);
        applied
    }

    /// Drop every unpublished operation.
    pub fn discard(&mut self) -> usize {
        let n = self.outbox.clear();
        if n > 0 {
            log::info!("discarded {n} unpublished operations");
        }
        n
    }

    /// Leave the channel. Nothing is queued or published afterwards.
    pub async fn shutdown(&mut self) {
        self.outbox.closed.store(true, Ordering::Release);
        self.transport.disconnect().await;
        self.incoming = None;
        self.state = SyncState::Shutdown;
        log::info!("sync shut down");
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn backlog_len(&self) -> usize {
        self.outbox.len()
    }

    /// Sequence number of the last remote batch applied.
    pub fn last_seq(&self) -> u64 {
        self.cursor.map_or(0, |c| c.seq)
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Whether a resubscription found batches it could not replay. The
    /// session should then be reloaded from the store. Clears the flag.
    pub fn take_resync_needed(&mut self) -> bool {
        std::mem::take(&mut self.resync_needed)
    }

    /// Queued operations already in the stored history.
    pub fn saved_backlog_len(&self) -> usize {
        self.outbox.saved_len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
