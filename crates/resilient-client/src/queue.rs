//! Offline request queue
//!
//! Holds offline-eligible requests until connectivity returns. Entries are
//! kept in priority order (high, medium, low) and FIFO within a priority.
//! The queue is bounded: a full queue evicts its oldest low-priority entry to
//! admit a new one, and rejects the newcomer when there is none to evict.
//!
//! Draining replays entries in fixed-size concurrent batches with a pause
//! between batches. Only one drain runs at a time.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Response;
use crate::config::QueueConfig;
use crate::descriptor::{Priority, RequestDescriptor};
use crate::error::{Error, Result};
use crate::handle::Responder;
use crate::metrics;

/// Result of running a request through the executor.
#[derive(Debug)]
pub enum Replay {
    /// The request settled
    Finished(Result<Response>),
    /// Connectivity is gone; park the request (again)
    Offline(RequestDescriptor),
}

/// A parked request with the means to settle it.
#[derive(Debug)]
pub struct QueuedEntry {
    pub descriptor: RequestDescriptor,
    pub enqueued_at: Instant,
    responder: Responder,
    cancel: CancellationToken,
    /// Arrival order; kept across re-queues so a request keeps its place
    seq: Option<u64>,
}

impl QueuedEntry {
    pub fn new(descriptor: RequestDescriptor, responder: Responder, cancel: CancellationToken) -> Self {
        Self {
            descriptor,
            enqueued_at: Instant::now(),
            responder,
            cancel,
            seq: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn resolve(self, result: Result<Response>) {
        self.responder.send(result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    priority: Reverse<Priority>,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<Slot, QueuedEntry>,
    slots: HashMap<Uuid, Slot>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, mut entry: QueuedEntry) {
        let seq = *entry.seq.get_or_insert_with(|| {
            let seq = self.next_seq;
            self.next_seq += 1;
            seq
        });
        let slot = Slot {
            priority: Reverse(entry.descriptor.priority),
            seq,
        };
        self.slots.insert(entry.id(), slot);
        self.entries.insert(slot, entry);
    }

    fn remove(&mut self, id: Uuid) -> Option<QueuedEntry> {
        let slot = self.slots.remove(&id)?;
        self.entries.remove(&slot)
    }

    fn pop_front(&mut self) -> Option<QueuedEntry> {
        let (_, entry) = self.entries.pop_first()?;
        self.slots.remove(&entry.id());
        Some(entry)
    }

    fn oldest_low(&self) -> Option<Uuid> {
        let first_low = Slot {
            priority: Reverse(Priority::Low),
            seq: 0,
        };
        self.entries
            .range(first_low..)
            .next()
            .map(|(_, entry)| entry.id())
    }
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries that reached a final result
    pub replayed: usize,
    /// Entries that went offline again and were put back
    pub requeued: usize,
    /// Entries skipped because their caller cancelled
    pub cancelled: usize,
    /// The drain stopped because connectivity dropped
    pub stopped_offline: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.replayed += other.replayed;
        self.requeued += other.requeued;
        self.cancelled += other.cancelled;
        self.stopped_offline = other.stopped_offline;
    }
}

/// Clears the draining flag however the drain future ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    max_size: usize,
    batch_size: usize,
    batch_delay: Duration,
    draining: AtomicBool,
}

impl RequestQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_size: config.max_size.max(1),
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            draining: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park an entry. A re-queued entry returns to its original position.
    ///
    /// On rejection the entry is settled with `QueueFull` before returning.
    /// An entry whose caller already cancelled is settled with `Cancelled`
    /// and never takes a slot.
    pub fn enqueue(&self, entry: QueuedEntry) -> Result<()> {
        let id = entry.id();
        let priority = entry.descriptor.priority;

        let mut state = self.lock();
        // `Canceller::cancel` fires the token before it takes this lock, so a
        // cancel that missed the entry is visible here.
        if entry.is_cancelled() {
            drop(state);
            debug!(request_id = %id, "cancelled before it could be parked");
            entry.resolve(Err(Error::Cancelled));
            return Err(Error::Cancelled);
        }
        let mut evicted = None;
        if state.entries.len() >= self.max_size {
            match state.oldest_low().and_then(|victim| state.remove(victim)) {
                Some(victim) => evicted = Some(victim),
                None => {
                    drop(state);
                    warn!(request_id = %id, %priority, "offline queue full, rejecting request");
                    entry.resolve(Err(Error::QueueFull));
                    return Err(Error::QueueFull);
                }
            }
        }
        state.insert(entry);
        let depth = state.entries.len();
        drop(state);

        if let Some(victim) = evicted {
            warn!(
                request_id = %victim.id(),
                admitted = %id,
                "offline queue full, evicted oldest low-priority request"
            );
            victim.resolve(Err(Error::QueueFull));
        }
        metrics::set_queue_depth(depth);
        debug!(request_id = %id, %priority, depth, "request parked in offline queue");
        Ok(())
    }

    /// Remove and cancel a parked entry. Returns `false` if it is not queued.
    pub fn cancel(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.remove(id);
            metrics::set_queue_depth(state.entries.len());
            removed
        };
        match removed {
            Some(entry) => {
                entry.resolve(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Settle every parked entry with `reason` and empty the queue.
    pub fn clear(&self, reason: Error) -> usize {
        let entries = {
            let mut state = self.lock();
            state.slots.clear();
            std::mem::take(&mut state.entries)
        };
        metrics::set_queue_depth(0);

        let cleared = entries.len();
        for (_, entry) in entries {
            entry.resolve(Err(reason.clone()));
        }
        if cleared > 0 {
            info!(cleared, reason = reason.kind(), "offline queue cleared");
        }
        cleared
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Queued request ids in the order a drain would replay them.
    pub fn pending(&self) -> Vec<Uuid> {
        self.lock().entries.values().map(QueuedEntry::id).collect()
    }

    fn pop_batch(&self, n: usize) -> Vec<QueuedEntry> {
        let mut state = self.lock();
        let batch: Vec<_> = std::iter::from_fn(|| state.pop_front()).take(n).collect();
        metrics::set_queue_depth(state.entries.len());
        batch
    }

    /// Replay parked entries through `replay` while `connected()` holds.
    ///
    /// Returns `None` without doing anything if another drain is running.
    /// Each entry starts over with a fresh attempt counter. Entries that come
    /// back as `Replay::Offline` are re-queued at their original position.
    pub async fn drain<F, Fut, C>(&self, replay: F, connected: C) -> Option<DrainReport>
    where
        F: Fn(RequestDescriptor, CancellationToken) -> Fut,
        Fut: Future<Output = Replay>,
        C: Fn() -> bool,
    {
        let mut report = self.drain_pass(&replay, &connected).await?;

        // An entry parked after the last batch but before the draining flag
        // cleared saw a drain running and did not start one.
        while !report.stopped_offline && connected() && self.size() > 0 {
            let Some(pass) = self.drain_pass(&replay, &connected).await else {
                break;
            };
            report.absorb(pass);
        }
        Some(report)
    }

    async fn drain_pass<F, Fut, C>(&self, replay: &F, connected: &C) -> Option<DrainReport>
    where
        F: Fn(RequestDescriptor, CancellationToken) -> Fut,
        Fut: Future<Output = Replay>,
        C: Fn() -> bool,
    {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        let started = Instant::now();
        info!(queued = self.size(), "draining offline queue");
        let mut report = DrainReport::default();

        loop {
            if !connected() {
                report.stopped_offline = true;
                break;
            }

            let batch = self.pop_batch(self.batch_size);
            if batch.is_empty() {
                break;
            }

            let (cancelled, live): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(QueuedEntry::is_cancelled);
            for entry in cancelled {
                report.cancelled += 1;
                entry.resolve(Err(Error::Cancelled));
            }

            let runs = live.into_iter().map(|mut entry| {
                entry.descriptor.reset_for_replay();
                let run = replay(entry.descriptor.clone(), entry.cancel.clone());
                async move { (entry, run.await) }
            });

            for (mut entry, outcome) in join_all(runs).await {
                match outcome {
                    Replay::Finished(Err(Error::Cancelled)) => {
                        report.cancelled += 1;
                        entry.resolve(Err(Error::Cancelled));
                    }
                    Replay::Finished(result) => {
                        report.replayed += 1;
                        entry.resolve(result);
                    }
                    Replay::Offline(descriptor) => {
                        entry.descriptor = descriptor;
                        match self.enqueue(entry) {
                            Err(Error::Cancelled) => report.cancelled += 1,
                            _ => report.requeued += 1,
                        }
                    }
                }
            }

            if self.size() == 0 {
                break;
            }
            tokio::time::sleep(self.batch_delay).await;
        }

        info!(
            replayed = report.replayed,
            requeued = report.requeued,
            cancelled = report.cancelled,
            remaining = self.size(),
            stopped_offline = report.stopped_offline,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "offline queue drain finished"
        );
        Some(report)
    }
}
