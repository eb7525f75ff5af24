//! Per-job hub joining the store's append path to live subscribers.
//!
//! Delivery is two-stage. The publisher hands each update to every
//! subscriber's unbounded feed with a non-blocking send and returns
//! immediately — appending never waits on any subscriber, and a stalled
//! subscriber cannot delay a healthy one. A dedicated delivery thread per
//! subscriber moves updates from its feed into the subscriber's bounded
//! mailbox; when the mailbox stays full past [`PUBLISH_DEADLINE`] the
//! delivery thread evicts the subscriber and closes its channel. The feed
//! only ever holds what arrives inside one deadline window, so a slow
//! consumer is cut off long before it can accumulate meaningful memory.
//! The output buffer is the authoritative record; delivery to live
//! subscribers is best-effort.

use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError, channel, sync_channel};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::job::{Job, Update};

/// Mailbox capacity per subscriber. Deliberately tiny so a slow consumer is
/// detected within a few chunks instead of after unbounded buffering.
pub const MAILBOX_CAPACITY: usize = 2;

/// How long a subscriber's delivery thread waits for mailbox space before
/// evicting it.
pub const PUBLISH_DEADLINE: Duration = Duration::from_millis(50);

/// Retry interval while waiting for mailbox space.
const PUBLISH_POLL: Duration = Duration::from_millis(2);

/// One registered subscriber: the feed into its delivery thread and the
/// token used for removal.
struct SubscriberSlot {
    token: u64,
    feed: Sender<Update>,
}

/// Mutable per-job state: the job record, its output buffer, and the live
/// subscriber list. Guarded by one mutex in the store; every operation on a
/// single job is serialized through it. Nothing here blocks: the waiting
/// and eviction of slow subscribers happens on their delivery threads.
pub(crate) struct Task {
    pub(crate) job: Job,
    buffer: Vec<u8>,
    discarded: u64,
    subscribers: Vec<SubscriberSlot>,
    closed: bool,
}

impl Task {
    pub(crate) fn new(job: Job) -> Task {
        Task {
            job,
            buffer: Vec::new(),
            discarded: 0,
            subscribers: Vec::new(),
            closed: false,
        }
    }

    /// Point-in-time copy of the output buffer.
    pub(crate) fn buffer_snapshot(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    /// Bytes discarded from the front of the buffer by the rolling cap.
    pub(crate) fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Append a chunk to the buffer, applying the rolling cap, and hand it
    /// to every live subscriber's delivery thread. The buffer write always
    /// happens first, so the authoritative record never depends on
    /// subscriber health.
    pub(crate) fn append(&mut self, chunk: &[u8], max_buffer_bytes: u64) {
        self.buffer.extend_from_slice(chunk);
        if max_buffer_bytes > 0 && self.buffer.len() as u64 > max_buffer_bytes {
            let excess = self.buffer.len() - max_buffer_bytes as usize;
            self.buffer.drain(..excess);
            self.discarded += excess as u64;
        }
        let update = Update {
            job_id: self.job.id.clone(),
            status: self.job.status,
            chunk: chunk.to_vec(),
        };
        self.publish(update);
    }

    /// Hand one final status-only update to every subscriber, then drop all
    /// feeds. Each delivery thread drains what it holds — ending with the
    /// terminal update — and closes its subscriber's mailbox. No further
    /// subscription is admitted.
    pub(crate) fn publish_terminal(&mut self) {
        let update = Update {
            job_id: self.job.id.clone(),
            status: self.job.status,
            chunk: Vec::new(),
        };
        self.publish(update);
        self.subscribers.clear();
        self.closed = true;
    }

    /// True once the terminal broadcast has happened.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register a new subscriber: spawn its delivery thread and hand back
    /// its mailbox.
    pub(crate) fn add_subscriber(&mut self, token: u64) -> Receiver<Update> {
        let (feed_tx, feed_rx) = channel();
        let (mailbox_tx, mailbox_rx) = sync_channel(MAILBOX_CAPACITY);
        let job_id = self.job.id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("deliver-{token}"))
            .spawn(move || delivery_loop(feed_rx, mailbox_tx, job_id, token));
        match spawned {
            Ok(_) => {
                self.subscribers.push(SubscriberSlot {
                    token,
                    feed: feed_tx,
                });
                debug!(job_id = %self.job.id, token, subscribers = self.subscribers.len(), "subscriber added");
            }
            Err(e) => {
                // Without a delivery thread the subscriber can never be
                // served; the dropped mailbox sender closes its channel.
                warn!(job_id = %self.job.id, token, error = %e, "could not spawn delivery thread");
            }
        }
        mailbox_rx
    }

    /// Remove a subscriber by token. Idempotent. Dropping the feed ends its
    /// delivery thread, which closes the mailbox.
    pub(crate) fn remove_subscriber(&mut self, token: u64) {
        self.subscribers.retain(|s| s.token != token);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Non-blocking fan-out: one send into each subscriber's feed. A feed
    /// whose delivery thread has exited (eviction, or the consumer went
    /// away) is pruned here.
    fn publish(&mut self, update: Update) {
        if self.subscribers.is_empty() {
            return;
        }
        let job_id = &self.job.id;
        self.subscribers.retain(|slot| {
            if slot.feed.send(update.clone()).is_ok() {
                true
            } else {
                debug!(job_id = %job_id, token = slot.token, "pruning finished subscriber");
                false
            }
        });
    }
}

/// Per-subscriber delivery loop: moves updates from the feed into the
/// bounded mailbox in arrival order. When the mailbox stays full past
/// [`PUBLISH_DEADLINE`] the subscriber is stalled: the loop exits, dropping
/// both channel ends, which closes the mailbox and makes the publisher
/// prune the feed on its next send.
fn delivery_loop(
    feed: Receiver<Update>,
    mailbox: SyncSender<Update>,
    job_id: String,
    token: u64,
) {
    while let Ok(update) = feed.recv() {
        let mut update = update;
        let deadline = Instant::now() + PUBLISH_DEADLINE;
        loop {
            match mailbox.try_send(update) {
                Ok(()) => break,
                Err(TrySendError::Full(u)) => {
                    if Instant::now() >= deadline {
                        warn!(job_id = %job_id, token, "evicting stalled subscriber");
                        return;
                    }
                    update = u;
                    std::thread::sleep(PUBLISH_POLL);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
    // Feed closed after the terminal broadcast (or an unsubscribe); the
    // mailbox sender drops here, ending the subscriber's stream.
}
