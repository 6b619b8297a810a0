//! Software TX queues.
//!
//! There is one FIFO per traffic priority, with the highest index being reserved for control
//! and management traffic. Every queue has its own lock, so producers enqueueing into one queue
//! don't contend with the scheduler draining another.
use alloc::{collections::VecDeque, vec::Vec};
use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{DefaultRawMutex, HciError, HciResult};

struct QueueState<F> {
    frames: VecDeque<F>,
    paused: bool,
}

/// A single software queue.
///
/// Frames are added and removed through [TxQueues], which keeps the global frame counter in step
/// with the queue contents, by updating it under the queue lock.
pub struct SoftwareQueue<F> {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<QueueState<F>>>,
    sent_count: AtomicU64,
}
impl<F> SoftwareQueue<F> {
    pub fn new() -> Self {
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(QueueState {
                frames: VecDeque::new(),
                paused: false,
            })),
            sent_count: AtomicU64::new(0),
        }
    }
    fn with_state<R>(&self, f: impl FnOnce(&mut QueueState<F>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    /// Add a frame to the queue and return the new length.
    ///
    /// Frames enqueued at the head are sent before anything already in the queue.
    fn push(&self, frame: F, at_head: bool, queued: &AtomicUsize) -> usize {
        self.with_state(|state| {
            if at_head {
                state.frames.push_front(frame);
            } else {
                state.frames.push_back(frame);
            }
            queued.fetch_add(1, Ordering::Relaxed);
            state.frames.len()
        })
    }
    /// Put frames, which were taken out of the queue but couldn't be sent, back at the head.
    ///
    /// The frames keep their original order.
    fn requeue(&self, frames: &mut Vec<F>, queued: &AtomicUsize) {
        self.with_state(|state| {
            queued.fetch_add(frames.len(), Ordering::Relaxed);
            while let Some(frame) = frames.pop() {
                state.frames.push_front(frame);
            }
        });
    }
    /// Take the oldest frame out of the queue, if it satisfies the predicate.
    fn pop_if(&self, predicate: impl FnOnce(&F) -> bool, queued: &AtomicUsize) -> Option<F> {
        self.with_state(|state| {
            if !predicate(state.frames.front()?) {
                return None;
            }
            let frame = state.frames.pop_front()?;
            queued.fetch_sub(1, Ordering::Relaxed);
            Some(frame)
        })
    }
    fn take_all(&self, queued: &AtomicUsize) -> VecDeque<F> {
        self.with_state(|state| {
            let frames = core::mem::take(&mut state.frames);
            queued.fetch_sub(frames.len(), Ordering::Relaxed);
            frames
        })
    }
    /// Inspect the queued frames under the queue lock, without removing them.
    pub fn inspect<R>(&self, f: impl FnOnce(&VecDeque<F>) -> R) -> R {
        self.with_state(|state| f(&state.frames))
    }
    pub fn len(&self) -> usize {
        self.with_state(|state| state.frames.len())
    }
    pub fn is_empty(&self) -> bool {
        self.with_state(|state| state.frames.is_empty())
    }
    pub fn is_paused(&self) -> bool {
        self.with_state(|state| state.paused)
    }
    pub fn set_paused(&self, paused: bool) {
        self.with_state(|state| state.paused = paused);
    }
    /// Check if the scheduler should look at this queue.
    pub fn is_schedulable(&self) -> bool {
        self.with_state(|state| !state.paused && !state.frames.is_empty())
    }
    pub(crate) fn record_sent(&self, count: usize) {
        self.sent_count.fetch_add(count as u64, Ordering::Relaxed);
    }
    /// The amount of frames sent from this queue.
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }
}
impl<F> Default for SoftwareQueue<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of all software queues, with a global frame counter.
pub struct TxQueues<F> {
    queues: Vec<SoftwareQueue<F>>,
    queued: AtomicUsize,
}
impl<F> TxQueues<F> {
    pub fn new(queue_count: usize) -> Self {
        Self {
            queues: (0..queue_count).map(|_| SoftwareQueue::new()).collect(),
            queued: AtomicUsize::new(0),
        }
    }
    /// Returns the queue with the specified ID.
    pub fn get(&self, queue_id: usize) -> HciResult<&SoftwareQueue<F>> {
        self.queues.get(queue_id).ok_or(HciError::InvalidQueue)
    }
    /// Iterate over the queue IDs from highest to lowest priority.
    pub fn by_priority(&self) -> impl Iterator<Item = usize> {
        (0..self.queues.len()).rev()
    }
    pub fn push(&self, queue_id: usize, frame: F, at_head: bool) -> HciResult<usize> {
        Ok(self
            .get(queue_id)?
            .push(frame, at_head, &self.queued))
    }
    pub fn pop(&self, queue_id: usize) -> Option<F> {
        self.pop_if(queue_id, |_| true)
    }
    /// Take the oldest frame out of the queue, if it satisfies the predicate.
    pub fn pop_if(&self, queue_id: usize, predicate: impl FnOnce(&F) -> bool) -> Option<F> {
        self.queues
            .get(queue_id)?
            .pop_if(predicate, &self.queued)
    }
    pub fn requeue(&self, queue_id: usize, frames: &mut Vec<F>) {
        if let Some(queue) = self.queues.get(queue_id) {
            queue.requeue(frames, &self.queued);
        }
    }
    pub fn take_all(&self, queue_id: usize) -> HciResult<VecDeque<F>> {
        Ok(self.get(queue_id)?.take_all(&self.queued))
    }
    /// Take the frames out of every queue, highest priority first.
    pub fn take_all_queues(&self) -> impl Iterator<Item = (usize, VecDeque<F>)> + '_ {
        self.queues
            .iter()
            .enumerate()
            .rev()
            .map(|(queue_id, queue)| (queue_id, queue.take_all(&self.queued)))
    }
    /// The total amount of frames in all queues.
    pub fn total(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}
