//! Kernel events and the queue that orders them.
//!
//! The queue is a binary min-heap keyed by `(time, sequence)`. The sequence
//! number is assigned at push time, so events scheduled for the same instant
//! pop in the order they were scheduled.

use super::channel::ChannelId;
use super::process::ProcessId;
use super::Kernel;
use crate::error::SimError;
use std::any::Any;
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

/// A closure run by the kernel at a scheduled instant.
pub type Action<W> = Box<dyn FnOnce(&mut Kernel<W>) -> Result<(), SimError>>;

/// Where a suspended process picks up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continuation {
    Start,
    Delay,
    /// A value landed on a channel the process is waiting on.
    Ready(ChannelId),
}

pub(crate) enum Event<W> {
    /// Run an arbitrary kernel action.
    Dispatch(Action<W>),
    /// Continue a logical process.
    Resume {
        pid: ProcessId,
        continuation: Continuation,
    },
    /// Wake a process unless the timeout was cancelled first.
    Timeout {
        pid: ProcessId,
        tag: u64,
        cancelled: Rc<Cell<bool>>,
    },
    /// Deliver a value into a channel's slot.
    Send {
        channel: ChannelId,
        payload: Box<dyn Any>,
    },
}

struct TimedEvent<W> {
    time_ms: u64,
    sequence: u64,
    event: Event<W>,
}

impl<W> PartialEq for TimedEvent<W> {
    fn eq(&self, other: &Self) -> bool {
        self.time_ms == other.time_ms && self.sequence == other.sequence
    }
}

impl<W> Eq for TimedEvent<W> {}

impl<W> PartialOrd for TimedEvent<W> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<W> Ord for TimedEvent<W> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want min-heap
        other
            .time_ms
            .cmp(&self.time_ms)
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// Ordered multiset of time-stamped events.
pub(crate) struct EventQueue<W> {
    heap: BinaryHeap<TimedEvent<W>>,
    /// Sequence counter for tie-breaking.
    sequence: u64,
}

impl<W> EventQueue<W> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            sequence: 0,
        }
    }

    pub(crate) fn push(&mut self, time_ms: u64, event: Event<W>) {
        self.heap.push(TimedEvent {
            time_ms,
            sequence: self.sequence,
            event,
        });
        self.sequence += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<(u64, Event<W>)> {
        self.heap.pop().map(|e| (e.time_ms, e.event))
    }

    pub(crate) fn peek_time(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.time_ms)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
