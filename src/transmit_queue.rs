use std::collections::VecDeque;
use crate::out_message::OutMessage;

/// Ordered collection of outbound messages with a round-robin cursor that
///  survives between send passes.
///
/// The rotation point is the front of the deque: a [Cycle] visits each
///  element at most once starting there, and [Cycle::advance] rotates the
///  visited element to the back. Stopping a cycle early therefore leaves the
///  rotation point after the last element the caller advanced past, so the
///  next cycle picks up where the previous one left off instead of restarting
///  at the oldest message. A message with a large payload cannot starve its
///  neighbors.
#[derive(Debug, Default)]
pub struct TransmitQueue {
    messages: VecDeque<OutMessage>,
}

impl TransmitQueue {
    pub fn insert(&mut self, message: OutMessage) {
        self.messages.push_back(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Starts a traversal over the messages currently in the queue. Mutation
    ///  during the traversal goes through the cursor only.
    pub fn cycle(&mut self) -> Cycle<'_> {
        let remaining = self.messages.len();
        Cycle {
            queue: self,
            remaining,
        }
    }
}

/// Cursor-style traversal handle, obtained from [TransmitQueue::cycle].
pub struct Cycle<'a> {
    queue: &'a mut TransmitQueue,
    remaining: usize,
}

impl Cycle<'_> {
    /// The element under the cursor, or None once every element present at
    ///  the start of the cycle has been visited.
    pub fn current(&mut self) -> Option<&mut OutMessage> {
        if self.remaining == 0 {
            return None;
        }
        self.queue.messages.front_mut()
    }

    /// Removes the current element. The cursor moves to the next one.
    pub fn erase(&mut self) {
        debug_assert!(self.remaining > 0);
        self.queue.messages.pop_front();
        self.remaining -= 1;
    }

    /// Keeps the current element and moves the cursor past it; the element
    ///  is re-visited one full rotation later.
    pub fn advance(&mut self) {
        debug_assert!(self.remaining > 0);
        if let Some(message) = self.queue.messages.pop_front() {
            self.queue.messages.push_back(message);
        }
        self.remaining -= 1;
    }
}
