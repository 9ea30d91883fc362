// SPDX-License-Identifier: MIT OR Apache-2.0

//! FIFO of in-flight requests, one per queue direction.
//!
//! A request spans one descriptor per page, and the hardware reports progress in descriptors, so
//! each entry remembers how many of its descriptors are still outstanding.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::Debug;

use thiserror::Error;

use crate::error::{QdmaError, Result};

/* ---------------------------------------------------------------------------------------------- */

#[derive(Debug)]
pub struct TrackedRequest<T> {
    /// Descriptors of this request the hardware has not consumed yet.
    pub num_descriptors: u32,
    pub context: T,
}

/// Returned by [`RequestTracker::enqueue`] when there is no free slot. Gives the context back.
#[derive(Debug, Error)]
#[error("request tracker is full ({capacity} slots)")]
pub struct TrackerFull<T: Debug> {
    pub capacity: usize,
    pub context: T,
}

/// A circular array of [`TrackedRequest`]s.
///
/// One slot always stays unused so that a full tracker can be told apart from an empty one:
/// enqueueing fails once `(producer + 1) % capacity == consumer`.
#[derive(Debug)]
pub struct RequestTracker<T> {
    slots: Vec<Option<TrackedRequest<T>>>,
    producer: usize,
    consumer: usize,
}

impl<T: Debug> RequestTracker<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(QdmaError::InvalidParameter(format!(
                "request tracker capacity {} is too small",
                capacity
            )));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| QdmaError::ResourceExhausted(format!("request tracker: {}", e)))?;
        slots.resize_with(capacity, || None);

        Ok(RequestTracker {
            slots,
            producer: 0,
            consumer: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        if self.producer >= self.consumer {
            self.producer - self.consumer
        } else {
            self.capacity() + self.producer - self.consumer
        }
    }

    pub fn is_empty(&self) -> bool {
        self.producer == self.consumer
    }

    pub fn is_full(&self) -> bool {
        (self.producer + 1) % self.capacity() == self.consumer
    }

    pub fn enqueue(
        &mut self,
        num_descriptors: u32,
        context: T,
    ) -> std::result::Result<(), TrackerFull<T>> {
        if self.is_full() {
            return Err(TrackerFull {
                capacity: self.capacity(),
                context,
            });
        }

        self.slots[self.producer] = Some(TrackedRequest {
            num_descriptors,
            context,
        });
        self.producer = (self.producer + 1) % self.capacity();

        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<TrackedRequest<T>> {
        if self.is_empty() {
            return Err(QdmaError::InvalidState(
                "dequeue from an empty request tracker".to_string(),
            ));
        }

        let entry = self.slots[self.consumer].take();
        self.consumer = (self.consumer + 1) % self.capacity();

        entry.ok_or_else(|| {
            QdmaError::InvalidState(format!("request tracker slot {} is vacant", self.consumer))
        })
    }

    pub fn peek(&self) -> Result<&TrackedRequest<T>> {
        self.slots[self.consumer]
            .as_ref()
            .filter(|_| !self.is_empty())
            .ok_or_else(|| QdmaError::InvalidState("request tracker is empty".to_string()))
    }

    pub fn peek_mut(&mut self) -> Result<&mut TrackedRequest<T>> {
        if self.is_empty() {
            return Err(QdmaError::InvalidState(
                "request tracker is empty".to_string(),
            ));
        }

        self.slots[self.consumer]
            .as_mut()
            .ok_or_else(|| QdmaError::InvalidState("request tracker head is vacant".to_string()))
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<TrackedRequest<T>> {
        let mut drained = Vec::with_capacity(self.len());
        while let Ok(entry) = self.dequeue() {
            drained.push(entry);
        }
        drained
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
