// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;
use std::time::{Duration, Instant};

use crate::dma::{DmaDirection, ScatterGatherList};

/* ---------------------------------------------------------------------------------------------- */

/// Lifecycle of a [`DmaRequestContext`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaStatus {
    Uninitialized,
    /// Descriptors were published to the hardware.
    Started,
    /// The hardware reported every descriptor of the request as processed.
    Finished,
    Error,
}

/// Identifies a submitted request in its [`DmaCompletion`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// One memory-mapped transfer between a host buffer and a device offset.
///
/// The request owns its buffer while it is in flight. It comes back through the device's
/// completion channel (or inside a [`RejectedRequest`](crate::error::RejectedRequest)), at which
/// point the buffer holds the received data for C2H transfers.
#[derive(Debug)]
pub struct DmaRequestContext {
    direction: DmaDirection,
    queue_id: u16,
    buffer: Vec<u8>,
    offset: u64,
    status: DmaStatus,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl DmaRequestContext {
    /// A transfer of all of `buffer` to (H2C) or from (C2H) the device address `offset`, through
    /// queue `queue_id`.
    pub fn new(direction: DmaDirection, queue_id: u16, buffer: Vec<u8>, offset: u64) -> Self {
        DmaRequestContext {
            direction,
            queue_id,
            buffer,
            offset,
            status: DmaStatus::Uninitialized,
            started: None,
            finished: None,
        }
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn status(&self) -> DmaStatus {
        self.status
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished
    }

    /// Time between submission and completion, once both happened.
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.finished?.saturating_duration_since(self.started?))
    }

    pub(crate) fn buffer_ptr(&mut self) -> *mut u8 {
        self.buffer.as_mut_ptr()
    }

    pub(crate) fn reset(&mut self) {
        self.status = DmaStatus::Uninitialized;
        self.started = None;
        self.finished = None;
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.started = Some(Instant::now());
    }

    pub(crate) fn set_status(&mut self, status: DmaStatus) {
        self.status = status;
    }

    pub(crate) fn finish(&mut self, status: DmaStatus) {
        self.status = status;
        self.finished = Some(Instant::now());
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A request handed back by the completion poller.
#[derive(Debug)]
pub struct DmaCompletion {
    pub id: RequestId,
    pub request: DmaRequestContext,
}

/// A submitted request together with the pinned pages backing it.
#[derive(Debug)]
pub(crate) struct InFlightRequest {
    pub(crate) id: RequestId,
    pub(crate) request: DmaRequestContext,
    pub(crate) pages: Box<dyn ScatterGatherList>,
}

impl InFlightRequest {
    /// Unpin the pages and stamp the request with its final status.
    pub(crate) fn complete(self, status: DmaStatus) -> DmaCompletion {
        let InFlightRequest {
            id,
            mut request,
            pages,
        } = self;

        drop(pages);
        request.finish(status);

        DmaCompletion { id, request }
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaPage;

    #[derive(Debug)]
    struct NoPages;

    impl ScatterGatherList for NoPages {
        fn pages(&self) -> &[DmaPage] {
            &[]
        }
    }

    #[test]
    fn test_request_lifecycle() {
        let mut request = DmaRequestContext::new(DmaDirection::C2h, 3, vec![0; 4096], 0x1000);
        assert_eq!(request.status(), DmaStatus::Uninitialized);
        assert_eq!(request.bytes(), 4096);
        assert!(request.elapsed().is_none());

        request.mark_submitted();
        request.set_status(DmaStatus::Started);

        let completion = InFlightRequest {
            id: RequestId(7),
            request,
            pages: Box::new(NoPages),
        }
        .complete(DmaStatus::Finished);

        assert_eq!(completion.id.to_string(), "#7");
        assert_eq!(completion.request.status(), DmaStatus::Finished);
        assert!(completion.request.elapsed().is_some());

        let mut request = completion.request;
        request.reset();
        assert_eq!(request.status(), DmaStatus::Uninitialized);
        assert!(request.started_at().is_none() && request.finished_at().is_none());
    }
}

/* ---------------------------------------------------------------------------------------------- */
