// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;

use thiserror::Error;

use crate::request::DmaRequestContext;

/* ---------------------------------------------------------------------------------------------- */

/// Errors returned by queue, request, and device operations.
///
/// Each variant carries a message with the queue ids, register values, or sizes involved. The
/// same message is what [`QdmaDevice::last_error`](crate::device::QdmaDevice::last_error)
/// reports.
#[derive(Debug, Error)]
pub enum QdmaError {
    /// A queue id, size index, or other argument is out of range, or a queue is not in the state
    /// the operation requires.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation had already been performed, e.g. registering events twice.
    #[error("operation already done: {0}")]
    OperationAlreadyDone(String),

    /// No ring credits, a full request tracker, or no DMA memory.
    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),

    /// The hardware did not reach the expected register state in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The hardware reported an error or lacks a required capability.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// An internal structure was not in a state that allows the operation, e.g. dequeuing from an
    /// empty request tracker.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Register access or DMA locking failed in the backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, QdmaError>;

/* ---------------------------------------------------------------------------------------------- */

/// A request that could not be submitted, handed back to the caller along with the reason.
///
/// The request's status is [`DmaStatus::Error`](crate::request::DmaStatus::Error) and its
/// buffer is no longer locked.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RejectedRequest {
    #[source]
    pub error: QdmaError,
    pub request: DmaRequestContext,
}

impl RejectedRequest {
    pub fn into_inner(self) -> (QdmaError, DmaRequestContext) {
        (self.error, self.request)
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = QdmaError::InvalidParameter("queue 600 out of range".to_string());
        assert_eq!(e.to_string(), "invalid parameter: queue 600 out of range");

        let io_error = io::Error::new(io::ErrorKind::InvalidInput, "bad offset");
        let e: QdmaError = io_error.into();
        assert!(matches!(e, QdmaError::Io(_)));
        assert_eq!(e.to_string(), "I/O error: bad offset");
    }
}

/* ---------------------------------------------------------------------------------------------- */
