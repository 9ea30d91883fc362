// SPDX-License-Identifier: MIT OR Apache-2.0

//! DMA memory handed out by a [`DeviceBackend`](crate::backend::DeviceBackend).
//!
//! The crate never allocates or pins physical memory itself. Descriptor rings live in contiguous
//! buffers locked through [`DeviceBackend::lock_contiguous`], and request payloads are pinned
//! page by page through [`DeviceBackend::lock_scatter_gather`]. Both are released by dropping the
//! returned handle.
//!
//! Memory shared with the device must be accessed with volatile operations and ordered with
//! [`std::sync::atomic::fence`]; the queue layer does both.
//!
//! [`DeviceBackend::lock_contiguous`]: crate::backend::DeviceBackend::lock_contiguous
//! [`DeviceBackend::lock_scatter_gather`]: crate::backend::DeviceBackend::lock_scatter_gather

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug, Display};

use crate::regions::{Permissions, RegisterRegion};

/* ---------------------------------------------------------------------------------------------- */

/// Largest transfer a single request may carry.
pub const MAX_TRANSFER_SIZE: usize = 0x0FFF_FFFF;

/// Transfer direction of a queue or request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DmaDirection {
    /// Host to card: the device reads host memory.
    H2c,
    /// Card to host: the device writes host memory.
    C2h,
}

impl DmaDirection {
    pub fn is_h2c(self) -> bool {
        self == DmaDirection::H2c
    }

    /// What the device may do with memory pinned for a transfer in this direction.
    pub fn device_permissions(self) -> Permissions {
        match self {
            DmaDirection::H2c => Permissions::Read,
            DmaDirection::C2h => Permissions::Write,
        }
    }
}

impl Display for DmaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DmaDirection::H2c => "H2C",
            DmaDirection::C2h => "C2H",
        })
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A locked, physically contiguous buffer visible both to the process and to the device.
///
/// Dropping it unlocks the memory.
pub trait DmaBuffer: Debug + Send + Sync {
    /// Process view of the buffer. Its length is at least what was requested.
    fn memory(&self) -> &dyn RegisterRegion;

    /// Address the device uses to reach the start of the buffer.
    fn bus_address(&self) -> u64;
}

/// One physically contiguous piece of a pinned user buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaPage {
    pub bus_address: u64,
    pub len: u32,
}

/// The pinned pages of a user buffer, in buffer order.
///
/// Dropping it unpins the memory.
pub trait ScatterGatherList: Debug + Send + Sync {
    fn pages(&self) -> &[DmaPage];
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
