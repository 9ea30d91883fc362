// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use crate::dma::{DmaBuffer, DmaDirection, ScatterGatherList};
use crate::regions::RegisterRegion;

/* ---------------------------------------------------------------------------------------------- */

/// Access to one opened QDMA PCIe function, supplied by the integrator.
///
/// Whatever maps the BARs and pins memory (a kernel driver, VFIO, a simulator) implements this
/// trait. Mapped BARs and locked buffers are exposed as [`MemoryRegion`]s.
///
/// [`MemoryRegion`]: crate::regions::MemoryRegion
pub trait DeviceBackend: Debug + Send + Sync {
    fn vendor_id(&self) -> u16;

    fn device_id(&self) -> u16;

    /// Number of address spaces (BARs) the function exposes, including unmapped ones.
    fn num_bars(&self) -> usize;

    /// BAR `index`, or `None` if it is absent or not mapped.
    fn bar(&self, index: usize) -> Option<&dyn RegisterRegion>;

    /// Allocate and lock a physically contiguous buffer of at least `length` bytes that is
    /// reachable by the device.
    fn lock_contiguous(&self, length: usize) -> io::Result<Box<dyn DmaBuffer>>;

    /// Pin `length` bytes at `address` for a transfer in `direction` and return their pages.
    ///
    /// # Safety
    ///
    /// The memory must remain valid, and must not be moved or freed, until the returned list is
    /// dropped.
    unsafe fn lock_scatter_gather(
        &self,
        address: *mut u8,
        length: usize,
        direction: DmaDirection,
    ) -> io::Result<Box<dyn ScatterGatherList>>;
}

/* ---------------------------------------------------------------------------------------------- */

impl<T: DeviceBackend + ?Sized> DeviceBackend for Arc<T> {
    fn vendor_id(&self) -> u16 {
        (**self).vendor_id()
    }

    fn device_id(&self) -> u16 {
        (**self).device_id()
    }

    fn num_bars(&self) -> usize {
        (**self).num_bars()
    }

    fn bar(&self, index: usize) -> Option<&dyn RegisterRegion> {
        (**self).bar(index)
    }

    fn lock_contiguous(&self, length: usize) -> io::Result<Box<dyn DmaBuffer>> {
        (**self).lock_contiguous(length)
    }

    unsafe fn lock_scatter_gather(
        &self,
        address: *mut u8,
        length: usize,
        direction: DmaDirection,
    ) -> io::Result<Box<dyn ScatterGatherList>> {
        unsafe { (**self).lock_scatter_gather(address, length, direction) }
    }
}

/* ---------------------------------------------------------------------------------------------- */
