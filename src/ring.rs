// SPDX-License-Identifier: MIT OR Apache-2.0

//! Descriptor rings.
//!
//! A ring of hardware size `size` occupies `size` descriptor slots of [`DESCRIPTOR_SIZE`] bytes in
//! one contiguous DMA buffer. The first `capacity = size - 1` slots hold descriptors; the last one
//! holds the writeback status the engine updates with its consumer index.

/* ---------------------------------------------------------------------------------------------- */

use std::mem;

use log::{trace, warn};
use static_assertions::const_assert_eq;

use crate::backend::DeviceBackend;
use crate::dma::DmaBuffer;
use crate::error::{QdmaError, Result};
use crate::regions::structured::{field_set, BitFieldWriteable, RegisterRo, RegisterRw};
use crate::regions::{AsSubregion, BackedBySubregion, RegisterRegion};
use crate::{_bit_range, register_bit_field, register_block};

/* ---------------------------------------------------------------------------------------------- */

/// Bytes per memory-mapped descriptor.
pub const DESCRIPTOR_SIZE: usize = 32;

/// Encoding of [`DESCRIPTOR_SIZE`] in the software context.
pub const DESCRIPTOR_SIZE_CODE: u32 = 2;

const DESCRIPTOR_LENGTH: u64 = _bit_range!(u64, 0, 27);
const DESCRIPTOR_VALID: u64 = 1 << 28;
const DESCRIPTOR_SOP: u64 = 1 << 29;
const DESCRIPTOR_EOP: u64 = 1 << 30;

/// Largest byte count one descriptor can carry.
pub const MAX_DESCRIPTOR_LENGTH: u32 = DESCRIPTOR_LENGTH as u32;

/// A memory-mapped descriptor, laid out as the engine reads it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MmDescriptor {
    pub source: u64,
    pub control: u64,
    pub destination: u64,
    pub reserved: u64,
}

const_assert_eq!(mem::size_of::<MmDescriptor>(), DESCRIPTOR_SIZE);

impl MmDescriptor {
    /// A valid descriptor moving `length` bytes from `source` to `destination`.
    pub fn new(source: u64, destination: u64, length: u32, sop: bool, eop: bool) -> Self {
        let mut control = field_set(DESCRIPTOR_LENGTH, u64::from(length)) | DESCRIPTOR_VALID;
        if sop {
            control |= DESCRIPTOR_SOP;
        }
        if eop {
            control |= DESCRIPTOR_EOP;
        }

        MmDescriptor {
            source,
            control,
            destination,
            reserved: 0,
        }
    }
}

register_bit_field! {
    pub struct MmDescriptorControl<'a> : RW u64 {
        length @ 0--27  : RW u32,
        valid  @ 28     : RW,
        sop    @ 29     : RW,
        eop    @ 30     : RW,
        __     @ 31--63 : RsvdZ,
    }
}

register_block! {
    /// One descriptor slot of a ring.
    pub struct MmDescriptorSlot<'a> : 32 {
        source      @ 0x00 : RegisterRw<'a, u64>,
        control     @ 0x08 : MmDescriptorControl<'a>,
        destination @ 0x10 : RegisterRw<'a, u64>,
    }

    /// Indices the engine writes back into the last slot of the ring.
    pub struct WritebackStatus<'a> : 4 {
        pidx @ 0x0 : RegisterRo<'a, u16>,
        cidx @ 0x2 : RegisterRo<'a, u16>,
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Descriptor counters of one ring.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RingStats {
    /// Written to the ring.
    pub accepted: u64,
    /// Reported consumed by the engine.
    pub processed: u64,
    /// Reported consumed while no request was waiting for them.
    pub dropped: u64,
}

/// Distance from `short` forward to `long` on a ring of `capacity` slots.
///
/// Equal indices count as a full lap.
pub fn index_delta(long: u32, short: u32, capacity: u32) -> u32 {
    if short < long {
        long - short
    } else {
        capacity + long - short
    }
}

/// A descriptor ring in locked DMA memory.
#[derive(Debug)]
pub struct RingBuffer {
    size: u32,
    capacity: u32,
    hw_index: u32,
    sw_index: u32,
    credits: u32,
    stats: RingStats,
    buffer: Box<dyn DmaBuffer>,
}

impl RingBuffer {
    /// Bytes of DMA memory a ring of hardware size `size` needs, writeback slot included.
    pub fn required_bytes(size: u32) -> usize {
        size as usize * DESCRIPTOR_SIZE
    }

    /// Lock a zero-filled buffer for a ring of hardware size `size`.
    pub fn new(backend: &dyn DeviceBackend, size: u32) -> Result<Self> {
        if size < 3 {
            return Err(QdmaError::InvalidParameter(format!(
                "ring size {} leaves no usable descriptors",
                size
            )));
        }

        let required = Self::required_bytes(size);
        let buffer = backend.lock_contiguous(required).map_err(|e| {
            QdmaError::ResourceExhausted(format!(
                "failed to lock {} bytes for a descriptor ring: {}",
                required, e
            ))
        })?;

        if buffer.memory().len() < required as u64 {
            return Err(QdmaError::ResourceExhausted(format!(
                "descriptor ring buffer holds {} bytes, {} needed",
                buffer.memory().len(),
                required
            )));
        }

        let memory = buffer.memory();
        for offset in (0..required as u64).step_by(mem::size_of::<u64>()) {
            memory.write_le_u64(offset, 0)?;
        }

        let capacity = size - 1;

        trace!(
            "Locked ring of {} descriptors at bus address {:#x}",
            capacity,
            buffer.bus_address()
        );

        Ok(RingBuffer {
            size,
            capacity,
            hw_index: 0,
            sw_index: 0,
            credits: capacity - 1,
            stats: RingStats::default(),
            buffer,
        })
    }

    /// Hardware ring size, writeback slot included.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Descriptors that may be written before the engine reports progress.
    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// Next slot the engine will consume, as last reported.
    pub fn hw_index(&self) -> u32 {
        self.hw_index
    }

    /// Next slot software will write.
    pub fn sw_index(&self) -> u32 {
        self.sw_index
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    pub fn bus_address(&self) -> u64 {
        self.buffer.bus_address()
    }

    /// Whether every written descriptor was reported consumed.
    pub fn is_idle(&self) -> bool {
        self.credits == self.capacity - 1
    }

    pub fn advance(&self, index: u32, delta: u32) -> u32 {
        ((u64::from(index) + u64::from(delta)) % u64::from(self.capacity)) as u32
    }

    pub fn descriptor_slot(&self, index: u32) -> Result<MmDescriptorSlot<'_>> {
        if index >= self.capacity {
            return Err(QdmaError::InvalidParameter(format!(
                "descriptor index {} outside ring of {}",
                index, self.capacity
            )));
        }

        let offset = u64::from(index) * DESCRIPTOR_SIZE as u64;
        Ok(MmDescriptorSlot::backed_by(
            self.buffer.memory().subregion(offset..),
        ))
    }

    pub fn write_descriptor(&self, index: u32, descriptor: &MmDescriptor) -> Result<()> {
        let slot = self.descriptor_slot(index)?;
        slot.source().write(descriptor.source)?;
        slot.destination().write(descriptor.destination)?;
        slot.control().write(descriptor.control)?;
        Ok(())
    }

    pub fn writeback(&self) -> WritebackStatus<'_> {
        WritebackStatus::backed_by(self.buffer.memory().subregion(self.writeback_offset()..))
    }

    pub(crate) fn writeback_offset(&self) -> u64 {
        u64::from(self.capacity) * DESCRIPTOR_SIZE as u64
    }

    pub(crate) fn memory(&self) -> &dyn RegisterRegion {
        self.buffer.memory()
    }

    /// Account for `count` descriptors written ending before `new_sw_index`.
    pub(crate) fn publish(&mut self, new_sw_index: u32, count: u32) {
        self.credits -= count;
        self.sw_index = new_sw_index;
    }

    /// Undo a [`publish`](Self::publish) the hardware was never told about.
    pub(crate) fn unpublish(&mut self, old_sw_index: u32, count: u32) {
        self.credits += count;
        self.sw_index = old_sw_index;
    }

    pub(crate) fn record_accepted(&mut self, count: u32) {
        self.stats.accepted += u64::from(count);
    }

    pub(crate) fn record_dropped(&mut self, count: u32) {
        self.stats.dropped += u64::from(count);
    }

    /// Move the hardware index to `cidx`, returning the descriptors it consumed since the last
    /// call.
    pub(crate) fn reclaim(&mut self, cidx: u32) -> u32 {
        if cidx == self.hw_index {
            return 0;
        }

        let completed = index_delta(cidx, self.hw_index, self.capacity);
        let max_credits = self.capacity - 1;
        if self.credits + completed > max_credits {
            warn!(
                "Writeback cidx {} reports {} descriptors consumed, only {} were outstanding",
                cidx,
                completed,
                max_credits - self.credits
            );
        }
        self.credits = (self.credits + completed).min(max_credits);
        self.stats.processed += u64::from(completed);
        self.hw_index = cidx;

        completed
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if !self.is_idle() {
            warn!(
                "Releasing descriptor ring with {} descriptors pending",
                self.capacity - 1 - self.credits
            );
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::SimulatedDevice;
    use crate::regions::structured::BitFieldReadable;
    use proptest::prelude::*;

    #[test]
    fn test_ring_of_513_uses_512_descriptors() {
        let device = SimulatedDevice::new();
        let ring = RingBuffer::new(&device, 513).unwrap();

        assert_eq!(ring.capacity(), 512);
        assert_eq!(ring.capacity() as usize * DESCRIPTOR_SIZE, 16384);
        assert_eq!(RingBuffer::required_bytes(513), 16384 + DESCRIPTOR_SIZE);
        assert_eq!(ring.memory().len(), RingBuffer::required_bytes(513) as u64);
        assert_eq!(ring.writeback_offset(), 16384);
        assert_eq!(ring.credits(), 511);
        assert_eq!((ring.hw_index(), ring.sw_index()), (0, 0));
        assert_eq!(ring.writeback().cidx().read().unwrap(), 0);
    }

    #[test]
    fn test_ring_too_small() {
        let device = SimulatedDevice::new();
        assert!(matches!(
            RingBuffer::new(&device, 2),
            Err(QdmaError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_descriptor_encoding() {
        let device = SimulatedDevice::new();
        let ring = RingBuffer::new(&device, 65).unwrap();

        let descriptor = MmDescriptor::new(0xAAAA_0000, 0x40, 4096, true, false);
        ring.write_descriptor(5, &descriptor).unwrap();

        let slot = ring.descriptor_slot(5).unwrap();
        assert_eq!(slot.source().read().unwrap(), 0xAAAA_0000);
        assert_eq!(slot.destination().read().unwrap(), 0x40);
        assert_eq!(slot.control().length().read().unwrap(), 4096);
        assert!(slot.control().valid().read().unwrap());
        assert!(slot.control().sop().read().unwrap());
        assert!(!slot.control().eop().read().unwrap());
        assert_eq!(slot.control().read().unwrap(), 0x3000_1000);

        assert!(ring.descriptor_slot(64).is_err());
    }

    #[test]
    fn test_reclaim_wraps_and_counts() {
        let device = SimulatedDevice::new();
        let mut ring = RingBuffer::new(&device, 65).unwrap();

        let end = ring.advance(0, 60);
        ring.publish(end, 60);
        ring.record_accepted(60);
        assert_eq!(ring.credits(), 3);

        assert_eq!(ring.reclaim(60), 60);
        assert!(ring.is_idle());

        let end = ring.advance(60, 10);
        assert_eq!(end, 6);
        ring.publish(end, 10);
        assert_eq!(ring.reclaim(6), 10);
        assert_eq!(ring.reclaim(6), 0);
        assert_eq!(ring.stats().processed, 70);
    }

    #[test]
    fn test_reclaim_beyond_published_keeps_credits_bounded() {
        let device = SimulatedDevice::new();
        let mut ring = RingBuffer::new(&device, 65).unwrap();

        let end = ring.advance(0, 2);
        ring.publish(end, 2);
        assert_eq!(ring.credits(), 61);

        assert_eq!(ring.reclaim(5), 5);
        assert_eq!(ring.credits(), ring.capacity() - 1);
        assert!(ring.is_idle());
        assert_eq!(ring.hw_index(), 5);
    }

    proptest! {
        #[test]
        fn test_advance_by_capacity_is_identity(size in 3u32..20000, index in 0u32..19999) {
            let capacity = size - 1;
            let index = index % capacity;
            let advanced = ((u64::from(index) + u64::from(capacity)) % u64::from(capacity)) as u32;
            prop_assert_eq!(advanced, index);
        }

        #[test]
        fn test_index_delta_inverts_advance(capacity in 2u32..20000, start in 0u32..20000, delta in 1u32..20000) {
            let start = start % capacity;
            let delta = 1 + delta % (capacity - 1).max(1);
            prop_assume!(delta < capacity);
            let end = (start + delta) % capacity;
            prop_assert_eq!(index_delta(end, start, capacity), delta);
        }
    }

    #[test]
    fn test_ring_advance_by_capacity() {
        let device = SimulatedDevice::new();
        let ring = RingBuffer::new(&device, 129).unwrap();
        for index in [0, 1, 64, 127] {
            assert_eq!(ring.advance(index, ring.capacity()), index);
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */
