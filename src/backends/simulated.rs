// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [`DeviceBackend`] over plain process memory.
//!
//! BARs are zero-filled memory with just enough identification registers preset for
//! [`QdmaDevice::open`](crate::device::QdmaDevice::open) to recognize a memory-mapped QDMA
//! function. Nothing behaves like hardware on its own: the indirect context busy bit always reads
//! 0, and descriptor rings only make progress when a test writes their writeback status.
//!
//! "Bus addresses" of contiguous buffers come from a counter, and scatter/gather pages use the
//! process address of each page-sized chunk of the buffer.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::DeviceBackend;
use crate::dma::{DmaBuffer, DmaDirection, DmaPage, ScatterGatherList};
use crate::regions::{MemoryRegion, Permissions, RegisterRegion};
use crate::registers::QUEUE_CSR_WINDOW;

/* ---------------------------------------------------------------------------------------------- */

pub const SIMULATED_VENDOR_ID: u16 = 0x10EE;
pub const SIMULATED_DEVICE_ID: u16 = 0x903F;

/// Page size used to split scatter/gather buffers.
pub const SIMULATED_PAGE_SIZE: usize = 4096;

pub const CONFIG_BAR: usize = 0;
pub const USER_BAR: usize = 1;
const BYPASS_BAR: usize = 2;

const USER_BAR_LENGTH: usize = 0x1000;
const BYPASS_BAR_LENGTH: usize = 0x1000;

/* ---------------------------------------------------------------------------------------------- */

/// Zeroed, 8-byte aligned memory exposed as a [`MemoryRegion`].
struct Backing {
    words: Box<[u64]>,
    region: MemoryRegion<'static>,
}

impl Backing {
    fn new(length: usize) -> Backing {
        let mut words = vec![0u64; (length + 7) / 8].into_boxed_slice();
        // The boxed slice never moves or changes size, and `region` is dropped along with it.
        let region =
            unsafe { MemoryRegion::new_raw(words.as_mut_ptr().cast(), length, Permissions::ReadWrite) };
        Backing { words, region }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("length", &self.region.len())
            .field("words", &self.words.len())
            .finish()
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Counts live locks, and refuses new ones past a limit.
#[derive(Debug)]
struct LockCounter {
    live: AtomicUsize,
    limit: AtomicUsize,
}

impl LockCounter {
    fn new() -> Arc<LockCounter> {
        Arc::new(LockCounter {
            live: AtomicUsize::new(0),
            limit: AtomicUsize::new(usize::MAX),
        })
    }

    fn acquire(&self, what: &str) -> io::Result<()> {
        let limit = self.limit.load(Ordering::SeqCst);
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                if live < limit {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|live| {
                io::Error::new(
                    ErrorKind::OutOfMemory,
                    format!("{} limit of {} reached with {} live", what, limit, live),
                )
            })
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Debug)]
struct SimulatedDmaBuffer {
    backing: Backing,
    bus_address: u64,
    counter: Arc<LockCounter>,
}

impl DmaBuffer for SimulatedDmaBuffer {
    fn memory(&self) -> &dyn RegisterRegion {
        &self.backing.region
    }

    fn bus_address(&self) -> u64 {
        self.bus_address
    }
}

impl Drop for SimulatedDmaBuffer {
    fn drop(&mut self) {
        self.counter.release();
    }
}

#[derive(Debug)]
struct SimulatedScatterGatherList {
    pages: Vec<DmaPage>,
    counter: Arc<LockCounter>,
}

impl ScatterGatherList for SimulatedScatterGatherList {
    fn pages(&self) -> &[DmaPage] {
        &self.pages
    }
}

impl Drop for SimulatedScatterGatherList {
    fn drop(&mut self) {
        self.counter.release();
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A simulated memory-mapped QDMA physical function.
#[derive(Debug)]
pub struct SimulatedDevice {
    bars: Vec<Backing>,
    next_bus_address: AtomicU64,
    contiguous: Arc<LockCounter>,
    scatter_gather: Arc<LockCounter>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Config BAR 0, user BAR 1, bypass BAR 2. Memory-mapped engines enabled, streaming
    /// disabled, 512 queues, function 0.
    pub fn new() -> SimulatedDevice {
        let device = SimulatedDevice {
            bars: vec![
                Backing::new(QUEUE_CSR_WINDOW as usize),
                Backing::new(USER_BAR_LENGTH),
                Backing::new(BYPASS_BAR_LENGTH),
            ],
            next_bus_address: AtomicU64::new(0x1_0000_0000),
            contiguous: LockCounter::new(),
            scatter_gather: LockCounter::new(),
        };

        let presets: [(u64, u32); 6] = [
            (0x000, 0x1FD3_0000), // config block identifier
            (0x104, 0x0041_1041), // one BAR map per physical function
            (0x10C, 1 << (2 * USER_BAR)), // user BAR of function 0
            (0x118, 0x0000_0101), // MM H2C and C2H engines
            (0x120, 512),         // queues
            (0x134, 0x0000_0003), // mailbox, FLR
        ];
        for (offset, value) in presets.iter() {
            // The config BAR is large enough for every preset.
            let _ = device.bars[CONFIG_BAR].region.write_le_u32(*offset, *value);
        }

        device
    }

    /// Write a 32-bit register of BAR `bar`, e.g. to change what the device advertises before it
    /// is opened.
    pub fn write_register(&self, bar: usize, offset: u64, value: u32) -> io::Result<()> {
        self.bar_backing(bar)?.region.write_le_u32(offset, value)
    }

    pub fn read_register(&self, bar: usize, offset: u64) -> io::Result<u32> {
        self.bar_backing(bar)?.region.read_le_u32(offset)
    }

    /// Contiguous buffers currently locked.
    pub fn locked_buffers(&self) -> usize {
        self.contiguous.live.load(Ordering::SeqCst)
    }

    /// Scatter/gather lists currently pinned.
    pub fn pinned_lists(&self) -> usize {
        self.scatter_gather.live.load(Ordering::SeqCst)
    }

    /// Make [`DeviceBackend::lock_contiguous`] fail once `limit` buffers are locked.
    pub fn limit_locked_buffers(&self, limit: usize) {
        self.contiguous.limit.store(limit, Ordering::SeqCst);
    }

    fn bar_backing(&self, bar: usize) -> io::Result<&Backing> {
        self.bars.get(bar).ok_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("No BAR {}", bar))
        })
    }
}

impl DeviceBackend for SimulatedDevice {
    fn vendor_id(&self) -> u16 {
        SIMULATED_VENDOR_ID
    }

    fn device_id(&self) -> u16 {
        SIMULATED_DEVICE_ID
    }

    fn num_bars(&self) -> usize {
        self.bars.len()
    }

    fn bar(&self, index: usize) -> Option<&dyn RegisterRegion> {
        self.bars
            .get(index)
            .map(|backing| &backing.region as &dyn RegisterRegion)
    }

    fn lock_contiguous(&self, length: usize) -> io::Result<Box<dyn DmaBuffer>> {
        self.contiguous.acquire("Contiguous buffer")?;

        let span = ((length + SIMULATED_PAGE_SIZE - 1) / SIMULATED_PAGE_SIZE).max(1)
            * SIMULATED_PAGE_SIZE;
        let bus_address = self
            .next_bus_address
            .fetch_add(span as u64, Ordering::SeqCst);

        Ok(Box::new(SimulatedDmaBuffer {
            backing: Backing::new(length),
            bus_address,
            counter: Arc::clone(&self.contiguous),
        }))
    }

    unsafe fn lock_scatter_gather(
        &self,
        address: *mut u8,
        length: usize,
        _direction: DmaDirection,
    ) -> io::Result<Box<dyn ScatterGatherList>> {
        if length == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "Cannot pin an empty buffer",
            ));
        }

        self.scatter_gather.acquire("Scatter/gather list")?;

        let pages = (0..length)
            .step_by(SIMULATED_PAGE_SIZE)
            .map(|start| DmaPage {
                bus_address: address as u64 + start as u64,
                len: (length - start).min(SIMULATED_PAGE_SIZE) as u32,
            })
            .collect();

        Ok(Box::new(SimulatedScatterGatherList {
            pages,
            counter: Arc::clone(&self.scatter_gather),
        }))
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
