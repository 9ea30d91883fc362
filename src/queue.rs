// SPDX-License-Identifier: MIT OR Apache-2.0

//! One direction of a queue pair: its descriptor ring and the requests in flight on it.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::atomic::{fence, Ordering};

use log::{trace, warn};

use crate::backend::DeviceBackend;
use crate::config::{QueueConfig, QueueMode};
use crate::context::{ContextSelector, IndirectContext, SoftwareContext};
use crate::dma::DmaDirection;
use crate::error::{QdmaError, Result};
use crate::registers::{CsrTable, QdmaConfigRegisters};
use crate::request::{DmaCompletion, DmaStatus, InFlightRequest};
use crate::ring::{MmDescriptor, RingBuffer, RingStats, DESCRIPTOR_SIZE_CODE, MAX_DESCRIPTOR_LENGTH};
use crate::tracker::RequestTracker;

/* ---------------------------------------------------------------------------------------------- */

/// MM engine channel every queue uses.
const MM_CHANNEL: usize = 0;

const MM_CONTROL_RUN: u32 = 1 << 0;
const PIDX_IRQ_ENABLE_SHIFT: u32 = 16;

/// Snapshot of one queue direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueStats {
    pub direction: DmaDirection,
    pub ring_size: u32,
    pub credits: u32,
    pub hw_index: u32,
    pub sw_index: u32,
    pub pending_requests: usize,
    pub ring: RingStats,
}

/// A request [`Queue::enqueue_mm`] did not accept, and why.
#[derive(Debug)]
pub(crate) struct EnqueueError {
    pub(crate) error: QdmaError,
    pub(crate) request: InFlightRequest,
}

#[derive(Debug)]
pub struct Queue {
    direction: DmaDirection,
    queue_id: u16,
    absolute_id: u16,
    ring_size_index: u8,
    irq_enabled: bool,
    ring: RingBuffer,
    tracker: RequestTracker<InFlightRequest>,
}

impl Queue {
    /// Lock a ring of the size the global ring size table holds at the configured index.
    pub(crate) fn create(
        backend: &dyn DeviceBackend,
        registers: &QdmaConfigRegisters<'_>,
        direction: DmaDirection,
        queue_id: u16,
        absolute_id: u16,
        config: &QueueConfig,
    ) -> Result<Queue> {
        let ring_size_index = match direction {
            DmaDirection::H2c => config.h2c_ring_size_index,
            DmaDirection::C2h => config.c2h_ring_size_index,
        };

        if !QueueConfig::ring_size_index_valid(ring_size_index) {
            return Err(QdmaError::InvalidParameter(format!(
                "{} ring size index {} of queue {} is out of range",
                direction, ring_size_index, queue_id
            )));
        }

        let size = registers
            .csr_table(CsrTable::RingSize, usize::from(ring_size_index))?
            .read()?;

        let ring = RingBuffer::new(backend, size)?;
        let tracker = RequestTracker::new(size as usize)?;

        trace!(
            "Created {} queue {} with ring size {} (index {})",
            direction,
            queue_id,
            size,
            ring_size_index
        );

        Ok(Queue {
            direction,
            queue_id,
            absolute_id,
            ring_size_index,
            irq_enabled: false,
            ring,
            tracker,
        })
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    pub(crate) fn set_irq_enabled(&mut self, enabled: bool) {
        self.irq_enabled = enabled;
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            direction: self.direction,
            ring_size: self.ring.size(),
            credits: self.ring.credits(),
            hw_index: self.ring.hw_index(),
            sw_index: self.ring.sw_index(),
            pending_requests: self.tracker.len(),
            ring: self.ring.stats(),
        }
    }

    pub fn software_context(
        &self,
        function_id: u8,
        mode: QueueMode,
        interrupt_vector: u16,
        bypass: bool,
    ) -> SoftwareContext {
        let irq_enable = mode != QueueMode::Polling;

        let mut context = SoftwareContext {
            pidx: 0,
            function_id,
            queue_enable: true,
            fetch_credit_enable: false,
            writeback_interrupt_check: true,
            writeback_interrupt_enable: self.direction.is_h2c(),
            address_translation: false,
            ring_size_index: self.ring_size_index,
            descriptor_size: DESCRIPTOR_SIZE_CODE as u8,
            bypass,
            writeback_enable: true,
            irq_enable,
            is_mm: true,
            ring_base_address: self.ring.bus_address(),
            ..SoftwareContext::default()
        };

        if irq_enable {
            context.vector = interrupt_vector;
            context.interrupt_aggregation = mode == QueueMode::InterruptCoalesce;
        }

        context
    }

    /// Program this direction's software context.
    pub(crate) fn program(
        &self,
        context: &IndirectContext<'_>,
        function_id: u8,
        mode: QueueMode,
        interrupt_vector: u16,
        bypass: bool,
    ) -> Result<()> {
        let software = self.software_context(function_id, mode, interrupt_vector, bypass);
        context.write(
            ContextSelector::software(self.direction),
            self.absolute_id,
            &software.to_words(),
        )
    }

    /// Write the PIDX update register.
    pub(crate) fn update_pidx(&self, registers: &QdmaConfigRegisters<'_>, pidx: u32) -> Result<()> {
        let value = (pidx & 0xFFFF) | u32::from(self.irq_enabled) << PIDX_IRQ_ENABLE_SHIFT;
        registers
            .descriptor_pidx(self.direction.is_h2c(), self.queue_id)?
            .write(value)?;
        Ok(())
    }

    /// Write one descriptor per pinned page of `request` and hand them to the engine.
    ///
    /// A request that is not accepted comes back in the error, with nothing published. The
    /// caller holds the queue lock, so the request is tracked before any completion for it can be
    /// serviced.
    pub(crate) fn enqueue_mm(
        &mut self,
        registers: &QdmaConfigRegisters<'_>,
        mut request: InFlightRequest,
    ) -> std::result::Result<(), EnqueueError> {
        let count = request.pages.pages().len() as u32;

        if let Err(error) = self.check_room(&request, count) {
            return Err(EnqueueError { error, request });
        }

        if let Err(error) = self
            .write_descriptors(&request)
            .and_then(|()| self.start_engine(registers))
        {
            return Err(EnqueueError { error, request });
        }

        let old_index = self.ring.sw_index();
        let new_index = self.ring.advance(old_index, count);

        request.request.set_status(DmaStatus::Started);
        self.ring.publish(new_index, count);

        if let Err(error) = self.update_pidx(registers, new_index) {
            self.ring.unpublish(old_index, count);
            request.request.set_status(DmaStatus::Uninitialized);
            return Err(EnqueueError { error, request });
        }

        self.ring.record_accepted(count);

        if let Err(full) = self.tracker.enqueue(count, request) {
            warn!(
                "{} queue {}: descriptors of request {} published without a tracker slot",
                self.direction, self.queue_id, full.context.id
            );
            let error = QdmaError::ResourceExhausted(format!(
                "{} queue {} tracks {} requests already",
                self.direction,
                self.queue_id,
                full.capacity - 1
            ));
            return Err(EnqueueError {
                error,
                request: full.context,
            });
        }

        fence(Ordering::SeqCst);

        trace!(
            "{} queue {}: {} descriptors, pidx {} -> {}",
            self.direction,
            self.queue_id,
            count,
            old_index,
            new_index
        );

        Ok(())
    }

    fn check_room(&self, request: &InFlightRequest, count: u32) -> Result<()> {
        if count == 0 {
            return Err(QdmaError::InvalidParameter(format!(
                "request {} has no pages",
                request.id
            )));
        }

        if count > self.ring.credits() {
            return Err(QdmaError::ResourceExhausted(format!(
                "request {} needs {} descriptors, {} queue {} has {} credits",
                request.id,
                count,
                self.direction,
                self.queue_id,
                self.ring.credits()
            )));
        }

        if self.tracker.is_full() {
            return Err(QdmaError::ResourceExhausted(format!(
                "{} queue {} tracks {} requests already",
                self.direction,
                self.queue_id,
                self.tracker.len()
            )));
        }

        Ok(())
    }

    fn write_descriptors(&self, request: &InFlightRequest) -> Result<()> {
        let pages = request.pages.pages();
        let last = pages.len() - 1;
        let mut device_offset = request.request.offset();
        let mut index = self.ring.sw_index();

        for (i, page) in pages.iter().enumerate() {
            if page.len == 0 || page.len > MAX_DESCRIPTOR_LENGTH {
                return Err(QdmaError::InvalidParameter(format!(
                    "page {} of request {} is {} bytes long",
                    i, request.id, page.len
                )));
            }

            let (source, destination) = match self.direction {
                DmaDirection::H2c => (page.bus_address, device_offset),
                DmaDirection::C2h => (device_offset, page.bus_address),
            };

            let descriptor = MmDescriptor::new(source, destination, page.len, i == 0, i == last);
            self.ring.write_descriptor(index, &descriptor)?;

            device_offset += u64::from(page.len);
            index = self.ring.advance(index, 1);
        }

        Ok(())
    }

    fn start_engine(&self, registers: &QdmaConfigRegisters<'_>) -> Result<()> {
        fence(Ordering::SeqCst);
        let control = registers.mm_control(self.direction.is_h2c(), MM_CHANNEL)?;
        control.write(control.read()? | MM_CONTROL_RUN)?;
        Ok(())
    }

    /// Reclaim the descriptors the engine reports consumed and complete the requests they
    /// finish, oldest first.
    ///
    /// Returns whether descriptors are still outstanding.
    pub(crate) fn service(&mut self, completions: &mut Vec<DmaCompletion>) -> Result<bool> {
        let cidx = u32::from(self.ring.writeback().cidx().read()?);
        fence(Ordering::SeqCst);

        if cidx >= self.ring.capacity() {
            return Err(QdmaError::OperationFailed(format!(
                "{} queue {} reported cidx {} on a ring of {}",
                self.direction,
                self.queue_id,
                cidx,
                self.ring.capacity()
            )));
        }

        let mut remaining = self.ring.reclaim(cidx);

        while remaining > 0 {
            let head = match self.tracker.peek_mut() {
                Ok(head) => head,
                Err(_) => {
                    warn!(
                        "{} queue {}: {} descriptors completed with no request waiting",
                        self.direction, self.queue_id, remaining
                    );
                    self.ring.record_dropped(remaining);
                    break;
                }
            };

            if head.num_descriptors <= remaining {
                remaining -= head.num_descriptors;
                let entry = self.tracker.dequeue()?;
                trace!(
                    "{} queue {}: request {} finished",
                    self.direction,
                    self.queue_id,
                    entry.context.id
                );
                completions.push(entry.context.complete(DmaStatus::Finished));
            } else {
                head.num_descriptors -= remaining;
                remaining = 0;
            }
        }

        Ok(!self.ring.is_idle())
    }

    /// Fail every request still in flight.
    pub(crate) fn drain_pending(&mut self) -> Vec<DmaCompletion> {
        let drained = self.tracker.drain();
        if !drained.is_empty() {
            warn!(
                "{} queue {}: failing {} requests still in flight",
                self.direction,
                self.queue_id,
                drained.len()
            );
        }

        drained
            .into_iter()
            .map(|entry| entry.context.complete(DmaStatus::Error))
            .collect()
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimulatedDevice, CONFIG_BAR};
    use crate::dma::{DmaPage, ScatterGatherList};
    use crate::regions::structured::BitFieldReadable;
    use crate::regions::BackedBySubregion;
    use crate::request::{DmaRequestContext, RequestId};

    #[derive(Debug)]
    struct Pages(Vec<DmaPage>);

    impl ScatterGatherList for Pages {
        fn pages(&self) -> &[DmaPage] {
            &self.0
        }
    }

    fn in_flight(id: u64, direction: DmaDirection, pages: &[u32]) -> InFlightRequest {
        let bytes = pages.iter().map(|len| *len as usize).sum();
        InFlightRequest {
            id: RequestId(id),
            request: DmaRequestContext::new(direction, 0, vec![0; bytes], 0x4000),
            pages: Box::new(Pages(
                pages
                    .iter()
                    .enumerate()
                    .map(|(i, len)| DmaPage {
                        bus_address: 0x10_0000 + 0x1000 * i as u64,
                        len: *len,
                    })
                    .collect(),
            )),
        }
    }

    /// A device with ring size index 1 (65 entries) programmed.
    fn device() -> SimulatedDevice {
        let device = SimulatedDevice::new();
        device.write_register(CONFIG_BAR, 0x204 + 4, 65).unwrap();
        device
    }

    fn new_queue(device: &SimulatedDevice, direction: DmaDirection) -> Queue {
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let config = QueueConfig::default().with_ring_size_indices(1, 1);
        Queue::create(device, &registers, direction, 3, 3, &config).unwrap()
    }

    fn complete_up_to(queue: &Queue, cidx: u16) {
        let offset = queue.ring().writeback_offset() + 2;
        queue.ring().memory().write_le_u16(offset, cidx).unwrap();
    }

    #[test]
    fn test_enqueue_writes_descriptors_and_pidx() {
        let device = device();
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let mut queue = new_queue(&device, DmaDirection::C2h);

        queue
            .enqueue_mm(&registers, in_flight(1, DmaDirection::C2h, &[4096, 4096, 100]))
            .unwrap();

        let first = queue.ring().descriptor_slot(0).unwrap();
        assert_eq!(first.source().read().unwrap(), 0x4000);
        assert_eq!(first.destination().read().unwrap(), 0x10_0000);
        let last = queue.ring().descriptor_slot(2).unwrap();
        assert_eq!(last.source().read().unwrap(), 0x4000 + 8192);
        assert_eq!(last.control().read().unwrap(), 0x5000_0064);

        assert_eq!(queue.ring().credits(), 63 - 3);
        assert_eq!(queue.ring().sw_index(), 3);
        assert_eq!(device.read_register(CONFIG_BAR, 0x18038).unwrap(), 3);
        assert_eq!(device.read_register(CONFIG_BAR, 0x1004).unwrap() & 1, 1);
        assert_eq!(queue.stats().pending_requests, 1);
    }

    #[test]
    fn test_enqueue_without_credits_changes_nothing() {
        let device = device();
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let mut queue = new_queue(&device, DmaDirection::H2c);

        let pages = vec![16u32; 64];
        let rejected = queue
            .enqueue_mm(&registers, in_flight(1, DmaDirection::H2c, &pages))
            .unwrap_err();

        assert!(matches!(rejected.error, QdmaError::ResourceExhausted(_)));
        assert_eq!(rejected.request.id, RequestId(1));
        assert_eq!((queue.ring().sw_index(), queue.ring().hw_index()), (0, 0));
        assert_eq!(queue.ring().credits(), 63);
        assert_eq!(queue.stats().ring.accepted, 0);
        assert_eq!(device.read_register(CONFIG_BAR, 0x18034).unwrap(), 0);
    }

    #[test]
    fn test_service_completes_in_order_and_splits_heads() {
        let device = device();
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let mut queue = new_queue(&device, DmaDirection::H2c);

        queue
            .enqueue_mm(&registers, in_flight(1, DmaDirection::H2c, &[64, 64]))
            .unwrap();
        queue
            .enqueue_mm(&registers, in_flight(2, DmaDirection::H2c, &[64, 64, 64]))
            .unwrap();

        let mut completions = Vec::new();
        complete_up_to(&queue, 3);
        assert!(queue.service(&mut completions).unwrap());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].id, RequestId(1));
        assert_eq!(completions[0].request.status(), DmaStatus::Finished);

        complete_up_to(&queue, 5);
        assert!(!queue.service(&mut completions).unwrap());
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[1].id, RequestId(2));
        assert_eq!(queue.ring().credits(), queue.ring().capacity() - 1);
        assert_eq!(queue.stats().ring.processed, 5);
    }

    #[test]
    fn test_unexpected_completions_are_dropped() {
        let device = device();
        let mut queue = new_queue(&device, DmaDirection::H2c);

        let mut completions = Vec::new();
        complete_up_to(&queue, 4);
        queue.service(&mut completions).unwrap();
        assert!(completions.is_empty());
        assert_eq!(queue.stats().ring.dropped, 4);

        complete_up_to(&queue, 200);
        assert!(matches!(
            queue.service(&mut completions),
            Err(QdmaError::OperationFailed(_))
        ));
    }

    #[test]
    fn test_drain_fails_pending_requests() {
        let device = device();
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let mut queue = new_queue(&device, DmaDirection::C2h);

        queue
            .enqueue_mm(&registers, in_flight(9, DmaDirection::C2h, &[32]))
            .unwrap();
        let drained = queue.drain_pending();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].request.status(), DmaStatus::Error);
        assert_eq!(queue.stats().pending_requests, 0);
    }

    #[test]
    fn test_software_context_values() {
        let device = device();
        let queue = new_queue(&device, DmaDirection::H2c);

        let polled = queue.software_context(2, QueueMode::Polling, 7, false);
        assert!(polled.queue_enable && polled.writeback_enable && polled.is_mm);
        assert!(polled.writeback_interrupt_check && polled.writeback_interrupt_enable);
        assert!(!polled.fetch_credit_enable && !polled.irq_enable);
        assert_eq!((polled.function_id, polled.ring_size_index), (2, 1));
        assert_eq!(polled.descriptor_size, 2);
        assert_eq!(polled.vector, 0);
        assert_eq!(polled.ring_base_address, queue.ring().bus_address());

        let coalesced = queue.software_context(2, QueueMode::InterruptCoalesce, 7, true);
        assert!(coalesced.irq_enable && coalesced.interrupt_aggregation && coalesced.bypass);
        assert_eq!(coalesced.vector, 7);

        let c2h = new_queue(&device, DmaDirection::C2h)
            .software_context(0, QueueMode::Interrupt, 1, false);
        assert!(!c2h.writeback_interrupt_enable && !c2h.interrupt_aggregation);
    }

    #[test]
    fn test_ring_size_index_out_of_range() {
        let device = device();
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let config = QueueConfig::default().with_ring_size_indices(16, 1);

        assert!(matches!(
            Queue::create(&device, &registers, DmaDirection::H2c, 0, 0, &config),
            Err(QdmaError::InvalidParameter(_))
        ));
    }
}

/* ---------------------------------------------------------------------------------------------- */
