// SPDX-License-Identifier: MIT OR Apache-2.0

//! Indirect context programming.
//!
//! Queue contexts live inside the engine and are reached through a small window of the config BAR:
//! eight data words, eight mask words, and a command register. Writing the command register starts
//! the operation, and its busy bit reads 1 until the engine is done with it.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::trace;

use crate::dma::DmaDirection;
use crate::error::{QdmaError, Result};
use crate::regions::structured::{field_get, field_set, BitFieldWriteable};
use crate::registers::{QdmaConfigRegisters, INDIRECT_CONTEXT_WORDS};
use crate::_bit_range;

/* ---------------------------------------------------------------------------------------------- */

/// Which context an indirect command addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ContextSelector {
    SoftwareC2h = 0,
    SoftwareH2c = 1,
    HardwareC2h = 2,
    HardwareH2c = 3,
    CreditC2h = 4,
    CreditH2c = 5,
    Completion = 6,
    Prefetch = 7,
    InterruptCoalesce = 8,
    PasidLow = 9,
    PasidHigh = 10,
    Timer = 11,
    FunctionMap = 12,
}

impl ContextSelector {
    pub fn software(direction: DmaDirection) -> Self {
        match direction {
            DmaDirection::H2c => ContextSelector::SoftwareH2c,
            DmaDirection::C2h => ContextSelector::SoftwareC2h,
        }
    }

    pub fn hardware(direction: DmaDirection) -> Self {
        match direction {
            DmaDirection::H2c => ContextSelector::HardwareH2c,
            DmaDirection::C2h => ContextSelector::HardwareC2h,
        }
    }

    pub fn credit(direction: DmaDirection) -> Self {
        match direction {
            DmaDirection::H2c => ContextSelector::CreditH2c,
            DmaDirection::C2h => ContextSelector::CreditC2h,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ContextOp {
    Clear = 0,
    Write = 1,
    Read = 2,
    Invalidate = 3,
}

/// Order in which the contexts of a queue are cleared when it is removed.
pub const QUEUE_CONTEXT_CLEAR_ORDER: [ContextSelector; 6] = [
    ContextSelector::SoftwareC2h,
    ContextSelector::SoftwareH2c,
    ContextSelector::HardwareC2h,
    ContextSelector::HardwareH2c,
    ContextSelector::CreditC2h,
    ContextSelector::CreditH2c,
];

/* ---------------------------------------------------------------------------------------------- */

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

const COMMAND_SELECTOR: u32 = _bit_range!(u32, 1, 4);
const COMMAND_OP: u32 = _bit_range!(u32, 5, 6);
const COMMAND_QUEUE_ID: u32 = _bit_range!(u32, 7, 17);

/// The indirect context interface of one config BAR.
///
/// Every operation holds `lock` from the first data word written to the end of the busy poll, so
/// operations issued from different threads don't interleave.
#[derive(Debug)]
pub struct IndirectContext<'a> {
    registers: QdmaConfigRegisters<'a>,
    lock: &'a Mutex<()>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl<'a> IndirectContext<'a> {
    pub fn new(
        registers: QdmaConfigRegisters<'a>,
        lock: &'a Mutex<()>,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Self {
        IndirectContext {
            registers,
            lock,
            poll_interval,
            poll_timeout,
        }
    }

    /// Program a context with `data`, zero-padded to the full window and written under an
    /// all-ones mask.
    pub fn write(&self, selector: ContextSelector, queue_id: u16, data: &[u32]) -> Result<()> {
        if data.len() > INDIRECT_CONTEXT_WORDS {
            return Err(QdmaError::InvalidParameter(format!(
                "{} context words given, at most {} fit",
                data.len(),
                INDIRECT_CONTEXT_WORDS
            )));
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        for word in 0..INDIRECT_CONTEXT_WORDS {
            let value = data.get(word).copied().unwrap_or(0);
            self.registers.indirect_context_data(word)?.write(value)?;
        }
        for word in 0..INDIRECT_CONTEXT_WORDS {
            self.registers.indirect_context_mask(word)?.write(!0)?;
        }

        self.command(selector, ContextOp::Write, queue_id)
    }

    /// Read back the first `words` data words of a context.
    pub fn read(&self, selector: ContextSelector, queue_id: u16, words: usize) -> Result<Vec<u32>> {
        if words > INDIRECT_CONTEXT_WORDS {
            return Err(QdmaError::InvalidParameter(format!(
                "{} context words requested, at most {} exist",
                words, INDIRECT_CONTEXT_WORDS
            )));
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.command(selector, ContextOp::Read, queue_id)?;

        let mut data = Vec::with_capacity(words);
        for word in 0..words {
            data.push(self.registers.indirect_context_data(word)?.read()?);
        }
        Ok(data)
    }

    pub fn clear(&self, selector: ContextSelector, queue_id: u16) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.command(selector, ContextOp::Clear, queue_id)
    }

    pub fn invalidate(&self, selector: ContextSelector, queue_id: u16) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.command(selector, ContextOp::Invalidate, queue_id)
    }

    /// Clear every context of one queue, stopping at the first failure.
    pub fn clear_queue(&self, queue_id: u16) -> Result<()> {
        for selector in QUEUE_CONTEXT_CLEAR_ORDER.iter() {
            self.clear(*selector, queue_id)?;
        }
        Ok(())
    }

    /// Issue a command and wait for the engine to finish it. The caller holds the lock.
    fn command(&self, selector: ContextSelector, op: ContextOp, queue_id: u16) -> Result<()> {
        // Written whole: a read-modify-write would start a command of its own.
        let command = field_set(COMMAND_SELECTOR, selector as u32)
            | field_set(COMMAND_OP, op as u32)
            | field_set(COMMAND_QUEUE_ID, u32::from(queue_id));

        trace!(
            "Indirect context {:?} {:?} of queue {} ({:#010x})",
            op,
            selector,
            queue_id,
            command
        );

        self.registers.indirect_context_cmd().write(command)?;

        self.poll_busy().map_err(|e| match e {
            QdmaError::Timeout(message) => QdmaError::Timeout(format!(
                "{:?} {:?} of queue {}: {}",
                op, selector, queue_id, message
            )),
            other => other,
        })
    }

    fn poll_busy(&self) -> Result<()> {
        let busy = self.registers.indirect_context_cmd().busy();

        let interval = self.poll_interval.as_micros().max(1);
        let attempts = self.poll_timeout.as_micros() / interval;

        for _ in 0..attempts {
            if !busy.read()? {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }

        if !busy.read()? {
            return Ok(());
        }

        Err(QdmaError::Timeout(format!(
            "context command still busy after {:?}",
            self.poll_timeout
        )))
    }
}

/* ---------------------------------------------------------------------------------------------- */

fn bit(value: bool, position: u32) -> u32 {
    u32::from(value) << position
}

fn bit_set(word: u32, position: u32) -> bool {
    word & (1 << position) != 0
}

fn word(words: &[u32], index: usize) -> u32 {
    words.get(index).copied().unwrap_or(0)
}

const SW_PIDX: u32 = _bit_range!(u32, 0, 15);
const SW_FUNCTION_ID: u32 = _bit_range!(u32, 17, 24);
const SW_FETCH_MAX: u32 = _bit_range!(u32, 5, 7);
const SW_RING_SIZE: u32 = _bit_range!(u32, 12, 15);
const SW_DESCRIPTOR_SIZE: u32 = _bit_range!(u32, 16, 17);
const SW_PORT_ID: u32 = _bit_range!(u32, 22, 24);
const SW_ERROR: u32 = _bit_range!(u32, 26, 27);
const SW_VECTOR: u32 = _bit_range!(u32, 0, 10);

/// Software descriptor context of one queue direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SoftwareContext {
    pub pidx: u16,
    pub irq_arm: bool,
    pub function_id: u8,
    pub queue_enable: bool,
    pub fetch_credit_enable: bool,
    pub writeback_interrupt_check: bool,
    pub writeback_interrupt_enable: bool,
    pub address_translation: bool,
    pub fetch_max: u8,
    pub ring_size_index: u8,
    pub descriptor_size: u8,
    pub bypass: bool,
    pub mm_channel: bool,
    pub writeback_enable: bool,
    pub irq_enable: bool,
    pub port_id: u8,
    pub irq_no_last: bool,
    pub error: u8,
    pub error_writeback_sent: bool,
    pub irq_request: bool,
    pub marker_disable: bool,
    pub is_mm: bool,
    pub ring_base_address: u64,
    pub vector: u16,
    pub interrupt_aggregation: bool,
}

impl SoftwareContext {
    pub const WORDS: usize = 5;

    pub fn to_words(&self) -> [u32; Self::WORDS] {
        let w0 = field_set(SW_PIDX, u32::from(self.pidx))
            | bit(self.irq_arm, 16)
            | field_set(SW_FUNCTION_ID, u32::from(self.function_id));

        let w1 = bit(self.queue_enable, 0)
            | bit(self.fetch_credit_enable, 1)
            | bit(self.writeback_interrupt_check, 2)
            | bit(self.writeback_interrupt_enable, 3)
            | bit(self.address_translation, 4)
            | field_set(SW_FETCH_MAX, u32::from(self.fetch_max))
            | field_set(SW_RING_SIZE, u32::from(self.ring_size_index))
            | field_set(SW_DESCRIPTOR_SIZE, u32::from(self.descriptor_size))
            | bit(self.bypass, 18)
            | bit(self.mm_channel, 19)
            | bit(self.writeback_enable, 20)
            | bit(self.irq_enable, 21)
            | field_set(SW_PORT_ID, u32::from(self.port_id))
            | bit(self.irq_no_last, 25)
            | field_set(SW_ERROR, u32::from(self.error))
            | bit(self.error_writeback_sent, 28)
            | bit(self.irq_request, 29)
            | bit(self.marker_disable, 30)
            | bit(self.is_mm, 31);

        let w4 = field_set(SW_VECTOR, u32::from(self.vector)) | bit(self.interrupt_aggregation, 11);

        [
            w0,
            w1,
            self.ring_base_address as u32,
            (self.ring_base_address >> 32) as u32,
            w4,
        ]
    }

    /// Decode context words. Missing words read as zero.
    pub fn from_words(words: &[u32]) -> Self {
        let (w0, w1, w4) = (word(words, 0), word(words, 1), word(words, 4));

        SoftwareContext {
            pidx: field_get(SW_PIDX, w0) as u16,
            irq_arm: bit_set(w0, 16),
            function_id: field_get(SW_FUNCTION_ID, w0) as u8,
            queue_enable: bit_set(w1, 0),
            fetch_credit_enable: bit_set(w1, 1),
            writeback_interrupt_check: bit_set(w1, 2),
            writeback_interrupt_enable: bit_set(w1, 3),
            address_translation: bit_set(w1, 4),
            fetch_max: field_get(SW_FETCH_MAX, w1) as u8,
            ring_size_index: field_get(SW_RING_SIZE, w1) as u8,
            descriptor_size: field_get(SW_DESCRIPTOR_SIZE, w1) as u8,
            bypass: bit_set(w1, 18),
            mm_channel: bit_set(w1, 19),
            writeback_enable: bit_set(w1, 20),
            irq_enable: bit_set(w1, 21),
            port_id: field_get(SW_PORT_ID, w1) as u8,
            irq_no_last: bit_set(w1, 25),
            error: field_get(SW_ERROR, w1) as u8,
            error_writeback_sent: bit_set(w1, 28),
            irq_request: bit_set(w1, 29),
            marker_disable: bit_set(w1, 30),
            is_mm: bit_set(w1, 31),
            ring_base_address: u64::from(word(words, 2)) | u64::from(word(words, 3)) << 32,
            vector: field_get(SW_VECTOR, w4) as u16,
            interrupt_aggregation: bit_set(w4, 11),
        }
    }
}

const HW_CIDX: u32 = _bit_range!(u32, 0, 15);
const HW_CREDITS_USED: u32 = _bit_range!(u32, 16, 31);
const HW_FETCH_PENDING: u32 = _bit_range!(u32, 11, 14);

/// Hardware descriptor context of one queue direction. Owned by the engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HardwareContext {
    pub cidx: u16,
    pub credits_used: u16,
    pub descriptors_pending: bool,
    pub idle_stopped_b: bool,
    pub event_pending: bool,
    pub fetch_pending: u8,
}

impl HardwareContext {
    pub const WORDS: usize = 2;

    pub fn from_words(words: &[u32]) -> Self {
        let (w0, w1) = (word(words, 0), word(words, 1));

        HardwareContext {
            cidx: field_get(HW_CIDX, w0) as u16,
            credits_used: field_get(HW_CREDITS_USED, w0) as u16,
            descriptors_pending: bit_set(w1, 8),
            idle_stopped_b: bit_set(w1, 9),
            event_pending: bit_set(w1, 10),
            fetch_pending: field_get(HW_FETCH_PENDING, w1) as u8,
        }
    }
}

const CREDIT: u32 = _bit_range!(u32, 0, 15);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CreditContext {
    pub credit: u16,
}

impl CreditContext {
    pub const WORDS: usize = 1;

    pub fn from_words(words: &[u32]) -> Self {
        CreditContext {
            credit: field_get(CREDIT, word(words, 0)) as u16,
        }
    }
}

const FMAP_QUEUE_BASE: u32 = _bit_range!(u32, 0, 10);
const FMAP_QUEUE_MAX: u32 = _bit_range!(u32, 0, 11);

/// Range of absolute queue ids owned by one function.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FunctionMap {
    pub queue_base: u16,
    pub queue_max: u16,
}

impl FunctionMap {
    pub fn to_words(&self) -> [u32; 2] {
        [
            field_set(FMAP_QUEUE_BASE, u32::from(self.queue_base)),
            field_set(FMAP_QUEUE_MAX, u32::from(self.queue_max)),
        ]
    }
}

/// Every context of one queue, as read back from the engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueContexts {
    pub h2c_software: SoftwareContext,
    pub c2h_software: SoftwareContext,
    pub h2c_hardware: HardwareContext,
    pub c2h_hardware: HardwareContext,
    pub h2c_credit: CreditContext,
    pub c2h_credit: CreditContext,
}

impl IndirectContext<'_> {
    pub fn read_queue_contexts(&self, queue_id: u16) -> Result<QueueContexts> {
        let software = |direction| -> Result<SoftwareContext> {
            let words = self.read(
                ContextSelector::software(direction),
                queue_id,
                SoftwareContext::WORDS,
            )?;
            Ok(SoftwareContext::from_words(&words))
        };
        let hardware = |direction| -> Result<HardwareContext> {
            let words = self.read(
                ContextSelector::hardware(direction),
                queue_id,
                HardwareContext::WORDS,
            )?;
            Ok(HardwareContext::from_words(&words))
        };
        let credit = |direction| -> Result<CreditContext> {
            let words = self.read(
                ContextSelector::credit(direction),
                queue_id,
                CreditContext::WORDS,
            )?;
            Ok(CreditContext::from_words(&words))
        };

        Ok(QueueContexts {
            h2c_software: software(DmaDirection::H2c)?,
            c2h_software: software(DmaDirection::C2h)?,
            h2c_hardware: hardware(DmaDirection::H2c)?,
            c2h_hardware: hardware(DmaDirection::C2h)?,
            h2c_credit: credit(DmaDirection::H2c)?,
            c2h_credit: credit(DmaDirection::C2h)?,
        })
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockRegisterRegion;
    use crate::regions::{BackedBySubregion, MemoryRegion, RegisterRegion};
    use crate::registers::QUEUE_CSR_WINDOW;
    use std::sync::Arc;

    fn with_registers(f: impl FnOnce(&MemoryRegion, QdmaConfigRegisters)) {
        let mut backing = vec![0u64; QUEUE_CSR_WINDOW as usize / 8];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(backing.as_mut_ptr().cast::<u8>(), backing.len() * 8)
        };
        let region = MemoryRegion::new_mut(bytes);
        let registers = QdmaConfigRegisters::backed_by(&region);
        f(&region, registers);
    }

    #[test]
    fn test_write_pads_data_and_sets_masks() {
        with_registers(|region, registers| {
            let lock = Mutex::new(());
            let context = IndirectContext::new(
                registers,
                &lock,
                DEFAULT_POLL_INTERVAL,
                DEFAULT_POLL_TIMEOUT,
            );

            region.write_le_u32(0x804 + 4 * 7, 0xDEAD).unwrap();
            context
                .write(ContextSelector::SoftwareH2c, 5, &[0x11, 0x22])
                .unwrap();

            assert_eq!(region.read_le_u32(0x804).unwrap(), 0x11);
            assert_eq!(region.read_le_u32(0x808).unwrap(), 0x22);
            assert_eq!(region.read_le_u32(0x804 + 4 * 7).unwrap(), 0);
            for word in 0..8 {
                assert_eq!(region.read_le_u32(0x824 + 4 * word).unwrap(), !0);
            }

            // selector 1 @ 1--4, op WR @ 5--6, queue 5 @ 7--17
            assert_eq!(
                region.read_le_u32(0x844).unwrap(),
                (1 << 1) | (1 << 5) | (5 << 7)
            );

            assert!(context
                .write(ContextSelector::SoftwareH2c, 5, &[0; 9])
                .is_err());
        });
    }

    #[test]
    fn test_clear_queue_order() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&commands);

        let mut mock = MockRegisterRegion::new();
        mock.expect_len().return_const(QUEUE_CSR_WINDOW);
        mock.expect_read_le_u32().returning(|_| Ok(0));
        mock.expect_write_le_u32().returning(move |offset, value| {
            if offset == 0x844 {
                recorded.lock().unwrap().push(value);
            }
            Ok(())
        });

        let region: &dyn RegisterRegion = &mock;
        let lock = Mutex::new(());
        let context = IndirectContext::new(
            QdmaConfigRegisters::backed_by(region),
            &lock,
            DEFAULT_POLL_INTERVAL,
            DEFAULT_POLL_TIMEOUT,
        );

        context.clear_queue(300).unwrap();

        let selectors: Vec<u32> = commands
            .lock()
            .unwrap()
            .iter()
            .map(|command| {
                assert_eq!(field_get(COMMAND_OP, *command), ContextOp::Clear as u32);
                assert_eq!(field_get(COMMAND_QUEUE_ID, *command), 300);
                field_get(COMMAND_SELECTOR, *command)
            })
            .collect();
        assert_eq!(selectors, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stuck_busy_times_out() {
        let mut mock = MockRegisterRegion::new();
        mock.expect_len().return_const(QUEUE_CSR_WINDOW);
        mock.expect_write_le_u32().returning(|_, _| Ok(()));
        mock.expect_read_le_u32()
            .withf(|offset| *offset == 0x844)
            .returning(|_| Ok(1));

        let region: &dyn RegisterRegion = &mock;
        let lock = Mutex::new(());
        let context = IndirectContext::new(
            QdmaConfigRegisters::backed_by(region),
            &lock,
            Duration::from_micros(10),
            Duration::from_micros(50),
        );

        let err = context
            .clear(ContextSelector::CreditC2h, 9)
            .unwrap_err();
        assert!(matches!(err, QdmaError::Timeout(_)));
        assert!(err.to_string().contains("queue 9"));
    }

    #[test]
    fn test_software_context_layout() {
        let context = SoftwareContext {
            pidx: 0x1234,
            function_id: 3,
            queue_enable: true,
            writeback_interrupt_check: true,
            writeback_interrupt_enable: true,
            ring_size_index: 6,
            descriptor_size: 2,
            bypass: true,
            writeback_enable: true,
            irq_enable: true,
            is_mm: true,
            ring_base_address: 0x0000_0012_3456_7000,
            vector: 0x7FF,
            interrupt_aggregation: true,
            ..SoftwareContext::default()
        };

        let words = context.to_words();
        assert_eq!(words[0], 0x1234 | (3 << 17));
        assert_eq!(
            words[1],
            1 | (1 << 2) | (1 << 3) | (6 << 12) | (2 << 16) | (1 << 18) | (1 << 20) | (1 << 21)
                | (1 << 31)
        );
        assert_eq!(words[2], 0x3456_7000);
        assert_eq!(words[3], 0x12);
        assert_eq!(words[4], 0xFFF);

        assert_eq!(SoftwareContext::from_words(&words), context);
        assert_eq!(SoftwareContext::from_words(&[]), SoftwareContext::default());
    }

    #[test]
    fn test_hardware_credit_and_function_map() {
        let hardware = HardwareContext::from_words(&[0x0003_0010, (1 << 8) | (0xA << 11)]);
        assert_eq!(hardware.cidx, 0x10);
        assert_eq!(hardware.credits_used, 3);
        assert!(hardware.descriptors_pending);
        assert!(!hardware.idle_stopped_b);
        assert_eq!(hardware.fetch_pending, 0xA);

        assert_eq!(CreditContext::from_words(&[0xFFFF_0042]).credit, 0x42);

        let map = FunctionMap {
            queue_base: 1024,
            queue_max: 512,
        };
        assert_eq!(map.to_words(), [1024, 512]);
    }
}

/* ---------------------------------------------------------------------------------------------- */
