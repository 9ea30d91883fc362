// SPDX-License-Identifier: MIT OR Apache-2.0

//! The QDMA configuration BAR register map.
//!
//! Fixed registers are reached through [`QdmaConfigRegisters`]' generated accessors. Register
//! arrays (the global CSR tables, indirect context data/mask words, MM engine controls and the
//! per-queue PIDX update registers) have indexed accessors that validate the index.

/* ---------------------------------------------------------------------------------------------- */

use std::io::{self, ErrorKind};

use crate::regions::structured::{RegisterRo, RegisterRw};
use crate::regions::{AsSubregion, BackedBySubregion};
use crate::{register_bit_field, register_block};

/* ---------------------------------------------------------------------------------------------- */

/// Value of [`ConfigBlockIdentifier::identifier`] on a QDMA configuration BAR.
pub const QDMA_CONFIG_BLOCK_IDENTIFIER: u16 = 0x1FD;

/// Entries in each global CSR table (ring sizes, timer counts, counter thresholds, buffer sizes).
pub const GLOBAL_CSR_ENTRIES: usize = 16;

/// Data (and mask) words of the indirect context interface.
pub const INDIRECT_CONTEXT_WORDS: usize = 8;

/// Number of MM engine channels in use.
pub const MM_CHANNELS: usize = 1;

const QUEUE_CSR_BASE: u64 = 0x18000;
const QUEUE_CSR_STRIDE: u64 = 0x10;
const H2C_DESCRIPTOR_PIDX: u64 = 0x4;
const C2H_DESCRIPTOR_PIDX: u64 = 0x8;

/// Size of the per-queue CSR window, which is the furthest the driver reaches into the BAR.
pub const QUEUE_CSR_WINDOW: u64 =
    QUEUE_CSR_BASE + QUEUE_CSR_STRIDE * crate::queue_pair::MAX_QUEUES_PER_FUNCTION as u64;

/* ---------------------------------------------------------------------------------------------- */

register_block! {
    /// The QDMA configuration BAR.
    pub struct QdmaConfigRegisters<'a> {
        config_block_identifier @ 0x000 : ConfigBlockIdentifier<'a>,
        pf_barlite_internal     @ 0x104 : PfBarLiteInternal<'a>,
        pf_barlite_external     @ 0x10C : RegisterRo<'a, u32>,
        channel_mdma            @ 0x118 : ChannelMdma<'a>,
        channel_qdma_cap        @ 0x120 : ChannelQdmaCap<'a>,
        channel_function_return @ 0x12C : ChannelFunctionReturn<'a>,
        misc_cap                @ 0x134 : MiscCap<'a>,
        global_ring_size        @ 0x204 [GLOBAL_CSR_ENTRIES; 4] : RegisterRw<'a, u32>,
        global_error_status     @ 0x248 : RegisterRo<'a, u32>,
        global_error_mask       @ 0x24C : RegisterRw<'a, u32>,
        global_descriptor_cfg   @ 0x250 : GlobalDescriptorConfig<'a>,
        descriptor_error_mask   @ 0x258 : RegisterRw<'a, u32>,
        trq_error_mask          @ 0x268 : RegisterRw<'a, u32>,
        /// Data words of the indirect context interface.
        indirect_context_data   @ 0x804 [INDIRECT_CONTEXT_WORDS; 4] : RegisterRw<'a, u32>,
        /// Write masks matching [`indirect_context_data`](Self::indirect_context_data).
        indirect_context_mask   @ 0x824 [INDIRECT_CONTEXT_WORDS; 4] : RegisterRw<'a, u32>,
        indirect_context_cmd    @ 0x844 : IndirectContextCommand<'a>,
        c2h_timer_count         @ 0xA00 [GLOBAL_CSR_ENTRIES; 4] : RegisterRw<'a, u32>,
        c2h_counter_threshold   @ 0xA40 [GLOBAL_CSR_ENTRIES; 4] : RegisterRw<'a, u32>,
        c2h_buffer_size         @ 0xAB0 [GLOBAL_CSR_ENTRIES; 4] : RegisterRw<'a, u32>,
        c2h_error_mask          @ 0xAF4 : RegisterRw<'a, u32>,
        c2h_mm_control          @ 0x1004 [MM_CHANNELS; 0x100] : RegisterRw<'a, u32>,
        h2c_mm_control          @ 0x1204 [MM_CHANNELS; 0x100] : RegisterRw<'a, u32>,
    }
}

register_bit_field! {
    pub struct ConfigBlockIdentifier<'a> : RO u32 {
        version    @ 0--19  : RO u32,
        identifier @ 20--31 : RO u16,
    }

    /// BAR maps of the four physical functions, six bits each.
    pub struct PfBarLiteInternal<'a> : RO u32 {
        pf0_bar_map @ 0--5   : RO u8,
        pf1_bar_map @ 6--11  : RO u8,
        pf2_bar_map @ 12--17 : RO u8,
        pf3_bar_map @ 18--23 : RO u8,
        __          @ 24--31 : RsvdP,
    }

    pub struct ChannelMdma<'a> : RO u32 {
        mm_h2c @ 0  : RO,
        mm_c2h @ 8  : RO,
        st_c2h @ 16 : RO,
        st_h2c @ 17 : RO,
    }

    pub struct ChannelQdmaCap<'a> : RO u32 {
        max_queues @ 0--11 : RO u16,
    }

    pub struct ChannelFunctionReturn<'a> : RO u32 {
        function_id @ 0--7 : RO u8,
    }

    pub struct MiscCap<'a> : RO u32 {
        mailbox        @ 0      : RO,
        flr            @ 1      : RO,
        mm_completion  @ 2      : RO,
        rtl_version    @ 16--23 : RO u8,
        vivado_release @ 24--27 : RO u8,
        everest_ip     @ 28     : RO,
    }

    pub struct GlobalDescriptorConfig<'a> : RW u32 {
        writeback_interval @ 0--2  : RW u8,
        max_fetch          @ 3--5  : RW u8,
        __                 @ 6--31 : RsvdP,
    }

    pub struct IndirectContextCommand<'a> : RW u32 {
        busy     @ 0      : RO,
        selector @ 1--4   : RW u8,
        op       @ 5--6   : RW u8,
        queue_id @ 7--17  : RW u16,
        __       @ 18--31 : RsvdZ,
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Global CSR tables, each [`GLOBAL_CSR_ENTRIES`] long.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CsrTable {
    RingSize,
    C2hTimerCount,
    C2hCounterThreshold,
    C2hBufferSize,
}

fn index_error(what: &str, index: usize, limit: usize) -> io::Error {
    io::Error::new(
        ErrorKind::InvalidInput,
        format!("{} index {} out of range, must be below {}", what, index, limit),
    )
}

impl<'a> QdmaConfigRegisters<'a> {
    /// Entry `index` of one of the global CSR tables.
    pub fn csr_table(&self, table: CsrTable, index: usize) -> io::Result<RegisterRw<'a, u32>> {
        match table {
            CsrTable::RingSize => self.global_ring_size(index),
            CsrTable::C2hTimerCount => self.c2h_timer_count(index),
            CsrTable::C2hCounterThreshold => self.c2h_counter_threshold(index),
            CsrTable::C2hBufferSize => self.c2h_buffer_size(index),
        }
    }

    /// The MM engine control register (bit 0 is RUN) of one channel in one direction.
    pub fn mm_control(&self, h2c: bool, channel: usize) -> io::Result<RegisterRw<'a, u32>> {
        if h2c {
            self.h2c_mm_control(channel)
        } else {
            self.c2h_mm_control(channel)
        }
    }

    /// The descriptor PIDX update register of queue `queue_id`.
    pub fn descriptor_pidx(&self, h2c: bool, queue_id: u16) -> io::Result<RegisterRw<'a, u32>> {
        let max = crate::queue_pair::MAX_QUEUES_PER_FUNCTION;
        if usize::from(queue_id) >= max {
            return Err(index_error("Queue", usize::from(queue_id), max));
        }
        let direction = if h2c {
            H2C_DESCRIPTOR_PIDX
        } else {
            C2H_DESCRIPTOR_PIDX
        };
        let offset = QUEUE_CSR_BASE + direction + QUEUE_CSR_STRIDE * u64::from(queue_id);
        Ok(RegisterRw::backed_by(self.subregion(offset..offset + 4)))
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
