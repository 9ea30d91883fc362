// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device and queue configuration.

/* ---------------------------------------------------------------------------------------------- */

use std::time::Duration;

use crate::context::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::registers::GLOBAL_CSR_ENTRIES;

/* ---------------------------------------------------------------------------------------------- */

/// How queue contexts are programmed to signal completions.
///
/// Poller threads watch the writeback status in every mode. The interrupt modes additionally
/// program the queues' interrupt vector, for integrators that pick up completions early with
/// [`QdmaDevice::service_queue`](crate::device::QdmaDevice::service_queue).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueMode {
    /// No interrupts are generated.
    Polling,
    /// Each queue raises its interrupt vector directly.
    Interrupt,
    /// Interrupts go through the interrupt aggregation ring.
    InterruptCoalesce,
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::Polling
    }
}

/// Upper bound on poller threads.
pub const MAX_POLLER_THREADS: usize = 16;

/// Completions that may wait in the channel before poller threads block on it.
pub const DEFAULT_COMPLETION_CAPACITY: usize = 4096;

/// Settings fixed when a device is opened.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct DeviceConfig {
    pub queue_mode: QueueMode,
    /// Physical function this handle drives. Absolute queue ids start at `function_id * 512`.
    pub function_id: u8,
    /// Whether this function programs the global CSR tables and the function map.
    pub master_pf: bool,
    /// Poller thread count. `None` uses the available parallelism. Always clamped to
    /// `1..=MAX_POLLER_THREADS`.
    pub poller_threads: Option<usize>,
    /// Delay between two reads of the indirect context busy bit.
    pub register_poll_interval: Duration,
    /// How long an indirect context command may stay busy.
    pub register_poll_timeout: Duration,
    pub completion_capacity: usize,
    /// Interrupt vector programmed into queue contexts when interrupts are enabled.
    pub interrupt_vector: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            queue_mode: QueueMode::Polling,
            function_id: 0,
            master_pf: true,
            poller_threads: None,
            register_poll_interval: DEFAULT_POLL_INTERVAL,
            register_poll_timeout: DEFAULT_POLL_TIMEOUT,
            completion_capacity: DEFAULT_COMPLETION_CAPACITY,
            interrupt_vector: 0,
        }
    }
}

impl DeviceConfig {
    pub fn with_queue_mode(mut self, queue_mode: QueueMode) -> Self {
        self.queue_mode = queue_mode;
        self
    }

    pub fn with_function_id(mut self, function_id: u8) -> Self {
        self.function_id = function_id;
        self
    }

    pub fn with_master_pf(mut self, master_pf: bool) -> Self {
        self.master_pf = master_pf;
        self
    }

    pub fn with_poller_threads(mut self, threads: usize) -> Self {
        self.poller_threads = Some(threads);
        self
    }

    pub fn with_register_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.register_poll_interval = interval;
        self.register_poll_timeout = timeout;
        self
    }

    pub fn with_completion_capacity(mut self, capacity: usize) -> Self {
        self.completion_capacity = capacity;
        self
    }

    pub fn with_interrupt_vector(mut self, vector: u16) -> Self {
        self.interrupt_vector = vector;
        self
    }

    /// Poller threads to start.
    pub fn resolved_poller_threads(&self) -> usize {
        let requested = self.poller_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        requested.clamp(1, MAX_POLLER_THREADS)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Index into the global ring size table of a 512-descriptor ring (size 513).
pub const DEFAULT_RING_SIZE_INDEX: u8 = 6;

/// Settings of one queue pair, given when it is added.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct QueueConfig {
    /// Index into the global ring size table, below 16.
    pub h2c_ring_size_index: u8,
    pub c2h_ring_size_index: u8,
    /// Streaming queues are not supported and are rejected when added.
    pub is_st: bool,
    pub descriptor_bypass: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            h2c_ring_size_index: DEFAULT_RING_SIZE_INDEX,
            c2h_ring_size_index: DEFAULT_RING_SIZE_INDEX,
            is_st: false,
            descriptor_bypass: false,
        }
    }
}

impl QueueConfig {
    pub fn with_ring_size_indices(mut self, h2c: u8, c2h: u8) -> Self {
        self.h2c_ring_size_index = h2c;
        self.c2h_ring_size_index = c2h;
        self
    }

    pub fn with_streaming(mut self, is_st: bool) -> Self {
        self.is_st = is_st;
        self
    }

    pub fn with_descriptor_bypass(mut self, bypass: bool) -> Self {
        self.descriptor_bypass = bypass;
        self
    }

    pub(crate) fn ring_size_index_valid(index: u8) -> bool {
        usize::from(index) < GLOBAL_CSR_ENTRIES
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_builders() {
        let config = DeviceConfig::default();
        assert_eq!(config.queue_mode, QueueMode::Polling);
        assert!(config.master_pf);
        assert_eq!(config.register_poll_interval, Duration::from_micros(100));
        assert_eq!(config.register_poll_timeout, Duration::from_millis(500));

        let config = config
            .with_function_id(2)
            .with_queue_mode(QueueMode::InterruptCoalesce)
            .with_poller_threads(64);
        assert_eq!(config.function_id, 2);
        assert_eq!(config.resolved_poller_threads(), MAX_POLLER_THREADS);
        assert_eq!(config.with_poller_threads(0).resolved_poller_threads(), 1);

        let threads = DeviceConfig::default().resolved_poller_threads();
        assert!((1..=MAX_POLLER_THREADS).contains(&threads));
    }

    #[test]
    fn test_queue_config() {
        let config = QueueConfig::default().with_ring_size_indices(1, 15);
        assert_eq!(config.h2c_ring_size_index, 1);
        assert_eq!(config.c2h_ring_size_index, 15);
        assert!(!config.is_st);
        assert!(QueueConfig::ring_size_index_valid(15));
        assert!(!QueueConfig::ring_size_index_valid(16));
    }
}

/* ---------------------------------------------------------------------------------------------- */
