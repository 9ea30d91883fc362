// SPDX-License-Identifier: MIT OR Apache-2.0

//! The QDMA device handle.
//!
//! [`QdmaDevice::open`] identifies the configuration and user BARs, reads the engine's
//! capabilities, programs the global registers and the function map, and starts the poller
//! threads. From then on the handle owns every queue of its physical function: queues are added,
//! started, stopped and removed through it, and memory-mapped requests are submitted through it.
//! Completed requests come back on the channel returned by [`QdmaDevice::completions`].
//!
//! Every failed public operation is logged and its message kept as the device's
//! [last error](QdmaDevice::last_error).

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, log_enabled, trace, Level};

use crate::backend::DeviceBackend;
use crate::config::{DeviceConfig, QueueConfig};
use crate::context::{ContextSelector, FunctionMap, IndirectContext, QueueContexts};
use crate::dma::{DmaDirection, MAX_TRANSFER_SIZE};
use crate::error::{QdmaError, RejectedRequest, Result};
use crate::events::{DeviceEventSink, InterruptResult, PnpAction};
use crate::poller::PollerPool;
use crate::queue::{EnqueueError, QueueStats};
use crate::queue_pair::{
    CompletionPort, QueueOperation, QueuePair, QueueState, ServicePass, MAX_QUEUES_PER_FUNCTION,
};
use crate::regions::{BackedBySubregion, Permissions, RegisterRegion};
use crate::registers::{
    CsrTable, QdmaConfigRegisters, MM_CHANNELS, QDMA_CONFIG_BLOCK_IDENTIFIER,
};
use crate::request::{DmaCompletion, DmaRequestContext, DmaStatus, InFlightRequest, RequestId};

/* ---------------------------------------------------------------------------------------------- */

/// Physical functions the function map is programmed for.
pub const NUM_PHYSICAL_FUNCTIONS: u8 = 4;

const RING_SIZES: [u32; 16] = [
    2049, 65, 129, 193, 257, 385, 513, 769, 1025, 1537, 3073, 4097, 6145, 8193, 12289, 16385,
];

const C2H_TIMER_COUNTS: [u32; 16] = [1, 2, 4, 5, 8, 10, 15, 20, 25, 30, 50, 75, 100, 125, 150, 200];

const C2H_COUNTER_THRESHOLDS: [u32; 16] = [
    64, 2, 4, 8, 16, 24, 32, 48, 80, 96, 112, 128, 144, 160, 176, 192,
];

const C2H_BUFFER_SIZES: [u32; 16] = [
    4096, 256, 512, 1024, 2048, 3968, 4096, 4096, 4096, 4096, 4096, 4096, 4096, 8192, 9018, 16384,
];

const MAX_DESCRIPTOR_FETCH: u8 = 6;

/// Writeback accumulation interval code 5 (128 descriptors).
const WRITEBACK_INTERVAL: u8 = 5;

const BAR_MAP_BITS: u32 = 6;
const BAR_MAP_MASK: u32 = 0x3F;

/* ---------------------------------------------------------------------------------------------- */

/// Capabilities the engine advertises.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAttributes {
    pub num_pfs: u8,
    pub num_queues: u16,
    pub mailbox: bool,
    pub flr: bool,
    pub mm_completion: bool,
    pub rtl_version: u8,
    pub vivado_release: u8,
    pub everest_ip: bool,
    pub mm_enabled: bool,
    pub st_enabled: bool,
    pub mm_channels: u8,
}

impl DeviceAttributes {
    fn read(registers: &QdmaConfigRegisters<'_>) -> Result<DeviceAttributes> {
        let pf_maps = registers.pf_barlite_internal();
        let num_pfs = [
            pf_maps.pf0_bar_map().read()?,
            pf_maps.pf1_bar_map().read()?,
            pf_maps.pf2_bar_map().read()?,
            pf_maps.pf3_bar_map().read()?,
        ]
        .iter()
        .filter(|map| **map != 0)
        .count() as u8;

        let misc = registers.misc_cap();
        let channels = registers.channel_mdma();

        Ok(DeviceAttributes {
            num_pfs,
            num_queues: registers.channel_qdma_cap().max_queues().read()?,
            mailbox: misc.mailbox().read()?,
            flr: misc.flr().read()?,
            mm_completion: misc.mm_completion().read()?,
            rtl_version: misc.rtl_version().read()?,
            vivado_release: misc.vivado_release().read()?,
            everest_ip: misc.everest_ip().read()?,
            mm_enabled: channels.mm_h2c().read()? && channels.mm_c2h().read()?,
            st_enabled: channels.st_h2c().read()? && channels.st_c2h().read()?,
            mm_channels: MM_CHANNELS as u8,
        })
    }
}

/// Description of one address space (BAR) of the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressSpaceInfo {
    pub index: usize,
    pub length: u64,
    pub permissions: Permissions,
    pub is_config: bool,
    pub is_user: bool,
    pub is_bypass: bool,
}

#[derive(Debug)]
struct QueueSlot {
    state: QueueState,
    pair: Option<Arc<QueuePair>>,
}

impl Default for QueueSlot {
    fn default() -> Self {
        QueueSlot {
            state: QueueState::Available,
            pair: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/* ---------------------------------------------------------------------------------------------- */

/// An opened QDMA physical function.
pub struct QdmaDevice {
    backend: Box<dyn DeviceBackend>,
    config: DeviceConfig,
    config_bar: usize,
    user_bar: Option<usize>,
    bypass_bar: Option<usize>,
    attributes: DeviceAttributes,
    /// Serializes indirect context commands.
    register_lock: Mutex<()>,
    queues: Mutex<Vec<QueueSlot>>,
    pool: PollerPool,
    completion_sender: Sender<DmaCompletion>,
    completion_receiver: Receiver<DmaCompletion>,
    events: Mutex<Option<Box<dyn DeviceEventSink>>>,
    last_error: Mutex<Option<String>>,
    next_request_id: AtomicU64,
}

impl fmt::Debug for QdmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QdmaDevice")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("config_bar", &self.config_bar)
            .field("user_bar", &self.user_bar)
            .field("bypass_bar", &self.bypass_bar)
            .field("attributes", &self.attributes)
            .field("pool", &self.pool)
            .field("events_registered", &self.events_registered())
            .finish()
    }
}

impl QdmaDevice {
    /// Initialize the device behind `backend`.
    ///
    /// Fails with [`QdmaError::OperationFailed`] if no BAR carries the QDMA configuration block
    /// or if the memory-mapped engines are disabled. Whatever was set up before a failure is torn
    /// down again.
    pub fn open(backend: Box<dyn DeviceBackend>, config: DeviceConfig) -> Result<QdmaDevice> {
        Self::open_inner(backend, config).map_err(|e| {
            error!("Failed to open QDMA device: {}", e);
            e
        })
    }

    fn open_inner(backend: Box<dyn DeviceBackend>, config: DeviceConfig) -> Result<QdmaDevice> {
        if config.function_id >= NUM_PHYSICAL_FUNCTIONS {
            return Err(QdmaError::InvalidParameter(format!(
                "function id {} is out of range, must be below {}",
                config.function_id, NUM_PHYSICAL_FUNCTIONS
            )));
        }

        let (config_bar, user_bar, bypass_bar, attributes) = {
            let config_bar = find_config_bar(&*backend)?;
            let registers = config_registers(&*backend, config_bar)?;

            let function_id = registers.channel_function_return().function_id().read()?;
            if function_id != config.function_id {
                debug!(
                    "Device reports function {}, configured as function {}",
                    function_id, config.function_id
                );
            }

            let user_bar = find_user_bar(&*backend, &registers, function_id)?;
            let bypass_bar = (0..backend.num_bars()).find(|index| {
                *index != config_bar && Some(*index) != user_bar && backend.bar(*index).is_some()
            });

            let attributes = DeviceAttributes::read(&registers)?;
            if !attributes.mm_enabled {
                return Err(QdmaError::OperationFailed(
                    "memory-mapped engines are disabled".to_string(),
                ));
            }

            (config_bar, user_bar, bypass_bar, attributes)
        };

        debug!(
            "QDMA device {:04x}:{:04x}: config BAR {}, user BAR {:?}, bypass BAR {:?}, {:?}",
            backend.vendor_id(),
            backend.device_id(),
            config_bar,
            user_bar,
            bypass_bar,
            attributes
        );

        let pool = PollerPool::new(config.resolved_poller_threads())?;
        let (completion_sender, completion_receiver) =
            channel::bounded(config.completion_capacity.max(1));

        let device = QdmaDevice {
            backend,
            config,
            config_bar,
            user_bar,
            bypass_bar,
            attributes,
            register_lock: Mutex::new(()),
            queues: Mutex::new(
                (0..MAX_QUEUES_PER_FUNCTION)
                    .map(|_| QueueSlot::default())
                    .collect(),
            ),
            pool,
            completion_sender,
            completion_receiver,
            events: Mutex::new(None),
            last_error: Mutex::new(None),
            next_request_id: AtomicU64::new(0),
        };

        device.init_global()?;
        device.init_function_map()?;
        device.clear_all_contexts()?;

        Ok(device)
    }

    fn init_global(&self) -> Result<()> {
        let registers = self.registers()?;

        if self.config.master_pf {
            debug!("Programming global CSR defaults");
            write_csr_table(&registers, CsrTable::RingSize, &RING_SIZES)?;

            if self.attributes.st_enabled || self.attributes.mm_completion {
                write_csr_table(&registers, CsrTable::C2hCounterThreshold, &C2H_COUNTER_THRESHOLDS)?;
                write_csr_table(&registers, CsrTable::C2hTimerCount, &C2H_TIMER_COUNTS)?;

                let descriptor_cfg = registers.global_descriptor_cfg();
                descriptor_cfg.max_fetch().write(MAX_DESCRIPTOR_FETCH)?;
                descriptor_cfg.writeback_interval().write(WRITEBACK_INTERVAL)?;
            }

            if self.attributes.st_enabled {
                write_csr_table(&registers, CsrTable::C2hBufferSize, &C2H_BUFFER_SIZES)?;
            }
        }

        registers.global_error_mask().write(0xFFFF_FFFF)?;
        registers.descriptor_error_mask().write(0xFFFF_FFFF)?;
        registers.trq_error_mask().write(0xFFFF_FFFF)?;
        registers.c2h_error_mask().write(0xFFFF_FFFF)?;

        if log_enabled!(Level::Debug) {
            debug!("Global registers: {:#?}", registers);
        }

        Ok(())
    }

    fn init_function_map(&self) -> Result<()> {
        let context = self.context()?;
        let queues = MAX_QUEUES_PER_FUNCTION as u16;

        for function in 0..u16::from(NUM_PHYSICAL_FUNCTIONS) {
            let map = FunctionMap {
                queue_base: function * queues,
                queue_max: queues,
            };
            context.write(ContextSelector::FunctionMap, function, &map.to_words())?;
        }

        Ok(())
    }

    fn clear_all_contexts(&self) -> Result<()> {
        let context = self.context()?;
        for id in 0..MAX_QUEUES_PER_FUNCTION as u16 {
            context.clear_queue(self.absolute_queue_id(id))?;
        }
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    fn registers(&self) -> Result<QdmaConfigRegisters<'_>> {
        config_registers(&*self.backend, self.config_bar)
    }

    fn context(&self) -> Result<IndirectContext<'_>> {
        Ok(IndirectContext::new(
            self.registers()?,
            &self.register_lock,
            self.config.register_poll_interval,
            self.config.register_poll_timeout,
        ))
    }

    fn absolute_queue_id(&self, id: u16) -> u16 {
        u16::from(self.config.function_id) * MAX_QUEUES_PER_FUNCTION as u16 + id
    }

    fn record_error(&self, e: &QdmaError) {
        let message = e.to_string();
        error!("{}", message);
        *lock(&self.last_error) = Some(message);
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    fn pair(&self, id: u16) -> Result<Arc<QueuePair>> {
        let queues = lock(&self.queues);
        let slot = slot(&queues, id)?;
        slot.pair.as_ref().map(Arc::clone).ok_or_else(|| {
            QdmaError::InvalidParameter(format!("queue {} is {}", id, slot.state))
        })
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Allocate the rings of queue `id` and program its contexts.
    ///
    /// The queue must be available. Streaming queues are rejected.
    pub fn add_queue(&self, id: u16, config: &QueueConfig) -> Result<()> {
        let result = self.add_queue_inner(&mut lock(&self.queues), id, config);
        self.track(result)
    }

    fn add_queue_inner(&self, queues: &mut [QueueSlot], id: u16, config: &QueueConfig) -> Result<()> {
        let slot = slot_mut(queues, id)?;
        check_state(slot, id, QueueOperation::Add)?;

        if config.is_st {
            return Err(QdmaError::InvalidParameter(format!(
                "queue {}: streaming queues are not supported",
                id
            )));
        }
        if !self.attributes.mm_enabled {
            return Err(QdmaError::InvalidParameter(format!(
                "queue {}: memory-mapped engines are disabled",
                id
            )));
        }

        debug!("Adding queue {}", id);

        let registers = self.registers()?;
        let absolute_id = self.absolute_queue_id(id);

        let pair = Arc::new(QueuePair::create(
            &*self.backend,
            &registers,
            id,
            absolute_id,
            config,
            CompletionPort::new(self.completion_sender.clone(), self.pool.shutdown_signal()),
        )?);

        let handle = self.pool.associate(&pair)?;
        pair.set_poller(handle.clone());

        if let Err(e) = self.program_pair(&pair, &registers, config) {
            self.pool.free(&pair, &handle);
            if let Err(clear_error) = self.context().and_then(|c| c.clear_queue(absolute_id)) {
                debug!("Queue {}: clearing contexts after failure: {}", id, clear_error);
            }
            return Err(e);
        }

        slot.pair = Some(pair);
        slot.state = QueueOperation::Add.resulting_state();

        Ok(())
    }

    fn program_pair(
        &self,
        pair: &QueuePair,
        registers: &QdmaConfigRegisters<'_>,
        config: &QueueConfig,
    ) -> Result<()> {
        let context = self.context()?;

        for direction in [DmaDirection::H2c, DmaDirection::C2h].iter() {
            pair.set_context(
                &context,
                *direction,
                self.config.function_id,
                self.config.queue_mode,
                self.config.interrupt_vector,
                config.descriptor_bypass,
            )?;
        }

        if log_enabled!(Level::Debug) {
            let contexts = context.read_queue_contexts(pair.absolute_id())?;
            debug!("Queue {} contexts: {:#?}", pair.id(), contexts);
        }

        pair.reset_pidx(registers)
    }

    /// Allow requests to be submitted to queue `id`.
    pub fn start_queue(&self, id: u16) -> Result<()> {
        let result = self.transition(&mut lock(&self.queues), id, QueueOperation::Start);
        self.track(result)
    }

    /// Stop accepting requests on queue `id`. Requests in flight still complete.
    pub fn stop_queue(&self, id: u16) -> Result<()> {
        let result = self.transition(&mut lock(&self.queues), id, QueueOperation::Stop);
        self.track(result)
    }

    fn transition(&self, queues: &mut [QueueSlot], id: u16, operation: QueueOperation) -> Result<()> {
        let slot = slot_mut(queues, id)?;
        check_state(slot, id, operation)?;
        slot.state = operation.resulting_state();
        debug!("Queue {} is {}", id, slot.state);
        Ok(())
    }

    /// Clear the contexts of queue `id` and release its rings.
    ///
    /// Requests still in flight come back on the completion channel with
    /// [`DmaStatus::Error`].
    ///
    /// A poller thread in the middle of a pass may still hold the queue when this returns. Its
    /// rings are unlocked once that pass ends, which finds no requests left to complete.
    pub fn remove_queue(&self, id: u16) -> Result<()> {
        let result = self.remove_queue_inner(&mut lock(&self.queues), id);
        self.track(result)
    }

    fn remove_queue_inner(&self, queues: &mut [QueueSlot], id: u16) -> Result<()> {
        let slot = slot_mut(queues, id)?;
        check_state(slot, id, QueueOperation::Remove)?;

        debug!("Removing queue {}", id);

        self.context()?.clear_queue(self.absolute_queue_id(id))?;

        if let Some(pair) = slot.pair.take() {
            if let Some(handle) = pair.take_poller() {
                self.pool.free(&pair, &handle);
            }
            pair.release_requests();
        }

        slot.state = QueueOperation::Remove.resulting_state();
        Ok(())
    }

    /// Stop every started queue and remove every programmed one.
    pub fn queues_clear(&self) {
        let mut queues = lock(&self.queues);

        for id in 0..MAX_QUEUES_PER_FUNCTION as u16 {
            let state = queues[usize::from(id)].state;

            if state == QueueState::Started {
                if let Err(e) = self.transition(&mut queues, id, QueueOperation::Stop) {
                    self.record_error(&e);
                    continue;
                }
            }
            if state != QueueState::Available {
                if let Err(e) = self.remove_queue_inner(&mut queues, id) {
                    self.record_error(&e);
                }
            }
        }
    }

    pub fn queue_state(&self, id: u16) -> Result<QueueState> {
        let result = slot(&lock(&self.queues), id).map(|slot| slot.state);
        self.track(result)
    }

    /// The state a queue must be in for `operation` to be accepted.
    pub fn required_state(operation: QueueOperation) -> QueueState {
        operation.required_state()
    }

    /// Collect finished requests of queue `id` right away.
    ///
    /// Poller threads watch every queue's writeback status whatever the
    /// [queue mode](crate::config::QueueMode), so this is only needed to pick up completions
    /// sooner, for instance from an interrupt handler.
    pub fn service_queue(&self, id: u16) -> Result<ServicePass> {
        let result = self.pair(id).and_then(|pair| pair.service());
        self.track(result)
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Submit a memory-mapped transfer on a started queue.
    ///
    /// The buffer is pinned page by page and one descriptor is written per page. On success the
    /// request comes back on the [completion channel](Self::completions) once the engine has
    /// processed all of its descriptors.
    pub fn submit_mm(
        &self,
        mut request: DmaRequestContext,
    ) -> std::result::Result<RequestId, RejectedRequest> {
        request.reset();

        if let Err(e) = validate_request(&request) {
            return Err(self.reject(e, request));
        }

        let queues = lock(&self.queues);
        let queue_id = request.queue_id();

        let pair = match slot(&queues, queue_id) {
            Ok(slot) if slot.state == QueueState::Started => slot.pair.as_ref().map(Arc::clone),
            Ok(slot) => {
                let e = QdmaError::InvalidParameter(format!(
                    "queue {} is {}, requests need {}",
                    queue_id,
                    slot.state,
                    QueueState::Started
                ));
                return Err(self.reject(e, request));
            }
            Err(e) => return Err(self.reject(e, request)),
        };

        let (pair, registers) = match (pair, self.registers()) {
            (Some(pair), Ok(registers)) => (pair, registers),
            (None, _) => {
                let e = QdmaError::InvalidState(format!("started queue {} has no rings", queue_id));
                return Err(self.reject(e, request));
            }
            (_, Err(e)) => return Err(self.reject(e, request)),
        };

        // SAFETY: the buffer is owned by the request, which stays in the tracker together with
        // the returned pages until they are dropped. Moving a `Vec` does not move its contents.
        let pages = match unsafe {
            self.backend.lock_scatter_gather(
                request.buffer_ptr(),
                request.bytes(),
                request.direction(),
            )
        } {
            Ok(pages) => pages,
            Err(e) => return Err(self.reject(e.into(), request)),
        };

        request.mark_submitted();
        let id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));

        trace!(
            "Submitting request {}: {} queue {}, {} bytes in {} pages at device offset {:#x}",
            id,
            request.direction(),
            queue_id,
            request.bytes(),
            pages.pages().len(),
            request.offset()
        );

        let result = pair.enqueue_mm(&registers, InFlightRequest { id, request, pages });
        drop(queues);

        match result {
            Ok(()) => Ok(id),
            Err(EnqueueError { error, request }) => {
                let InFlightRequest { request, pages, .. } = request;
                drop(pages);
                Err(self.reject(error, request))
            }
        }
    }

    fn reject(&self, error: QdmaError, mut request: DmaRequestContext) -> RejectedRequest {
        self.record_error(&error);
        request.set_status(DmaStatus::Error);
        RejectedRequest { error, request }
    }

    /// Receiving end of the completion channel shared by every queue of the device.
    pub fn completions(&self) -> &Receiver<DmaCompletion> {
        &self.completion_receiver
    }

    /* ------------------------------------------------------------------------------------------ */

    pub fn vendor_id(&self) -> u16 {
        self.backend.vendor_id()
    }

    pub fn device_id(&self) -> u16 {
        self.backend.device_id()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn config_bar_index(&self) -> usize {
        self.config_bar
    }

    pub fn user_bar_index(&self) -> Option<usize> {
        self.user_bar
    }

    pub fn bypass_bar_index(&self) -> Option<usize> {
        self.bypass_bar
    }

    pub fn num_address_spaces(&self) -> usize {
        self.backend.num_bars()
    }

    /// Describe BAR `index`, or `None` if it is absent or not mapped.
    pub fn address_space_info(&self, index: usize) -> Option<AddressSpaceInfo> {
        let region = self.backend.bar(index)?;
        Some(AddressSpaceInfo {
            index,
            length: region.len(),
            permissions: region.permissions(),
            is_config: index == self.config_bar,
            is_user: Some(index) == self.user_bar,
            is_bypass: Some(index) == self.bypass_bar,
        })
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    pub fn queue_stats(&self, id: u16, direction: DmaDirection) -> Result<QueueStats> {
        let result = self.pair(id).map(|pair| pair.stats(direction));
        self.track(result)
    }

    /// Read back and decode every context of queue `id`.
    pub fn queue_contexts(&self, id: u16) -> Result<QueueContexts> {
        let result = check_queue_id(id)
            .and_then(|_| self.context())
            .and_then(|context| context.read_queue_contexts(self.absolute_queue_id(id)));
        self.track(result)
    }

    /// Message of the most recent failed operation.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /* ------------------------------------------------------------------------------------------ */

    pub fn register_events(&self, sink: Box<dyn DeviceEventSink>) -> Result<()> {
        let mut events = lock(&self.events);
        let result = if events.is_some() {
            Err(QdmaError::OperationAlreadyDone(
                "events are already registered".to_string(),
            ))
        } else {
            *events = Some(sink);
            debug!("Event sink registered");
            Ok(())
        };
        drop(events);
        self.track(result)
    }

    pub fn unregister_events(&self) -> Result<()> {
        let result = match lock(&self.events).take() {
            Some(_) => {
                debug!("Event sink unregistered");
                Ok(())
            }
            None => Err(QdmaError::OperationAlreadyDone(
                "events are not registered".to_string(),
            )),
        };
        self.track(result)
    }

    pub fn events_registered(&self) -> bool {
        lock(&self.events).is_some()
    }

    pub fn dispatch_pnp_event(&self, action: PnpAction) {
        debug!("Plug-and-play event {:?}", action);
        if let Some(sink) = lock(&self.events).as_ref() {
            sink.on_pnp_event(action);
        }
    }

    pub fn dispatch_interrupt(&self, result: &InterruptResult) {
        trace!(
            "{} interrupt, counter {}, lost {}",
            result.kind,
            result.counter,
            result.lost
        );
        if let Some(sink) = lock(&self.events).as_ref() {
            sink.on_interrupt(result);
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Tear down every queue and stop the poller threads. Dropping the device does the same.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.queues_clear();
        self.pool.terminate();
    }
}

impl Drop for QdmaDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/* ---------------------------------------------------------------------------------------------- */

fn config_registers(backend: &dyn DeviceBackend, index: usize) -> Result<QdmaConfigRegisters<'_>> {
    backend
        .bar(index)
        .map(|bar| QdmaConfigRegisters::backed_by(bar))
        .ok_or_else(|| QdmaError::OperationFailed(format!("config BAR {} is not mapped", index)))
}

fn find_config_bar(backend: &dyn DeviceBackend) -> Result<usize> {
    (0..backend.num_bars())
        .find(|index| {
            backend.bar(*index).map_or(false, |bar| {
                QdmaConfigRegisters::backed_by(bar)
                    .config_block_identifier()
                    .identifier()
                    .read()
                    .map_or(false, |id| id == QDMA_CONFIG_BLOCK_IDENTIFIER)
            })
        })
        .ok_or_else(|| {
            QdmaError::OperationFailed("no BAR holds the QDMA config block".to_string())
        })
}

/// The external BAR-lite map holds six bits per function, one per 32-bit BAR slot.
fn find_user_bar(
    backend: &dyn DeviceBackend,
    registers: &QdmaConfigRegisters<'_>,
    function_id: u8,
) -> Result<Option<usize>> {
    let barlite = registers.pf_barlite_external().read()?;
    let map = barlite
        .checked_shr(BAR_MAP_BITS * u32::from(function_id))
        .unwrap_or(0)
        & BAR_MAP_MASK;

    let slots = backend.num_bars().min(BAR_MAP_BITS as usize);
    Ok((0..slots).find(|slot| map & (1 << slot) != 0).map(|slot| slot / 2))
}

fn write_csr_table(registers: &QdmaConfigRegisters<'_>, table: CsrTable, values: &[u32]) -> Result<()> {
    for (index, value) in values.iter().enumerate() {
        registers.csr_table(table, index)?.write(*value)?;
    }
    Ok(())
}

fn check_queue_id(id: u16) -> Result<()> {
    if usize::from(id) >= MAX_QUEUES_PER_FUNCTION {
        return Err(QdmaError::InvalidParameter(format!(
            "queue {} is out of range, must be below {}",
            id, MAX_QUEUES_PER_FUNCTION
        )));
    }
    Ok(())
}

fn slot(queues: &[QueueSlot], id: u16) -> Result<&QueueSlot> {
    check_queue_id(id)?;
    Ok(&queues[usize::from(id)])
}

fn slot_mut(queues: &mut [QueueSlot], id: u16) -> Result<&mut QueueSlot> {
    check_queue_id(id)?;
    Ok(&mut queues[usize::from(id)])
}

fn check_state(slot: &QueueSlot, id: u16, operation: QueueOperation) -> Result<()> {
    let required = operation.required_state();
    if slot.state != required {
        return Err(QdmaError::InvalidParameter(format!(
            "queue {} is {}, {:?} requires {}",
            id, slot.state, operation, required
        )));
    }
    Ok(())
}

fn validate_request(request: &DmaRequestContext) -> Result<()> {
    check_queue_id(request.queue_id())?;

    if request.bytes() == 0 || request.bytes() > MAX_TRANSFER_SIZE {
        return Err(QdmaError::InvalidParameter(format!(
            "request of {} bytes on queue {}, must be 1 to {:#x}",
            request.bytes(),
            request.queue_id(),
            MAX_TRANSFER_SIZE
        )));
    }

    Ok(())
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backends::simulated::{SimulatedDevice, CONFIG_BAR, SIMULATED_PAGE_SIZE, USER_BAR};
    use crate::config::QueueMode;
    use crate::events::{InterruptKind, MockDeviceEventSink};

    const QUEUE: u16 = 3;

    fn open(device: &Arc<SimulatedDevice>) -> QdmaDevice {
        let config = DeviceConfig::default().with_poller_threads(2);
        QdmaDevice::open(Box::new(Arc::clone(device)), config).unwrap()
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(std::time::Instant::now() < deadline, "condition not reached within 5s");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn write_cidx(qdma: &QdmaDevice, id: u16, direction: DmaDirection, cidx: u16) {
        let pair = qdma.pair(id).unwrap();
        let queue = lock(pair.queue(direction));
        let offset = queue.ring().writeback_offset() + 2;
        queue.ring().memory().write_le_u16(offset, cidx).unwrap();
    }

    #[test]
    fn test_open_programs_device() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);

        assert_eq!(qdma.config_bar_index(), CONFIG_BAR);
        assert_eq!(qdma.user_bar_index(), Some(USER_BAR));
        assert_eq!(qdma.bypass_bar_index(), Some(2));
        assert_eq!(qdma.num_address_spaces(), 3);

        let info = qdma.address_space_info(USER_BAR).unwrap();
        assert!(info.is_user && !info.is_config && !info.is_bypass);
        assert!(qdma.address_space_info(7).is_none());

        let attributes = qdma.attributes();
        assert_eq!(attributes.num_pfs, 4);
        assert_eq!(attributes.num_queues, 512);
        assert!(attributes.mailbox && attributes.flr && !attributes.mm_completion);
        assert!(attributes.mm_enabled && !attributes.st_enabled);
        assert_eq!(attributes.mm_channels, 1);

        assert_eq!(device.read_register(CONFIG_BAR, 0x204).unwrap(), 2049);
        assert_eq!(device.read_register(CONFIG_BAR, 0x204 + 4 * 6).unwrap(), 513);
        assert_eq!(device.read_register(CONFIG_BAR, 0xA40).unwrap(), 0);
        assert_eq!(device.read_register(CONFIG_BAR, 0x24C).unwrap(), 0xFFFF_FFFF);
        assert_eq!(device.read_register(CONFIG_BAR, 0xAF4).unwrap(), 0xFFFF_FFFF);

        // The last indirect command clears the credit context of the last queue.
        let command = device.read_register(CONFIG_BAR, 0x844).unwrap();
        assert_eq!(command, (5 << 1) | (511 << 7));

        for id in [0u16, 511].iter() {
            assert_eq!(qdma.queue_state(*id).unwrap(), QueueState::Available);
        }
        assert!(qdma.queue_state(512).is_err());

        qdma.close();
    }

    #[test]
    fn test_open_rejects_disabled_mm_engines() {
        let device = Arc::new(SimulatedDevice::new());
        device.write_register(CONFIG_BAR, 0x118, 0x3_0000).unwrap();

        let result = QdmaDevice::open(Box::new(Arc::clone(&device)), DeviceConfig::default());
        assert!(matches!(result, Err(QdmaError::OperationFailed(_))));
    }

    #[test]
    fn test_open_without_config_block() {
        let device = Arc::new(SimulatedDevice::new());
        device.write_register(CONFIG_BAR, 0x000, 0).unwrap();

        let result = QdmaDevice::open(Box::new(Arc::clone(&device)), DeviceConfig::default());
        assert!(matches!(result, Err(QdmaError::OperationFailed(_))));
    }

    #[test]
    fn test_non_master_leaves_global_tables() {
        let device = Arc::new(SimulatedDevice::new());
        let config = DeviceConfig::default()
            .with_master_pf(false)
            .with_function_id(1)
            .with_poller_threads(1);
        let qdma = QdmaDevice::open(Box::new(Arc::clone(&device)), config).unwrap();

        assert_eq!(device.read_register(CONFIG_BAR, 0x204).unwrap(), 0);
        assert_eq!(device.read_register(CONFIG_BAR, 0x258).unwrap(), 0xFFFF_FFFF);

        // Absolute id of the last queue of function 1.
        let command = device.read_register(CONFIG_BAR, 0x844).unwrap();
        assert_eq!(command >> 7, 1023);

        drop(qdma);
    }

    #[test]
    fn test_queue_three_round_trip() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);

        qdma.add_queue(QUEUE, &QueueConfig::default()).unwrap();
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Programmed);
        assert_eq!(device.locked_buffers(), 2);

        let contexts = qdma.queue_contexts(QUEUE).unwrap();
        assert_eq!(contexts.c2h_software.ring_size_index, 6);
        assert!(contexts.h2c_software.queue_enable);

        qdma.start_queue(QUEUE).unwrap();

        let request = DmaRequestContext::new(
            DmaDirection::C2h,
            QUEUE,
            vec![0; 3 * SIMULATED_PAGE_SIZE],
            0x8000,
        );
        let id = qdma.submit_mm(request).unwrap();
        assert_eq!(device.pinned_lists(), 1);

        let stats = qdma.queue_stats(QUEUE, DmaDirection::C2h).unwrap();
        assert_eq!(stats.sw_index, 3);
        assert_eq!(stats.pending_requests, 1);

        write_cidx(&qdma, QUEUE, DmaDirection::C2h, 3);

        let completion = qdma
            .completions()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(completion.id, id);
        assert_eq!(completion.request.status(), DmaStatus::Finished);
        assert!(completion.request.elapsed().is_some());
        assert!(qdma.completions().try_recv().is_err());
        assert_eq!(device.pinned_lists(), 0);

        let stats = qdma.queue_stats(QUEUE, DmaDirection::C2h).unwrap();
        assert_eq!(stats.credits, 512 - 1);
        assert_eq!(stats.pending_requests, 0);

        qdma.stop_queue(QUEUE).unwrap();
        qdma.remove_queue(QUEUE).unwrap();
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Available);
    }

    #[test]
    fn test_invalid_transitions_change_nothing() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);

        assert!(matches!(qdma.start_queue(QUEUE), Err(QdmaError::InvalidParameter(_))));
        assert!(matches!(qdma.remove_queue(QUEUE), Err(QdmaError::InvalidParameter(_))));
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Available);

        qdma.add_queue(QUEUE, &QueueConfig::default()).unwrap();
        assert!(qdma.add_queue(QUEUE, &QueueConfig::default()).is_err());
        assert!(qdma.stop_queue(QUEUE).is_err());
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Programmed);

        qdma.start_queue(QUEUE).unwrap();
        assert!(qdma.remove_queue(QUEUE).is_err());
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Started);

        assert!(qdma.add_queue(512, &QueueConfig::default()).is_err());
        assert!(matches!(
            qdma.add_queue(4, &QueueConfig::default().with_streaming(true)),
            Err(QdmaError::InvalidParameter(_))
        ));

        assert_eq!(
            QdmaDevice::required_state(QueueOperation::Stop),
            QueueState::Started
        );

        qdma.queues_clear();
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Available);
        assert_eq!(device.locked_buffers(), 0);
    }

    #[test]
    fn test_submit_without_credits_leaves_indices() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);

        // Index 1 holds a ring of 65 entries: 64 descriptors, 63 credits.
        let config = QueueConfig::default().with_ring_size_indices(1, 1);
        qdma.add_queue(QUEUE, &config).unwrap();
        qdma.start_queue(QUEUE).unwrap();

        let before = qdma.queue_stats(QUEUE, DmaDirection::H2c).unwrap();
        assert_eq!(before.credits, 63);

        let request = DmaRequestContext::new(
            DmaDirection::H2c,
            QUEUE,
            vec![0; 64 * SIMULATED_PAGE_SIZE],
            0,
        );
        let rejected = qdma.submit_mm(request).unwrap_err();
        assert!(matches!(rejected.error, QdmaError::ResourceExhausted(_)));
        assert_eq!(rejected.request.status(), DmaStatus::Error);
        assert_eq!(device.pinned_lists(), 0);

        let after = qdma.queue_stats(QUEUE, DmaDirection::H2c).unwrap();
        assert_eq!((after.sw_index, after.hw_index, after.credits), (0, 0, 63));
        assert!(qdma.last_error().unwrap().contains("insufficient resources"));
    }

    #[test]
    fn test_submit_rejects_bad_requests() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);
        qdma.add_queue(QUEUE, &QueueConfig::default()).unwrap();

        let not_started = DmaRequestContext::new(DmaDirection::H2c, QUEUE, vec![1; 16], 0);
        let (error, request) = qdma.submit_mm(not_started).unwrap_err().into_inner();
        assert!(matches!(error, QdmaError::InvalidParameter(_)));
        assert_eq!(request.buffer(), &[1; 16][..]);

        qdma.start_queue(QUEUE).unwrap();

        let empty = DmaRequestContext::new(DmaDirection::H2c, QUEUE, Vec::new(), 0);
        assert!(qdma.submit_mm(empty).is_err());

        let bad_queue = DmaRequestContext::new(DmaDirection::H2c, 600, vec![0; 16], 0);
        assert!(qdma.submit_mm(bad_queue).is_err());
        assert!(qdma.last_error().unwrap().contains("600"));
    }

    #[test]
    fn test_remove_fails_pending_requests() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);
        qdma.add_queue(QUEUE, &QueueConfig::default()).unwrap();
        qdma.start_queue(QUEUE).unwrap();

        let request = DmaRequestContext::new(DmaDirection::H2c, QUEUE, vec![0; 100], 0);
        let id = qdma.submit_mm(request).unwrap();

        qdma.stop_queue(QUEUE).unwrap();
        qdma.remove_queue(QUEUE).unwrap();

        let completion = qdma.completions().try_recv().unwrap();
        assert_eq!(completion.id, id);
        assert_eq!(completion.request.status(), DmaStatus::Error);
        assert_eq!(device.pinned_lists(), 0);
    }

    #[test]
    fn test_close_with_unread_completions() {
        let device = Arc::new(SimulatedDevice::new());
        let config = DeviceConfig::default()
            .with_poller_threads(1)
            .with_completion_capacity(1);
        let qdma = QdmaDevice::open(Box::new(Arc::clone(&device)), config).unwrap();
        let completions = qdma.completions().clone();

        qdma.add_queue(QUEUE, &QueueConfig::default()).unwrap();
        qdma.start_queue(QUEUE).unwrap();
        for _ in 0..2 {
            let request = DmaRequestContext::new(DmaDirection::H2c, QUEUE, vec![0; 64], 0);
            qdma.submit_mm(request).unwrap();
        }
        write_cidx(&qdma, QUEUE, DmaDirection::H2c, 2);

        // One completion fills the channel, the poller holds on to the other.
        wait_for(|| completions.len() == 1);

        let (done, closed) = channel::bounded(1);
        std::thread::spawn(move || {
            qdma.close();
            let _ = done.send(());
        });

        assert!(closed.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(completions.len(), 1);
        assert_eq!(device.locked_buffers(), 0);
    }

    #[test]
    fn test_pollers_complete_interrupt_mode_queues_sharing_a_thread() {
        let device = Arc::new(SimulatedDevice::new());
        let config = DeviceConfig::default()
            .with_poller_threads(1)
            .with_queue_mode(QueueMode::Interrupt);
        let qdma = QdmaDevice::open(Box::new(Arc::clone(&device)), config).unwrap();

        for id in [QUEUE, QUEUE + 1].iter() {
            qdma.add_queue(*id, &QueueConfig::default()).unwrap();
            qdma.start_queue(*id).unwrap();
        }
        assert_eq!(qdma.pool.assigned(0), 2);
        assert!(qdma.queue_contexts(QUEUE).unwrap().h2c_software.irq_enable);

        let h2c = DmaRequestContext::new(DmaDirection::H2c, QUEUE, vec![0; 64], 0);
        let c2h = DmaRequestContext::new(DmaDirection::C2h, QUEUE + 1, vec![0; 64], 0x100);
        let mut expected = vec![qdma.submit_mm(h2c).unwrap(), qdma.submit_mm(c2h).unwrap()];

        write_cidx(&qdma, QUEUE, DmaDirection::H2c, 1);
        write_cidx(&qdma, QUEUE + 1, DmaDirection::C2h, 1);

        let mut received = Vec::new();
        for _ in 0..2 {
            let completion = qdma
                .completions()
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            assert_eq!(completion.request.status(), DmaStatus::Finished);
            received.push(completion.id);
        }
        received.sort();
        expected.sort();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_remove_while_queues_are_serviced() {
        let device = Arc::new(SimulatedDevice::new());
        let config = DeviceConfig::default().with_poller_threads(1);
        let qdma = QdmaDevice::open(Box::new(Arc::clone(&device)), config).unwrap();

        let busy = QUEUE + 1;
        for id in [QUEUE, busy].iter() {
            qdma.add_queue(*id, &QueueConfig::default()).unwrap();
            qdma.start_queue(*id).unwrap();
        }

        // Neither request completes, so the poller keeps passing over both queues.
        let busy_request = DmaRequestContext::new(DmaDirection::H2c, busy, vec![0; 64], 0);
        let busy_id = qdma.submit_mm(busy_request).unwrap();
        let request = DmaRequestContext::new(DmaDirection::H2c, QUEUE, vec![0; 64], 0);
        let id = qdma.submit_mm(request).unwrap();

        crossbeam::scope(|scope| {
            scope.spawn(|_| {
                for _ in 0..100 {
                    assert!(qdma.service_queue(busy).unwrap().outstanding);
                }
            });

            qdma.stop_queue(QUEUE).unwrap();
            qdma.remove_queue(QUEUE).unwrap();
        })
        .unwrap();

        assert_eq!(qdma.pool.assigned(0), 1);
        let failed = qdma.completions().try_recv().unwrap();
        assert_eq!(failed.id, id);
        assert_eq!(failed.request.status(), DmaStatus::Error);

        write_cidx(&qdma, busy, DmaDirection::H2c, 1);
        let completion = qdma
            .completions()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(completion.id, busy_id);
        assert_eq!(completion.request.status(), DmaStatus::Finished);
    }

    #[test]
    fn test_add_queue_rolls_back_on_allocation_failure() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);

        device.limit_locked_buffers(1);
        let result = qdma.add_queue(QUEUE, &QueueConfig::default());
        assert!(matches!(result, Err(QdmaError::ResourceExhausted(_))));
        assert_eq!(qdma.queue_state(QUEUE).unwrap(), QueueState::Available);
        assert_eq!(device.locked_buffers(), 0);
        assert!(qdma.last_error().is_some());

        device.limit_locked_buffers(usize::MAX);
        qdma.add_queue(QUEUE, &QueueConfig::default()).unwrap();
    }

    #[test]
    fn test_event_registration() {
        let device = Arc::new(SimulatedDevice::new());
        let qdma = open(&device);

        let mut sink = MockDeviceEventSink::new();
        sink.expect_on_pnp_event()
            .withf(|action| *action == PnpAction::Remove)
            .times(1)
            .return_const(());
        sink.expect_on_interrupt().times(1).return_const(());

        assert!(!qdma.events_registered());
        assert!(matches!(
            qdma.unregister_events(),
            Err(QdmaError::OperationAlreadyDone(_))
        ));

        qdma.register_events(Box::new(sink)).unwrap();
        assert!(qdma.events_registered());
        assert!(matches!(
            qdma.register_events(Box::new(MockDeviceEventSink::new())),
            Err(QdmaError::OperationAlreadyDone(_))
        ));

        qdma.dispatch_pnp_event(PnpAction::Remove);
        qdma.dispatch_interrupt(&InterruptResult {
            counter: 1,
            lost: 0,
            kind: InterruptKind::Msi,
            last_message: 0,
            dma_status: 0,
            int_status: 0,
        });

        qdma.unregister_events().unwrap();
        assert!(!qdma.events_registered());
        qdma.dispatch_pnp_event(PnpAction::Insert);
    }
}

/* ---------------------------------------------------------------------------------------------- */
