// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queue pairs: an H2C and a C2H queue sharing one queue id.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::channel::{Receiver, Select, Sender, TrySendError};
use log::{trace, warn};

use crate::backend::DeviceBackend;
use crate::config::{QueueConfig, QueueMode};
use crate::context::IndirectContext;
use crate::dma::DmaDirection;
use crate::error::{QdmaError, Result};
use crate::poller::PollerHandle;
use crate::queue::{EnqueueError, Queue, QueueStats};
use crate::registers::QdmaConfigRegisters;
use crate::request::{DmaCompletion, InFlightRequest};

/* ---------------------------------------------------------------------------------------------- */

/// Queue pairs each physical function owns.
pub const MAX_QUEUES_PER_FUNCTION: usize = 512;

/// Lifecycle of a queue slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueState {
    /// No rings are allocated and the hardware contexts are clear.
    Available,
    /// Rings are allocated and the software contexts are written.
    Programmed,
    /// Requests may be submitted.
    Started,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueState::Available => "AVAILABLE",
            QueueState::Programmed => "PROGRAMMED",
            QueueState::Started => "STARTED",
        })
    }
}

/// Queue state transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueOperation {
    Add,
    Remove,
    Start,
    Stop,
}

impl QueueOperation {
    /// The only state the operation may be applied in.
    pub fn required_state(self) -> QueueState {
        match self {
            QueueOperation::Add => QueueState::Available,
            QueueOperation::Remove => QueueState::Programmed,
            QueueOperation::Start => QueueState::Programmed,
            QueueOperation::Stop => QueueState::Started,
        }
    }

    /// The state the operation leaves the queue in.
    pub fn resulting_state(self) -> QueueState {
        match self {
            QueueOperation::Add => QueueState::Programmed,
            QueueOperation::Remove => QueueState::Available,
            QueueOperation::Start => QueueState::Started,
            QueueOperation::Stop => QueueState::Programmed,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where queue pairs post finished requests.
///
/// Posting waits for room in the completion channel until the shutdown receiver disconnects.
/// From then on, whatever does not fit is dropped.
#[derive(Clone, Debug)]
pub(crate) struct CompletionPort {
    sender: Sender<DmaCompletion>,
    shutdown: Receiver<()>,
}

impl CompletionPort {
    pub(crate) fn new(sender: Sender<DmaCompletion>, shutdown: Receiver<()>) -> Self {
        CompletionPort { sender, shutdown }
    }

    fn post(&self, queue_id: u16, completions: Vec<DmaCompletion>) -> Result<()> {
        let mut completions = completions.into_iter();

        while let Some(completion) = completions.next() {
            let completion = match self.sender.try_send(completion) {
                Ok(()) => continue,
                Err(TrySendError::Full(completion)) => completion,
                Err(TrySendError::Disconnected(_)) => return Err(channel_closed(queue_id)),
            };

            let mut select = Select::new();
            let send = select.send(&self.sender);
            select.recv(&self.shutdown);

            let operation = select.select();
            if operation.index() == send {
                if operation.send(&self.sender, completion).is_err() {
                    return Err(channel_closed(queue_id));
                }
            } else {
                // Nothing is ever sent on the shutdown channel, so this only reports the disconnect.
                let _ = operation.recv(&self.shutdown);
                self.discard(queue_id, std::iter::once(completion).chain(completions));
                return Ok(());
            }
        }

        Ok(())
    }

    /// Post without waiting, dropping what does not fit.
    fn discard(&self, queue_id: u16, completions: impl Iterator<Item = DmaCompletion>) {
        for completion in completions {
            if let Err(e) = self.sender.try_send(completion) {
                warn!(
                    "Queue {}: no room to return request {}",
                    queue_id,
                    e.into_inner().id
                );
            }
        }
    }
}

fn channel_closed(queue_id: u16) -> QdmaError {
    QdmaError::InvalidState(format!("completion channel of queue {} is closed", queue_id))
}

/// What one [`QueuePair::service`] call did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ServicePass {
    /// Requests that finished and were handed to the completion channel.
    pub completed: usize,
    /// Whether either direction still has descriptors the engine has not consumed.
    pub outstanding: bool,
}

/// Both directions of one queue, shared between the device and the poller thread servicing it.
#[derive(Debug)]
pub struct QueuePair {
    id: u16,
    absolute_id: u16,
    polling: bool,
    h2c: Mutex<Queue>,
    c2h: Mutex<Queue>,
    poller: Mutex<Option<PollerHandle>>,
    port: CompletionPort,
}

impl QueuePair {
    /// Create both queues. Neither generates interrupts, so the pair's poller thread watches
    /// their writeback status whatever the device's interrupt mode.
    pub(crate) fn create(
        backend: &dyn DeviceBackend,
        registers: &QdmaConfigRegisters<'_>,
        id: u16,
        absolute_id: u16,
        config: &QueueConfig,
        port: CompletionPort,
    ) -> Result<QueuePair> {
        let mut h2c = Queue::create(backend, registers, DmaDirection::H2c, id, absolute_id, config)?;
        let mut c2h = Queue::create(backend, registers, DmaDirection::C2h, id, absolute_id, config)?;

        h2c.set_irq_enabled(false);
        c2h.set_irq_enabled(false);

        Ok(QueuePair {
            id,
            absolute_id,
            polling: !(h2c.irq_enabled() || c2h.irq_enabled()),
            h2c: Mutex::new(h2c),
            c2h: Mutex::new(c2h),
            poller: Mutex::new(None),
            port,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn absolute_id(&self) -> u16 {
        self.absolute_id
    }

    pub(crate) fn queue(&self, direction: DmaDirection) -> &Mutex<Queue> {
        match direction {
            DmaDirection::H2c => &self.h2c,
            DmaDirection::C2h => &self.c2h,
        }
    }

    pub fn stats(&self, direction: DmaDirection) -> QueueStats {
        lock(self.queue(direction)).stats()
    }

    /// Write the software context of one direction.
    pub(crate) fn set_context(
        &self,
        context: &IndirectContext<'_>,
        direction: DmaDirection,
        function_id: u8,
        mode: QueueMode,
        interrupt_vector: u16,
        bypass: bool,
    ) -> Result<()> {
        lock(self.queue(direction)).program(context, function_id, mode, interrupt_vector, bypass)
    }

    /// Point both PIDX registers at the start of their rings.
    pub(crate) fn reset_pidx(&self, registers: &QdmaConfigRegisters<'_>) -> Result<()> {
        lock(&self.h2c).update_pidx(registers, 0)?;
        lock(&self.c2h).update_pidx(registers, 0)?;
        Ok(())
    }

    pub(crate) fn set_poller(&self, handle: PollerHandle) {
        *lock(&self.poller) = Some(handle);
    }

    pub(crate) fn take_poller(&self) -> Option<PollerHandle> {
        lock(&self.poller).take()
    }

    /// Wake the poller thread servicing this pair, if there is one.
    pub(crate) fn notify(&self) {
        if let Some(handle) = lock(&self.poller).as_ref() {
            handle.notify();
        }
    }

    pub(crate) fn enqueue_mm(
        &self,
        registers: &QdmaConfigRegisters<'_>,
        request: InFlightRequest,
    ) -> std::result::Result<(), EnqueueError> {
        let direction = request.request.direction();
        lock(self.queue(direction)).enqueue_mm(registers, request)?;

        if self.polling {
            self.notify();
        }
        Ok(())
    }

    /// Service H2C, then C2H, and post what completed.
    ///
    /// Both directions are serviced and everything they completed is posted even if one of them
    /// fails; the first failure is returned afterwards. Completions are sent after the queue locks
    /// are released, so a full completion channel never holds up submissions on this pair.
    pub fn service(&self) -> Result<ServicePass> {
        let mut completions = Vec::new();

        let h2c = lock(&self.h2c).service(&mut completions);
        let c2h = lock(&self.c2h).service(&mut completions);

        let completed = completions.len();
        if completed > 0 {
            trace!("Queue {}: {} requests completed", self.id, completed);
        }
        let posted = self.port.post(self.id, completions);

        let h2c_outstanding = h2c?;
        let c2h_outstanding = c2h?;
        posted?;

        Ok(ServicePass {
            completed,
            outstanding: h2c_outstanding || c2h_outstanding,
        })
    }

    /// Fail every request still in flight on either direction.
    pub(crate) fn release_requests(&self) {
        let mut failed = lock(&self.h2c).drain_pending();
        failed.extend(lock(&self.c2h).drain_pending());

        self.port.discard(self.id, failed.into_iter());
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    use crossbeam::channel;

    use crate::backends::simulated::{SimulatedDevice, CONFIG_BAR};
    use crate::dma::{DmaPage, ScatterGatherList};
    use crate::regions::BackedBySubregion;
    use crate::request::{DmaRequestContext, DmaStatus, RequestId};

    static PAGE: [DmaPage; 1] = [DmaPage {
        bus_address: 0x20_0000,
        len: 256,
    }];

    #[derive(Debug)]
    struct OnePage;

    impl ScatterGatherList for OnePage {
        fn pages(&self) -> &[DmaPage] {
            &PAGE
        }
    }

    /// A device with ring size index 1 (65 entries) programmed.
    fn device() -> SimulatedDevice {
        let device = SimulatedDevice::new();
        device.write_register(CONFIG_BAR, 0x204 + 4, 65).unwrap();
        device
    }

    fn pair(device: &SimulatedDevice, port: CompletionPort) -> QueuePair {
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let config = QueueConfig::default().with_ring_size_indices(1, 1);
        QueuePair::create(device, &registers, 5, 5, &config, port).unwrap()
    }

    fn submit(device: &SimulatedDevice, pair: &QueuePair, id: u64, direction: DmaDirection) {
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let request = InFlightRequest {
            id: RequestId(id),
            request: DmaRequestContext::new(direction, 5, vec![0; 256], 0x1000),
            pages: Box::new(OnePage),
        };
        pair.enqueue_mm(&registers, request).unwrap();
    }

    fn set_cidx(pair: &QueuePair, direction: DmaDirection, cidx: u16) {
        let queue = lock(pair.queue(direction));
        let offset = queue.ring().writeback_offset() + 2;
        queue.ring().memory().write_le_u16(offset, cidx).unwrap();
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached within 5s");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_c2h_failure_still_posts_h2c_completions() {
        let device = device();
        let (sender, receiver) = channel::bounded(4);
        let pair = pair(&device, CompletionPort::new(sender, channel::never()));

        submit(&device, &pair, 1, DmaDirection::H2c);
        set_cidx(&pair, DmaDirection::H2c, 1);
        set_cidx(&pair, DmaDirection::C2h, 200);

        assert!(matches!(pair.service(), Err(QdmaError::OperationFailed(_))));

        let completion = receiver.try_recv().unwrap();
        assert_eq!(completion.id, RequestId(1));
        assert_eq!(completion.request.status(), DmaStatus::Finished);
        assert_eq!(pair.stats(DmaDirection::H2c).pending_requests, 0);
    }

    #[test]
    fn test_h2c_failure_still_services_c2h() {
        let device = device();
        let (sender, receiver) = channel::bounded(4);
        let pair = pair(&device, CompletionPort::new(sender, channel::never()));

        submit(&device, &pair, 2, DmaDirection::C2h);
        set_cidx(&pair, DmaDirection::H2c, 200);
        set_cidx(&pair, DmaDirection::C2h, 1);

        assert!(matches!(pair.service(), Err(QdmaError::OperationFailed(_))));
        assert_eq!(receiver.try_recv().unwrap().id, RequestId(2));
        assert_eq!(pair.stats(DmaDirection::C2h).credits, 63);
    }

    #[test]
    fn test_service_reports_progress() {
        let device = device();
        let (sender, receiver) = channel::bounded(4);
        let pair = pair(&device, CompletionPort::new(sender, channel::never()));

        submit(&device, &pair, 1, DmaDirection::H2c);
        submit(&device, &pair, 2, DmaDirection::H2c);

        let idle = pair.service().unwrap();
        assert_eq!(idle, ServicePass { completed: 0, outstanding: true });

        set_cidx(&pair, DmaDirection::H2c, 1);
        let pass = pair.service().unwrap();
        assert_eq!(pass, ServicePass { completed: 1, outstanding: true });

        set_cidx(&pair, DmaDirection::H2c, 2);
        let pass = pair.service().unwrap();
        assert_eq!(pass, ServicePass { completed: 1, outstanding: false });
        assert_eq!(receiver.len(), 2);
    }

    #[test]
    fn test_full_channel_waits_for_consumer() {
        let device = device();
        let (sender, receiver) = channel::bounded(1);
        let pair = pair(&device, CompletionPort::new(sender, channel::never()));

        submit(&device, &pair, 1, DmaDirection::H2c);
        submit(&device, &pair, 2, DmaDirection::H2c);
        set_cidx(&pair, DmaDirection::H2c, 2);

        crossbeam::scope(|scope| {
            let servicing = scope.spawn(|_| pair.service());

            let timeout = Duration::from_secs(5);
            assert_eq!(receiver.recv_timeout(timeout).unwrap().id, RequestId(1));
            assert_eq!(receiver.recv_timeout(timeout).unwrap().id, RequestId(2));

            let pass = servicing.join().unwrap().unwrap();
            assert_eq!(pass.completed, 2);
        })
        .unwrap();
    }

    #[test]
    fn test_full_channel_is_abandoned_on_shutdown() {
        let device = device();
        let (sender, receiver) = channel::bounded(1);
        let (stop, shutdown) = channel::bounded::<()>(0);
        let pair = pair(&device, CompletionPort::new(sender, shutdown));

        submit(&device, &pair, 1, DmaDirection::H2c);
        submit(&device, &pair, 2, DmaDirection::H2c);
        set_cidx(&pair, DmaDirection::H2c, 2);

        crossbeam::scope(|scope| {
            let servicing = scope.spawn(|_| pair.service());

            wait_for(|| receiver.len() == 1);
            drop(stop);

            let pass = servicing.join().unwrap().unwrap();
            assert_eq!(pass.completed, 2);
        })
        .unwrap();

        assert_eq!(receiver.len(), 1);

        // Later passes never wait either.
        submit(&device, &pair, 3, DmaDirection::C2h);
        set_cidx(&pair, DmaDirection::C2h, 1);
        assert_eq!(pair.service().unwrap().completed, 1);

        assert_eq!(receiver.len(), 1);
        assert_eq!(receiver.recv().unwrap().id, RequestId(1));
    }

    #[test]
    fn test_release_fails_requests_in_flight() {
        let device = device();
        let (sender, receiver) = channel::bounded(1);
        let pair = pair(&device, CompletionPort::new(sender, channel::never()));

        submit(&device, &pair, 1, DmaDirection::H2c);
        submit(&device, &pair, 2, DmaDirection::C2h);
        pair.release_requests();

        let failed = receiver.try_recv().unwrap();
        assert_eq!(failed.id, RequestId(1));
        assert_eq!(failed.request.status(), DmaStatus::Error);
        assert!(receiver.try_recv().is_err());
        assert_eq!(pair.stats(DmaDirection::C2h).pending_requests, 0);
    }

    #[test]
    fn test_required_states() {
        assert_eq!(QueueOperation::Add.required_state(), QueueState::Available);
        assert_eq!(QueueOperation::Remove.required_state(), QueueState::Programmed);
        assert_eq!(QueueOperation::Start.required_state(), QueueState::Programmed);
        assert_eq!(QueueOperation::Stop.required_state(), QueueState::Started);
    }

    #[test]
    fn test_operations_form_a_cycle() {
        let mut state = QueueState::Available;
        for op in [
            QueueOperation::Add,
            QueueOperation::Start,
            QueueOperation::Stop,
            QueueOperation::Remove,
        ]
        .iter()
        {
            assert_eq!(op.required_state(), state);
            state = op.resulting_state();
        }
        assert_eq!(state, QueueState::Available);
        assert_eq!(QueueState::Started.to_string(), "STARTED");
    }
}

/* ---------------------------------------------------------------------------------------------- */
