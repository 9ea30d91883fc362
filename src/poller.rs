// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion poller threads.
//!
//! Each thread sleeps until one of its queue pairs is notified, then services every pair assigned
//! to it. While descriptors are outstanding it keeps polling, sleeping a little longer after each
//! pass that completes nothing. Pairs go to the thread with the most room left, so load spreads
//! evenly across threads.

/* ---------------------------------------------------------------------------------------------- */

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::sync::{Parker, Unparker};
use log::{debug, warn};

use crate::error::{QdmaError, Result};
use crate::queue_pair::{QueuePair, MAX_QUEUES_PER_FUNCTION};

/* ---------------------------------------------------------------------------------------------- */

/// Queue pairs one thread may be assigned.
pub const THREAD_WEIGHT: u32 = MAX_QUEUES_PER_FUNCTION as u32;

/// Pause after a pass that completed requests while more are outstanding.
const MIN_POLL_BACKOFF: Duration = Duration::from_micros(10);

/// Longest pause between passes while requests are outstanding.
const MAX_POLL_BACKOFF: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which thread services a queue pair, and how to wake it.
#[derive(Clone, Debug)]
pub(crate) struct PollerHandle {
    index: usize,
    unparker: Unparker,
}

impl PollerHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn notify(&self) {
        self.unparker.unpark();
    }
}

#[derive(Debug, Default)]
struct PollerShared {
    pairs: Mutex<Vec<Arc<QueuePair>>>,
    terminate: AtomicBool,
}

#[derive(Debug)]
struct PollerThread {
    shared: Arc<PollerShared>,
    unparker: Unparker,
    join_handle: Option<JoinHandle<()>>,
}

/// A fixed set of poller threads.
#[derive(Debug)]
pub struct PollerPool {
    threads: Vec<PollerThread>,
    weights: Mutex<Vec<u32>>,
    /// Dropped by [`terminate`](Self::terminate), which disconnects every
    /// [`shutdown_signal`](Self::shutdown_signal).
    shutdown: Option<Sender<()>>,
    shutdown_signal: Receiver<()>,
}

impl PollerPool {
    /// Start `count` threads. If one fails to start, those already running are stopped.
    pub fn new(count: usize) -> Result<PollerPool> {
        let (shutdown, shutdown_signal) = channel::bounded(0);
        let mut pool = PollerPool {
            threads: Vec::with_capacity(count),
            weights: Mutex::new(vec![THREAD_WEIGHT; count]),
            shutdown: Some(shutdown),
            shutdown_signal,
        };

        for index in 0..count {
            let thread = PollerThread::spawn(index).map_err(|e| {
                QdmaError::ResourceExhausted(format!("failed to start poller thread {}: {}", index, e))
            })?;
            pool.threads.push(thread);
        }

        debug!("Started {} poller threads", count);

        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Pairs currently assigned to thread `index`.
    pub fn assigned(&self, index: usize) -> usize {
        self.threads
            .get(index)
            .map_or(0, |thread| lock(&thread.shared.pairs).len())
    }

    /// Disconnects once the pool starts terminating. Nothing is ever sent on it.
    pub(crate) fn shutdown_signal(&self) -> Receiver<()> {
        self.shutdown_signal.clone()
    }

    /// Assign `pair` to the thread with the highest remaining weight, the first one on ties.
    pub(crate) fn associate(&self, pair: &Arc<QueuePair>) -> Result<PollerHandle> {
        let mut weights = lock(&self.weights);

        let mut chosen: Option<usize> = None;
        for (index, weight) in weights.iter().enumerate() {
            if *weight > 0 && chosen.map_or(true, |best| *weight > weights[best]) {
                chosen = Some(index);
            }
        }

        let index = chosen.ok_or_else(|| {
            QdmaError::ResourceExhausted(format!(
                "no poller thread can take queue {}",
                pair.id()
            ))
        })?;

        weights[index] -= 1;

        let thread = &self.threads[index];
        lock(&thread.shared.pairs).push(Arc::clone(pair));

        debug!(
            "Queue {} assigned to poller thread {} (weight left {})",
            pair.id(),
            index,
            weights[index]
        );

        Ok(PollerHandle {
            index,
            unparker: thread.unparker.clone(),
        })
    }

    /// Undo [`associate`](Self::associate).
    pub(crate) fn free(&self, pair: &QueuePair, handle: &PollerHandle) {
        let mut weights = lock(&self.weights);

        let thread = match self.threads.get(handle.index) {
            Some(thread) => thread,
            None => return,
        };

        let mut pairs = lock(&thread.shared.pairs);
        match pairs.iter().position(|p| std::ptr::eq(Arc::as_ptr(p), pair)) {
            Some(position) => {
                pairs.swap_remove(position);
                weights[handle.index] += 1;
            }
            None => warn!(
                "Queue {} is not assigned to poller thread {}",
                pair.id(),
                handle.index
            ),
        }
    }

    /// Stop every thread and wait for it to exit.
    ///
    /// Threads waiting for room in the completion channel give up first, dropping the completions
    /// they still hold.
    pub fn terminate(&mut self) {
        drop(self.shutdown.take());

        for thread in &self.threads {
            thread.shared.terminate.store(true, Ordering::SeqCst);
            thread.unparker.unpark();
        }

        for (index, thread) in self.threads.iter_mut().enumerate() {
            if let Some(join_handle) = thread.join_handle.take() {
                if join_handle.join().is_err() {
                    warn!("Poller thread {} panicked", index);
                }
            }
            lock(&thread.shared.pairs).clear();
        }
    }
}

impl Drop for PollerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl PollerThread {
    fn spawn(index: usize) -> io::Result<PollerThread> {
        let shared = Arc::new(PollerShared::default());
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        let thread_shared = Arc::clone(&shared);
        let join_handle = thread::Builder::new()
            .name(format!("qdma-poller-{}", index))
            .spawn(move || run(index, &thread_shared, &parker))?;

        Ok(PollerThread {
            shared,
            unparker,
            join_handle: Some(join_handle),
        })
    }
}

fn run(index: usize, shared: &PollerShared, parker: &Parker) {
    let mut backoff: Option<Duration> = None;

    loop {
        match backoff {
            Some(timeout) => parker.park_timeout(timeout),
            None => parker.park(),
        }

        if shared.terminate.load(Ordering::SeqCst) {
            break;
        }

        let mut completed = 0;
        let mut outstanding = false;

        // Service a snapshot, so that removing a pair never waits on a pair being serviced.
        let pairs: Vec<Arc<QueuePair>> = lock(&shared.pairs).clone();
        for pair in pairs {
            match pair.service() {
                Ok(pass) => {
                    completed += pass.completed;
                    outstanding |= pass.outstanding;
                }
                Err(e) => {
                    warn!("Poller thread {}: queue {}: {}", index, pair.id(), e);
                    outstanding = true;
                }
            }
        }

        backoff = next_backoff(backoff, completed, outstanding);
    }

    debug!("Poller thread {} exiting", index);
}

/// How long to sleep before the next pass. `None` sleeps until notified.
fn next_backoff(current: Option<Duration>, completed: usize, outstanding: bool) -> Option<Duration> {
    if !outstanding {
        None
    } else if completed > 0 {
        Some(MIN_POLL_BACKOFF)
    } else {
        Some(current.map_or(MIN_POLL_BACKOFF, |backoff| {
            (backoff * 2).min(MAX_POLL_BACKOFF)
        }))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimulatedDevice, CONFIG_BAR};
    use crate::backend::DeviceBackend;
    use crate::config::QueueConfig;
    use crate::queue_pair::CompletionPort;
    use crate::regions::BackedBySubregion;
    use crate::registers::QdmaConfigRegisters;
    use crossbeam::channel::TryRecvError;

    fn pair(device: &SimulatedDevice, id: u16) -> Arc<QueuePair> {
        let registers = QdmaConfigRegisters::backed_by(device.bar(CONFIG_BAR).unwrap());
        let (sender, _) = channel::bounded(4);
        let port = CompletionPort::new(sender, channel::never());
        let config = QueueConfig::default().with_ring_size_indices(1, 1);
        Arc::new(QueuePair::create(device, &registers, id, id, &config, port).unwrap())
    }

    fn device() -> SimulatedDevice {
        let device = SimulatedDevice::new();
        device.write_register(CONFIG_BAR, 0x204 + 4, 65).unwrap();
        device
    }

    #[test]
    fn test_pairs_spread_across_threads() {
        let device = device();
        let mut pool = PollerPool::new(2).unwrap();
        let (a, b) = (pair(&device, 0), pair(&device, 1));

        let handle_a = pool.associate(&a).unwrap();
        let handle_b = pool.associate(&b).unwrap();
        assert_eq!(handle_a.index(), 0);
        assert_eq!(handle_b.index(), 1);
        assert_eq!((pool.assigned(0), pool.assigned(1)), (1, 1));

        pool.free(&a, &handle_a);
        assert_eq!(pool.assigned(0), 0);
        let handle_c = pool.associate(&pair(&device, 2)).unwrap();
        assert_eq!(handle_c.index(), 0);

        handle_b.notify();
        pool.terminate();
        assert_eq!(pool.assigned(1), 0);
    }

    #[test]
    fn test_exhausted_weights() {
        let device = device();
        let pool = PollerPool::new(1).unwrap();
        let pair = pair(&device, 0);

        *lock(&pool.weights) = vec![1];
        pool.associate(&pair).unwrap();
        assert!(matches!(
            pool.associate(&pair),
            Err(QdmaError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_terminate_disconnects_shutdown_signal() {
        let mut pool = PollerPool::new(1).unwrap();
        let signal = pool.shutdown_signal();
        assert_eq!(signal.try_recv(), Err(TryRecvError::Empty));

        pool.terminate();
        assert_eq!(signal.try_recv(), Err(TryRecvError::Disconnected));

        // A second call finds nothing left to stop.
        pool.terminate();
    }

    #[test]
    fn test_backoff_grows_only_without_progress() {
        assert_eq!(next_backoff(None, 0, false), None);
        assert_eq!(next_backoff(Some(MAX_POLL_BACKOFF), 3, false), None);

        let mut backoff = next_backoff(None, 0, true);
        assert_eq!(backoff, Some(MIN_POLL_BACKOFF));
        for _ in 0..20 {
            backoff = next_backoff(backoff, 0, true);
        }
        assert_eq!(backoff, Some(MAX_POLL_BACKOFF));

        assert_eq!(next_backoff(backoff, 1, true), Some(MIN_POLL_BACKOFF));
    }
}

/* ---------------------------------------------------------------------------------------------- */
