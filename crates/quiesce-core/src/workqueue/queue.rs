//! One FIFO with its lock, condition variable and worker state

use crate::cpu::CpuId;
use crate::platform::{off_cpu, Platform};
use crate::spl::{self, Ipl};
use crate::workqueue::work::{release_chain, Fifo, Job, Work};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct QueueState<T> {
    fifo: Fifo<T>,

    /// Worker thread started and not yet exited
    worker_alive: bool,
}

/// Result of `Queue::enqueue`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// The exit job is already queued
    Exiting,
    AlreadyPending,
}

pub(crate) struct Queue<T> {
    /// CPU of a per-CPU queue
    cpu: Option<CpuId>,

    /// Level the lock is taken at
    ipl: Ipl,

    state: Mutex<QueueState<T>>,

    /// Signalled on enqueue and on worker exit
    cv: Condvar,
}

impl<T> Queue<T> {
    pub(crate) fn new(cpu: Option<CpuId>, ipl: Ipl) -> Self {
        Self {
            cpu,
            ipl,
            state: Mutex::new(QueueState {
                fifo: Fifo::new(),
                worker_alive: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    /// Append `work` and wake the worker, unless the queue is exiting or
    /// the item is already pending
    pub(crate) fn enqueue(&self, work: &Arc<Work<T>>) -> Enqueued {
        let token = spl::raise(self.ipl);
        let outcome = {
            let mut state = self.state.lock();
            if state.fifo.is_exiting() {
                Enqueued::Exiting
            } else if !work.mark_pending() {
                Enqueued::AlreadyPending
            } else {
                state.fifo.push(Job::Run(Arc::clone(work)));
                self.cv.notify_one();
                Enqueued::Queued
            }
        };
        spl::restore(token);
        outcome
    }

    /// Queue the exit job; false if it already was
    pub(crate) fn push_exit(&self) -> bool {
        let token = spl::raise(self.ipl);
        let pushed = {
            let mut state = self.state.lock();
            let pushed = !state.fifo.is_exiting();
            if pushed {
                state.fifo.push(Job::Exit);
                self.cv.notify_one();
            }
            pushed
        };
        spl::restore(token);
        pushed
    }

    /// Drop whatever is still queued, returning the number of items
    ///
    /// Only called once the worker is gone.
    pub(crate) fn discard(&self) -> usize {
        let token = spl::raise(self.ipl);
        let chain = self.state.lock().fifo.take_all();
        spl::restore(token);
        release_chain(chain)
    }

    /// Next batch of jobs, waiting off CPU while the FIFO is empty
    pub(crate) fn take_batch(&self, platform: &dyn Platform) -> Job<T> {
        if let Some(head) = self.state.lock().fifo.take_all() {
            return head;
        }

        // The lock is dropped before the CPU is reacquired
        off_cpu(platform, || {
            let mut state = self.state.lock();
            loop {
                if let Some(head) = state.fifo.take_all() {
                    return head;
                }
                self.cv.wait(&mut state);
            }
        })
    }

    pub(crate) fn set_worker_alive(&self, alive: bool) {
        self.state.lock().worker_alive = alive;
    }

    #[cfg(test)]
    pub(crate) fn worker_alive(&self) -> bool {
        self.state.lock().worker_alive
    }

    /// Called by the worker as its last act
    pub(crate) fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.worker_alive = false;
        self.cv.notify_all();
    }

    /// Block off CPU until the worker has exited
    pub(crate) fn wait_worker_exit(&self, platform: &dyn Platform) {
        off_cpu(platform, || {
            let mut state = self.state.lock();
            while state.worker_alive {
                self.cv.wait(&mut state);
            }
        });
    }
}
