//! Checkpoint tracker and switch-point observer

use crate::cpu::{CpuId, CpuSet};
use crate::platform::{Platform, SwitchObserver};
use crate::pserialize::checkpoint::{Checkpoint, Stage};
use crate::pserialize::read;
use crate::spl;
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Per-checkpoint state, owned by the engine's arena
struct Slot {
    /// Thread with a request in flight
    owner: Option<ThreadId>,

    /// CPUs running when the request began; cleared on completion
    target: CpuSet,

    /// CPUs seen switching since the request entered its current stage
    pass: CpuSet,

    stage: Option<Stage>,
}

/// Everything guarded by the engine lock
struct Queues {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    stages: [VecDeque<usize>; 3],
    live: usize,
}

impl Queues {
    fn slot(&self, index: usize) -> &Slot {
        self.slots[index]
            .as_ref()
            .expect("checkpoint slot released while in use")
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot {
        self.slots[index]
            .as_mut()
            .expect("checkpoint slot released while in use")
    }

    /// Make sure every stage queue can hold every live checkpoint
    fn reserve_stage_capacity(&mut self) -> Result<()> {
        let wanted = self.live + 1;
        for queue in self.stages.iter_mut() {
            queue
                .try_reserve(wanted.saturating_sub(queue.len()))
                .map_err(|_| Error::NoMemory("checkpoint queue"))?;
        }
        Ok(())
    }

    /// Mark `cpu` on every request in `from`; promote those that have now
    /// seen all their target CPUs. Visits only the entries present when the
    /// scan began and keeps their order.
    fn advance(&mut self, from: Stage, cpu: CpuId) {
        let Some(to) = from.next() else {
            return;
        };

        for _ in 0..self.stages[from.index()].len() {
            let Some(index) = self.stages[from.index()].pop_front() else {
                break;
            };
            let slot = self.slots[index]
                .as_mut()
                .expect("queued checkpoint without a slot");

            if slot.target.contains(cpu) {
                slot.pass.set(cpu);
            }

            if slot.pass == slot.target {
                slot.pass.zero();
                slot.stage = Some(to);
                self.stages[to.index()].push_back(index);
            } else {
                self.stages[from.index()].push_back(index);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    exclusive_syncs: AtomicU64,
    slow_scans: AtomicU64,
    total_wait_us: AtomicU64,
    max_wait_us: AtomicU64,
    panic_skips: AtomicU64,
}

/// Snapshot of engine statistics
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Completed `perform` calls
    pub exclusive_syncs: u64,
    /// `switchpoint` calls that took the lock
    pub slow_scans: u64,
    /// Total time writers spent waiting (microseconds)
    pub total_wait_us: u64,
    /// Longest single wait (microseconds)
    pub max_wait_us: u64,
    /// `perform` calls skipped because the system had panicked
    pub panic_skips: u64,
    /// Requests currently queued
    pub outstanding: usize,
    /// Live checkpoint handles
    pub checkpoints: usize,
}

/// Passive serialization engine: the three stage queues, the
/// outstanding-work counter and the platform they are driven by
pub struct Engine {
    platform: Arc<dyn Platform>,
    ncpu: usize,

    /// Queued requests; read without the lock on the switchpoint fast path
    work_todo: AtomicUsize,

    queues: Mutex<Queues>,

    stats: Stats,
}

impl Engine {
    /// Build the engine and hook it into the platform's context switches
    pub fn new(platform: Arc<dyn Platform>) -> Arc<Self> {
        let ncpu = platform.ncpu();
        assert!(ncpu > 0, "passive serialization needs at least one cpu");

        let engine = Arc::new(Self {
            platform,
            ncpu,
            work_todo: AtomicUsize::new(0),
            queues: Mutex::new(Queues {
                slots: Vec::new(),
                free: Vec::new(),
                stages: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                live: 0,
            }),
            stats: Stats::default(),
        });

        let observer: Arc<dyn SwitchObserver> = engine.clone();
        engine.platform.attach_switch_observer(Arc::downgrade(&observer));
        engine
    }

    /// Platform the engine runs on
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Allocate a checkpoint handle
    pub fn create(self: &Arc<Self>) -> Result<Checkpoint> {
        let target = CpuSet::try_new(self.ncpu)?;
        let pass = CpuSet::try_new(self.ncpu)?;
        let slot = Slot {
            owner: None,
            target,
            pass,
            stage: None,
        };

        let mut q = self.queues.lock();
        q.reserve_stage_capacity()?;

        let index = match q.free.pop() {
            Some(index) => {
                q.slots[index] = Some(slot);
                index
            }
            None => {
                q.slots
                    .try_reserve(1)
                    .map_err(|_| Error::NoMemory("checkpoint"))?;
                q.slots.push(Some(slot));
                q.slots.len() - 1
            }
        };
        q.live += 1;

        Ok(Checkpoint {
            engine: Arc::clone(self),
            index,
        })
    }

    /// Release a checkpoint handle
    pub fn destroy(&self, checkpoint: Checkpoint) {
        assert!(self.owns(&checkpoint), "checkpoint belongs to another engine");
        drop(checkpoint);
    }

    pub(crate) fn release_slot(&self, index: usize) {
        let mut q = self.queues.lock();
        let slot = q.slots[index].take();
        if !thread::panicking() {
            let slot = slot.expect("checkpoint destroyed twice");
            assert!(slot.owner.is_none(), "checkpoint destroyed with a request in flight");
        }
        q.free.push(index);
        q.live -= 1;
    }

    fn owns(&self, checkpoint: &Checkpoint) -> bool {
        std::ptr::eq(Arc::as_ptr(&checkpoint.engine), self)
    }

    /// Write-side barrier
    ///
    /// The caller holds the lock that serializes updates to the protected
    /// data and has already unlinked what it wants to reclaim. Returns once
    /// every CPU running at the time of the call has passed through two
    /// observed context switches. Must not be called from interrupt
    /// context or inside a read section.
    pub fn perform(&self, checkpoint: &Checkpoint) {
        assert!(self.owns(checkpoint), "checkpoint belongs to another engine");
        assert!(!spl::in_hard_interrupt(), "pserialize perform from hard interrupt");
        assert!(!spl::in_soft_interrupt(), "pserialize perform from soft interrupt");
        assert!(!read::in_read_section(), "pserialize perform inside a read section");

        // After a panic only one CPU is left running
        if self.platform.panicked() {
            self.stats.panic_skips.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let index = checkpoint.index;
        let started = Instant::now();

        // Taking the lock publishes the caller's update to the other CPUs
        // before any of them can observe the request.
        let mut q = self.queues.lock();
        {
            let slot = q.slot_mut(index);
            assert!(slot.owner.is_none(), "checkpoint already has a request in flight");
            slot.owner = Some(thread::current().id());
            self.platform.running_cpus(&mut slot.target);
            slot.pass.zero();
            slot.stage = Some(Stage::Q0);
        }
        q.stages[Stage::Q0.index()].push_back(index);
        self.work_todo.fetch_add(1, Ordering::AcqRel);

        let mut iterations: u32 = 0;
        loop {
            MutexGuard::unlocked(&mut q, || {
                // Force switch activity on every CPU, which may be idle;
                // pause between rounds to avoid flooding them.
                if iterations > 1 {
                    self.platform.pause(1);
                }
                iterations += 1;
                self.platform.xcall_broadcast();
            });

            if q.slot(index).target.is_empty() {
                break;
            }
        }

        q.slot_mut(index).owner = None;
        drop(q);

        let wait_us = started.elapsed().as_micros() as u64;
        self.stats.exclusive_syncs.fetch_add(1, Ordering::Relaxed);
        self.stats.total_wait_us.fetch_add(wait_us, Ordering::Relaxed);
        self.stats.max_wait_us.fetch_max(wait_us, Ordering::Relaxed);

        tracing::debug!(wait_us, iterations, "pserialize grace period complete");
    }

    /// Context-switch hook: `cpu` has just switched
    ///
    /// A single atomic load when nothing is outstanding.
    #[inline]
    pub fn switchpoint(&self, cpu: CpuId) {
        // A missed increment only delays the writer: requests are queued
        // before the cross-call that provokes the next switch.
        if self.work_todo.load(Ordering::Acquire) == 0 {
            return;
        }
        self.switchpoint_slow(cpu);
    }

    #[cold]
    #[inline(never)]
    fn switchpoint_slow(&self, cpu: CpuId) {
        self.stats.slow_scans.fetch_add(1, Ordering::Relaxed);
        let mut q = self.queues.lock();

        // Q1 before Q0, so a request promoted in this scan is not credited
        // twice for one switch.
        q.advance(Stage::Q1, cpu);
        q.advance(Stage::Q0, cpu);

        // Seen twice on every CPU: done. Clearing the target wakes the
        // writer.
        while let Some(index) = q.stages[Stage::Q2.index()].pop_front() {
            let slot = q.slot_mut(index);
            slot.target.zero();
            slot.stage = None;
            self.work_todo.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn stage_of(&self, checkpoint: &Checkpoint) -> Option<Stage> {
        self.queues.lock().slot(checkpoint.index).stage
    }

    /// Requests currently queued
    pub fn outstanding(&self) -> usize {
        self.work_todo.load(Ordering::Acquire)
    }

    /// Snapshot of the engine statistics
    pub fn stats(&self) -> EngineStats {
        let checkpoints = self.queues.lock().live;
        EngineStats {
            exclusive_syncs: self.stats.exclusive_syncs.load(Ordering::Relaxed),
            slow_scans: self.stats.slow_scans.load(Ordering::Relaxed),
            total_wait_us: self.stats.total_wait_us.load(Ordering::Relaxed),
            max_wait_us: self.stats.max_wait_us.load(Ordering::Relaxed),
            panic_skips: self.stats.panic_skips.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
            checkpoints,
        }
    }
}

impl SwitchObserver for Engine {
    fn switchpoint(&self, cpu: CpuId) {
        Engine::switchpoint(self, cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpiMode, MachineConfig};
    use crate::platform::Machine;
    use crate::spl::{IntrGuard, Ipl};
    use crossbeam::channel;
    use std::time::Duration;

    fn manual_machine(ncpu: usize) -> Arc<Machine> {
        Machine::new(MachineConfig {
            ncpu,
            tick_us: 100,
            ipi: IpiMode::Record,
        })
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_engine_creation() {
        let engine = Engine::new(Machine::with_cpus(2));
        let stats = engine.stats();
        assert_eq!(stats, EngineStats::default());
        assert_eq!(engine.platform().ncpu(), 2);
    }

    #[test]
    fn test_switchpoint_fast_path_is_noop() {
        let engine = Engine::new(manual_machine(2));
        let checkpoint = engine.create().unwrap();

        for _ in 0..100 {
            engine.switchpoint(CpuId::new(0));
            engine.switchpoint(CpuId::new(1));
        }

        assert_eq!(engine.stats().slow_scans, 0);
        assert_eq!(checkpoint.stage(), None);
    }

    #[test]
    fn test_create_and_destroy_reuse_slots() {
        let engine = Engine::new(manual_machine(1));
        let a = engine.create().unwrap();
        let b = engine.create().unwrap();
        assert_eq!(engine.stats().checkpoints, 2);

        let b_index = b.index;
        engine.destroy(b);
        assert_eq!(engine.stats().checkpoints, 1);

        let c = engine.create().unwrap();
        assert_eq!(c.index, b_index);
        assert_eq!(engine.stats().checkpoints, 2);

        a.destroy();
        drop(c);
        assert_eq!(engine.stats().checkpoints, 0);
    }

    #[test]
    fn test_stages_advance_in_order() {
        let engine = Engine::new(manual_machine(2));
        let checkpoint = Arc::new(engine.create().unwrap());

        let (done_tx, done_rx) = channel::bounded(1);
        let writer = {
            let checkpoint = checkpoint.clone();
            thread::spawn(move || {
                checkpoint.perform();
                done_tx.send(()).unwrap();
            })
        };

        wait_until("request to be queued", || checkpoint.stage() == Some(Stage::Q0));

        engine.switchpoint(CpuId::new(0));
        assert_eq!(checkpoint.stage(), Some(Stage::Q0));

        engine.switchpoint(CpuId::new(1));
        assert_eq!(checkpoint.stage(), Some(Stage::Q1));

        // The same CPU twice does not complete the second stage
        engine.switchpoint(CpuId::new(1));
        engine.switchpoint(CpuId::new(1));
        assert_eq!(checkpoint.stage(), Some(Stage::Q1));
        assert!(done_rx.try_recv().is_err());

        engine.switchpoint(CpuId::new(0));
        assert_eq!(checkpoint.stage(), None);

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.exclusive_syncs, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_requests_complete_independently() {
        let engine = Engine::new(manual_machine(1));
        let first = Arc::new(engine.create().unwrap());
        let second = Arc::new(engine.create().unwrap());

        let spawn_writer = |checkpoint: Arc<Checkpoint>| thread::spawn(move || checkpoint.perform());

        let w1 = spawn_writer(first.clone());
        wait_until("first request", || first.stage() == Some(Stage::Q0));
        engine.switchpoint(CpuId::new(0));
        assert_eq!(first.stage(), Some(Stage::Q1));

        let w2 = spawn_writer(second.clone());
        wait_until("second request", || second.stage() == Some(Stage::Q0));

        // Completes the first, moves the second one stage on
        engine.switchpoint(CpuId::new(0));
        assert_eq!(first.stage(), None);
        assert_eq!(second.stage(), Some(Stage::Q1));
        w1.join().unwrap();

        engine.switchpoint(CpuId::new(0));
        assert_eq!(second.stage(), None);
        w2.join().unwrap();

        assert_eq!(engine.stats().exclusive_syncs, 2);
    }

    #[test]
    fn test_delivered_xcalls_complete_on_idle_machine() {
        let machine = Machine::with_cpus(4);
        let engine = Engine::new(machine.clone());
        let checkpoint = engine.create().unwrap();

        checkpoint.perform();
        checkpoint.perform();

        let stats = engine.stats();
        assert_eq!(stats.exclusive_syncs, 2);
        assert_eq!(stats.outstanding, 0);
        assert!(machine.xcall_count() >= 4);
    }

    #[test]
    fn test_perform_after_panic_returns_immediately() {
        let machine = manual_machine(2);
        let engine = Engine::new(machine.clone());
        let checkpoint = engine.create().unwrap();

        machine.set_panicked();
        checkpoint.perform();

        let stats = engine.stats();
        assert_eq!(stats.panic_skips, 1);
        assert_eq!(stats.exclusive_syncs, 0);
        assert_eq!(machine.xcall_count(), 0);
    }

    #[test]
    #[should_panic(expected = "soft interrupt")]
    fn test_perform_from_soft_interrupt_panics() {
        let engine = Engine::new(manual_machine(1));
        let checkpoint = engine.create().unwrap();
        let _intr = IntrGuard::soft(Ipl::SoftNet);
        checkpoint.perform();
    }

    #[test]
    #[should_panic(expected = "hard interrupt")]
    fn test_perform_from_hard_interrupt_panics() {
        let engine = Engine::new(manual_machine(1));
        let checkpoint = engine.create().unwrap();
        let _intr = IntrGuard::hard(Ipl::Vm);
        checkpoint.perform();
    }

    #[test]
    #[should_panic(expected = "inside a read section")]
    fn test_perform_inside_read_section_panics() {
        let engine = Engine::new(manual_machine(1));
        let checkpoint = engine.create().unwrap();
        let _read = read::read_section();
        checkpoint.perform();
    }

    #[test]
    #[should_panic(expected = "another engine")]
    fn test_foreign_checkpoint_panics() {
        let a = Engine::new(manual_machine(1));
        let b = Engine::new(manual_machine(1));
        let checkpoint = a.create().unwrap();
        b.perform(&checkpoint);
    }
}
