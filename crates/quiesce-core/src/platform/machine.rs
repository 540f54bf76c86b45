//! Hosted machine: virtual CPUs occupied by OS threads
//!
//! A thread runs "on" a virtual CPU while it holds that CPU's slot, and a
//! slot holds at most one thread. Giving a CPU up (dropping the `OnCpu`
//! guard, blocking, pausing, being preempted) is a context switch: the
//! registered `SwitchObserver`s run for that CPU after its occupant left
//! and before anyone else can take it. Because a thread may not give up its
//! CPU while its IPL is raised, no observer ever runs for a CPU that is
//! inside a read section.
//!
//! Threads cannot be preempted involuntarily. A cross-call therefore
//! switches idle CPUs directly and leaves a reschedule request for busy
//! ones, which their occupant honours at its next `preempt_point()`.

use crate::config::{IpiMode, MachineConfig};
use crate::cpu::{CpuId, CpuSet};
use crate::platform::{Kthread, KthreadBody, KthreadSpec, Platform, SwitchObserver};
use crate::spl::{self, Ipl};
use crate::{Error, Result};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// CPU occupied by the current thread
#[derive(Debug, Copy, Clone)]
struct Binding {
    machine: u64,
    cpu: CpuId,
    pinned: bool,
}

thread_local! {
    static BINDING: Cell<Option<Binding>> = const { Cell::new(None) };
}

/// Occupancy of one virtual CPU
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Slot {
    Idle,
    Running(ThreadId),
    /// Briefly taken by a cross-call
    Xcall,
}

/// Hosted implementation of `Platform`
pub struct Machine {
    /// Distinguishes bindings of different machines in one process
    id: u64,

    /// Self reference handed to kernel threads
    me: Weak<Machine>,

    config: MachineConfig,
    ncpu: usize,

    /// Occupancy of every CPU
    slots: Mutex<Vec<Slot>>,

    /// Signalled whenever a slot becomes idle
    slot_freed: Condvar,

    /// Pending reschedule requests
    resched: Box<[CachePadded<AtomicBool>]>,

    /// Context switches per CPU
    switches: Box<[CachePadded<AtomicU64>]>,

    /// Cross-calls broadcast
    xcalls: AtomicU64,

    observers: RwLock<Vec<Weak<dyn SwitchObserver>>>,

    panicked: AtomicBool,

    /// Big kernel lock for non-MPSAFE code
    kernel_lock: ReentrantMutex<()>,
}

impl Machine {
    /// Build a machine from its configuration
    pub fn new(config: MachineConfig) -> Arc<Self> {
        let ncpu = config.effective_ncpu();
        assert!(ncpu > 0, "machine needs at least one cpu");

        Arc::new_cyclic(|me| Self {
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            config,
            ncpu,
            slots: Mutex::new(vec![Slot::Idle; ncpu]),
            slot_freed: Condvar::new(),
            resched: (0..ncpu).map(|_| CachePadded::new(AtomicBool::new(false))).collect(),
            switches: (0..ncpu).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            xcalls: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
            panicked: AtomicBool::new(false),
            kernel_lock: ReentrantMutex::new(()),
        })
    }

    /// Machine with `ncpu` CPUs and default settings
    pub fn with_cpus(ncpu: usize) -> Arc<Self> {
        Self::new(MachineConfig::with_cpus(ncpu))
    }

    /// Configuration the machine was built with
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Length of one scheduler tick
    pub fn tick(&self) -> Duration {
        self.config.tick()
    }

    /// Occupy `cpu` (or any free CPU) with the calling thread, waiting until
    /// it is free
    pub fn dispatch(&self, cpu: Option<CpuId>) -> Result<OnCpu<'_>> {
        if let Some(cpu) = cpu {
            self.check_cpu(cpu)?;
        }
        Ok(self.occupy(cpu))
    }

    fn check_cpu(&self, cpu: CpuId) -> Result<()> {
        if cpu.index() < self.ncpu {
            Ok(())
        } else {
            Err(Error::NoSuchCpu(cpu))
        }
    }

    fn occupy(&self, cpu: Option<CpuId>) -> OnCpu<'_> {
        assert!(
            self.bound().is_none(),
            "thread already occupies a cpu of this machine"
        );
        self.acquire(cpu);
        OnCpu {
            machine: self,
            _not_send: PhantomData,
        }
    }

    /// Current thread's binding, if it is on one of this machine's CPUs
    fn bound(&self) -> Option<Binding> {
        BINDING
            .with(Cell::get)
            .filter(|binding| binding.machine == self.id)
    }

    fn acquire(&self, want: Option<CpuId>) -> CpuId {
        let me = thread::current().id();
        let mut slots = self.slots.lock();
        let cpu = loop {
            let free = match want {
                Some(cpu) => (slots[cpu.index()] == Slot::Idle).then_some(cpu),
                None => slots
                    .iter()
                    .position(|slot| *slot == Slot::Idle)
                    .map(CpuId::from),
            };
            if let Some(cpu) = free {
                slots[cpu.index()] = Slot::Running(me);
                break cpu;
            }
            self.slot_freed.wait(&mut slots);
        };
        drop(slots);

        BINDING.with(|b| {
            b.set(Some(Binding {
                machine: self.id,
                cpu,
                pinned: want.is_some(),
            }))
        });
        cpu
    }

    fn release(&self, cpu: CpuId) {
        if !thread::panicking() {
            assert_eq!(
                spl::current(),
                Ipl::None,
                "context switch on {} with IPL raised",
                cpu
            );
        }

        BINDING.with(|b| b.set(None));

        // The slot stays taken until the observers are done, so no other
        // thread runs on `cpu` before its switch has been seen.
        self.context_switch(cpu);

        self.slots.lock()[cpu.index()] = Slot::Idle;
        self.slot_freed.notify_all();
    }

    /// Count the switch and run the observers, with no machine lock held
    fn context_switch(&self, cpu: CpuId) {
        self.switches[cpu.index()].fetch_add(1, Ordering::Relaxed);

        let observers = self.observers.read();
        for observer in observers.iter() {
            if let Some(observer) = observer.upgrade() {
                observer.switchpoint(cpu);
            }
        }
    }

    /// Context switches seen on `cpu` so far
    pub fn switch_count(&self, cpu: CpuId) -> u64 {
        self.switches[cpu.index()].load(Ordering::Relaxed)
    }

    /// Cross-calls broadcast so far
    pub fn xcall_count(&self) -> u64 {
        self.xcalls.load(Ordering::Relaxed)
    }

    /// True if no thread occupies `cpu`
    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.slots.lock()[cpu.index()] == Slot::Idle
    }

    /// Mark the system as panicked
    pub fn set_panicked(&self) {
        tracing::error!("machine {} panicked; serialization disabled", self.id);
        self.panicked.store(true, Ordering::Release);
    }

    /// Deliver the no-op cross-call to one CPU
    fn xcall_one(&self, cpu: CpuId) {
        let mut slots = self.slots.lock();
        match slots[cpu.index()] {
            Slot::Idle if self.config.ipi == IpiMode::Deliver => {
                // The idle loop runs the handler and passes back through
                // the scheduler on its way out.
                slots[cpu.index()] = Slot::Xcall;
                drop(slots);

                self.context_switch(cpu);

                self.slots.lock()[cpu.index()] = Slot::Idle;
                self.slot_freed.notify_all();
            }
            Slot::Running(_) => {
                self.resched[cpu.index()].store(true, Ordering::Release);
            }
            Slot::Idle | Slot::Xcall => {}
        }
    }
}

impl Platform for Machine {
    fn ncpu(&self) -> usize {
        self.ncpu
    }

    fn running_cpus(&self, set: &mut CpuSet) {
        assert_eq!(set.capacity(), self.ncpu, "cpu set size mismatch");
        set.fill();
    }

    fn current_cpu(&self) -> Option<CpuId> {
        self.bound().map(|binding| binding.cpu)
    }

    fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    fn xcall_broadcast(&self) {
        self.xcalls.fetch_add(1, Ordering::Relaxed);
        for cpu in 0..self.ncpu {
            self.xcall_one(CpuId::from(cpu));
        }
    }

    fn pause(&self, ticks: u32) {
        let nap = self.tick() * ticks;
        self.block(&mut || thread::sleep(nap));
    }

    fn block(&self, wait: &mut dyn FnMut()) {
        let Some(binding) = self.bound() else {
            wait();
            return;
        };

        assert_eq!(
            spl::current(),
            Ipl::None,
            "blocking on {} with IPL raised",
            binding.cpu
        );

        self.release(binding.cpu);
        wait();
        self.acquire(binding.pinned.then_some(binding.cpu));
    }

    fn preempt_point(&self) {
        let Some(binding) = self.bound() else {
            return;
        };

        // Preemption stays disabled until the IPL drops back to None
        if spl::current() != Ipl::None {
            return;
        }
        if self.resched[binding.cpu.index()].swap(false, Ordering::AcqRel) {
            self.block(&mut || thread::yield_now());
        }
    }

    fn with_kernel_lock(&self, f: &mut dyn FnMut()) {
        let _biglock = self.kernel_lock.lock();
        f();
    }

    fn attach_switch_observer(&self, observer: Weak<dyn SwitchObserver>) {
        let mut observers = self.observers.write();
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    fn kthread_create(&self, spec: KthreadSpec, body: KthreadBody) -> Result<Kthread> {
        if let Some(cpu) = spec.cpu {
            self.check_cpu(cpu)?;
        }
        let machine = self
            .me
            .upgrade()
            .expect("machine is only reachable through its Arc");

        let cpu = spec.cpu;
        tracing::trace!(name = %spec.name, ?cpu, priority = spec.priority.0, "kthread_create");

        let handle = thread::Builder::new()
            .name(spec.name.clone())
            .spawn(move || {
                let _on_cpu = machine.occupy(cpu);
                body();
            })
            .map_err(|source| Error::Kthread {
                name: spec.name.clone(),
                source,
            })?;

        Ok(Kthread::new(spec.name, cpu, handle))
    }
}

/// The calling thread occupies a CPU until this guard drops
pub struct OnCpu<'a> {
    machine: &'a Machine,
    /// The binding lives in a thread-local
    _not_send: PhantomData<*const ()>,
}

impl OnCpu<'_> {
    /// CPU currently occupied (floating threads may move across blocks)
    pub fn cpu(&self) -> CpuId {
        self.machine
            .current_cpu()
            .expect("OnCpu guard outlived its binding")
    }

    /// Give the CPU up if a reschedule was requested
    pub fn preempt_point(&self) {
        self.machine.preempt_point();
    }

    /// Voluntary context switch
    pub fn yield_now(&self) {
        self.machine.block(&mut || thread::yield_now());
    }
}

impl Drop for OnCpu<'_> {
    fn drop(&mut self) {
        // A panic inside `block` leaves the thread already off CPU
        if let Some(binding) = self.machine.bound() {
            self.machine.release(binding.cpu);
        }
    }
}
