//! Kernel services consumed by passive serialization and workqueues
//!
//! The two subsystems never talk to the OS directly. They go through
//! `Platform`: the running CPU set, cross-calls, kernel threads, the panic
//! flag and the context-switch hook. `Machine` is the hosted implementation;
//! embedders with their own scheduler implement the trait themselves.

mod machine;

pub use machine::{Machine, OnCpu};

use crate::cpu::{CpuId, CpuSet};
use crate::Result;
use std::sync::Weak;
use std::thread::{self, JoinHandle};

/// Hook run by the scheduler after every context switch
pub trait SwitchObserver: Send + Sync {
    /// `cpu` has just passed through a context switch
    fn switchpoint(&self, cpu: CpuId);
}

/// Scheduling priority of a kernel thread
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// No particular priority
    pub const NONE: Priority = Priority(-1);
    /// Ordinary kernel thread
    pub const KTHREAD: Priority = Priority(0);
    /// Kernel-internal high priority
    pub const KERNEL: Priority = Priority(64);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NONE
    }
}

/// Parameters of a kernel thread
#[derive(Debug, Clone)]
pub struct KthreadSpec {
    /// Thread name
    pub name: String,
    /// Scheduling priority
    pub priority: Priority,
    /// CPU the thread is bound to, or `None` to float
    pub cpu: Option<CpuId>,
}

impl KthreadSpec {
    /// Floating thread with default priority
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::default(),
            cpu: None,
        }
    }

    /// Bind the thread to `cpu`
    pub fn on_cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Body of a kernel thread; returning from it is `kthread_exit`
pub type KthreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a running kernel thread
#[derive(Debug)]
pub struct Kthread {
    name: String,
    cpu: Option<CpuId>,
    handle: JoinHandle<()>,
}

impl Kthread {
    /// Wrap a spawned OS thread
    pub fn new(name: String, cpu: Option<CpuId>, handle: JoinHandle<()>) -> Self {
        Self { name, cpu, handle }
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CPU the thread is bound to
    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    /// True once the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit, re-raising a panic from its body
    pub fn join(self) {
        if let Err(payload) = self.try_join() {
            std::panic::resume_unwind(payload);
        }
    }

    /// Wait for the thread to exit, handing back the payload if its body
    /// panicked
    pub fn try_join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// Services the kernel core provides to this subsystem
pub trait Platform: Send + Sync {
    /// Number of CPUs; fixed for the platform's lifetime
    fn ncpu(&self) -> usize;

    /// Copy the set of running CPUs into `set` without allocating
    fn running_cpus(&self, set: &mut CpuSet);

    /// CPU the calling thread occupies
    fn current_cpu(&self) -> Option<CpuId>;

    /// True once the system has panicked and runs single-threaded
    fn panicked(&self) -> bool;

    /// Run a no-op cross-call on every CPU and wait until it was delivered
    fn xcall_broadcast(&self);

    /// Sleep for `ticks` scheduler ticks, giving up the CPU meanwhile
    fn pause(&self, ticks: u32);

    /// Run `wait` (which may block) with the calling thread off its CPU
    ///
    /// `wait` is called exactly once.
    fn block(&self, wait: &mut dyn FnMut());

    /// Honour a pending reschedule request for the calling thread's CPU
    fn preempt_point(&self);

    /// Run `f` holding the big kernel lock
    fn with_kernel_lock(&self, f: &mut dyn FnMut());

    /// Register a hook to run after every context switch
    fn attach_switch_observer(&self, observer: Weak<dyn SwitchObserver>);

    /// Start a kernel thread
    fn kthread_create(&self, spec: KthreadSpec, body: KthreadBody) -> Result<Kthread>;
}

/// Run a blocking closure off CPU and hand back its result
pub fn off_cpu<P, R, F>(platform: &P, f: F) -> R
where
    P: Platform + ?Sized,
    F: FnOnce() -> R,
{
    let mut f = Some(f);
    let mut out = None;
    platform.block(&mut || {
        if let Some(f) = f.take() {
            out = Some(f());
        }
    });
    out.expect("Platform::block did not run its closure")
}
