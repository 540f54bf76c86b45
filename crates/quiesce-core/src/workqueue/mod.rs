//! Workqueues
//!
//! Deferred work executed in FIFO order by a dedicated kernel thread per
//! queue. A workqueue owns one queue, or one queue per CPU when created with
//! `WqFlags::PERCPU`. Work items are allocated by the caller and linked into
//! the queue in place: `enqueue` never allocates and never fails.
//!
//! ```text
//! let wq = Workqueue::create(platform, "ifwatch", |work, sc| { ... }, sc,
//!                            WorkqueueAttrs::default())?;
//! wq.enqueue(&work, None);
//! ...
//! wq.destroy();
//! ```
//!
//! Each callback receives the work item and the argument given at create
//! time. The item's pending flag is cleared before its callback runs, so a
//! callback may enqueue the same item again.

mod queue;
mod work;
mod wq;

pub use work::Work;
pub use wq::{WorkFn, Workqueue};

use crate::platform::Priority;
use crate::spl::Ipl;
use bitflags::bitflags;

bitflags! {
    /// Workqueue creation flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct WqFlags: u32 {
        /// Callbacks run without the big kernel lock
        const MPSAFE = 0x01;
        /// One queue and worker per CPU
        const PERCPU = 0x02;
    }
}

/// Creation attributes of a workqueue
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct WorkqueueAttrs {
    /// Priority of the worker threads
    pub priority: Priority,

    /// Highest interrupt level `enqueue` may be called from; the queue lock
    /// is taken at this level
    pub ipl: Ipl,

    /// Behaviour flags
    pub flags: WqFlags,
}

impl WorkqueueAttrs {
    /// Attributes with the given flags and default priority and level
    pub fn with_flags(flags: WqFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }
}

/// Counters of a workqueue, summed over its queues
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WorkqueueStats {
    /// Items enqueued
    pub enqueued: u64,
    /// Callbacks run
    pub executed: u64,
    /// FIFOs taken by workers
    pub batches: u64,
}
