//! Interrupt priority levels
//!
//! Models the kernel's `spl*()` interface for hosted threads. Each thread
//! carries its own priority level; a thread occupying a virtual CPU is that
//! CPU's current context, so its level is the CPU's level. Raising the
//! level above `Ipl::None` disables preemption: the machine refuses to
//! switch a thread off its CPU while the level is raised.
//!
//! Interrupt context is modelled the same way. `IntrGuard` marks the current
//! thread as running a hard or soft interrupt handler at some level, which
//! lets the precondition checks of `perform` and `enqueue` be exercised.

use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Interrupt priority level, lowest first
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Ipl {
    /// Nothing blocked
    #[default]
    None,
    /// Soft clock interrupts blocked
    SoftClock,
    /// Soft block-I/O interrupts blocked
    SoftBio,
    /// Soft network interrupts blocked
    SoftNet,
    /// All soft interrupts blocked; level of passive serialization readers
    SoftSerial,
    /// Interrupts that may allocate memory blocked
    Vm,
    /// Scheduler-level interrupts blocked
    Sched,
    /// Everything blocked
    High,
}

/// Kind of interrupt context the current thread is executing in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntrContext {
    /// Hardware interrupt handler at the given level
    Hard(Ipl),
    /// Soft interrupt handler at the given level
    Soft(Ipl),
}

thread_local! {
    static LEVEL: Cell<Ipl> = const { Cell::new(Ipl::None) };
    static CONTEXT: Cell<Option<IntrContext>> = const { Cell::new(None) };
}

/// Previous level returned by `raise`, consumed by `restore`
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the previous level must be restored with spl::restore"]
pub struct SplToken(Ipl);

impl SplToken {
    /// Level that `restore` will return to
    pub fn previous(&self) -> Ipl {
        self.0
    }
}

/// Current level of this thread
#[inline]
pub fn current() -> Ipl {
    LEVEL.with(Cell::get)
}

/// Raise the level to at least `ipl` (never lowers it)
#[inline]
pub fn raise(ipl: Ipl) -> SplToken {
    LEVEL.with(|level| {
        let prev = level.get();
        if ipl > prev {
            level.set(ipl);
        }
        SplToken(prev)
    })
}

/// Return to the level saved in `token`
#[inline]
pub fn restore(token: SplToken) {
    LEVEL.with(|level| level.set(token.0));
}

/// True while running a hardware interrupt handler
pub fn in_hard_interrupt() -> bool {
    matches!(CONTEXT.with(Cell::get), Some(IntrContext::Hard(_)))
}

/// True while running a soft interrupt handler
pub fn in_soft_interrupt() -> bool {
    matches!(CONTEXT.with(Cell::get), Some(IntrContext::Soft(_)))
}

/// Level of the interrupt currently being handled, if any
pub fn interrupt_level() -> Option<Ipl> {
    CONTEXT.with(Cell::get).map(|ctx| match ctx {
        IntrContext::Hard(ipl) | IntrContext::Soft(ipl) => ipl,
    })
}

/// Scoped interrupt context: the current thread behaves as an interrupt
/// handler at `ipl` until the guard drops.
pub struct IntrGuard {
    saved_context: Option<IntrContext>,
    saved_level: Ipl,
}

impl IntrGuard {
    /// Enter a hardware interrupt handler
    pub fn hard(ipl: Ipl) -> Self {
        Self::enter(IntrContext::Hard(ipl), ipl)
    }

    /// Enter a soft interrupt handler
    pub fn soft(ipl: Ipl) -> Self {
        Self::enter(IntrContext::Soft(ipl), ipl)
    }

    fn enter(context: IntrContext, ipl: Ipl) -> Self {
        let saved_context = CONTEXT.with(|c| c.replace(Some(context)));
        let saved_level = raise(ipl).0;
        Self {
            saved_context,
            saved_level,
        }
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        CONTEXT.with(|c| c.set(self.saved_context));
        LEVEL.with(|level| level.set(self.saved_level));
    }
}
