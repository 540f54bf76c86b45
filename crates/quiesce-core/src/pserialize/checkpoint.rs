//! Checkpoint handles

use crate::pserialize::engine::Engine;
use std::fmt;
use std::sync::Arc;

/// Stage queue a queued request sits in
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Waiting for the first context switch on every target CPU
    Q0,
    /// Waiting for the second context switch on every target CPU
    Q1,
    /// Satisfied, about to be removed
    Q2,
}

impl Stage {
    pub(crate) fn index(self) -> usize {
        match self {
            Stage::Q0 => 0,
            Stage::Q1 => 1,
            Stage::Q2 => 2,
        }
    }

    pub(crate) fn next(self) -> Option<Stage> {
        match self {
            Stage::Q0 => Some(Stage::Q1),
            Stage::Q1 => Some(Stage::Q2),
            Stage::Q2 => None,
        }
    }
}

/// Long-lived passive serialization handle (`pserialize_t`)
///
/// Created once per protected structure and reused for every update. Only
/// one `perform` may be in flight per handle; callers guarantee this by
/// holding their own writer lock around it.
pub struct Checkpoint {
    pub(crate) engine: Arc<Engine>,
    pub(crate) index: usize,
}

impl Checkpoint {
    /// Wait until no reader can still see data unlinked before this call
    pub fn perform(&self) {
        self.engine.perform(self);
    }

    /// Stage the in-flight request is in, or `None` when idle
    pub fn stage(&self) -> Option<Stage> {
        self.engine.stage_of(self)
    }

    /// Engine this handle belongs to
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Release the handle (same as dropping it)
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Checkpoint {
    fn drop(&mut self) {
        self.engine.release_slot(self.index);
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("index", &self.index)
            .finish()
    }
}
