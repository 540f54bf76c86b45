//! Passive serialization
//!
//! Readers of rarely-updated shared data take no lock and write no shared
//! memory; they only raise their CPU's priority level for the duration of
//! the read (`read_enter`/`read_exit`, or the scoped `read_section`).
//!
//! A writer, holding its own lock over the data, unlinks the old version
//! and then calls `Checkpoint::perform`. The call returns once every CPU
//! that was running when it began has been observed passing through a
//! context switch in two separate stages. No reader can still hold a
//! reference to the unlinked data at that point, so it can be freed.
//!
//! ```text
//! let _read = pserialize::read_section();
//! let node = table.lookup(key);          // no lock
//! ...
//!
//! let _guard = table_lock.lock();
//! let old = table.unlink(key);
//! checkpoint.perform();                  // wait for readers to drain
//! drop(old);
//! ```
//!
//! Progress comes from `Engine::switchpoint`, which the scheduler calls on
//! every CPU after every context switch. Each request moves through three
//! stage queues:
//!
//! - `Stage::Q0`: waiting for every target CPU to switch once
//! - `Stage::Q1`: waiting for every target CPU to switch again
//! - `Stage::Q2`: satisfied; removed at the end of the same scan, which
//!   wakes the writer

mod checkpoint;
mod engine;
mod read;

pub use checkpoint::{Checkpoint, Stage};
pub use engine::{Engine, EngineStats};
pub use read::{read_enter, read_exit, read_section, ReadGuard, ReadToken};
