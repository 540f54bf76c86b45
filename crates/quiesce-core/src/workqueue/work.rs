//! Work items and the intrusive FIFO that links them

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller-owned work item
///
/// Carries its own link field, so queueing it costs no allocation. An item
/// can sit on at most one queue at a time.
pub struct Work<T> {
    /// Next job in the FIFO; only touched under the owning queue's lock
    link: Mutex<Option<Job<T>>>,

    /// Set from enqueue until just before the callback runs
    pending: AtomicBool,

    data: T,
}

impl<T> Work<T> {
    /// Wrap `data` in an unqueued work item
    pub fn new(data: T) -> Self {
        Self {
            link: Mutex::new(None),
            pending: AtomicBool::new(false),
            data,
        }
    }

    /// Payload of the item
    pub fn data(&self) -> &T {
        &self.data
    }

    /// True while the item is queued and its callback has not started
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Mark the item queued; false if it already was
    pub(crate) fn mark_pending(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Detach and return the next job
    pub(crate) fn take_next(&self) -> Option<Job<T>> {
        self.link.lock().take()
    }
}

impl<T: fmt::Debug> fmt::Debug for Work<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("pending", &self.is_pending())
            .field("data", &self.data)
            .finish()
    }
}

/// Entry of a queue's FIFO
pub(crate) enum Job<T> {
    /// Run the workqueue callback on this item
    Run(Arc<Work<T>>),
    /// Stop the worker; always the last entry
    Exit,
}

/// Singly-linked FIFO threaded through the items' link fields
pub(crate) struct Fifo<T> {
    head: Option<Job<T>>,
    tail: Option<Arc<Work<T>>>,
    exiting: bool,
}

impl<T> Fifo<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: None,
            tail: None,
            exiting: false,
        }
    }

    /// True once the exit job was queued
    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append a job at the tail
    pub(crate) fn push(&mut self, job: Job<T>) {
        assert!(!self.exiting, "job queued behind the exit job");

        let tail = match &job {
            Job::Run(work) => Some(Arc::clone(work)),
            Job::Exit => {
                self.exiting = true;
                None
            }
        };

        match self.tail.take() {
            Some(last) => *last.link.lock() = Some(job),
            None => self.head = Some(job),
        }
        self.tail = tail;
    }

    /// Take every queued job at once, leaving the FIFO empty
    pub(crate) fn take_all(&mut self) -> Option<Job<T>> {
        self.tail = None;
        self.head.take()
    }
}

/// Unlink every job of a chain that will never run and clear the pending
/// flags, so the items can be queued again; returns the number of items
pub(crate) fn release_chain<T>(mut next: Option<Job<T>>) -> usize {
    let mut released = 0;
    while let Some(Job::Run(work)) = next {
        next = work.take_next();
        work.clear_pending();
        released += 1;
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(fifo: &mut Fifo<u32>) -> (Vec<u32>, bool) {
        let mut seen = Vec::new();
        let mut exit = false;
        let mut next = fifo.take_all();
        while let Some(job) = next {
            next = match job {
                Job::Run(work) => {
                    seen.push(*work.data());
                    work.take_next()
                }
                Job::Exit => {
                    exit = true;
                    None
                }
            };
        }
        (seen, exit)
    }

    #[test]
    fn test_fifo_keeps_order() {
        let mut fifo = Fifo::new();
        let items: Vec<_> = (0..5).map(|i| Arc::new(Work::new(i))).collect();
        for item in &items {
            fifo.push(Job::Run(item.clone()));
        }

        assert_eq!(drain(&mut fifo), (vec![0, 1, 2, 3, 4], false));
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_take_all_leaves_empty_fifo_reusable() {
        let mut fifo = Fifo::new();
        let a = Arc::new(Work::new(1));
        let b = Arc::new(Work::new(2));

        fifo.push(Job::Run(a.clone()));
        assert_eq!(drain(&mut fifo).0, vec![1]);

        fifo.push(Job::Run(b.clone()));
        fifo.push(Job::Run(a.clone()));
        assert_eq!(drain(&mut fifo).0, vec![2, 1]);
    }

    #[test]
    fn test_exit_job_is_last() {
        let mut fifo = Fifo::new();
        fifo.push(Job::Run(Arc::new(Work::new(7))));
        fifo.push(Job::Exit);
        assert!(fifo.is_exiting());
        assert_eq!(drain(&mut fifo), (vec![7], true));
    }

    #[test]
    #[should_panic(expected = "behind the exit job")]
    fn test_push_after_exit_panics() {
        let mut fifo = Fifo::new();
        fifo.push(Job::Exit);
        fifo.push(Job::Run(Arc::new(Work::new(1))));
    }

    #[test]
    fn test_release_chain_makes_items_reusable() {
        let mut fifo = Fifo::new();
        let items: Vec<_> = (0..3).map(|i| Arc::new(Work::new(i))).collect();
        for item in &items {
            assert!(item.mark_pending());
            fifo.push(Job::Run(item.clone()));
        }
        fifo.push(Job::Exit);

        assert_eq!(release_chain(fifo.take_all()), 3);
        assert!(items.iter().all(|item| !item.is_pending()));

        // No stale links survive into the next FIFO
        let mut fifo = Fifo::new();
        fifo.push(Job::Run(items[1].clone()));
        assert_eq!(drain(&mut fifo), (vec![1], false));
    }

    #[test]
    fn test_pending_flag() {
        let work = Work::new("x");
        assert!(!work.is_pending());
        assert!(work.mark_pending());
        assert!(!work.mark_pending());
        work.clear_pending();
        assert!(!work.is_pending());
    }
}
