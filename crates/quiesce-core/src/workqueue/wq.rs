//! Workqueue handle and worker loop

use crate::cpu::CpuId;
use crate::platform::{Kthread, KthreadSpec, Platform};
use crate::spl;
use crate::workqueue::queue::{Enqueued, Queue};
use crate::workqueue::work::{release_chain, Job, Work};
use crate::workqueue::{WorkqueueAttrs, WorkqueueStats, WqFlags};
use crate::Result;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Workqueue callback: the item being run and the argument given at create
pub type WorkFn<T, A> = Box<dyn Fn(&Arc<Work<T>>, &A) + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct Stats {
    enqueued: AtomicU64,
    executed: AtomicU64,
    batches: AtomicU64,
}

/// State shared between the handle and the worker threads
struct Shared<T, A> {
    name: String,
    callback: WorkFn<T, A>,
    arg: A,
    attrs: WorkqueueAttrs,
    platform: Arc<dyn Platform>,
    queues: Box<[Queue<T>]>,
    stats: Stats,
}

/// Workqueue with its queues and worker threads
///
/// Dropping the handle destroys the workqueue: queued work runs to
/// completion first, then the workers exit.
pub struct Workqueue<T, A = ()> {
    shared: Arc<Shared<T, A>>,

    /// Worker of each queue, taken when it is joined
    workers: Vec<Option<Kthread>>,
}

impl<T, A> Workqueue<T, A>
where
    T: Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    /// Create a workqueue and start its worker threads
    ///
    /// With `WqFlags::PERCPU` there is one queue per CPU, served by a
    /// worker bound to that CPU; otherwise a single queue and a floating
    /// worker. If a worker cannot be started, the workers already running
    /// are stopped again and the error is returned.
    pub fn create<F>(
        platform: Arc<dyn Platform>,
        name: &str,
        callback: F,
        arg: A,
        attrs: WorkqueueAttrs,
    ) -> Result<Self>
    where
        F: Fn(&Arc<Work<T>>, &A) + Send + Sync + 'static,
    {
        let percpu = attrs.flags.contains(WqFlags::PERCPU);
        let queues: Box<[Queue<T>]> = if percpu {
            (0..platform.ncpu())
                .map(|cpu| Queue::new(Some(CpuId::from(cpu)), attrs.ipl))
                .collect()
        } else {
            Box::new([Queue::new(None, attrs.ipl)])
        };

        let shared = Arc::new(Shared {
            name: name.to_string(),
            callback: Box::new(callback),
            arg,
            attrs,
            platform,
            queues,
            stats: Stats::default(),
        });

        let mut wq = Self {
            workers: Vec::with_capacity(shared.queues.len()),
            shared,
        };

        for index in 0..wq.shared.queues.len() {
            match wq.start_worker(index) {
                Ok(kthread) => wq.workers.push(Some(kthread)),
                Err(e) => {
                    tracing::warn!(
                        workqueue = %wq.shared.name,
                        started = index,
                        error = %e,
                        "worker creation failed; tearing down workqueue"
                    );
                    // Dropping stops the workers started so far
                    drop(wq);
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            workqueue = %wq.shared.name,
            queues = wq.shared.queues.len(),
            flags = ?wq.shared.attrs.flags,
            "workqueue created"
        );
        Ok(wq)
    }

    fn start_worker(&self, index: usize) -> Result<Kthread> {
        let queue = &self.shared.queues[index];
        let mut spec = KthreadSpec::new(match queue.cpu() {
            Some(cpu) => format!("{}/{}", self.shared.name, cpu.index()),
            None => self.shared.name.clone(),
        })
        .priority(self.shared.attrs.priority);
        if let Some(cpu) = queue.cpu() {
            spec = spec.on_cpu(cpu);
        }

        queue.set_worker_alive(true);
        let shared = Arc::clone(&self.shared);
        let result = self
            .shared
            .platform
            .kthread_create(spec, Box::new(move || worker_loop(&shared, index)));
        if result.is_err() {
            queue.set_worker_alive(false);
        }
        result
    }

    /// Queue `item` for its callback
    ///
    /// On a per-CPU workqueue the item goes to `cpu`'s queue, or to the
    /// current CPU's queue when `cpu` is `None`. Never blocks, never
    /// allocates.
    ///
    /// # Panics
    ///
    /// If the item is already pending, the workqueue is being destroyed, or
    /// the caller runs in an interrupt above the workqueue's level.
    pub fn enqueue(&self, item: &Arc<Work<T>>, cpu: Option<CpuId>) {
        if let Some(level) = spl::interrupt_level() {
            assert!(
                level <= self.shared.attrs.ipl,
                "enqueue on workqueue {} from interrupt level {:?} above {:?}",
                self.shared.name,
                level,
                self.shared.attrs.ipl
            );
        }

        match self.queue_for(cpu).enqueue(item) {
            Enqueued::Queued => {}
            Enqueued::Exiting => {
                panic!("enqueue on workqueue {} being destroyed", self.shared.name)
            }
            Enqueued::AlreadyPending => {
                panic!("work item enqueued twice on workqueue {}", self.shared.name)
            }
        }
        self.shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_for(&self, cpu: Option<CpuId>) -> &Queue<T> {
        if !self.shared.attrs.flags.contains(WqFlags::PERCPU) {
            return &self.shared.queues[0];
        }

        let cpu = cpu
            .or_else(|| self.shared.platform.current_cpu())
            .unwrap_or(CpuId::new(0));
        assert!(
            cpu.index() < self.shared.queues.len(),
            "{} has no queue on workqueue {}",
            cpu,
            self.shared.name
        );
        &self.shared.queues[cpu.index()]
    }

    /// Stop every worker after the work queued so far has run
    ///
    /// # Panics
    ///
    /// If a callback panicked, the panic is re-raised here once every
    /// worker has been joined. Work left on the dead worker's queue is
    /// dropped unrun and can be queued again.
    pub fn destroy(mut self) {
        self.teardown();
    }
}

impl<T, A> Workqueue<T, A> {
    /// Name given at create
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Attributes given at create
    pub fn attrs(&self) -> WorkqueueAttrs {
        self.shared.attrs
    }

    /// Number of queues (one per CPU on a per-CPU workqueue)
    pub fn queue_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Counters summed over every queue
    pub fn stats(&self) -> WorkqueueStats {
        let stats = &self.shared.stats;
        WorkqueueStats {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            executed: stats.executed.load(Ordering::Relaxed),
            batches: stats.batches.load(Ordering::Relaxed),
        }
    }

    fn teardown(&mut self) {
        let platform = Arc::clone(&self.shared.platform);
        let mut panicked = None;

        let queues = self.shared.queues.iter().zip(self.workers.iter_mut());
        for (index, (queue, worker)) in queues.enumerate() {
            let Some(kthread) = worker.take() else {
                continue;
            };

            // Queued even when the worker died in a callback, so later
            // enqueues are refused
            queue.push_exit();
            queue.wait_worker_exit(platform.as_ref());

            let dropped = queue.discard();
            if let Err(payload) = kthread.try_join() {
                tracing::error!(
                    workqueue = %self.shared.name,
                    queue = index,
                    dropped,
                    "worker panicked in its callback"
                );
                panicked.get_or_insert(payload);
            }
        }

        tracing::debug!(workqueue = %self.shared.name, "workqueue destroyed");

        if let Some(payload) = panicked {
            if !thread::panicking() {
                std::panic::resume_unwind(payload);
            }
        }
    }
}

impl<T, A> Drop for Workqueue<T, A> {
    fn drop(&mut self) {
        if self.workers.iter().any(Option::is_some) {
            self.teardown();
        }
    }
}

impl<T, A> fmt::Debug for Workqueue<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workqueue")
            .field("name", &self.shared.name)
            .field("attrs", &self.shared.attrs)
            .field("queues", &self.shared.queues.len())
            .finish()
    }
}

/// Body of a worker thread, running on its queue's CPU
fn worker_loop<T, A>(shared: &Shared<T, A>, index: usize) {
    let queue = &shared.queues[index];
    let platform = shared.platform.as_ref();
    let mpsafe = shared.attrs.flags.contains(WqFlags::MPSAFE);

    tracing::trace!(workqueue = %shared.name, queue = index, "worker started");

    // Wakes destroy even if a callback panics
    let _exit = ExitNotice(queue);

    'work: loop {
        let mut batch = Batch(Some(queue.take_batch(platform)));
        shared.stats.batches.fetch_add(1, Ordering::Relaxed);
        let mut ran = 0usize;

        while let Some(job) = batch.0.take() {
            let work = match job {
                Job::Run(work) => work,
                Job::Exit => {
                    tracing::trace!(workqueue = %shared.name, queue = index, ran, "worker exiting");
                    break 'work;
                }
            };

            // Unlink first: the callback may queue the item again
            batch.0 = work.take_next();
            work.clear_pending();

            if mpsafe {
                (shared.callback)(&work, &shared.arg);
            } else {
                platform.with_kernel_lock(&mut || (shared.callback)(&work, &shared.arg));
            }
            shared.stats.executed.fetch_add(1, Ordering::Relaxed);
            ran += 1;

            platform.preempt_point();
        }

        tracing::trace!(workqueue = %shared.name, queue = index, ran, "batch done");
    }
}

struct ExitNotice<'a, T>(&'a Queue<T>);

impl<T> Drop for ExitNotice<'_, T> {
    fn drop(&mut self) {
        self.0.worker_exited();
    }
}

/// Rest of the batch being run; released unrun if a callback unwinds
struct Batch<T>(Option<Job<T>>);

impl<T> Drop for Batch<T> {
    fn drop(&mut self) {
        release_chain(self.0.take());
    }
}
