//! Grace-period torture test
//!
//! Readers pinned to the machine's CPUs keep dereferencing a published node
//! inside read sections while writers keep replacing it. A writer retires
//! the old node only after `perform` returns; a reader that ever sees its
//! node retired or recycled mid-section counts as a violation.

use crate::config::{ConfigError, IpiMode};
use crate::cpu::CpuId;
use crate::platform::{Machine, Platform};
use crate::pserialize::{self, Engine};
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FREE: u8 = 0;
const LIVE: u8 = 1;
const RETIRED: u8 = 2;

/// Parameters of a torture run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TortureConfig {
    /// Reader threads (0 = one per CPU)
    pub readers: usize,

    /// Writer threads
    pub writers: usize,

    /// Length of the run in milliseconds
    pub duration_ms: u64,

    /// Size of the node pool
    pub nodes: usize,
}

impl Default for TortureConfig {
    fn default() -> Self {
        Self {
            readers: 0,
            writers: 1,
            duration_ms: 1000,
            nodes: 64,
        }
    }
}

/// Outcome of a torture run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TortureReport {
    /// Completed read sections
    pub reads: u64,
    /// Nodes replaced by writers
    pub updates: u64,
    /// Grace periods completed by the engine during the run
    pub grace_periods: u64,
    /// Reads that saw a reclaimed node
    pub violations: u64,
    /// Longest `perform` seen by a writer (microseconds)
    pub max_grace_us: u64,
}

impl TortureReport {
    /// True if no reader ever saw reclaimed data
    pub fn passed(&self) -> bool {
        self.violations == 0
    }
}

struct Node {
    state: AtomicU8,
    generation: AtomicU64,
}

struct Pool {
    nodes: Box<[Node]>,
    published: AtomicUsize,
    free: Mutex<Vec<usize>>,
}

impl Pool {
    fn new(size: usize) -> Self {
        let nodes: Box<[Node]> = (0..size)
            .map(|_| Node {
                state: AtomicU8::new(FREE),
                generation: AtomicU64::new(0),
            })
            .collect();
        nodes[0].state.store(LIVE, Ordering::Relaxed);

        Self {
            nodes,
            published: AtomicUsize::new(0),
            free: Mutex::new((1..size).rev().collect()),
        }
    }
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    updates: AtomicU64,
    violations: AtomicU64,
    max_grace_us: AtomicU64,
}

/// Run readers and writers against `engine` for the configured duration
///
/// The engine must be driven by `machine`, and the machine must deliver
/// cross-calls: readers only switch when asked to.
pub fn run(machine: &Arc<Machine>, engine: &Arc<Engine>, cfg: &TortureConfig) -> Result<TortureReport> {
    assert!(
        std::ptr::eq(
            Arc::as_ptr(engine.platform()) as *const (),
            Arc::as_ptr(machine) as *const ()
        ),
        "engine is attached to a different machine"
    );
    if machine.config().ipi != IpiMode::Deliver {
        return Err(ConfigError::Invalid("torture needs machine.ipi = \"deliver\"".into()).into());
    }
    if cfg.writers == 0 || cfg.nodes < cfg.writers + 2 {
        return Err(ConfigError::Invalid(format!(
            "torture needs writers > 0 and at least writers + 2 nodes, got {} writers and {} nodes",
            cfg.writers, cfg.nodes
        ))
        .into());
    }

    let ncpu = machine.ncpu();
    let readers = if cfg.readers == 0 { ncpu } else { cfg.readers };
    let checkpoint = Mutex::new(engine.create()?);
    let pool = Pool::new(cfg.nodes);
    let counters = Counters::default();
    let stop = AtomicBool::new(false);
    let syncs_before = engine.stats().exclusive_syncs;

    tracing::debug!(ncpu, readers, writers = cfg.writers, duration_ms = cfg.duration_ms, "torture start");

    thread::scope(|scope| -> Result<()> {
        let mut spawned = Vec::with_capacity(readers + cfg.writers);

        for reader in 0..readers {
            let cpu = CpuId::from(reader % ncpu);
            let (pool, counters, stop) = (&pool, &counters, &stop);
            let spawn = thread::Builder::new()
                .name(format!("torture-reader-{}", reader))
                .spawn_scoped(scope, move || read_loop(machine, cpu, pool, counters, stop));
            spawned.push(spawn.map_err(|source| Error::Kthread {
                name: format!("torture-reader-{}", reader),
                source,
            }));
        }

        for writer in 0..cfg.writers {
            let (pool, counters, stop, checkpoint) = (&pool, &counters, &stop, &checkpoint);
            let spawn = thread::Builder::new()
                .name(format!("torture-writer-{}", writer))
                .spawn_scoped(scope, move || {
                    write_loop(checkpoint, pool, counters, stop);
                    Ok(())
                });
            spawned.push(spawn.map_err(|source| Error::Kthread {
                name: format!("torture-writer-{}", writer),
                source,
            }));
        }

        // Threads already running stop with the others on a spawn failure
        if spawned.iter().all(std::result::Result::is_ok) {
            thread::sleep(Duration::from_millis(cfg.duration_ms));
        }
        stop.store(true, Ordering::Release);

        let mut first_error = None;
        for handle in spawned {
            let outcome = handle.and_then(|h| match h.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            });
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    })?;

    let report = TortureReport {
        reads: counters.reads.load(Ordering::Relaxed),
        updates: counters.updates.load(Ordering::Relaxed),
        grace_periods: engine.stats().exclusive_syncs - syncs_before,
        violations: counters.violations.load(Ordering::Relaxed),
        max_grace_us: counters.max_grace_us.load(Ordering::Relaxed),
    };

    if report.passed() {
        tracing::debug!(?report, "torture done");
    } else {
        tracing::error!(?report, "torture found grace-period violations");
    }
    Ok(report)
}

fn read_loop(
    machine: &Machine,
    cpu: CpuId,
    pool: &Pool,
    counters: &Counters,
    stop: &AtomicBool,
) -> Result<()> {
    let on_cpu = machine.dispatch(Some(cpu))?;
    let mut rng = rand::thread_rng();
    let mut reads = 0u64;
    let mut violations = 0u64;

    while !stop.load(Ordering::Acquire) {
        let dwell = rng.gen_range(0..64u32);
        {
            let _read = pserialize::read_section();
            let node = &pool.nodes[pool.published.load(Ordering::Acquire)];
            let generation = node.generation.load(Ordering::Acquire);
            let mut ok = node.state.load(Ordering::Acquire) == LIVE;

            for _ in 0..dwell {
                std::hint::spin_loop();
            }

            ok &= node.state.load(Ordering::Acquire) == LIVE;
            ok &= node.generation.load(Ordering::Acquire) == generation;
            if !ok {
                violations += 1;
                tracing::error!(%cpu, generation, "reader saw a reclaimed node");
            }
        }
        reads += 1;
        on_cpu.preempt_point();
    }

    counters.reads.fetch_add(reads, Ordering::Relaxed);
    counters.violations.fetch_add(violations, Ordering::Relaxed);
    Ok(())
}

fn write_loop(
    checkpoint: &Mutex<pserialize::Checkpoint>,
    pool: &Pool,
    counters: &Counters,
    stop: &AtomicBool,
) {
    let mut updates = 0u64;

    while !stop.load(Ordering::Acquire) {
        {
            let checkpoint = checkpoint.lock();
            let Some(fresh) = pool.free.lock().pop() else {
                continue;
            };

            let node = &pool.nodes[fresh];
            node.generation.fetch_add(1, Ordering::AcqRel);
            node.state.store(LIVE, Ordering::Release);
            let old = pool.published.swap(fresh, Ordering::AcqRel);

            let started = Instant::now();
            checkpoint.perform();
            let grace_us = started.elapsed().as_micros() as u64;
            counters.max_grace_us.fetch_max(grace_us, Ordering::Relaxed);

            pool.nodes[old].state.store(RETIRED, Ordering::Release);
            pool.free.lock().push(old);
        }
        updates += 1;
        thread::yield_now();
    }

    counters.updates.fetch_add(updates, Ordering::Relaxed);
}
