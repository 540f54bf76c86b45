//! `quiesce workqueue`: run numbered items through a workqueue.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use quiesce_core::{CpuId, Machine, MachineConfig, Platform, Work, Workqueue, WorkqueueAttrs, WqFlags};
use std::sync::Arc;

/// Items in the order they ran, with the CPU that ran them
type RunLog = Mutex<Vec<(usize, Option<CpuId>)>>;

/// Enqueue `items` work items, destroy the queue and return the run log
fn run_items(machine: &Arc<Machine>, items: usize, percpu: bool) -> anyhow::Result<Vec<(usize, Option<CpuId>)>> {
    let mut flags = WqFlags::MPSAFE;
    if percpu {
        flags |= WqFlags::PERCPU;
    }

    let log: Arc<RunLog> = Arc::new(Mutex::new(Vec::with_capacity(items)));
    let wq = Workqueue::create(
        machine.clone(),
        "demo",
        |work: &Arc<Work<usize>>, (machine, log): &(Arc<Machine>, Arc<RunLog>)| {
            log.lock().push((*work.data(), machine.current_cpu()));
        },
        (machine.clone(), log.clone()),
        WorkqueueAttrs::with_flags(flags),
    )
    .context("Failed to create workqueue")?;

    let ncpu = machine.ncpu();
    let work: Vec<_> = (0..items).map(|i| Arc::new(Work::new(i))).collect();
    for (i, item) in work.iter().enumerate() {
        let cpu = percpu.then(|| CpuId::from(i % ncpu));
        wq.enqueue(item, cpu);
    }
    wq.destroy();

    let log = std::mem::take(&mut *log.lock());
    Ok(log)
}

/// True if the items of every CPU ran in ascending order
fn ordered_per_cpu(log: &[(usize, Option<CpuId>)]) -> bool {
    let mut last: std::collections::HashMap<Option<CpuId>, usize> = Default::default();
    log.iter().all(|&(i, cpu)| match last.insert(cpu, i) {
        Some(prev) => prev < i,
        None => true,
    })
}

pub fn execute(cpus: usize, items: usize, percpu: bool) -> anyhow::Result<()> {
    let machine = Machine::new(MachineConfig::with_cpus(cpus));
    let log = run_items(&machine, items, percpu)?;

    let mut per_cpu = vec![0usize; machine.ncpu()];
    for cpu in log.iter().filter_map(|(_, cpu)| *cpu) {
        per_cpu[cpu.index()] += 1;
    }

    println!("executed: {}/{}", log.len(), items);
    for (cpu, count) in per_cpu.iter().enumerate() {
        println!("  cpu{}: {}", cpu, count);
    }

    let ordered = ordered_per_cpu(&log);
    println!("ordering: {}", if ordered { "ok" } else { "VIOLATED" });

    if log.len() != items {
        bail!("{} of {} items never ran", items - log.len(), items);
    }
    if !ordered {
        bail!("work ran out of order");
    }
    Ok(())
}
