//! Passive serialization integration tests
//!
//! Drives the engine through the hosted machine and by hand:
//! - Completion after two observed switches per CPU
//! - Randomized switch orderings
//! - Readers holding off a writer
//! - Context switches observed before the CPU changes hands
//! - Torture runs
//!
//! # Running Tests
//! ```bash
//! cargo test --test pserialize_integration
//! ```

use crossbeam::channel;
use quiesce_core::pserialize::{self, Checkpoint, Engine, Stage};
use quiesce_core::torture::{self, TortureConfig};
use parking_lot::{Condvar, Mutex};
use quiesce_core::{CpuId, IpiMode, Machine, MachineConfig, Platform, SwitchObserver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn manual_machine(ncpu: usize) -> Arc<Machine> {
    Machine::new(MachineConfig {
        ncpu,
        tick_us: 50,
        ipi: IpiMode::Record,
    })
}

fn wait_for_stage(checkpoint: &Checkpoint, stage: Stage) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while checkpoint.stage() != Some(stage) {
        assert!(Instant::now() < deadline, "request never reached {:?}", stage);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Start `perform` on another thread; the receiver fires when it returns
fn spawn_perform(checkpoint: &Arc<Checkpoint>) -> (thread::JoinHandle<()>, channel::Receiver<()>) {
    let (tx, rx) = channel::bounded(1);
    let checkpoint = checkpoint.clone();
    let handle = thread::spawn(move || {
        checkpoint.perform();
        tx.send(()).unwrap();
    });
    (handle, rx)
}

/// Holds every context switch until opened
struct SwitchGate {
    open: Mutex<bool>,
    cv: Condvar,
    held: channel::Sender<CpuId>,
}

impl SwitchGate {
    fn new(held: channel::Sender<CpuId>) -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
            held,
        })
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

impl SwitchObserver for SwitchGate {
    fn switchpoint(&self, cpu: CpuId) {
        let mut open = self.open.lock();
        if !*open {
            self.held.send(cpu).unwrap();
            while !*open {
                self.cv.wait(&mut open);
            }
        }
    }
}

// ===== Completion Tests =====

#[test]
fn test_single_cpu_two_switchpoints() {
    let machine = manual_machine(1);
    let engine = Engine::new(machine.clone());
    let checkpoint = Arc::new(engine.create().unwrap());

    let (writer, done) = spawn_perform(&checkpoint);
    wait_for_stage(&checkpoint, Stage::Q0);

    engine.switchpoint(CpuId::new(0));
    assert!(done.recv_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(checkpoint.stage(), Some(Stage::Q1));

    engine.switchpoint(CpuId::new(0));
    done.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();

    assert_eq!(checkpoint.stage(), None);
    assert_eq!(engine.stats().exclusive_syncs, 1);
}

#[test]
fn test_context_switches_drive_completion() {
    let machine = manual_machine(1);
    let engine = Engine::new(machine.clone());
    let checkpoint = Arc::new(engine.create().unwrap());

    let (writer, done) = spawn_perform(&checkpoint);
    wait_for_stage(&checkpoint, Stage::Q0);

    // Each release of the CPU is one observed switch
    drop(machine.dispatch(None).unwrap());
    assert_eq!(checkpoint.stage(), Some(Stage::Q1));
    drop(machine.dispatch(Some(CpuId::new(0))).unwrap());

    done.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();
    assert_eq!(machine.switch_count(CpuId::new(0)), 2);
}

#[test]
fn test_idle_machine_completes_by_itself() {
    let machine = Machine::with_cpus(8);
    let engine = Engine::new(machine.clone());
    let checkpoint = engine.create().unwrap();

    for _ in 0..10 {
        checkpoint.perform();
    }

    let stats = engine.stats();
    assert_eq!(stats.exclusive_syncs, 10);
    assert_eq!(stats.outstanding, 0);
    assert!(stats.max_wait_us <= stats.total_wait_us);
}

// ===== Randomized Switch Orderings =====

#[test]
fn test_random_orderings_observe_every_cpu_twice() {
    const NCPU: usize = 4;

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let machine = manual_machine(NCPU);
        let engine = Engine::new(machine.clone());
        let checkpoint = Arc::new(engine.create().unwrap());

        let (writer, done) = spawn_perform(&checkpoint);
        wait_for_stage(&checkpoint, Stage::Q0);

        let mut seen = [0u32; NCPU];
        let mut last = Stage::Q0;
        loop {
            let cpu = rng.gen_range(0..NCPU);
            engine.switchpoint(CpuId::from(cpu));
            seen[cpu] += 1;

            match checkpoint.stage() {
                Some(stage) => {
                    assert!(stage >= last, "seed {}: stage went back to {:?}", seed, stage);
                    last = stage;
                }
                None => break,
            }
            assert!(seen.iter().sum::<u32>() < 10_000, "seed {}: no progress", seed);
        }

        assert!(
            seen.iter().all(|&n| n >= 2),
            "seed {}: completed after {:?}",
            seed,
            seen
        );
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }
}

#[test]
fn test_stages_never_skip() {
    let machine = manual_machine(2);
    let engine = Engine::new(machine.clone());
    let checkpoint = Arc::new(engine.create().unwrap());

    let (writer, done) = spawn_perform(&checkpoint);
    wait_for_stage(&checkpoint, Stage::Q0);

    let mut observed = vec![Stage::Q0];
    for cpu in [0, 0, 1, 1, 1, 0] {
        engine.switchpoint(CpuId::new(cpu));
        if let Some(stage) = checkpoint.stage() {
            if observed.last() != Some(&stage) {
                observed.push(stage);
            }
        }
    }

    assert_eq!(observed, vec![Stage::Q0, Stage::Q1]);
    assert_eq!(checkpoint.stage(), None);
    done.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();
}

// ===== Readers =====

#[test]
fn test_reader_holds_off_writer() {
    let machine = Machine::with_cpus(2);
    let engine = Engine::new(machine.clone());
    let checkpoint = Arc::new(engine.create().unwrap());

    let (entered_tx, entered_rx) = channel::bounded(1);
    let (leave_tx, leave_rx) = channel::bounded::<()>(1);
    let reader = {
        let machine = machine.clone();
        thread::spawn(move || {
            let on_cpu = machine.dispatch(Some(CpuId::new(1))).unwrap();
            {
                let _read = pserialize::read_section();
                entered_tx.send(()).unwrap();
                leave_rx.recv().unwrap();
                // Reschedule requests are deferred while reading
                on_cpu.preempt_point();
            }
            let deadline = Instant::now() + Duration::from_secs(5);
            while machine.switch_count(CpuId::new(1)) < 2 && Instant::now() < deadline {
                on_cpu.preempt_point();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    entered_rx.recv().unwrap();

    let (writer, done) = spawn_perform(&checkpoint);
    assert!(done.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(machine.switch_count(CpuId::new(1)), 0);

    leave_tx.send(()).unwrap();
    done.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();
    reader.join().unwrap();
    assert!(machine.switch_count(CpuId::new(1)) >= 2);
}

#[test]
fn test_reader_after_delayed_switch_holds_off_writer() {
    let machine = manual_machine(1);
    let cpu0 = CpuId::new(0);

    // Attached ahead of the engine, so the engine only sees a switch once
    // the gate lets it through
    let (held_tx, held_rx) = channel::unbounded();
    let gate = SwitchGate::new(held_tx);
    let weak = Arc::downgrade(&gate);
    machine.attach_switch_observer(weak);
    let engine = Engine::new(machine.clone());
    let checkpoint = Arc::new(engine.create().unwrap());

    // The previous occupant is stuck in its context switch
    let leaver = {
        let machine = machine.clone();
        thread::spawn(move || drop(machine.dispatch(Some(cpu0)).unwrap()))
    };
    assert_eq!(held_rx.recv_timeout(Duration::from_secs(5)).unwrap(), cpu0);
    assert!(!machine.is_idle(cpu0));

    let (writer, done) = spawn_perform(&checkpoint);
    wait_for_stage(&checkpoint, Stage::Q0);

    let (on_cpu_tx, on_cpu_rx) = channel::bounded(1);
    let (reading_tx, reading_rx) = channel::bounded(1);
    let (leave_tx, leave_rx) = channel::bounded::<()>(1);
    let reader = {
        let machine = machine.clone();
        thread::spawn(move || {
            let _on_cpu = machine.dispatch(Some(cpu0)).unwrap();
            on_cpu_tx.send(()).unwrap();
            let _read = pserialize::read_section();
            reading_tx.send(()).unwrap();
            leave_rx.recv().unwrap();
        })
    };

    // The CPU is not handed over before its switch has been observed
    assert!(on_cpu_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(checkpoint.stage(), Some(Stage::Q0));

    gate.open();
    leaver.join().unwrap();
    on_cpu_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    reading_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(checkpoint.stage(), Some(Stage::Q1));
    assert_eq!(machine.switch_count(cpu0), 1);

    // The second switch can only come from the reader leaving
    assert!(done.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(checkpoint.stage(), Some(Stage::Q1));

    leave_tx.send(()).unwrap();
    reader.join().unwrap();
    done.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();
    assert_eq!(machine.switch_count(cpu0), 2);
}

#[test]
fn test_perform_after_panic_skips_waiting() {
    let machine = manual_machine(4);
    let engine = Engine::new(machine.clone());
    let checkpoint = engine.create().unwrap();

    machine.set_panicked();
    checkpoint.perform();
    assert_eq!(engine.stats().panic_skips, 1);
    assert_eq!(machine.xcall_count(), 0);
}

// ===== Torture =====

#[test]
fn test_torture_reports_no_violations() {
    let machine = Machine::new(MachineConfig {
        ncpu: 4,
        tick_us: 100,
        ipi: IpiMode::Deliver,
    });
    let engine = Engine::new(machine.clone());
    let cfg = TortureConfig {
        readers: 6,
        writers: 2,
        duration_ms: 200,
        nodes: 16,
    };

    let report = torture::run(&machine, &engine, &cfg).unwrap();
    assert_eq!(report.violations, 0, "{:?}", report);
    assert!(report.updates > 0);
    assert!(report.reads > report.updates);
    assert_eq!(machine.ncpu(), 4);
}
