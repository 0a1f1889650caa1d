// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driven against the simulated machine: bootstrap,
//! round-robin switching, quantum-driven preemption, and termination.
//!
//! The simulator's state is process-global (it models a single machine), so
//! every test grabs `MACHINE` for its duration and starts from power-on.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use abi::{Stack, StackDesc};
use stride_kern::arch::{self as sim, ResumedContext};
use stride_kern::dispatch::{self, Scheduler};
use stride_kern::stack::init_stack;
use stride_kern::startup::{enter_thread_mode, ClockConfig};
use stride_kern::time;

static MACHINE: Mutex<()> = Mutex::new(());

fn claim_machine() -> MutexGuard<'static, ()> {
    // A failed assertion in another test poisons the lock; the machine gets
    // power-on reset regardless, so the poison carries no information.
    MACHINE.lock().unwrap_or_else(|e| e.into_inner())
}

extern "C" fn entry_zero(_arg: usize) {
    std::hint::black_box(0);
}

extern "C" fn entry_one(_arg: usize) {
    std::hint::black_box(1);
}

extern "C" fn entry_two(_arg: usize) {
    std::hint::black_box(2);
}

extern "C" fn never_exit() -> ! {
    unreachable!()
}

const ENTRIES: [extern "C" fn(usize); 3] = [entry_zero, entry_one, entry_two];

/// Round-robin stack provider with per-task resume instrumentation. Pure
/// policy: the kind of thing that lives outside the execution core.
struct RoundRobin {
    ready: VecDeque<&'static mut StackDesc>,
    /// Descriptor addresses, indexed by task id, for attributing descriptors
    /// handed back by the dispatcher.
    addrs: Vec<usize>,
    resumes: Arc<Vec<AtomicU32>>,
    terminated: Arc<Mutex<Vec<usize>>>,
    /// Quantum armed for every resumed task; 0 leaves preemption off.
    quantum_ms: u32,
}

impl RoundRobin {
    fn id_of(&self, desc: &StackDesc) -> usize {
        let addr = desc as *const StackDesc as usize;
        self.addrs.iter().position(|&a| a == addr).unwrap()
    }
}

impl Scheduler for RoundRobin {
    fn provide_stack(
        &mut self,
        outgoing: Option<&'static mut StackDesc>,
    ) -> &'static mut StackDesc {
        if let Some(out) = outgoing {
            self.ready.push_back(out);
        }
        let desc = self.ready.pop_front().expect("no runnable tasks");
        self.resumes[self.id_of(desc)].fetch_add(1, Ordering::Relaxed);
        if self.quantum_ms > 0 {
            time::set_quantum(self.quantum_ms);
        }
        desc
    }

    fn task_terminated(&mut self, stack: &'static mut StackDesc) {
        let id = self.id_of(stack);
        self.terminated.lock().unwrap().push(id);
        // Dropping the reference here stands in for recycling the stack.
    }
}

/// A booted system: `tasks` task stacks prepared, task 0 dispatched.
struct Rig {
    resumes: Arc<Vec<AtomicU32>>,
    terminated: Arc<Mutex<Vec<usize>>>,
    /// Reset pointer of task 0's stack, for asserting the bootstrap consumed
    /// exactly one frame.
    top0: usize,
}

fn leak_desc() -> &'static mut StackDesc {
    let desc = Box::leak(Box::new(Stack::<1024>::new())).descriptor();
    Box::leak(Box::new(desc))
}

fn boot(tasks: usize, quantum_ms: u32, first_quantum: u32) -> (Rig, ResumedContext) {
    sim::power_on_reset();

    let mut descs = Vec::new();
    for id in 0..tasks {
        let desc = leak_desc();
        init_stack(desc, ENTRIES[id], never_exit, 0xA0 + id);
        descs.push(desc);
    }

    let resumes = Arc::new((0..tasks).map(|_| AtomicU32::new(0)).collect::<Vec<_>>());
    let terminated = Arc::new(Mutex::new(Vec::new()));
    let addrs = descs
        .iter()
        .map(|d| &**d as *const StackDesc as usize)
        .collect();

    let mut descs = descs.into_iter();
    let first = descs.next().unwrap();
    let top0 = first.top();
    let sched = Box::leak(Box::new(RoundRobin {
        ready: descs.collect(),
        addrs,
        resumes: Arc::clone(&resumes),
        terminated: Arc::clone(&terminated),
        quantum_ms,
    }));

    time::set_quantum(first_quantum);
    let ctx = enter_thread_mode(leak_desc(), sched, first, ClockConfig { reload: 1 });

    (
        Rig {
            resumes,
            terminated,
            top0,
        },
        ctx,
    )
}

/// Plants a recognizable execution point for the running task, simulating
/// the progress it made during its time slice.
fn plant_progress(pc: usize, reg_seed: usize) {
    sim::with_cpu(|cpu| {
        cpu.pc = pc;
        for (i, r) in cpu.regs.iter_mut().enumerate() {
            *r = reg_seed + i;
        }
    });
}

fn observed_regs() -> [usize; 8] {
    sim::with_cpu(|cpu| cpu.regs)
}

#[test]
fn bootstrap_enters_first_task() {
    let _guard = claim_machine();
    let (rig, ctx) = boot(2, 0, 0);

    assert_eq!(ctx.pc, entry_zero as usize);
    assert_eq!(ctx.arg, 0xA0);
    assert_eq!(ctx.link, never_exit as usize);
    // The whole initial frame was consumed: the task starts on an empty
    // stack.
    assert_eq!(ctx.sp, rig.top0);

    sim::with_cpu(|cpu| {
        assert!(!cpu.in_handler);
        assert!(cpu.control.contains(sim::Control::NPRIV));
        assert!(cpu.control.contains(sim::Control::SPSEL));
        assert!(cpu.timer_enabled);
        // Callee-saved registers of a never-run task are zeroed.
        assert_eq!(cpu.regs, [0; 8]);
    });

    // No switch happened yet; nobody was resumed through the scheduler.
    assert!(rig.resumes.iter().all(|c| c.load(Ordering::Relaxed) == 0));
}

#[test]
fn switches_resume_exactly_at_switch_out_points() {
    let _guard = claim_machine();
    let (rig, ctx) = boot(3, 0, 0);
    assert_eq!(ctx.pc, entry_zero as usize);

    // Task id of the running task, then the round-robin rotation 0,1,2,...
    let mut running = 0usize;
    // Where each task was last seen: entry point and zeroed registers for
    // never-run tasks.
    let mut last_pc = [entry_zero as usize, entry_one as usize, entry_two as usize];
    let mut last_regs: [[usize; 8]; 3] = [[0; 8]; 3];

    for round in 0..7usize {
        // The running task makes some progress...
        let pc = 0x1000 * (running + 1) + round;
        let seed = 0x100 * (running + 1) + 8 * round;
        plant_progress(pc, seed);
        last_pc[running] = pc;
        for (i, r) in last_regs[running].iter_mut().enumerate() {
            *r = seed + i;
        }

        // ...and hands off.
        time::request_switch();
        let ctx = sim::service_pending_switch().expect("switch was pended");

        running = (running + 1) % 3;
        assert_eq!(ctx.pc, last_pc[running], "round {round}");
        assert_eq!(observed_regs(), last_regs[running], "round {round}");
    }

    // 7 switches over tasks 1,2,0,1,2,0,1.
    let counts: Vec<u32> = rig
        .resumes
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .collect();
    assert_eq!(counts, vec![2, 3, 2]);
}

#[test]
fn servicing_without_a_pended_switch_is_a_no_op() {
    let _guard = claim_machine();
    let (_rig, _ctx) = boot(2, 0, 0);
    assert_eq!(sim::service_pending_switch(), None);
}

#[test]
fn terminated_task_is_retired_not_resumed() {
    let _guard = claim_machine();
    let (rig, _ctx) = boot(3, 0, 0);

    // Task 0 runs to completion; its exit function's job is to hand the
    // descriptor back and give up the processor.
    dispatch::terminate_current_task();
    let ctx = sim::service_pending_switch().expect("termination pends a switch");
    assert_eq!(ctx.pc, entry_one as usize);

    assert_eq!(*rig.terminated.lock().unwrap(), vec![0]);

    // The remaining two tasks keep rotating; task 0 never reappears.
    for _ in 0..4 {
        time::request_switch();
        let ctx = sim::service_pending_switch().unwrap();
        assert_ne!(ctx.pc, entry_zero as usize);
    }
    assert_eq!(rig.resumes[0].load(Ordering::Relaxed), 0);
    assert_eq!(*rig.terminated.lock().unwrap(), vec![0]);
}

#[test]
fn zero_quantum_runs_forever() {
    let _guard = claim_machine();
    let (rig, _ctx) = boot(2, 0, 0);

    for _ in 0..50 {
        sim::timer_fire();
        assert_eq!(sim::service_pending_switch(), None);
    }
    assert_eq!(time::now_milliseconds(), 25);
    assert!(rig.resumes.iter().all(|c| c.load(Ordering::Relaxed) == 0));
}

#[test]
fn quantum_exhaustion_preempts_on_the_boundary() {
    let _guard = claim_machine();
    // Quantum of 3 ms for every slice, including task 0's first.
    let (rig, _ctx) = boot(2, 3, 3);

    // 3 ms = 6 sub-ticks. Nothing through the fifth...
    for _ in 0..5 {
        sim::timer_fire();
        assert_eq!(sim::service_pending_switch(), None);
    }
    // ...preemption exactly on the sixth.
    sim::timer_fire();
    let ctx = sim::service_pending_switch().expect("quantum expired");
    assert_eq!(ctx.pc, entry_one as usize);
    assert_eq!(rig.resumes[1].load(Ordering::Relaxed), 1);
}

/// The concrete scenario: two tasks, quantum 5 ms, tick source at two
/// sub-ticks per millisecond; after 100 sub-ticks each task has been resumed
/// exactly five times.
#[test]
fn two_tasks_quantum_five_fifty_milliseconds() {
    let _guard = claim_machine();
    let (rig, _ctx) = boot(2, 5, 5);

    for _ in 0..100 {
        sim::timer_fire();
        let _ = sim::service_pending_switch();
    }

    assert_eq!(time::now_milliseconds(), 50);
    assert_eq!(rig.resumes[0].load(Ordering::Relaxed), 5);
    assert_eq!(rig.resumes[1].load(Ordering::Relaxed), 5);
}

#[test]
fn second_thread_mode_entry_is_rejected() {
    let _guard = claim_machine();
    let (_rig, ctx) = boot(2, 0, 0);

    let snapshot = sim::with_cpu(|cpu| (cpu.pc, cpu.psp, cpu.regs, cpu.control, cpu.started));

    // A second bootstrap attempt must die before touching anything.
    let second = catch_unwind(AssertUnwindSafe(|| {
        let first = leak_desc();
        init_stack(first, entry_two, never_exit, 0);
        let sched = Box::leak(Box::new(RoundRobin {
            ready: VecDeque::new(),
            addrs: vec![first as *const StackDesc as usize],
            resumes: Arc::new(vec![AtomicU32::new(0)]),
            terminated: Arc::new(Mutex::new(Vec::new())),
            quantum_ms: 0,
        }));
        enter_thread_mode(leak_desc(), sched, first, ClockConfig { reload: 1 })
    }));
    assert!(second.is_err());

    // The running system is unperturbed...
    sim::with_cpu(|cpu| {
        assert_eq!(
            (cpu.pc, cpu.psp, cpu.regs, cpu.control, cpu.started),
            snapshot
        );
    });
    assert_eq!(ctx.pc, entry_zero as usize);

    // ...and still switches.
    plant_progress(0xD00D, 0x40);
    time::request_switch();
    let ctx = sim::service_pending_switch().expect("machine still live");
    assert_eq!(ctx.pc, entry_one as usize);
    time::request_switch();
    let ctx = sim::service_pending_switch().unwrap();
    assert_eq!(ctx.pc, 0xD00D);
}

#[test]
fn clock_advances_independently_of_switching() {
    let _guard = claim_machine();
    let (_rig, _ctx) = boot(2, 0, 0);

    assert_eq!(time::now_milliseconds(), 0);
    for _ in 0..7 {
        sim::timer_fire();
    }
    // 7 sub-ticks at two per millisecond: three full milliseconds.
    assert_eq!(time::now_milliseconds(), 3);
    assert_eq!(u64::from(time::now()), 3);
}
