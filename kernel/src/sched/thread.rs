// =============================================================================
// AsterOS - Thread Objects and Lifecycle
// =============================================================================
//
// Threads live in their CPU's scheduler arena and are referred to by
// slot index everywhere (queues, `current`, the public API). The record
// itself carries both execution contexts - the cooperative one and the
// full preemption frame - plus status, priority and ownership.
//
//   Setup ──start──► Running ──yield/preempt──► Running (queued)
//            │          ├─suspend─► Suspended ──resume──► Running
//            │          ├─sleep(t)─► Sleeping ──elapsed──► Running
//            │          └─kill────► Zombie ──reaped/joined──► (slot freed)
//
// Detaching forfeits ownership: the scheduler reaps the zombie. Owned
// threads are reaped by their joiner.
//
// The free functions at the bottom are the thread API the rest of the
// kernel uses; each one briefly disables interrupts and operates on the
// calling CPU's scheduler. A scheduler is strictly CPU-local, so these
// act only on threads of the calling CPU.
// =============================================================================

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::interrupts::Registers;
use crate::arch::x86_64::smp::PerCpu;
use crate::sched::scheduler::yield_now;
use crate::sched::switch::Context;
use crate::time;

/// Slot index of a thread within its CPU's arena.
pub type ThreadId = u32;

/// Default stack size for new threads; adjustable while in `Setup`.
pub const DEFAULT_STACK_SIZE: usize = 32 * 1024;

/// Entry point signature. The trampoline calls it and kills the thread
/// when it returns.
pub type ThreadEntry = fn();

/// Scheduling priority; larger values always run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Runs only when nothing else can.
    Idle = 0,
    /// The default.
    Normal = 1,
    /// Starves everything below it.
    Realtime = 2,
}

impl Priority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Priority::Idle,
            1 => Priority::Normal,
            _ => Priority::Realtime,
        }
    }
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Being configured; not schedulable yet.
    Setup = 0,
    /// Runnable or running.
    Running = 1,
    /// Parked until an explicit resume.
    Suspended = 2,
    /// Parked until its wake deadline.
    Sleeping = 3,
    /// Dead; awaiting reclamation.
    Zombie = 4,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Setup,
            1 => Status::Running,
            2 => Status::Suspended,
            3 => Status::Sleeping,
            _ => Status::Zombie,
        }
    }
}

/// One thread record.
pub struct Thread {
    /// Arena slot of this thread.
    pub id: ThreadId,
    /// Index of the owning CPU (the back-reference to the scheduler).
    pub cpu: u32,

    status: AtomicU8,
    priority: AtomicU8,
    /// Cleared by `detach`; an unowned zombie belongs to the reaper.
    owned: AtomicBool,

    pub entry_point: Option<ThreadEntry>,
    pub stack: Option<Box<[u8]>>,
    pub stack_size: usize,

    /// Absolute wake deadline while `Sleeping`.
    pub sleep_until_ns: u64,
    /// Absolute end of the current time slice while running.
    pub time_slice_end_ns: u64,
    /// Saved user GS base (kernel threads leave it zero).
    #[allow(dead_code)]
    pub user_gs_base: u64,

    /// When set, the thread was preempted and `extra_regs` must be
    /// replayed; otherwise the cooperative `ctx` is enough.
    pub need_restore_extra: bool,
    /// Full register frame captured at preemption.
    pub extra_regs: Registers,
    /// Cooperative context captured at yield (or mirrored at preemption).
    pub ctx: Context,
}

impl Thread {
    pub fn new(id: ThreadId, cpu: u32) -> Self {
        Self {
            id,
            cpu,
            status: AtomicU8::new(Status::Setup as u8),
            priority: AtomicU8::new(Priority::Normal as u8),
            owned: AtomicBool::new(true),
            entry_point: None,
            stack: None,
            stack_size: DEFAULT_STACK_SIZE,
            sleep_until_ns: 0,
            time_slice_end_ns: 0,
            user_gs_base: 0,
            need_restore_extra: false,
            extra_regs: Registers::zeroed(),
            ctx: Context::empty(),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn priority(&self) -> Priority {
        Priority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn owned(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub fn set_owned(&self, owned: bool) {
        self.owned.store(owned, Ordering::Release);
    }

    /// Reset a slot for reuse after reclamation.
    pub fn recycle(&mut self) {
        self.status.store(Status::Setup as u8, Ordering::Release);
        self.priority.store(Priority::Normal as u8, Ordering::Relaxed);
        self.owned.store(true, Ordering::Release);
        self.entry_point = None;
        self.stack = None;
        self.stack_size = DEFAULT_STACK_SIZE;
        self.sleep_until_ns = 0;
        self.time_slice_end_ns = 0;
        self.user_gs_base = 0;
        self.need_restore_extra = false;
    }
}

// --- The thread API (current CPU) ---

/// Create a thread on the calling CPU. It starts in `Setup`; configure
/// it, then `start` it.
pub fn create() -> Option<ThreadId> {
    cpu::without_interrupts(|| PerCpu::current().scheduler.create_thread())
}

/// Set the entry point. Legal only in `Setup`.
pub fn set_entry_point(id: ThreadId, entry: ThreadEntry) {
    cpu::without_interrupts(|| {
        PerCpu::current().scheduler.configure(id, |t| t.entry_point = Some(entry));
    });
}

/// Set the stack size. Legal only in `Setup`.
pub fn set_stack_size(id: ThreadId, size: usize) {
    cpu::without_interrupts(|| {
        PerCpu::current().scheduler.configure(id, |t| t.stack_size = size.max(4096));
    });
}

/// Set the priority. Legal only in `Setup`.
pub fn set_priority(id: ThreadId, priority: Priority) {
    cpu::without_interrupts(|| {
        PerCpu::current().scheduler.configure(id, |t| t.set_priority(priority));
    });
}

/// Allocate the stack, build the initial context, and enqueue the
/// thread. Returns `false` if the thread was not in `Setup` or the stack
/// could not be allocated.
pub fn start(id: ThreadId) -> bool {
    cpu::without_interrupts(|| PerCpu::current().scheduler.start(id))
}

/// Mark a thread dead. Killing the calling thread never returns.
pub fn kill(id: ThreadId) {
    let was_current = cpu::without_interrupts(|| PerCpu::current().scheduler.mark_zombie(id));
    if was_current {
        yield_now();
        unreachable!("a zombie was scheduled again");
    }
}

/// Suspend a thread. Suspending the calling thread yields immediately.
pub fn suspend(id: ThreadId) {
    let was_current = cpu::without_interrupts(|| PerCpu::current().scheduler.mark_suspended(id));
    if was_current {
        yield_now();
    }
}

/// Resume a suspended thread. Interrupts are disabled across the check
/// so the status cannot change underneath it.
pub fn resume(id: ThreadId) {
    cpu::without_interrupts(|| PerCpu::current().scheduler.resume(id));
}

/// Put the calling thread to sleep for at least `ns` nanoseconds.
/// Wake-up honors a 100 ns tolerance window.
pub fn sleep(ns: u64) {
    cpu::without_interrupts(|| {
        let sched = &mut PerCpu::current().scheduler;
        let id = sched.current.expect("sleep called outside a thread");
        let t = &mut sched.threads[id as usize];
        t.sleep_until_ns = time::tick_count_ns() + ns;
        t.set_status(Status::Sleeping);
    });
    yield_now();
}

/// Forfeit ownership. The scheduler reaps the thread once it dies, and
/// the handle must be considered invalid from here on.
pub fn detach(id: ThreadId) {
    cpu::without_interrupts(|| PerCpu::current().scheduler.detach(id));
}

/// Wait for a thread to die, then reclaim it. Returns immediately when
/// called on a detached thread.
pub fn join(id: ThreadId) {
    let owned = cpu::without_interrupts(|| {
        let sched = &PerCpu::current().scheduler;
        sched.threads[id as usize].owned()
    });
    if !owned {
        return;
    }

    // Busy-wait; the timer keeps preempting us so the target can run.
    loop {
        let dead = cpu::without_interrupts(|| {
            PerCpu::current().scheduler.threads[id as usize].status() == Status::Zombie
        });
        if dead {
            break;
        }
        core::hint::spin_loop();
    }

    cpu::without_interrupts(|| PerCpu::current().scheduler.release_slot(id));
}
