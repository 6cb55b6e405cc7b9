// =============================================================================
// AsterOS - Per-CPU Scheduler
// =============================================================================
//
// Fixed-priority, preemptively time-sliced, one instance per CPU. The
// arena (`threads`) owns every thread record; queues hold slot indices:
//
//   run_queue  - max-heap on priority, FIFO among equals
//   sleep_heap - min-heap on absolute wake deadline
//   suspended  - threads parked until an explicit resume
//   zombies    - unowned dead threads awaiting reclamation
//
// `current` names the thread borrowed out to the running context; it is
// on no queue while it runs. A thread can sit on a queue with a stale
// status (killed while runnable, say); `pop_next` re-routes such entries
// by their current status instead of running them.
//
// No scheduler method is ever entered from another CPU. Callers disable
// interrupts first.
// =============================================================================

use alloc::vec::Vec;

use kcollections::{MinHeap, PriorityQueue};

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::interrupts::{Registers, RFLAGS_IF};
use crate::arch::x86_64::smp::PerCpu;
use crate::sched::switch::{context_jump, context_save, restore_full, Context};
use crate::sched::thread::{Priority, Status, Thread, ThreadId};
use crate::time;

/// Maximum contiguous time a thread may run before preemption.
pub const MAX_SLICE_NS: u64 = 1_000_000;

/// Tolerance window on deadline comparisons.
const TOLERANCE_NS: u64 = 100;

/// Programming slack subtracted from timer deadlines.
const PROGRAM_SLACK_NS: u64 = 10;

/// A deadline already in the past is re-armed this far out.
const PAST_EVENT_CLAMP_NS: u64 = 1_000;

/// The per-CPU scheduler instance.
pub struct Scheduler {
    /// Index of the owning CPU.
    pub cpu: u32,
    /// Every thread of this CPU, keyed by slot.
    pub threads: Vec<Thread>,
    /// Recycled slots.
    free_slots: Vec<ThreadId>,
    /// Runnable threads, highest priority first.
    run_queue: PriorityQueue<u8, ThreadId>,
    /// Sleeping threads, earliest deadline at the root.
    sleep_heap: MinHeap<ThreadId>,
    /// Explicitly suspended threads.
    suspended: Vec<ThreadId>,
    /// Unowned dead threads to reclaim.
    zombies: Vec<ThreadId>,
    /// The thread currently borrowed out to the running context.
    pub current: Option<ThreadId>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            cpu: 0,
            threads: Vec::new(),
            free_slots: Vec::new(),
            run_queue: PriorityQueue::new(),
            sleep_heap: MinHeap::new(),
            suspended: Vec::new(),
            zombies: Vec::new(),
            current: None,
        }
    }

    /// First-time setup: remember the CPU index and create the idle
    /// thread, so `schedule` always has something to pop.
    pub fn init(&mut self, cpu_index: u32) {
        self.cpu = cpu_index;

        let idle = self.create_thread().expect("no slot for the idle thread");
        self.configure(idle, |t| {
            t.entry_point = Some(idle_thread);
            t.set_priority(Priority::Idle);
        });
        if !self.start(idle) {
            panic!("could not start the idle thread on CPU {}", cpu_index);
        }
        self.threads[idle as usize].set_owned(false);
    }

    // --- Thread bookkeeping ---

    /// Allocate a slot in `Setup` state.
    pub fn create_thread(&mut self) -> Option<ThreadId> {
        if let Some(id) = self.free_slots.pop() {
            self.threads[id as usize].recycle();
            return Some(id);
        }

        let id = self.threads.len() as ThreadId;
        self.threads.push(Thread::new(id, self.cpu));
        Some(id)
    }

    /// Apply a setup-phase mutation. Ignored (and logged) once the
    /// thread has started.
    pub fn configure(&mut self, id: ThreadId, f: impl FnOnce(&mut Thread)) {
        let t = &mut self.threads[id as usize];
        if t.status() != Status::Setup {
            klog::warn!(
                "[sched] configuring thread {} after setup; ignored",
                id
            );
            return;
        }
        f(t);
    }

    /// Build the initial context and enqueue the thread.
    pub fn start(&mut self, id: ThreadId) -> bool {
        let t = &mut self.threads[id as usize];
        if t.status() != Status::Setup {
            klog::warn!("[sched] start of thread {} outside setup; ignored", id);
            return false;
        }

        // Zero-filling the buffer writes every byte, so the demand pages
        // behind the stack are resident before the thread first runs.
        let size = t.stack_size;
        let stack = alloc::vec![0u8; size].into_boxed_slice();

        let top = (stack.as_ptr() as u64 + size as u64) & !0xF;
        t.stack = Some(stack);

        t.ctx = Context::empty();
        // A fake return address keeps the ABI's stack parity; the
        // trampoline never returns through it.
        t.ctx.rsp = top - 8;
        // SAFETY: the slot is inside the stack we just allocated.
        unsafe {
            *((top - 8) as *mut u64) = 0;
        }
        t.ctx.rip = thread_trampoline as usize as u64;
        t.ctx.rflags = RFLAGS_IF | 0x2;
        t.need_restore_extra = false;

        t.set_status(Status::Running);
        let priority = t.priority() as u8;
        self.run_queue.push(priority, id);
        true
    }

    /// Route a thread that is done running (or was found with a stale
    /// queue entry) to wherever its status says it belongs.
    pub fn done(&mut self, id: ThreadId) {
        let t = &self.threads[id as usize];
        match t.status() {
            Status::Running => {
                let priority = t.priority() as u8;
                self.run_queue.push(priority, id);
            }
            Status::Sleeping => self.sleep_heap.push(t.sleep_until_ns, id),
            Status::Suspended => self.suspended.push(id),
            Status::Zombie => {
                // An owned zombie is its joiner's to clean up.
                if !t.owned() && !self.zombies.contains(&id) {
                    self.zombies.push(id);
                }
            }
            Status::Setup => {
                panic!("[sched] thread {} reached the scheduler during setup", id)
            }
        }
    }

    /// Mark a thread dead. Returns `true` when it was the current
    /// thread, in which case the caller must yield.
    pub fn mark_zombie(&mut self, id: ThreadId) -> bool {
        self.threads[id as usize].set_status(Status::Zombie);

        if self.current == Some(id) {
            return true;
        }

        // If it sat on the suspended list, route it out now; queue
        // entries elsewhere re-route lazily in pop_next.
        if let Some(pos) = self.suspended.iter().position(|&s| s == id) {
            self.suspended.swap_remove(pos);
            self.done(id);
        }
        false
    }

    /// Mark a thread suspended. Returns `true` when it was the current
    /// thread, in which case the caller must yield.
    pub fn mark_suspended(&mut self, id: ThreadId) -> bool {
        self.threads[id as usize].set_status(Status::Suspended);
        self.current == Some(id)
    }

    /// Make a suspended thread runnable again.
    pub fn resume(&mut self, id: ThreadId) {
        let t = &self.threads[id as usize];
        if t.status() != Status::Suspended {
            return;
        }
        t.set_status(Status::Running);

        if let Some(pos) = self.suspended.iter().position(|&s| s == id) {
            self.suspended.swap_remove(pos);
            let priority = t.priority() as u8;
            self.run_queue.push(priority, id);
        }
        // Not on the list yet: it is still in flight through a queue and
        // pop_next will see the fresh status.
    }

    /// Forfeit ownership of a thread.
    pub fn detach(&mut self, id: ThreadId) {
        let t = &self.threads[id as usize];
        t.set_owned(false);
        if t.status() == Status::Zombie && !self.zombies.contains(&id) {
            self.zombies.push(id);
        }
    }

    /// Return a dead thread's slot to the free list.
    pub fn release_slot(&mut self, id: ThreadId) {
        debug_assert_ne!(self.current, Some(id));
        self.threads[id as usize].recycle();
        self.free_slots.push(id);
    }

    // --- Scheduling core ---

    /// Drain due sleepers and reclaim unowned zombies.
    fn process_events(&mut self, now: u64) {
        while let Some((_, id)) = self.sleep_heap.pop_due(now + TOLERANCE_NS) {
            let t = &self.threads[id as usize];
            if t.status() == Status::Sleeping {
                t.set_status(Status::Running);
                let priority = t.priority() as u8;
                self.run_queue.push(priority, id);
            } else {
                // Killed or suspended while asleep; route by status.
                self.done(id);
            }
        }

        while let Some(id) = self.zombies.pop() {
            self.release_slot(id);
        }
    }

    /// Pop the highest-priority thread that is actually runnable.
    fn pop_next(&mut self) -> Option<ThreadId> {
        while let Some(id) = self.run_queue.pop() {
            if self.threads[id as usize].status() == Status::Running {
                return Some(id);
            }
            // Stale entry: the thread changed state while queued.
            self.done(id);
        }
        None
    }

    /// The next moment this CPU must wake up: end of the current slice,
    /// or the earliest sleeper, whichever comes first. Deadlines already
    /// in the past clamp to a microsecond out.
    fn next_event(&self, now: u64) -> u64 {
        let mut next = match self.current {
            Some(id) => self.threads[id as usize].time_slice_end_ns,
            None => now + MAX_SLICE_NS,
        };
        if let Some(wake) = self.sleep_heap.peek_key() {
            next = next.min(wake);
        }
        if next <= now {
            next = now + PAST_EVENT_CLAMP_NS;
        }
        next
    }

    /// Select and enter the next thread. `current` must already be
    /// vacated. Never returns.
    ///
    /// Interrupts must be disabled; the entered context re-enables them
    /// through its saved RFLAGS.
    pub fn schedule(&mut self, from_timer_irq: bool) -> ! {
        debug_assert!(self.current.is_none());
        debug_assert!(!cpu::interrupts_enabled());

        let now = time::tick_count_ns();

        let next = match self.pop_next() {
            Some(id) => id,
            None => panic!("nothing to execute on CPU {}", self.cpu),
        };

        self.current = Some(next);
        self.threads[next as usize].time_slice_end_ns = now + MAX_SLICE_NS;

        let deadline = self.next_event(now);
        time::schedule_interrupt_in(
            deadline
                .saturating_sub(now)
                .saturating_sub(PROGRAM_SLACK_NS)
                .max(PROGRAM_SLACK_NS),
        );

        if from_timer_irq {
            khal::apic::eoi();
        }

        let t = &self.threads[next as usize];
        // SAFETY: the context was captured by context_save or snapshotted
        // from a live interrupt frame; the backing slot is not moved
        // between here and the jump.
        unsafe {
            if t.need_restore_extra {
                restore_full(&t.extra_regs)
            } else {
                context_jump(&t.ctx)
            }
        }
    }

    /// The preemption tick.
    ///
    /// Returns normally when the current thread keeps its slice (the
    /// dispatcher then EOIs and resumes it); otherwise snapshots the
    /// frame and jumps to the next thread, never returning.
    pub fn on_timer_irq(&mut self, regs: &mut Registers) {
        let now = time::tick_count_ns();
        self.process_events(now);

        if let Some(cur) = self.current {
            if self.threads[cur as usize].time_slice_end_ns > now + TOLERANCE_NS {
                let deadline = self.next_event(now);
                time::schedule_interrupt_in(
                    deadline
                        .saturating_sub(now)
                        .saturating_sub(PROGRAM_SLACK_NS)
                        .max(PROGRAM_SLACK_NS),
                );
                return;
            }

            let t = &mut self.threads[cur as usize];
            t.extra_regs = *regs;
            t.ctx = Context::from_registers(regs);
            t.need_restore_extra = true;
            self.done(cur);
            self.current = None;
        }

        self.schedule(true)
    }

    /// Bring-up entry: enter the scheduler with no thread to save.
    pub fn enter(&mut self) -> ! {
        cpu::disable_interrupts();
        PerCpu::current().interrupts_enabled = false;
        debug_assert!(self.current.is_none());
        self.schedule(false)
    }
}

/// Cooperative yield: save the calling thread's context, hand it back to
/// the scheduler, and run whatever is next. Returns when the thread is
/// scheduled again.
pub fn yield_now() {
    cpu::disable_interrupts();
    let pcpu = PerCpu::current();
    pcpu.interrupts_enabled = false;

    let sched = &mut pcpu.scheduler;
    let Some(cur) = sched.current else {
        // Nothing to save; bring-up uses Scheduler::enter instead.
        pcpu.interrupts_enabled = true;
        cpu::enable_interrupts();
        return;
    };

    let ctx: *mut Context = &mut sched.threads[cur as usize].ctx;
    // SAFETY: setjmp-style save; returns 0 now and 1 when resumed.
    if unsafe { context_save(ctx) } == 0 {
        let t = &mut sched.threads[cur as usize];
        // Resume with interrupts on, whatever they were at the save.
        t.ctx.rflags |= RFLAGS_IF;
        t.need_restore_extra = false;

        sched.done(cur);
        sched.current = None;
        sched.schedule(false)
    }

    // Resumed: context_jump already restored RFLAGS (interrupts on).
    PerCpu::current().interrupts_enabled = true;
}

/// First code every thread runs: call the entry point, then die.
extern "C" fn thread_trampoline() -> ! {
    let entry = {
        let pcpu = PerCpu::current();
        let sched = &pcpu.scheduler;
        let id = sched.current.expect("trampoline with no current thread");
        sched.threads[id as usize].entry_point
    };

    if let Some(f) = entry {
        f();
    }

    let id = PerCpu::current()
        .scheduler
        .current
        .expect("trampoline lost its thread");
    crate::sched::thread::kill(id);
    unreachable!("a finished thread was scheduled again");
}

/// The idle thread: wait for interrupts, forever. Runs only when the
/// run queue is otherwise empty.
fn idle_thread() {
    loop {
        cpu::halt();
    }
}

/// A detached low-chatter heartbeat, started on the BSP for boot
/// visibility.
pub fn spawn_heartbeat() {
    let Some(id) = crate::sched::thread::create() else {
        return;
    };
    crate::sched::thread::set_entry_point(id, heartbeat_thread);
    crate::sched::thread::set_priority(id, Priority::Normal);
    crate::sched::thread::start(id);
    crate::sched::thread::detach(id);
}

fn heartbeat_thread() {
    loop {
        klog::info!(
            "[sched] heartbeat from CPU {}",
            PerCpu::current().processor_id
        );
        crate::sched::thread::sleep(1_000_000_000);
    }
}

/// Spawn the boot-time lifecycle exercise on the calling CPU.
///
/// A detached parent walks a child through every lifecycle edge -
/// suspend, resume, sleep-driven progress, join - and logs the result.
pub fn spawn_lifecycle_check() {
    use crate::sched::thread;

    let Some(id) = thread::create() else {
        return;
    };
    thread::set_entry_point(id, lifecycle_parent);
    thread::set_priority(id, Priority::Normal);
    thread::start(id);
    thread::detach(id);
}

/// Steps completed by the lifecycle child.
static LIFECYCLE_PROGRESS: core::sync::atomic::AtomicU32 =
    core::sync::atomic::AtomicU32::new(0);

fn lifecycle_child() {
    for _ in 0..3 {
        LIFECYCLE_PROGRESS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        crate::sched::thread::sleep(1_000_000);
    }
}

fn lifecycle_parent() {
    use crate::sched::thread;

    let Some(child) = thread::create() else {
        klog::error!("[sched] lifecycle check: no slot for the child");
        return;
    };
    thread::set_entry_point(child, lifecycle_child);
    thread::set_stack_size(child, 16 * 1024);
    thread::set_priority(child, Priority::Realtime);

    if !thread::start(child) {
        klog::error!("[sched] lifecycle check: child would not start");
        return;
    }

    // Park and release the child once; it must survive the detour.
    thread::suspend(child);
    thread::resume(child);

    thread::join(child);

    let progress = LIFECYCLE_PROGRESS.load(core::sync::atomic::Ordering::SeqCst);
    if progress == 3 {
        klog::info!("[sched] lifecycle check passed");
    } else {
        klog::error!("[sched] lifecycle check: progress {} of 3", progress);
    }
}
