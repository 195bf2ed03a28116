//! The scheduler
//!
//! Single CPU, cooperative. The running thread is identified by a per-CPU
//! current-thread slot updated at every switch; everything else ready to
//! run sits on one FIFO queue. There is no preemption: control changes
//! hands only at yield, block and exit.
//!
//! Scheduling decisions are separated from the stack switch itself: every
//! operation returns a [`SwitchAction`] the caller applies after releasing
//! the scheduler lock, so the lock is never held across a switch.

use crate::arch;
use crate::error::Errno;
use crate::object::{self, ObjRef};
use crate::process::thread::{ThreadPtr, ThreadState};

use super::queue::RunQueue;

/// The stack switch a scheduling decision calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    /// Keep running the current thread
    None,
    /// Switch from `prev` to `next`; when `reclaim_prev` is set, `prev`
    /// has exited and the next thread drops its self-pin after the switch
    Switch {
        prev: ThreadPtr,
        next: ThreadPtr,
        reclaim_prev: bool,
    },
}

/// Scheduler state
pub struct Scheduler {
    run_queue: RunQueue,
    /// The one thread in state `Running`; per-CPU slot on the single CPU
    current: Option<ThreadPtr>,
    /// Exited thread awaiting reclamation by the next thread
    pending_reclaim: Option<ThreadPtr>,
    /// Timer-tick counter; bookkeeping only
    ticks: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            run_queue: RunQueue::new(),
            current: None,
            pending_reclaim: None,
            ticks: 0,
        }
    }

    /// The running thread
    #[inline]
    pub fn current(&self) -> Option<ThreadPtr> {
        self.current
    }

    pub fn ready_count(&self) -> usize {
        self.run_queue.len()
    }

    /// Install the first thread at the end of boot; it becomes the running
    /// thread without a switch.
    pub fn adopt_first(&mut self, thread: ThreadPtr) {
        debug_assert!(self.current.is_none());
        thread.get().set_state(ThreadState::Running);
        self.current = Some(thread);
    }

    /// Move a thread to `Ready` and append it to the run queue.
    pub fn ready_thread(&mut self, thread: ThreadPtr) {
        thread.get().set_state(ThreadState::Ready);
        if !self.run_queue.enqueue(thread) {
            panic!("ready queue overflow");
        }
    }

    /// Move the current thread to the tail of the queue and switch to the
    /// head. With an empty queue the current thread just keeps running.
    pub fn yield_current(&mut self) -> SwitchAction {
        let prev = self.current.expect("yield with no current thread");

        let next = match self.run_queue.dequeue() {
            Some(next) => next,
            None => return SwitchAction::None,
        };

        prev.get().set_state(ThreadState::Ready);
        if !self.run_queue.enqueue(prev) {
            panic!("ready queue overflow");
        }

        next.get().set_state(ThreadState::Running);
        self.current = Some(next);
        SwitchAction::Switch {
            prev,
            next,
            reclaim_prev: false,
        }
    }

    /// Park the current thread and switch to the head of the queue. The
    /// caller has already linked the thread onto a wait queue (or pinned it
    /// to a receiver) and set its state to `Blocked`.
    ///
    /// Boot keeps an idle thread on the queue, so there is always a thread
    /// to switch to; an empty queue here is an invariant violation.
    pub fn block_current(&mut self) -> SwitchAction {
        let prev = self.current.expect("block with no current thread");
        debug_assert_eq!(prev.get().state(), ThreadState::Blocked);

        let next = self
            .run_queue
            .dequeue()
            .expect("blocking with nothing left to run");

        next.get().set_state(ThreadState::Running);
        self.current = Some(next);
        SwitchAction::Switch {
            prev,
            next,
            reclaim_prev: false,
        }
    }

    /// Final switch of an exiting thread. The next thread drops the
    /// exiting thread's self-pin once the dead stack is no longer active.
    pub fn exit_current(&mut self) -> SwitchAction {
        let prev = self.current.expect("exit with no current thread");
        prev.get().set_state(ThreadState::Zombie);

        let next = self
            .run_queue
            .dequeue()
            .expect("last thread exiting with nothing left to run");

        next.get().set_state(ThreadState::Running);
        self.current = Some(next);
        self.pending_reclaim = Some(prev);
        SwitchAction::Switch {
            prev,
            next,
            reclaim_prev: true,
        }
    }

    /// Take the thread awaiting reclamation, if any.
    pub fn take_reclaim(&mut self) -> Option<ThreadPtr> {
        self.pending_reclaim.take()
    }

    /// Return to the pre-boot state. Test scaffolding: the global
    /// scheduler is shared by every test in the binary, so tests driving
    /// the syscall layer reset it under their own serialisation.
    #[cfg(all(test, not(target_os = "none")))]
    pub fn reset_for_test(&mut self) {
        while self.run_queue.dequeue().is_some() {}
        self.current = None;
        self.pending_reclaim = None;
    }

    /// Timer tick; bookkeeping only, no preemption.
    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Wake a joiner whose target thread was destroyed before exiting.
pub fn abort_join(sched: &mut Scheduler, thread: ThreadPtr) {
    if let Some(joiner) = thread.get().joined().lock().take() {
        joiner.get().set_wake_status(Err(Errno::NoSuchThread));
        sched.ready_thread(joiner);
    }
}

/// Reclaim an exited thread: drop its self-pin and tear its process down
/// when it was the last thread. Runs on the incoming thread's stack, after
/// the dead stack is inactive.
pub fn reclaim_thread(thread: ThreadPtr) {
    let process = thread.get().process();
    let last = process.get().thread_exited();

    object::release(ObjRef::Thread(thread));

    if last {
        crate::process::teardown_process(process);
    }
}

/// Apply a switch decision after the scheduler lock has been released.
pub fn apply(sched: &spin::Mutex<Scheduler>, action: SwitchAction) {
    let SwitchAction::Switch { prev, next, .. } = action else {
        return;
    };

    arch::without_interrupts(|| {
        let prev_ctx = {
            let guard = prev.get().context().lock();
            &*guard as *const _ as *mut arch::ThreadContext
        };
        let next_ctx = {
            let guard = next.get().context().lock();
            &*guard as *const arch::ThreadContext
        };

        // SAFETY: both contexts describe pinned kernel stacks; prev is the
        // executing thread and next was prepared or previously switched
        // out.
        unsafe { arch::switch_context(prev_ctx, next_ctx) };
    });

    // Running again on prev's stack. Whatever exited while we were away is
    // reclaimed now, on a live stack. The lock must be released before the
    // reclaim: tearing a process down re-enters the scheduler to wake IPC
    // peers.
    let dead = sched.lock().take_reclaim();
    if let Some(dead) = dead {
        reclaim_thread(dead);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_env;

    #[test]
    fn fifo_order_on_ready_queue() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let mut sched = Scheduler::new();

        let a = test_env::spawn_thread(process);
        let b = test_env::spawn_thread(process);
        let c = test_env::spawn_thread(process);

        sched.adopt_first(a);
        sched.ready_thread(b);
        sched.ready_thread(c);

        // a yields: b runs, a goes to the tail behind c.
        let action = sched.yield_current();
        assert_eq!(
            action,
            SwitchAction::Switch {
                prev: a,
                next: b,
                reclaim_prev: false
            }
        );
        assert_eq!(sched.current(), Some(b));
        assert_eq!(a.get().state(), ThreadState::Ready);
        assert_eq!(b.get().state(), ThreadState::Running);

        // b yields: c runs.
        let action = sched.yield_current();
        assert!(matches!(action, SwitchAction::Switch { next, .. } if next == c));
    }

    #[test]
    fn yield_with_empty_queue_keeps_running() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let mut sched = Scheduler::new();

        let a = test_env::spawn_thread(process);
        sched.adopt_first(a);

        assert_eq!(sched.yield_current(), SwitchAction::None);
        assert_eq!(sched.current(), Some(a));
        assert_eq!(a.get().state(), ThreadState::Running);
    }

    #[test]
    fn blocked_thread_is_not_enqueued() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let mut sched = Scheduler::new();

        let a = test_env::spawn_thread(process);
        let b = test_env::spawn_thread(process);
        sched.adopt_first(a);
        sched.ready_thread(b);

        a.get().set_state(ThreadState::Blocked);
        let action = sched.block_current();
        assert!(matches!(action, SwitchAction::Switch { next, .. } if next == b));
        assert_eq!(sched.current(), Some(b));
        assert_eq!(sched.ready_count(), 0);
        assert_eq!(a.get().state(), ThreadState::Blocked);
    }

    #[test]
    fn exactly_one_thread_runs() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let mut sched = Scheduler::new();

        let threads = [
            test_env::spawn_thread(process),
            test_env::spawn_thread(process),
            test_env::spawn_thread(process),
        ];
        sched.adopt_first(threads[0]);
        sched.ready_thread(threads[1]);
        sched.ready_thread(threads[2]);

        for _ in 0..5 {
            sched.yield_current();
            let running: usize = threads
                .iter()
                .filter(|t| t.get().state() == ThreadState::Running)
                .count();
            assert_eq!(running, 1);
            assert_eq!(
                sched.current().unwrap().get().state(),
                ThreadState::Running
            );
        }
    }

    #[test]
    fn exit_defers_reclaim_to_next_thread() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let mut sched = Scheduler::new();

        let a = test_env::spawn_thread(process);
        let b = test_env::spawn_thread(process);
        sched.adopt_first(a);
        sched.ready_thread(b);

        let action = sched.exit_current();
        assert!(matches!(
            action,
            SwitchAction::Switch {
                reclaim_prev: true,
                ..
            }
        ));
        assert_eq!(a.get().state(), ThreadState::Zombie);
        assert_eq!(sched.take_reclaim(), Some(a));
        assert_eq!(sched.take_reclaim(), None);
    }

    #[test]
    fn tick_only_counts() {
        let mut sched = Scheduler::new();
        sched.tick();
        sched.tick();
        assert_eq!(sched.ticks(), 2);
        assert!(sched.current().is_none());
    }
}
