//! Scheduling
//!
//! One FIFO ready queue, one running thread, cooperative hand-off only.

pub mod queue;
pub mod scheduler;

pub use queue::RunQueue;
pub use scheduler::{Scheduler, SwitchAction};

use spin::Mutex;

/// The global scheduler
///
/// Initialised once during boot by adopting the first thread; the context
/// switch itself always happens after this lock is released.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// The running thread. Panics before the first thread is adopted.
pub fn current_thread() -> crate::process::thread::ThreadPtr {
    SCHEDULER
        .lock()
        .current()
        .expect("no current thread before boot completes")
}
