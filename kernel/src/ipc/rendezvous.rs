//! Synchronous rendezvous IPC
//!
//! Send, receive and reply with direct hand-off. A sender either meets a
//! blocked receiver (message copied, receiver readied, sender parked on the
//! receiver awaiting the reply) or queues itself on the endpoint; a
//! receiver either meets a queued sender or queues itself. The endpoint's
//! two queues are strict FIFO and never both non-empty.
//!
//! Every operation manipulates thread and endpoint state under the
//! scheduler lock and returns the [`SwitchAction`] for the caller to apply
//! once the lock is released; the blocked thread's eventual status travels
//! through its wake-status slot.

use crate::error::{Errno, KernelResult};
use crate::object;
use crate::object::descriptor::{all_permissions, DescFlags, Descriptor};
use crate::process::thread::{ThreadPtr, ThreadState};
use crate::sched::{Scheduler, SwitchAction};

use super::endpoint::EndpointPtr;
use super::message::{MessageInput, MESSAGE_MAX_DESCRIPTORS};

/// Outcome of a receive attempt
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A queued sender's message is in the receiver's staging buffer; the
    /// receiver keeps running
    Delivered,
    /// No sender was waiting; the receiver is parked and the caller
    /// applies the switch
    Blocked(SwitchAction),
}

/// Send a message through an endpoint.
///
/// Validation happens before any side effect. On return the sender is
/// parked (queued on the endpoint, or pinned to a receiver awaiting the
/// reply); the caller applies the switch action and reads the final status
/// from the sender's wake-status slot after resuming.
pub fn send_message(
    sched: &mut Scheduler,
    endpoint: EndpointPtr,
    sender: ThreadPtr,
    function: usize,
    cookie: usize,
    input: &MessageInput<'_>,
) -> KernelResult<SwitchAction> {
    input.validate()?;
    debug_assert_eq!(sched.current(), Some(sender));

    sender.get().staging().lock().stage(function, cookie, input);
    sender.get().clear_wake_status();

    let receiver = endpoint.get().receivers().lock().pop_front();
    if let Some(receiver) = receiver {
        endpoint.get().sub_receiver();

        if let Err(errno) = deliver(sender, receiver) {
            // The receiver never saw the message; it goes back to the
            // front so queue order is preserved.
            endpoint.get().receivers().lock().push_front(receiver);
            endpoint.get().add_receiver();
            return Err(errno);
        }

        *receiver.get().current_sender().lock() = Some(sender);
        receiver.get().set_pending_delivery(true);
        receiver.get().set_wake_status(Ok(0));
        sched.ready_thread(receiver);
    } else {
        endpoint.get().senders().lock().push_back(sender);
    }

    sender.get().set_state(ThreadState::Blocked);
    Ok(sched.block_current())
}

/// Receive a message from an endpoint.
///
/// When a sender is queued its message is delivered immediately and the
/// receiver keeps running; otherwise the receiver parks on the endpoint.
pub fn receive_message(
    sched: &mut Scheduler,
    endpoint: EndpointPtr,
    receiver: ThreadPtr,
) -> KernelResult<ReceiveOutcome> {
    debug_assert_eq!(sched.current(), Some(receiver));

    loop {
        let sender = endpoint.get().senders().lock().pop_front();
        let Some(sender) = sender else { break };

        match deliver(sender, receiver) {
            Ok(()) => {
                *receiver.get().current_sender().lock() = Some(sender);
                receiver.get().set_pending_delivery(true);
                return Ok(ReceiveOutcome::Delivered);
            }
            Err(errno) => {
                // This sender's transfer cannot be honored; fail it and
                // offer the next one to the receiver.
                sender.get().set_wake_status(Err(errno));
                sched.ready_thread(sender);
            }
        }
    }

    endpoint.get().receivers().lock().push_back(receiver);
    endpoint.get().add_receiver();
    receiver.get().clear_wake_status();
    receiver.get().set_state(ThreadState::Blocked);
    Ok(ReceiveOutcome::Blocked(sched.block_current()))
}

/// Status check after a parked receiver resumes: the message is already in
/// its staging buffer unless the endpoint went away.
pub fn complete_receive(receiver: ThreadPtr) -> KernelResult<()> {
    match receiver.get().wake_status() {
        Some(Ok(_)) => Ok(()),
        Some(Err(errno)) => Err(errno),
        None => Err(Errno::Protocol),
    }
}

/// Reply to the sender currently being serviced.
///
/// The reply is copied into the sender's staging buffer and the sender is
/// readied with the reply's size as its status. The current-sender slot is
/// only cleared once the reply is known to fit.
pub fn reply_to_message(
    sched: &mut Scheduler,
    replier: ThreadPtr,
    input: &MessageInput<'_>,
) -> KernelResult<()> {
    input.validate()?;

    let sender = {
        let slot = replier.get().current_sender().lock();
        (*slot).ok_or(Errno::NoMessage)?
    };

    if input.data.len() > sender.get().staging().lock().reply_capacity {
        return Err(Errno::TooBig);
    }

    // Descriptors first: their transfer can still fail with the sender
    // left pending, so the replier can retry.
    transfer_descriptors(replier, sender, input.descriptors)?;

    {
        let mut staging = sender.get().staging().lock();
        staging.data_size = input.data.len();
        staging.data[..input.data.len()].copy_from_slice(input.data);
        if input.descriptors.is_empty() {
            staging.descriptor_count = 0;
        }
    }

    *replier.get().current_sender().lock() = None;
    replier.get().set_pending_delivery(false);
    sender.get().set_wake_status(Ok(input.data.len() as i32));
    sched.ready_thread(sender);
    Ok(())
}

/// Deliver the already-matched sender's message again.
///
/// A receive whose hand-over to user space failed leaves the sender
/// matched with the delivery unconsumed; the next receive completes that
/// rendezvous instead of popping a fresh sender. Returns false when there
/// is nothing to redeliver.
pub fn receive_pending(receiver: ThreadPtr) -> KernelResult<bool> {
    let sender = {
        let slot = receiver.get().current_sender().lock();
        *slot
    };
    let Some(sender) = sender else {
        return Ok(false);
    };
    if !receiver.get().has_pending_delivery() {
        return Ok(false);
    }

    deliver(sender, receiver)?;
    Ok(true)
}

/// Undo a delivery whose hand-over to user space failed: the descriptors
/// just installed in the receiver's table are closed and released again.
/// The sender stays matched, and the delivery stays pending, so a retry
/// (with a larger buffer, or after closing descriptors) delivers again.
pub fn unwind_delivery(receiver: ThreadPtr) {
    let table = receiver.get().process().get().descriptors();

    let (fds, count) = {
        let mut staging = receiver.get().staging().lock();
        let mut fds = [0u32; MESSAGE_MAX_DESCRIPTORS];
        let count = staging.descriptor_count;
        fds[..count].copy_from_slice(staging.descriptor_slots());
        staging.descriptor_count = 0;
        (fds, count)
    };

    for &fd in &fds[..count] {
        if let Ok(outcome) = table.close(fd as usize) {
            object::release(outcome.object);
        }
    }
}

/// Abort the sender parked on an exiting receiver.
pub fn abort_sender(sched: &mut Scheduler, sender: ThreadPtr) {
    sender.get().set_wake_status(Err(Errno::Io));
    sched.ready_thread(sender);
}

/// Wake everything queued on a destroyed endpoint with `EIO`.
pub fn endpoint_destroyed(sched: &mut Scheduler, endpoint: EndpointPtr) {
    loop {
        let sender = endpoint.get().senders().lock().pop_front();
        match sender {
            Some(sender) => {
                sender.get().set_wake_status(Err(Errno::Io));
                sched.ready_thread(sender);
            }
            None => break,
        }
    }

    loop {
        let receiver = endpoint.get().receivers().lock().pop_front();
        match receiver {
            Some(receiver) => {
                endpoint.get().sub_receiver();
                receiver.get().set_wake_status(Err(Errno::Io));
                sched.ready_thread(receiver);
            }
            None => break,
        }
    }
}

/// Copy the staged message from `sender` to `receiver` and transfer its
/// descriptors. All-or-nothing: a failed transfer leaves the receiver's
/// table as it was.
fn deliver(sender: ThreadPtr, receiver: ThreadPtr) -> KernelResult<()> {
    let (fds, fd_count) = {
        let staging = sender.get().staging().lock();
        let mut fds = [0u32; MESSAGE_MAX_DESCRIPTORS];
        fds[..staging.descriptor_count].copy_from_slice(staging.descriptor_slots());
        (fds, staging.descriptor_count)
    };

    let mut installed = [0u32; MESSAGE_MAX_DESCRIPTORS];
    let count = install_descriptors(sender, receiver, &fds[..fd_count], &mut installed)?;

    let sender_staging = sender.get().staging().lock();
    let mut receiver_staging = receiver.get().staging().lock();

    receiver_staging.function = sender_staging.function;
    receiver_staging.cookie = sender_staging.cookie;
    receiver_staging.data_size = sender_staging.data_size;
    receiver_staging.data[..sender_staging.data_size]
        .copy_from_slice(sender_staging.payload());
    receiver_staging.descriptor_count = count;
    receiver_staging.descriptors[..count].copy_from_slice(&installed[..count]);

    Ok(())
}

/// Resolve sender-side descriptors, mask their permissions and install
/// them in the receiver's table. Rolls back on any failure and reports
/// `EAGAIN`, whatever the underlying cause.
fn install_descriptors(
    sender: ThreadPtr,
    receiver: ThreadPtr,
    fds: &[u32],
    installed: &mut [u32; MESSAGE_MAX_DESCRIPTORS],
) -> KernelResult<usize> {
    let sender_table = sender.get().process().get().descriptors();
    let receiver_table = receiver.get().process().get().descriptors();

    let mut count = 0;
    for &fd in fds {
        let result = sender_table.access(fd as usize).and_then(|guard| {
            let mask = all_permissions(guard.object.kind());
            let target_fd = receiver_table.reserve_any()?;
            receiver_table.open(
                target_fd,
                Descriptor {
                    object: guard.object,
                    flags: (guard.flags & mask) | (guard.flags & DescFlags::DESTROYED),
                    cookie: guard.cookie,
                },
            );
            Ok(target_fd)
        });

        match result {
            Ok(target_fd) => {
                installed[count] = target_fd as u32;
                count += 1;
            }
            Err(_) => {
                for &fd in installed[..count].iter() {
                    if let Ok(outcome) = receiver_table.close(fd as usize) {
                        object::release(outcome.object);
                    }
                }
                return Err(Errno::Again);
            }
        }
    }

    Ok(count)
}

/// Transfer reply descriptors from `replier` to `sender`; same rollback
/// rule as message transfer.
fn transfer_descriptors(
    replier: ThreadPtr,
    sender: ThreadPtr,
    fds: &[usize],
) -> KernelResult<()> {
    if fds.is_empty() {
        return Ok(());
    }

    let mut words = [0u32; MESSAGE_MAX_DESCRIPTORS];
    for (slot, &fd) in words.iter_mut().zip(fds) {
        *slot = fd as u32;
    }

    let mut installed = [0u32; MESSAGE_MAX_DESCRIPTORS];
    let count = install_descriptors(replier, sender, &words[..fds.len()], &mut installed)?;

    let mut staging = sender.get().staging().lock();
    staging.descriptor_count = count;
    staging.descriptors[..count].copy_from_slice(&installed[..count]);
    Ok(())
}
