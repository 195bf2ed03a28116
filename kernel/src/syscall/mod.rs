//! System call interface
//!
//! A single entry point receives four machine words; `arg0` selects the
//! call. Numbers at or above [`SYSCALL_USER_BASE`] are send operations
//! whose number is delivered to the receiver as the message function. The
//! three hardware entry paths (int 0x80, SYSENTER, SYSCALL) all converge
//! here.
//!
//! Return convention: `arg0` carries a signed status, negative on failure
//! with the error number in `arg1`.

pub mod usermem;

use crate::error::{Errno, KernelResult};
use crate::ipc::endpoint::create_endpoint;
use crate::ipc::message::MessageInput;
use crate::ipc::rendezvous::{self, ReceiveOutcome};
use crate::ipc::{MESSAGE_MAX_DESCRIPTORS, MESSAGE_MAX_SIZE};
use crate::mm::{PhysAddr, Prot, VirtAddr, KLIMIT, PAGE_ALLOCATOR, PAGE_MASK};
use crate::object::descriptor::{self, AccessGuard, DescFlags, Descriptor};
use crate::object::{self, ObjRef};
use crate::process::thread::{construct_thread, ThreadParams, ThreadPtr, ThreadState};
use crate::process::ProcessPtr;
use crate::sched::{scheduler, SCHEDULER};

/// Call numbers below this are kernel calls; this and above are sends
pub const SYSCALL_USER_BASE: usize = 4096;

/// Longest string `puts` accepts
pub const PUTS_MAX_LENGTH: usize = 120;

/// System call numbers, part of the user-space ABI
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Puts = 3,
    CreateThread = 4,
    YieldThread = 5,
    SetThreadLocal = 6,
    GetThreadLocal = 7,
    GetUserMemory = 8,
    CreateEndpoint = 9,
    Receive = 10,
    Reply = 11,
    ExitThread = 12,
    Reboot = 13,
    Close = 14,
    Destroy = 15,
    Dup = 16,
    Mint = 17,
    Mmap = 18,
    Mclone = 19,
    CreateProcess = 20,
    StartThread = 21,
    JoinThread = 22,
    AwaitThread = 23,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Puts),
            4 => Ok(Self::CreateThread),
            5 => Ok(Self::YieldThread),
            6 => Ok(Self::SetThreadLocal),
            7 => Ok(Self::GetThreadLocal),
            8 => Ok(Self::GetUserMemory),
            9 => Ok(Self::CreateEndpoint),
            10 => Ok(Self::Receive),
            11 => Ok(Self::Reply),
            12 => Ok(Self::ExitThread),
            13 => Ok(Self::Reboot),
            14 => Ok(Self::Close),
            15 => Ok(Self::Destroy),
            16 => Ok(Self::Dup),
            17 => Ok(Self::Mint),
            18 => Ok(Self::Mmap),
            19 => Ok(Self::Mclone),
            20 => Ok(Self::CreateProcess),
            21 => Ok(Self::StartThread),
            22 => Ok(Self::JoinThread),
            23 => Ok(Self::AwaitThread),
            _ => Err(()),
        }
    }
}

/// The four-word argument/return tuple
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub arg0: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
}

// arg3 packing of send/reply size information:
//
//   |      buffer_size      |       data_size        |     n_desc    |
//   31                    20 19                     8 7              0

const SEND_SIZE_BITS: usize = 12;
const SEND_N_DESC_BITS: usize = 8;
const SEND_SIZE_MASK: usize = (1 << SEND_SIZE_BITS) - 1;
const SEND_N_DESC_MASK: usize = (1 << SEND_N_DESC_BITS) - 1;

/// Pack the size words of a send or reply.
pub const fn pack_send_args(buffer_size: usize, data_size: usize, n_desc: usize) -> usize {
    (buffer_size << (SEND_SIZE_BITS + SEND_N_DESC_BITS))
        | (data_size << SEND_N_DESC_BITS)
        | n_desc
}

/// Unpack `(buffer_size, data_size, n_desc)`.
pub const fn unpack_send_args(arg3: usize) -> (usize, usize, usize) {
    (
        (arg3 >> (SEND_SIZE_BITS + SEND_N_DESC_BITS)) & SEND_SIZE_MASK,
        (arg3 >> SEND_N_DESC_BITS) & SEND_SIZE_MASK,
        arg3 & SEND_N_DESC_MASK,
    )
}

/// Pack a delivery's status word: payload size and descriptor count.
pub const fn pack_reply_status(data_size: usize, n_desc: usize) -> isize {
    ((data_size << SEND_N_DESC_BITS) | n_desc) as isize
}

/// Mint argument structure passed by pointer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MintArgs {
    pub process_fd: usize,
    pub fd: usize,
    pub perms: u32,
    pub cookie: usize,
}

/// Mmap argument structure passed by pointer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MmapArgs {
    pub addr: usize,
    pub length: usize,
    pub prot: u32,
    pub paddr: u64,
}

/// Mclone argument structure passed by pointer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct McloneArgs {
    pub src_addr: usize,
    pub dest_addr: usize,
    pub length: usize,
    pub prot: u32,
}

/// Thread start parameters passed by pointer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserThreadParams {
    pub entry: usize,
    pub stack: usize,
    pub arg: usize,
}

/// Memory-map entry returned by get-user-memory
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserMemoryRange {
    pub kind: u32,
    pub start: u64,
    pub end: u64,
}

/// Entry point the three trap paths converge on.
///
/// # Safety
///
/// `args` must point to the four-word tuple the entry trampoline saved on
/// the kernel stack.
#[no_mangle]
pub unsafe extern "C" fn syscall_dispatch(args: *mut SyscallArgs) {
    // SAFETY: per contract, args points at the saved argument tuple.
    let args = unsafe { &mut *args };
    dispatch(args);
}

/// Dispatch one system call. The dispatcher owns `arg0`/`arg1` of the
/// return tuple; handlers with extra outputs write `arg2`/`arg3`.
pub fn dispatch(args: &mut SyscallArgs) {
    match route(args) {
        Ok(status) => {
            args.arg0 = status as usize;
            args.arg1 = 0;
        }
        Err(errno) => {
            args.arg0 = errno.status() as usize;
            args.arg1 = errno.code() as usize;
        }
    }
}

fn route(args: &mut SyscallArgs) -> KernelResult<isize> {
    let nr = args.arg0;

    if nr >= SYSCALL_USER_BASE {
        return sys_send(nr, args);
    }

    let call = Syscall::try_from(nr).map_err(|_| Errno::NoSys)?;
    match call {
        Syscall::Puts => sys_puts(args),
        Syscall::CreateThread => sys_create_thread(args),
        Syscall::YieldThread => sys_yield_thread(),
        Syscall::SetThreadLocal => sys_set_thread_local(args),
        Syscall::GetThreadLocal => sys_get_thread_local(),
        Syscall::GetUserMemory => sys_get_user_memory(args),
        Syscall::CreateEndpoint => sys_create_endpoint(args),
        Syscall::Receive => sys_receive(args),
        Syscall::Reply => sys_reply(args),
        Syscall::ExitThread => sys_exit_thread(args),
        Syscall::Reboot => sys_reboot(),
        Syscall::Close => sys_close(args),
        Syscall::Destroy => sys_destroy(args),
        Syscall::Dup => sys_dup(args),
        Syscall::Mint => sys_mint(args),
        Syscall::Mmap => sys_mmap(args),
        Syscall::Mclone => sys_mclone(args),
        Syscall::CreateProcess => sys_create_process(args),
        Syscall::StartThread => sys_start_thread(args),
        Syscall::JoinThread => sys_join_thread(args),
        Syscall::AwaitThread => sys_await_thread(args),
    }
}

fn current() -> ThreadPtr {
    crate::sched::current_thread()
}

fn current_process() -> ProcessPtr {
    current().get().process()
}

/// Resolve a process descriptor, checking a permission bit. The guard
/// pins the process for the caller's scope.
fn get_process(fd: usize, perm: DescFlags) -> KernelResult<(AccessGuard, ProcessPtr)> {
    let guard = current_process().get().descriptors().access(fd)?;
    let process = guard.process().ok_or(Errno::BadDescriptor)?;
    if !guard.has_permissions(perm) {
        return Err(Errno::NotPermitted);
    }
    Ok((guard, process))
}

fn sys_puts(args: &SyscallArgs) -> KernelResult<isize> {
    let level = args.arg1;
    let bytes = usermem::user_slice(args.arg2, args.arg3)?;
    validate_puts(level, bytes)?;

    // Validated printable ASCII.
    let text = core::str::from_utf8(bytes).map_err(|_| Errno::Invalid)?;
    match level {
        0 => log::info!("{}", text),
        1 => log::warn!("{}", text),
        _ => log::error!("{}", text),
    }
    Ok(0)
}

/// Bounds and character checks for `puts`, shared with the tests.
fn validate_puts(level: usize, bytes: &[u8]) -> KernelResult<()> {
    if level > 2 {
        return Err(Errno::Invalid);
    }
    if bytes.len() > PUTS_MAX_LENGTH {
        return Err(Errno::Invalid);
    }
    if !bytes.iter().all(|&b| (0x20..0x7f).contains(&b)) {
        return Err(Errno::Invalid);
    }
    Ok(())
}

fn sys_create_thread(args: &SyscallArgs) -> KernelResult<isize> {
    let fd = args.arg1;
    let (_guard, target) = get_process(args.arg2, DescFlags::PERM_CREATE_THREAD)?;

    let table = current_process().get().descriptors();
    table.reserve(fd)?;

    match construct_thread(target) {
        Ok(thread) => {
            table.open(fd, Descriptor::owner(ObjRef::Thread(thread)));
            Ok(0)
        }
        Err(errno) => {
            table.free_reservation(fd);
            Err(errno)
        }
    }
}

fn sys_yield_thread() -> KernelResult<isize> {
    let action = SCHEDULER.lock().yield_current();
    scheduler::apply(&SCHEDULER, action);
    Ok(0)
}

fn sys_set_thread_local(args: &SyscallArgs) -> KernelResult<isize> {
    usermem::check_range(args.arg1, args.arg2)?;
    current()
        .get()
        .set_thread_local(VirtAddr::new(args.arg1), args.arg2);
    Ok(0)
}

fn sys_get_thread_local() -> KernelResult<isize> {
    Ok(current().get().thread_local().addr.as_usize() as isize)
}

fn sys_get_user_memory(args: &SyscallArgs) -> KernelResult<isize> {
    let info = crate::bootinfo::get();
    let entry_size = core::mem::size_of::<UserMemoryRange>();
    let needed = info.memory_map.len() * entry_size;
    if needed > args.arg2 {
        return Err(Errno::TooBig);
    }

    for (index, range) in info.memory_map.iter().enumerate() {
        let entry = UserMemoryRange {
            kind: range.kind as u32,
            start: range.range.start.as_u64(),
            end: range.range.end.as_u64(),
        };
        usermem::write_user_struct(args.arg1 + index * entry_size, &entry)?;
    }
    Ok(info.memory_map.len() as isize)
}

fn sys_create_endpoint(args: &SyscallArgs) -> KernelResult<isize> {
    let fd = args.arg1;
    let table = current_process().get().descriptors();
    table.reserve(fd)?;

    match create_endpoint() {
        Ok(endpoint) => {
            table.open(fd, Descriptor::owner(ObjRef::Endpoint(endpoint)));
            Ok(0)
        }
        Err(errno) => {
            table.free_reservation(fd);
            Err(errno)
        }
    }
}

fn sys_send(function: usize, args: &mut SyscallArgs) -> KernelResult<isize> {
    let fd = args.arg1;
    let (buffer_size, data_size, n_desc) = unpack_send_args(args.arg3);

    if data_size > MESSAGE_MAX_SIZE || data_size > buffer_size {
        return Err(Errno::TooBig);
    }
    if n_desc > MESSAGE_MAX_DESCRIPTORS {
        return Err(Errno::Invalid);
    }

    let buffer = usermem::user_slice(args.arg2, buffer_size)?;
    let mut fds = [0usize; MESSAGE_MAX_DESCRIPTORS];
    read_fd_words(buffer, data_size, n_desc, &mut fds)?;

    let me = current();
    let (endpoint, cookie) = {
        let guard = current_process().get().descriptors().access(fd)?;
        let endpoint = guard.endpoint().ok_or(Errno::BadDescriptor)?;
        if !guard.has_permissions(DescFlags::PERM_SEND) {
            return Err(Errno::NotPermitted);
        }
        (endpoint, guard.cookie)
        // The guard drops here; the endpoint stays alive through the
        // sender's descriptor for the duration of the call.
    };

    let input = MessageInput::new(&buffer[..data_size])
        .with_descriptors(&fds[..n_desc])
        .with_reply_capacity(buffer_size);

    let action = {
        let mut sched = SCHEDULER.lock();
        rendezvous::send_message(&mut sched, endpoint, me, function, cookie, &input)?
    };
    scheduler::apply(&SCHEDULER, action);

    // Back from the rendezvous; the reply (or the failure) is in.
    match me.get().wake_status() {
        Some(Ok(_)) => {}
        Some(Err(errno)) => return Err(errno),
        None => return Err(Errno::Protocol),
    }

    let staging = me.get().staging().lock();
    let reply_buffer = usermem::user_slice_mut(args.arg2, buffer_size)?;
    reply_buffer[..staging.data_size].copy_from_slice(staging.payload());
    write_fd_words(
        reply_buffer,
        staging.data_size,
        staging.descriptor_slots(),
    )?;
    Ok(pack_reply_status(staging.data_size, staging.descriptor_count))
}

fn sys_receive(args: &mut SyscallArgs) -> KernelResult<isize> {
    let fd = args.arg1;
    let buffer_size = args.arg3;
    usermem::check_range(args.arg2, buffer_size)?;

    let me = current();
    let guard = current_process().get().descriptors().access(fd)?;
    let endpoint = guard.endpoint().ok_or(Errno::BadDescriptor)?;
    if !guard.has_permissions(DescFlags::PERM_RECEIVE) {
        return Err(Errno::NotPermitted);
    }

    // A delivery an earlier receive could not hand over is completed
    // first; a fresh sender is only popped once it has been consumed.
    if !rendezvous::receive_pending(me)? {
        let outcome = {
            let mut sched = SCHEDULER.lock();
            rendezvous::receive_message(&mut sched, endpoint, me)?
        };
        if let ReceiveOutcome::Blocked(action) = outcome {
            scheduler::apply(&SCHEDULER, action);
            rendezvous::complete_receive(me)?;
        }
    }

    let staging = me.get().staging().lock();
    if staging.data_size + 4 * staging.descriptor_count > buffer_size {
        drop(staging);
        // Nothing reached user space: give back the descriptors that were
        // just installed and keep the sender matched, so a retry with a
        // larger buffer picks this delivery up again.
        rendezvous::unwind_delivery(me);
        return Err(Errno::TooBig);
    }

    let buffer = usermem::user_slice_mut(args.arg2, buffer_size)?;
    buffer[..staging.data_size].copy_from_slice(staging.payload());
    write_fd_words(buffer, staging.data_size, staging.descriptor_slots())?;

    args.arg2 = staging.function;
    args.arg3 = staging.cookie;
    me.get().set_pending_delivery(false);
    Ok(pack_reply_status(staging.data_size, staging.descriptor_count))
}

fn sys_reply(args: &SyscallArgs) -> KernelResult<isize> {
    let (_, data_size, n_desc) = unpack_send_args(args.arg3);
    if data_size > MESSAGE_MAX_SIZE {
        return Err(Errno::TooBig);
    }
    if n_desc > MESSAGE_MAX_DESCRIPTORS {
        return Err(Errno::Invalid);
    }

    let buffer = usermem::user_slice(args.arg2, data_size + 4 * n_desc)?;
    let mut fds = [0usize; MESSAGE_MAX_DESCRIPTORS];
    read_fd_words(buffer, data_size, n_desc, &mut fds)?;

    let input = MessageInput::new(&buffer[..data_size]).with_descriptors(&fds[..n_desc]);
    let mut sched = SCHEDULER.lock();
    rendezvous::reply_to_message(&mut sched, current(), &input)?;
    Ok(0)
}

fn sys_exit_thread(args: &SyscallArgs) -> KernelResult<isize> {
    let me = current();

    // A sender parked on us never gets its reply.
    let parked = me.get().current_sender().lock().take();
    if let Some(sender) = parked {
        let mut sched = SCHEDULER.lock();
        rendezvous::abort_sender(&mut sched, sender);
    }

    me.get().set_exit_value(args.arg1);

    let joiner = me.get().joined().lock().take();
    let action = {
        let mut sched = SCHEDULER.lock();
        if let Some(joiner) = joiner {
            joiner.get().set_wake_status(Ok(0));
            sched.ready_thread(joiner);
        }
        sched.exit_current()
    };
    scheduler::apply(&SCHEDULER, action);

    // Not reached on hardware; the final switch never returns here.
    Ok(0)
}

fn sys_reboot() -> KernelResult<isize> {
    log::warn!("reboot requested");
    crate::arch::reboot();
}

fn sys_close(args: &SyscallArgs) -> KernelResult<isize> {
    let outcome = current_process().get().descriptors().close(args.arg1)?;
    descriptor::finish_close(outcome);
    Ok(0)
}

fn sys_destroy(args: &SyscallArgs) -> KernelResult<isize> {
    let fd = args.arg1;
    {
        let guard = current_process().get().descriptors().access(fd)?;
        if !guard.is_owner() {
            return Err(Errno::NotPermitted);
        }
    }
    let outcome = current_process().get().descriptors().close(fd)?;
    descriptor::finish_close(outcome);
    Ok(0)
}

fn sys_dup(args: &SyscallArgs) -> KernelResult<isize> {
    let (_guard, target) = get_process(args.arg1, DescFlags::PERM_OPEN)?;
    descriptor::dup(
        current_process().get(),
        args.arg2,
        target.get(),
        args.arg3,
    )?;
    Ok(0)
}

fn sys_mint(args: &SyscallArgs) -> KernelResult<isize> {
    let owner_fd = args.arg1;
    let margs: MintArgs = usermem::read_user_struct(args.arg2)?;

    let perms = DescFlags::from_bits(margs.perms).ok_or(Errno::Invalid)?;
    if perms.intersects(DescFlags::OWNER | DescFlags::DESTROYED) {
        return Err(Errno::Invalid);
    }

    let (_guard, target) = get_process(margs.process_fd, DescFlags::PERM_OPEN)?;
    descriptor::mint(
        current_process().get(),
        owner_fd,
        target.get(),
        margs.fd,
        perms,
        margs.cookie,
    )?;
    Ok(0)
}

/// Alignment and range checks shared by mmap and mclone.
fn check_user_window(addr: usize, length: usize) -> KernelResult<()> {
    if addr & PAGE_MASK != 0 || length & PAGE_MASK != 0 || length == 0 {
        return Err(Errno::Invalid);
    }
    let end = addr.checked_add(length).ok_or(Errno::Invalid)?;
    if end > KLIMIT {
        return Err(Errno::Invalid);
    }
    Ok(())
}

fn sys_mmap(args: &SyscallArgs) -> KernelResult<isize> {
    let (_guard, process) = get_process(args.arg1, DescFlags::PERM_MAP)?;
    let margs: MmapArgs = usermem::read_user_struct(args.arg2)?;

    check_user_window(margs.addr, margs.length)?;
    let paddr = PhysAddr::new(margs.paddr);
    if !paddr.is_page_aligned() {
        return Err(Errno::Invalid);
    }
    let prot = Prot::from_bits(margs.prot).ok_or(Errno::Invalid)?;

    let space = process.get().addr_space().lock();
    let mut frames = PAGE_ALLOCATOR.lock();
    space.map(
        process.get().paging(),
        &mut frames,
        VirtAddr::new(margs.addr),
        margs.length,
        paddr,
        prot,
    )?;
    Ok(0)
}

fn sys_mclone(args: &SyscallArgs) -> KernelResult<isize> {
    let (_src_guard, src) = get_process(args.arg1, DescFlags::PERM_MAP)?;
    let (_dest_guard, dest) = get_process(args.arg2, DescFlags::PERM_MAP)?;
    let margs: McloneArgs = usermem::read_user_struct(args.arg3)?;

    check_user_window(margs.src_addr, margs.length)?;
    check_user_window(margs.dest_addr, margs.length)?;
    let prot = Prot::from_bits(margs.prot).ok_or(Errno::Invalid)?;

    let paging = dest.get().paging();
    let mut frames = PAGE_ALLOCATOR.lock();

    if src == dest {
        let space = dest.get().addr_space().lock();
        space.clone_from(
            paging,
            &mut frames,
            VirtAddr::new(margs.dest_addr),
            &space,
            VirtAddr::new(margs.src_addr),
            margs.length,
            prot,
        )?;
    } else {
        let dest_space = dest.get().addr_space().lock();
        let src_space = src.get().addr_space().lock();
        dest_space.clone_from(
            paging,
            &mut frames,
            VirtAddr::new(margs.dest_addr),
            &src_space,
            VirtAddr::new(margs.src_addr),
            margs.length,
            prot,
        )?;
    }
    Ok(0)
}

fn sys_create_process(args: &SyscallArgs) -> KernelResult<isize> {
    let fd = args.arg1;
    let table = current_process().get().descriptors();
    table.reserve(fd)?;

    match crate::process::create_process(crate::mm::addr_space::paging()) {
        Ok(process) => {
            table.open(fd, Descriptor::owner(ObjRef::Process(process)));
            Ok(0)
        }
        Err(errno) => {
            table.free_reservation(fd);
            Err(errno)
        }
    }
}

fn sys_start_thread(args: &SyscallArgs) -> KernelResult<isize> {
    let params: UserThreadParams = usermem::read_user_struct(args.arg2)?;
    usermem::check_range(params.entry, 1)?;
    usermem::check_range(params.stack, 1)?;

    let guard = current_process().get().descriptors().access(args.arg1)?;
    let thread = guard.thread().ok_or(Errno::BadDescriptor)?;
    if !guard.has_permissions(DescFlags::PERM_START) {
        return Err(Errno::NotPermitted);
    }

    thread.get().prepare(ThreadParams {
        entry: VirtAddr::new(params.entry),
        user_stack: VirtAddr::new(params.stack),
        arg: params.arg,
    })?;
    SCHEDULER.lock().ready_thread(thread);
    Ok(0)
}

fn sys_join_thread(args: &SyscallArgs) -> KernelResult<isize> {
    let me = current();
    let thread = join_target(me, current_process(), args.arg1, DescFlags::PERM_JOIN)?;
    wait_for_exit(me, thread)?;

    let value = thread.get().exit_value();
    object::release(ObjRef::Thread(thread));

    if args.arg2 != 0 {
        usermem::write_user_struct(args.arg2, &value)?;
    }
    Ok(0)
}

fn sys_await_thread(args: &SyscallArgs) -> KernelResult<isize> {
    let me = current();
    let thread = join_target(me, current_process(), args.arg1, DescFlags::PERM_AWAIT)?;
    wait_for_exit(me, thread)?;
    object::release(ObjRef::Thread(thread));
    Ok(0)
}

/// Resolve and pin the target of a join or await.
fn join_target(
    me: ThreadPtr,
    process: ProcessPtr,
    fd: usize,
    perm: DescFlags,
) -> KernelResult<ThreadPtr> {
    let guard = process.get().descriptors().access(fd)?;
    let thread = guard.thread().ok_or(Errno::BadDescriptor)?;
    if !guard.has_permissions(perm) {
        return Err(Errno::NotPermitted);
    }
    if thread == me {
        return Err(Errno::Deadlock);
    }

    // Keep the thread around until the exit value has been read.
    object::add_ref(ObjRef::Thread(thread));
    Ok(thread)
}

/// Block until `thread` exits. At most one waiter; a second one is turned
/// away. On failure the pin taken by [`join_target`] is dropped.
fn wait_for_exit(me: ThreadPtr, thread: ThreadPtr) -> KernelResult<()> {
    let must_block = {
        let mut joined = thread.get().joined().lock();
        if joined.is_some() {
            drop(joined);
            object::release(ObjRef::Thread(thread));
            return Err(Errno::NoSuchThread);
        }
        if thread.get().state() != ThreadState::Zombie {
            *joined = Some(me);
            true
        } else {
            false
        }
    };

    if must_block {
        me.get().clear_wake_status();
        me.get().set_state(ThreadState::Blocked);
        let action = SCHEDULER.lock().block_current();
        scheduler::apply(&SCHEDULER, action);

        if let Some(Err(errno)) = me.get().wake_status() {
            object::release(ObjRef::Thread(thread));
            return Err(errno);
        }
    }
    Ok(())
}

/// Read the descriptor words stored after a message payload.
fn read_fd_words(
    buffer: &[u8],
    data_size: usize,
    n_desc: usize,
    fds: &mut [usize; MESSAGE_MAX_DESCRIPTORS],
) -> KernelResult<()> {
    let end = data_size + 4 * n_desc;
    if end > buffer.len() {
        return Err(Errno::Invalid);
    }
    for i in 0..n_desc {
        let offset = data_size + 4 * i;
        let word = u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap());
        fds[i] = word as usize;
    }
    Ok(())
}

/// Write descriptor words after a delivered payload.
fn write_fd_words(buffer: &mut [u8], data_size: usize, fds: &[u32]) -> KernelResult<()> {
    let end = data_size + 4 * fds.len();
    if end > buffer.len() {
        return Err(Errno::TooBig);
    }
    for (i, &fd) in fds.iter().enumerate() {
        let offset = data_size + 4 * i;
        buffer[offset..offset + 4].copy_from_slice(&fd.to_le_bytes());
    }
    Ok(())
}
