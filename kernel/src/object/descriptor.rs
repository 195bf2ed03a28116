//! Per-process descriptor tables
//!
//! A descriptor names a kernel object with permission bits and an opaque
//! cookie the kernel never interprets. Slots are a sum type: unused,
//! reserved (claimed ahead of a populating operation so a capacity check
//! and the operation cannot race), or open. At most one descriptor holds
//! the owner flag for a given object; closing it marks the object
//! destroyed, while the storage itself lives until the last reference is
//! gone.

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Errno, KernelResult};
use crate::object::{self, ObjRef, ObjectKind};
use crate::process::Process;

/// Descriptor-table capacity
///
/// Deliberately small; a process that needs more receives additional
/// tables from a user-space supervisor, not from the kernel.
pub const DESCRIPTOR_TABLE_SIZE: usize = 12;

bitflags! {
    /// Descriptor flags: per-type permission bits in the low word,
    /// reference flags numbered downward from bit 31 so the two ranges
    /// can never collide.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u32 {
        const PERM_SEND          = 1 << 0;
        const PERM_RECEIVE       = 1 << 1;
        const PERM_START         = 1 << 2;
        const PERM_JOIN          = 1 << 3;
        const PERM_AWAIT         = 1 << 4;
        const PERM_CREATE_THREAD = 1 << 5;
        const PERM_OPEN          = 1 << 6;
        const PERM_MAP           = 1 << 7;

        const OWNER     = 1 << 29;
        const DESTROYED = 1 << 30;
    }
}

/// The full permission mask of an object type
pub fn all_permissions(kind: ObjectKind) -> DescFlags {
    match kind {
        ObjectKind::Endpoint => DescFlags::PERM_SEND | DescFlags::PERM_RECEIVE,
        ObjectKind::Thread => {
            DescFlags::PERM_START | DescFlags::PERM_JOIN | DescFlags::PERM_AWAIT
        }
        ObjectKind::Process => {
            DescFlags::PERM_CREATE_THREAD | DescFlags::PERM_OPEN | DescFlags::PERM_MAP
        }
    }
}

/// An open descriptor's contents
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub object: ObjRef,
    pub flags: DescFlags,
    pub cookie: usize,
}

impl Descriptor {
    /// A fresh owner descriptor carrying the type's full permissions
    pub fn owner(object: ObjRef) -> Self {
        Self {
            object,
            flags: DescFlags::OWNER | all_permissions(object.kind()),
            cookie: 0,
        }
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.flags.contains(DescFlags::OWNER)
    }

    #[inline]
    pub fn has_permissions(&self, perms: DescFlags) -> bool {
        self.flags.contains(perms)
    }

    pub fn endpoint(&self) -> Option<crate::ipc::endpoint::EndpointPtr> {
        self.object.as_endpoint()
    }

    pub fn thread(&self) -> Option<crate::process::thread::ThreadPtr> {
        self.object.as_thread()
    }

    pub fn process(&self) -> Option<crate::process::ProcessPtr> {
        self.object.as_process()
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Unused,
    Reserved,
    Open(Descriptor),
}

/// Transient access to an open descriptor
///
/// Holds one reference on the object so it cannot disappear while the
/// caller works with it; dropped on guard drop.
pub struct AccessGuard {
    desc: Descriptor,
}

impl core::ops::Deref for AccessGuard {
    type Target = Descriptor;

    fn deref(&self) -> &Descriptor {
        &self.desc
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        object::release(self.desc.object);
    }
}

/// What a close left behind
pub struct CloseOutcome {
    pub object: ObjRef,
    /// Set when this was the owner descriptor and the close marked the
    /// object destroyed
    pub marked_destroyed: bool,
}

/// A per-process descriptor table
pub struct DescriptorTable<const N: usize = DESCRIPTOR_TABLE_SIZE> {
    slots: Mutex<[Slot; N]>,
}

impl<const N: usize> DescriptorTable<N> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([Slot::Unused; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn check_fd(fd: usize) -> KernelResult<()> {
        if fd >= N {
            return Err(Errno::BadDescriptor);
        }
        Ok(())
    }

    /// Atomically claim an unused slot ahead of the operation that will
    /// populate it.
    pub fn reserve(&self, fd: usize) -> KernelResult<()> {
        Self::check_fd(fd)?;
        let mut slots = self.slots.lock();
        match slots[fd] {
            Slot::Unused => {
                slots[fd] = Slot::Reserved;
                Ok(())
            }
            _ => Err(Errno::BadDescriptor),
        }
    }

    /// Claim the lowest-numbered unused slot; `EAGAIN` when the table is
    /// full.
    pub fn reserve_any(&self) -> KernelResult<usize> {
        let mut slots = self.slots.lock();
        for (fd, slot) in slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Unused) {
                *slot = Slot::Reserved;
                return Ok(fd);
            }
        }
        Err(Errno::Again)
    }

    /// Give back a reservation that will not be used after all.
    pub fn free_reservation(&self, fd: usize) {
        let mut slots = self.slots.lock();
        debug_assert!(matches!(slots[fd], Slot::Reserved));
        slots[fd] = Slot::Unused;
    }

    /// Publish a descriptor into a reserved slot, taking a reference on
    /// the object.
    pub fn open(&self, fd: usize, desc: Descriptor) {
        object::add_ref(desc.object);
        let mut slots = self.slots.lock();
        debug_assert!(matches!(slots[fd], Slot::Reserved), "open without reservation");
        slots[fd] = Slot::Open(desc);
    }

    /// Read an open descriptor, pinning its object for the guard's
    /// lifetime.
    pub fn access(&self, fd: usize) -> KernelResult<AccessGuard> {
        Self::check_fd(fd)?;
        let desc = {
            let slots = self.slots.lock();
            match slots[fd] {
                Slot::Open(desc) => desc,
                _ => return Err(Errno::BadDescriptor),
            }
        };

        if desc.object.header().is_destroyed() {
            return Err(Errno::BadDescriptor);
        }

        object::add_ref(desc.object);
        Ok(AccessGuard { desc })
    }

    /// Drop a descriptor. The returned outcome still holds the reference
    /// the slot had; the caller runs destroy hooks and then releases it.
    pub fn close(&self, fd: usize) -> KernelResult<CloseOutcome> {
        Self::check_fd(fd)?;
        let desc = {
            let mut slots = self.slots.lock();
            match slots[fd] {
                Slot::Open(desc) => {
                    slots[fd] = Slot::Unused;
                    desc
                }
                _ => return Err(Errno::BadDescriptor),
            }
        };

        let header = desc.object.header();
        let marked_destroyed = desc.is_owner() && !header.is_destroyed();
        if marked_destroyed {
            header.mark_destroyed();
        }

        Ok(CloseOutcome {
            object: desc.object,
            marked_destroyed,
        })
    }

    /// Close every open slot, running destroy hooks and releasing the
    /// references. Used at process teardown.
    pub fn close_all(&self) {
        for fd in 0..N {
            if let Ok(outcome) = self.close(fd) {
                finish_close(outcome);
            }
        }
    }

    /// Whether the slot currently holds an open descriptor
    pub fn is_open(&self, fd: usize) -> bool {
        matches!(self.slots.lock()[fd], Slot::Open(_))
    }

    /// Whether the slot is unused
    pub fn is_unused(&self, fd: usize) -> bool {
        matches!(self.slots.lock()[fd], Slot::Unused)
    }

    /// The descriptor in a slot, if open. Does not pin the object.
    pub fn peek(&self, fd: usize) -> Option<Descriptor> {
        match self.slots.lock().get(fd) {
            Some(Slot::Open(desc)) => Some(*desc),
            _ => None,
        }
    }
}

impl<const N: usize> Default for DescriptorTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the destroy hook of a close outcome and release the reference.
pub fn finish_close(outcome: CloseOutcome) {
    if outcome.marked_destroyed {
        object::on_destroyed(outcome.object);
    }
    object::release(outcome.object);
}

/// Create a new descriptor in `target` pointing at the object behind an
/// owner descriptor of `current`, with reduced permissions and a distinct
/// cookie.
pub fn mint(
    current: &Process,
    owner_fd: usize,
    target: &Process,
    target_fd: usize,
    perms: DescFlags,
    cookie: usize,
) -> KernelResult<()> {
    let guard = current.descriptors().access(owner_fd)?;

    let mask = all_permissions(guard.object.kind());
    if !mask.contains(perms & !(DescFlags::OWNER | DescFlags::DESTROYED)) {
        return Err(Errno::Invalid);
    }
    // An empty permission set is tolerated for process objects only.
    if perms.is_empty() && guard.object.kind() != ObjectKind::Process {
        return Err(Errno::Invalid);
    }
    if !guard.is_owner() {
        return Err(Errno::NotPermitted);
    }

    target.descriptors().reserve(target_fd)?;
    target.descriptors().open(
        target_fd,
        Descriptor {
            object: guard.object,
            flags: (perms & mask) | (guard.flags & DescFlags::DESTROYED),
            cookie,
        },
    );
    Ok(())
}

/// Copy a non-owner descriptor of `current` into `target`.
pub fn dup(
    current: &Process,
    src_fd: usize,
    target: &Process,
    dest_fd: usize,
) -> KernelResult<()> {
    let guard = current.descriptors().access(src_fd)?;

    // Ownership is not duplicable.
    if guard.is_owner() {
        return Err(Errno::BadDescriptor);
    }

    target.descriptors().reserve(dest_fd)?;
    target.descriptors().open(
        dest_fd,
        Descriptor {
            object: guard.object,
            flags: guard.flags,
            cookie: guard.cookie,
        },
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::ipc::endpoint::create_endpoint;
    use crate::test_env;

    fn endpoint_ref() -> ObjRef {
        ObjRef::Endpoint(create_endpoint().unwrap())
    }

    #[test]
    fn slot_is_open_iff_it_holds_an_object() {
        test_env::init();
        let table: DescriptorTable = DescriptorTable::new();
        let object = endpoint_ref();

        assert!(table.is_unused(3));
        assert!(!table.is_open(3));
        assert!(table.access(3).is_err());

        table.reserve(3).unwrap();
        assert!(!table.is_unused(3));
        assert!(!table.is_open(3));
        assert!(table.access(3).is_err());

        table.open(3, Descriptor::owner(object));
        assert!(table.is_open(3));
        assert!(table.access(3).is_ok());

        let outcome = table.close(3).unwrap();
        assert!(table.is_unused(3));
        object::release(outcome.object);
    }

    #[test]
    fn out_of_range_fd_is_ebadf() {
        test_env::init();
        let table: DescriptorTable = DescriptorTable::new();
        assert_eq!(table.reserve(DESCRIPTOR_TABLE_SIZE), Err(Errno::BadDescriptor));
        assert!(table.access(DESCRIPTOR_TABLE_SIZE).is_err());
    }

    #[test]
    fn reference_count_tracks_descriptors_and_pins() {
        test_env::init();
        let endpoint = create_endpoint().unwrap();
        let object = ObjRef::Endpoint(endpoint);
        // Pin for the duration of the test so assertions can run after
        // the last descriptor closes.
        object::add_ref(object);
        assert_eq!(endpoint.get().header().ref_count(), 1);

        let a: DescriptorTable = DescriptorTable::new();
        let b: DescriptorTable = DescriptorTable::new();

        a.reserve(0).unwrap();
        a.open(0, Descriptor::owner(object));
        assert_eq!(endpoint.get().header().ref_count(), 2);

        b.reserve(0).unwrap();
        b.open(
            0,
            Descriptor {
                object,
                flags: DescFlags::PERM_SEND,
                cookie: 9,
            },
        );
        assert_eq!(endpoint.get().header().ref_count(), 3);

        {
            let _guard = b.access(0).unwrap();
            assert_eq!(endpoint.get().header().ref_count(), 4);
        }
        assert_eq!(endpoint.get().header().ref_count(), 3);

        object::release(a.close(0).unwrap().object);
        object::release(b.close(0).unwrap().object);
        assert_eq!(endpoint.get().header().ref_count(), 1);
    }

    #[test]
    fn owner_close_marks_the_object_destroyed() {
        test_env::init();
        let endpoint = create_endpoint().unwrap();
        let object = ObjRef::Endpoint(endpoint);
        object::add_ref(object);

        let a: DescriptorTable = DescriptorTable::new();
        let b: DescriptorTable = DescriptorTable::new();
        a.reserve(0).unwrap();
        a.open(0, Descriptor::owner(object));
        b.reserve(0).unwrap();
        b.open(
            0,
            Descriptor {
                object,
                flags: DescFlags::PERM_SEND,
                cookie: 0,
            },
        );

        // Closing the non-owner first destroys nothing.
        let outcome = b.close(0).unwrap();
        assert!(!outcome.marked_destroyed);
        object::release(outcome.object);
        assert!(!endpoint.get().header().is_destroyed());

        let outcome = a.close(0).unwrap();
        assert!(outcome.marked_destroyed);
        assert!(endpoint.get().header().is_destroyed());
        finish_close(outcome);

        // A destroyed object is no longer reachable through descriptors.
        b.reserve(0).unwrap();
        b.open(
            0,
            Descriptor {
                object,
                flags: DescFlags::PERM_SEND,
                cookie: 0,
            },
        );
        assert!(matches!(b.access(0), Err(Errno::BadDescriptor)));
        object::release(b.close(0).unwrap().object);
    }

    #[test]
    fn reserve_any_fills_in_order_then_fails() {
        test_env::init();
        let table: DescriptorTable = DescriptorTable::new();
        for expected in 0..DESCRIPTOR_TABLE_SIZE {
            assert_eq!(table.reserve_any().unwrap(), expected);
        }
        assert_eq!(table.reserve_any(), Err(Errno::Again));

        table.free_reservation(5);
        assert_eq!(table.reserve_any().unwrap(), 5);
    }

    #[test]
    fn capacity_is_configurable() {
        test_env::init();
        let small: DescriptorTable<12> = DescriptorTable::new();
        let large: DescriptorTable<64> = DescriptorTable::new();

        assert_eq!(small.capacity(), 12);
        assert_eq!(large.capacity(), 64);
        assert!(small.reserve(12).is_err());
        assert!(large.reserve(12).is_ok());
        assert!(large.reserve(63).is_ok());
        assert!(large.reserve(64).is_err());

        for fd in 0..64 {
            if fd != 12 && fd != 63 {
                large.reserve(fd).unwrap();
            }
        }
        assert_eq!(large.reserve_any(), Err(Errno::Again));
    }

    #[test]
    fn mint_respects_the_permission_mask() {
        let env = test_env::init();
        let a = test_env::spawn_process(env);
        let b = test_env::spawn_process(env);

        let endpoint = endpoint_ref();
        let owner_fd = a.get().descriptors().reserve_any().unwrap();
        a.get().descriptors().open(owner_fd, Descriptor::owner(endpoint));

        // Subset is fine; the minted descriptor is not an owner.
        mint(a.get(), owner_fd, b.get(), 4, DescFlags::PERM_SEND, 0x77).unwrap();
        let minted = b.get().descriptors().peek(4).unwrap();
        assert!(minted.has_permissions(DescFlags::PERM_SEND));
        assert!(!minted.has_permissions(DescFlags::PERM_RECEIVE));
        assert!(!minted.is_owner());
        assert_eq!(minted.cookie, 0x77);

        // Bits outside the endpoint mask are rejected.
        assert_eq!(
            mint(a.get(), owner_fd, b.get(), 5, DescFlags::PERM_START, 0).unwrap_err(),
            Errno::Invalid
        );

        // Zero permissions are rejected for non-process objects.
        assert_eq!(
            mint(a.get(), owner_fd, b.get(), 5, DescFlags::empty(), 0).unwrap_err(),
            Errno::Invalid
        );
    }

    #[test]
    fn mint_requires_ownership() {
        let env = test_env::init();
        let a = test_env::spawn_process(env);
        let b = test_env::spawn_process(env);

        let fd = a.get().descriptors().reserve_any().unwrap();
        a.get().descriptors().open(
            fd,
            Descriptor {
                object: endpoint_ref(),
                flags: DescFlags::PERM_SEND | DescFlags::PERM_RECEIVE,
                cookie: 0,
            },
        );

        assert_eq!(
            mint(a.get(), fd, b.get(), 0, DescFlags::PERM_SEND, 0).unwrap_err(),
            Errno::NotPermitted
        );
    }

    #[test]
    fn mint_zero_permissions_allowed_for_processes() {
        let env = test_env::init();
        let a = test_env::spawn_process(env);
        let b = test_env::spawn_process(env);
        let c = test_env::spawn_process(env);

        let fd = a.get().descriptors().reserve_any().unwrap();
        a.get()
            .descriptors()
            .open(fd, Descriptor::owner(ObjRef::Process(c)));

        mint(a.get(), fd, b.get(), 7, DescFlags::empty(), 1).unwrap();
        assert!(b.get().descriptors().is_open(7));
    }

    #[test]
    fn dup_copies_only_non_owner_descriptors() {
        let env = test_env::init();
        let a = test_env::spawn_process(env);
        let b = test_env::spawn_process(env);

        let endpoint = endpoint_ref();
        let owner_fd = a.get().descriptors().reserve_any().unwrap();
        a.get().descriptors().open(owner_fd, Descriptor::owner(endpoint));

        let plain_fd = a.get().descriptors().reserve_any().unwrap();
        a.get().descriptors().open(
            plain_fd,
            Descriptor {
                object: endpoint,
                flags: DescFlags::PERM_SEND,
                cookie: 0xab,
            },
        );

        assert_eq!(
            dup(a.get(), owner_fd, b.get(), 0).unwrap_err(),
            Errno::BadDescriptor
        );

        dup(a.get(), plain_fd, b.get(), 0).unwrap();
        let copied = b.get().descriptors().peek(0).unwrap();
        assert_eq!(copied.cookie, 0xab);
        assert!(copied.has_permissions(DescFlags::PERM_SEND));
        assert!(!copied.is_owner());
    }

    #[test]
    fn randomised_slot_operations_hold_invariants() {
        test_env::init();
        let endpoint = create_endpoint().unwrap();
        let object = ObjRef::Endpoint(endpoint);
        object::add_ref(object);

        let table: DescriptorTable = DescriptorTable::new();
        let mut open_count = 0u32;

        // xorshift32; fixed seed keeps the sequence reproducible.
        let mut state = 0x9e37_79b9u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        for _ in 0..2000 {
            let fd = (next() as usize) % DESCRIPTOR_TABLE_SIZE;
            match next() % 3 {
                0 => {
                    if let Ok(free_fd) = table.reserve_any() {
                        table.open(
                            free_fd,
                            Descriptor {
                                object,
                                flags: DescFlags::PERM_SEND,
                                cookie: free_fd,
                            },
                        );
                        open_count += 1;
                    }
                }
                1 => {
                    if let Ok(outcome) = table.close(fd) {
                        object::release(outcome.object);
                        open_count -= 1;
                    }
                }
                _ => {
                    let _ = table.access(fd);
                }
            }

            // A slot is open exactly when it holds an object, and the
            // reference count tracks open descriptors plus our pin.
            for slot in 0..DESCRIPTOR_TABLE_SIZE {
                assert_eq!(table.is_open(slot), table.peek(slot).is_some());
            }
            assert_eq!(endpoint.get().header().ref_count(), open_count + 1);
        }
    }

    #[test]
    fn permission_masks_per_type() {
        assert_eq!(
            all_permissions(ObjectKind::Endpoint),
            DescFlags::PERM_SEND | DescFlags::PERM_RECEIVE
        );
        assert_eq!(
            all_permissions(ObjectKind::Thread),
            DescFlags::PERM_START | DescFlags::PERM_JOIN | DescFlags::PERM_AWAIT
        );
        assert_eq!(
            all_permissions(ObjectKind::Process),
            DescFlags::PERM_CREATE_THREAD | DescFlags::PERM_OPEN | DescFlags::PERM_MAP
        );
    }
}
