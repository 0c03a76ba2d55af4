//! Instance registry.
//!
//! The registry never owns the pointee -- it stores whatever pointer
//! [`Registry::create`] is given and hands it back from
//! [`Registry::acquire`] -- since the crate has no allocator and device
//! instances are typically owned by the host application's own storage
//! (static or stack-pinned, its own fixed-size array rather than anything
//! heap-allocated).
//!
//! [`Registry::acquire`]/[`Registry::release`] implement a
//! reference-counted instance record without a heap-allocated `Rc` control
//! block: the strong count lives directly in the slot, bumped by `acquire`
//! and dropped by `release`; [`Registry::remove`] only frees the slot (and
//! rolls its generation so stale handles are rejected) once that count
//! reaches zero.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::error::Error;

/// Opaque handle, realized as a slot index plus a generation counter so a
/// handle into a since-freed and reused slot is rejected rather than
/// silently resolving to the wrong instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle {
    index: u8,
    generation: u16,
}

struct Slot {
    ptr: Option<*mut ()>,
    generation: u16,
    refs: u32,
    removal_pending: bool,
}

impl Slot {
    const fn new() -> Self {
        Self { ptr: None, generation: 0, refs: 0, removal_pending: false }
    }
}

/// Fixed-capacity, mutex-protected device table -- a fixed array rather
/// than a linked list, since the crate has no allocator to link nodes
/// through.
pub struct Registry<M, const N: usize>
where
    M: RawMutex,
{
    slots: Mutex<M, RefCell<[Slot; N]>>,
}

// Safety: the pointers stored are opaque to the registry and never
// dereferenced by it; callers are responsible for synchronizing access to
// the pointee themselves, the same as with any other shared handle.
unsafe impl<M: RawMutex, const N: usize> Send for Registry<M, N> {}
unsafe impl<M: RawMutex, const N: usize> Sync for Registry<M, N> {}

impl<M, const N: usize> Registry<M, N>
where
    M: RawMutex,
{
    pub fn new() -> Self {
        Self { slots: Mutex::new(RefCell::new(core::array::from_fn(|_| Slot::new()))) }
    }

    /// Registers `ptr` under a fresh handle. Fails with
    /// [`Error::NoMemory`] once every slot is either occupied or still
    /// draining a pending removal.
    pub fn create(&self, ptr: *mut ()) -> Result<Handle, Error> {
        self.slots.lock(|cell| {
            let mut slots = cell.borrow_mut();
            for (i, slot) in slots.iter_mut().enumerate() {
                if slot.ptr.is_none() && !slot.removal_pending {
                    slot.ptr = Some(ptr);
                    slot.refs = 0;
                    return Ok(Handle { index: i as u8, generation: slot.generation });
                }
            }
            Err(Error::NoMemory)
        })
    }

    /// Resolves `handle` to its pointer and bumps the slot's in-flight
    /// count; pair with [`Self::release`] once done with it. Returns
    /// `None` for a stale or already-removed handle.
    pub fn acquire(&self, handle: Handle) -> Option<*mut ()> {
        self.slots.lock(|cell| {
            let mut slots = cell.borrow_mut();
            let slot = slots.get_mut(handle.index as usize)?;
            if slot.generation != handle.generation {
                return None;
            }
            let ptr = slot.ptr?;
            slot.refs += 1;
            Some(ptr)
        })
    }

    /// Releases one reference obtained from [`Self::acquire`]. Finishes a
    /// pending removal (clearing the slot and rolling its generation) once
    /// the count reaches zero. A mismatched or already-drained handle is a
    /// silent no-op -- this is called from callback teardown paths that
    /// can't usefully report an error.
    pub fn release(&self, handle: Handle) {
        self.slots.lock(|cell| {
            let mut slots = cell.borrow_mut();
            let Some(slot) = slots.get_mut(handle.index as usize) else { return };
            if slot.generation != handle.generation || slot.refs == 0 {
                return;
            }
            slot.refs -= 1;
            if slot.refs == 0 && slot.removal_pending {
                slot.ptr = None;
                slot.removal_pending = false;
                slot.generation = slot.generation.wrapping_add(1);
            }
        });
    }

    /// Removes `handle` from the table. If no caller currently holds an
    /// acquired reference the slot is freed immediately; otherwise the
    /// pointer is cleared right away (so no further `acquire` can succeed)
    /// and the slot itself isn't recycled until the last reference is
    /// [`Self::release`]d -- handles are not reused until every callback
    /// still referencing them has drained.
    pub fn remove(&self, handle: Handle) -> Result<(), Error> {
        self.slots.lock(|cell| {
            let mut slots = cell.borrow_mut();
            let slot = slots.get_mut(handle.index as usize).ok_or(Error::NotFound)?;
            if slot.generation != handle.generation || slot.ptr.is_none() {
                return Err(Error::NotFound);
            }
            slot.ptr = None;
            if slot.refs == 0 {
                slot.generation = slot.generation.wrapping_add(1);
            } else {
                slot.removal_pending = true;
            }
            Ok(())
        })
    }

    /// Existence check that doesn't affect the reference count.
    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.lock(|cell| {
            let slots = cell.borrow();
            slots
                .get(handle.index as usize)
                .is_some_and(|slot| slot.generation == handle.generation && slot.ptr.is_some())
        })
    }
}

impl<M, const N: usize> Default for Registry<M, N>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    fn registry() -> Registry<NoopRawMutex, 2> {
        Registry::new()
    }

    #[test]
    fn create_then_acquire_resolves_to_the_same_pointer() {
        let r = registry();
        let mut value = 7u32;
        let ptr = &mut value as *mut u32 as *mut ();
        let handle = r.create(ptr).unwrap();
        assert_eq!(r.acquire(handle), Some(ptr));
    }

    #[test]
    fn registry_is_full_once_every_slot_is_occupied() {
        let r = registry();
        let mut a = 1u32;
        let mut b = 2u32;
        let mut c = 3u32;
        r.create(&mut a as *mut u32 as *mut ()).unwrap();
        r.create(&mut b as *mut u32 as *mut ()).unwrap();
        let err = r.create(&mut c as *mut u32 as *mut ()).unwrap_err();
        assert_eq!(err, Error::NoMemory);
    }

    #[test]
    fn remove_with_no_outstanding_references_frees_the_slot_immediately() {
        let r = registry();
        let mut value = 1u32;
        let handle = r.create(&mut value as *mut u32 as *mut ()).unwrap();
        r.remove(handle).unwrap();
        assert!(!r.contains(handle));
        assert!(r.acquire(handle).is_none());
        // The slot is free again for a new instance.
        let mut other = 2u32;
        assert!(r.create(&mut other as *mut u32 as *mut ()).is_ok());
    }

    #[test]
    fn remove_with_an_in_flight_acquire_defers_until_release() {
        let r = registry();
        let mut value = 1u32;
        let handle = r.create(&mut value as *mut u32 as *mut ()).unwrap();
        let held = r.acquire(handle).unwrap();
        assert_eq!(held, &mut value as *mut u32 as *mut ());

        r.remove(handle).unwrap();
        // Removed: new lookups see it gone even though the in-flight
        // acquire above is still "holding" it.
        assert!(!r.contains(handle));
        assert!(r.acquire(handle).is_none());

        r.release(handle);
        // The generation has rolled, so the old handle is permanently
        // stale even though the slot is now free.
        let mut other = 2u32;
        let new_handle = r.create(&mut other as *mut u32 as *mut ()).unwrap();
        assert_ne!(new_handle, handle);
    }

    #[test]
    fn stale_handle_after_generation_rollover_is_rejected() {
        let r = registry();
        let mut value = 1u32;
        let handle = r.create(&mut value as *mut u32 as *mut ()).unwrap();
        r.remove(handle).unwrap();
        let mut other = 2u32;
        let new_handle = r.create(&mut other as *mut u32 as *mut ()).unwrap();
        assert_eq!(new_handle.index, handle.index);
        assert_ne!(new_handle.generation, handle.generation);
        assert!(!r.contains(handle));
        assert!(r.contains(new_handle));
    }
}
