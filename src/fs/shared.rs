use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use super::FlashFs;
use crate::mem::ex_flash::FlashDevice;

/// A [`FlashFs`] that several tasks can reach through a shared reference.
///
/// Every operation runs inside `lock`, so the read-modify-write sequences
/// of the engine never interleave. Pick `NoopRawMutex` for a single
/// executor, `CriticalSectionRawMutex` when interrupts or other cores
/// touch the store too.
pub struct SharedFs<M: RawMutex, D> {
    inner: Mutex<M, RefCell<FlashFs<D>>>,
}

impl<M: RawMutex, D: FlashDevice> SharedFs<M, D> {
    pub fn new(fs: FlashFs<D>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(fs)),
        }
    }

    /// Run `f` with exclusive access to the store.
    ///
    /// Calling `lock` again from inside `f` panics.
    pub fn lock<R>(&self, f: impl FnOnce(&mut FlashFs<D>) -> R) -> R {
        self.inner.lock(|fs| f(&mut fs.borrow_mut()))
    }

    pub fn into_inner(self) -> FlashFs<D> {
        self.inner.into_inner().into_inner()
    }
}
