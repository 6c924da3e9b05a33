//! Ordered mutexes with debug lock-order checking.
//!
//! The core uses two ranked locks per output: the volume lock and the output
//! (pipeline) lock. The legal transitions are kept as data: `VOLUME` may be
//! taken with nothing held, `OUTPUT` with at most `VOLUME` held. Violations
//! abort debug builds; release builds compile down to plain parking_lot
//! mutexes.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockLevel {
    Volume,
    Output,
}

impl LockLevel {
    const fn bit(self) -> u8 {
        match self {
            LockLevel::Volume => 0x1,
            LockLevel::Output => 0x2,
        }
    }

    /// Locks that may legally be held when acquiring this one.
    const fn allowed(self) -> u8 {
        match self {
            LockLevel::Volume => 0,
            LockLevel::Output => LockLevel::Volume.bit(),
        }
    }
}

#[cfg(debug_assertions)]
mod check {
    use super::LockLevel;
    use std::cell::Cell;

    thread_local! {
        static HELD: Cell<u8> = const { Cell::new(0) };
    }

    pub(super) fn lock(level: LockLevel) {
        HELD.with(|held| {
            let bits = held.get();
            assert!(
                bits & !level.allowed() == 0,
                "illegal audio lock transition ({bits:#x} -> {:#x})",
                bits | level.bit()
            );
            held.set(bits | level.bit());
        });
    }

    pub(super) fn unlock(level: LockLevel) {
        HELD.with(|held| {
            let bits = held.get();
            debug_assert!(bits & level.bit() != 0);
            held.set(bits & !level.bit());
        });
    }
}

#[derive(Debug)]
pub(crate) struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub(crate) fn new(level: LockLevel, value: T) -> OrderedMutex<T> {
        OrderedMutex {
            level,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        check::lock(self.level);
        OrderedGuard {
            level: self.level,
            guard: self.inner.lock(),
        }
    }
}

pub(crate) struct OrderedGuard<'a, T> {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        check::unlock(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_then_output_is_legal() {
        let volume = OrderedMutex::new(LockLevel::Volume, 0u32);
        let output = OrderedMutex::new(LockLevel::Output, 0u32);
        let _v = volume.lock();
        let _o = output.lock();
    }

    #[test]
    fn output_alone_is_legal() {
        let output = OrderedMutex::new(LockLevel::Output, ());
        let _o = output.lock();
    }

    #[test]
    fn sequential_reacquisition_is_legal() {
        let volume = OrderedMutex::new(LockLevel::Volume, ());
        drop(volume.lock());
        drop(volume.lock());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal audio lock transition")]
    fn output_then_volume_panics() {
        let volume = OrderedMutex::new(LockLevel::Volume, ());
        let output = OrderedMutex::new(LockLevel::Output, ());
        let _o = output.lock();
        let _v = volume.lock();
    }
}
