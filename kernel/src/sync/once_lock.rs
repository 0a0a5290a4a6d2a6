//! Write-once global state.
//!
//! `static mut` is off the table; globals that need heap-allocated contents
//! (window lists, mount tables) are initialized exactly once through
//! [`OnceLock`], after which shared access is safe.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written exactly once.
///
/// The stored value is heap-allocated and leaked, so `get()` can hand out
/// `&'static` references for the lifetime of the kernel.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was produced by `set()` from
            // `Box::into_raw` and is never freed, so it stays valid for the
            // 'static lifetime. Acquire pairs with the Release in `set()`.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns the value back if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost the race; reclaim our allocation and hand the value
                // back to the caller.
                // SAFETY: `ptr` came from `Box::into_raw` above and was not
                // published, so we still own it exclusively.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`OnceLock`] with closure-style accessors, for subsystem singletons.
pub struct GlobalState<T> {
    cell: OnceLock<T>,
}

impl<T: 'static> GlobalState<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Initialize the global. Fails if called twice.
    pub fn init(&self, value: T) -> Result<(), T> {
        self.cell.set(value)
    }

    /// Run `f` against the global, or return `None` before init.
    pub fn with<R>(&self, f: impl FnOnce(&'static T) -> R) -> Option<R> {
        self.cell.get().map(f)
    }

    /// True once `init` has run.
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: 'static> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());
        cell.set(7u32).unwrap();
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn second_set_returns_value() {
        let cell = OnceLock::new();
        cell.set(1u32).unwrap();
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn global_state_with() {
        let state: GlobalState<u32> = GlobalState::new();
        assert_eq!(state.with(|v| *v), None);
        state.init(9).ok();
        assert_eq!(state.with(|v| *v), Some(9));
        assert!(state.is_initialized());
    }
}
