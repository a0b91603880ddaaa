//! Upgrade-or-no-op handles for closures posted across threads.
//!
//! State that outlives no one in particular is held in an [`OwnedHandle`];
//! closures posted to a task runner capture a [`WeakHandle`] and upgrade it
//! when they run, observing `None` if the owner died in the meantime. Raw
//! owning references never cross threads.
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub struct OwnedHandle<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> OwnedHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap()
    }
}

pub struct WeakHandle<T> {
    inner: Weak<Mutex<T>>,
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakHandle<T> {
    /// Runs `f` against the target if it is still alive.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let strong = self.inner.upgrade()?;
        let mut guard = strong.lock().unwrap();
        Some(f(&mut guard))
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_while_owner_lives() {
        let owner = OwnedHandle::new(41);
        let weak = owner.downgrade();
        assert_eq!(weak.with(|v| *v + 1), Some(42));
    }

    #[test]
    fn no_ops_after_owner_drops() {
        let owner = OwnedHandle::new(String::from("gone"));
        let weak = owner.downgrade();
        drop(owner);
        assert!(!weak.is_alive());
        assert_eq!(weak.with(|v| v.clone()), None);
    }
}
