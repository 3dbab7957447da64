//! Integer-keyed registry for objects referenced from outside their owner.
//!
//! An engine only ever holds a [`Handle`]. The table owns the value, so the
//! value stays alive until the external owner explicitly releases it with
//! [`HandleTable::remove`].
//!
//! # Key Allocation
//!
//! Keys come from a monotonically increasing `u64` counter starting at 1 and
//! are never recycled. A stale handle can therefore only miss, never alias a
//! newer object.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Opaque key into a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type Result<T> = std::result::Result<T, HandleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// Key is absent: never issued, or already removed.
    #[error("handle {0} not found")]
    NotFound(Handle),

    /// The key space is used up.
    #[error("handle space exhausted")]
    Exhausted,
}

/// Single-owner handle table.
#[derive(Debug)]
pub struct HandleTable<T> {
    entries: AHashMap<Handle, T>,
    next: u64,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: AHashMap::new(),
            next: 1,
        }
    }

    /// Store `value` under a fresh key.
    pub fn insert(&mut self, value: T) -> Result<Handle> {
        self.insert_with(|_| value)
    }

    /// Store a value that needs to know its own key.
    pub fn insert_with(&mut self, make: impl FnOnce(Handle) -> T) -> Result<Handle> {
        let handle = self.allocate()?;
        self.entries.insert(handle, make(handle));
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.entries.get(&handle).ok_or(HandleError::NotFound(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        self.entries
            .get_mut(&handle)
            .ok_or(HandleError::NotFound(handle))
    }

    /// Release a handle, returning the value. Removing twice is an error.
    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        self.entries
            .remove(&handle)
            .ok_or(HandleError::NotFound(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.entries.iter().map(|(h, v)| (*h, v))
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.entries.keys().copied().collect()
    }

    fn allocate(&mut self) -> Result<Handle> {
        if self.next == u64::MAX {
            return Err(HandleError::Exhausted);
        }
        let handle = Handle(self.next);
        self.next += 1;
        Ok(handle)
    }
}

/// Lock-guarded handle table shared across threads.
///
/// Used for the few registries read outside a shard thread, e.g. proof
/// signers looked up from the blocking pool. Lookups clone the value out so
/// the lock is never held across user code.
pub struct SharedHandleTable<T> {
    inner: Arc<Mutex<HandleTable<T>>>,
}

impl<T> Clone for SharedHandleTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SharedHandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedHandleTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandleTable::new())),
        }
    }

    pub fn insert(&self, value: T) -> Result<Handle> {
        self.inner.lock().insert(value)
    }

    pub fn remove(&self, handle: Handle) -> Result<T> {
        self.inner.lock().remove(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.lock().contains(handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<T: Clone> SharedHandleTable<T> {
    pub fn get(&self, handle: Handle) -> Result<T> {
        self.inner.lock().get(handle).cloned()
    }
}
