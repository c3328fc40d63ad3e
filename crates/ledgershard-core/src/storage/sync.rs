//! Blockchain-wide read/write lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The blockchain's global lock.
///
/// Block processing holds the write lock while pushing or popping blocks.
/// The shard engine takes it only to snapshot the main database and to fix
/// the archive height, so normal block processing continues during the long
/// copy and index phases.
#[derive(Default)]
pub struct GlobalSync {
    lock: RwLock<()>,
}

impl GlobalSync {
    /// Create a new, unlocked instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the shared lock.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Acquire the exclusive lock.
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    /// Try to acquire the exclusive lock without blocking.
    pub fn try_write_lock(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.lock.try_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_excludes_readers() {
        let sync = GlobalSync::new();
        let guard = sync.read_lock();
        assert!(sync.try_write_lock().is_none());
        drop(guard);
        assert!(sync.try_write_lock().is_some());
    }
}
