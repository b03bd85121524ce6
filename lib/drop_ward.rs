//! Lookup counting with context-aware cleanup.
//!
//! The kernel holds a lookup count on every inode it has been handed and gives the counts back
//! through `forget`. [`DropWard`] keeps those counts and, when a key's count reaches zero, calls
//! the cleanup selected by a zero-sized tag type implementing [`StatelessDrop`]. Cleanup needs
//! the caches the key lives in, so the ward owns that context and passes it in.
//!
//! # Example
//!
//! ```ignore
//! struct Evict;
//!
//! impl StatelessDrop<Arc<InodeCache>, InodeAddr> for Evict {
//!     fn delete(inodes: &Arc<InodeCache>, addr: &InodeAddr) {
//!         inodes.evict(*addr);
//!     }
//! }
//!
//! let mut ward: DropWard<_, InodeAddr, Evict> = DropWard::new(inodes);
//! ward.inc(7);           // lookup reply -> 1
//! ward.inc(7);           // second lookup -> 2
//! ward.dec_count(&7, 2); // forget(7, 2) -> Some(0), evicts 7
//! ```

use std::marker::PhantomData;

use rustc_hash::FxHashMap;

/// Cleanup hook run when a key's count reaches zero.
///
/// Implemented on a zero-sized tag that is never constructed.
pub trait StatelessDrop<Ctx, K> {
    /// Release whatever `ctx` holds for `key`. Runs synchronously inside [`DropWard::dec`].
    fn delete(ctx: &Ctx, key: &K);
}

/// Per-key counters that run `T::delete` when a count drops to zero.
///
/// Not thread-safe; callers wrap it in a mutex. Holding that mutex while interposing a new
/// inode and bumping its count keeps a concurrent `forget` from evicting it in between.
#[derive(Debug, Clone)]
pub struct DropWard<Ctx, K, T> {
    map: FxHashMap<K, usize>,
    ctx: Ctx,
    _marker: PhantomData<T>,
}

impl<Ctx, K, T> DropWard<Ctx, K, T>
where
    K: Eq + std::hash::Hash,
    T: StatelessDrop<Ctx, K>,
{
    const _ASSERT_ZST: () = assert!(size_of::<T>() == 0, "T must be zero-sized");

    /// A ward whose cleanup receives `ctx`.
    pub fn new(ctx: Ctx) -> Self {
        Self {
            map: FxHashMap::default(),
            ctx,
            _marker: PhantomData,
        }
    }

    /// Add one reference to `key`. Returns the new count.
    pub fn inc(&mut self, key: K) -> usize {
        *self
            .map
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1)
    }

    fn dec_by(&mut self, key: &K, by: usize) -> Option<usize> {
        let curr = *self.map.get(key)?;
        let new_count = curr.saturating_sub(by);
        if new_count == 0 {
            // Removed before cleanup so a panicking `delete` cannot leave a stuck count.
            self.map.remove(key);
            T::delete(&self.ctx, key);
        } else if let Some(slot) = self.map.get_mut(key) {
            *slot = new_count;
        }
        Some(new_count)
    }

    /// Drop one reference. Returns `None` for an untracked key.
    pub fn dec(&mut self, key: &K) -> Option<usize> {
        self.dec_by(key, 1)
    }

    /// Drop `count` references at once, as `forget` does.
    pub fn dec_count(&mut self, key: &K, count: usize) -> Option<usize> {
        self.dec_by(key, count)
    }

    /// Current count of `key`, zero when untracked.
    #[must_use]
    pub fn count(&self, key: &K) -> usize {
        self.map.get(key).copied().unwrap_or(0)
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
