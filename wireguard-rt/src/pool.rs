/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * A generic object pool, grounded on `zerotier-network-hypervisor`'s
 * `PoolFactory`/`PooledBufferFactory` pattern (`util/buffer.rs`): a factory
 * knows how to create and reset objects, the pool itself is just a stack of
 * spares guarded by a lock. Acquiring returns an RAII guard that returns the
 * object to the pool on drop instead of freeing it, so the steady-state
 * data path (spec.md §7) allocates only when the pool is empty.
 */

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Knows how to create a fresh `T` and how to reset a reused one back to its
/// "just created" state before handing it out again.
pub trait PoolFactory<T>: Send + Sync {
    fn create(&self) -> T;
    fn reset(&self, obj: &mut T);
}

struct Inner<T, F: PoolFactory<T>> {
    factory: F,
    spares: Mutex<Vec<T>>,
}

/// A pool of recyclable `T`s created and reset by `F`.
pub struct Pool<T, F: PoolFactory<T>>(Arc<Inner<T, F>>);

impl<T, F: PoolFactory<T>> Clone for Pool<T, F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, F: PoolFactory<T>> Pool<T, F> {
    pub fn new(factory: F) -> Self {
        Self(Arc::new(Inner { factory, spares: Mutex::new(Vec::new()) }))
    }

    /// Take a spare if one exists, otherwise create a fresh `T`. The
    /// returned guard puts the object back in the pool when it is dropped.
    pub fn get(&self) -> Pooled<T, F> {
        let obj = self.0.spares.lock().pop().unwrap_or_else(|| self.0.factory.create());
        Pooled { pool: self.0.clone(), obj: Some(obj) }
    }

    /// Number of idle spares currently held by the pool (diagnostics only).
    pub fn spare_count(&self) -> usize {
        self.0.spares.lock().len()
    }
}

/// An object on loan from a [`Pool`]. Dereferences to `T`; returns itself to
/// the pool (after `F::reset`) when dropped instead of being deallocated.
pub struct Pooled<T, F: PoolFactory<T>> {
    pool: Arc<Inner<T, F>>,
    obj: Option<T>,
}

impl<T, F: PoolFactory<T>> Deref for Pooled<T, F> {
    type Target = T;
    fn deref(&self) -> &T {
        self.obj.as_ref().expect("pooled object taken before drop")
    }
}

impl<T, F: PoolFactory<T>> DerefMut for Pooled<T, F> {
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("pooled object taken before drop")
    }
}

impl<T, F: PoolFactory<T>> Drop for Pooled<T, F> {
    fn drop(&mut self) {
        if let Some(mut obj) = self.obj.take() {
            self.pool.factory.reset(&mut obj);
            self.pool.spares.lock().push(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PacketBuffer;

    struct BufferFactory;
    impl PoolFactory<PacketBuffer> for BufferFactory {
        fn create(&self) -> PacketBuffer {
            PacketBuffer::new()
        }
        fn reset(&self, obj: &mut PacketBuffer) {
            obj.clear();
        }
    }

    #[test]
    fn recycles_objects_instead_of_growing_unboundedly() {
        let pool = Pool::new(BufferFactory);
        assert_eq!(pool.spare_count(), 0);
        {
            let mut a = pool.get();
            a.set_len(10);
        }
        assert_eq!(pool.spare_count(), 1);
        let b = pool.get();
        assert_eq!(b.len(), 0, "reset() must have cleared the recycled buffer");
        assert_eq!(pool.spare_count(), 0);
    }
}
