/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 32-bit session index -> (peer, handshake|keypair) lookup, spec.md §4.2.
 * Grounded on ZSSP's `SessionId`/`lookup_session` pattern in
 * examples/Ausaci-ZeroTierOne-Official/zssp/src/zssp.rs, generalized from a
 * 48-bit session id to the 32-bit WireGuard index.
 */

use dashmap::DashMap;
use rand_core::{OsRng, RngCore};

/// What a local index currently points to.
#[derive(Clone)]
pub enum IndexEntry<H: Clone, K: Clone> {
    Handshake(H),
    Keypair(K),
}

/// Maps locally-assigned 32-bit indices to in-flight handshakes or
/// established keypairs. Indices are drawn from a CSPRNG and retried on
/// collision; uniqueness across the whole device is a correctness
/// invariant because the index is leaked to the wire (spec.md §4.2).
pub struct IndexTable<H: Clone, K: Clone> {
    table: DashMap<u32, IndexEntry<H, K>>,
}

impl<H: Clone, K: Clone> Default for IndexTable<H, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone, K: Clone> IndexTable<H, K> {
    pub fn new() -> Self {
        Self { table: DashMap::new() }
    }

    /// Allocate and register a fresh, globally-unique index for `entry`.
    pub fn new_index(&self, entry: IndexEntry<H, K>) -> u32 {
        loop {
            let candidate = OsRng.next_u32();
            if candidate == 0 {
                continue;
            }
            match self.table.entry(candidate) {
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(entry);
                    return candidate;
                }
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
            }
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry<H, K>> {
        self.table.get(&index).map(|e| e.value().clone())
    }

    pub fn delete(&self, index: u32) {
        self.table.remove(&index);
    }

    /// Remap an existing index to point at a new entry, e.g. handshake -> keypair
    /// on completion (spec.md §4.4 `begin_symmetric_session`).
    pub fn swap(&self, index: u32, new_entry: IndexEntry<H, K>) {
        self.table.insert(index, new_entry);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_unique_and_lookupable() {
        let t: IndexTable<u8, u8> = IndexTable::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000u8 {
            let idx = t.new_index(IndexEntry::Handshake(i));
            assert!(seen.insert(idx), "index {} collided", idx);
        }
        assert_eq!(t.len(), 1000);
    }

    #[test]
    fn swap_remaps_entry() {
        let t: IndexTable<&str, &str> = IndexTable::new();
        let idx = t.new_index(IndexEntry::Handshake("hs"));
        t.swap(idx, IndexEntry::Keypair("kp"));
        match t.lookup(idx) {
            Some(IndexEntry::Keypair(v)) => assert_eq!(v, "kp"),
            _ => panic!("expected keypair entry"),
        }
    }

    #[test]
    fn delete_removes_entry() {
        let t: IndexTable<u8, u8> = IndexTable::new();
        let idx = t.new_index(IndexEntry::Handshake(1));
        t.delete(idx);
        assert!(t.lookup(idx).is_none());
    }
}
