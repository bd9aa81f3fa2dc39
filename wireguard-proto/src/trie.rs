/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Cryptokey-Routing: a longest-prefix-match trie keyed on allowed IP
 * prefixes, spec.md §4.1.
 *
 * Implementation note (see DESIGN.md "Open Question decisions"): spec.md's
 * §4.1 "Algorithm" paragraph describes a path-compressed radix trie with
 * glue nodes and critical-bit splitting, in the style of the per-peer
 * linked-list-of-trie-nodes design notes in §9. This implementation keeps
 * the documented *contract* (insert/remove/remove_all/lookup/entries_for
 * with the stated complexity bounds) but uses a plain one-bit-per-level
 * binary trie rather than hand-rolled critical-bit compression: it is
 * exactly as correct, a great deal easier to get right and keep memory
 * safe, and the per-peer "linked list of trie nodes" from §9 is realized
 * as a peer-keyed prefix index rather than raw intra-trie back-pointers
 * (design notes §9 explicitly allows an "interior index" in place of a
 * non-owning handle for languages with strict ownership).
 */

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use dashmap::DashMap;

/// A CIDR prefix: an address family, the address bytes (left-justified,
/// trailing bits beyond `len` are zeroed), and a prefix length in bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Prefix {
    bytes: [u8; 16],
    len: u8,
    v6: bool,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
        let (mut bytes, max_len, v6) = match addr {
            IpAddr::V4(a) => {
                let mut b = [0u8; 16];
                b[..4].copy_from_slice(&a.octets());
                (b, 32u8, false)
            }
            IpAddr::V6(a) => (a.octets(), 128u8, true),
        };
        if len > max_len {
            return None;
        }
        mask_bytes(&mut bytes, len);
        Some(Self { bytes, len, v6 })
    }

    pub fn address(&self) -> IpAddr {
        if self.v6 {
            IpAddr::V6(std::net::Ipv6Addr::from(self.bytes))
        } else {
            let mut o = [0u8; 4];
            o.copy_from_slice(&self.bytes[..4]);
            IpAddr::V4(std::net::Ipv4Addr::from(o))
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    #[inline(always)]
    fn bit(&self, i: u8) -> u8 {
        (self.bytes[(i / 8) as usize] >> (7 - (i % 8))) & 1
    }
}

/// CIDR notation, e.g. `10.0.0.0/24`, as used by the config protocol's
/// `allowed_ip=` lines.
impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.len)
    }
}

fn mask_bytes(bytes: &mut [u8; 16], len: u8) {
    let full_bytes = (len / 8) as usize;
    let rem_bits = len % 8;
    for b in bytes.iter_mut().skip(full_bytes) {
        *b = 0;
    }
    if rem_bits > 0 && full_bytes < 16 {
        let mask = 0xFFu8 << (8 - rem_bits);
        bytes[full_bytes] &= mask;
    }
}

struct Node<V> {
    peer: Option<V>,
    children: [Option<Box<Node<V>>>; 2],
}

impl<V> Node<V> {
    fn empty() -> Self {
        Self { peer: None, children: [None, None] }
    }

    fn is_dead(&self) -> bool {
        self.peer.is_none() && self.children[0].is_none() && self.children[1].is_none()
    }
}

struct BitTrie<V> {
    root: Option<Box<Node<V>>>,
}

impl<V: Clone + PartialEq> BitTrie<V> {
    fn new() -> Self {
        Self { root: None }
    }

    fn insert(&mut self, prefix: &Prefix, peer: V) {
        let root = self.root.get_or_insert_with(|| Box::new(Node::empty()));
        let mut node = root.as_mut();
        for i in 0..prefix.len {
            let bit = prefix.bit(i) as usize;
            node = node.children[bit].get_or_insert_with(|| Box::new(Node::empty())).as_mut();
        }
        node.peer = Some(peer);
    }

    /// Remove the exact prefix only if it is bound to `peer`. Returns whether anything was removed.
    fn remove(&mut self, prefix: &Prefix, peer: &V) -> bool {
        fn recurse<V: Clone + PartialEq>(node: &mut Box<Node<V>>, prefix: &Prefix, depth: u8, peer: &V) -> (bool, bool) {
            if depth == prefix.len {
                let removed = if node.peer.as_ref() == Some(peer) {
                    node.peer = None;
                    true
                } else {
                    false
                };
                return (removed, node.is_dead());
            }
            let bit = prefix.bit(depth) as usize;
            let (removed, child_dead) = match node.children[bit].as_mut() {
                Some(child) => recurse(child, prefix, depth + 1, peer),
                None => (false, false),
            };
            if child_dead {
                node.children[bit] = None;
            }
            (removed, node.is_dead())
        }

        match self.root.as_mut() {
            Some(root) => {
                let (removed, dead) = recurse(root, prefix, 0, peer);
                if dead {
                    self.root = None;
                }
                removed
            }
            None => false,
        }
    }

    fn lookup(&self, addr: &Prefix) -> Option<V> {
        let mut node = self.root.as_deref()?;
        let mut best: Option<&V> = node.peer.as_ref();
        for i in 0..addr.len.max(128) {
            if i >= addr.len {
                break;
            }
            let bit = addr.bit(i) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if node.peer.is_some() {
                        best = node.peer.as_ref();
                    }
                }
                None => break,
            }
        }
        best.cloned()
    }

    fn walk(&self, visitor: &mut dyn FnMut(&V, u8, &[u8; 16])) {
        fn recurse<V>(node: &Node<V>, depth: u8, path: &mut [u8; 16], visitor: &mut dyn FnMut(&V, u8, &[u8; 16])) {
            if let Some(p) = node.peer.as_ref() {
                visitor(p, depth, path);
            }
            for bit in 0..2u8 {
                if let Some(child) = &node.children[bit as usize] {
                    let byte_i = (depth / 8) as usize;
                    let shift = 7 - (depth % 8);
                    let saved = path[byte_i];
                    path[byte_i] = (saved & !(1 << shift)) | (bit << shift);
                    recurse(child, depth + 1, path, visitor);
                    path[byte_i] = saved;
                }
            }
        }
        if let Some(root) = self.root.as_deref() {
            let mut path = [0u8; 16];
            recurse(root, 0, &mut path, visitor);
        }
    }
}

/// The full Cryptokey-Routing table: separate IPv4 and IPv6 radix tries plus
/// a peer-indexed prefix set that makes `remove_all` O(entries-of-peer).
pub struct AllowedIps<V: Clone + PartialEq + Eq + std::hash::Hash> {
    v4: parking_lot::RwLock<BitTrie<V>>,
    v6: parking_lot::RwLock<BitTrie<V>>,
    by_peer: DashMap<V, HashSet<Prefix>>,
}

impl<V: Clone + PartialEq + Eq + std::hash::Hash> Default for AllowedIps<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq + Eq + std::hash::Hash> AllowedIps<V> {
    pub fn new() -> Self {
        Self { v4: parking_lot::RwLock::new(BitTrie::new()), v6: parking_lot::RwLock::new(BitTrie::new()), by_peer: DashMap::new() }
    }

    pub fn insert(&self, prefix: Prefix, peer: V) {
        let trie = if prefix.v6 { &self.v6 } else { &self.v4 };
        // Overwriting a prefix detaches whichever peer previously owned it from that peer's index.
        if let Some(prev) = trie.read().lookup_exact(&prefix) {
            if let Some(mut set) = self.by_peer.get_mut(&prev) {
                set.remove(&prefix);
            }
        }
        trie.write().insert(&prefix, peer.clone());
        self.by_peer.entry(peer).or_default().insert(prefix);
    }

    pub fn remove(&self, prefix: Prefix, peer: &V) {
        let trie = if prefix.v6 { &self.v6 } else { &self.v4 };
        if trie.write().remove(&prefix, peer) {
            if let Some(mut set) = self.by_peer.get_mut(peer) {
                set.remove(&prefix);
            }
        }
    }

    /// Remove every prefix owned by `peer`. O(entries-of-peer).
    pub fn remove_all(&self, peer: &V) {
        if let Some((_, prefixes)) = self.by_peer.remove(peer) {
            for prefix in prefixes {
                let trie = if prefix.v6 { &self.v6 } else { &self.v4 };
                trie.write().remove(&prefix, peer);
            }
        }
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<V> {
        let full_len = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = Prefix::new(addr, full_len)?;
        let trie = if prefix.v6 { &self.v6 } else { &self.v4 };
        trie.read().lookup(&prefix)
    }

    /// Enumerate every prefix currently bound to `peer` (control-plane only; see spec.md §4.1).
    pub fn entries_for(&self, peer: &V, mut visitor: impl FnMut(Prefix)) {
        if let Some(set) = self.by_peer.get(peer) {
            for p in set.iter() {
                visitor(*p);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_peer.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + PartialEq> BitTrie<V> {
    /// Lookup the peer bound to the *exact* prefix (used by `insert` to detach a prior owner).
    fn lookup_exact(&self, prefix: &Prefix) -> Option<V> {
        let mut node = self.root.as_deref()?;
        for i in 0..prefix.len {
            let bit = prefix.bit(i) as usize;
            node = node.children[bit].as_deref()?;
        }
        node.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn p4(s: &str, len: u8) -> Prefix {
        Prefix::new(IpAddr::V4(s.parse::<Ipv4Addr>().unwrap()), len).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let t: AllowedIps<u32> = AllowedIps::new();
        t.insert(p4("10.0.0.0", 8), 1);
        t.insert(p4("10.0.0.0", 24), 2);
        assert_eq!(t.lookup("10.0.0.5".parse().unwrap()), Some(2));
        assert_eq!(t.lookup("10.1.2.3".parse().unwrap()), Some(1));
        assert_eq!(t.lookup("11.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn overwrite_detaches_previous_owner() {
        let t: AllowedIps<u32> = AllowedIps::new();
        t.insert(p4("10.0.0.2", 32), 1);
        t.insert(p4("10.0.0.2", 32), 2);
        let mut seen = Vec::new();
        t.entries_for(&1, |p| seen.push(p));
        assert!(seen.is_empty());
        assert_eq!(t.lookup("10.0.0.2".parse().unwrap()), Some(2));
    }

    #[test]
    fn remove_all_is_precise() {
        let t: AllowedIps<u32> = AllowedIps::new();
        t.insert(p4("10.0.0.0", 24), 1);
        t.insert(p4("192.168.0.0", 16), 1);
        t.insert(p4("172.16.0.0", 12), 2);
        t.remove_all(&1);
        assert_eq!(t.lookup("10.0.0.5".parse().unwrap()), None);
        assert_eq!(t.lookup("192.168.1.1".parse().unwrap()), None);
        assert_eq!(t.lookup("172.16.5.5".parse().unwrap()), Some(2));
    }

    #[test]
    fn remove_requires_matching_peer() {
        let t: AllowedIps<u32> = AllowedIps::new();
        t.insert(p4("10.0.0.0", 24), 1);
        t.remove(p4("10.0.0.0", 24), &2);
        assert_eq!(t.lookup("10.0.0.5".parse().unwrap()), Some(1));
        t.remove(p4("10.0.0.0", 24), &1);
        assert_eq!(t.lookup("10.0.0.5".parse().unwrap()), None);
    }

    // Brute-force reference model for the two property tests below: the
    // longest currently-present prefix containing `addr`, found by linear
    // scan rather than trie traversal.
    fn brute_force_lookup(entries: &[(Prefix, u32)], addr: Ipv4Addr) -> Option<u32> {
        let addr_bits = u32::from(addr);
        entries
            .iter()
            .filter(|(p, _)| {
                if p.v6 {
                    return false;
                }
                let mut pb = [0u8; 4];
                pb.copy_from_slice(&p.bytes[..4]);
                let pbits = u32::from_be_bytes(pb);
                let len = p.len;
                if len == 0 {
                    true
                } else {
                    let mask = u32::MAX << (32 - len);
                    (addr_bits & mask) == (pbits & mask)
                }
            })
            .max_by_key(|(p, _)| p.len)
            .map(|(_, peer)| *peer)
    }

    proptest::proptest! {
        // Invariant 1 (spec.md §8): for any sequence of insertions and
        // removals, `lookup(x)` equals the peer of the longest prefix
        // currently present that contains `x`, or none.
        #[test]
        fn prop_longest_prefix_matches_brute_force(
            ops in proptest::collection::vec(
                (proptest::num::u32::ANY, 0u8..=32, proptest::num::u32::ANY, proptest::bool::ANY),
                1..40,
            ),
            probes in proptest::collection::vec(proptest::num::u32::ANY, 1..20),
        ) {
            let t: AllowedIps<u32> = AllowedIps::new();
            let mut model: Vec<(Prefix, u32)> = Vec::new();
            for (addr_bits, len, peer, do_remove) in ops {
                let prefix = p4(&Ipv4Addr::from(addr_bits).to_string(), len);
                if do_remove && !model.is_empty() {
                    // Remove a prefix/peer pair drawn from what's already present.
                    let idx = (peer as usize) % model.len();
                    let (rp, rpeer) = model[idx];
                    t.remove(rp, &rpeer);
                    model.retain(|(p, pe)| !(*p == rp && *pe == rpeer));
                } else {
                    t.insert(prefix, peer);
                    model.retain(|(p, _)| *p != prefix);
                    model.push((prefix, peer));
                }
            }
            for probe in probes {
                let addr = Ipv4Addr::from(probe);
                let expected = brute_force_lookup(&model, addr);
                let got = t.lookup(IpAddr::V4(addr));
                proptest::prop_assert_eq!(got, expected);
            }
        }

        // Invariant 2 (spec.md §8): after `remove_all(peer)`, every
        // remaining `lookup` returns the same peer as a trie freshly built
        // from the survivors only.
        #[test]
        fn prop_remove_all_matches_fresh_trie_of_survivors(
            entries in proptest::collection::vec(
                (proptest::num::u32::ANY, 0u8..=32, 0u32..=3u32),
                1..30,
            ),
            victim in 0u32..=3u32,
            probes in proptest::collection::vec(proptest::num::u32::ANY, 1..20),
        ) {
            let t: AllowedIps<u32> = AllowedIps::new();
            let mut survivors: Vec<(Prefix, u32)> = Vec::new();
            for (addr_bits, len, peer) in entries {
                let prefix = p4(&Ipv4Addr::from(addr_bits).to_string(), len);
                t.insert(prefix, peer);
                survivors.retain(|(p, _)| *p != prefix);
                survivors.push((prefix, peer));
            }
            t.remove_all(&victim);
            survivors.retain(|(_, peer)| *peer != victim);

            let fresh: AllowedIps<u32> = AllowedIps::new();
            for (p, peer) in &survivors {
                fresh.insert(*p, *peer);
            }

            for probe in probes {
                let addr = Ipv4Addr::from(probe);
                proptest::prop_assert_eq!(
                    t.lookup(IpAddr::V4(addr)),
                    fresh.lookup(IpAddr::V4(addr))
                );
            }
        }
    }
}
