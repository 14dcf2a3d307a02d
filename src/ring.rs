//! Consistent hashing ring with virtual nodes.
//!
//! Each peer is represented by `replicas` virtual entries on a circular
//! 32-bit hash space. A key is owned by its ring successor: the first
//! virtual entry at or after the key's hash, wrapping to the start of the
//! ring. Virtual nodes smooth the load distribution across peers, and
//! adding or removing one peer only remaps the keys whose successor
//! changes (expected fraction ~1/peer-count, not a full rehash).
//!
//! The ring itself is a plain data structure with no interior mutability;
//! on membership changes the owner builds a fresh ring from the new peer
//! snapshot and swaps it in under a lock, so readers never observe a
//! partially sorted sequence.

use crc::{Crc, CRC_32_ISO_HDLC};
use std::collections::HashMap;

/// Hash function mapping bytes onto the 32-bit ring space.
pub type HashFn = fn(&[u8]) -> u32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Default ring hash: CRC-32/IEEE checksum.
pub fn crc32_hash(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// A consistent hash ring mapping keys to owning peers.
#[derive(Clone)]
pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    /// Sorted virtual hashes. Invariant: always sorted, deduplicated, and
    /// exactly the key set of `owners`.
    keys: Vec<u32>,
    /// Virtual hash to owning peer.
    owners: HashMap<u32, String>,
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("vnodes", &self.keys.len())
            .finish()
    }
}

impl HashRing {
    /// Create an empty ring with the default CRC-32 hash.
    pub fn new(replicas: usize) -> Self {
        Self::with_hasher(replicas, crc32_hash)
    }

    /// Create an empty ring with a custom hash function.
    pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
        Self {
            replicas: replicas.max(1),
            hash,
            keys: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Build a ring directly from a peer snapshot.
    pub fn from_peers<I, S>(replicas: usize, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(replicas);
        ring.add(peers);
        ring
    }

    /// Add peers to the ring, creating `replicas` virtual entries per peer.
    ///
    /// Re-adding a peer already present overwrites its previous virtual
    /// entries instead of growing the ring. The sorted sequence is rebuilt
    /// after the batch insert.
    pub fn add<I, S>(&mut self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for peer in peers {
            let peer = peer.as_ref();
            for i in 0..self.replicas {
                let vnode = format!("{}{}", i, peer);
                let hash = (self.hash)(vnode.as_bytes());
                self.owners.insert(hash, peer.to_string());
            }
        }
        self.keys = self.owners.keys().copied().collect();
        self.keys.sort_unstable();
    }

    /// Get the peer that owns `key`, or `None` if the ring is empty.
    ///
    /// O(log(replicas * peers)) binary search for the ring successor.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let idx = self.keys.partition_point(|&k| k < hash);
        // The ring is circular: past the last entry, wrap to the first.
        let idx = if idx == self.keys.len() { 0 } else { idx };

        self.owners.get(&self.keys[idx]).map(String::as_str)
    }

    /// Whether the ring has no peers.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of virtual entries on the ring.
    pub fn vnode_count(&self) -> usize {
        self.keys.len()
    }
}
