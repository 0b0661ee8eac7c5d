//! `MerkleTree` and `ORMapMerkleTree` for efficient delta synchronization.
//!
//! Both trees use a prefix trie structure keyed by hex digits of the FNV-1a hash
//! of entry keys. The trie depth (default 3) determines bucket granularity.
//! Replicas compare root hashes to detect any divergence; a future bucket-diff
//! protocol could walk down to the differing buckets instead of exchanging
//! every key, but today's sync protocol just recomputes state vectors directly
//! from per-key timestamps and uses these trees only as a cheap "are we equal"
//! check.

use std::collections::HashMap;

use crate::hash::{combine_hashes, fnv1a_hash};

const DEFAULT_DEPTH: u32 = 3;

/// One bucket in the prefix trie: an aggregate hash of everything routed into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MerkleNode {
    pub hash: u32,
}

fn bucket_path(key: &str, depth: u32) -> Vec<u8> {
    let hash = fnv1a_hash(key);
    let hex = format!("{hash:08x}");
    hex.bytes()
        .take(depth as usize)
        .map(|b| (b as char).to_digit(16).unwrap_or(0) as u8)
        .collect()
}

/// Prefix-trie Merkle structure for single-valued (LWW) map entries.
///
/// Each key maps to exactly one current hash; setting a key recomputes its
/// bucket's aggregate from the full set of keys currently routed there, so
/// two replicas with identical data always compute identical root hashes
/// regardless of insertion order.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    depth: u32,
    buckets: HashMap<Vec<u8>, MerkleNode>,
    /// key -> (bucket path, per-key hash), so a key's prior contribution can be removed.
    entries: HashMap<String, (Vec<u8>, u32)>,
}

impl MerkleTree {
    /// Creates an empty tree with the given trie depth.
    #[must_use]
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            buckets: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Creates an empty tree using the default depth (3 hex digits = 4096 buckets).
    #[must_use]
    pub fn default_depth() -> Self {
        Self::new(DEFAULT_DEPTH)
    }

    /// Inserts or updates a key with a content hash (typically derived from the
    /// key's current record timestamp, so any change to the record moves the hash).
    pub fn update(&mut self, key: &str, item_hash: u32) {
        self.remove(key);
        let path = bucket_path(key, self.depth);
        self.entries.insert(key.to_string(), (path.clone(), item_hash));
        self.recompute_bucket(&path);
    }

    /// Removes a key from the tree, if present.
    pub fn remove(&mut self, key: &str) {
        let Some((path, _)) = self.entries.remove(key) else {
            return;
        };
        self.recompute_bucket(&path);
    }

    fn recompute_bucket(&mut self, path: &[u8]) {
        let mut hashes: Vec<u32> = self
            .entries
            .values()
            .filter(|(p, _)| p == path)
            .map(|(_, h)| *h)
            .collect();
        hashes.sort_unstable();

        if hashes.is_empty() {
            self.buckets.remove(path);
        } else {
            self.buckets.insert(
                path.to_vec(),
                MerkleNode {
                    hash: combine_hashes(&hashes),
                },
            );
        }
    }

    /// Root hash of the whole tree: the combination of every bucket's hash,
    /// in canonical (sorted-path) order. An empty tree has root hash 0.
    #[must_use]
    pub fn get_root_hash(&self) -> u32 {
        if self.buckets.is_empty() {
            return 0;
        }
        let mut paths: Vec<&Vec<u8>> = self.buckets.keys().collect();
        paths.sort();
        let hashes: Vec<u32> = paths.iter().map(|p| self.buckets[*p].hash).collect();
        combine_hashes(&hashes)
    }

    /// Number of distinct keys tracked by the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree has no tracked keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Same trie structure, specialized for `ORMap`-style entries where a single
/// key's aggregate hash is recomputed by the caller from all of its currently
/// live tagged records.
#[derive(Debug, Clone)]
pub struct ORMapMerkleTree {
    depth: u32,
    buckets: HashMap<Vec<u8>, MerkleNode>,
    entries: HashMap<String, (Vec<u8>, u32)>,
}

impl ORMapMerkleTree {
    /// Creates an empty tree with the given trie depth.
    #[must_use]
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            buckets: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Creates an empty tree using the default depth.
    #[must_use]
    pub fn default_depth() -> Self {
        Self::new(DEFAULT_DEPTH)
    }

    /// Sets the aggregate hash for `key`, replacing whatever was there before.
    pub fn update(&mut self, key: &str, entry_hash: u32) {
        self.remove(key);
        let path = bucket_path(key, self.depth);
        self.entries.insert(key.to_string(), (path.clone(), entry_hash));
        self.recompute_bucket(&path);
    }

    /// Removes a key from the tree entirely (called when its last live record is gone).
    pub fn remove(&mut self, key: &str) {
        let Some((path, _)) = self.entries.remove(key) else {
            return;
        };
        self.recompute_bucket(&path);
    }

    fn recompute_bucket(&mut self, path: &[u8]) {
        let mut hashes: Vec<u32> = self
            .entries
            .values()
            .filter(|(p, _)| p == path)
            .map(|(_, h)| *h)
            .collect();
        hashes.sort_unstable();

        if hashes.is_empty() {
            self.buckets.remove(path);
        } else {
            self.buckets.insert(
                path.to_vec(),
                MerkleNode {
                    hash: combine_hashes(&hashes),
                },
            );
        }
    }

    /// Root hash of the whole tree. An empty tree has root hash 0.
    #[must_use]
    pub fn get_root_hash(&self) -> u32 {
        if self.buckets.is_empty() {
            return 0;
        }
        let mut paths: Vec<&Vec<u8>> = self.buckets.keys().collect();
        paths.sort();
        let hashes: Vec<u32> = paths.iter().map(|p| self.buckets[*p].hash).collect();
        combine_hashes(&hashes)
    }
}
