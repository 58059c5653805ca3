//! Consistent-hash routing primitives.
//!
//! Executors are partitioned across the cluster by job id. Every node
//! builds the same [`HashRing`] from the same member list, so every node
//! agrees on which member owns a job without talking to the others.
//!
//! # Invariants
//!
//! - Placement is deterministic given the member set (insertion order does not matter)
//! - Removing a member only moves the keys that member owned
//! - Positions come from SHA-256, so they are stable across platforms and releases

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sha2::{Digest, Sha256};

/// Default number of virtual nodes per member.
pub const DEFAULT_VIRTUAL_NODES: u32 = 64;

/// Position of `bytes` on the ring.
pub fn ring_position(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Consistent-hash ring over members of type `N`.
///
/// Members are hashed through their `Display` form, so two nodes holding
/// equal member lists build identical rings.
#[derive(Debug, Clone)]
pub struct HashRing<N> {
    virtual_nodes: u32,
    points: BTreeMap<u64, N>,
    members: BTreeSet<N>,
}

impl<N> HashRing<N>
where
    N: Clone + Ord + fmt::Display,
{
    /// Create an empty ring.
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            points: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Build a ring from a member list.
    pub fn from_members<I>(virtual_nodes: u32, members: I) -> Self
    where
        I: IntoIterator<Item = N>,
    {
        let mut ring = Self::new(virtual_nodes);
        for member in members {
            ring.add(member);
        }
        ring
    }

    /// Add a member. Returns false if it was already present.
    pub fn add(&mut self, member: N) -> bool {
        if !self.members.insert(member.clone()) {
            return false;
        }
        for replica in 0..self.virtual_nodes {
            let position = ring_position(format!("{member}#{replica}").as_bytes());
            // On the (astronomically unlikely) collision, the smaller member wins
            // so the outcome does not depend on insertion order.
            match self.points.get(&position) {
                Some(existing) if *existing <= member => {}
                _ => {
                    self.points.insert(position, member.clone());
                }
            }
        }
        true
    }

    /// Remove a member. Returns false if it was not present.
    pub fn remove(&mut self, member: &N) -> bool {
        if !self.members.remove(member) {
            return false;
        }
        // Rebuild from the survivors so positions a collision hid are reclaimed.
        let survivors: Vec<N> = self.members.iter().cloned().collect();
        self.members.clear();
        self.points.clear();
        for survivor in survivors {
            self.add(survivor);
        }
        true
    }

    /// Member owning `key`: the first point clockwise from the key's position.
    pub fn owner(&self, key: &[u8]) -> Option<&N> {
        let position = ring_position(key);
        self.points
            .range(position..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, member)| member)
    }

    /// Convenience for keys with a textual form, such as typed ids.
    pub fn owner_of<K: fmt::Display + ?Sized>(&self, key: &K) -> Option<&N> {
        self.owner(key.to_string().as_bytes())
    }

    pub fn contains(&self, member: &N) -> bool {
        self.members.contains(member)
    }

    pub fn members(&self) -> impl Iterator<Item = &N> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    /// Short digest of the member set, for logging ring changes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.virtual_nodes.to_be_bytes());
        for member in &self.members {
            hasher.update(member.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring(members: &[&str]) -> HashRing<String> {
        HashRing::from_members(
            DEFAULT_VIRTUAL_NODES,
            members.iter().map(|m| m.to_string()),
        )
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring: HashRing<String> = HashRing::new(8);
        assert!(ring.owner(b"job_1").is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_single_member_owns_everything() {
        let ring = ring(&["node-a"]);
        for i in 0..100 {
            assert_eq!(ring.owner_of(&format!("job-{i}")).unwrap(), "node-a");
        }
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let a = ring(&["node-a", "node-b", "node-c"]);
        let b = ring(&["node-c", "node-a", "node-b"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        for i in 0..500 {
            let key = format!("job-{i}");
            assert_eq!(a.owner_of(&key), b.owner_of(&key));
        }
    }

    #[test]
    fn test_distribution_is_reasonable() {
        let ring = ring(&["node-a", "node-b", "node-c", "node-d"]);
        let mut counts = BTreeMap::new();
        for i in 0..4000 {
            let owner = ring.owner_of(&format!("job-{i}")).unwrap().clone();
            *counts.entry(owner).or_insert(0u32) += 1;
        }
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!(*count > 500, "skewed distribution: {counts:?}");
        }
    }

    #[test]
    fn test_add_and_remove_report_membership() {
        let mut ring = ring(&["node-a"]);
        assert!(!ring.add("node-a".to_string()));
        assert!(ring.add("node-b".to_string()));
        assert!(ring.remove(&"node-b".to_string()));
        assert!(!ring.remove(&"node-b".to_string()));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_fingerprint_changes_with_members() {
        assert_ne!(ring(&["node-a"]).fingerprint(), ring(&["node-a", "node-b"]).fingerprint());
    }

    proptest! {
        #[test]
        fn prop_removal_only_moves_removed_members_keys(
            keys in proptest::collection::vec("[a-z0-9]{4,12}", 1..200),
            removed in 0usize..4,
        ) {
            let names = ["node-a", "node-b", "node-c", "node-d"];
            let before = ring(&names);
            let mut after = before.clone();
            after.remove(&names[removed].to_string());

            for key in &keys {
                let old = before.owner_of(key).unwrap();
                let new = after.owner_of(key).unwrap();
                if old != names[removed] {
                    prop_assert_eq!(old, new);
                } else {
                    prop_assert_ne!(new, names[removed]);
                }
            }
        }
    }
}
