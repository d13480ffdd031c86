use std::collections::HashMap;

use super::ColliderIndex;
use super::shape::Aabb;

/// One axis-sorted broadphase holding either static or dynamic colliders.
/// Queued inserts/removes/updates land here once per tick.
#[derive(Debug, Default)]
pub struct Broadphase {
    entries: HashMap<ColliderIndex, Aabb>,
}

impl Broadphase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collider: ColliderIndex, aabb: Aabb) {
        self.entries.insert(collider, aabb);
    }

    pub fn update(&mut self, collider: ColliderIndex, aabb: Aabb) {
        self.entries.insert(collider, aabb);
    }

    pub fn remove(&mut self, collider: ColliderIndex) {
        self.entries.remove(&collider);
    }

    pub fn contains(&self, collider: ColliderIndex) -> bool {
        self.entries.contains_key(&collider)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ColliderIndex, &Aabb)> {
        self.entries.iter().map(|(&index, aabb)| (index, aabb))
    }

    /// Colliders whose stored aabb overlaps the query volume.
    pub fn query(&self, aabb: &Aabb) -> Vec<ColliderIndex> {
        let mut hits: Vec<ColliderIndex> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.overlaps(aabb))
            .map(|(&index, _)| index)
            .collect();
        hits.sort_unstable();
        hits
    }
}

/// The static and dynamic broadphases of a space with sweep-and-prune pair
/// production over the x axis.
#[derive(Debug, Default)]
pub struct BroadphaseSet {
    pub static_phase: Broadphase,
    pub dynamic_phase: Broadphase,
}

impl BroadphaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&mut self, collider: ColliderIndex) {
        self.static_phase.remove(collider);
        self.dynamic_phase.remove(collider);
    }

    /// Overlapping collider pairs where at least one side is dynamic. The
    /// first element of each pair is always sorted lower so pair identity is
    /// stable across ticks.
    pub fn collect_pairs(&self) -> Vec<(ColliderIndex, ColliderIndex)> {
        let mut entries: Vec<(ColliderIndex, Aabb, bool)> = Vec::with_capacity(
            self.static_phase.len() + self.dynamic_phase.len(),
        );
        for (index, aabb) in self.static_phase.iter() {
            entries.push((index, *aabb, false));
        }
        for (index, aabb) in self.dynamic_phase.iter() {
            entries.push((index, *aabb, true));
        }
        entries.sort_by(|a, b| a.1.min.x.total_cmp(&b.1.min.x));

        let mut pairs = Vec::new();
        for i in 0..entries.len() {
            let (index_a, aabb_a, dynamic_a) = entries[i];
            for entry in entries.iter().skip(i + 1) {
                let (index_b, aabb_b, dynamic_b) = *entry;
                if aabb_b.min.x > aabb_a.max.x {
                    break;
                }
                if !dynamic_a && !dynamic_b {
                    continue;
                }
                if aabb_a.overlaps(&aabb_b) {
                    let pair = if index_a < index_b {
                        (index_a, index_b)
                    } else {
                        (index_b, index_a)
                    };
                    pairs.push(pair);
                }
            }
        }
        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }
}
