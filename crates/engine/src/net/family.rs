use super::replica::{FamilyTreeId, NetObjectId};

/// The archetype-derived hierarchy of one composite networked object, rooted
/// at its ancestor. Members are stored in depth-first pre-order and MUST be
/// added in that order; removal just clears the slot so sibling order is
/// preserved for receivers.
#[derive(Debug, Clone)]
pub struct FamilyTree {
    id: FamilyTreeId,
    ancestor_create_context: u64,
    ancestor_replica_type: u64,
    replicas: Vec<Option<NetObjectId>>,
}

impl FamilyTree {
    pub fn new(id: FamilyTreeId, ancestor_create_context: u64, ancestor_replica_type: u64) -> Self {
        Self {
            id,
            ancestor_create_context,
            ancestor_replica_type,
            replicas: Vec::new(),
        }
    }

    pub fn id(&self) -> FamilyTreeId {
        self.id
    }

    pub fn ancestor_create_context(&self) -> u64 {
        self.ancestor_create_context
    }

    pub fn ancestor_replica_type(&self) -> u64 {
        self.ancestor_replica_type
    }

    /// Adds the next member in depth-first pre-order. Returns false if the id
    /// is already present.
    pub fn add(&mut self, id: NetObjectId) -> bool {
        if self.replicas.iter().any(|slot| *slot == Some(id)) {
            return false;
        }
        self.replicas.push(Some(id));
        true
    }

    /// Marks a member absent. Members may be removed in any order.
    pub fn remove(&mut self, id: NetObjectId) -> bool {
        for slot in &mut self.replicas {
            if *slot == Some(id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    pub fn ancestor(&self) -> Option<NetObjectId> {
        self.replicas.first().copied().flatten()
    }

    /// All members, ancestor first, absent members as `None`.
    pub fn replicas(&self) -> &[Option<NetObjectId>] {
        &self.replicas
    }

    pub fn contains(&self, id: NetObjectId) -> bool {
        self.replicas.iter().any(|slot| *slot == Some(id))
    }

    /// True when every slot is absent; empty trees are collected by the peer.
    pub fn is_empty(&self) -> bool {
        self.replicas.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_preorder_and_collects_when_empty() {
        let mut tree = FamilyTree::new(FamilyTreeId(1), 10, 20);
        assert!(tree.add(NetObjectId(1)));
        assert!(tree.add(NetObjectId(2)));
        assert!(tree.add(NetObjectId(3)));
        assert!(!tree.add(NetObjectId(2)));
        assert_eq!(tree.ancestor(), Some(NetObjectId(1)));

        assert!(tree.remove(NetObjectId(2)));
        assert_eq!(
            tree.replicas(),
            &[Some(NetObjectId(1)), None, Some(NetObjectId(3))]
        );
        assert!(!tree.is_empty());

        tree.remove(NetObjectId(1));
        tree.remove(NetObjectId(3));
        assert!(tree.is_empty());
        assert_eq!(tree.ancestor(), None);
    }
}
