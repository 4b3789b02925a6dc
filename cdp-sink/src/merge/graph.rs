//! In-memory toMerge / noMerge graph
//!
//! Edges are symmetric and kept as adjacency sets. A pair is never in both
//! relations: adding a noMerge edge removes the toMerge edge, and a toMerge
//! edge is refused while a noMerge edge exists.

use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use crate::db::merge_edges::EdgeKind;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeGraph {
    to_merge: HashMap<Uuid, HashSet<Uuid>>,
    no_merge: HashMap<Uuid, HashSet<Uuid>>,
}

fn link(map: &mut HashMap<Uuid, HashSet<Uuid>>, a: Uuid, b: Uuid) -> bool {
    let added = map.entry(a).or_default().insert(b);
    map.entry(b).or_default().insert(a);
    added
}

fn unlink(map: &mut HashMap<Uuid, HashSet<Uuid>>, a: Uuid, b: Uuid) {
    if let Some(set) = map.get_mut(&a) {
        set.remove(&b);
    }
    if let Some(set) = map.get_mut(&b) {
        set.remove(&a);
    }
}

fn linked(map: &HashMap<Uuid, HashSet<Uuid>>, a: Uuid, b: Uuid) -> bool {
    map.get(&a).map(|set| set.contains(&b)).unwrap_or(false)
}

fn sorted(map: &HashMap<Uuid, HashSet<Uuid>>, a: Uuid) -> Vec<Uuid> {
    let set: BTreeSet<Uuid> = map.get(&a).into_iter().flatten().copied().collect();
    set.into_iter().collect()
}

impl MergeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored edge rows; a pair present in both relations keeps only noMerge
    pub fn from_edges(edges: &[(Uuid, Uuid, EdgeKind)]) -> Self {
        let mut graph = Self::new();
        for (a, b, _) in edges.iter().filter(|e| e.2 == EdgeKind::NoMerge) {
            graph.add_to_no_merge(*a, *b);
        }
        for (a, b, _) in edges.iter().filter(|e| e.2 == EdgeKind::ToMerge) {
            graph.add_to_merge(*a, *b);
        }
        graph
    }

    /// Suggest merging `a` and `b`
    ///
    /// Returns `false` without changing anything for a self-edge or when the
    /// pair is marked noMerge.
    pub fn add_to_merge(&mut self, a: Uuid, b: Uuid) -> bool {
        if a == b || self.is_no_merge(a, b) {
            return false;
        }
        link(&mut self.to_merge, a, b);
        true
    }

    /// Mark `a` and `b` as never to be merged, dropping any suggestion
    pub fn add_to_no_merge(&mut self, a: Uuid, b: Uuid) -> bool {
        if a == b {
            return false;
        }
        unlink(&mut self.to_merge, a, b);
        link(&mut self.no_merge, a, b)
    }

    pub fn remove_to_merge(&mut self, a: Uuid, b: Uuid) {
        unlink(&mut self.to_merge, a, b);
    }

    pub fn is_to_merge(&self, a: Uuid, b: Uuid) -> bool {
        linked(&self.to_merge, a, b)
    }

    pub fn is_no_merge(&self, a: Uuid, b: Uuid) -> bool {
        linked(&self.no_merge, a, b)
    }

    pub fn to_merge(&self, member: Uuid) -> Vec<Uuid> {
        sorted(&self.to_merge, member)
    }

    pub fn no_merge(&self, member: Uuid) -> Vec<Uuid> {
        sorted(&self.no_merge, member)
    }

    /// Move every edge of `secondary` onto `primary` and drop `secondary`
    ///
    /// noMerge edges are carried first so they win over suggestions.
    pub fn absorb(&mut self, primary: Uuid, secondary: Uuid) {
        if primary == secondary {
            return;
        }

        let no_merge = self.no_merge(secondary);
        let to_merge = self.to_merge(secondary);

        for other in &no_merge {
            unlink(&mut self.no_merge, secondary, *other);
        }
        for other in &to_merge {
            unlink(&mut self.to_merge, secondary, *other);
        }
        self.no_merge.remove(&secondary);
        self.to_merge.remove(&secondary);

        for other in no_merge.into_iter().filter(|o| *o != primary) {
            self.add_to_no_merge(primary, other);
        }
        for other in to_merge.into_iter().filter(|o| *o != primary) {
            self.add_to_merge(primary, other);
        }
    }

    /// Directed rows (both directions of every edge), sorted
    pub fn edges(&self) -> Vec<(Uuid, Uuid, EdgeKind)> {
        let mut edges = BTreeSet::new();
        for (kind, map) in [(EdgeKind::ToMerge, &self.to_merge), (EdgeKind::NoMerge, &self.no_merge)] {
            for (a, others) in map {
                for b in others {
                    edges.insert((*a, *b, kind));
                }
            }
        }
        edges.into_iter().collect()
    }
}
