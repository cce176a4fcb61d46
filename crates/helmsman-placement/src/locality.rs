//! Candidate sets indexed by locality.

use helmsman_core::types::Locality;

/// An ordered collection of candidates tagged with their localities.
///
/// The recruiter accumulates workers into a `LocalityMap` fitness bucket by
/// fitness bucket and asks the replication policy to pick or validate
/// subsets. Indices returned by the selection functions refer to insertion
/// order.
#[derive(Debug, Clone)]
pub struct LocalityMap<T> {
    entries: Vec<(Locality, T)>,
}

impl<T> LocalityMap<T> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Appends a candidate.
    pub fn add(&mut self, locality: Locality, value: T) {
        self.entries.push((locality, value));
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no candidates have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the candidate at `index`.
    pub fn get(&self, index: usize) -> Option<&(Locality, T)> {
        self.entries.get(index)
    }

    /// Iterates candidates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(Locality, T)> {
        self.entries.iter()
    }

    /// The localities of all candidates, in insertion order.
    pub fn localities(&self) -> Vec<&Locality> {
        self.entries.iter().map(|(l, _)| l).collect()
    }

    /// The localities of the candidates at `indices`.
    pub fn localities_at(&self, indices: &[usize]) -> Vec<&Locality> {
        indices.iter().filter_map(|&i| self.entries.get(i)).map(|(l, _)| l).collect()
    }

    /// Consumes the map, returning the values at `indices`.
    pub fn take_at(self, indices: &[usize]) -> Vec<T>
    where
        T: Clone,
    {
        indices.iter().filter_map(|&i| self.entries.get(i)).map(|(_, v)| v.clone()).collect()
    }
}

impl<T> Default for LocalityMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut map = LocalityMap::new();
        map.add(Locality::new("p1").with_zone("z1"), 1);
        map.add(Locality::new("p2").with_zone("z2"), 2);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(0).unwrap().1, 1);
        assert_eq!(map.get(1).unwrap().1, 2);
        assert_eq!(map.localities_at(&[1]).len(), 1);
    }
}
