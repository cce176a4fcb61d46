//! Replication policies over locality sets.
//!
//! A policy is an opaque predicate with exactly three capabilities: decide
//! whether a locality set satisfies it (`validate`), pick a minimal
//! satisfying subset (`select_replicas`), and drive the sampled best-subset
//! search in [`crate::select`]. Policies compose: the standard
//! triple-redundancy policy is `Across(Zone, 3, One)`, and a three-data-hall
//! cluster uses `Across(DataHall, 3, Across(Zone, 2, One))`.

use std::collections::BTreeMap;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use helmsman_core::types::{Locality, LocalityScope};

use crate::locality::LocalityMap;

/// A replication predicate over locality sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationPolicy {
    /// Satisfied by any single entry.
    One,
    /// Requires `count` distinct values of `scope`, each of whose subgroups
    /// satisfies `inner`.
    Across {
        /// The locality attribute to spread across.
        scope: LocalityScope,
        /// Required number of distinct attribute values.
        count: usize,
        /// Policy each attribute subgroup must satisfy.
        inner: Box<ReplicationPolicy>,
    },
}

impl ReplicationPolicy {
    /// The standard `Across(Zone, n, One)` policy.
    pub fn across_zones(count: usize) -> Self {
        Self::Across { scope: LocalityScope::Zone, count, inner: Box::new(Self::One) }
    }

    /// Minimal number of replicas any satisfying set contains.
    pub fn min_replicas(&self) -> usize {
        match self {
            Self::One => 1,
            Self::Across { count, inner, .. } => count * inner.min_replicas(),
        }
    }

    /// True when `localities` satisfies the policy.
    pub fn validate(&self, localities: &[&Locality]) -> bool {
        match self {
            Self::One => !localities.is_empty(),
            Self::Across { scope, count, inner } => {
                let mut groups: BTreeMap<&str, Vec<&Locality>> = BTreeMap::new();
                for loc in localities {
                    // Entries without the attribute cannot contribute to the quorum.
                    if let Some(value) = loc.get(*scope) {
                        groups.entry(value).or_default().push(loc);
                    }
                }
                groups.values().filter(|group| inner.validate(group)).count() >= *count
            }
        }
    }

    /// Picks a minimal satisfying subset of `candidates`, randomizing ties.
    ///
    /// Returns indices into the map, or `None` when the policy cannot be
    /// satisfied by the candidates at all.
    pub fn select_replicas<T, R: Rng>(
        &self,
        candidates: &LocalityMap<T>,
        rng: &mut R,
    ) -> Option<Vec<usize>> {
        let indices: Vec<usize> = (0..candidates.len()).collect();
        self.select_from_indices(candidates, &indices, rng)
    }

    fn select_from_indices<T, R: Rng>(
        &self,
        candidates: &LocalityMap<T>,
        indices: &[usize],
        rng: &mut R,
    ) -> Option<Vec<usize>> {
        match self {
            Self::One => {
                let &choice = indices.iter().min_by_key(|_| rng.random::<u64>())?;
                Some(vec![choice])
            }
            Self::Across { scope, count, inner } => {
                let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
                for &i in indices {
                    let (loc, _) = candidates.get(i)?;
                    if let Some(value) = loc.get(*scope) {
                        groups.entry(value.to_string()).or_default().push(i);
                    }
                }

                let mut group_order: Vec<&Vec<usize>> = groups.values().collect();
                group_order.shuffle(rng);

                let mut chosen = Vec::new();
                let mut satisfied = 0;
                for group in group_order {
                    if satisfied == *count {
                        break;
                    }
                    if let Some(sub) = inner.select_from_indices(candidates, group, rng) {
                        chosen.extend(sub);
                        satisfied += 1;
                    }
                }

                (satisfied == *count).then_some(chosen)
            }
        }
    }
}

impl fmt::Display for ReplicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One => write!(f, "one"),
            Self::Across { scope, count, inner } => {
                write!(f, "across({scope:?},{count},{inner})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn map_of(zones: &[&str]) -> LocalityMap<usize> {
        let mut map = LocalityMap::new();
        for (i, z) in zones.iter().enumerate() {
            map.add(Locality::new(format!("p{i}").as_str()).with_zone(*z), i);
        }
        map
    }

    #[test]
    fn test_one_validates_any_nonempty() {
        let loc = Locality::new("p");
        assert!(ReplicationPolicy::One.validate(&[&loc]));
        assert!(!ReplicationPolicy::One.validate(&[]));
    }

    #[test]
    fn test_across_requires_distinct_zones() {
        let policy = ReplicationPolicy::across_zones(2);
        let a = Locality::new("p1").with_zone("z1");
        let b = Locality::new("p2").with_zone("z1");
        let c = Locality::new("p3").with_zone("z2");

        assert!(!policy.validate(&[&a, &b]));
        assert!(policy.validate(&[&a, &c]));
    }

    #[test]
    fn test_missing_attribute_does_not_count() {
        let policy = ReplicationPolicy::across_zones(2);
        let a = Locality::new("p1").with_zone("z1");
        let bare = Locality::new("p2");
        assert!(!policy.validate(&[&a, &bare]));
    }

    #[test]
    fn test_select_replicas_minimal() {
        let mut rng = StdRng::seed_from_u64(7);
        let map = map_of(&["z1", "z1", "z2", "z3"]);
        let policy = ReplicationPolicy::across_zones(3);

        let chosen = policy.select_replicas(&map, &mut rng).unwrap();
        assert_eq!(chosen.len(), 3);
        assert!(policy.validate(&map.localities_at(&chosen)));
    }

    #[test]
    fn test_select_replicas_unsatisfiable() {
        let mut rng = StdRng::seed_from_u64(7);
        let map = map_of(&["z1", "z1", "z1"]);
        let policy = ReplicationPolicy::across_zones(2);
        assert!(policy.select_replicas(&map, &mut rng).is_none());
    }

    #[test]
    fn test_nested_across() {
        let policy = ReplicationPolicy::Across {
            scope: LocalityScope::DataHall,
            count: 2,
            inner: Box::new(ReplicationPolicy::across_zones(2)),
        };

        let mut map = LocalityMap::new();
        for (i, (hall, zone)) in
            [("h1", "z1"), ("h1", "z2"), ("h2", "z3"), ("h2", "z4")].iter().enumerate()
        {
            map.add(Locality::new(format!("p{i}").as_str()).with_data_hall(*hall).with_zone(*zone), i);
        }

        assert!(policy.validate(&map.localities()));

        let mut rng = StdRng::seed_from_u64(1);
        let chosen = policy.select_replicas(&map, &mut rng).unwrap();
        assert_eq!(chosen.len(), 4);
    }

    #[test]
    fn test_min_replicas() {
        assert_eq!(ReplicationPolicy::One.min_replicas(), 1);
        assert_eq!(ReplicationPolicy::across_zones(3).min_replicas(), 3);
        let nested = ReplicationPolicy::Across {
            scope: LocalityScope::DataHall,
            count: 2,
            inner: Box::new(ReplicationPolicy::across_zones(2)),
        };
        assert_eq!(nested.min_replicas(), 4);
    }
}
