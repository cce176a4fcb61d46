//! Sampled search for the best policy-satisfying subset.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::trace;

use crate::locality::LocalityMap;
use crate::policy::ReplicationPolicy;

/// Searches for the best subset of exactly `desired` candidates that
/// satisfies `policy`.
///
/// Each of up to `generations` attempts seeds a minimal satisfying core via
/// [`ReplicationPolicy::select_replicas`] and pads it with random extra
/// candidates. Candidates are rated by drawing `rating_tests` random
/// minimum-size subsets and counting how many still satisfy the policy, so
/// the returned set degrades gracefully when members fail later.
///
/// Returns indices into `candidates`, or `None` when no attempt produced a
/// satisfying subset of the requested size.
pub fn find_best_policy_set<T, R: Rng>(
    candidates: &LocalityMap<T>,
    policy: &ReplicationPolicy,
    desired: usize,
    rating_tests: u32,
    generations: u32,
    rng: &mut R,
) -> Option<Vec<usize>> {
    if candidates.len() <= desired {
        let all: Vec<usize> = (0..candidates.len()).collect();
        return policy.validate(&candidates.localities()).then_some(all);
    }

    let mut best: Option<(u32, Vec<usize>)> = None;

    for generation in 0..generations {
        let Some(mut set) = policy.select_replicas(candidates, rng) else {
            // No satisfying core exists; more generations cannot help.
            return None;
        };
        if set.len() > desired {
            continue;
        }

        let mut rest: Vec<usize> = (0..candidates.len()).filter(|i| !set.contains(i)).collect();
        rest.shuffle(rng);
        set.extend(rest.into_iter().take(desired - set.len()));

        let score = rate_subset(candidates, policy, &set, rating_tests, rng);
        trace!(generation, score, size = set.len(), "Rated candidate policy set");

        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((score, set));
        }
    }

    best.map(|(_, set)| set)
}

/// Counts how many of `rating_tests` random minimum-size draws from `set`
/// satisfy the policy.
fn rate_subset<T, R: Rng>(
    candidates: &LocalityMap<T>,
    policy: &ReplicationPolicy,
    set: &[usize],
    rating_tests: u32,
    rng: &mut R,
) -> u32 {
    let draw = policy.min_replicas().min(set.len());
    let mut score = 0;
    let mut scratch: Vec<usize> = set.to_vec();
    for _ in 0..rating_tests {
        scratch.shuffle(rng);
        let sample = &scratch[..draw];
        if policy.validate(&candidates.localities_at(sample)) {
            score += 1;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use helmsman_core::types::Locality;

    use super::*;

    fn map_of(zones: &[&str]) -> LocalityMap<usize> {
        let mut map = LocalityMap::new();
        for (i, z) in zones.iter().enumerate() {
            map.add(Locality::new(format!("p{i}").as_str()).with_zone(*z), i);
        }
        map
    }

    #[test]
    fn test_returns_desired_size() {
        let map = map_of(&["z1", "z1", "z2", "z2", "z3", "z3"]);
        let policy = ReplicationPolicy::across_zones(3);
        let mut rng = StdRng::seed_from_u64(42);

        let set = find_best_policy_set(&map, &policy, 4, 20, 10, &mut rng).unwrap();
        assert_eq!(set.len(), 4);
        assert!(policy.validate(&map.localities_at(&set)));
    }

    #[test]
    fn test_small_candidate_set_short_circuits() {
        let map = map_of(&["z1", "z2"]);
        let policy = ReplicationPolicy::across_zones(2);
        let mut rng = StdRng::seed_from_u64(42);

        let set = find_best_policy_set(&map, &policy, 3, 20, 10, &mut rng).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_unsatisfiable_returns_none() {
        let map = map_of(&["z1", "z1", "z1", "z1"]);
        let policy = ReplicationPolicy::across_zones(2);
        let mut rng = StdRng::seed_from_u64(42);

        assert!(find_best_policy_set(&map, &policy, 3, 20, 10, &mut rng).is_none());
    }

    #[test]
    fn test_prefers_zone_diverse_sets() {
        // Four zones available; a well-rated set of three should span three
        // distinct zones rather than doubling up.
        let map = map_of(&["z1", "z1", "z1", "z2", "z3", "z4"]);
        let policy = ReplicationPolicy::across_zones(3);
        let mut rng = StdRng::seed_from_u64(42);

        let set = find_best_policy_set(&map, &policy, 3, 50, 50, &mut rng).unwrap();
        let zones: std::collections::HashSet<&str> =
            map.localities_at(&set).iter().filter_map(|l| l.zone_id.as_deref()).collect();
        assert_eq!(zones.len(), 3);
    }
}
