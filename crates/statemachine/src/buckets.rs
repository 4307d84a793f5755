//! Bucket-to-leader assignment.

use multibft_types::{BucketId, EpochConfig, NetworkConfig, NodeId};
use std::collections::{BTreeMap, BTreeSet};

/// Compute the bucket→leader map for an epoch.
///
/// Each bucket's tentative owner is `nodes[(bucket + epoch) % N]`, which
/// rotates leadership across epochs. A tentative owner that is not in the
/// epoch's leader set is replaced by the next leader in overflow order. All
/// correct replicas compute identical maps.
pub(crate) fn assign_buckets(
    epoch: &EpochConfig,
    network: &NetworkConfig,
) -> BTreeMap<BucketId, NodeId> {
    let leaders: BTreeSet<NodeId> = epoch.leaders.iter().copied().collect();
    let node_count = network.nodes.len() as u64;

    let mut overflow_index = 0usize;
    let mut buckets = BTreeMap::new();
    for b in 0..network.number_of_buckets {
        let tentative = network.nodes[((b + epoch.number) % node_count) as usize];
        let owner = if leaders.contains(&tentative) {
            tentative
        } else {
            let owner = epoch.leaders[overflow_index % epoch.leaders.len()];
            overflow_index += 1;
            owner
        };
        buckets.insert(BucketId(b), owner);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkConfig {
        NetworkConfig {
            nodes: vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)],
            number_of_buckets: 4,
            checkpoint_interval: 5,
            epoch_length: 500,
        }
    }

    fn epoch(number: u64, leaders: Vec<NodeId>) -> EpochConfig {
        EpochConfig {
            number,
            leaders,
            planned_expiration: 500,
        }
    }

    #[test]
    fn all_leaders_get_their_own_bucket() {
        let network = network();
        let epoch = epoch(0, network.nodes.clone());
        let buckets = assign_buckets(&epoch, &network);
        for b in 0..4 {
            assert_eq!(buckets[&BucketId(b)], NodeId(b));
        }
    }

    #[test]
    fn assignment_rotates_with_the_epoch_number() {
        let network = network();
        let buckets = assign_buckets(&epoch(1, network.nodes.clone()), &network);
        assert_eq!(buckets[&BucketId(0)], NodeId(1));
        assert_eq!(buckets[&BucketId(3)], NodeId(0));
    }

    #[test]
    fn non_leaders_overflow_to_leaders_in_order() {
        let network = network();
        // Node 0 lost leadership; its bucket falls to the first leader.
        let leaders = vec![NodeId(1), NodeId(2), NodeId(3)];
        let buckets = assign_buckets(&epoch(0, leaders), &network);
        assert_eq!(buckets[&BucketId(0)], NodeId(1));
        assert_eq!(buckets[&BucketId(1)], NodeId(1));
        assert_eq!(buckets[&BucketId(2)], NodeId(2));
        assert_eq!(buckets[&BucketId(3)], NodeId(3));
    }

    #[test]
    fn assignment_is_deterministic() {
        let network = network();
        let epoch = epoch(3, vec![NodeId(1), NodeId(3)]);
        assert_eq!(
            assign_buckets(&epoch, &network),
            assign_buckets(&epoch, &network)
        );
    }
}
