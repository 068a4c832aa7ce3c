//! Greedy leader-count balancing
//!
//! Load is the number of groups led. Sources are visited from most to least
//! loaded; for each, the least loaded eligible destination among the
//! replicas of the groups it leads is chosen. A move is proposed only if the
//! destination would still be strictly below the source afterwards, so the
//! sum of squared loads falls with every move and repeated application
//! always reaches a fixpoint.

use super::BalancingStrategy;
use crate::index::AssignmentIndex;
use crate::types::{GroupId, NodeId, Reassignment, Shard};
use std::collections::{BTreeMap, BTreeSet};

/// Balance leader counts across individual shards
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyBalancedShards;

/// Balance leader counts across nodes, all shards of a node together
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyBalancedNodes;

impl BalancingStrategy for GreedyBalancedShards {
    fn name(&self) -> &'static str {
        "greedy_balanced_shards"
    }

    fn compute_reassignment(
        &self,
        index: &AssignmentIndex,
        muted_groups: &BTreeSet<GroupId>,
        muted_nodes: &BTreeSet<NodeId>,
    ) -> Option<Reassignment> {
        greedy_move(index, muted_groups, muted_nodes, |shard| shard)
    }

    fn imbalance(&self, index: &AssignmentIndex, muted_nodes: &BTreeSet<NodeId>) -> usize {
        spread(&bucket_loads(&eligible_loads(index, muted_nodes), |shard| shard))
    }
}

impl BalancingStrategy for GreedyBalancedNodes {
    fn name(&self) -> &'static str {
        "greedy_balanced_nodes"
    }

    fn compute_reassignment(
        &self,
        index: &AssignmentIndex,
        muted_groups: &BTreeSet<GroupId>,
        muted_nodes: &BTreeSet<NodeId>,
    ) -> Option<Reassignment> {
        greedy_move(index, muted_groups, muted_nodes, |shard| shard.node_id)
    }

    fn imbalance(&self, index: &AssignmentIndex, muted_nodes: &BTreeSet<NodeId>) -> usize {
        spread(&bucket_loads(
            &eligible_loads(index, muted_nodes),
            |shard| shard.node_id,
        ))
    }
}

/// Leader counts of shards that are not on a muted node
fn eligible_loads(
    index: &AssignmentIndex,
    muted_nodes: &BTreeSet<NodeId>,
) -> BTreeMap<Shard, usize> {
    let mut loads = index.leader_counts();
    loads.retain(|shard, _| !muted_nodes.contains(&shard.node_id));
    loads
}

fn bucket_loads<K: Ord + Copy>(
    shard_loads: &BTreeMap<Shard, usize>,
    bucket: impl Fn(Shard) -> K,
) -> BTreeMap<K, usize> {
    let mut loads = BTreeMap::new();
    for (shard, load) in shard_loads {
        *loads.entry(bucket(*shard)).or_insert(0) += load;
    }
    loads
}

fn spread<K>(loads: &BTreeMap<K, usize>) -> usize {
    let max = loads.values().max().copied().unwrap_or(0);
    let min = loads.values().min().copied().unwrap_or(0);
    max - min
}

fn greedy_move<K: Ord + Copy>(
    index: &AssignmentIndex,
    muted_groups: &BTreeSet<GroupId>,
    muted_nodes: &BTreeSet<NodeId>,
    bucket: impl Fn(Shard) -> K,
) -> Option<Reassignment> {
    let shard_loads = eligible_loads(index, muted_nodes);
    let loads = bucket_loads(&shard_loads, &bucket);

    let mut sources: Vec<(K, usize)> = loads.iter().map(|(k, l)| (*k, *l)).collect();
    sources.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    for (source, source_load) in sources {
        // dest + 1 < source cannot hold below this
        if source_load < 2 {
            break;
        }

        let mut best: Option<((usize, usize, Shard), Reassignment)> = None;
        for (group, assignment) in index.iter() {
            let Some(leader) = assignment.leader else {
                continue;
            };
            if bucket(leader) != source
                || !shard_loads.contains_key(&leader)
                || muted_groups.contains(group)
            {
                continue;
            }

            for &to in &assignment.replicas {
                if to == leader || bucket(to) == source {
                    continue;
                }
                let Some(&shard_load) = shard_loads.get(&to) else {
                    continue;
                };
                let key = (loads[&bucket(to)], shard_load, to);
                if best.as_ref().map_or(true, |(current, _)| key < *current) {
                    best = Some((
                        key,
                        Reassignment {
                            group: *group,
                            from: leader,
                            to,
                        },
                    ));
                }
            }
        }

        if let Some(((destination_load, _, _), reassignment)) = best {
            if destination_load + 1 < source_load {
                return Some(reassignment);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn everywhere(leaders: &[(i64, Shard)], shards: &[Shard]) -> AssignmentIndex {
        let mut index = AssignmentIndex::new();
        for (group, leader) in leaders {
            index.insert(GroupId(*group), shards.iter().copied(), Some(*leader));
        }
        index
    }

    fn three_nodes() -> [Shard; 3] {
        [Shard::new(1, 0), Shard::new(2, 0), Shard::new(3, 0)]
    }

    fn run_to_fixpoint(
        strategy: &dyn BalancingStrategy,
        index: &mut AssignmentIndex,
        muted_groups: &BTreeSet<GroupId>,
        muted_nodes: &BTreeSet<NodeId>,
    ) -> Vec<Reassignment> {
        let mut moves = Vec::new();
        while let Some(r) = strategy.compute_reassignment(index, muted_groups, muted_nodes) {
            assert!(index.apply(&r), "invalid move {}", r);
            moves.push(r);
            assert!(moves.len() <= 1000, "no fixpoint");
        }
        moves
    }

    #[test]
    fn test_moves_most_to_least_loaded() {
        let [a, b, c] = three_nodes();
        let index = everywhere(
            &[(1, a), (2, a), (3, a), (4, a), (5, a), (6, b)],
            &[a, b, c],
        );

        let r = GreedyBalancedShards
            .compute_reassignment(&index, &BTreeSet::new(), &BTreeSet::new())
            .unwrap();
        assert_eq!(r, Reassignment { group: GroupId(1), from: a, to: c });
    }

    #[test]
    fn test_converges_to_even_split() {
        let [a, b, c] = three_nodes();
        let mut index = everywhere(
            &[(1, a), (2, a), (3, a), (4, a), (5, a), (6, b)],
            &[a, b, c],
        );

        let moves = run_to_fixpoint(
            &GreedyBalancedShards,
            &mut index,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert_eq!(moves.len(), 3);
        assert!(index.leader_counts().values().all(|count| *count == 2));
    }

    #[test]
    fn test_muted_group_skipped() {
        let [a, b, c] = three_nodes();
        let index = everywhere(&[(1, a), (2, a), (3, a)], &[a, b, c]);
        let muted: BTreeSet<_> = [GroupId(1)].into();

        let r = GreedyBalancedShards
            .compute_reassignment(&index, &muted, &BTreeSet::new())
            .unwrap();
        assert_eq!(r.group, GroupId(2));
    }

    #[test]
    fn test_muted_node_never_destination() {
        let [a, b, c] = three_nodes();
        let mut index = everywhere(&[(1, a), (2, a), (3, a), (4, a)], &[a, b, c]);
        let muted_nodes: BTreeSet<_> = [NodeId(3)].into();

        let moves = run_to_fixpoint(
            &GreedyBalancedShards,
            &mut index,
            &BTreeSet::new(),
            &muted_nodes,
        );
        assert!(moves.iter().all(|r| r.to != c));
        assert_eq!(index.leader_counts()[&a], 2);
        assert_eq!(index.leader_counts()[&b], 2);
    }

    #[test]
    fn test_balanced_is_fixpoint() {
        let [a, b, c] = three_nodes();
        let index = everywhere(&[(1, a), (2, b), (3, c), (4, a)], &[a, b, c]);
        assert!(GreedyBalancedShards
            .compute_reassignment(&index, &BTreeSet::new(), &BTreeSet::new())
            .is_none());
        assert_eq!(GreedyBalancedShards.imbalance(&index, &BTreeSet::new()), 1);
    }

    #[test]
    fn test_replica_set_limits_moves() {
        let [a, b, c] = three_nodes();
        let mut index = AssignmentIndex::new();
        // Group 1 and 2 can only live on a or b; c holds group 3 only
        index.insert(GroupId(1), [a, b], Some(a));
        index.insert(GroupId(2), [a, b], Some(a));
        index.insert(GroupId(3), [a, c], Some(a));

        let mut moves = run_to_fixpoint(
            &GreedyBalancedShards,
            &mut index,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        moves.sort_by_key(|r| r.group);
        assert_eq!(moves.len(), 2);
        for r in &moves {
            assert!(index.get(r.group).unwrap().replicas.contains(&r.to));
        }
    }

    #[test]
    fn test_node_strategy_ignores_intra_node_moves() {
        let a0 = Shard::new(1, 0);
        let a1 = Shard::new(1, 1);
        let b0 = Shard::new(2, 0);
        let mut index = AssignmentIndex::new();
        index.insert(GroupId(1), [a0, a1, b0], Some(a0));
        index.insert(GroupId(2), [a0, a1, b0], Some(a0));
        index.insert(GroupId(3), [a0, a1, b0], Some(b0));
        index.insert(GroupId(4), [a0, a1, b0], Some(b0));

        // Per node this is 2/2, even though shard a1 leads nothing
        assert!(GreedyBalancedNodes
            .compute_reassignment(&index, &BTreeSet::new(), &BTreeSet::new())
            .is_none());
        assert!(GreedyBalancedShards
            .compute_reassignment(&index, &BTreeSet::new(), &BTreeSet::new())
            .is_some());
    }

    #[test]
    fn test_node_strategy_picks_idle_node() {
        let a0 = Shard::new(1, 0);
        let a1 = Shard::new(1, 1);
        let b0 = Shard::new(2, 0);
        let b1 = Shard::new(2, 1);
        let mut index = AssignmentIndex::new();
        for group in 1..=4 {
            let leader = if group % 2 == 0 { a0 } else { a1 };
            index.insert(GroupId(group), [a0, a1, b0, b1], Some(leader));
        }

        let mut moves = run_to_fixpoint(
            &GreedyBalancedNodes,
            &mut index,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert_eq!(moves.len(), 2);
        moves.sort_by_key(|r| r.to);
        // Spread over both shards of node 2
        assert_eq!(moves[0].to, b0);
        assert_eq!(moves[1].to, b1);
    }

    fn arb_index() -> impl Strategy<Value = AssignmentIndex> {
        (1i32..5, 1u32..3).prop_flat_map(|(nodes, per_node)| {
            let all: Vec<Shard> = (1..=nodes)
                .flat_map(|n| (0..per_node).map(move |s| Shard::new(n, s)))
                .collect();
            let width = all.len();
            prop::collection::vec(
                (
                    prop::collection::vec(any::<bool>(), width),
                    any::<prop::sample::Index>(),
                ),
                1..30,
            )
            .prop_map(move |groups| {
                let mut index = AssignmentIndex::new();
                for (i, (mask, pick)) in groups.into_iter().enumerate() {
                    let mut replicas: Vec<Shard> = all
                        .iter()
                        .zip(mask)
                        .filter(|(_, keep)| *keep)
                        .map(|(s, _)| *s)
                        .collect();
                    if replicas.is_empty() {
                        replicas.push(all[0]);
                    }
                    let leader = replicas[pick.index(replicas.len())];
                    index.insert(GroupId(i as i64), replicas, Some(leader));
                }
                index
            })
        })
    }

    proptest! {
        #[test]
        fn prop_moves_are_valid_and_respect_mutes(
            index in arb_index(),
            muted_groups in prop::collection::btree_set((0i64..30).prop_map(GroupId), 0..6),
            muted_nodes in prop::collection::btree_set((1i32..5).prop_map(NodeId), 0..2),
        ) {
            let strategies: [&dyn BalancingStrategy; 2] =
                [&GreedyBalancedShards, &GreedyBalancedNodes];
            for strategy in strategies {
                let proposed = strategy.compute_reassignment(&index, &muted_groups, &muted_nodes);
                if let Some(r) = proposed {
                    prop_assert!(index.is_valid(&r));
                    prop_assert_ne!(r.from, r.to);
                    prop_assert!(!muted_groups.contains(&r.group));
                    prop_assert!(!muted_nodes.contains(&r.from.node_id));
                    prop_assert!(!muted_nodes.contains(&r.to.node_id));
                }
            }
        }

        #[test]
        fn prop_shard_moves_strictly_improve(index in arb_index()) {
            let (no_groups, no_nodes) = (BTreeSet::new(), BTreeSet::new());
            let proposed = GreedyBalancedShards.compute_reassignment(&index, &no_groups, &no_nodes);
            if let Some(r) = proposed {
                let loads = index.leader_counts();
                prop_assert!(loads[&r.to] + 1 < loads[&r.from]);
            }
        }

        #[test]
        fn prop_reaches_fixpoint(
            mut index in arb_index(),
            muted_groups in prop::collection::btree_set((0i64..30).prop_map(GroupId), 0..6),
        ) {
            let moves = run_to_fixpoint(
                &GreedyBalancedShards,
                &mut index,
                &muted_groups,
                &BTreeSet::new(),
            );
            prop_assert!(moves.iter().all(|r| !muted_groups.contains(&r.group)));
        }

        #[test]
        fn prop_full_replication_balances_within_one(
            leaders in prop::collection::vec(0usize..4, 1..40),
        ) {
            let shards: Vec<Shard> = (1..=4).map(|n| Shard::new(n, 0)).collect();
            let mut index = AssignmentIndex::new();
            for (i, l) in leaders.iter().enumerate() {
                index.insert(GroupId(i as i64), shards.iter().copied(), Some(shards[*l]));
            }
            run_to_fixpoint(&GreedyBalancedShards, &mut index, &BTreeSet::new(), &BTreeSet::new());
            prop_assert!(GreedyBalancedShards.imbalance(&index, &BTreeSet::new()) <= 1);
        }
    }
}
