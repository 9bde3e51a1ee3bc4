//! Router placement for newly joining peers.
//!
//! Selection is a pure function of a [`LoadSnapshot`], so two calls over
//! the same snapshot return the same router. Load is computed from peer
//! router assignments across the whole server (routers are shared
//! between rooms) and aggregated per worker. Piping status of this
//! room's routers is tracked by the room as a set and carried in the
//! snapshot, not recomputed from topology.

use common::types::{RouterId, WorkerId};
use std::collections::{HashMap, HashSet};

/// One worker and the routers it currently hosts, across all rooms.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub id: WorkerId,
    /// Routers hosted by this worker, in a stable order.
    pub routers: Vec<RouterId>,
}

/// Transient placement input, recomputed per decision.
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
    /// All workers, in a stable order.
    pub workers: Vec<WorkerView>,
    /// Router assignment of every peer on the server, one entry per peer.
    pub peer_assignments: Vec<RouterId>,
    /// This room's routers.
    pub room_routers: HashSet<RouterId>,
    /// This room's routers that already had media piped into them.
    pub piped_routers: HashSet<RouterId>,
}

/// Pick the router a newly joining peer should be assigned to.
///
/// - If none or all of the room's routers are piped, piping is ignored
///   and the room router on the least-loaded worker wins.
/// - Otherwise workers are scanned in ascending load order and the first
///   piped room router on a worker below `scale_threshold` wins.
/// - If no piped router qualifies, fall back to the room router on the
///   least-loaded worker.
///
/// Ties are broken by snapshot order, making the result deterministic.
/// Returns `None` only when the room has no routers at all.
#[must_use]
pub fn select_router(snapshot: &LoadSnapshot, scale_threshold: u32) -> Option<RouterId> {
    let mut router_loads: HashMap<RouterId, u32> = HashMap::new();
    for router_id in &snapshot.peer_assignments {
        *router_loads.entry(*router_id).or_insert(0) += 1;
    }

    // Aggregate per worker; stable sort keeps snapshot order for ties.
    let mut worker_loads: Vec<(&WorkerView, u32)> = snapshot
        .workers
        .iter()
        .map(|worker| {
            let load = worker
                .routers
                .iter()
                .map(|router_id| router_loads.get(router_id).copied().unwrap_or(0))
                .sum();
            (worker, load)
        })
        .collect();
    worker_loads.sort_by_key(|(_, load)| *load);

    let least_loaded_room_router = || {
        worker_loads.iter().find_map(|(worker, _)| {
            worker
                .routers
                .iter()
                .copied()
                .find(|router_id| snapshot.room_routers.contains(router_id))
        })
    };

    let piped = snapshot.piped_routers.len();
    if piped == 0 || piped == snapshot.room_routers.len() {
        // Piping cannot discriminate; just take the least-loaded worker.
        return least_loaded_room_router();
    }

    for (worker, load) in &worker_loads {
        if *load >= scale_threshold {
            continue;
        }
        let hit = worker.routers.iter().copied().find(|router_id| {
            snapshot.room_routers.contains(router_id) && snapshot.piped_routers.contains(router_id)
        });
        if hit.is_some() {
            return hit;
        }
    }

    least_loaded_room_router()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn router() -> RouterId {
        RouterId::new()
    }

    struct Fixture {
        routers: Vec<RouterId>,
        snapshot: LoadSnapshot,
    }

    /// Two workers, one room router on each.
    fn two_worker_fixture() -> Fixture {
        let r0 = router();
        let r1 = router();
        let snapshot = LoadSnapshot {
            workers: vec![
                WorkerView {
                    id: WorkerId(1),
                    routers: vec![r0],
                },
                WorkerView {
                    id: WorkerId(2),
                    routers: vec![r1],
                },
            ],
            peer_assignments: vec![],
            room_routers: [r0, r1].into_iter().collect(),
            piped_routers: HashSet::new(),
        };
        Fixture {
            routers: vec![r0, r1],
            snapshot,
        }
    }

    #[test]
    fn test_empty_server_picks_first_worker() {
        let fixture = two_worker_fixture();
        assert_eq!(
            select_router(&fixture.snapshot, 40),
            Some(fixture.routers[0])
        );
    }

    #[test]
    fn test_selection_is_deterministic() {
        let mut fixture = two_worker_fixture();
        fixture.snapshot.peer_assignments = vec![fixture.routers[0], fixture.routers[1]];

        let first = select_router(&fixture.snapshot, 40);
        for _ in 0..10 {
            assert_eq!(select_router(&fixture.snapshot, 40), first);
        }
    }

    #[test]
    fn test_no_piped_routers_picks_least_loaded_worker() {
        let mut fixture = two_worker_fixture();
        // Worker 1 carries three peers, worker 2 one.
        fixture.snapshot.peer_assignments = vec![
            fixture.routers[0],
            fixture.routers[0],
            fixture.routers[0],
            fixture.routers[1],
        ];

        assert_eq!(
            select_router(&fixture.snapshot, 40),
            Some(fixture.routers[1])
        );
    }

    #[test]
    fn test_all_piped_ignores_piping() {
        let mut fixture = two_worker_fixture();
        fixture.snapshot.piped_routers = fixture.snapshot.room_routers.clone();
        fixture.snapshot.peer_assignments = vec![fixture.routers[0]];

        assert_eq!(
            select_router(&fixture.snapshot, 40),
            Some(fixture.routers[1])
        );
    }

    #[test]
    fn test_prefers_piped_router_below_threshold() {
        let mut fixture = two_worker_fixture();
        // Router 0 is piped and carries two peers; router 1 is empty.
        fixture.snapshot.piped_routers = [fixture.routers[0]].into_iter().collect();
        fixture.snapshot.peer_assignments = vec![fixture.routers[0], fixture.routers[0]];

        // Below the scale threshold the piped router wins despite load.
        assert_eq!(
            select_router(&fixture.snapshot, 40),
            Some(fixture.routers[0])
        );
    }

    #[test]
    fn test_piped_router_above_threshold_falls_back() {
        let mut fixture = two_worker_fixture();
        fixture.snapshot.piped_routers = [fixture.routers[0]].into_iter().collect();
        fixture.snapshot.peer_assignments = vec![fixture.routers[0], fixture.routers[0]];

        // Threshold of 2 disqualifies the piped router's worker; the
        // least-loaded worker's router is used instead.
        assert_eq!(
            select_router(&fixture.snapshot, 2),
            Some(fixture.routers[1])
        );
    }

    #[test]
    fn test_room_router_set_smaller_than_worker_count() {
        let r0 = router();
        let other_room = router();
        let snapshot = LoadSnapshot {
            workers: vec![
                WorkerView {
                    id: WorkerId(1),
                    // This worker only hosts another room's router.
                    routers: vec![other_room],
                },
                WorkerView {
                    id: WorkerId(2),
                    routers: vec![r0],
                },
            ],
            peer_assignments: vec![],
            room_routers: [r0].into_iter().collect(),
            piped_routers: HashSet::new(),
        };

        // Worker 1 is least loaded but hosts no room router; selection
        // still lands on the room's only router.
        assert_eq!(select_router(&snapshot, 40), Some(r0));
    }

    #[test]
    fn test_load_counts_other_rooms_on_shared_workers() {
        let mut fixture = two_worker_fixture();
        let foreign = router();
        fixture.snapshot.workers[1].routers.push(foreign);
        // Worker 2 is busy with another room's peers.
        fixture.snapshot.peer_assignments = vec![foreign, foreign, fixture.routers[0]];

        assert_eq!(
            select_router(&fixture.snapshot, 40),
            Some(fixture.routers[0])
        );
    }

    #[test]
    fn test_no_room_routers_returns_none() {
        let snapshot = LoadSnapshot {
            workers: vec![WorkerView {
                id: WorkerId(1),
                routers: vec![router()],
            }],
            peer_assignments: vec![],
            room_routers: HashSet::new(),
            piped_routers: HashSet::new(),
        };
        assert_eq!(select_router(&snapshot, 40), None);
    }
}
