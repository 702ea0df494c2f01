use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};

use siphasher::sip::SipHasher13;
use uuid::Uuid;

use crate::config::RoutingMode;

/// Picks the worker for each message. The strategy is fixed at construction.
#[derive(Debug)]
pub enum Router {
    KeyDistribute,
    RoundRobin { cursor: AtomicUsize },
}

impl Router {
    pub fn new(mode: RoutingMode) -> Self {
        match mode {
            RoutingMode::KeyDistribute => Router::KeyDistribute,
            RoutingMode::RoundRobin => Router::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
        }
    }

    /// Worker index in `0..workers` for a message with `key`
    pub fn qualify(&self, key: &[u8], workers: usize) -> usize {
        assert!(workers > 0, "workers must be > 0");

        match self {
            Router::KeyDistribute => {
                let mut hasher = SipHasher13::new();
                if key.is_empty() {
                    // No key, no ordering guarantee: spread these out
                    hasher.write(Uuid::new_v4().as_bytes());
                } else {
                    hasher.write(key);
                }
                let hash = hasher.finish();

                (hash % workers as u64) as usize
            }
            Router::RoundRobin { cursor } => {
                let previous = cursor
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                        Some((current + 1) % workers)
                    })
                    .unwrap_or_default();
                previous % workers
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_same_key_routes_to_same_worker() {
        let router = Router::new(RoutingMode::KeyDistribute);

        let first = router.qualify(b"user-1", 8);
        for _ in 0..100 {
            assert_eq!(router.qualify(b"user-1", 8), first);
        }
    }

    #[test]
    fn test_key_distribute_spreads_keys() {
        let router = Router::new(RoutingMode::KeyDistribute);
        let mut counts = [0usize; 4];

        for i in 0..1000 {
            counts[router.qualify(format!("user-{i}").as_bytes(), 4)] += 1;
        }

        for (worker, count) in counts.iter().enumerate() {
            assert!(*count > 50, "worker {worker} received too few messages");
        }
    }

    #[test]
    fn test_empty_keys_are_spread_randomly() {
        let router = Router::new(RoutingMode::KeyDistribute);

        let targets: HashSet<usize> = (0..200).map(|_| router.qualify(b"", 8)).collect();

        // 200 random draws over 8 workers hitting only one is practically impossible
        assert!(targets.len() > 1);
        assert!(targets.iter().all(|t| *t < 8));
    }

    #[test]
    fn test_round_robin_visits_workers_in_order() {
        let router = Router::new(RoutingMode::RoundRobin);

        let visited: Vec<usize> = (0..7).map(|_| router.qualify(b"same-key", 3)).collect();

        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_single_worker_always_zero() {
        let key_router = Router::new(RoutingMode::KeyDistribute);
        let rr_router = Router::new(RoutingMode::RoundRobin);

        for i in 0..10 {
            assert_eq!(key_router.qualify(format!("k{i}").as_bytes(), 1), 0);
            assert_eq!(rr_router.qualify(b"", 1), 0);
        }
    }
}
