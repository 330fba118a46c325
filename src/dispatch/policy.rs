//! Distribution policies
//!
//! A policy gates the "accept a fresh block" branch of the scan loop's
//! decision. Performance is greedy: fast workers finish sooner, ask sooner,
//! and therefore take more. Failover caps each worker's share at an even
//! split of the total, recomputed against the shrinking set of good workers
//! so exclusions rebalance the remainder.

use crate::dispatch::worker::WorkerNode;

/// How fresh blocks are offered to idle workers
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    /// Any idle, non-excluded worker may take the next block
    Performance,
    /// Bound each worker to `ceil(total_blocks / good_workers)`
    Failover { total_blocks: u64 },
}

impl Policy {
    /// May this worker accept a fresh block right now?
    pub fn may_accept(&self, worker: &WorkerNode, good_workers: usize) -> bool {
        match self {
            Self::Performance => true,
            Self::Failover { total_blocks } => {
                if good_workers == 0 {
                    return false;
                }
                worker.completed < total_blocks.div_ceil(good_workers as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn worker_with_completed(completed: u64) -> WorkerNode {
        let mut w = WorkerNode::from_config(&MachineConfig {
            hostname: "w".to_string(),
            username: None,
            wd: ".".to_string(),
            connect_cmd: "ssh".to_string(),
            poll_interval: 10,
            poll_timeout: 5,
            upload_timeout: 20,
            download_timeout: 20,
            init_timeout: 20,
        });
        w.completed = completed;
        w
    }

    #[test]
    fn test_performance_always_accepts() {
        let w = worker_with_completed(1_000_000);
        assert!(Policy::Performance.may_accept(&w, 1));
    }

    #[test]
    fn test_failover_quota() {
        let policy = Policy::Failover { total_blocks: 10 };

        // ceil(10 / 3) = 4
        assert!(policy.may_accept(&worker_with_completed(3), 3));
        assert!(!policy.may_accept(&worker_with_completed(4), 3));
    }

    #[test]
    fn test_failover_rebalances_when_fleet_shrinks() {
        let policy = Policy::Failover { total_blocks: 10 };
        let w = worker_with_completed(5);

        // At quota with two good workers...
        assert!(!policy.may_accept(&w, 2));
        // ...but an exclusion raises the target for the survivors.
        assert!(policy.may_accept(&w, 1));
    }

    #[test]
    fn test_failover_with_no_good_workers() {
        let policy = Policy::Failover { total_blocks: 10 };
        assert!(!policy.may_accept(&worker_with_completed(0), 0));
    }
}
