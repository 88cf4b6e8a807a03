//! Bounded worker pool for proof tasks.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::solver::CancelToken;
use crate::verdict::{UnknownReason, Verdict};

/// Extra time granted to a batch on top of the per-task timeouts.
const GRACE: Duration = Duration::from_millis(250);

/// A cancellable proof task.
pub type ProofTask = Box<dyn FnOnce(&CancelToken) -> Verdict + Send>;

/// Runs proof tasks on a fixed number of threads.
///
/// Every task gets its own [`CancelToken`]. The caller blocks until all
/// results arrive or the batch deadline passes; stragglers are cancelled
/// and reported as timeouts.
pub struct ProofPool {
    pool: Option<ThreadPool>,
    workers: usize,
}

impl std::fmt::Debug for ProofPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofPool")
            .field("workers", &self.workers)
            .field("threaded", &self.pool.is_some())
            .finish()
    }
}

impl ProofPool {
    /// Pool with `workers` threads (at least one). Falls back to running
    /// tasks on the calling thread if threads cannot be spawned.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("opt8-proof-{idx}"))
            .build();
        let pool = match pool {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(%err, "proof pool unavailable, checking inline");
                None
            }
        };
        Self { pool, workers }
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Run a batch of tasks, each allowed `timeout` of solver time.
    pub fn run(&self, tasks: Vec<ProofTask>, timeout: Duration) -> Vec<Verdict> {
        let count = tasks.len();
        if count == 0 {
            return Vec::new();
        }
        let (tx, rx) = mpsc::channel();
        let tokens: Vec<CancelToken> = (0..count).map(|_| CancelToken::new()).collect();

        for (idx, task) in tasks.into_iter().enumerate() {
            let tx = tx.clone();
            let token = tokens[idx].clone();
            let job = move || {
                let verdict = if token.is_cancelled() {
                    Verdict::Unknown(UnknownReason::Cancelled)
                } else {
                    task(&token)
                };
                // The receiver is gone once the batch deadline has passed.
                let _ = tx.send((idx, verdict));
            };
            match &self.pool {
                Some(pool) => pool.spawn(job),
                None => job(),
            }
        }
        drop(tx);

        let rounds = u32::try_from(count.div_ceil(self.workers)).unwrap_or(u32::MAX);
        let budget = timeout.saturating_mul(rounds).saturating_add(GRACE);
        let deadline = Instant::now().checked_add(budget);
        let mut results: Vec<Option<Verdict>> = vec![None; count];
        let mut pending = count;
        while pending > 0 {
            let remaining =
                deadline.map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()));
            match rx.recv_timeout(remaining) {
                Ok((idx, verdict)) => {
                    if results[idx].is_none() {
                        pending -= 1;
                    }
                    results[idx] = Some(verdict);
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        if pending > 0 {
            warn!(pending, count, "proof batch deadline passed, cancelling");
        }
        results
            .into_iter()
            .zip(&tokens)
            .map(|(result, token)| {
                result.unwrap_or_else(|| {
                    token.cancel();
                    Verdict::Unknown(UnknownReason::SolverTimeout)
                })
            })
            .inspect(|verdict| debug!(%verdict, "proof task finished"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_results_keep_task_order() {
        let pool = ProofPool::new(2);
        let tasks: Vec<ProofTask> = (0..6)
            .map(|i| -> ProofTask {
                Box::new(move |_: &CancelToken| {
                    if i % 2 == 0 {
                        Verdict::Equivalent
                    } else {
                        Verdict::Unknown(UnknownReason::SolverUnknown)
                    }
                })
            })
            .collect();
        let verdicts = pool.run(tasks, Duration::from_secs(5));
        assert_eq!(verdicts.len(), 6);
        for (i, verdict) in verdicts.iter().enumerate() {
            assert_eq!(verdict.is_equivalent(), i % 2 == 0);
        }
    }

    #[test]
    fn test_straggler_is_cancelled() {
        let pool = ProofPool::new(1);
        let observed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&observed);
        let slow: ProofTask = Box::new(move |token: &CancelToken| {
            let start = Instant::now();
            while !token.is_cancelled() && start.elapsed() < Duration::from_secs(10) {
                std::thread::sleep(Duration::from_millis(5));
            }
            seen.store(token.is_cancelled(), Ordering::SeqCst);
            Verdict::Equivalent
        });
        let verdicts = pool.run(vec![slow], Duration::from_millis(20));
        assert_eq!(verdicts, vec![Verdict::Unknown(UnknownReason::SolverTimeout)]);
        let start = Instant::now();
        while !observed.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(observed.load(Ordering::SeqCst));
    }
}
