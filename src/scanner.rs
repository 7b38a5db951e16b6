use crate::config::ScanConfig;
use crate::coordinator::TaskCoordinator;
use crate::types::{AbandonedTask, PortStatus, Protocol, ScanReport, ScanResult, ScanTask, TaskOutcome};
use anyhow::Result;
use std::collections::VecDeque;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scan every configured (port, protocol) pair of the target.
///
/// - Runs `config.threads` workers (never more than there are tasks).
/// - Each task starts a capture, sends one probe and arbitrates the two.
/// - Ctrl-C stops workers from taking new tasks; in-flight tasks still finish.
pub async fn scan(config: &ScanConfig) -> Result<ScanReport> {
    scan_with_shared(config, CancellationToken::new(), SharedProgress::new()).await
}

/// Counters and collections shared by all workers of one scan.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub completed: Arc<AtomicU64>,
    pub abandoned_count: Arc<AtomicU64>,
    pub open_count: Arc<AtomicU64>,
    pub results: Arc<Mutex<Vec<ScanResult>>>,
    pub abandoned: Arc<Mutex<Vec<AbandonedTask>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicU64::new(0)),
            abandoned_count: Arc::new(AtomicU64::new(0)),
            open_count: Arc::new(AtomicU64::new(0)),
            results: Arc::new(Mutex::new(Vec::new())),
            abandoned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn record(&self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed(result) => {
                if result.status == PortStatus::Open {
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                }
                self.results.lock().await.push(result);
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Abandoned(abandoned) => {
                warn!(
                    port = abandoned.task.port,
                    protocol = %abandoned.task.protocol,
                    reason = %abandoned.reason,
                    "task abandoned"
                );
                self.abandoned.lock().await.push(abandoned);
                self.abandoned_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn scan_with_shared(
    config: &ScanConfig,
    cancel: CancellationToken,
    shared: SharedProgress,
) -> Result<ScanReport> {
    let tasks = build_tasks(&config.ports, &config.protocols);
    let coordinator = Arc::new(TaskCoordinator::new(
        config.target,
        config.interface.clone(),
        config.timeout,
    ));

    // Ctrl-C cancels the scan.
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_ctrlc.cancel();
        }
    });

    info!(
        target = %config.target,
        interface = %config.interface,
        tasks = tasks.len(),
        workers = config.threads,
        "scan starting"
    );

    let report = run_pool(
        config.target,
        tasks,
        config.threads,
        cancel,
        shared,
        move |task| {
            let coordinator = coordinator.clone();
            async move { coordinator.run(task).await }
        },
    )
    .await;
    Ok(report)
}

/// Every requested port crossed with every requested protocol, grouped by protocol.
pub fn build_tasks(ports: &[u16], protocols: &[Protocol]) -> Vec<ScanTask> {
    protocols
        .iter()
        .flat_map(|&protocol| ports.iter().map(move |&port| ScanTask { port, protocol }))
        .collect()
}

/// Shared queue of pending tasks; each pop hands a task to exactly one worker.
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<ScanTask>>,
}

impl TaskQueue {
    pub fn new(tasks: Vec<ScanTask>) -> Self {
        Self {
            inner: Mutex::new(tasks.into()),
        }
    }

    /// Take the next task, or `None` once the queue is drained. Never waits for new work.
    pub async fn pop(&self) -> Option<ScanTask> {
        self.inner.lock().await.pop_front()
    }

    /// Tasks still waiting for a worker.
    async fn remaining(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Drain `tasks` with `workers` concurrent workers, each running `exec` on one task at a time.
pub async fn run_pool<E, Fut>(
    target: Ipv4Addr,
    tasks: Vec<ScanTask>,
    workers: usize,
    cancel: CancellationToken,
    shared: SharedProgress,
    exec: E,
) -> ScanReport
where
    E: Fn(ScanTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    let total = tasks.len() as u64;
    let workers = workers.clamp(1, tasks.len().max(1));
    let queue = Arc::new(TaskQueue::new(tasks));
    let exec = Arc::new(exec);
    let mut set = JoinSet::new();

    for worker in 0..workers {
        let queue = queue.clone();
        let exec = exec.clone();
        let shared = shared.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            let mut handled = 0usize;
            loop {
                if cancel.is_cancelled() {
                    debug!(worker, "scan cancelled, worker stopping");
                    break;
                }
                // lock is released before the task runs
                let Some(task) = queue.pop().await else {
                    break;
                };
                let outcome = exec(task).await;
                shared.record(outcome).await;
                handled += 1;
            }
            debug!(worker, handled, "worker finished");
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "scan worker failed");
        }
    }

    let left = queue.remaining().await;
    if left > 0 {
        info!(left, "scan stopped before every task ran");
    }

    let results = shared.results.lock().await.clone();
    let abandoned = shared.abandoned.lock().await.clone();
    ScanReport {
        target,
        total,
        results,
        abandoned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_are_cartesian_product() {
        let tasks = build_tasks(&[22, 80], &[Protocol::Tcp, Protocol::Udp]);
        assert_eq!(tasks.len(), 4);
        assert!(tasks.contains(&ScanTask {
            port: 80,
            protocol: Protocol::Udp
        }));
    }

    #[tokio::test]
    async fn queue_drains_once() {
        let queue = TaskQueue::new(build_tasks(&[1, 2], &[Protocol::Tcp]));
        assert_eq!(queue.remaining().await, 2);
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
        assert_eq!(queue.remaining().await, 0);
    }

    #[tokio::test]
    async fn abandoned_tasks_are_reported() {
        let tasks = build_tasks(&[7, 8], &[Protocol::Udp]);
        let report = run_pool(
            Ipv4Addr::LOCALHOST,
            tasks,
            2,
            CancellationToken::new(),
            SharedProgress::new(),
            |task| async move {
                if task.port == 7 {
                    TaskOutcome::Abandoned(AbandonedTask {
                        task,
                        reason: "send failed".into(),
                    })
                } else {
                    TaskOutcome::Completed(ScanResult {
                        port: task.port,
                        protocol: task.protocol,
                        status: PortStatus::OpenOrFiltered,
                        service: "unknown".into(),
                        header_bytes: Vec::new(),
                    })
                }
            },
        )
        .await;
        assert_eq!(report.total, 2);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].task.port, 7);
    }

    #[tokio::test]
    async fn cancelled_scan_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicU64::new(0));
        let ran_in_pool = ran.clone();
        let report = run_pool(
            Ipv4Addr::LOCALHOST,
            build_tasks(&[1, 2, 3], &[Protocol::Tcp]),
            2,
            cancel,
            SharedProgress::new(),
            move |task| {
                ran_in_pool.fetch_add(1, Ordering::SeqCst);
                async move {
                    TaskOutcome::Abandoned(AbandonedTask {
                        task,
                        reason: "should not run".into(),
                    })
                }
            },
        )
        .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(report.results.is_empty());
        assert!(report.abandoned.is_empty());
        assert_eq!(report.total, 3);
    }
}
