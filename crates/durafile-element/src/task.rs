//! Cancellable periodic background tasks.
//!
//! A [`PeriodicJob`] decides after every run how long to sleep before the
//! next one. [`PeriodicTask`] owns the spawned loop and exposes pause,
//! resume and a shutdown that waits for an in-progress run to finish.
//! Every run is bounded by the job's deadline; a run that overruns it is
//! dropped at its next await point and counted as abandoned.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One unit of periodic background work.
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run once and return the delay before the next run.
    async fn run_once(&self) -> Duration;

    /// Longest a single run may take.
    fn deadline(&self) -> Duration;

    /// Called after a run was abandoned at its deadline. Returns the delay
    /// before the next run.
    fn abandoned(&self) -> Duration;
}

/// Handle to a spawned periodic loop.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    abandoned: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `job` on the current runtime, first running after `initial_delay`.
    pub fn spawn(job: Arc<dyn PeriodicJob>, initial_delay: Duration) -> Self {
        let name = job.name();
        let cancel = CancellationToken::new();
        let (paused, paused_rx) = watch::channel(false);
        let abandoned = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run_loop(
            job,
            initial_delay,
            cancel.clone(),
            paused_rx,
            abandoned.clone(),
        ));
        info!("Started background task {}", name);
        Self {
            name,
            cancel,
            paused,
            abandoned,
            handle,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Skip runs until resumed. A run already in progress completes.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Runs cut off at the job's deadline so far
    pub fn abandoned_runs(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Background task {} ended abnormally: {}", self.name, e);
        } else {
            info!("Stopped background task {}", self.name);
        }
    }
}

async fn run_loop(
    job: Arc<dyn PeriodicJob>,
    initial_delay: Duration,
    cancel: CancellationToken,
    mut paused: watch::Receiver<bool>,
    abandoned: Arc<AtomicU64>,
) {
    let mut delay = initial_delay;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        while *paused.borrow_and_update() {
            debug!("Background task {} paused", job.name());
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        // Shutdown waits for the run, which the deadline bounds
        let deadline = job.deadline();
        delay = match tokio::time::timeout(deadline, job.run_once()).await {
            Ok(next) => next,
            Err(_) => {
                abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Background task {} abandoned a run after {:?}",
                    job.name(),
                    deadline
                );
                job.abandoned()
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        runs: AtomicU32,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self) -> Duration {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Duration::from_secs(10)
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(5)
        }

        fn abandoned(&self) -> Duration {
            Duration::from_secs(10)
        }
    }

    /// Starts every run and never finishes one
    struct HangingJob {
        started: AtomicU32,
        abandoned: AtomicU32,
    }

    #[async_trait]
    impl PeriodicJob for HangingJob {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn run_once(&self) -> Duration {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Duration::from_secs(1)
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(30)
        }

        fn abandoned(&self) -> Duration {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
            Duration::from_secs(60)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_schedule() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
        });
        let task = PeriodicTask::spawn(job.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
        });
        let task = PeriodicTask::spawn(job.clone(), Duration::from_secs(1));
        task.pause();
        assert!(task.is_paused());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        task.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
        });
        let task = PeriodicTask::spawn(job.clone(), Duration::from_secs(60));
        task.shutdown().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_run_is_abandoned_at_deadline() {
        let job = Arc::new(HangingJob {
            started: AtomicU32::new(0),
            abandoned: AtomicU32::new(0),
        });
        let task = PeriodicTask::spawn(job.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(job.started.load(Ordering::SeqCst), 1);
        assert_eq!(task.abandoned_runs(), 0);

        // 1s start + 30s deadline
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(task.abandoned_runs(), 1);
        assert_eq!(job.abandoned.load(Ordering::SeqCst), 1);

        // Next run only after the delay returned on abandon
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(job.started.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(job.started.load(Ordering::SeqCst), 2);

        // Shutdown does not wait out a hung run forever
        task.shutdown().await;
        assert_eq!(job.abandoned.load(Ordering::SeqCst), 2);
    }
}
