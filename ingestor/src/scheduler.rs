use crate::errors::Result;
use crate::metrics::{POLLS_TOTAL, POLL_FAILURES_TOTAL};
use crate::poller::{LivePoller, PollSummary};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One unit of scheduled work
#[async_trait]
pub trait PollCycle: Send + Sync + 'static {
    async fn run_cycle(&self) -> Result<PollSummary>;
}

#[async_trait]
impl PollCycle for LivePoller {
    async fn run_cycle(&self) -> Result<PollSummary> {
        self.poll_once().await
    }
}

/// Runs a cycle immediately and then once per period until cancelled.
///
/// Cycles never overlap: a cycle that overruns its period delays the next tick.
pub struct SchedulerLoop {
    period: Duration,
}

impl SchedulerLoop {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Returns the number of cycles started.
    pub async fn run(&self, cycle: Arc<dyn PollCycle>, cancel: CancellationToken) -> u64 {
        info!("Starting scheduler with period={:?}", self.period);

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            cycles += 1;
            POLLS_TOTAL.inc();
            let start = Instant::now();

            // A separate task so a panicking cycle is reported like any other failure.
            let job = cycle.clone();
            let mut handle = tokio::spawn(async move { job.run_cycle().await });

            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.abort();
                    info!("Cancelled during cycle {}", cycles);
                    break;
                }
                joined = &mut handle => match joined {
                    Ok(Ok(summary)) => {
                        debug!("Cycle {} finished in {:?}: {:?}", cycles, start.elapsed(), summary);
                    }
                    Ok(Err(e)) => {
                        error!("Error occurred in cycle {}: {}", cycles, e);
                        POLL_FAILURES_TOTAL.with_label_values(&[e.kind()]).inc();
                    }
                    Err(join_err) => {
                        error!("Cycle {} aborted: {}", cycles, join_err);
                        POLL_FAILURES_TOTAL.with_label_values(&["panic"]).inc();
                    }
                },
            }
        }

        info!("Scheduler stopped after {} cycles", cycles);
        cycles
    }
}
