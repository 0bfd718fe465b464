use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout_at};
use tracing::{info, warn};

use crate::metrics::{Metrics, Summary};
use crate::scenario::Scenario;
use crate::stages::RampPlan;
use crate::worker::{Activation, vu_loop};

const TICK: Duration = Duration::from_millis(10);
const STOP_SLACK: Duration = Duration::from_secs(1);

/// Runs a scenario on a pool of VUs whose active count follows a [`RampPlan`].
pub struct RampingExecutor {
    plan: RampPlan,
    graceful_ramp_down: Duration,
    graceful_stop: Duration,
}

impl RampingExecutor {
    pub fn new(plan: RampPlan, graceful_ramp_down: Duration, graceful_stop: Duration) -> Self {
        Self {
            plan,
            graceful_ramp_down,
            graceful_stop,
        }
    }

    /// Drives the plan to completion, or until `shutdown` resolves.
    pub async fn run<F>(&self, scenario: Arc<dyn Scenario>, shutdown: F) -> Summary
    where
        F: Future<Output = ()>,
    {
        let metrics = Arc::new(Metrics::new());
        let max_vus = self.plan.max_vus();
        metrics.set_vus_max(max_vus);

        let started_at = Utc::now();
        let start = Instant::now();

        let initial = Activation::running(self.plan.start_vus(), self.graceful_ramp_down);
        let (tx, rx) = watch::channel(initial);
        metrics.set_vus(initial.vus);

        let mut handles: Vec<_> = (0..max_vus)
            .map(|vu_id| {
                tokio::spawn(vu_loop(vu_id, scenario.clone(), rx.clone(), metrics.clone()))
            })
            .collect();
        drop(rx);

        info!(
            max_vus,
            start_vus = self.plan.start_vus(),
            stages = self.plan.stages().len(),
            duration = ?self.plan.total_duration(),
            "starting ramping-vus run"
        );

        let total = self.plan.total_duration();
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current_stage = None;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => {
                    info!(elapsed = ?start.elapsed(), "shutdown requested, stopping run early");
                    break;
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= total {
                info!(?elapsed, "all stages finished");
                break;
            }

            let stage = self.plan.stage_at(elapsed);
            if stage != current_stage {
                if let Some(idx) = stage {
                    let target = self.plan.stages()[idx].target;
                    info!(stage = idx + 1, target, "entering stage");
                }
                current_stage = stage;
            }

            let vus = self.plan.vus_at(elapsed);
            tx.send_if_modified(|activation| {
                if activation.vus == vus {
                    return false;
                }
                activation.vus = vus;
                true
            });
            metrics.set_vus(vus);
        }

        tx.send_replace(Activation::stopped(self.graceful_stop));
        metrics.clear_vus();

        let deadline = Instant::now() + self.graceful_stop + STOP_SLACK;
        let mut aborted = 0;
        for handle in handles.iter_mut() {
            if timeout_at(deadline, &mut *handle).await.is_err() {
                handle.abort();
                metrics.record_interrupted();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "virtual users aborted after the graceful stop period");
        }

        let elapsed = start.elapsed();
        let summary = metrics.summary(started_at, Utc::now(), elapsed);
        info!(
            iterations = summary.iterations,
            http_reqs = summary.http_reqs,
            ?elapsed,
            "run finished"
        );
        summary
    }
}
