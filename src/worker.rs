use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::scenario::Scenario;

/// What the executor broadcasts to every VU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// VUs with an id below this run iterations.
    pub vus: usize,
    /// How long a deactivated VU may keep its current iteration.
    pub grace: Duration,
    pub done: bool,
}

impl Activation {
    pub fn running(vus: usize, grace: Duration) -> Self {
        Self {
            vus,
            grace,
            done: false,
        }
    }

    pub fn stopped(grace: Duration) -> Self {
        Self {
            vus: 0,
            grace,
            done: true,
        }
    }

    fn is_active(&self, vu_id: usize) -> bool {
        !self.done && self.vus > vu_id
    }
}

pub async fn vu_loop(
    vu_id: usize,
    scenario: Arc<dyn Scenario>,
    mut activation: watch::Receiver<Activation>,
    metrics: Arc<Metrics>,
) {
    loop {
        let done = activation
            .wait_for(|a| a.done || a.vus > vu_id)
            .await
            .map(|a| a.done)
            .unwrap_or(true);
        if done {
            break;
        }

        let started = Instant::now();
        tokio::select! {
            // a failed request still completes the iteration
            _ = scenario.iteration(vu_id, &metrics) => {
                metrics.record_iteration(started.elapsed());
            }
            grace = deactivated(vu_id, activation.clone()) => {
                warn!(vu = vu_id, ?grace, "iteration interrupted");
                metrics.record_interrupted();
            }
        }
    }

    debug!(vu = vu_id, "virtual user finished");
}

// Resolves once `vu_id` has been inactive for the grace period it was given.
// A VU reactivated during its grace period keeps its iteration.
async fn deactivated(vu_id: usize, mut activation: watch::Receiver<Activation>) -> Duration {
    loop {
        let Ok(grace) = activation
            .wait_for(|a| !a.is_active(vu_id))
            .await
            .map(|a| a.grace)
        else {
            return Duration::ZERO;
        };
        debug!(vu = vu_id, ?grace, "virtual user deactivated mid-iteration");
        sleep(grace).await;

        if !activation.borrow().is_active(vu_id) {
            return grace;
        }
    }
}
