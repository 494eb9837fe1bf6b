//! Blocking cluster health waits.

use std::thread;
use std::time::{Duration, Instant};

use quarry_types::HealthState;
use tracing::{debug, warn};

use crate::membership::MembershipTable;
use crate::{Error, Result};

/// Upper bound of the poll backoff.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

const BACKOFF_FACTOR: f64 = 1.5;

/// Polls cluster health through whichever node is running.
#[derive(Debug, Clone, Copy)]
pub struct HealthProber<'a> {
    nodes: &'a MembershipTable,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'a> HealthProber<'a> {
    pub fn new(nodes: &'a MembershipTable, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            nodes,
            timeout,
            poll_interval,
        }
    }

    /// Waits until health is at least yellow.
    pub fn ensure_yellow(&self, index: Option<&str>) -> Result<HealthState> {
        self.wait_for(HealthState::Yellow, index)
    }

    /// Waits until health is green.
    pub fn ensure_green(&self, index: Option<&str>) -> Result<HealthState> {
        self.wait_for(HealthState::Green, index)
    }

    /// Waits up to the configured timeout for `threshold`.
    pub fn wait_for(&self, threshold: HealthState, index: Option<&str>) -> Result<HealthState> {
        self.wait_for_until(threshold, index, Instant::now() + self.timeout)
    }

    /// Waits until `deadline` for health to reach `threshold`.
    ///
    /// Health is checked at least once, even when `deadline` has passed.
    /// Returns the state that satisfied the threshold.
    pub fn wait_for_until(
        &self,
        threshold: HealthState,
        index: Option<&str>,
        deadline: Instant,
    ) -> Result<HealthState> {
        let mut delay = self.poll_interval;
        let mut polls = 0u32;
        loop {
            let observed = self.observe(index);
            polls += 1;
            if observed.satisfies(threshold) {
                debug!(%observed, %threshold, ?index, polls, "cluster health reached");
                return Ok(observed);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%observed, %threshold, ?index, polls, "timed out waiting for cluster health");
                return Err(Error::HealthTimeout {
                    threshold,
                    last_observed: observed,
                    index: index.map(str::to_string),
                });
            }

            debug!(%observed, %threshold, ?index, ?delay, "waiting for cluster health");
            thread::sleep(delay.min(deadline - now));
            delay = delay.mul_f64(BACKOFF_FACTOR).min(MAX_POLL_INTERVAL);
        }
    }

    /// Current health as seen by the first running node; red when none is.
    pub fn observe(&self, index: Option<&str>) -> HealthState {
        let client = match self.nodes.first_running().and_then(|node| node.client()) {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "no node to ask for health");
                return HealthState::Red;
            }
        };
        match client.cluster_health(index) {
            Ok(health) => health.status,
            Err(e) => {
                debug!(error = %e, "health request failed");
                HealthState::Red
            }
        }
    }
}
