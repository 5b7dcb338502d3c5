//! Consecutive-failure hysteresis in front of the notifier.

use std::sync::Arc;

use serde::Serialize;

use crate::db::{MonitorDefinition, ProbeResult};
use crate::notify::{Alert, Notifier};

/// Per-monitor failure counters, owned by the monitor's task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub consecutive_failures: u32,
    /// Set once an alert has been raised for the current failure streak.
    pub alerted: bool,
}

/// Raises one alert per failure streak once it reaches `threshold`.
pub struct AlertTracker {
    threshold: u32,
    link_base: String,
    notifier: Option<Arc<dyn Notifier>>,
}

impl AlertTracker {
    pub fn new(threshold: u32, link_base: impl Into<String>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            threshold: threshold.max(1),
            link_base: link_base.into(),
            notifier,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Fold one result into `state`. Returns whether this result raised an alert.
    ///
    /// Delivery failures are logged and leave `alerted` set. With no notifier
    /// configured the counters still advance and alerts are dropped.
    pub async fn observe(
        &self,
        monitor: &MonitorDefinition,
        result: &ProbeResult,
        state: &mut AlertState,
    ) -> bool {
        if result.is_ok() {
            if state.alerted {
                tracing::info!("Monitor '{}' recovered", monitor.name);
            }
            *state = AlertState::default();
            return false;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        tracing::debug!(
            "Monitor '{}' has failed {} times",
            monitor.name,
            state.consecutive_failures
        );

        if state.consecutive_failures < self.threshold || state.alerted {
            return false;
        }

        state.alerted = true;
        tracing::warn!(
            "Monitor '{}' failed {} times in a row, raising alert",
            monitor.name,
            state.consecutive_failures
        );

        if let Some(notifier) = &self.notifier {
            let alert = Alert::new(monitor, result, state.consecutive_failures, &self.link_base);
            if let Err(e) = notifier.notify(&alert).await {
                tracing::error!("Failed to send alert for '{}': {}", monitor.name, e);
            }
        }

        true
    }
}
