use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub const HANDLED_COMPONENT: &str = "message_handler";
pub const ACKNOWLEDGED_COMPONENT: &str = "acknowledgements";

/// Activity of the two paths the process depends on: the last message coming in, and
/// the oldest message still waiting for its upload to be acknowledged.
#[derive(Debug)]
pub struct ActivityTracker {
    started_at: Instant,
    last_handled: RwLock<Option<Instant>>,
    oldest_pending: RwLock<Option<Instant>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_handled: RwLock::new(None),
            oldest_pending: RwLock::new(None),
        }
    }

    pub fn record_handled(&self) {
        if let Ok(mut last) = self.last_handled.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn set_oldest_pending(&self, oldest: Option<Instant>) {
        if let Ok(mut slot) = self.oldest_pending.write() {
            *slot = oldest;
        }
    }

    pub fn since_last_handled(&self) -> Option<Duration> {
        Self::elapsed(&self.last_handled)
    }

    /// `None` when nothing is waiting for acknowledgement.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        Self::elapsed(&self.oldest_pending)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn elapsed(slot: &RwLock<Option<Instant>>) -> Option<Duration> {
        slot.read().ok().and_then(|last| last.map(|at| at.elapsed()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Activity seen within the threshold
    Healthy { idle: Duration },
    /// Nothing seen for longer than the threshold
    Stalled { idle: Duration },
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::Healthy { .. })
    }
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every component is healthy
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise; component statuses go in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// Compares activity against thresholds. Before the first message the handler idle time
/// is counted from process start. Acknowledgements are stalled once the oldest pending
/// message is older than their threshold.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    handled_threshold: Duration,
    pending_age_threshold: Duration,
}

impl HealthCheck {
    pub fn new(handled_threshold: Duration, pending_age_threshold: Duration) -> Self {
        Self {
            handled_threshold,
            pending_age_threshold,
        }
    }

    pub fn check(&self, activity: &ActivityTracker) -> HealthStatus {
        let uptime = activity.uptime();
        let components = HashMap::from([
            (
                HANDLED_COMPONENT.to_string(),
                Self::status(
                    activity.since_last_handled().unwrap_or(uptime),
                    self.handled_threshold,
                ),
            ),
            (
                ACKNOWLEDGED_COMPONENT.to_string(),
                Self::status(
                    activity.oldest_pending_age().unwrap_or(Duration::ZERO),
                    self.pending_age_threshold,
                ),
            ),
        ]);

        HealthStatus {
            healthy: components.values().all(ComponentStatus::is_healthy),
            components,
        }
    }

    fn status(idle: Duration, threshold: Duration) -> ComponentStatus {
        if idle <= threshold {
            ComponentStatus::Healthy { idle }
        } else {
            ComponentStatus::Stalled { idle }
        }
    }
}
