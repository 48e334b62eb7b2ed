//! Subsystem health behind the agent's liveness and readiness probes.
//!
//! The agent has a fixed set of subsystems, so health is a flat table
//! keyed by [`Subsystem`] rather than an open registry. Conditions are
//! severity-ordered and the agent reports the worst one; `since` marks
//! the last condition transition, not the last report.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::models::now_rfc3339;

/// Agent subsystems that report health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Runtime,
    CrashGuard,
    MetricsEmitter,
    Console,
    ControlPlane,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Runtime,
        Subsystem::CrashGuard,
        Subsystem::MetricsEmitter,
        Subsystem::Console,
        Subsystem::ControlPlane,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Runtime => "runtime",
            Subsystem::CrashGuard => "crash_guard",
            Subsystem::MetricsEmitter => "metrics_emitter",
            Subsystem::Console => "console",
            Subsystem::ControlPlane => "control_plane",
        }
    }
}

/// Condition of one subsystem, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Healthy,
    /// Impaired but still operational.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsystemReport {
    pub subsystem: Subsystem,
    pub condition: Condition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// RFC3339 time of the last condition transition.
    pub since: String,
}

/// Liveness payload: the worst condition wins.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub status: Condition,
    pub subsystems: Vec<SubsystemReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct TrackerInner {
    reports: Vec<SubsystemReport>,
    started: bool,
}

/// Shared health table. Subsystems record condition changes; the probe
/// endpoints read snapshots.
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<RwLock<TrackerInner>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// Every subsystem starts healthy; readiness is withheld until
    /// [`mark_started`](Self::mark_started).
    pub fn new() -> Self {
        let reports = Subsystem::ALL
            .iter()
            .map(|subsystem| SubsystemReport {
                subsystem: *subsystem,
                condition: Condition::Healthy,
                detail: None,
                since: now_rfc3339(),
            })
            .collect();

        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                reports,
                started: false,
            })),
        }
    }

    pub fn record(&self, subsystem: Subsystem, condition: Condition, detail: Option<String>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(report) = inner
            .reports
            .iter_mut()
            .find(|r| r.subsystem == subsystem)
        else {
            return;
        };

        if report.condition != condition {
            report.since = now_rfc3339();
        }
        report.condition = condition;
        report.detail = detail;
    }

    pub fn restore(&self, subsystem: Subsystem) {
        self.record(subsystem, Condition::Healthy, None);
    }

    pub fn degrade(&self, subsystem: Subsystem, detail: impl Into<String>) {
        self.record(subsystem, Condition::Degraded, Some(detail.into()));
    }

    pub fn fail(&self, subsystem: Subsystem, detail: impl Into<String>) {
        self.record(subsystem, Condition::Unhealthy, Some(detail.into()));
    }

    /// Startup is complete; readiness now depends only on conditions.
    pub fn mark_started(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .started = true;
    }

    pub fn liveness(&self) -> LivenessReport {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let status = inner
            .reports
            .iter()
            .map(|r| r.condition)
            .max()
            .unwrap_or(Condition::Healthy);
        LivenessReport {
            status,
            subsystems: inner.reports.clone(),
        }
    }

    pub fn readiness(&self) -> ReadinessReport {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        if !inner.started {
            return ReadinessReport {
                ready: false,
                reason: Some("startup in progress".to_string()),
            };
        }

        let down: Vec<&str> = inner
            .reports
            .iter()
            .filter(|r| r.condition == Condition::Unhealthy)
            .map(|r| r.subsystem.name())
            .collect();
        if down.is_empty() {
            ReadinessReport {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessReport {
                ready: false,
                reason: Some(format!("unhealthy: {}", down.join(", "))),
            }
        }
    }
}
