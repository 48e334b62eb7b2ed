//! Wire and domain types shared by the agent subsystems.
//!
//! All control-plane payloads serialize with camelCase keys to match the
//! panel API.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Current wall-clock time as an RFC3339 UTC string (second precision).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One telemetry sample for a single workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub server_id: String,
    /// RFC3339 UTC collection time.
    pub timestamp: String,
    pub cpu_usage_percent: f64,
    pub mem_usage_mb: i64,
    pub disk_usage_mb: i64,
    /// Egress delta since the previous observation of the same container.
    /// The first observation reports 0.
    pub net_egress_bytes: i64,
    pub uptime_seconds: i64,
}

/// Batch of samples POSTed to `/nodes/{node_id}/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetricsPayload {
    pub node_id: String,
    pub timestamp: String,
    pub samples: Vec<Sample>,
}

/// Liveness payload POSTed to `/nodes/{node_id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp: String,
    pub status: String,
}

impl Heartbeat {
    pub fn healthy(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: now_rfc3339(),
            status: "healthy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashEventType {
    Crash,
    Failed,
}

/// Workload lifecycle notification POSTed to `/nodes/{node_id}/events`.
///
/// `crash` carries the exit code and restart attempt; `failed` carries a
/// human-readable reason and marks the workload terminally failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashEvent {
    pub node_id: String,
    pub server_id: String,
    pub event_type: CrashEventType,
    pub timestamp: String,
    pub metadata: CrashEventMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashEventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CrashEvent {
    pub fn crash(
        node_id: impl Into<String>,
        server_id: impl Into<String>,
        exit_code: impl Into<String>,
        restart_attempt: u32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            server_id: server_id.into(),
            event_type: CrashEventType::Crash,
            timestamp: now_rfc3339(),
            metadata: CrashEventMetadata {
                exit_code: Some(exit_code.into()),
                restart_attempt: Some(restart_attempt),
                reason: None,
            },
        }
    }

    pub fn failed(
        node_id: impl Into<String>,
        server_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            server_id: server_id.into(),
            event_type: CrashEventType::Failed,
            timestamp: now_rfc3339(),
            metadata: CrashEventMetadata {
                exit_code: None,
                restart_attempt: None,
                reason: Some(reason.into()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Stdout,
    Stderr,
}

/// One console line delivered to WebSocket subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub line: String,
    /// RFC3339 UTC agent wall clock at read time.
    pub timestamp: String,
}

impl LogEntry {
    pub fn new(kind: LogKind, line: impl Into<String>) -> Self {
        Self {
            kind,
            line: line.into(),
            timestamp: now_rfc3339(),
        }
    }
}

/// Inbound console message from a subscriber.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub command: String,
}
