use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bridge-wide configuration.  The host application fills this in
/// (deserialized from whatever source it uses); every field has a
/// production-sensible default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds of inactivity before a session is considered expired.
    #[serde(default = "d_1200")]
    pub timeout_secs: u64,
    /// Interval between cleanup cycles.
    #[serde(default = "d_300")]
    pub cleanup_interval_secs: u64,
    /// Maximum concurrent sessions per user (None = unlimited).
    #[serde(default)]
    pub max_sessions_per_user: Option<usize>,
    /// Spawn the periodic cleanup task when the bridge is built.
    #[serde(default = "d_true")]
    pub auto_cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1200,
            cleanup_interval_secs: 300,
            max_sessions_per_user: None,
            auto_cleanup: true,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock budget for an entire background execution.
    #[serde(default = "d_600")]
    pub execution_timeout_secs: u64,
    /// Budget for an individual client-side tool call.
    #[serde(default = "d_300")]
    pub tool_timeout_secs: u64,
    /// Maximum concurrent background executions across all threads.
    #[serde(default = "d_10")]
    pub max_concurrent_executions: usize,
    /// Capacity of the per-execution wire-event queue.
    #[serde(default = "d_64")]
    pub event_queue_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 600,
            tool_timeout_secs: 300,
            max_concurrent_executions: 10,
            event_queue_capacity: 64,
        }
    }
}

impl ExecutionConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn d_1200() -> u64 {
    1200
}
fn d_600() -> u64 {
    600
}
fn d_300() -> u64 {
    300
}
fn d_10() -> usize {
    10
}
fn d_64() -> usize {
    64
}
fn d_true() -> bool {
    true
}
