use serde::Deserialize;

use crate::queue::ShutdownPolicy;

/// Settings for a [`Runtime`](crate::Runtime)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Applied to every dispatcher spawned through the runtime.
    pub shutdown_policy: ShutdownPolicy,
    pub timer_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_policy: ShutdownPolicy::Drain,
            timer_thread_name: "timer-service".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn timer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.timer_thread_name = name.into();
        self
    }
}
