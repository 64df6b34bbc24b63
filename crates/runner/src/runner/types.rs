use std::fmt;
use std::sync::Arc;

use gantry_core::{ConfigError, RunnerProperties};

use crate::rejection::{policy_for, RejectionPolicy};

/// Runtime configuration of a [`TaskRunner`](super::TaskRunner): validated
/// properties plus the rejection policy handed to the pool.
#[derive(Clone)]
pub struct RunnerConfig {
    properties: RunnerProperties,
    rejection: Arc<dyn RejectionPolicy>,
}

impl RunnerConfig {
    /// Validate `properties` and pick the built-in policy it names.
    pub fn new(properties: RunnerProperties) -> Result<Self, ConfigError> {
        properties.validate()?;
        let rejection = policy_for(properties.rejection);
        Ok(Self { properties, rejection })
    }

    /// Replace the built-in rejection policy with a custom one.
    pub fn with_rejection_policy(mut self, policy: Arc<dyn RejectionPolicy>) -> Self {
        self.rejection = policy;
        self
    }

    pub fn properties(&self) -> &RunnerProperties {
        &self.properties
    }

    pub fn rejection_policy(&self) -> &Arc<dyn RejectionPolicy> {
        &self.rejection
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let properties = RunnerProperties::default();
        let rejection = policy_for(properties.rejection);
        Self { properties, rejection }
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("properties", &self.properties)
            .field("rejection", &self.rejection.name())
            .finish()
    }
}

/// Lifecycle state of a runner. Single-use: a closed runner never restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Closed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Closed => "closed",
        };
        f.write_str(s)
    }
}
