//! Run configuration: every timing knob of a test run in one place.

use crate::error::CoreError;
use crate::failure::FailureType;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration of one test run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// How long the RUN phase keeps workloads running
    pub duration: Duration,
    /// Deadline for all acknowledgements of one phase
    pub phase_timeout: Duration,
    /// Deadline for each individual request
    pub request_timeout: Duration,
    /// How often the RUN phase checks for critical failures and logs progress
    pub poll_interval: Duration,
    /// Failure types that do not abort the run
    pub tolerable_failures: HashSet<FailureType>,
    /// Run LOCAL_VERIFY and GLOBAL_VERIFY
    pub verify_enabled: bool,
    /// Treat a phase timeout as a critical failure
    pub phase_timeout_is_critical: bool,
}

impl RunConfig {
    /// Starts a builder; the tolerable failure set must be supplied.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    pub fn is_tolerable(&self, failure_type: FailureType) -> bool {
        self.tolerable_failures.contains(&failure_type)
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    duration: Duration,
    phase_timeout: Duration,
    request_timeout: Duration,
    poll_interval: Duration,
    tolerable_failures: Option<HashSet<FailureType>>,
    verify_enabled: bool,
    phase_timeout_is_critical: bool,
}

impl Default for RunConfigBuilder {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            phase_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            tolerable_failures: None,
            verify_enabled: true,
            phase_timeout_is_critical: false,
        }
    }
}

impl RunConfigBuilder {
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the failure types that do not abort the run. An empty set makes
    /// every failure critical.
    pub fn tolerable_failures(mut self, types: impl IntoIterator<Item = FailureType>) -> Self {
        self.tolerable_failures = Some(types.into_iter().collect());
        self
    }

    pub fn verify_enabled(mut self, enabled: bool) -> Self {
        self.verify_enabled = enabled;
        self
    }

    pub fn phase_timeout_is_critical(mut self, critical: bool) -> Self {
        self.phase_timeout_is_critical = critical;
        self
    }

    pub fn build(self) -> Result<RunConfig, CoreError> {
        let tolerable_failures = self
            .tolerable_failures
            .ok_or_else(|| CoreError::config("tolerable failure types must be specified"))?;
        if self.poll_interval.is_zero() {
            return Err(CoreError::config("poll interval must be positive"));
        }
        if self.phase_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(CoreError::config("timeouts must be positive"));
        }
        if self.request_timeout > self.phase_timeout {
            tracing::warn!(
                request_timeout = ?self.request_timeout,
                phase_timeout = ?self.phase_timeout,
                "request timeout exceeds phase timeout"
            );
        }

        Ok(RunConfig {
            duration: self.duration,
            phase_timeout: self.phase_timeout,
            request_timeout: self.request_timeout,
            poll_interval: self.poll_interval,
            tolerable_failures,
            verify_enabled: self.verify_enabled,
            phase_timeout_is_critical: self.phase_timeout_is_critical,
        })
    }
}
