//! Executor configuration.

use std::time::Duration;

use crate::verify::{DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_RETRY_DELAY};

/// Settings shared by every step of a plan run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Verify deployed sources unless a step says otherwise.
    pub verify: bool,
    /// Bound on each confirmation wait. `None` waits as long as the chain takes.
    pub confirmation_timeout: Option<Duration>,
    /// Reuse imported instances whose name matches a step and whose address
    /// already holds code.
    pub resume: bool,
    pub verification: VerificationConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            verify: true,
            confirmation_timeout: None,
            resume: false,
            verification: VerificationConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn confirmation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.verification.retry_delay = delay;
        self
    }

    pub fn verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification.attempt_timeout = timeout;
        self
    }
}

/// Verification backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationConfig {
    /// Pause before the single retry of a transient failure.
    pub retry_delay: Duration,
    /// Bound on each attempt, so a hung verifier cannot hold up a plan.
    pub attempt_timeout: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}
