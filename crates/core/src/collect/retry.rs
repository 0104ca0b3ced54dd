use crate::upstream::error::UpstreamError;
use reqwest::StatusCode;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Status(StatusCode),
    Transport,
}

impl Trigger {
    fn matches(&self, err: &UpstreamError) -> bool {
        match (self, err) {
            (Trigger::Status(s), UpstreamError::Status { status, .. }) => s == status,
            (Trigger::Transport, UpstreamError::Transport(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `step * attempt`, capped at `max`.
    Linear { step: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear { step, max } => step.saturating_mul(attempt).min(max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRule {
    pub trigger: Trigger,
    pub backoff: Backoff,
    /// Prefer the server's `Retry-After` over `backoff` when present.
    pub honor_retry_after: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    /// Retryable, but the failure budget is spent: keep what was collected.
    GiveUp,
    /// Not retryable.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub rules: Vec<RetryRule>,
    pub max_consecutive_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                // A full window of the 100 req/min upstream cap.
                RetryRule {
                    trigger: Trigger::Status(StatusCode::TOO_MANY_REQUESTS),
                    backoff: Backoff::Fixed(Duration::from_secs(60)),
                    honor_retry_after: true,
                },
                RetryRule {
                    trigger: Trigger::Status(StatusCode::INTERNAL_SERVER_ERROR),
                    backoff: Backoff::Linear {
                        step: Duration::from_secs(5),
                        max: Duration::from_secs(60),
                    },
                    honor_retry_after: false,
                },
                RetryRule {
                    trigger: Trigger::Transport,
                    backoff: Backoff::Linear {
                        step: Duration::from_secs(5),
                        max: Duration::from_secs(60),
                    },
                    honor_retry_after: false,
                },
            ],
            max_consecutive_failures: 3,
        }
    }
}

impl RetryPolicy {
    pub fn rule_for(&self, err: &UpstreamError) -> Option<&RetryRule> {
        self.rules.iter().find(|r| r.trigger.matches(err))
    }

    /// `consecutive_failures` counts the failure being decided on.
    pub fn decide(&self, err: &UpstreamError, consecutive_failures: u32) -> RetryDecision {
        let Some(rule) = self.rule_for(err) else {
            return RetryDecision::Fail;
        };
        if consecutive_failures >= self.max_consecutive_failures {
            return RetryDecision::GiveUp;
        }
        let delay = match err.retry_after() {
            Some(d) if rule.honor_retry_after => d,
            _ => rule.backoff.delay(consecutive_failures),
        };
        RetryDecision::Retry(delay)
    }
}
