//! Per-object requeue backoff

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use kube::runtime::controller::Action;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, ErrorAction};

const BASE_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(300);

fn exponential() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(BASE_DELAY)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(MAX_DELAY)
        .with_max_elapsed_time(None)
        .build()
}

/// Doubling requeue delay per object name, reset by a successful pass
#[derive(Debug, Default)]
pub struct RetryBackoff {
    objects: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl RetryBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay for the next retry of `name`
    pub fn next_delay(&self, name: &str) -> Duration {
        self.objects
            .lock()
            .entry(name.to_string())
            .or_insert_with(exponential)
            .next_backoff()
            .unwrap_or(MAX_DELAY)
    }

    pub fn reset(&self, name: &str) {
        if let Some(backoff) = self.objects.lock().get_mut(name) {
            backoff.reset();
        }
    }

    /// Requeue action for a failed pass of `name`
    pub fn action_for(&self, name: &str, error: &Error) -> Action {
        match error.action() {
            ErrorAction::RequeueWithBackoff => Action::requeue(self.next_delay(name)),
            ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
            ErrorAction::NoRequeue => Action::await_change(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = RetryBackoff::new();
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(5));
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(10));
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(20));
        assert_eq!(backoff.next_delay("b"), Duration::from_secs(5));
        for _ in 0..5 {
            backoff.next_delay("a");
        }
        assert_eq!(backoff.next_delay("a"), MAX_DELAY);

        backoff.reset("a");
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(5));
    }

    #[test]
    fn test_action_follows_error() {
        let backoff = RetryBackoff::new();
        assert_eq!(
            backoff.action_for("a", &Error::Configuration("bad".into())),
            Action::await_change()
        );
        assert_eq!(
            backoff.action_for("a", &Error::NodeSelectorConflict("b".into())),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            backoff.action_for("a", &Error::Internal("boom".into())),
            Action::requeue(BASE_DELAY)
        );
    }
}
