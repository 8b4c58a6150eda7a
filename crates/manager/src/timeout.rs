//! Per-class request timeout budgets

use crate::config::TimeoutSettings;
use protocol::TimeoutClass;
use std::time::Duration;

/// Resolved budgets for each timeout class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub autonomous: Duration,
    pub autonomous_long: Duration,
    pub user_interaction: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            autonomous: protocol::TIMEOUT_AUTONOMOUS,
            autonomous_long: protocol::TIMEOUT_AUTONOMOUS_LONG,
            user_interaction: protocol::TIMEOUT_USER_INTERACTION,
        }
    }
}

impl TimeoutPolicy {
    pub fn from_settings(settings: &TimeoutSettings) -> Self {
        Self {
            autonomous: settings.autonomous(),
            autonomous_long: settings.autonomous_long(),
            user_interaction: settings.user_interaction(),
        }
    }

    /// Budget for `class`; `None` means wait indefinitely
    pub fn budget(&self, class: TimeoutClass) -> Option<Duration> {
        match class {
            TimeoutClass::Autonomous => Some(self.autonomous),
            TimeoutClass::AutonomousLong => Some(self.autonomous_long),
            TimeoutClass::UserInteraction => Some(self.user_interaction),
            TimeoutClass::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_class_defaults() {
        let policy = TimeoutPolicy::default();
        for class in [
            TimeoutClass::Autonomous,
            TimeoutClass::AutonomousLong,
            TimeoutClass::UserInteraction,
            TimeoutClass::None,
        ] {
            assert_eq!(policy.budget(class), class.default_budget());
        }
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = TimeoutSettings {
            autonomous_ms: 250,
            autonomous_long_ms: 500,
            user_interaction_ms: 1_000,
        };
        let policy = TimeoutPolicy::from_settings(&settings);

        assert_eq!(
            policy.budget(TimeoutClass::Autonomous),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            policy.budget(TimeoutClass::UserInteraction),
            Some(Duration::from_secs(1))
        );
        assert_eq!(policy.budget(TimeoutClass::None), None);
    }
}
