//! Waiting time policy for optional inputs.

use chrono::{DateTime, Duration, Utc};
use regex_lite::Regex;

use crate::config::InputWaitingConfig;

use super::ResolveError;

struct WaitingRule {
    processor_name: Regex,
    processor_version: Regex,
    input_id: Regex,
    waiting: Duration,
}

/// Decides when a missing optional input may be dropped.
///
/// Rules are matched in order on processor name, processor version and input id
/// (whole-string matches). An input without a matching rule is never waited for.
pub struct InputTimeoutChecker {
    rules: Vec<WaitingRule>,
}

impl InputTimeoutChecker {
    pub fn new(configs: &[InputWaitingConfig]) -> Result<Self, ResolveError> {
        let rules = configs
            .iter()
            .map(|c| {
                Ok(WaitingRule {
                    processor_name: anchored(&c.processor_name_regexp)?,
                    processor_version: anchored(&c.processor_version_regexp)?,
                    input_id: anchored(&c.input_id_regexp)?,
                    waiting: Duration::seconds(c.waiting_time_secs as i64),
                })
            })
            .collect::<Result<Vec<_>, ResolveError>>()?;
        Ok(Self { rules })
    }

    /// Checker without rules: optional inputs time out immediately.
    pub fn immediate() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn waiting_time(&self, processor: &str, version: &str, input_id: &str) -> Option<Duration> {
        self.rules
            .iter()
            .find(|r| {
                r.processor_name.is_match(processor)
                    && r.processor_version.is_match(version)
                    && r.input_id.is_match(input_id)
            })
            .map(|r| r.waiting)
    }

    /// True once the waiting time elapsed since `since`.
    pub fn is_timed_out(
        &self,
        processor: &str,
        version: &str,
        input_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.waiting_time(processor, version, input_id) {
            Some(waiting) => now - since >= waiting,
            None => true,
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex, ResolveError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| ResolveError::InvalidWaitingRule {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> InputTimeoutChecker {
        InputTimeoutChecker::new(&[
            InputWaitingConfig {
                processor_name_regexp: "L0_ASP".to_string(),
                processor_version_regexp: "3\\..*".to_string(),
                input_id_regexp: "aux_ins".to_string(),
                waiting_time_secs: 600,
            },
            InputWaitingConfig {
                processor_name_regexp: ".*".to_string(),
                processor_version_regexp: ".*".to_string(),
                input_id_regexp: ".*".to_string(),
                waiting_time_secs: 60,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let checker = checker();
        assert_eq!(
            checker.waiting_time("L0_ASP", "3.40", "aux_ins"),
            Some(Duration::seconds(600))
        );
        assert_eq!(
            checker.waiting_time("L0_ASP", "2.0", "aux_ins"),
            Some(Duration::seconds(60))
        );
    }

    #[test]
    fn test_patterns_match_whole_value() {
        let checker = InputTimeoutChecker::new(&[InputWaitingConfig {
            processor_name_regexp: "L0".to_string(),
            processor_version_regexp: ".*".to_string(),
            input_id_regexp: ".*".to_string(),
            waiting_time_secs: 10,
        }])
        .unwrap();
        assert!(checker.waiting_time("L0_ASP", "1", "x").is_none());
        assert!(checker.waiting_time("L0", "1", "x").is_some());
    }

    #[test]
    fn test_timeout_boundary() {
        let checker = checker();
        let since = Utc::now();
        let at = |secs| since + Duration::seconds(secs);

        assert!(!checker.is_timed_out("L0_ASP", "3.40", "aux_ins", since, at(599)));
        assert!(checker.is_timed_out("L0_ASP", "3.40", "aux_ins", since, at(600)));
        assert!(checker.is_timed_out("L0_ASP", "3.40", "aux_ins", since, at(601)));
    }

    #[test]
    fn test_no_rule_times_out_immediately() {
        let now = Utc::now();
        assert!(InputTimeoutChecker::immediate().is_timed_out("P", "1", "x", now, now));
    }

    #[test]
    fn test_invalid_pattern() {
        let result = InputTimeoutChecker::new(&[InputWaitingConfig {
            processor_name_regexp: "(".to_string(),
            processor_version_regexp: ".*".to_string(),
            input_id_regexp: ".*".to_string(),
            waiting_time_secs: 10,
        }]);
        assert!(matches!(result, Err(ResolveError::InvalidWaitingRule { .. })));
    }
}
