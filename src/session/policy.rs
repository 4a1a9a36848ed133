//! Passphrase strength policies

use crate::config::PassphrasePolicyConfig;
use crate::error::PolicyViolation;

/// Pluggable passphrase validator
pub trait PassphrasePolicy: Send + Sync {
    /// Return every rule the candidate breaks; empty means acceptable
    fn violations(&self, candidate: &str) -> Vec<PolicyViolation>;

    fn accepts(&self, candidate: &str) -> bool {
        self.violations(candidate).is_empty()
    }
}

/// Length and character-class policy
#[derive(Debug, Clone)]
pub struct StrengthPolicy {
    pub min_length: usize,
    pub require_lowercase: bool,
    pub require_uppercase: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
}

impl StrengthPolicy {
    pub fn from_config(config: &PassphrasePolicyConfig) -> Self {
        StrengthPolicy {
            min_length: config.min_length,
            require_lowercase: config.require_lowercase,
            require_uppercase: config.require_uppercase,
            require_digit: config.require_digit,
            require_symbol: config.require_symbol,
        }
    }
}

impl Default for StrengthPolicy {
    fn default() -> Self {
        Self::from_config(&PassphrasePolicyConfig::default())
    }
}

impl PassphrasePolicy for StrengthPolicy {
    fn violations(&self, candidate: &str) -> Vec<PolicyViolation> {
        if candidate.is_empty() {
            return vec![PolicyViolation::Empty];
        }

        let mut violations = Vec::new();

        // Length counts characters, not bytes
        if candidate.chars().count() < self.min_length {
            violations.push(PolicyViolation::TooShort {
                min: self.min_length,
            });
        }
        if self.require_lowercase && !candidate.chars().any(char::is_lowercase) {
            violations.push(PolicyViolation::MissingLowercase);
        }
        if self.require_uppercase && !candidate.chars().any(char::is_uppercase) {
            violations.push(PolicyViolation::MissingUppercase);
        }
        if self.require_digit && !candidate.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PolicyViolation::MissingDigit);
        }
        if self.require_symbol
            && !candidate
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        {
            violations.push(PolicyViolation::MissingSymbol);
        }

        violations
    }
}

/// Policy accepting any non-empty passphrase, used to re-open an existing
/// vault whose passphrase predates the current policy
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyPolicy;

impl PassphrasePolicy for NonEmptyPolicy {
    fn violations(&self, candidate: &str) -> Vec<PolicyViolation> {
        if candidate.is_empty() {
            vec![PolicyViolation::Empty]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = StrengthPolicy::default();
        assert!(policy.accepts("Correct-Horse-42"));
        assert_eq!(policy.violations(""), vec![PolicyViolation::Empty]);

        let v = policy.violations("short");
        assert!(v.contains(&PolicyViolation::TooShort { min: 12 }));
        assert!(v.contains(&PolicyViolation::MissingUppercase));
        assert!(v.contains(&PolicyViolation::MissingDigit));
        assert!(!v.contains(&PolicyViolation::MissingLowercase));
    }

    #[test]
    fn test_symbol_requirement() {
        let policy = StrengthPolicy {
            min_length: 4,
            require_lowercase: false,
            require_uppercase: false,
            require_digit: false,
            require_symbol: true,
        };
        assert_eq!(policy.violations("abcd"), vec![PolicyViolation::MissingSymbol]);
        assert!(policy.accepts("ab!d"));
        assert!(!policy.accepts("ab d"));
    }

    #[test]
    fn test_length_counts_characters() {
        let policy = StrengthPolicy {
            min_length: 4,
            require_lowercase: false,
            require_uppercase: false,
            require_digit: false,
            require_symbol: false,
        };
        // 3 characters, 6 bytes
        assert!(!policy.accepts("äöü"));
    }

    #[test]
    fn test_non_empty_policy() {
        assert!(NonEmptyPolicy.accepts("x"));
        assert!(!NonEmptyPolicy.accepts(""));
    }
}
