//! Category-specific structural validation.
//!
//! Each category declares required structural features as data. The validator
//! runs every rule against collected text and emits a pass/fail outcome plus
//! a confidence penalty. A per-source variant scores each provider response
//! independently so the merger can down-weight weak sources.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::weighting::WeightedResponse;

/// One structural requirement for a category's collected text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    /// A section heading or keyword must appear (case-insensitive).
    RequiredSection { keyword: String },
    /// At least `count` numeric values must be present.
    MinNumericValues { count: usize },
    /// At least `count` non-empty paragraphs.
    MinSectionCount { count: usize },
    /// A markdown table must be present.
    RequiredTable,
    /// Minimum total length in characters.
    MinLength { chars: usize },
}

impl ValidationRule {
    fn check(&self, text: &str) -> bool {
        match self {
            Self::RequiredSection { keyword } => {
                text.to_ascii_lowercase().contains(&keyword.to_ascii_lowercase())
            }
            Self::MinNumericValues { count } => numeric_pattern().find_iter(text).count() >= *count,
            Self::MinSectionCount { count } => {
                text.split("\n\n").filter(|p| !p.trim().is_empty()).count() >= *count
            }
            Self::RequiredTable => text.lines().any(|l| {
                let t = l.trim();
                t.starts_with('|') && t.ends_with('|') && t.len() > 2
            }),
            Self::MinLength { chars } => text.chars().count() >= *chars,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::RequiredSection { keyword } => format!("required section '{}'", keyword),
            Self::MinNumericValues { count } => format!("at least {} numeric values", count),
            Self::MinSectionCount { count } => format!("at least {} sections", count),
            Self::RequiredTable => "required table".to_string(),
            Self::MinLength { chars } => format!("minimum length {} chars", chars),
        }
    }
}

fn numeric_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+(?:[.,]\d+)?\s*(?:%|USD|\$|mg|kg|Da|°C)?").unwrap())
}

/// Result of validating one category's combined text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    /// Fraction of rules that passed, 0..1.
    pub score: f64,
    pub failed_rules: Vec<String>,
    /// Subtracted from downstream confidence; never drives it below 0.
    pub confidence_penalty: f64,
}

impl ValidationOutcome {
    /// Outcome for a category with no configured rules.
    pub fn vacuous() -> Self {
        Self {
            passed: true,
            score: 1.0,
            failed_rules: Vec::new(),
            confidence_penalty: 0.0,
        }
    }

    /// Apply this outcome's penalty to a confidence value, clamped at 0.
    pub fn apply_penalty(&self, confidence: f64) -> f64 {
        (confidence - self.confidence_penalty).max(0.0)
    }
}

/// Per-source validation result used by the merger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceValidation {
    pub provider: String,
    pub model: String,
    pub rules_total: usize,
    pub rules_passed: usize,
    pub pass_rate: f64,
    pub validation_passed: bool,
}

/// Validator configured from a category's verification criteria.
#[derive(Debug, Clone, Default)]
pub struct CategoryValidator {
    rules: Vec<ValidationRule>,
    /// Penalty per failed rule, 0..1 overall after clamping.
    penalty_per_failure: f64,
}

impl CategoryValidator {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self {
            rules,
            penalty_per_failure: 0.1,
        }
    }

    pub fn with_penalty_per_failure(mut self, penalty: f64) -> Self {
        self.penalty_per_failure = penalty.clamp(0.0, 1.0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate the combined text of verified responses.
    pub fn validate(&self, text: &str) -> ValidationOutcome {
        if self.rules.is_empty() {
            return ValidationOutcome::vacuous();
        }

        let mut failed = Vec::new();
        for rule in &self.rules {
            if !rule.check(text) {
                failed.push(rule.describe());
            }
        }

        let passed_count = self.rules.len() - failed.len();
        let score = passed_count as f64 / self.rules.len() as f64;
        ValidationOutcome {
            passed: failed.is_empty(),
            score,
            confidence_penalty: (failed.len() as f64 * self.penalty_per_failure).min(1.0),
            failed_rules: failed,
        }
    }

    /// Validate each provider response independently.
    pub fn validate_sources(&self, responses: &[WeightedResponse]) -> Vec<SourceValidation> {
        responses
            .iter()
            .map(|r| {
                let outcome = self.validate(&r.response.text);
                let rules_total = self.rules.len();
                let rules_passed = rules_total - outcome.failed_rules.len();
                SourceValidation {
                    provider: r.response.provider.clone(),
                    model: r.response.model.clone(),
                    rules_total,
                    rules_passed,
                    pass_rate: if rules_total == 0 {
                        1.0
                    } else {
                        rules_passed as f64 / rules_total as f64
                    },
                    validation_passed: outcome.passed,
                }
            })
            .collect()
    }
}
