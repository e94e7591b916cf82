//! Validation framework: validator identities, check results, and the
//! checklist the engine accumulates into.
//!
//! The set of validators is closed. Profiles and command-line overrides
//! select from [`ValidatorKind::ALL`]; an unknown name is a configuration
//! error, never a silent no-op.

mod engine;
mod profile;

pub use engine::{EngineConfig, EngineOutcome, ServerObservations, ValidationEngine};
pub use profile::{resolve_validators, Profile, PROFILE_ENV_VAR};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every validator the engine knows how to run, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    Protocol,
    Capabilities,
    Ping,
    ErrorCompliance,
    Security,
}

impl ValidatorKind {
    pub const ALL: [ValidatorKind; 5] = [
        ValidatorKind::Protocol,
        ValidatorKind::Capabilities,
        ValidatorKind::Ping,
        ValidatorKind::ErrorCompliance,
        ValidatorKind::Security,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ValidatorKind::Protocol => "protocol",
            ValidatorKind::Capabilities => "capabilities",
            ValidatorKind::Ping => "ping",
            ValidatorKind::ErrorCompliance => "error_compliance",
            ValidatorKind::Security => "security",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            ValidatorKind::Protocol => Category::Protocol,
            ValidatorKind::Capabilities => Category::Capability,
            ValidatorKind::Ping => Category::Protocol,
            ValidatorKind::ErrorCompliance => Category::Protocol,
            ValidatorKind::Security => Category::Security,
        }
    }
}

impl fmt::Display for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown validator '{0}'; known validators: protocol, capabilities, ping, error_compliance, security")]
pub struct UnknownValidator(pub String);

impl FromStr for ValidatorKind {
    type Err = UnknownValidator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "protocol" => Ok(ValidatorKind::Protocol),
            "capabilities" => Ok(ValidatorKind::Capabilities),
            "ping" => Ok(ValidatorKind::Ping),
            "error_compliance" | "errors" => Ok(ValidatorKind::ErrorCompliance),
            "security" => Ok(ValidatorKind::Security),
            _ => Err(UnknownValidator(s.to_string())),
        }
    }
}

/// Check grouping used by the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Protocol,
    Capability,
    Security,
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Category::Protocol => "protocol",
            Category::Capability => "capability",
            Category::Security => "security",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Warning,
    Skipped,
}

/// One finding from one validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub validator: String,
    pub check: String,
    pub category: Category,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    fn new(
        kind: ValidatorKind,
        check: impl Into<String>,
        status: CheckStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            validator: kind.name().to_string(),
            check: check.into(),
            category: kind.category(),
            status,
            message: message.into(),
            details: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn pass(kind: ValidatorKind, check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(kind, check, CheckStatus::Passed, message)
    }

    pub fn fail(kind: ValidatorKind, check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(kind, check, CheckStatus::Failed, message)
    }

    pub fn warning(
        kind: ValidatorKind,
        check: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(kind, check, CheckStatus::Warning, message)
    }

    pub fn skip(kind: ValidatorKind, check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(kind, check, CheckStatus::Skipped, message)
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Accumulated results of a run. A run is valid exactly when no entry
/// failed; warnings and skips do not affect validity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checklist {
    pub results: Vec<CheckResult>,
}

impl Checklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: CheckResult) {
        match result.status {
            CheckStatus::Passed => {
                tracing::debug!(validator = %result.validator, check = %result.check, "check passed")
            }
            CheckStatus::Failed => {
                tracing::warn!(validator = %result.validator, check = %result.check, message = %result.message, "check failed")
            }
            CheckStatus::Warning => {
                tracing::info!(validator = %result.validator, check = %result.check, message = %result.message, "check warning")
            }
            CheckStatus::Skipped => {
                tracing::debug!(validator = %result.validator, check = %result.check, "check skipped")
            }
        }
        self.results.push(result);
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn is_valid(&self) -> bool {
        self.count(CheckStatus::Failed) == 0
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.results.iter().map(|r| r.duration_ms).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Failed)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Warning)
    }

    pub fn by_category(&self, category: Category) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(move |r| r.category == category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_names_round_trip() {
        for kind in ValidatorKind::ALL {
            let parsed: ValidatorKind = kind.name().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn from_str_accepts_aliases_and_hyphens() {
        assert_eq!(
            "errors".parse::<ValidatorKind>().unwrap(),
            ValidatorKind::ErrorCompliance
        );
        assert_eq!(
            "error-compliance".parse::<ValidatorKind>().unwrap(),
            ValidatorKind::ErrorCompliance
        );
        assert_eq!(
            " Protocol ".parse::<ValidatorKind>().unwrap(),
            ValidatorKind::Protocol
        );
    }

    #[test]
    fn from_str_rejects_unknown_names() {
        let err = "fuzzing".parse::<ValidatorKind>().unwrap_err();
        assert!(err.to_string().contains("fuzzing"));
    }

    #[test]
    fn serde_names_are_snake_case() {
        let json = serde_json::to_string(&ValidatorKind::ErrorCompliance).unwrap();
        assert_eq!(json, "\"error_compliance\"");
        let status = serde_json::to_string(&CheckStatus::Passed).unwrap();
        assert_eq!(status, "\"passed\"");
    }

    #[test]
    fn empty_checklist_is_valid() {
        assert!(Checklist::new().is_valid());
    }

    #[test]
    fn failed_entry_invalidates() {
        let mut checklist = Checklist::new();
        checklist.add(CheckResult::pass(
            ValidatorKind::Protocol,
            "initialize",
            "ok",
        ));
        assert!(checklist.is_valid());

        checklist.add(CheckResult::fail(
            ValidatorKind::Protocol,
            "id_echo",
            "mismatch",
        ));
        assert!(!checklist.is_valid());
        assert_eq!(checklist.count(CheckStatus::Failed), 1);
    }

    #[test]
    fn warnings_and_skips_keep_validity() {
        let mut checklist = Checklist::new();
        checklist.add(CheckResult::warning(ValidatorKind::Ping, "latency", "slow"));
        checklist.add(CheckResult::skip(
            ValidatorKind::Capabilities,
            "tools",
            "not advertised",
        ));
        assert!(checklist.is_valid());
        assert_eq!(checklist.count(CheckStatus::Warning), 1);
        assert_eq!(checklist.count(CheckStatus::Skipped), 1);
    }

    #[test]
    fn duration_sums_across_entries() {
        let mut checklist = Checklist::new();
        checklist.add(CheckResult::pass(ValidatorKind::Protocol, "a", "ok").with_duration(12));
        checklist.add(CheckResult::pass(ValidatorKind::Ping, "b", "ok").with_duration(30));
        assert_eq!(checklist.total_duration_ms(), 42);
    }

    #[test]
    fn category_filter() {
        let mut checklist = Checklist::new();
        checklist.add(CheckResult::pass(ValidatorKind::Protocol, "a", "ok"));
        checklist.add(CheckResult::pass(ValidatorKind::Capabilities, "b", "ok"));
        checklist.add(CheckResult::pass(ValidatorKind::Security, "c", "ok"));

        assert_eq!(checklist.by_category(Category::Protocol).count(), 1);
        assert_eq!(checklist.by_category(Category::Capability).count(), 1);
        assert_eq!(checklist.by_category(Category::Security).count(), 1);
    }

    #[test]
    fn details_and_duration_builders() {
        let result = CheckResult::pass(ValidatorKind::Capabilities, "tools", "3 tools")
            .with_details(vec!["echo".to_string(), "add".to_string()])
            .with_duration(7);
        assert_eq!(result.details.len(), 2);
        assert_eq!(result.duration_ms, 7);
        assert_eq!(result.validator, "capabilities");
        assert_eq!(result.category, Category::Capability);
    }
}
