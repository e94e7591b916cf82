//! Report building and output.
//!
//! The report is a pure function of the run outcome: building it twice
//! from the same outcome yields the same document apart from the
//! timestamp. File writes go through a temp file in the target directory
//! and a rename, so a crash never leaves a half-written report behind.

use std::io::Write as _;
use std::path::Path;

use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::auth::mask_secret;
use crate::errors::ValidationError;
use crate::scanner::ScanSummary;
use crate::validator::{CheckResult, CheckStatus, EngineOutcome, Profile};

const TOOL_NAME: &str = env!("CARGO_PKG_NAME");
const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub timestamp: String,
    pub tool: String,
    pub version: String,
    pub profile: String,
    pub target: String,
    /// Environment variables handed to the server, values masked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_checks: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
    pub is_valid: bool,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    pub handshake_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_warning: Option<String>,
    /// Present only for capabilities that were advertised and probed, so
    /// an empty list stays distinguishable from "never advertised".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub report_metadata: ReportMetadata,
    pub validation_summary: ValidationSummary,
    pub server_information: ServerInformation,
    pub validator_results: Vec<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_analysis: Option<ScanSummary>,
}

impl Report {
    pub fn build(
        outcome: &EngineOutcome,
        profile: Profile,
        target: &str,
        environment: &[(String, String)],
    ) -> Self {
        let checklist = &outcome.checklist;
        Self {
            report_metadata: ReportMetadata {
                timestamp: chrono::Utc::now().to_rfc3339(),
                tool: TOOL_NAME.to_string(),
                version: TOOL_VERSION.to_string(),
                profile: profile.name().to_string(),
                target: target.to_string(),
                environment: environment
                    .iter()
                    .map(|(k, v)| (k.clone(), mask_secret(v)))
                    .collect(),
            },
            validation_summary: ValidationSummary {
                total_checks: checklist.results.len(),
                passed: checklist.count(CheckStatus::Passed),
                failed: checklist.count(CheckStatus::Failed),
                warnings: checklist.count(CheckStatus::Warning),
                skipped: checklist.count(CheckStatus::Skipped),
                is_valid: checklist.is_valid(),
                total_duration_ms: checklist.total_duration_ms(),
            },
            server_information: ServerInformation {
                name: outcome.server.server_name.clone(),
                version: outcome.server.server_version.clone(),
                protocol_version: outcome.server.protocol_version.clone(),
                handshake_state: outcome.server.handshake_state.to_string(),
                failure: outcome.server.failure.clone(),
                version_warning: outcome.server.version_warning.clone(),
                tools: outcome.server.discovered.tools.clone(),
                prompts: outcome.server.discovered.prompts.clone(),
                resources: outcome.server.discovered.resources.clone(),
            },
            validator_results: checklist.results.clone(),
            security_analysis: outcome.security.clone(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validation_summary.is_valid
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string_pretty(self).map_err(|e| ValidationError::Report {
            message: e.to_string(),
        })
    }

    /// Write the report next to its final name and rename into place.
    pub fn write_to(&self, path: &Path) -> Result<(), ValidationError> {
        let json = self.to_json()?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());

        let mut file = tempfile::Builder::new()
            .prefix(".mcp-validate-report-")
            .tempfile_in(dir.unwrap_or_else(|| Path::new(".")))
            .map_err(|e| ValidationError::Report {
                message: e.to_string(),
            })?;
        file.write_all(json.as_bytes())
            .map_err(|e| ValidationError::Report {
                message: e.to_string(),
            })?;
        file.persist(path).map_err(|e| ValidationError::Report {
            message: e.to_string(),
        })?;

        tracing::info!(path = %path.display(), "report written");
        Ok(())
    }

    /// Human summary on stdout. One line per finding that needs
    /// attention, counts for the rest.
    pub fn print_summary(&self) {
        let summary = &self.validation_summary;
        let server = &self.server_information;

        println!();
        match (&server.name, &server.version) {
            (Some(name), Some(version)) => {
                println!("  Server: {} {}", name.bold(), version);
            }
            _ => println!("  Server: {}", "not identified".dimmed()),
        }
        if let Some(ref version) = server.protocol_version {
            println!("  Protocol: {}", version);
        }
        if let Some(ref warning) = server.version_warning {
            println!("  {} {}", "!".yellow().bold(), warning.yellow());
        }
        println!();

        for result in &self.validator_results {
            match result.status {
                CheckStatus::Failed => {
                    println!(
                        "  {} {}/{}: {}",
                        "FAIL".red().bold(),
                        result.validator,
                        result.check,
                        result.message
                    );
                    for detail in &result.details {
                        println!("         {}", detail.dimmed());
                    }
                }
                CheckStatus::Warning => {
                    println!(
                        "  {} {}/{}: {}",
                        "WARN".yellow().bold(),
                        result.validator,
                        result.check,
                        result.message
                    );
                }
                _ => {}
            }
        }

        println!();
        let verdict = if summary.is_valid {
            "VALID".green().bold()
        } else {
            "INVALID".red().bold()
        };
        println!(
            "  {} {} passed, {} failed, {} warnings, {} skipped ({}ms)",
            verdict,
            summary.passed,
            summary.failed,
            summary.warnings,
            summary.skipped,
            summary.total_duration_ms
        );
        if let Some(ref failure) = server.failure {
            println!("  {} {}", "handshake:".red(), failure);
        }
        if let Some(ref scan) = self.security_analysis {
            println!(
                "  security: {} tools scanned, {} vulnerabilities, {} issues",
                scan.tools_scanned, scan.vulnerabilities_found, scan.issues_found
            );
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HandshakeState;
    use crate::session::DiscoveredItems;
    use crate::validator::{Checklist, ServerObservations, ValidatorKind};

    fn outcome_with(checklist: Checklist) -> EngineOutcome {
        EngineOutcome {
            checklist,
            security: None,
            server: ServerObservations {
                server_name: Some("demo".to_string()),
                server_version: Some("1.0.0".to_string()),
                protocol_version: Some("2025-06-18".to_string()),
                capabilities: None,
                discovered: DiscoveredItems::default(),
                version_warning: None,
                handshake_state: HandshakeState::Complete,
                failure: None,
            },
        }
    }

    fn sample_outcome() -> EngineOutcome {
        let mut checklist = Checklist::new();
        checklist.add(
            CheckResult::pass(ValidatorKind::Protocol, "initialize", "ok").with_duration(12),
        );
        checklist.add(
            CheckResult::warning(ValidatorKind::Ping, "ping", "slow").with_duration(1100),
        );
        checklist.add(CheckResult::skip(
            ValidatorKind::Capabilities,
            "prompts",
            "capability not advertised",
        ));
        outcome_with(checklist)
    }

    #[test]
    fn summary_counts_match_checklist() {
        let report = Report::build(&sample_outcome(), Profile::Comprehensive, "demo", &[]);
        assert_eq!(report.validation_summary.total_checks, 3);
        assert_eq!(report.validation_summary.passed, 1);
        assert_eq!(report.validation_summary.warnings, 1);
        assert_eq!(report.validation_summary.skipped, 1);
        assert_eq!(report.validation_summary.failed, 0);
        assert!(report.is_valid());
        assert_eq!(report.validation_summary.total_duration_ms, 1112);
    }

    #[test]
    fn failed_entry_makes_report_invalid() {
        let mut checklist = Checklist::new();
        checklist.add(CheckResult::fail(
            ValidatorKind::Protocol,
            "initialize",
            "rejected",
        ));
        let report = Report::build(&outcome_with(checklist), Profile::Basic, "demo", &[]);
        assert!(!report.is_valid());
    }

    #[test]
    fn environment_values_are_masked() {
        let env = vec![(
            "API_KEY".to_string(),
            "sk-1234567890abcdef".to_string(),
        )];
        let report = Report::build(&sample_outcome(), Profile::Basic, "demo", &env);
        let (key, value) = &report.report_metadata.environment[0];
        assert_eq!(key, "API_KEY");
        assert!(!value.contains("567890abc"));
        assert!(value.contains("..."));
    }

    #[test]
    fn json_round_trips() {
        let report = Report::build(&sample_outcome(), Profile::Comprehensive, "demo", &[]);
        let json = report.to_json().unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.validation_summary.total_checks, 3);
        assert_eq!(parsed.report_metadata.tool, TOOL_NAME);
    }

    #[test]
    fn build_is_idempotent_apart_from_timestamp() {
        let outcome = sample_outcome();
        let mut a = Report::build(&outcome, Profile::Basic, "demo", &[]);
        let mut b = Report::build(&outcome, Profile::Basic, "demo", &[]);
        a.report_metadata.timestamp = String::new();
        b.report_metadata.timestamp = String::new();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn write_to_creates_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let report = Report::build(&sample_outcome(), Profile::Basic, "demo", &[]);
        report.write_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Report = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.report_metadata.target, "demo");

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "report.json")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn print_summary_does_not_panic() {
        let report = Report::build(&sample_outcome(), Profile::Comprehensive, "demo", &[]);
        report.print_summary();
    }
}
