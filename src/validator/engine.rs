//! Orchestrates the selected validators against one server.
//!
//! Validators run in profile order, each under its own timeout. A
//! validator that errors or times out becomes a failed checklist entry;
//! its siblings still run. Teardown always runs, whatever happened.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::errors::ValidationError;
use crate::protocol::jsonrpc::error_codes;
use crate::protocol::mcp::ServerCapabilities;
use crate::protocol::HandshakeState;
use crate::scanner::{ScanSummary, SecurityScanner};
use crate::session::{DiscoveredItems, Session};
use crate::transport::{ServerTarget, Transport};

use super::profile::{resolve_validators, Profile};
use super::{CheckResult, Checklist, ValidatorKind};

/// Ping slower than this is a warning even when it succeeds.
const SLOW_PING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub profile: Profile,
    pub enable: Vec<ValidatorKind>,
    pub disable: Vec<ValidatorKind>,
    /// Global request timeout; also the per-validator budget unless
    /// overridden in `validator_timeouts`.
    pub timeout: Duration,
    pub validator_timeouts: HashMap<ValidatorKind, Duration>,
    pub skip_security_scan: bool,
    pub target: ServerTarget,
    pub save_scan_results: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new(target: ServerTarget) -> Self {
        Self {
            profile: Profile::default(),
            enable: Vec::new(),
            disable: Vec::new(),
            timeout: Duration::from_secs(30),
            validator_timeouts: HashMap::new(),
            skip_security_scan: false,
            target,
            save_scan_results: None,
        }
    }

    fn budget_for(&self, kind: ValidatorKind) -> Duration {
        self.validator_timeouts
            .get(&kind)
            .copied()
            // Leave headroom over a single request timeout so the request
            // deadline fires first and produces the better diagnostic.
            .unwrap_or_else(|| self.timeout + Duration::from_secs(5))
    }
}

/// Everything the run learned about the server, for the report.
#[derive(Debug, Clone)]
pub struct ServerObservations {
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub protocol_version: Option<String>,
    pub capabilities: Option<ServerCapabilities>,
    pub discovered: DiscoveredItems,
    pub version_warning: Option<String>,
    pub handshake_state: HandshakeState,
    pub failure: Option<String>,
}

#[derive(Debug)]
pub struct EngineOutcome {
    pub checklist: Checklist,
    pub security: Option<ScanSummary>,
    pub server: ServerObservations,
}

impl EngineOutcome {
    pub fn is_valid(&self) -> bool {
        self.checklist.is_valid()
    }

    /// Outcome for a run that never reached the server. The checklist
    /// carries one failed entry documenting where setup stopped, so the
    /// report still gets built and written.
    pub fn setup_failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut checklist = Checklist::new();
        checklist.add(CheckResult::fail(
            ValidatorKind::Protocol,
            "connect",
            reason.clone(),
        ));
        Self {
            checklist,
            security: None,
            server: ServerObservations {
                server_name: None,
                server_version: None,
                protocol_version: None,
                capabilities: None,
                discovered: DiscoveredItems::default(),
                version_warning: None,
                handshake_state: HandshakeState::Failed,
                failure: Some(reason),
            },
        }
    }
}

pub struct ValidationEngine {
    config: EngineConfig,
}

impl ValidationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, transport: Box<dyn Transport>) -> EngineOutcome {
        let selected = resolve_validators(
            self.config.profile,
            &self.config.enable,
            &self.config.disable,
        );
        tracing::info!(
            profile = %self.config.profile,
            validators = ?selected.iter().map(|k| k.name()).collect::<Vec<_>>(),
            "starting validation run"
        );

        let mut session = Session::new(transport, self.config.timeout);
        let mut checklist = Checklist::new();
        let mut security = None;

        for kind in selected {
            let started = Instant::now();
            let budget = self.config.budget_for(kind);

            let produced = match kind {
                ValidatorKind::Security => {
                    let (results, summary) = self.run_security(budget).await;
                    security = summary;
                    results
                }
                _ => {
                    let fut = run_session_validator(kind, &mut session);
                    match tokio::time::timeout(budget, fut).await {
                        Ok(results) => results,
                        Err(_) => {
                            let reason =
                                format!("validator did not finish within {}s", budget.as_secs());
                            // Cancelling the future can strand the
                            // handshake mid-transition; land it in Failed.
                            session.fail_handshake(reason.clone());
                            vec![CheckResult::fail(kind, kind.name(), reason)]
                        }
                    }
                }
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            for result in produced {
                let result = if result.duration_ms == 0 {
                    result.with_duration(elapsed_ms)
                } else {
                    result
                };
                checklist.add(result);
            }
        }

        // A handshake that got through initialize but never failed is
        // closed out as Complete.
        let state = session.handshake().state();
        if matches!(
            state,
            HandshakeState::Initialized | HandshakeState::ProbingCapabilities
        ) {
            if let Err(e) = session.complete() {
                tracing::warn!(error = %e, "could not complete handshake");
            }
        }

        session.teardown().await;

        let server = observe(&session);
        tracing::info!(
            passed = checklist.count(super::CheckStatus::Passed),
            failed = checklist.count(super::CheckStatus::Failed),
            warnings = checklist.count(super::CheckStatus::Warning),
            skipped = checklist.count(super::CheckStatus::Skipped),
            "validation run finished"
        );

        EngineOutcome {
            checklist,
            security,
            server,
        }
    }

    async fn run_security(&self, budget: Duration) -> (Vec<CheckResult>, Option<ScanSummary>) {
        let kind = ValidatorKind::Security;
        if self.config.skip_security_scan {
            return (
                vec![CheckResult::skip(kind, "scan", "security scan disabled")],
                None,
            );
        }

        let mut scanner = SecurityScanner::new(self.config.target.clone());
        if let Some(ref path) = self.config.save_scan_results {
            scanner = scanner.save_results_to(path.clone());
        }

        let outcome = match tokio::time::timeout(budget, scanner.run()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return (
                    vec![CheckResult::warning(
                        kind,
                        "scan",
                        format!("security scan did not finish within {}s", budget.as_secs()),
                    )],
                    None,
                )
            }
        };

        match outcome {
            Ok(summary) => {
                let result = summarize_scan(&summary);
                (vec![result], Some(summary))
            }
            Err(e) if e.is_unavailable() => (
                vec![CheckResult::skip(kind, "scan", e.to_string())],
                None,
            ),
            Err(e) => (
                vec![CheckResult::warning(
                    kind,
                    "scan",
                    format!("security scan failed: {}", e),
                )],
                None,
            ),
        }
    }
}

fn summarize_scan(summary: &ScanSummary) -> CheckResult {
    let kind = ValidatorKind::Security;
    let mut details = Vec::new();
    if !summary.vulnerability_types.is_empty() {
        details.push(format!(
            "vulnerability types: {}",
            summary.vulnerability_types.join(", ")
        ));
    }
    if !summary.issue_codes.is_empty() {
        details.push(format!("issue codes: {}", summary.issue_codes.join(", ")));
    }

    if summary.has_critical_findings() {
        CheckResult::fail(
            kind,
            "scan",
            format!(
                "{} vulnerabilities and {} critical issues across {} tools",
                summary.vulnerabilities_found,
                summary.critical_codes.len(),
                summary.tools_scanned
            ),
        )
        .with_details(details)
    } else if summary.issues_found > 0 {
        CheckResult::warning(
            kind,
            "scan",
            format!("{} non-critical issues reported", summary.issues_found),
        )
        .with_details(details)
    } else {
        CheckResult::pass(
            kind,
            "scan",
            format!("{} tools scanned, no findings", summary.tools_scanned),
        )
    }
}

async fn run_session_validator(kind: ValidatorKind, session: &mut Session) -> Vec<CheckResult> {
    // Everything after the protocol validator needs a live handshake.
    if kind != ValidatorKind::Protocol && !handshake_ready(session) {
        return vec![CheckResult::skip(
            kind,
            kind.name(),
            match session.handshake().failure() {
                Some(reason) => format!("handshake failed: {}", reason),
                None => "handshake was not initialized".to_string(),
            },
        )];
    }

    match kind {
        ValidatorKind::Protocol => run_protocol(session).await,
        ValidatorKind::Capabilities => run_capabilities(session).await,
        ValidatorKind::Ping => run_ping(session).await,
        ValidatorKind::ErrorCompliance => run_error_compliance(session).await,
        ValidatorKind::Security => unreachable!("security runs outside the session"),
    }
}

fn handshake_ready(session: &Session) -> bool {
    matches!(
        session.handshake().state(),
        HandshakeState::Initialized | HandshakeState::ProbingCapabilities | HandshakeState::Complete
    )
}

async fn run_protocol(session: &mut Session) -> Vec<CheckResult> {
    let kind = ValidatorKind::Protocol;

    if session.handshake().state() != HandshakeState::NotStarted {
        return vec![CheckResult::skip(
            kind,
            "initialize",
            "handshake already attempted",
        )];
    }

    match session.initialize().await {
        Ok(()) => {
            let mut results = Vec::new();
            let server = session
                .handshake()
                .server_info()
                .map(|(name, version)| format!("{} {}", name, version))
                .unwrap_or_else(|| "unknown server".to_string());
            results.push(CheckResult::pass(
                kind,
                "initialize",
                format!("handshake accepted by {}", server),
            ));

            match session.version_warning() {
                Some(warning) => {
                    results.push(CheckResult::warning(kind, "protocol_version", warning))
                }
                None => {
                    let version = session
                        .handshake()
                        .negotiated_version()
                        .unwrap_or("unknown");
                    results.push(CheckResult::pass(
                        kind,
                        "protocol_version",
                        format!("negotiated {}", version),
                    ));
                }
            }
            results
        }
        Err(e) => vec![CheckResult::fail(kind, "initialize", e.to_string())],
    }
}

async fn run_capabilities(session: &mut Session) -> Vec<CheckResult> {
    let kind = ValidatorKind::Capabilities;
    let mut results = Vec::new();

    if session.handshake().state() == HandshakeState::Initialized {
        if let Err(e) = session.begin_probing() {
            return vec![CheckResult::fail(kind, "probe", e.to_string())];
        }
    }

    let advertised = (
        session.handshake().server_has_tools(),
        session.handshake().server_has_prompts(),
        session.handshake().server_has_resources(),
    );

    if advertised.0 {
        results.push(probe_list(kind, "tools", session.list_tools().await));
    } else {
        results.push(CheckResult::skip(kind, "tools", "capability not advertised"));
    }

    if advertised.1 {
        results.push(probe_list(kind, "prompts", session.list_prompts().await));
    } else {
        results.push(CheckResult::skip(
            kind,
            "prompts",
            "capability not advertised",
        ));
    }

    if advertised.2 {
        results.push(probe_list(kind, "resources", session.list_resources().await));
    } else {
        results.push(CheckResult::skip(
            kind,
            "resources",
            "capability not advertised",
        ));
    }

    results
}

/// An advertised capability answering with an empty list still passes;
/// only a refused or malformed probe fails.
fn probe_list(
    kind: ValidatorKind,
    check: &str,
    outcome: Result<Vec<String>, ValidationError>,
) -> CheckResult {
    match outcome {
        Ok(names) => CheckResult::pass(kind, check, format!("{} items listed", names.len()))
            .with_details(names),
        Err(e) => CheckResult::fail(kind, check, e.to_string()),
    }
}

async fn run_ping(session: &mut Session) -> Vec<CheckResult> {
    let kind = ValidatorKind::Ping;
    match session.ping().await {
        Ok(Some(rtt)) if rtt > SLOW_PING => vec![CheckResult::warning(
            kind,
            "ping",
            format!("ping answered in {}ms", rtt.as_millis()),
        )],
        Ok(Some(rtt)) => vec![CheckResult::pass(
            kind,
            "ping",
            format!("ping answered in {}ms", rtt.as_millis()),
        )],
        Ok(None) => vec![CheckResult::warning(
            kind,
            "ping",
            "server does not implement ping (method not found)",
        )],
        Err(ValidationError::Timeout { timeout_secs, .. }) => vec![CheckResult::warning(
            kind,
            "ping",
            format!("no ping response within {}s", timeout_secs),
        )],
        Err(e) => vec![CheckResult::fail(kind, "ping", e.to_string())],
    }
}

async fn run_error_compliance(session: &mut Session) -> Vec<CheckResult> {
    let kind = ValidatorKind::ErrorCompliance;
    match session.probe_unknown_method().await {
        Ok(response) => match response.error {
            Some(error) if error.code == error_codes::METHOD_NOT_FOUND => {
                vec![CheckResult::pass(
                    kind,
                    "unknown_method",
                    "unknown method answered with -32601",
                )]
            }
            Some(error) => vec![CheckResult::warning(
                kind,
                "unknown_method",
                format!(
                    "unknown method answered with code {} instead of -32601",
                    error.code
                ),
            )],
            None => vec![CheckResult::fail(
                kind,
                "unknown_method",
                "server returned a result for a method that does not exist",
            )],
        },
        Err(ValidationError::Timeout { timeout_secs, .. }) => vec![CheckResult::warning(
            kind,
            "unknown_method",
            format!("no response to unknown method within {}s", timeout_secs),
        )],
        Err(e) => vec![CheckResult::fail(kind, "unknown_method", e.to_string())],
    }
}

fn observe(session: &Session) -> ServerObservations {
    let handshake = session.handshake();
    let (server_name, server_version) = match handshake.server_info() {
        Some((n, v)) => (Some(n.to_string()), Some(v.to_string())),
        None => (None, None),
    };
    ServerObservations {
        server_name,
        server_version,
        protocol_version: handshake.negotiated_version().map(str::to_string),
        capabilities: handshake.server_capabilities().cloned(),
        discovered: session.discovered().clone(),
        version_warning: session.version_warning().map(str::to_string),
        handshake_state: handshake.state(),
        failure: handshake.failure().map(str::to_string),
    }
}
