//! External security scan via the `mcp-scan` tool.
//!
//! The scanner is optional: when neither `uvx` nor a standalone
//! `mcp-scan` binary is on PATH, the scan is reported as unavailable and
//! the run continues. Issue codes starting with `TF` or `E` count as
//! critical findings; everything else is informational.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::process::Command;

use crate::transport::ServerTarget;

const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("mcp-scan is not installed (neither uvx nor mcp-scan found on PATH)")]
    Unavailable,

    #[error("mcp-scan could not be launched: {0}")]
    Launch(#[source] std::io::Error),

    #[error("mcp-scan timed out after {0:?}")]
    Timeout(Duration),

    #[error("mcp-scan exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("mcp-scan output could not be parsed: {0}")]
    BadOutput(String),

    #[error("could not write scan config: {0}")]
    Config(#[source] std::io::Error),
}

impl ScanError {
    /// Scan errors never fail a validation run outright; the engine
    /// records unavailability as a skip and anything else as a warning.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ScanError::Unavailable)
    }
}

/// Aggregated outcome of one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub tools_scanned: usize,
    pub vulnerabilities_found: usize,
    pub vulnerability_types: Vec<String>,
    pub risk_levels: Vec<String>,
    pub issues_found: usize,
    pub issue_codes: Vec<String>,
    pub critical_codes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_file: Option<PathBuf>,
}

impl ScanSummary {
    pub fn has_critical_findings(&self) -> bool {
        self.vulnerabilities_found > 0 || !self.critical_codes.is_empty()
    }
}

/// How to invoke mcp-scan, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanCommand {
    Uvx(PathBuf),
    Direct(PathBuf),
}

impl ScanCommand {
    fn discover() -> Option<Self> {
        if let Ok(uvx) = which::which("uvx") {
            return Some(ScanCommand::Uvx(uvx));
        }
        which::which("mcp-scan").ok().map(ScanCommand::Direct)
    }

    fn build(&self, config_path: &Path) -> Command {
        let mut cmd = match self {
            ScanCommand::Uvx(uvx) => {
                let mut cmd = Command::new(uvx);
                cmd.arg("mcp-scan@latest");
                cmd
            }
            ScanCommand::Direct(bin) => Command::new(bin),
        };
        cmd.arg("--json")
            .arg("--suppress-mcpserver-io")
            .arg("true")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

pub struct SecurityScanner {
    target: ServerTarget,
    save_results_to: Option<PathBuf>,
}

impl SecurityScanner {
    pub fn new(target: ServerTarget) -> Self {
        Self {
            target,
            save_results_to: None,
        }
    }

    /// Also keep the raw scan JSON on disk at the given path.
    pub fn save_results_to(mut self, path: PathBuf) -> Self {
        self.save_results_to = Some(path);
        self
    }

    pub async fn run(&self) -> Result<ScanSummary, ScanError> {
        let command = ScanCommand::discover().ok_or(ScanError::Unavailable)?;

        let config = self.write_config()?;
        let config_path = config.path().to_path_buf();
        tracing::debug!(config = %config_path.display(), "running mcp-scan");

        let child = command
            .build(&config_path)
            .spawn()
            .map_err(ScanError::Launch)?;

        let output = tokio::time::timeout(SCAN_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ScanError::Timeout(SCAN_TIMEOUT))?
            .map_err(ScanError::Launch)?;

        if !output.status.success() {
            return Err(ScanError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .chars()
                    .take(500)
                    .collect(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| ScanError::BadOutput(e.to_string()))?;

        let mut summary = parse_scan_output(&raw);

        if let Some(ref path) = self.save_results_to {
            if let Err(e) = std::fs::write(path, stdout.as_bytes()) {
                tracing::warn!(path = %path.display(), error = %e, "could not save scan results");
            } else {
                summary.scan_file = Some(path.clone());
            }
        }

        Ok(summary)
    }

    /// mcp-scan reads the standard MCP client config file layout.
    fn write_config(&self) -> Result<tempfile::NamedTempFile, ScanError> {
        let server = match &self.target {
            ServerTarget::Command { program, args, env } => {
                let env_map: BTreeMap<&str, &str> = env
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                json!({
                    "command": program,
                    "args": args,
                    "env": env_map,
                })
            }
            ServerTarget::Endpoint { url } => json!({ "url": url }),
        };
        let config = json!({ "mcpServers": { "target": server } });

        let mut file = tempfile::Builder::new()
            .prefix("mcp-validate-scan-")
            .suffix(".json")
            .tempfile()
            .map_err(ScanError::Config)?;
        file.write_all(config.to_string().as_bytes())
            .map_err(ScanError::Config)?;
        Ok(file)
    }
}

fn is_critical_code(code: &str) -> bool {
    code.starts_with("TF") || code.starts_with('E')
}

/// Walk mcp-scan's JSON: per scanned config there is a server list whose
/// signatures carry tools and vulnerability annotations, plus a flat
/// issue list with stable codes.
fn parse_scan_output(raw: &Value) -> ScanSummary {
    let mut summary = ScanSummary::default();

    let scan_results = match raw.get("scan_results").or(Some(raw)) {
        Some(Value::Object(map)) => map,
        _ => return summary,
    };

    for per_config in scan_results.values() {
        let servers = per_config
            .get("servers")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for server in servers {
            let signature = match server.get("signature") {
                Some(sig) => sig,
                None => continue,
            };

            if let Some(tools) = signature.get("tools").and_then(Value::as_array) {
                summary.tools_scanned += tools.len();
            }

            if let Some(vulns) = signature.get("vulnerabilities").and_then(Value::as_array) {
                summary.vulnerabilities_found += vulns.len();
                for vuln in vulns {
                    if let Some(kind) = vuln.get("type").and_then(Value::as_str) {
                        if !summary.vulnerability_types.iter().any(|t| t == kind) {
                            summary.vulnerability_types.push(kind.to_string());
                        }
                    }
                    if let Some(risk) = vuln.get("risk").and_then(Value::as_str) {
                        if !summary.risk_levels.iter().any(|r| r == risk) {
                            summary.risk_levels.push(risk.to_string());
                        }
                    }
                }
            }
        }

        let issues = per_config
            .get("issues")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for issue in issues {
            summary.issues_found += 1;
            if let Some(code) = issue.get("code").and_then(Value::as_str) {
                summary.issue_codes.push(code.to_string());
                if is_critical_code(code) {
                    summary.critical_codes.push(code.to_string());
                }
            }
        }
    }

    summary
}
