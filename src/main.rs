//! mcp-validate - MCP server handshake and compliance validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod errors;
mod protocol;
mod reporter;
mod scanner;
mod session;
mod transport;
mod validator;

use auth::{AuthConfig, OAuthFlow};
use reporter::Report;
use transport::{ServerTarget, TransportConfig, TransportKind};
use validator::{EngineConfig, EngineOutcome, Profile, ValidationEngine, ValidatorKind};

/// Validate an MCP server: handshake, capabilities, and security posture
#[derive(Parser)]
#[command(
    name = "mcp-validate",
    version,
    about = "Validate an MCP server's protocol handshake, capabilities, and security posture",
    long_about = "Connects to a Model Context Protocol server over stdio, streamable HTTP, or SSE,\n\
                  runs the initialize handshake, probes the advertised capabilities, and writes a\n\
                  compliance report. Exit code 0 means every check passed; 1 means at least one failed."
)]
struct Cli {
    /// Server to validate: a URL, or a command followed by its arguments
    #[arg(required = true, trailing_var_arg = true)]
    server: Vec<String>,

    /// Transport binding (stdio, http, sse); detected from the target when omitted
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Validation profile (basic, comprehensive, security_focused, development)
    #[arg(short, long, env = validator::PROFILE_ENV_VAR)]
    profile: Option<Profile>,

    /// Run these validators even if the profile leaves them out
    #[arg(long, value_delimiter = ',')]
    enable: Vec<ValidatorKind>,

    /// Skip these validators even if the profile includes them
    #[arg(long, value_delimiter = ',')]
    disable: Vec<ValidatorKind>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Bearer token for HTTP/SSE servers
    #[arg(long, env = "MCP_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Acquire a token via the OAuth authorization-code flow before validating
    #[arg(long, conflicts_with = "auth_token")]
    oauth: bool,

    /// Pre-registered OAuth client id (skips dynamic registration)
    #[arg(long, requires = "oauth")]
    client_id: Option<String>,

    /// Secret for the pre-registered OAuth client
    #[arg(long, requires = "client_id")]
    client_secret: Option<String>,

    /// OAuth scope to request
    #[arg(long, requires = "oauth")]
    scope: Option<String>,

    /// Print the authorization URL instead of opening a browser
    #[arg(long, requires = "oauth")]
    no_browser: bool,

    /// Write the JSON report to this path
    #[arg(long, value_name = "PATH")]
    json_report: Option<PathBuf>,

    /// Skip the external mcp-scan security scan
    #[arg(long)]
    skip_mcp_scan: bool,

    /// Keep the raw mcp-scan output at this path
    #[arg(long, value_name = "PATH")]
    save_scan_results: Option<PathBuf>,

    /// Environment variable for the server process, KEY=VALUE (repeatable)
    #[arg(short, long, value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress the console summary; the exit code and report still tell the story
    #[arg(short, long)]
    quiet: bool,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn init_logging(verbosity: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbosity {
            0 => EnvFilter::new("mcp_validate=info"),
            1 => EnvFilter::new("mcp_validate=debug"),
            2 => EnvFilter::new("mcp_validate=trace"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_target(server: &[String], env: &[(String, String)]) -> (ServerTarget, TransportKind) {
    let first = &server[0];
    let detected = TransportKind::detect(first);
    let target = match detected {
        TransportKind::Stdio => ServerTarget::Command {
            program: first.clone(),
            args: server[1..].to_vec(),
            env: env.to_vec(),
        },
        TransportKind::Http | TransportKind::Sse => ServerTarget::Endpoint { url: first.clone() },
    };
    (target, detected)
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let (target, detected) = build_target(&cli.server, &cli.env);
    let kind = cli.transport.unwrap_or(detected);
    let profile = cli.profile.unwrap_or_default();

    let mut auth_token = cli.auth_token.clone();
    if cli.oauth {
        let url = match &target {
            ServerTarget::Endpoint { url } => url.clone(),
            ServerTarget::Command { .. } => {
                return Err(miette::miette!(
                    "--oauth only applies to HTTP/SSE servers, not spawned commands"
                ));
            }
        };
        let flow = OAuthFlow::new(
            &url,
            AuthConfig {
                client_id: cli.client_id.clone(),
                client_secret: cli.client_secret.clone(),
                scope: cli.scope.clone(),
                no_browser: cli.no_browser,
            },
        )
        .map_err(errors::ValidationError::from)?;
        let token = flow
            .acquire_token()
            .await
            .map_err(errors::ValidationError::from)?;
        tracing::info!(token = %token.masked(), "authorization complete");
        auth_token = Some(token.access_token);
    }

    let timeout = Duration::from_secs(cli.timeout.max(1));
    let transport_config = TransportConfig {
        timeout,
        auth_token,
        ..TransportConfig::default()
    };
    // A server we cannot even reach still gets a report: the checklist
    // documents the point of failure instead of the run aborting silently.
    let transport = match transport::open(kind, &target, &transport_config).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(error = %e, "could not open transport");
            let outcome = EngineOutcome::setup_failure(e.to_string());
            emit_report(&cli, &outcome, profile, &target)?;
            std::process::exit(1);
        }
    };

    let engine_config = EngineConfig {
        profile,
        enable: cli.enable.clone(),
        disable: cli.disable.clone(),
        timeout,
        validator_timeouts: HashMap::new(),
        skip_security_scan: cli.skip_mcp_scan,
        target: target.clone(),
        save_scan_results: cli.save_scan_results.clone(),
    };

    let outcome = ValidationEngine::new(engine_config).run(transport).await;

    let report = emit_report(&cli, &outcome, profile, &target)?;
    if !report.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}

fn emit_report(
    cli: &Cli,
    outcome: &EngineOutcome,
    profile: Profile,
    target: &ServerTarget,
) -> Result<Report, errors::ValidationError> {
    let report = Report::build(outcome, profile, &target.describe(), &cli.env);
    if let Some(ref path) = cli.json_report {
        report.write_to(path)?;
    }
    if !cli.quiet {
        report.print_summary();
    }
    Ok(report)
}
