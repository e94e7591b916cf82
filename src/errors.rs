//! Error taxonomy shared across the engine
//!
//! Each layer has its own thiserror enum (`TransportError`, `AuthError`,
//! state errors); this module adds the protocol-violation category and the
//! top-level diagnostic enum the CLI reports through.

use miette::Diagnostic;
use thiserror::Error;

use crate::auth::AuthError;
use crate::transport::TransportError;

/// The server answered, but not the way the protocol allows.
#[derive(Debug, Clone, Error)]
pub enum ProtocolViolation {
    #[error("response id {got} does not match the outstanding request id {expected}")]
    IdMismatch { expected: String, got: String },

    #[error("initialize result carries no protocolVersion")]
    MissingProtocolVersion,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("initialize was answered with an error: {0}")]
    InitializeRejected(String),
}

/// Top-level failure of a validation run
#[derive(Debug, Error, Diagnostic)]
pub enum ValidationError {
    #[error("transport failure: {0}")]
    #[diagnostic(
        code(mcp_validate::transport),
        help("Check that the server command or endpoint is correct and the server is running")
    )]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    #[diagnostic(
        code(mcp_validate::protocol),
        help("The server does not follow the MCP handshake; see the report for details")
    )]
    Protocol(#[from] ProtocolViolation),

    #[error("authorization failed: {0}")]
    #[diagnostic(
        code(mcp_validate::auth),
        help("Supply a token with --auth-token or complete the browser authorization")
    )]
    Auth(#[from] AuthError),

    #[error("timed out after {timeout_secs}s")]
    #[diagnostic(
        code(mcp_validate::timeout),
        help("Try --timeout {suggested_timeout} or check whether the server responds at all")
    )]
    Timeout {
        timeout_secs: u64,
        suggested_timeout: u64,
    },

    #[error("validator '{validator}' failed to execute: {message}")]
    #[diagnostic(code(mcp_validate::validator))]
    ValidatorExecution { validator: String, message: String },

    #[error("could not write report: {message}")]
    #[diagnostic(code(mcp_validate::report))]
    Report { message: String },
}

impl ValidationError {
    pub fn timeout(timeout_secs: u64) -> Self {
        Self::Timeout {
            timeout_secs,
            suggested_timeout: timeout_secs * 2,
        }
    }

    pub fn validator(validator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidatorExecution {
            validator: validator.into(),
            message: message.into(),
        }
    }
}
