//! MCP server validation engine.
//!
//! Connects to a Model Context Protocol server over stdio, streamable
//! HTTP, or SSE, runs the initialize handshake, probes the advertised
//! capabilities, and produces a machine-readable compliance report.
//!
//! # Modules
//!
//! - `transport` - stdio/HTTP/SSE bindings behind one `Transport` trait
//! - `protocol` - JSON-RPC envelopes, MCP types, handshake state machine
//! - `session` - one validation session against one server
//! - `auth` - OAuth 2.0 authorization-code flow with PKCE
//! - `validator` - the validators, profiles, and orchestration engine
//! - `scanner` - optional external security scan via mcp-scan
//! - `reporter` - JSON report and console summary
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_validate::transport::{self, ServerTarget, TransportConfig, TransportKind};
//! use mcp_validate::validator::{EngineConfig, ValidationEngine};
//!
//! let target = ServerTarget::Command {
//!     program: "node".into(),
//!     args: vec!["server.js".into()],
//!     env: vec![],
//! };
//! let transport = transport::open(
//!     TransportKind::Stdio,
//!     &target,
//!     &TransportConfig::default(),
//! )
//! .await?;
//! let outcome = ValidationEngine::new(EngineConfig::new(target))
//!     .run(transport)
//!     .await;
//! assert!(outcome.is_valid());
//! ```

pub mod auth;
pub mod errors;
pub mod protocol;
pub mod reporter;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod validator;

// Re-export commonly used types
pub use errors::{ProtocolViolation, ValidationError};
pub use reporter::Report;
pub use session::Session;
pub use validator::{EngineConfig, EngineOutcome, Profile, ValidationEngine};
