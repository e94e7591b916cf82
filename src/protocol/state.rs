//! Handshake state machine for a validation session

use thiserror::Error;

use super::mcp::ServerCapabilities;

/// Lifecycle phases of a single validation handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Transport opened, nothing sent yet
    NotStarted,
    /// Initialize request sent, awaiting response
    Initializing,
    /// Initialize response accepted, initialized notification sent
    Initialized,
    /// Capability list probes in flight
    ProbingCapabilities,
    /// Handshake and probes finished
    Complete,
    /// Terminal error state
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Complete | HandshakeState::Failed)
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeState::NotStarted => write!(f, "NotStarted"),
            HandshakeState::Initializing => write!(f, "Initializing"),
            HandshakeState::Initialized => write!(f, "Initialized"),
            HandshakeState::ProbingCapabilities => write!(f, "ProbingCapabilities"),
            HandshakeState::Complete => write!(f, "Complete"),
            HandshakeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Error for a transition the lifecycle does not allow
#[derive(Debug, Clone, Error)]
#[error("invalid handshake transition from {from} to {to}")]
pub struct HandshakeTransitionError {
    pub from: HandshakeState,
    pub to: HandshakeState,
}

/// Tracks handshake progress plus what the server told us about itself.
///
/// Discovered facts survive a later failure so the report can still show
/// the server identity from a handshake that died during probing.
#[derive(Debug, Default)]
pub struct HandshakeContext {
    state: Option<HandshakeState>,
    negotiated_version: Option<String>,
    server_capabilities: Option<ServerCapabilities>,
    server_info: Option<(String, String)>,
    failure: Option<String>,
}

impl HandshakeContext {
    pub fn new() -> Self {
        Self {
            state: Some(HandshakeState::NotStarted),
            ..Default::default()
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state.unwrap_or(HandshakeState::NotStarted)
    }

    pub fn is_complete(&self) -> bool {
        self.state() == HandshakeState::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.state() == HandshakeState::Failed
    }

    pub fn transition_to(
        &mut self,
        next: HandshakeState,
    ) -> Result<(), HandshakeTransitionError> {
        let current = self.state();
        let valid = match (current, next) {
            (HandshakeState::NotStarted, HandshakeState::Initializing) => true,
            (HandshakeState::Initializing, HandshakeState::Initialized) => true,
            (HandshakeState::Initialized, HandshakeState::ProbingCapabilities) => true,
            (HandshakeState::ProbingCapabilities, HandshakeState::Complete) => true,
            // Probing is optional: a server with no list capabilities
            // completes straight from Initialized.
            (HandshakeState::Initialized, HandshakeState::Complete) => true,
            // Failure is reachable from any non-terminal state.
            (s, HandshakeState::Failed) if !s.is_terminal() => true,
            _ => false,
        };

        if valid {
            self.state = Some(next);
            Ok(())
        } else {
            Err(HandshakeTransitionError { from: current, to: next })
        }
    }

    /// Record the accepted initialize response and advance to Initialized.
    pub fn accept_initialize(
        &mut self,
        version: String,
        capabilities: ServerCapabilities,
        server_name: String,
        server_version: String,
    ) -> Result<(), HandshakeTransitionError> {
        self.transition_to(HandshakeState::Initialized)?;
        self.negotiated_version = Some(version);
        self.server_capabilities = Some(capabilities);
        self.server_info = Some((server_name, server_version));
        Ok(())
    }

    /// Mark the handshake failed. Discovered server facts are kept.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state().is_terminal() {
            self.state = Some(HandshakeState::Failed);
        }
        self.failure.get_or_insert(reason.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn negotiated_version(&self) -> Option<&str> {
        self.negotiated_version.as_deref()
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_capabilities.as_ref()
    }

    pub fn server_info(&self) -> Option<(&str, &str)> {
        self.server_info
            .as_ref()
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn server_has_tools(&self) -> bool {
        self.server_capabilities
            .as_ref()
            .map(|c| c.has_tools())
            .unwrap_or(false)
    }

    pub fn server_has_resources(&self) -> bool {
        self.server_capabilities
            .as_ref()
            .map(|c| c.has_resources())
            .unwrap_or(false)
    }

    pub fn server_has_prompts(&self) -> bool {
        self.server_capabilities
            .as_ref()
            .map(|c| c.has_prompts())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with_tools() -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(Default::default()),
            ..Default::default()
        }
    }

    #[test]
    fn starts_in_not_started() {
        let ctx = HandshakeContext::new();
        assert_eq!(ctx.state(), HandshakeState::NotStarted);
        assert!(!ctx.is_complete());
        assert!(!ctx.is_failed());
    }

    #[test]
    fn happy_path_transitions() {
        let mut ctx = HandshakeContext::new();
        ctx.transition_to(HandshakeState::Initializing).unwrap();
        ctx.accept_initialize(
            "2025-06-18".to_string(),
            caps_with_tools(),
            "demo".to_string(),
            "1.0".to_string(),
        )
        .unwrap();
        ctx.transition_to(HandshakeState::ProbingCapabilities)
            .unwrap();
        ctx.transition_to(HandshakeState::Complete).unwrap();
        assert!(ctx.is_complete());
    }

    #[test]
    fn probe_phase_may_be_skipped() {
        let mut ctx = HandshakeContext::new();
        ctx.transition_to(HandshakeState::Initializing).unwrap();
        ctx.accept_initialize(
            "2025-06-18".to_string(),
            ServerCapabilities::default(),
            "bare".to_string(),
            "0.1".to_string(),
        )
        .unwrap();
        assert!(ctx.transition_to(HandshakeState::Complete).is_ok());
    }

    #[test]
    fn cannot_skip_forward() {
        let mut ctx = HandshakeContext::new();
        assert!(ctx.transition_to(HandshakeState::Initialized).is_err());
        assert!(ctx.transition_to(HandshakeState::Complete).is_err());
        assert_eq!(ctx.state(), HandshakeState::NotStarted);
    }

    #[test]
    fn cannot_move_backward() {
        let mut ctx = HandshakeContext::new();
        ctx.transition_to(HandshakeState::Initializing).unwrap();
        assert!(ctx.transition_to(HandshakeState::NotStarted).is_err());
    }

    #[test]
    fn failure_reachable_from_any_live_state() {
        for advance in 0..4 {
            let mut ctx = HandshakeContext::new();
            let path = [
                HandshakeState::Initializing,
                HandshakeState::Initialized,
                HandshakeState::ProbingCapabilities,
            ];
            for s in path.iter().take(advance) {
                if *s == HandshakeState::Initialized {
                    ctx.accept_initialize(
                        "2025-06-18".to_string(),
                        caps_with_tools(),
                        "s".to_string(),
                        "1".to_string(),
                    )
                    .unwrap();
                } else {
                    ctx.transition_to(*s).unwrap();
                }
            }
            ctx.fail("boom");
            assert!(ctx.is_failed());
        }
    }

    #[test]
    fn complete_is_terminal() {
        let mut ctx = HandshakeContext::new();
        ctx.transition_to(HandshakeState::Initializing).unwrap();
        ctx.accept_initialize(
            "2025-06-18".to_string(),
            ServerCapabilities::default(),
            "s".to_string(),
            "1".to_string(),
        )
        .unwrap();
        ctx.transition_to(HandshakeState::Complete).unwrap();

        // A late failure cannot leave the terminal state.
        ctx.fail("too late");
        assert!(ctx.is_complete());
        assert!(!ctx.is_failed());
    }

    #[test]
    fn failure_keeps_discovered_facts() {
        let mut ctx = HandshakeContext::new();
        ctx.transition_to(HandshakeState::Initializing).unwrap();
        ctx.accept_initialize(
            "2025-03-26".to_string(),
            caps_with_tools(),
            "demo".to_string(),
            "2.0".to_string(),
        )
        .unwrap();
        ctx.fail("probe exploded");

        assert!(ctx.is_failed());
        assert_eq!(ctx.failure(), Some("probe exploded"));
        assert_eq!(ctx.negotiated_version(), Some("2025-03-26"));
        assert_eq!(ctx.server_info(), Some(("demo", "2.0")));
        assert!(ctx.server_has_tools());
    }

    #[test]
    fn first_failure_reason_wins() {
        let mut ctx = HandshakeContext::new();
        ctx.fail("first");
        ctx.fail("second");
        assert_eq!(ctx.failure(), Some("first"));
    }

    #[test]
    fn capability_checks_default_false() {
        let ctx = HandshakeContext::new();
        assert!(!ctx.server_has_tools());
        assert!(!ctx.server_has_resources());
        assert!(!ctx.server_has_prompts());
    }

    #[test]
    fn state_display_names() {
        assert_eq!(HandshakeState::NotStarted.to_string(), "NotStarted");
        assert_eq!(
            HandshakeState::ProbingCapabilities.to_string(),
            "ProbingCapabilities"
        );
        assert_eq!(HandshakeState::Failed.to_string(), "Failed");
    }

    #[test]
    fn transition_error_display() {
        let err = HandshakeTransitionError {
            from: HandshakeState::NotStarted,
            to: HandshakeState::Complete,
        };
        assert_eq!(
            err.to_string(),
            "invalid handshake transition from NotStarted to Complete"
        );
    }
}
