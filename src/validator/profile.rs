//! Built-in validation profiles and the enable/disable resolution rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ValidatorKind;

/// Environment variable that selects the profile when the CLI flag is absent.
pub const PROFILE_ENV_VAR: &str = "MCP_VALIDATION_PROFILE";

/// Named, ordered selections of validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Basic,
    Comprehensive,
    SecurityFocused,
    Development,
}

impl Default for Profile {
    fn default() -> Self {
        Profile::Comprehensive
    }
}

impl Profile {
    pub fn name(&self) -> &'static str {
        match self {
            Profile::Basic => "basic",
            Profile::Comprehensive => "comprehensive",
            Profile::SecurityFocused => "security_focused",
            Profile::Development => "development",
        }
    }

    /// Validators this profile runs, in execution order.
    pub fn validators(&self) -> &'static [ValidatorKind] {
        match self {
            Profile::Basic => &[ValidatorKind::Protocol, ValidatorKind::Capabilities],
            Profile::Comprehensive => &ValidatorKind::ALL,
            Profile::SecurityFocused => &[ValidatorKind::Protocol, ValidatorKind::Security],
            Profile::Development => &[
                ValidatorKind::Protocol,
                ValidatorKind::Capabilities,
                ValidatorKind::Ping,
            ],
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown profile '{0}'; known profiles: basic, comprehensive, security_focused, development")]
pub struct UnknownProfile(pub String);

impl FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "basic" => Ok(Profile::Basic),
            "comprehensive" => Ok(Profile::Comprehensive),
            "security_focused" => Ok(Profile::SecurityFocused),
            "development" => Ok(Profile::Development),
            _ => Err(UnknownProfile(s.to_string())),
        }
    }
}

/// Final validator list: the profile's members, minus `disable`, plus
/// `enable` (appended in canonical order). Overrides beat membership in
/// both directions; disabling something the profile never ran is a no-op.
pub fn resolve_validators(
    profile: Profile,
    enable: &[ValidatorKind],
    disable: &[ValidatorKind],
) -> Vec<ValidatorKind> {
    let mut selected: Vec<ValidatorKind> = profile
        .validators()
        .iter()
        .copied()
        .filter(|kind| !disable.contains(kind))
        .collect();

    for kind in ValidatorKind::ALL {
        if enable.contains(&kind) && !disable.contains(&kind) && !selected.contains(&kind) {
            selected.push(kind);
        }
    }

    selected
}
