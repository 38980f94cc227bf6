use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Workflow thoroughness level. Each tier maps to a default budget template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DepthTier {
    Quick,
    #[default]
    Standard,
    Comprehensive,
}

impl DepthTier {
    pub const ALL: [DepthTier; 3] = [Self::Quick, Self::Standard, Self::Comprehensive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for DepthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepthTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "comprehensive" => Ok(Self::Comprehensive),
            _ => Err(format!("Invalid analysis depth: {}", s)),
        }
    }
}
