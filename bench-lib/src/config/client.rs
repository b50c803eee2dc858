use std::{fmt, str::FromStr};

use super::ConfigError;

/// Arrival discipline of the virtual clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LoopKind {
    /// At most one outstanding request per virtual client,
    /// paced by a think time after every completion.
    #[default]
    Closed,

    /// Requests are issued on schedule,
    /// regardless of outstanding responses.
    Open,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
        }
    }
}

impl FromStr for LoopKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("closed") {
            Ok(Self::Closed)
        } else if s.eq_ignore_ascii_case("open") {
            Ok(Self::Open)
        } else {
            Err(ConfigError::unknown("client kind", s))
        }
    }
}
