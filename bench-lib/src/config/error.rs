use std::fmt;

/// Fatal configuration problem, detected before any virtual client
/// or listener is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A named strategy (kind, loop discipline, workload shape, work) is not known.
    UnknownVariant { what: &'static str, value: String },
    /// A (numeric) parameter is out of its valid range.
    InvalidValue { name: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn unknown(what: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            what,
            value: value.into(),
        }
    }

    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVariant { what, value } => write!(f, "unknown {what}: '{value}'"),
            Self::InvalidValue { name, reason } => write!(f, "invalid value for {name}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
