use std::{fmt, str::FromStr, time::Duration};

use rama::telemetry::tracing;

use super::ConfigError;

/// Request handling strategy of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ServerKind {
    /// Execute the requested work, nothing more.
    /// Used to measure pure overhead and regressions.
    #[default]
    Vanilla,

    /// Variable processing latency on top of the requested work.
    /// Used to observe queuing and tail latency.
    Latency,

    /// Unstable processing: errors, dropped connections and stalls.
    /// Used to test error handling and resilience of the client side.
    Flaky,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vanilla => f.write_str("vanilla"),
            Self::Latency => f.write_str("latency"),
            Self::Flaky => f.write_str("flaky"),
        }
    }
}

impl FromStr for ServerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("vanilla") {
            Ok(Self::Vanilla)
        } else if s.eq_ignore_ascii_case("latency") {
            Ok(Self::Latency)
        } else if s.eq_ignore_ascii_case("flaky") {
            Ok(Self::Flaky)
        } else {
            Err(ConfigError::unknown("server kind", s))
        }
    }
}

/// Server side processing knobs.
/// Each [`ServerKind`] has defaults, explicitly passed values overwrite them.
#[derive(Debug, Clone, clap::Args, Default)]
pub struct ServerTuning {
    /// Base processing time added before the work is executed.
    #[arg(long, value_name = "SECONDS")]
    pub base_latency: Option<f64>,

    /// Random delay added to (or subtracted from) base_latency.
    #[arg(long, value_name = "SECONDS")]
    pub jitter: Option<f64>,

    /// Probability of answering with an error.
    #[arg(long)]
    pub error_rate: Option<f32>,

    /// Probability of dropping the connection without answering.
    #[arg(long)]
    pub drop_rate: Option<f32>,

    /// Probability of never finishing the request (it turns into a timeout).
    #[arg(long)]
    pub stall_rate: Option<f32>,
}

impl ServerKind {
    /// Default tuning associated with this kind.
    pub fn default_tuning(self) -> ServerTuning {
        match self {
            ServerKind::Vanilla => ServerTuning::default(),
            ServerKind::Latency => ServerTuning {
                base_latency: Some(0.005),
                jitter: Some(0.005),
                ..Default::default()
            },
            ServerKind::Flaky => ServerTuning {
                base_latency: Some(0.01),
                jitter: Some(0.01),
                error_rate: Some(0.05),
                drop_rate: Some(0.01),
                stall_rate: Some(0.01),
            },
        }
    }

    /// Resolve the processing strategy, once, at startup.
    pub fn resolve(self, overwrite: ServerTuning) -> Result<Strategy, ConfigError> {
        let tuning = merge_tuning(self, overwrite);

        let latency = || -> Result<LatencyProfile, ConfigError> {
            let base = tuning.base_latency.unwrap_or_default();
            let jitter = tuning.jitter.unwrap_or_default();
            if !base.is_finite() || base < 0. {
                return Err(ConfigError::invalid("base latency", format!("{base}")));
            }
            if !jitter.is_finite() || jitter < 0. {
                return Err(ConfigError::invalid("jitter", format!("{jitter}")));
            }
            Ok(LatencyProfile {
                base: secs_to_duration(base),
                jitter: secs_to_duration(jitter),
            })
        };

        match self {
            ServerKind::Vanilla => {
                if tuning_is_set(&tuning) {
                    tracing::warn!("server kind 'vanilla' ignores all latency and failure knobs");
                }
                Ok(Strategy::Vanilla)
            }
            ServerKind::Latency => {
                if tuning.error_rate.is_some()
                    || tuning.drop_rate.is_some()
                    || tuning.stall_rate.is_some()
                {
                    tracing::warn!("server kind 'latency' ignores the failure rate knobs");
                }
                Ok(Strategy::Latency(latency()?))
            }
            ServerKind::Flaky => {
                let rates = FailureRates {
                    error: tuning.error_rate.unwrap_or_default(),
                    drop: tuning.drop_rate.unwrap_or_default(),
                    stall: tuning.stall_rate.unwrap_or_default(),
                };
                rates.validate()?;
                Ok(Strategy::Flaky {
                    latency: latency()?,
                    rates,
                })
            }
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_nanos((secs * 1e9).round() as u64)
}

fn tuning_is_set(tuning: &ServerTuning) -> bool {
    tuning.base_latency.is_some_and(|v| v > 0.)
        || tuning.jitter.is_some_and(|v| v > 0.)
        || tuning.error_rate.is_some()
        || tuning.drop_rate.is_some()
        || tuning.stall_rate.is_some()
}

/// Processing strategy, resolved from a [`ServerKind`] and its tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    Vanilla,
    Latency(LatencyProfile),
    Flaky {
        latency: LatencyProfile,
        rates: FailureRates,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyProfile {
    pub base: Duration,
    pub jitter: Duration,
}

impl LatencyProfile {
    /// Compute a delay uniformly within `[base - jitter, base + jitter]`,
    /// clamped at zero. `u` is expected to be within `[0, 1)`.
    pub fn delay_for(&self, u: f64) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }

        let jitter = self.jitter.as_nanos() as f64;
        let delta = (u * 2. - 1.) * jitter;
        let nanos = (self.base.as_nanos() as f64 + delta).max(0.);
        Duration::from_nanos(nanos.round() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FailureRates {
    pub error: f32,
    pub drop: f32,
    pub stall: f32,
}

impl FailureRates {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("error rate", self.error),
            ("drop rate", self.drop),
            ("stall rate", self.stall),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::invalid(name, format!("{rate} not within [0, 1]")));
            }
        }
        if self.error + self.drop + self.stall > 1. {
            return Err(ConfigError::invalid(
                "failure rates",
                "drop_rate + stall_rate + error_rate must be <= 1.0",
            ));
        }
        Ok(())
    }
}

fn merge_tuning(kind: ServerKind, overwrite: ServerTuning) -> ServerTuning {
    tracing::info!("use server kind '{kind}' to define base tuning");
    let base = kind.default_tuning();

    macro_rules! merge_tuning {
        ($base:ident, $overwrite:ident, {$($property:ident),+ $(,)?}) => {
            ServerTuning {
                $(
                    $property: if let Some(value) = $overwrite.$property {
                        tracing::info!("property '{}': use overwrite: {value}", stringify!($property));
                        Some(value)
                    } else if let Some(value) = $base.$property {
                        tracing::info!("property '{}': use kind default: {value}", stringify!($property));
                        Some(value)
                    } else {
                        tracing::debug!("property '{}': undefined", stringify!($property));
                        None
                    },
                )+
            }
        };
    }

    merge_tuning!(
        base, overwrite,
        {
            base_latency,
            jitter,
            error_rate,
            drop_rate,
            stall_rate,
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_kind() {
        assert_eq!("vanilla".parse::<ServerKind>(), Ok(ServerKind::Vanilla));
        assert_eq!("Flaky".parse::<ServerKind>(), Ok(ServerKind::Flaky));
        assert!("epoll".parse::<ServerKind>().is_err());
    }

    #[test]
    fn vanilla_resolves_without_knobs() {
        let strategy = ServerKind::Vanilla
            .resolve(ServerTuning {
                base_latency: Some(1.),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(strategy, Strategy::Vanilla);
    }

    #[test]
    fn overwrites_take_precedence_over_kind_defaults() {
        let strategy = ServerKind::Latency
            .resolve(ServerTuning {
                base_latency: Some(0.5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            strategy,
            Strategy::Latency(LatencyProfile {
                base: Duration::from_millis(500),
                jitter: Duration::from_millis(5),
            })
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn merged_properties_are_logged() {
        ServerKind::Latency
            .resolve(ServerTuning {
                jitter: Some(0.),
                ..Default::default()
            })
            .unwrap();
        assert!(logs_contain("property 'jitter': use overwrite: 0"));
        assert!(logs_contain("property 'base_latency': use kind default: 0.005"));
    }

    #[test]
    fn failure_rates_must_fit_within_one() {
        let result = ServerKind::Flaky.resolve(ServerTuning {
            error_rate: Some(0.5),
            drop_rate: Some(0.3),
            stall_rate: Some(0.3),
            ..Default::default()
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = ServerKind::Flaky.resolve(ServerTuning {
            error_rate: Some(-0.1),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn negative_latency_is_rejected() {
        let result = ServerKind::Latency.resolve(ServerTuning {
            jitter: Some(-1.),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let profile = LatencyProfile {
            base: Duration::from_millis(10),
            jitter: Duration::from_millis(4),
        };
        assert_eq!(profile.delay_for(0.0), Duration::from_millis(6));
        assert_eq!(profile.delay_for(0.5), Duration::from_millis(10));
        assert!(profile.delay_for(0.999) <= Duration::from_millis(14));

        let clamped = LatencyProfile {
            base: Duration::from_millis(1),
            jitter: Duration::from_millis(5),
        };
        assert_eq!(clamped.delay_for(0.0), Duration::ZERO);
    }
}
