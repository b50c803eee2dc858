use std::{fmt, str::FromStr, time::Duration};

use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

use crate::config::ConfigError;

pub const DEFAULT_BURST_SIZE: u32 = 4;

/// Largest accepted (mean) interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Policy generating inter-arrival intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadShape {
    /// Every interval equals the configured interval.
    Constant,

    /// Exponentially distributed intervals with the configured interval as mean.
    Poisson,

    /// `burst_size` back-to-back arrivals, followed by a pause
    /// of `burst_size` intervals, so the mean stays the configured interval.
    Bursty { burst_size: u32 },
}

impl fmt::Display for WorkloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant => f.write_str("constant"),
            Self::Poisson => f.write_str("poisson"),
            Self::Bursty { .. } => f.write_str("bursty"),
        }
    }
}

impl FromStr for WorkloadShape {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("constant") {
            Ok(Self::Constant)
        } else if s.eq_ignore_ascii_case("poisson") {
            Ok(Self::Poisson)
        } else if s.eq_ignore_ascii_case("bursty") {
            Ok(Self::Bursty {
                burst_size: DEFAULT_BURST_SIZE,
            })
        } else {
            Err(ConfigError::unknown("workload shape", s))
        }
    }
}

/// Immutable workload description, shared read-only by all virtual clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadSpec {
    shape: WorkloadShape,
    interval: Duration,
    seed: u64,
}

/// Cursor into the (infinite) interval sequence of a single virtual client.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    rng: SmallRng,
    produced: u64,
}

impl WorkloadSpec {
    pub fn try_new(
        shape: WorkloadShape,
        interval: Duration,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::invalid(
                "workload interval",
                "must be greater than zero",
            ));
        }
        if interval > MAX_INTERVAL {
            return Err(ConfigError::invalid(
                "workload interval",
                format!("{interval:?} exceeds the maximum of {MAX_INTERVAL:?}"),
            ));
        }
        if let WorkloadShape::Bursty { burst_size } = shape {
            if burst_size == 0 {
                return Err(ConfigError::invalid("burst size", "must be at least 1"));
            }
            if interval.checked_mul(burst_size).is_none() {
                return Err(ConfigError::invalid(
                    "burst size",
                    format!("burst pause of {burst_size} x {interval:?} overflows"),
                ));
            }
        }
        Ok(Self {
            shape,
            interval,
            seed,
        })
    }

    pub fn shape(&self) -> WorkloadShape {
        self.shape
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Start a fresh sequence for the given virtual client.
    ///
    /// The same `(seed, client)` pair always yields the same sequence.
    pub fn start(&self, client: usize) -> ScheduleState {
        let stream = (client as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ScheduleState {
            rng: SmallRng::seed_from_u64(self.seed ^ stream),
            produced: 0,
        }
    }

    /// Produce the next interval and the advanced state.
    pub fn next(&self, mut state: ScheduleState) -> (Duration, ScheduleState) {
        let interval = match self.shape {
            WorkloadShape::Constant => self.interval,
            WorkloadShape::Poisson => {
                // inverse transform sampling; 1 - u is in (0, 1]
                let u: f64 = state.rng.random();
                let factor = -(1.0 - u).ln();
                Duration::from_secs_f64(self.interval.as_secs_f64() * factor)
            }
            WorkloadShape::Bursty { burst_size } => {
                if (state.produced + 1) % burst_size as u64 == 0 {
                    self.interval * burst_size
                } else {
                    Duration::ZERO
                }
            }
        };
        state.produced += 1;
        (interval, state)
    }

    /// Infinite iterator over the intervals of the given virtual client.
    pub fn schedule(&self, client: usize) -> Schedule {
        Schedule {
            spec: *self,
            state: Some(self.start(client)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    spec: WorkloadSpec,
    state: Option<ScheduleState>,
}

impl Iterator for Schedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state.take()?;
        let (interval, state) = self.spec.next(state);
        self.state = Some(state);
        Some(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(shape: WorkloadShape, millis: u64, seed: u64) -> WorkloadSpec {
        WorkloadSpec::try_new(shape, Duration::from_millis(millis), seed).unwrap()
    }

    #[test]
    fn test_parse_shape() {
        for (input, expected) in [
            ("constant", Some(WorkloadShape::Constant)),
            (" Poisson", Some(WorkloadShape::Poisson)),
            (
                "BURSTY",
                Some(WorkloadShape::Bursty {
                    burst_size: DEFAULT_BURST_SIZE,
                }),
            ),
            ("linear", None),
            ("", None),
        ] {
            match (input.parse::<WorkloadShape>(), expected) {
                (Ok(shape), Some(expected)) => assert_eq!(shape, expected, "input: '{input}'"),
                (Err(ConfigError::UnknownVariant { .. }), None) => (),
                (result, expected) => panic!(
                    "input = '{input}', unexpected result '{result:?}', expected: '{expected:?}'"
                ),
            }
        }
    }

    #[test]
    fn invalid_parameters_fail_fast() {
        assert!(WorkloadSpec::try_new(WorkloadShape::Constant, Duration::ZERO, 0).is_err());
        assert!(
            WorkloadSpec::try_new(
                WorkloadShape::Bursty { burst_size: 0 },
                Duration::from_secs(1),
                0
            )
            .is_err()
        );
    }

    #[test]
    fn oversized_intervals_are_rejected() {
        assert!(
            WorkloadSpec::try_new(WorkloadShape::Constant, Duration::from_secs(u64::MAX), 0)
                .is_err()
        );
        assert!(
            WorkloadSpec::try_new(
                WorkloadShape::Poisson,
                MAX_INTERVAL + Duration::from_nanos(1),
                0
            )
            .is_err()
        );
        assert!(
            WorkloadSpec::try_new(
                WorkloadShape::Bursty {
                    burst_size: u32::MAX
                },
                MAX_INTERVAL,
                0
            )
            .is_ok()
        );

        let spec = spec(WorkloadShape::Poisson, MAX_INTERVAL.as_millis() as u64, 3);
        assert_eq!(spec.schedule(0).take(1000).count(), 1000);
    }

    #[test]
    fn constant_shape_is_fixed() {
        let spec = spec(WorkloadShape::Constant, 250, 1);
        assert!(
            spec.schedule(0)
                .take(100)
                .all(|d| d == Duration::from_millis(250))
        );
    }

    #[test]
    fn bursty_shape_preserves_mean() {
        let spec = spec(WorkloadShape::Bursty { burst_size: 3 }, 10, 1);
        let intervals: Vec<_> = spec.schedule(0).take(6).collect();
        assert_eq!(
            intervals,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_millis(30),
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_millis(30),
            ]
        );
    }

    #[test]
    fn poisson_shape_is_reproducible_per_seed() {
        let a = spec(WorkloadShape::Poisson, 10, 42);
        let b = spec(WorkloadShape::Poisson, 10, 42);
        let c = spec(WorkloadShape::Poisson, 10, 43);

        let seq_a: Vec<_> = a.schedule(3).take(64).collect();
        let seq_b: Vec<_> = b.schedule(3).take(64).collect();
        let seq_c: Vec<_> = c.schedule(3).take(64).collect();
        let seq_other_client: Vec<_> = a.schedule(4).take(64).collect();

        assert_eq!(seq_a, seq_b);
        assert_ne!(seq_a, seq_c);
        assert_ne!(seq_a, seq_other_client);
    }

    #[test]
    fn poisson_mean_converges() {
        let spec = spec(WorkloadShape::Poisson, 10, 7);
        let n = 20_000;
        let total: Duration = spec.schedule(0).take(n).sum();
        let mean_ms = total.as_secs_f64() * 1000.0 / n as f64;
        assert!((9.0..11.0).contains(&mean_ms), "mean = {mean_ms}ms");
    }

    #[test]
    fn next_is_pure_and_restartable() {
        let spec = spec(WorkloadShape::Poisson, 5, 9);
        let state = spec.start(0);

        let (first, _) = spec.next(state.clone());
        let (again, advanced) = spec.next(state);
        assert_eq!(first, again);

        let (second, _) = spec.next(advanced);
        let restarted: Vec<_> = spec.schedule(0).take(2).collect();
        assert_eq!(restarted, vec![first, second]);
    }
}
