use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rama::telemetry::tracing;

use crate::config::ConfigError;

/// How often (in iterations) busy work checks if it got cancelled.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Work the server performs on behalf of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Work {
    /// Do nothing.
    #[default]
    Noop,

    /// Spin for a number of loop iterations.
    Busy { iterations: u64 },

    /// Sleep for a number of microseconds.
    Sleep { micros: u64 },
}

impl Work {
    const ID_NOOP: u8 = 0;
    const ID_BUSY: u8 = 1;
    const ID_SLEEP: u8 = 2;

    pub fn wire_id(self) -> u8 {
        match self {
            Self::Noop => Self::ID_NOOP,
            Self::Busy { .. } => Self::ID_BUSY,
            Self::Sleep { .. } => Self::ID_SLEEP,
        }
    }

    pub fn wire_param(self) -> u64 {
        match self {
            Self::Noop => 0,
            Self::Busy { iterations } => iterations,
            Self::Sleep { micros } => micros,
        }
    }

    /// Returns `None` for an unknown work id.
    pub fn from_wire(id: u8, param: u64) -> Option<Self> {
        match id {
            Self::ID_NOOP => Some(Self::Noop),
            Self::ID_BUSY => Some(Self::Busy { iterations: param }),
            Self::ID_SLEEP => Some(Self::Sleep { micros: param }),
            _ => None,
        }
    }

    /// Execute the work.
    ///
    /// Dropping the returned future (e.g. because the request timed out)
    /// cancels the work: sleeps are simply dropped and busy loops running
    /// on a blocking thread observe a cancellation flag and stop early.
    pub async fn execute(self) {
        match self {
            Self::Noop => {}
            Self::Sleep { micros } => tokio::time::sleep(Duration::from_micros(micros)).await,
            Self::Busy { iterations } => spin(iterations).await,
        }
    }
}

struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

async fn spin(iterations: u64) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let _cancel = CancelOnDrop(cancelled.clone());

    let handle = tokio::task::spawn_blocking(move || busy_loop(iterations, &cancelled));
    if let Err(err) = handle.await {
        tracing::debug!("busy work task failed to complete: {err}");
    }
}

/// Returns the amount of iterations actually performed.
fn busy_loop(iterations: u64, cancelled: &AtomicBool) -> u64 {
    let mut done = 0;
    while done < iterations {
        if done % CANCEL_CHECK_INTERVAL == 0 && cancelled.load(Ordering::Acquire) {
            break;
        }
        std::hint::black_box(done);
        done += 1;
    }
    done
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("noop"),
            Self::Busy { iterations } => write!(f, "busy:{iterations}"),
            Self::Sleep { micros } => write!(f, "sleep:{micros}"),
        }
    }
}

impl FromStr for Work {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, param) = match s.split_once(':') {
            Some((name, param)) => (name.trim(), Some(param.trim())),
            None => (s, None),
        };

        let parse_param = |name: &'static str| {
            param
                .ok_or_else(|| ConfigError::invalid(name, "missing parameter (e.g. 'busy:1000')"))?
                .parse::<u64>()
                .map_err(|err| ConfigError::invalid(name, err.to_string()))
        };

        if name.eq_ignore_ascii_case("noop") || name.eq_ignore_ascii_case("none") {
            return match param {
                None => Ok(Self::Noop),
                Some(_) => Err(ConfigError::invalid("work", "noop takes no parameter")),
            };
        }
        if name.eq_ignore_ascii_case("busy") {
            return Ok(Self::Busy {
                iterations: parse_param("work busy iterations")?,
            });
        }
        if name.eq_ignore_ascii_case("sleep") {
            return Ok(Self::Sleep {
                micros: parse_param("work sleep micros")?,
            });
        }

        Err(ConfigError::unknown("work", s))
    }
}
