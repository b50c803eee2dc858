use std::{io, mem};

use rama::telemetry::tracing;

pub use libc::rlim_t;

/// Open file descriptor limits of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdLimit {
    pub soft: rlim_t,
    pub hard: rlim_t,
}

impl FdLimit {
    /// Whether `connections` sockets fit, next to stdio and a few spare descriptors.
    pub fn fits(&self, connections: usize) -> bool {
        const RESERVED: rlim_t = 32;
        rlim_t::try_from(connections)
            .ok()
            .and_then(|n| n.checked_add(RESERVED))
            .is_some_and(|needed| needed <= self.soft)
    }
}

pub fn nofile_limit() -> io::Result<FdLimit> {
    let mut lim: libc::rlimit = unsafe { mem::zeroed() };
    // SAFETY: `lim` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FdLimit {
        soft: lim.rlim_cur,
        hard: lim.rlim_max,
    })
}

/// Raise the soft limit of open file descriptors to `target`,
/// bounded by the hard limit. Never lowers the current limit.
///
/// Returns the limits in effect afterwards.
pub fn raise_nofile(target: rlim_t) -> io::Result<FdLimit> {
    let current = nofile_limit()?;
    let wanted = target.min(current.hard);
    if current.soft >= wanted {
        tracing::debug!(
            soft = current.soft,
            requested = wanted,
            "ulimit: keep current soft limit"
        );
        return Ok(current);
    }

    let lim = libc::rlimit {
        rlim_cur: wanted,
        rlim_max: current.hard,
    };
    // SAFETY: `lim` is a valid rlimit and only read by the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::info!(
        previous = current.soft,
        soft = wanted,
        hard = current.hard,
        "ulimit: raised soft limit"
    );
    Ok(FdLimit {
        soft: wanted,
        hard: current.hard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test: the limit is process wide and tests run in parallel
    #[test]
    fn raise_never_lowers_and_is_bounded_by_hard_limit() {
        let before = nofile_limit().unwrap();
        assert!(before.soft > 0);
        assert_eq!(raise_nofile(0).unwrap(), before);
        assert_eq!(nofile_limit().unwrap(), before);

        // macOS refuses an unlimited soft limit
        if cfg!(target_os = "linux") {
            let limit = raise_nofile(rlim_t::MAX).unwrap();
            assert!(limit.soft <= limit.hard);
            assert!(limit.soft >= before.soft);
            assert_eq!(nofile_limit().unwrap(), limit);
            assert_eq!(raise_nofile(limit.soft).unwrap(), limit);
        }
    }

    #[test]
    fn fits_reserves_spare_descriptors() {
        let limit = FdLimit {
            soft: 100,
            hard: 200,
        };
        assert!(limit.fits(0));
        assert!(limit.fits(68));
        assert!(!limit.fits(69));
        assert!(!limit.fits(usize::MAX));
    }
}
