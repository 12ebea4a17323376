//! Crash-window restart policy engine.
//!
//! The supervisor consults this module whenever a controller reports a
//! prism exit. Crash counting uses a rolling one-hour window: a crash more
//! than an hour after the previous one resets the counter. `max_restarts`
//! caps restarts inside the window; zero disables the cap entirely
//! (documented as "unlimited").
//!
//! Clean exits (code 0) are not crashes. They arrive on a separate
//! notification path and only the `always` policy restarts them.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How long a crash stays relevant for restart counting.
pub const CRASH_WINDOW: Duration = Duration::from_secs(3600);

/// Restart policy for a prism, in config syntax (`restart = "on-failure"`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    Never,
    /// Restart on crash (non-zero exit or signal).
    OnFailure,
    /// Restart on crash; a crash means it wasn't explicitly stopped.
    UnlessStopped,
    /// Restart on crash and on clean exit.
    Always,
}

impl RestartPolicy {
    /// Whether a crash event should trigger a restart (before the cap check).
    #[must_use]
    pub fn restarts_on_crash(self) -> bool {
        !matches!(self, RestartPolicy::Never)
    }

    /// Whether a clean exit (code 0) should trigger a restart.
    ///
    /// Clean exits never route through the crash engine; only `always`
    /// brings the prism back.
    #[must_use]
    pub fn restarts_on_clean_exit(self) -> bool {
        matches!(self, RestartPolicy::Always)
    }
}

/// Per-prism crash bookkeeping, preserved across respawns.
#[derive(Debug, Default, Clone)]
pub struct CrashTracker {
    /// Crashes inside the current one-hour window.
    pub crash_count: u32,
    /// Timestamp of the most recent crash.
    pub last_crash: Option<Instant>,
}

impl CrashTracker {
    /// Record a crash at `now`, returning the updated count.
    ///
    /// Resets the counter first when the previous crash fell out of the
    /// one-hour window.
    pub fn record_crash(&mut self, now: Instant) -> u32 {
        if let Some(last) = self.last_crash {
            if now.duration_since(last) > CRASH_WINDOW {
                self.crash_count = 0;
            }
        }
        self.crash_count += 1;
        self.last_crash = Some(now);
        self.crash_count
    }
}

/// Decide whether a crashed prism should be respawned.
///
/// `crash_count` is the value returned by [`CrashTracker::record_crash`]
/// for this crash. `max_restarts == 0` means unlimited.
#[must_use]
pub fn should_restart_on_crash(policy: RestartPolicy, max_restarts: u32, crash_count: u32) -> bool {
    if !policy.restarts_on_crash() {
        return false;
    }
    if max_restarts > 0 && crash_count > max_restarts {
        return false;
    }
    true
}
