//! Posse deputy - local process supervisor.
//!
//! A deputy is a single-process, single-thread agent. Sheriffs publish
//! the desired command set over the bus; the deputy reconciles it
//! against observed state, spawning commands under pseudo-terminals,
//! restarting crashed ones with backoff, escalating stop requests to
//! SIGKILL, and reporting status, resource usage, and console output.
//!
//! Component layering (leaves first):
//! - [`event_loop`]: cooperative poll/timer/signal dispatcher
//! - [`procinfo`]: /proc scraping and descendant tracking
//! - [`procman`]: fork-pty child lifecycle
//! - [`bus`]: UDP multicast transport for the typed channels
//! - [`deputy`]: the reconciliation engine tying it all together

pub mod bus;
pub mod deputy;
pub mod event_loop;
pub mod exit_codes;
pub mod logging;
pub mod procinfo;
pub mod procman;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock microseconds since the Unix epoch.
///
/// All protocol `utime` fields and event-loop deadlines share this
/// clock so staleness checks compare like with like.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
