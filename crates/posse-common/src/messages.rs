//! Message payloads exchanged over the posse bus.
//!
//! Four channels connect deputies and sheriffs:
//! - `PM_DISCOVER`: deputy startup beacons, also used as a ping
//! - `PM_INFO`: deputy -> sheriff status reports (1 Hz and on change)
//! - `PM_ORDERS`: sheriff -> deputy desired command set
//! - `PM_OUTPUT`: deputy -> sheriff coalesced console output
//!
//! All `utime` fields are wall-clock microseconds since the Unix epoch,
//! in the sender's clock domain. Receivers use them only for staleness
//! checks, never for ordering.

use crate::id::{CommandId, DeputyId};
use serde::{Deserialize, Serialize};

/// Channel carrying [`DiscoverMsg`].
pub const DISCOVER_CHANNEL: &str = "PM_DISCOVER";
/// Channel carrying [`DeputyInfoMsg`].
pub const INFO_CHANNEL: &str = "PM_INFO";
/// Channel carrying [`OrdersMsg`].
pub const ORDERS_CHANNEL: &str = "PM_ORDERS";
/// Channel carrying [`OutputMsg`].
pub const OUTPUT_CHANNEL: &str = "PM_OUTPUT";

/// Polite stop defaults applied when a sheriff omits them.
pub const DEFAULT_STOP_SIGNAL: i32 = 2;
pub const DEFAULT_STOP_TIME_ALLOWED: f32 = 7.0;

fn default_stop_signal() -> i32 {
    DEFAULT_STOP_SIGNAL
}

fn default_stop_time_allowed() -> f32 {
    DEFAULT_STOP_TIME_ALLOWED
}

/// Deputy startup beacon.
///
/// During its discovery window a deputy broadcasts these to detect a
/// conflicting deputy with the same id. The nonce is the sender's PID,
/// so a deputy can recognize (and ignore) its own looped-back beacons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverMsg {
    pub utime: i64,
    pub transmitter_id: DeputyId,
    pub nonce: i32,
}

/// Static configuration of one command, shared between orders and
/// status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Command line: optional leading KEY=VALUE assignments, then argv.
    pub exec_str: String,
    pub command_id: CommandId,
    /// Opaque grouping label, echoed back to the sheriff.
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub auto_respawn: bool,
    /// POSIX signal number for the polite stop request.
    #[serde(default = "default_stop_signal")]
    pub stop_signal: i32,
    /// Seconds between the polite stop and SIGKILL escalation.
    #[serde(default = "default_stop_time_allowed")]
    pub stop_time_allowed: f32,
}

/// Observed state of one command, as reported by a deputy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub cmd: CommandConfig,
    pub actual_runid: i32,
    /// PID while running, 0 otherwise.
    pub pid: i32,
    /// Raw wait status from the last exit (0 if never exited).
    pub exit_code: i32,
    /// Fraction of one CPU over the last sample window.
    pub cpu_usage: f32,
    pub mem_vsize_bytes: i64,
    pub mem_rss_bytes: i64,
}

/// Deputy status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeputyInfoMsg {
    pub utime: i64,
    pub deputy_id: DeputyId,
    /// System-wide CPU load fraction over the last sample window.
    pub cpu_load: f32,
    pub phys_mem_total_bytes: i64,
    pub phys_mem_free_bytes: i64,
    pub swap_total_bytes: i64,
    pub swap_free_bytes: i64,
    pub cmds: Vec<CommandStatus>,
}

/// One desired command inside an orders message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredCommand {
    pub cmd: CommandConfig,
    /// Restart generation. A change to a non-zero value requests exactly
    /// one restart; 0 means "reconcile run state only".
    pub desired_runid: i32,
    /// Stop the command regardless of runid.
    #[serde(default)]
    pub force_quit: bool,
}

/// Sheriff -> deputy desired state. The listed commands are the complete
/// desired set: commands a deputy manages that are absent here are culled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrdersMsg {
    pub utime: i64,
    pub deputy_id: DeputyId,
    pub cmds: Vec<DesiredCommand>,
}

/// Captured console output for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command_id: CommandId,
    pub text: String,
}

/// Deputy -> sheriff coalesced output batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMsg {
    pub utime: i64,
    pub deputy_id: DeputyId,
    pub streams: Vec<CommandOutput>,
}
