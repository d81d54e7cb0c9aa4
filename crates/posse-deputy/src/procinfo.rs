//! Process and system resource introspection via /proc.
//!
//! Provides the deputy's view of the outside process world:
//! - per-PID CPU time and memory from `/proc/<pid>/stat` + `statm`
//! - system-wide CPU jiffies and memory from `/proc/stat` + `/proc/meminfo`
//! - descendant enumeration from a full `/proc` walk
//! - the orphan test used to finish off children of a killed command
//!
//! CPU numbers are raw cumulative jiffies; callers difference paired
//! snapshots to get usage over a window. Readers fail with
//! [`Error::Proc`] when an entry is gone or unparseable — including on
//! non-Linux platforms, where there is nothing to read; callers treat
//! that as zeroed data. The tree helpers (`descendants`,
//! `is_orphaned_child_of`) are best-effort and never fail.

use posse_common::{Error, Result};
use serde::{Deserialize, Serialize};
#[cfg(target_os = "linux")]
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;

/// CPU/memory snapshot for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Cumulative user-mode jiffies.
    pub user: u64,
    /// Cumulative kernel-mode jiffies.
    pub system: u64,
    /// Virtual memory size in bytes.
    pub vsize: i64,
    /// Resident set size in bytes.
    pub rss: i64,
    /// Shared pages in bytes.
    pub shared: i64,
    /// Text (code) pages in bytes.
    pub text: i64,
    /// Data + stack pages in bytes.
    pub data: i64,
}

/// CPU/memory snapshot for the whole system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Normal-priority user jiffies.
    pub user: u64,
    /// Niced user jiffies.
    pub user_low: u64,
    /// Kernel jiffies.
    pub system: u64,
    /// Idle jiffies.
    pub idle: u64,
    pub memtotal: i64,
    pub memfree: i64,
    pub swaptotal: i64,
    pub swapfree: i64,
}

/// Identity fields from `/proc/<pid>/stat` used for the process tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PidInfo {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub session: u32,
    pub state: char,
}

/// System page size in bytes, cached.
#[cfg(unix)]
pub fn page_size() -> i64 {
    static PAGE_SIZE: std::sync::OnceLock<i64> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz
        } else {
            4096
        }
    })
}

#[cfg(not(unix))]
pub fn page_size() -> i64 {
    4096
}

/// Fields of `/proc/<pid>/stat` after the `(comm)` column, split on
/// whitespace. The comm itself may contain spaces and parentheses, so
/// the split anchors on the *last* `)`.
#[cfg(target_os = "linux")]
fn stat_fields_after_comm(content: &str) -> Option<Vec<&str>> {
    let comm_end = content.rfind(')')?;
    let after = content.get(comm_end + 2..)?;
    Some(after.split_whitespace().collect())
}

#[cfg(target_os = "linux")]
fn read_proc_file(path: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::Proc(format!("{path}: {e}")))
}

#[cfg(target_os = "linux")]
fn parse_field<T: std::str::FromStr>(fields: &[&str], index: usize, path: &str) -> Result<T> {
    fields
        .get(index)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Proc(format!("{path}: bad field {index}")))
}

/// Read CPU and memory usage for one PID.
#[cfg(target_os = "linux")]
pub fn read_process_info(pid: u32) -> Result<ProcessInfo> {
    let stat_path = format!("/proc/{pid}/stat");
    let stat = read_proc_file(&stat_path)?;
    let fields = stat_fields_after_comm(&stat)
        .ok_or_else(|| Error::Proc(format!("{stat_path}: no comm field")))?;

    // After-comm indices: utime=11 stime=12 vsize=20 rss=21 (pages).
    let mut info = ProcessInfo {
        user: parse_field(&fields, 11, &stat_path)?,
        system: parse_field(&fields, 12, &stat_path)?,
        vsize: parse_field(&fields, 20, &stat_path)?,
        rss: parse_field::<i64>(&fields, 21, &stat_path)? * page_size(),
        ..ProcessInfo::default()
    };

    // statm: size resident shared text lib data dt (pages).
    let statm_path = format!("/proc/{pid}/statm");
    let statm = read_proc_file(&statm_path)?;
    let words: Vec<&str> = statm.split_whitespace().collect();
    info.shared = parse_field::<i64>(&words, 2, &statm_path)? * page_size();
    info.text = parse_field::<i64>(&words, 3, &statm_path)? * page_size();
    info.data = parse_field::<i64>(&words, 5, &statm_path)? * page_size();

    Ok(info)
}

#[cfg(not(target_os = "linux"))]
pub fn read_process_info(_pid: u32) -> Result<ProcessInfo> {
    Err(Error::Proc(
        "process introspection requires /proc".to_string(),
    ))
}

/// Read system-wide CPU jiffies and memory totals.
#[cfg(target_os = "linux")]
pub fn read_system_info() -> Result<SystemInfo> {
    let mut info = SystemInfo::default();

    let stat = read_proc_file("/proc/stat")?;
    let cpu_line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| Error::Proc("/proc/stat: no cpu line".to_string()))?;
    let fields: Vec<&str> = cpu_line.split_whitespace().skip(1).collect();
    info.user = parse_field(&fields, 0, "/proc/stat")?;
    info.user_low = parse_field(&fields, 1, "/proc/stat")?;
    info.system = parse_field(&fields, 2, "/proc/stat")?;
    info.idle = parse_field(&fields, 3, "/proc/stat")?;

    let meminfo = read_proc_file("/proc/meminfo")?;
    for line in meminfo.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key {
            "MemTotal" => &mut info.memtotal,
            "MemFree" => &mut info.memfree,
            "SwapTotal" => &mut info.swaptotal,
            "SwapFree" => &mut info.swapfree,
            _ => continue,
        };
        let mut parts = rest.split_whitespace();
        if let Some(value) = parts.next().and_then(|v| v.parse::<i64>().ok()) {
            // meminfo reports kB.
            *slot = value * 1024;
        }
    }

    Ok(info)
}

#[cfg(not(target_os = "linux"))]
pub fn read_system_info() -> Result<SystemInfo> {
    Err(Error::Proc(
        "system introspection requires /proc".to_string(),
    ))
}

/// Read the process-tree identity of one PID.
#[cfg(target_os = "linux")]
pub fn read_pid_info(pid: u32) -> Result<PidInfo> {
    let path = format!("/proc/{pid}/stat");
    let stat = read_proc_file(&path)?;
    let fields = stat_fields_after_comm(&stat)
        .ok_or_else(|| Error::Proc(format!("{path}: no comm field")))?;
    Ok(PidInfo {
        pid,
        state: fields
            .first()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| Error::Proc(format!("{path}: no state field")))?,
        ppid: parse_field(&fields, 1, &path)?,
        pgrp: parse_field(&fields, 2, &path)?,
        session: parse_field(&fields, 3, &path)?,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_pid_info(_pid: u32) -> Result<PidInfo> {
    Err(Error::Proc(
        "process introspection requires /proc".to_string(),
    ))
}

/// True when `orphan` has been reparented to init but still belongs to
/// the process group and session that `parent` led. A PID that has
/// vanished is not an orphan.
pub fn is_orphaned_child_of(orphan: u32, parent: u32) -> bool {
    match read_pid_info(orphan) {
        Ok(info) => info.ppid == 1 && info.pgrp == parent && info.session == parent,
        Err(_) => false,
    }
}

/// All live descendant PIDs of `pid`, depth-first.
///
/// Built from a single /proc walk, so the answer is a snapshot; PIDs
/// may already be gone by the time the caller signals them. Entries
/// that disappear mid-walk are skipped.
#[cfg(target_os = "linux")]
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(child_pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if let Ok(info) = read_pid_info(child_pid) {
            children.entry(info.ppid).or_default().push(child_pid);
        }
    }

    let mut result = Vec::new();
    let mut stack = vec![pid];
    while let Some(current) = stack.pop() {
        if let Some(kids) = children.get(&current) {
            for &kid in kids {
                result.push(kid);
                stack.push(kid);
            }
        }
    }
    result
}

#[cfg(not(target_os = "linux"))]
pub fn descendants(_pid: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    mod linux_tests {
        use super::*;
        use posse_common::ErrorCategory;
        use std::process::Command;

        #[test]
        fn stat_parser_handles_spaces_in_comm() {
            let line = "1234 (a (weird) name) S 1 1234 1234 0 -1 4194560 \
                        100 0 0 0 7 3 0 0 20 0 1 0 12345 10485760 256 \
                        18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
            let fields = stat_fields_after_comm(line).unwrap();
            assert_eq!(fields[0], "S");
            assert_eq!(fields[1], "1");
            assert_eq!(fields[11], "7");
            assert_eq!(fields[12], "3");
            assert_eq!(fields[20], "10485760");
        }

        #[test]
        fn read_own_process_info() {
            let info = read_process_info(std::process::id()).expect("own /proc entry");
            assert!(info.vsize > 0);
            assert!(info.rss > 0);
        }

        #[test]
        fn read_own_pid_info() {
            let pid = std::process::id();
            let info = read_pid_info(pid).expect("own /proc entry");
            assert_eq!(info.pid, pid);
            assert!(info.ppid > 0);
        }

        #[test]
        fn vanished_pid_reports_a_proc_error() {
            let err = read_process_info(999_999_999).expect_err("no such pid");
            assert_eq!(err.category(), ErrorCategory::Proc);
            assert!(err.to_string().contains("/proc/999999999/stat"));
            assert!(read_pid_info(999_999_999).is_err());
        }

        #[test]
        fn system_info_has_memory_totals() {
            let info = read_system_info().expect("system info");
            assert!(info.memtotal > 0);
            assert!(info.user > 0);
        }

        #[test]
        fn descendants_sees_spawned_child() {
            let mut child = Command::new("sleep")
                .arg("30")
                .spawn()
                .expect("failed to spawn sleep");
            let pid = child.id();

            let kids = descendants(std::process::id());
            assert!(kids.contains(&pid), "descendants {kids:?} missing {pid}");

            let _ = child.kill();
            let _ = child.wait();
        }

        #[test]
        fn live_process_is_not_orphan() {
            assert!(!is_orphaned_child_of(std::process::id(), 1));
        }
    }

    #[test]
    fn page_size_is_sane() {
        assert!(page_size() >= 512);
    }
}
