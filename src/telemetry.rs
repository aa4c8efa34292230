//! Best-effort readers for the OS telemetry the status topics carry (§4.5,
//! §10.5): load average, memory, `os-release`, and `uname`. Treated as an
//! external interface by the scope section; this is the thin reference
//! implementation `run` needs to publish anything observable.

use crate::types::{SysDesc, SysStat};
use chrono::Utc;
use std::fs;

/// Build a `sysdesc` record from `/etc/os-release` and `uname()`. Every
/// field is best-effort: an unreadable or unparsable source yields `None`
/// rather than failing the whole record.
pub fn read_sysdesc() -> SysDesc {
    let uname = uname_fields();
    SysDesc {
        kernel: uname.sysname.unwrap_or_else(|| "unknown".to_string()),
        kernel_release: uname.release.unwrap_or_else(|| "unknown".to_string()),
        os_pretty_name: os_release_pretty_name(),
        arch: uname.machine.unwrap_or_else(|| "unknown".to_string()),
        mem_total_kb: meminfo_field("MemTotal"),
    }
}

/// Build a `sysstat` record from `/proc/loadavg` and `/proc/meminfo`.
pub fn read_sysstat() -> SysStat {
    SysStat {
        load1: loadavg_one_minute(),
        mem_free_kb: meminfo_field("MemFree"),
        sampled_at: Utc::now(),
    }
}

fn os_release_pretty_name() -> Option<String> {
    let contents = fs::read_to_string("/etc/os-release").ok()?;
    contents.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim_matches('"').to_string())
    })
}

fn loadavg_one_minute() -> Option<f32> {
    let contents = fs::read_to_string("/proc/loadavg").ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

fn meminfo_field(key: &str) -> Option<u64> {
    let contents = fs::read_to_string("/proc/meminfo").ok()?;
    contents.lines().find_map(|line| {
        let (field, rest) = line.split_once(':')?;
        if field != key {
            return None;
        }
        rest.trim().trim_end_matches(" kB").trim().parse().ok()
    })
}

#[derive(Default)]
struct UnameFields {
    sysname: Option<String>,
    release: Option<String>,
    machine: Option<String>,
}

#[cfg(target_os = "linux")]
fn uname_fields() -> UnameFields {
    let run = |flag: &str| {
        std::process::Command::new("uname")
            .arg(flag)
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|s| s.trim().to_string())
    };
    UnameFields {
        sysname: run("-s"),
        release: run("-r"),
        machine: run("-m"),
    }
}

#[cfg(not(target_os = "linux"))]
fn uname_fields() -> UnameFields {
    UnameFields::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysdesc_always_produces_a_record() {
        let desc = read_sysdesc();
        assert!(!desc.kernel.is_empty());
        assert!(!desc.arch.is_empty());
    }

    #[test]
    fn sysstat_always_produces_a_record() {
        let stat = read_sysstat();
        assert!(stat.sampled_at <= Utc::now());
    }

    #[test]
    fn meminfo_field_parses_kb_suffix() {
        // Loose smoke test: on a Linux CI box MemTotal should parse; on
        // other platforms the reader degrades to `None` rather than panic.
        let _ = meminfo_field("MemTotal");
    }
}
