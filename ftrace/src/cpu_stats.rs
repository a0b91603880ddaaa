//! Parser for the kernel's `per_cpu/cpu<N>/stats` files.
use anyhow::{Context, Result};

/// One CPU's ring-buffer counters, as reported by the kernel.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CpuStats {
    pub cpu: u32,
    pub entries: u64,
    pub overrun: u64,
    pub commit_overrun: u64,
    pub bytes_read: u64,
    pub oldest_event_ts: f64,
    pub now_ts: f64,
    pub dropped_events: u64,
    pub read_events: u64,
}

/// Engine-wide snapshot, one entry per CPU.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FtraceStats {
    pub cpu_stats: Vec<CpuStats>,
}

pub fn parse_cpu_stats(cpu: u32, text: &str) -> Result<CpuStats> {
    let mut stats = CpuStats {
        cpu,
        ..Default::default()
    };
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "entries" => stats.entries = value.parse().context("entries")?,
            "overrun" => stats.overrun = value.parse().context("overrun")?,
            "commit overrun" => stats.commit_overrun = value.parse().context("commit overrun")?,
            "bytes" => stats.bytes_read = value.parse().context("bytes")?,
            // Timestamps are seconds with a fractional part; older
            // kernels print "(null)" before the first event.
            "oldest event ts" => stats.oldest_event_ts = value.parse().unwrap_or(0.0),
            "now ts" => stats.now_ts = value.parse().unwrap_or(0.0),
            "dropped events" => stats.dropped_events = value.parse().context("dropped events")?,
            "read events" => stats.read_events = value.parse().context("read events")?,
            _ => {}
        }
    }
    Ok(stats)
}
