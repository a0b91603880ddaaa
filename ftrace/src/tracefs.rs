//! Text-file front-end for the kernel tracing filesystem.
//!
//! Every operation is a read or write of a small file under the tracing
//! root. The root is a constructor argument so tests point it at a scratch
//! directory.
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

const TRACING_PATHS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join("events").is_dir() {
            bail!("{} does not look like a tracing root", root.display());
        }
        Ok(Self { root })
    }

    /// Probes the usual mount points, most modern first.
    pub fn discover() -> Option<Self> {
        TRACING_PATHS.iter().find_map(|p| Self::new(p).ok())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))
    }

    fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn read_event_format(&self, group: &str, name: &str) -> Result<String> {
        self.read_file(&format!("events/{group}/{name}/format"))
    }

    pub fn read_header_page(&self) -> Result<String> {
        self.read_file("events/header_page")
    }

    /// All `(group, name)` pairs that expose a `format` file.
    pub fn available_events(&self) -> Result<Vec<(String, String)>> {
        let mut events = Vec::new();
        let events_dir = self.root.join("events");
        for group_entry in std::fs::read_dir(&events_dir)
            .with_context(|| format!("listing {}", events_dir.display()))?
        {
            let group_entry = group_entry?;
            if !group_entry.file_type()?.is_dir() {
                continue;
            }
            let group = group_entry.file_name().to_string_lossy().into_owned();
            for event_entry in std::fs::read_dir(group_entry.path())? {
                let event_entry = event_entry?;
                if !event_entry.file_type()?.is_dir() {
                    continue;
                }
                if !event_entry.path().join("format").is_file() {
                    continue;
                }
                let name = event_entry.file_name().to_string_lossy().into_owned();
                events.push((group.clone(), name));
            }
        }
        events.sort();
        Ok(events)
    }

    pub fn enable_event(&self, group: &str, name: &str) -> bool {
        self.write_file(&format!("events/{group}/{name}/enable"), "1")
            .is_ok()
    }

    pub fn disable_event(&self, group: &str, name: &str) -> bool {
        self.write_file(&format!("events/{group}/{name}/enable"), "0")
            .is_ok()
    }

    pub fn disable_all_events(&self) -> bool {
        self.write_file("events/enable", "0").is_ok()
    }

    pub fn is_tracing_enabled(&self) -> bool {
        self.read_file("tracing_on")
            .map(|s| s.trim() == "1")
            .unwrap_or(false)
    }

    pub fn enable_tracing(&self) -> bool {
        self.write_file("tracing_on", "1").is_ok()
    }

    pub fn disable_tracing(&self) -> bool {
        self.write_file("tracing_on", "0").is_ok()
    }

    /// Sizes the kernel's per-CPU ring buffer. Zero pages restores the
    /// kernel default (one page).
    pub fn set_cpu_buffer_size_in_pages(&self, pages: usize) -> bool {
        let kb = pages.max(1) * (ferrotrace_base::PAGE_SIZE / 1024);
        self.write_file("buffer_size_kb", &kb.to_string()).is_ok()
    }

    /// The active clock is the bracketed entry of `trace_clock`.
    pub fn get_clock(&self) -> Result<String> {
        let text = self.read_file("trace_clock")?;
        text.split_whitespace()
            .find(|w| w.starts_with('['))
            .map(|w| w.trim_matches(['[', ']']).to_owned())
            .context("no active clock in trace_clock")
    }

    pub fn available_clocks(&self) -> Result<BTreeSet<String>> {
        let text = self.read_file("trace_clock")?;
        Ok(text
            .split_whitespace()
            .map(|w| w.trim_matches(['[', ']']).to_owned())
            .collect())
    }

    pub fn set_clock(&self, clock: &str) -> bool {
        self.write_file("trace_clock", clock).is_ok()
    }

    pub fn num_cpus(&self) -> usize {
        let per_cpu = self.root.join("per_cpu");
        let counted = std::fs::read_dir(per_cpu)
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("cpu"))
                    .count()
            })
            .unwrap_or(0);
        if counted > 0 {
            return counted;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Opens the binary per-CPU pipe in blocking mode, so page moves can
    /// sleep in the kernel.
    pub fn open_raw_pipe(&self, cpu: usize) -> Result<File> {
        let path = self.root.join(format!("per_cpu/cpu{cpu}/trace_pipe_raw"));
        File::open(&path).with_context(|| format!("opening {}", path.display()))
    }

    pub fn read_cpu_stats(&self, cpu: usize) -> Result<String> {
        self.read_file(&format!("per_cpu/cpu{cpu}/stats"))
    }

    pub fn clear_trace(&self) -> bool {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.root.join("trace"))
            .is_ok()
    }

    pub fn write_trace_marker(&self, marker: &str) -> bool {
        OpenOptions::new()
            .write(true)
            .open(self.root.join("trace_marker"))
            .and_then(|mut f| f.write_all(marker.as_bytes()))
            .is_ok()
    }
}

/// Method of last resort to restore kernel state; used when a previous
/// session died without cleaning up. Avoids allocations and ignores
/// errors: the process state is unknown.
pub fn hard_reset_ftrace_state() {
    for root in TRACING_PATHS {
        let _ = std::fs::write(format!("{root}/tracing_on"), "0");
        let _ = std::fs::write(format!("{root}/buffer_size_kb"), "4");
        let _ = std::fs::write(format!("{root}/events/enable"), "0");
        let _ = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(format!("{root}/trace"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("events/sched/sched_switch")).unwrap();
        std::fs::create_dir_all(root.join("per_cpu/cpu0")).unwrap();
        std::fs::create_dir_all(root.join("per_cpu/cpu1")).unwrap();
        std::fs::write(root.join("tracing_on"), "0\n").unwrap();
        std::fs::write(root.join("trace_clock"), "[local] global boot\n").unwrap();
        std::fs::write(root.join("buffer_size_kb"), "1408\n").unwrap();
        std::fs::write(root.join("trace"), "").unwrap();
        std::fs::write(
            root.join("events/sched/sched_switch/format"),
            "name: sched_switch\nID: 7\nformat:\n",
        )
        .unwrap();
        std::fs::write(root.join("events/sched/sched_switch/enable"), "0").unwrap();
        dir
    }

    #[test]
    fn rejects_a_directory_without_events() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Tracefs::new(dir.path()).is_err());
    }

    #[test]
    fn lists_and_toggles_events() {
        let dir = fake_root();
        let tracefs = Tracefs::new(dir.path()).unwrap();
        assert_eq!(
            tracefs.available_events().unwrap(),
            vec![("sched".to_owned(), "sched_switch".to_owned())]
        );
        assert!(tracefs.enable_event("sched", "sched_switch"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("events/sched/sched_switch/enable")).unwrap(),
            "1"
        );
        assert!(!tracefs.enable_event("sched", "no_such_event"));
    }

    #[test]
    fn clock_parsing_honors_brackets() {
        let dir = fake_root();
        let tracefs = Tracefs::new(dir.path()).unwrap();
        assert_eq!(tracefs.get_clock().unwrap(), "local");
        let clocks = tracefs.available_clocks().unwrap();
        assert!(clocks.contains("boot") && clocks.contains("global"));
    }

    #[test]
    fn tracing_toggle_round_trips() {
        let dir = fake_root();
        let tracefs = Tracefs::new(dir.path()).unwrap();
        assert!(!tracefs.is_tracing_enabled());
        assert!(tracefs.enable_tracing());
        assert!(tracefs.is_tracing_enabled());
    }

    #[test]
    fn counts_per_cpu_directories() {
        let dir = fake_root();
        let tracefs = Tracefs::new(dir.path()).unwrap();
        assert_eq!(tracefs.num_cpus(), 2);
    }
}
