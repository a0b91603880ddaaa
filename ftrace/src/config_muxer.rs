//! Interleaves several ftrace configs onto the one kernel instance.
//!
//! The kernel has a single set of enabled events, one clock and one buffer
//! size; concurrent tracing sessions see the union. The muxer tracks what
//! each config asked for, what is actually enabled, and restores a clean
//! kernel state when the last config goes away.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::tracefs::Tracefs;
use crate::translation_table::TranslationTable;
use ferrotrace_proto::config::FtraceConfig;

pub type FtraceConfigId = u64;

const DEFAULT_PER_CPU_BUFFER_SIZE_KB: u32 = 512;
const MAX_PER_CPU_BUFFER_SIZE_KB: u32 = 2 * 1024;

// trace_clocks in preference order.
const CLOCKS: &[&str] = &["boot", "global", "local"];

/// Post-conditions: at least one page, and a good default when the request
/// is zero or out of range.
pub fn compute_cpu_buffer_size_in_pages(requested_kb: u32) -> usize {
    let mut kb = requested_kb;
    if kb == 0 || kb > MAX_PER_CPU_BUFFER_SIZE_KB {
        kb = DEFAULT_PER_CPU_BUFFER_SIZE_KB;
    }
    let pages = kb as usize / (ferrotrace_base::PAGE_SIZE / 1024);
    pages.max(1)
}

#[derive(Default)]
struct KernelState {
    tracing_on: bool,
    enabled_events: BTreeSet<String>,
}

pub struct FtraceConfigMuxer {
    tracefs: Arc<Tracefs>,
    table: Arc<TranslationTable>,
    current_state: KernelState,
    /// What each live config was granted (events that actually enabled).
    configs: HashMap<FtraceConfigId, FtraceConfig>,
    active_configs: BTreeSet<FtraceConfigId>,
    last_id: FtraceConfigId,
}

impl FtraceConfigMuxer {
    pub fn new(tracefs: Arc<Tracefs>, table: Arc<TranslationTable>) -> Self {
        Self {
            tracefs,
            table,
            current_state: KernelState::default(),
            configs: HashMap::new(),
            active_configs: BTreeSet::new(),
            last_id: 0,
        }
    }

    /// Sets up events, clock and buffer size for a new config; does not
    /// start the capture. Returns `None` if ftrace is owned by someone
    /// else.
    pub fn setup_config(&mut self, request: &FtraceConfig) -> Option<FtraceConfigId> {
        let is_enabled = self.tracefs.is_tracing_enabled();
        if self.configs.is_empty() {
            debug_assert!(!self.current_state.tracing_on);
            // If someone else is using ftrace give up now.
            if is_enabled {
                log::warn!("ftrace is already in use, refusing config");
                return None;
            }
            self.setup_clock();
            self.setup_buffer_size(request);
        } else if !is_enabled && self.current_state.tracing_on {
            // Did someone turn ftrace off behind our back? If so give up.
            log::warn!("ftrace was disabled externally, refusing config");
            return None;
        }

        let mut actual = FtraceConfig::default();
        for name in &request.event_names {
            let Some(event) = self.table.event_by_name(name) else {
                log::debug!("can't enable {name}, event not known");
                continue;
            };
            if self.current_state.enabled_events.contains(name) || event.group == "ftrace" {
                actual.event_names.push(name.clone());
                continue;
            }
            if self.tracefs.enable_event(&event.group, &event.name) {
                self.current_state.enabled_events.insert(name.clone());
                actual.event_names.push(name.clone());
            }
        }

        self.last_id += 1;
        self.configs.insert(self.last_id, actual);
        Some(self.last_id)
    }

    /// Turns the capture on for an already set-up config.
    pub fn activate_config(&mut self, id: FtraceConfigId) -> bool {
        if !self.configs.contains_key(&id) {
            return false;
        }
        if self.active_configs.is_empty() && !self.current_state.tracing_on {
            if !self.tracefs.enable_tracing() {
                return false;
            }
            self.current_state.tracing_on = true;
        }
        self.active_configs.insert(id);
        true
    }

    pub fn remove_config(&mut self, id: FtraceConfigId) -> bool {
        if self.configs.remove(&id).is_none() {
            return false;
        }
        self.active_configs.remove(&id);

        let expected: BTreeSet<String> = self
            .configs
            .values()
            .flat_map(|cfg| cfg.event_names.iter().cloned())
            .collect();
        let to_disable: Vec<String> = self
            .current_state
            .enabled_events
            .difference(&expected)
            .cloned()
            .collect();
        for name in to_disable {
            let Some(event) = self.table.event_by_name(&name) else {
                continue;
            };
            if self.tracefs.disable_event(&event.group, &event.name) {
                self.current_state.enabled_events.remove(&name);
            }
        }

        if self.configs.is_empty() {
            self.tracefs.disable_tracing();
            self.tracefs.set_cpu_buffer_size_in_pages(1);
            self.tracefs.disable_all_events();
            self.tracefs.clear_trace();
            self.current_state.tracing_on = false;
        }
        true
    }

    /// The events actually granted to `id`.
    pub fn get_config(&self, id: FtraceConfigId) -> Option<&FtraceConfig> {
        self.configs.get(&id)
    }

    fn setup_clock(&mut self) {
        let current = self.tracefs.get_clock().unwrap_or_default();
        let available = self.tracefs.available_clocks().unwrap_or_default();
        for clock in CLOCKS {
            if !available.contains(*clock) {
                continue;
            }
            if current != *clock {
                self.tracefs.set_clock(clock);
            }
            break;
        }
    }

    fn setup_buffer_size(&mut self, request: &FtraceConfig) {
        let pages = compute_cpu_buffer_size_in_pages(request.buffer_size_kb.unwrap_or(0));
        self.tracefs.set_cpu_buffer_size_in_pages(pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatEvent, FormatField};
    use crate::translation_table::test_support::small_sched_switch;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (group, name) in [("sched", "sched_switch"), ("sched", "sched_wakeup")] {
            std::fs::create_dir_all(root.join(format!("events/{group}/{name}"))).unwrap();
            std::fs::write(root.join(format!("events/{group}/{name}/enable")), "0").unwrap();
        }
        std::fs::write(root.join("tracing_on"), "0").unwrap();
        std::fs::write(root.join("trace_clock"), "[local] global boot").unwrap();
        std::fs::write(root.join("buffer_size_kb"), "1408").unwrap();
        std::fs::write(root.join("trace"), "x").unwrap();
        std::fs::write(root.join("events/enable"), "0").unwrap();
        dir
    }

    fn table() -> Arc<TranslationTable> {
        let wakeup = FormatEvent {
            name: "sched_wakeup".into(),
            id: 8,
            common_fields: vec![],
            fields: vec![FormatField {
                type_and_name: "pid_t pid".into(),
                name: "pid".into(),
                offset: 8,
                size: 4,
                is_signed: true,
            }],
        };
        Arc::new(
            TranslationTable::build(
                vec![
                    ("sched".into(), small_sched_switch()),
                    ("sched".into(), wakeup),
                ],
                8,
            )
            .unwrap(),
        )
    }

    fn request(events: &[&str]) -> FtraceConfig {
        FtraceConfig {
            event_names: events.iter().map(|s| (*s).to_owned()).collect(),
            buffer_size_kb: None,
            drain_period_ms: None,
        }
    }

    fn read(dir: &tempfile::TempDir, rel: &str) -> String {
        std::fs::read_to_string(dir.path().join(rel)).unwrap()
    }

    #[test]
    fn setup_enables_requested_known_events() {
        let dir = fake_root();
        let tracefs = Arc::new(Tracefs::new(dir.path()).unwrap());
        let mut muxer = FtraceConfigMuxer::new(tracefs, table());

        let id = muxer
            .setup_config(&request(&["sched_switch", "not_an_event"]))
            .unwrap();
        assert_eq!(read(&dir, "events/sched/sched_switch/enable"), "1");
        assert_eq!(read(&dir, "events/sched/sched_wakeup/enable"), "0");
        assert_eq!(
            muxer.get_config(id).unwrap().event_names,
            vec!["sched_switch"]
        );

        // Setup alone must not start the capture.
        assert_eq!(read(&dir, "tracing_on"), "0");
        assert!(muxer.activate_config(id));
        assert_eq!(read(&dir, "tracing_on"), "1");
    }

    #[test]
    fn prefers_boot_clock() {
        let dir = fake_root();
        let tracefs = Arc::new(Tracefs::new(dir.path()).unwrap());
        let mut muxer = FtraceConfigMuxer::new(tracefs, table());
        muxer.setup_config(&request(&["sched_switch"])).unwrap();
        assert_eq!(read(&dir, "trace_clock"), "boot");
    }

    #[test]
    fn refuses_when_ftrace_is_foreign_owned() {
        let dir = fake_root();
        std::fs::write(dir.path().join("tracing_on"), "1").unwrap();
        let tracefs = Arc::new(Tracefs::new(dir.path()).unwrap());
        let mut muxer = FtraceConfigMuxer::new(tracefs, table());
        assert!(muxer.setup_config(&request(&["sched_switch"])).is_none());
    }

    #[test]
    fn removal_disables_only_unwanted_events_then_tears_down() {
        let dir = fake_root();
        let tracefs = Arc::new(Tracefs::new(dir.path()).unwrap());
        let mut muxer = FtraceConfigMuxer::new(tracefs, table());

        let a = muxer
            .setup_config(&request(&["sched_switch", "sched_wakeup"]))
            .unwrap();
        let b = muxer.setup_config(&request(&["sched_switch"])).unwrap();
        muxer.activate_config(a);
        muxer.activate_config(b);

        assert!(muxer.remove_config(a));
        // sched_switch still wanted by b.
        assert_eq!(read(&dir, "events/sched/sched_switch/enable"), "1");
        assert_eq!(read(&dir, "events/sched/sched_wakeup/enable"), "0");
        assert_eq!(read(&dir, "tracing_on"), "1");

        assert!(muxer.remove_config(b));
        assert_eq!(read(&dir, "tracing_on"), "0");
        assert_eq!(read(&dir, "events/enable"), "0");
        assert_eq!(read(&dir, "trace"), "");
        assert!(!muxer.remove_config(b));
    }

    #[test]
    fn buffer_size_is_clamped() {
        assert_eq!(compute_cpu_buffer_size_in_pages(0), 128);
        assert_eq!(compute_cpu_buffer_size_in_pages(512), 128);
        assert_eq!(compute_cpu_buffer_size_in_pages(100_000), 128);
        assert_eq!(compute_cpu_buffer_size_in_pages(2), 1);
    }
}
