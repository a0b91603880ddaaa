//! The compiled mapping from kernel event layouts to proto fields.
//!
//! Built once per tracing root by merging the kernel's declared offsets
//! and sizes (`format` files) with the static proto numbering of the
//! events we know. Events the static info does not know degrade to
//! `generic` events whose fields are emitted as name/value pairs.
//! Immutable after creation and shared by `Arc`.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::format::{FormatEvent, FormatField, parse_format, parse_header_page};
use crate::tracefs::Tracefs;
use ferrotrace_proto::ftrace::event as event_proto;

/// How a kernel field's bytes become a proto field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// `char name[N]`: up to N bytes, NUL-terminated early.
    FixedCString,
    /// `char name[]` with size 0: NUL-terminated, bounded by the record.
    CString,
    /// `char *`: a kernel pointer; unresolvable from user space, emitted
    /// as nothing.
    StringPtr,
    /// `__data_loc char[]`: 16-bit offset + 16-bit length into the record.
    DataLoc,
    Bool,
    /// Emits a varint and records the value in the drain metadata.
    Pid,
    /// The `common_pid` field, emitted at the event level.
    CommonPid,
    Inode32,
    Inode64,
    DevId32,
    DevId64,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub offset: u16,
    pub size: u16,
    pub kind: FieldKind,
    /// Proto field number inside the event message; 0 for generic events,
    /// whose fields are keyed by name instead.
    pub proto_field_id: u32,
    pub ftrace_name: String,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub group: String,
    pub ftrace_event_id: u16,
    /// Field number inside `FtraceEvent`; `event::GENERIC` for events
    /// without static info.
    pub proto_field_id: u32,
    /// Bytes spanned by the fixed-size fields; records shorter than this
    /// are rejected.
    pub size: u16,
    pub fields: Vec<Field>,
}

pub struct TranslationTable {
    events_by_id: HashMap<u16, Event>,
    name_to_id: HashMap<String, u16>,
    common_fields: Vec<Field>,
    largest_id: u16,
    /// Width of the page header's `commit` field on this kernel.
    page_header_size_len: u16,
}

fn infer_kind(field: &FormatField) -> Option<FieldKind> {
    let ty = field.type_and_name.as_str();
    if ty.starts_with("__data_loc") {
        return (field.size == 4).then_some(FieldKind::DataLoc);
    }
    if ty.contains('*') {
        return Some(FieldKind::StringPtr);
    }
    if ty.starts_with("char") || ty.starts_with("const char") {
        return Some(if field.size == 0 {
            FieldKind::CString
        } else {
            FieldKind::FixedCString
        });
    }
    if ty.starts_with("bool") {
        return Some(FieldKind::Bool);
    }
    if ty.starts_with("pid_t") {
        return Some(FieldKind::Pid);
    }
    if ty.starts_with("ino_t") || ty.starts_with("unsigned long ino") {
        return Some(match field.size {
            4 => FieldKind::Inode32,
            _ => FieldKind::Inode64,
        });
    }
    if ty.starts_with("dev_t") {
        return Some(match field.size {
            4 => FieldKind::DevId32,
            _ => FieldKind::DevId64,
        });
    }
    Some(match (field.size, field.is_signed) {
        (1, false) => FieldKind::U8,
        (1, true) => FieldKind::I8,
        (2, false) => FieldKind::U16,
        (2, true) => FieldKind::I16,
        (4, false) => FieldKind::U32,
        (4, true) => FieldKind::I32,
        (8, false) => FieldKind::U64,
        (8, true) => FieldKind::I64,
        _ => return None,
    })
}

/// Proto numbering of the events the table knows natively. Everything else
/// becomes a generic event.
fn static_event_proto_id(name: &str) -> Option<u32> {
    match name {
        "print" => Some(event_proto::PRINT),
        "sched_switch" => Some(event_proto::SCHED_SWITCH),
        "sched_wakeup" => Some(event_proto::SCHED_WAKEUP),
        _ => None,
    }
}

fn static_field_proto_id(event_name: &str, field_name: &str) -> Option<u32> {
    let id = match (event_name, field_name) {
        ("print", "ip") => 1,
        ("print", "buf") => 2,
        ("sched_switch", "prev_comm") => 1,
        ("sched_switch", "prev_pid") => 2,
        ("sched_switch", "prev_prio") => 3,
        ("sched_switch", "prev_state") => 4,
        ("sched_switch", "next_comm") => 5,
        ("sched_switch", "next_pid") => 6,
        ("sched_switch", "next_prio") => 7,
        ("sched_wakeup", "comm") => 1,
        ("sched_wakeup", "pid") => 2,
        ("sched_wakeup", "prio") => 3,
        ("sched_wakeup", "success") => 4,
        ("sched_wakeup", "target_cpu") => 5,
        _ => return None,
    };
    Some(id)
}

fn fixed_extent(field: &FormatField) -> u16 {
    match field.size {
        0 => field.offset,
        size => field.offset + size,
    }
}

impl TranslationTable {
    /// Compiles the table from a live tracing root.
    pub fn from_tracefs(tracefs: &Tracefs) -> Result<Arc<TranslationTable>> {
        let header_page = tracefs.read_header_page()?;
        let page_header_size_len =
            parse_header_page(&header_page).context("parsing header_page")?;
        let mut events = Vec::new();
        for (group, name) in tracefs.available_events()? {
            let text = match tracefs.read_event_format(&group, &name) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("skipping {group}/{name}: {e:#}");
                    continue;
                }
            };
            match parse_format(&text) {
                Ok(format) => events.push((group.clone(), format)),
                Err(e) => log::warn!("bad format file {group}/{name}: {e:#}"),
            }
        }
        Ok(Arc::new(Self::build(events, page_header_size_len)?))
    }

    /// Compiles the table from pre-parsed format events. Tests and
    /// benchmarks feed synthetic layouts through this.
    pub fn build(events: Vec<(String, FormatEvent)>, page_header_size_len: u16) -> Result<Self> {
        if events.is_empty() {
            bail!("no events to build a translation table from");
        }

        // Common fields are identical across events; take them from the
        // first. Only common_pid has a proto destination.
        let mut common_fields = Vec::new();
        for field in &events[0].1.common_fields {
            if field.name == "common_pid" {
                common_fields.push(Field {
                    offset: field.offset,
                    size: field.size,
                    kind: FieldKind::CommonPid,
                    proto_field_id: event_proto::PID,
                    ftrace_name: field.name.clone(),
                });
            }
        }

        let mut events_by_id = HashMap::new();
        let mut name_to_id = HashMap::new();
        let mut largest_id = 0u16;

        for (group, format) in events {
            let proto_field_id =
                static_event_proto_id(&format.name).unwrap_or(event_proto::GENERIC);
            let mut fields = Vec::new();
            let mut size = common_fields.iter().map(fixed_extent_field).max().unwrap_or(0);
            for field in &format.fields {
                let Some(kind) = infer_kind(field) else {
                    log::warn!(
                        "no strategy for field {} of {} ({}B)",
                        field.name,
                        format.name,
                        field.size
                    );
                    continue;
                };
                let field_proto_id = if proto_field_id == event_proto::GENERIC {
                    0
                } else {
                    match static_field_proto_id(&format.name, &field.name) {
                        Some(id) => id,
                        // Field added by a newer kernel; no proto slot.
                        None => continue,
                    }
                };
                size = size.max(fixed_extent(field));
                fields.push(Field {
                    offset: field.offset,
                    size: field.size,
                    kind,
                    proto_field_id: field_proto_id,
                    ftrace_name: field.name.clone(),
                });
            }

            largest_id = largest_id.max(format.id);
            name_to_id.insert(format.name.clone(), format.id);
            events_by_id.insert(
                format.id,
                Event {
                    name: format.name,
                    group,
                    ftrace_event_id: format.id,
                    proto_field_id,
                    size,
                    fields,
                },
            );
        }

        Ok(Self {
            events_by_id,
            name_to_id,
            common_fields,
            largest_id,
            page_header_size_len,
        })
    }

    pub fn event_by_id(&self, id: u16) -> Option<&Event> {
        self.events_by_id.get(&id)
    }

    pub fn event_by_name(&self, name: &str) -> Option<&Event> {
        self.name_to_id.get(name).and_then(|id| self.events_by_id.get(id))
    }

    pub fn largest_id(&self) -> u16 {
        self.largest_id
    }

    pub fn common_fields(&self) -> &[Field] {
        &self.common_fields
    }

    pub fn page_header_size_len(&self) -> u16 {
        self.page_header_size_len
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.name_to_id.keys().map(String::as_str)
    }
}

fn fixed_extent_field(field: &Field) -> u16 {
    match field.size {
        0 => field.offset,
        size => field.offset + size,
    }
}

/// Bitset of enabled ftrace event ids, indexed by id.
pub struct EventFilter {
    enabled: Vec<bool>,
}

impl EventFilter {
    pub fn new<'a>(
        table: &TranslationTable,
        names: impl IntoIterator<Item = &'a str>,
    ) -> EventFilter {
        let mut enabled = vec![false; table.largest_id() as usize + 1];
        for name in names {
            if let Some(event) = table.event_by_name(name) {
                enabled[event.ftrace_event_id as usize] = true;
            }
        }
        EventFilter { enabled }
    }

    pub fn is_enabled(&self, id: u16) -> bool {
        self.enabled.get(id as usize).copied().unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::format::{FormatEvent, FormatField};

    pub fn common_fields() -> Vec<FormatField> {
        vec![
            FormatField {
                type_and_name: "unsigned short common_type".into(),
                name: "common_type".into(),
                offset: 0,
                size: 2,
                is_signed: false,
            },
            FormatField {
                type_and_name: "int common_pid".into(),
                name: "common_pid".into(),
                offset: 4,
                size: 4,
                is_signed: true,
            },
        ]
    }

    /// `sched_switch` reduced to the two pid fields, id 7, as used by the
    /// deterministic ingestion tests.
    pub fn small_sched_switch() -> FormatEvent {
        FormatEvent {
            name: "sched_switch".into(),
            id: 7,
            common_fields: common_fields(),
            fields: vec![
                FormatField {
                    type_and_name: "pid_t prev_pid".into(),
                    name: "prev_pid".into(),
                    offset: 8,
                    size: 4,
                    is_signed: true,
                },
                FormatField {
                    type_and_name: "pid_t next_pid".into(),
                    name: "next_pid".into(),
                    offset: 12,
                    size: 4,
                    is_signed: true,
                },
            ],
        }
    }
}
