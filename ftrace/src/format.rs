//! Parser for the kernel's `events/<group>/<name>/format` files.
//!
//! The grammar is line-oriented:
//!
//! ```text
//! name: sched_switch
//! ID: 7
//! format:
//!     field:unsigned short common_type;   offset:0;  size:2; signed:0;
//!     ...blank line...
//!     field:char prev_comm[16];           offset:8;  size:16; signed:1;
//! print fmt: ...
//! ```
//!
//! Fields before the first blank separator are the common fields shared by
//! every event; the rest are event-specific.
use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatField {
    /// Declared C type, e.g. `char prev_comm[16]` or `pid_t pid`.
    pub type_and_name: String,
    pub name: String,
    pub offset: u16,
    pub size: u16,
    pub is_signed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatEvent {
    pub name: String,
    pub id: u16,
    pub common_fields: Vec<FormatField>,
    pub fields: Vec<FormatField>,
}

fn parse_attr<'a>(part: &'a str, key: &str) -> Result<&'a str> {
    let part = part.trim();
    part.strip_prefix(key)
        .with_context(|| format!("expected '{key}' in '{part}'"))
}

fn parse_field_line(line: &str) -> Result<FormatField> {
    // field:<type and name>; offset:<n>; size:<n>; signed:<0|1>;
    let mut parts = line.trim().trim_end_matches(';').split(';');
    let type_and_name = parse_attr(parts.next().context("missing field part")?, "field:")?;
    let offset: u16 = parse_attr(parts.next().context("missing offset part")?, "offset:")?
        .parse()
        .context("parsing offset")?;
    let size: u16 = parse_attr(parts.next().context("missing size part")?, "size:")?
        .parse()
        .context("parsing size")?;
    let is_signed = parse_attr(parts.next().context("missing signed part")?, "signed:")? == "1";

    // The field name is the last identifier. Arrays come in two shapes:
    // `char comm[16]` (brackets after the name) and `__data_loc char[] name`
    // (brackets before it).
    let name_part = match type_and_name.rfind(']') {
        Some(pos) if !type_and_name[pos + 1..].trim().is_empty() => &type_and_name[pos + 1..],
        Some(_) => &type_and_name[..type_and_name.rfind('[').unwrap()],
        None => type_and_name,
    };
    let name = name_part
        .split_whitespace()
        .last()
        .map(|n| n.trim_start_matches('*').to_owned())
        .with_context(|| format!("no field name in '{type_and_name}'"))?;

    Ok(FormatField {
        type_and_name: type_and_name.to_owned(),
        name,
        offset,
        size,
        is_signed,
    })
}

pub fn parse_format(text: &str) -> Result<FormatEvent> {
    let mut event = FormatEvent::default();
    let mut in_format = false;
    let mut after_separator = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("name:") {
            event.name = name.trim().to_owned();
        } else if let Some(id) = trimmed.strip_prefix("ID:") {
            event.id = id.trim().parse().context("parsing event id")?;
        } else if trimmed == "format:" {
            in_format = true;
        } else if trimmed.starts_with("print fmt:") {
            break;
        } else if in_format {
            if trimmed.is_empty() {
                after_separator = true;
            } else if trimmed.starts_with("field:") {
                let field = parse_field_line(trimmed)?;
                if after_separator {
                    event.fields.push(field);
                } else {
                    event.common_fields.push(field);
                }
            }
        }
    }

    if event.name.is_empty() {
        bail!("format file has no name");
    }
    if event.id == 0 {
        bail!("format file has no ID");
    }
    Ok(event)
}

/// Parses `events/header_page`, which declares the layout of the page
/// header. Only the width of the `commit` (size) field varies across
/// kernels; returns it in bytes.
pub fn parse_header_page(text: &str) -> Result<u16> {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("field:") {
            let field = parse_field_line(trimmed)?;
            if field.name == "commit" {
                return Ok(field.size);
            }
        }
    }
    bail!("header_page has no commit field");
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHED_SWITCH_FORMAT: &str = r#"name: sched_switch
ID: 7
format:
	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
	field:unsigned char common_flags;	offset:2;	size:1;	signed:0;
	field:unsigned char common_preempt_count;	offset:3;	size:1;	signed:0;
	field:int common_pid;	offset:4;	size:4;	signed:1;

	field:char prev_comm[16];	offset:8;	size:16;	signed:1;
	field:pid_t prev_pid;	offset:24;	size:4;	signed:1;
	field:int prev_prio;	offset:28;	size:4;	signed:1;
	field:long prev_state;	offset:32;	size:8;	signed:1;
	field:char next_comm[16];	offset:40;	size:16;	signed:1;
	field:pid_t next_pid;	offset:56;	size:4;	signed:1;
	field:int next_prio;	offset:60;	size:4;	signed:1;

print fmt: "prev_comm=%s prev_pid=%d", REC->prev_comm, REC->prev_pid
"#;

    #[test]
    fn parses_sched_switch() {
        let event = parse_format(SCHED_SWITCH_FORMAT).unwrap();
        assert_eq!(event.name, "sched_switch");
        assert_eq!(event.id, 7);
        assert_eq!(event.common_fields.len(), 4);
        assert_eq!(event.fields.len(), 7);

        let common_pid = &event.common_fields[3];
        assert_eq!(common_pid.name, "common_pid");
        assert_eq!(common_pid.offset, 4);
        assert_eq!(common_pid.size, 4);
        assert!(common_pid.is_signed);

        let prev_comm = &event.fields[0];
        assert_eq!(prev_comm.name, "prev_comm");
        assert_eq!(prev_comm.type_and_name, "char prev_comm[16]");
        assert_eq!(prev_comm.size, 16);
    }

    #[test]
    fn strips_pointer_and_array_from_names() {
        let f = parse_field_line("field:const char * file;\toffset:8;\tsize:8;\tsigned:0;").unwrap();
        assert_eq!(f.name, "file");
        let f = parse_field_line("field:__data_loc char[] name;\toffset:8;\tsize:4;\tsigned:1;");
        assert_eq!(f.unwrap().name, "name");
    }

    #[test]
    fn rejects_nameless_format() {
        assert!(parse_format("ID: 3\nformat:\n").is_err());
    }

    #[test]
    fn header_page_commit_width() {
        let text = r#"	field: u64 timestamp;	offset:0;	size:8;	signed:0;
	field: local_t commit;	offset:8;	size:8;	signed:1;
	field: int overwrite;	offset:8;	size:1;	signed:1;
	field: char data;	offset:16;	size:4080;	signed:1;
"#;
        assert_eq!(parse_header_page(text).unwrap(), 8);
    }
}
