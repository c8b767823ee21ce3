//! Trace-fs plumbing: event id and format parsing for tracepoints, and
//! management of the writable kprobe/uprobe event files.
//!
//! All functions take the tracefs root as a parameter so the parsing
//! layers can be exercised against a plain directory.

use log::debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::probe::ArgDesc;

pub const TRACEFS: &str = "/sys/kernel/debug/tracing";

/// Fields every tracing event starts with (common_type, common_flags,
/// common_preempt_count, common_pid), skipped during format parsing.
const SKIP_FIELDS_COUNT: usize = 4;

pub fn tracefs_root() -> PathBuf {
    PathBuf::from(TRACEFS)
}

pub fn events_dir(root: &Path) -> PathBuf {
    root.join("events")
}

/// Parsed contents of an `events/<group>/<event>/format` file.
pub struct EventFormat {
    pub event_id: u32,
    pub args: Vec<ArgDesc>,
}

/// Parse a tracepoint format description: the event id from the `ID:`
/// line, and one argument type per `field:` line past the common fields
/// (plus `skip` extra caller-specified ones).  The identifier is
/// stripped from each declaration, keeping any array suffix; `__data_loc`
/// tags are dropped.
pub fn parse_event_format(content: &str, skip: usize) -> Result<EventFormat> {
    let skip = skip + SKIP_FIELDS_COUNT;
    let mut event_id: Option<u32> = None;
    let mut fields_seen = 0usize;
    let mut args: Vec<ArgDesc> = Vec::new();

    for line in content.lines() {
        let line = line.trim_start();

        if let Some(id) = line.strip_prefix("ID:") {
            event_id = id.trim().parse::<u32>().ok();
            continue;
        }

        let decl = match line.strip_prefix("field:") {
            Some(d) => d,
            None => continue,
        };
        let decl = match decl.split(';').next() {
            Some(d) => d.trim(),
            None => continue,
        };
        let decl = decl.strip_prefix("__data_loc ").unwrap_or(decl);

        fields_seen += 1;
        if fields_seen <= skip {
            continue;
        }

        args.push(ArgDesc {
            native: Some(strip_identifier(decl)),
            xlate: None,
            mapping: (args.len()) as u8,
        });
    }

    match event_id {
        Some(event_id) if fields_seen >= skip => Ok(EventFormat { event_id, args }),
        _ => Err(Error::Elf("malformed tracepoint format".to_string())),
    }
}

/// Drop the identifier from a field declaration, keeping the type and
/// any array dimensions: `char comm[16]` becomes `char [16]`.
fn strip_identifier(decl: &str) -> String {
    let decl = decl.trim();
    if !decl.ends_with(']') {
        // The last token is the identifier.
        match decl.rfind(char::is_whitespace) {
            Some(idx) => decl[..idx].trim_end().to_string(),
            None => decl.to_string(),
        }
    } else {
        // One or more array size specifications follow the identifier.
        // Find where they start.
        let bytes = decl.as_bytes();
        let mut i = decl.len() - 1;
        loop {
            while i > 0 && bytes[i] != b'[' {
                i -= 1;
            }
            let mut j = i;
            while j > 0 && bytes[j - 1] == b' ' {
                j -= 1;
            }
            if j == 0 || bytes[j - 1] != b']' {
                let arrays = &decl[i..];
                let head = decl[..j].trim_end();
                let head = match head.rfind(char::is_whitespace) {
                    Some(idx) => head[..idx].trim_end(),
                    None => head,
                };
                return format!("{} {}", head, arrays);
            }
            i = j - 1;
        }
    }
}

/// Read the id of an existing tracepoint event.
pub fn event_id(root: &Path, group: &str, event: &str) -> Result<u32> {
    let path = events_dir(root).join(group).join(event).join("id");
    let content = fs::read_to_string(&path)?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Elf(format!("bad event id in {}", path.display())))
}

/// Read and parse the format of an existing tracepoint event.
pub fn event_format(root: &Path, group: &str, event: &str, skip: usize) -> Result<EventFormat> {
    let path = events_dir(root).join(group).join(event).join("format");
    parse_event_format(&fs::read_to_string(path)?, skip)
}

/// Encode arbitrary bytes into the identifier-safe alphabet tracefs
/// accepts for event names.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            // '_' is the escape character, so it escapes itself.
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => out.push(b as char),
            _ => out.push_str(&format!("_{:02x}", b)),
        }
    }
    out
}

pub fn decode_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&name[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The canonical name of the uprobe for `(dev, inode, offset)`.
pub fn uprobe_name(dev: u64, ino: u64, addr: u64, is_return: bool) -> String {
    format!(
        "{}_{:x}_{:x}_0x{:x}",
        if is_return { "r" } else { "p" },
        dev,
        ino,
        addr
    )
}

/// The `uprobe_events` line that creates a probe.
pub fn uprobe_create_line(group: &str, name: &str, path: &str, offset: u64, is_return: bool) -> String {
    format!(
        "{}:{}/{} {}:0x{:x}\n",
        if is_return { 'r' } else { 'p' },
        group,
        name,
        path,
        offset
    )
}

/// The `kprobe_events` line that creates a function-boundary probe.
pub fn kprobe_create_line(group: &str, name: &str, func: &str, is_return: bool) -> String {
    format!(
        "{}:{}/{} {}\n",
        if is_return { 'r' } else { 'p' },
        group,
        name,
        func
    )
}

/// The removal line shared by both event files.
pub fn remove_line(group: &str, name: &str) -> String {
    format!("-:{}/{}\n", group, name)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new().write(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    Ok(())
}

/// Register a uprobe with the kernel and return its event id.
pub fn uprobe_create(
    root: &Path,
    group: &str,
    name: &str,
    path: &str,
    offset: u64,
    is_return: bool,
) -> Result<u32> {
    let line = uprobe_create_line(group, name, path, offset, is_return);
    debug!("uprobe_events <- {}", line.trim_end());
    append_line(&root.join("uprobe_events"), &line)?;
    event_id(root, group, name)
}

/// Remove a uprobe we created.  Never remove one a helper daemon owns.
pub fn uprobe_delete(root: &Path, group: &str, name: &str) -> Result<()> {
    append_line(&root.join("uprobe_events"), &remove_line(group, name))
}

/// Register a kprobe with the kernel and return its event id.
pub fn kprobe_create(
    root: &Path,
    group: &str,
    name: &str,
    func: &str,
    is_return: bool,
) -> Result<u32> {
    let line = kprobe_create_line(group, name, func, is_return);
    debug!("kprobe_events <- {}", line.trim_end());
    append_line(&root.join("kprobe_events"), &line)?;
    event_id(root, group, name)
}

pub fn kprobe_delete(root: &Path, group: &str, name: &str) -> Result<()> {
    append_line(&root.join("kprobe_events"), &remove_line(group, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: &str = "\
name: sched_process_exec
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:__data_loc char[] filename;\toffset:8;\tsize:4;\tsigned:1;
\tfield:pid_t pid;\toffset:12;\tsize:4;\tsigned:1;
\tfield:pid_t old_pid;\toffset:16;\tsize:4;\tsigned:1;

print fmt: \"filename=%s pid=%d\", __get_str(filename), REC->pid
";

    #[test]
    fn format_parses_id_and_args() {
        let fmt = parse_event_format(FORMAT, 0).unwrap();
        assert_eq!(fmt.event_id, 316);
        assert_eq!(fmt.args.len(), 3);
        assert_eq!(fmt.args[0].native.as_deref(), Some("char []"));
        assert_eq!(fmt.args[1].native.as_deref(), Some("pid_t"));
        assert_eq!(fmt.args[1].mapping, 1);
    }

    #[test]
    fn format_skip_count() {
        let fmt = parse_event_format(FORMAT, 1).unwrap();
        assert_eq!(fmt.args.len(), 2);
        assert_eq!(fmt.args[0].native.as_deref(), Some("pid_t"));
    }

    #[test]
    fn identifier_stripping() {
        assert_eq!(strip_identifier("unsigned long sector"), "unsigned long");
        assert_eq!(strip_identifier("char comm[16]"), "char [16]");
        assert_eq!(strip_identifier("u8 data[8][4]"), "u8 [8][4]");
        assert_eq!(strip_identifier("int nr"), "int");
    }

    #[test]
    fn uprobe_lines() {
        assert_eq!(
            uprobe_create_line("dt_42_uprobe", "p_fd01_1234_0x4f0", "/usr/bin/foo", 0x4f0, false),
            "p:dt_42_uprobe/p_fd01_1234_0x4f0 /usr/bin/foo:0x4f0\n"
        );
        assert_eq!(
            remove_line("dt_42_uprobe", "p_fd01_1234_0x4f0"),
            "-:dt_42_uprobe/p_fd01_1234_0x4f0\n"
        );
    }

    #[test]
    fn name_encoding_round_trips() {
        let ugly = "libfoo.so.1:func+0x10";
        let enc = encode_name(ugly);
        assert!(enc.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert_eq!(decode_name(&enc), ugly);
    }
}
