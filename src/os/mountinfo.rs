//! Mount Table Parsing & Local Device Reconciliation
//!
//! Reads the host's live mount table (`/proc/self/mountinfo`) into
//! [`MountInfo`] rows and derives the `source -> mount point` map drivers
//! use to annotate attachment status.
//!
//! Row grammar:
//! `ID Parent Major:Minor Root MountPoint Opts [Optional...] - FSType Source VFSOpts...`
//!
//! A malformed row fails the whole table.

use crate::domain::types::{AttachmentStatus, LocalDevices, MountInfo};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Live mount table of the calling process
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Fields preceding the optional fields in every row
const LEADING_FIELDS: usize = 6;

/// Minimum fields after the ` - ` separator (type, source, options)
const TRAILER_FIELDS: usize = 3;

// =============================================================================
// Parsing
// =============================================================================

/// Parse a complete mount table; blank lines are ignored
pub fn parse_mount_table(text: &str) -> Result<Vec<MountInfo>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_mount_line)
        .collect()
}

/// Parse a single mount table row
pub fn parse_mount_line(line: &str) -> Result<MountInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < LEADING_FIELDS {
        return Err(parse_error(
            line,
            format!("expected at least {} leading fields", LEADING_FIELDS),
        ));
    }

    let separator = fields
        .iter()
        .skip(LEADING_FIELDS)
        .position(|f| *f == "-")
        .map(|p| p + LEADING_FIELDS)
        .ok_or_else(|| parse_error(line, "missing ' - ' separator"))?;

    let trailer = &fields[separator + 1..];
    if trailer.len() < TRAILER_FIELDS {
        return Err(parse_error(
            line,
            format!(
                "expected at least {} fields after separator, found {}",
                TRAILER_FIELDS,
                trailer.len()
            ),
        ));
    }

    let (major, minor) = fields[2]
        .split_once(':')
        .ok_or_else(|| parse_error(line, "device number is not major:minor"))?;

    Ok(MountInfo {
        id: parse_number(line, fields[0], "id")?,
        parent: parse_number(line, fields[1], "parent")?,
        major: parse_number(line, major, "major")?,
        minor: parse_number(line, minor, "minor")?,
        root: unescape_mount_field(fields[3]),
        mount_point: unescape_mount_field(fields[4]),
        opts: fields[5].to_string(),
        optional: fields[LEADING_FIELDS..separator].join(" "),
        fs_type: trailer[0].to_string(),
        source: unescape_mount_field(trailer[1]),
        vfs_opts: trailer[2..].join(" "),
    })
}

fn parse_number(line: &str, field: &str, name: &str) -> Result<u32> {
    field
        .parse()
        .map_err(|_| parse_error(line, format!("{} is not a number: {:?}", name, field)))
}

fn parse_error(line: &str, reason: impl Into<String>) -> Error {
    Error::MountTableParse {
        line: line.to_string(),
        reason: reason.into(),
    }
}

/// Decode the kernel's `\ooo` octal escapes (spaces appear as `\040`)
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}

// =============================================================================
// Reading & Filtering
// =============================================================================

/// Read and parse a mount table file
pub async fn read_mount_table(path: impl AsRef<Path>) -> Result<Vec<MountInfo>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let mounts = parse_mount_table(&text)?;
    debug!(path = %path.display(), count = mounts.len(), "Read mount table");
    Ok(mounts)
}

/// Filter mounts by device or mount point; an empty filter matches everything
pub fn filter_mounts(
    mounts: Vec<MountInfo>,
    device: &str,
    mount_point: &str,
) -> Result<Vec<MountInfo>> {
    match (device.is_empty(), mount_point.is_empty()) {
        (true, true) => Ok(mounts),
        (false, false) => Err(Error::Usage(
            "cannot filter mounts by both device and mount point".into(),
        )),
        (false, true) => Ok(mounts.into_iter().filter(|m| m.source == device).collect()),
        (true, false) => Ok(mounts
            .into_iter()
            .filter(|m| m.mount_point == mount_point)
            .collect()),
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Build a fresh device map from the mount table at `path`
pub async fn local_devices_from(
    driver: impl Into<String>,
    path: impl AsRef<Path>,
) -> Result<LocalDevices> {
    let mounts = read_mount_table(path).await?;
    Ok(LocalDevices::from_mounts(driver, &mounts))
}

/// Build a fresh device map from the live mount table
pub async fn local_devices(driver: impl Into<String>) -> Result<LocalDevices> {
    local_devices_from(driver, MOUNTINFO_PATH).await
}

/// Derive the status of a backend-declared export on this host
///
/// Without a device map the attachment can only be reported as exported.
pub fn attachment_status(device: &str, local_devices: Option<&LocalDevices>) -> AttachmentStatus {
    match local_devices {
        None => AttachmentStatus::Exported,
        Some(ld) if ld.mount_point(device).is_some() => AttachmentStatus::ExportedMounted,
        Some(_) => AttachmentStatus::ExportedUnmounted,
    }
}
