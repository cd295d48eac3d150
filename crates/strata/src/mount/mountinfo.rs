//! `/proc/self/mountinfo` parsing.
//!
//! Line format: `ID PARENT MAJOR:MINOR ROOT MOUNT_POINT OPTIONS [OPTIONAL...] - FSTYPE SOURCE SUPER_OPTIONS`

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use strata_common::StrataResult;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One line of mountinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Unique mount id.
    pub id: u64,
    /// Id of the parent mount.
    pub parent: u64,
    /// Root of the mount within its filesystem.
    pub root: PathBuf,
    /// Mount point relative to the process root.
    pub mount_point: PathBuf,
    /// Filesystem type.
    pub fstype: String,
}

/// Parse mountinfo content, skipping malformed lines.
#[must_use]
pub fn parse(content: &str) -> Vec<MountInfo> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountInfo> {
    let (head, tail) = line.split_once(" - ")?;
    let mut fields = head.split_whitespace();

    let id = fields.next()?.parse().ok()?;
    let parent = fields.next()?.parse().ok()?;
    let _device = fields.next()?;
    let root = unescape(fields.next()?);
    let mount_point = unescape(fields.next()?);
    let fstype = tail.split_whitespace().next()?.to_string();

    Some(MountInfo {
        id,
        parent,
        root,
        mount_point,
        fstype,
    })
}

/// Decode the octal escapes (`\040` for space, ...) the kernel writes.
fn unescape(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    PathBuf::from(OsString::from_vec(out))
}

/// The id of the topmost mount at `path` in `entries`.
#[must_use]
pub fn mount_id_in(entries: &[MountInfo], path: &Path) -> Option<u64> {
    entries
        .iter()
        .rev()
        .find(|entry| entry.mount_point == path)
        .map(|entry| entry.id)
}

/// Read the current process's mount table.
///
/// # Errors
///
/// Returns an error if mountinfo cannot be read.
pub fn read() -> StrataResult<Vec<MountInfo>> {
    let content = std::fs::read_to_string(MOUNTINFO)?;
    Ok(parse(&content))
}

/// The id of the topmost mount at `path`, if anything is mounted there.
///
/// # Errors
///
/// Returns an error if mountinfo cannot be read.
pub fn mount_id_at(path: &Path) -> StrataResult<Option<u64>> {
    Ok(mount_id_in(&read()?, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec shared:12 - proc proc rw
61 22 0:50 / /home/dev/my\\040dir rw - tmpfs tmpfs rw
74 22 0:52 / /var/lib/strata/overlay/2f/mount rw,nosuid,nodev - fuse.fuse-overlayfs fuse-overlayfs rw,user_id=1000
75 74 0:53 / /var/lib/strata/overlay/2f/mount rw - fuse.fuse-overlayfs fuse-overlayfs rw
garbage line
";

    #[test]
    fn parses_entries() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].id, 22);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[1].fstype, "proc");
        assert_eq!(entries[1].parent, 22);
        assert_eq!(entries[3].fstype, "fuse.fuse-overlayfs");
    }

    #[test]
    fn unescapes_octal_sequences() {
        let entries = parse(SAMPLE);
        assert_eq!(entries[2].mount_point, PathBuf::from("/home/dev/my dir"));
        assert_eq!(unescape("a\\011b"), PathBuf::from("a\tb"));
        assert_eq!(unescape("trailing\\"), PathBuf::from("trailing\\"));
        assert_eq!(unescape("bad\\09x"), PathBuf::from("bad\\09x"));
    }

    #[test]
    fn topmost_mount_wins() {
        let entries = parse(SAMPLE);
        assert_eq!(
            mount_id_in(&entries, Path::new("/var/lib/strata/overlay/2f/mount")),
            Some(75)
        );
        assert_eq!(mount_id_in(&entries, Path::new("/proc")), Some(23));
        assert_eq!(mount_id_in(&entries, Path::new("/nowhere")), None);
    }

    #[test]
    fn reads_own_mount_table() {
        let entries = read().unwrap();
        assert!(!entries.is_empty());
    }
}
