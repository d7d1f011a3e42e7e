//! Path <-> key resolution.
//!
//! Filesystem paths and store keys share one string space: the root is the
//! empty path, and every child path is `parent + "/" + name`. A directory
//! exists implicitly as the common prefix of its descendants, or explicitly
//! as an empty-valued marker key ending in `/`.
//!
//! Everything here is pure; no store access.

use crate::constants::SEPARATOR;

/// Join a parent path and a child name with the separator.
///
/// `resolve(path, "")` yields the prefix under which `path`'s children live:
/// `"/"` for the root, `"/b/"` for `/b`.
pub fn resolve(parent: &str, name: &str) -> String {
    let mut path = String::with_capacity(parent.len() + 1 + name.len());
    path.push_str(parent);
    path.push(SEPARATOR);
    path.push_str(name);
    path
}

/// Prefix shared by every key below `path`.
pub fn child_prefix(path: &str) -> String {
    resolve(path, "")
}

/// Marker key written for an explicitly created directory.
pub fn directory_marker(path: &str) -> String {
    child_prefix(path)
}

/// Decompose a scanned key into the next path segment below `parent_prefix`.
///
/// Returns the segment and whether the key continues below it (making the
/// segment a directory). `"/foo"` under `"/"` is `("foo", false)`;
/// `"/foo/bar"` is `("foo", true)`; the marker `"/foo/"` is `("foo", true)`.
///
/// Returns `None` when nothing names a child: the key is not under the
/// prefix, or it is the listed directory's own marker.
pub fn next_hierarchy_level<'a>(key: &'a str, parent_prefix: &str) -> Option<(&'a str, bool)> {
    let remainder = key.strip_prefix(parent_prefix)?;
    let mut pieces = remainder.splitn(2, SEPARATOR);
    let segment = normalize_segment(pieces.next().unwrap_or_default())?;
    Some((segment, pieces.next().is_some()))
}

/// Collapse a raw segment: empty and `.` segments name nothing.
fn normalize_segment(segment: &str) -> Option<&str> {
    match segment {
        "" | "." => None,
        other => Some(other),
    }
}

/// Parent path and final name of `path`. The root has no parent.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    path.rsplit_once(SEPARATOR)
}

/// Rewrite `key` from below `old_prefix` to below `new_prefix`.
pub fn rebase(key: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    key.strip_prefix(old_prefix).map(|rest| format!("{new_prefix}{rest}"))
}
