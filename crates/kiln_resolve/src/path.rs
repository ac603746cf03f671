//! Lexical path helpers.

use std::path::{Component, Path, PathBuf};

/// Normalizes `.` and `..` components without touching the filesystem.
///
/// Symlinks are not followed, so `a/link/..` becomes `a`. A `..` at the root
/// is dropped; a leading `..` in a relative path is kept.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Appends `suffix` to the final component of `path` (`util` + `.js`).
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
