//! Lexical path handling.
//!
//! Paths are `/`-separated UTF-8. Leading and repeated slashes are
//! tolerated, `.` components are skipped, and `..` pops lexically without
//! touching disk, never escaping the root.

use crate::error::{FsError, Result};

/// Splits a path into normalized components.
pub(crate) fn components(path: &str) -> Result<Vec<&str>> {
    let mut out: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            name => out.push(name),
        }
    }
    Ok(out)
}

/// Splits a path into the components of its parent and the final name.
/// Fails with `Invalid` if the path resolves to the root itself.
pub(crate) fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = components(path)?;
    match parts.pop() {
        Some(name) => Ok((parts, name)),
        None => Err(FsError::Invalid),
    }
}

/// Checks a single name for validity as a directory entry.
pub(crate) fn check_name(name: &str, name_limit: u32) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::Invalid);
    }
    if name.len() as u32 > name_limit {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}
