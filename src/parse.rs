//! Path handling for client-side walks.

use crate::error::{Error, Result};

/// Split a path into parent directory and leaf name.
pub(crate) fn split_parent_name(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::protocol(format!("invalid path '{}'", path)));
    }
    let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    let parent = if parent.is_empty() { "/" } else { parent };
    if name.is_empty() || name == "." || name == ".." {
        Err(Error::protocol(format!("invalid path '{}'", path)))
    } else {
        Ok((parent, name))
    }
}

/// Split a path into normalized components.
pub(crate) fn path_parts(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}
