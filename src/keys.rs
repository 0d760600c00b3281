//! Object key layout and validation.
//!
//! User files live under `users/{id}/`, group files under `groups/{id}/`.
//! Client-supplied keys are always relative to one of those roots.

use crate::config::{GROUP_ROOT_PREFIX, USER_ROOT_PREFIX};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key")]
    Invalid,
    #[error("key is required")]
    Empty,
    #[error("invalid folder name")]
    InvalidFolderName,
}

/// Root prefix of a user's files.
pub fn user_root(user_id: &str) -> Result<String, KeyError> {
    Ok(format!("{USER_ROOT_PREFIX}/{}/", owner_segment(user_id)?))
}

/// Root prefix of a group's files.
pub fn group_root(group_id: &str) -> Result<String, KeyError> {
    Ok(format!("{GROUP_ROOT_PREFIX}/{}/", owner_segment(group_id)?))
}

fn owner_segment(id: &str) -> Result<&str, KeyError> {
    let id = id.trim();
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(KeyError::Invalid);
    }
    Ok(id)
}

/// Normalizes a client-relative key.
///
/// Leading slashes, empty segments and `.` are dropped; `..` and backslashes
/// are rejected. A trailing `/` is kept since it marks a folder. The result
/// may be empty (the root).
pub fn normalize(raw: &str) -> Result<String, KeyError> {
    if raw.contains('\\') {
        return Err(KeyError::Invalid);
    }
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(KeyError::Invalid),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Ok(String::new());
    }
    let mut normalized = segments.join("/");
    if raw.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Normalizes a key that must name a file.
pub fn normalize_file(raw: &str) -> Result<String, KeyError> {
    let key = normalize(raw)?;
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.ends_with('/') {
        return Err(KeyError::Invalid);
    }
    Ok(key)
}

/// Normalizes a key naming a file or a folder (non-empty).
pub fn normalize_entry(raw: &str) -> Result<String, KeyError> {
    let key = normalize(raw)?;
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    Ok(key)
}

/// Normalizes a folder key; the result is empty (root) or ends with `/`.
pub fn normalize_folder(raw: &str) -> Result<String, KeyError> {
    let mut key = normalize(raw)?;
    if !key.is_empty() && !key.ends_with('/') {
        key.push('/');
    }
    Ok(key)
}

/// Builds the marker key of a new folder `name` inside `parent`.
pub fn folder_marker(parent: &str, name: &str) -> Result<String, KeyError> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(KeyError::InvalidFolderName);
    }
    Ok(format!("{}{name}/", normalize_folder(parent)?))
}

pub fn is_folder(key: &str) -> bool {
    key.ends_with('/')
}

/// Prefix containing `key` (everything up to and including the last `/`
/// before the final segment).
pub fn parent_prefix(key: &str) -> &str {
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    match trimmed.rfind('/') {
        Some(index) => &key[..=index],
        None => "",
    }
}

/// Strips `root` from a full object key.
pub fn strip_root<'a>(root: &str, full: &'a str) -> Option<&'a str> {
    full.strip_prefix(root)
}
