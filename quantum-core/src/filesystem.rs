use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util;

/// One filesystem entry as last enumerated by [`list_directory`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileTreeNode {
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symlink: bool,
}

/// Sort entries: directories first, then lexicographically by name within each group.
pub fn sort_entries(entries: &mut [FileTreeNode]) {
    entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
}

/// Read directory contents, sorted with [`sort_entries`].
pub fn list_directory(path: &str, show_hidden: bool) -> Result<Vec<FileTreeNode>, String> {
    let dir_path = PathBuf::from(path);
    if !dir_path.is_dir() {
        return Err(format!("Not a directory: {}", path));
    }

    let mut entries = Vec::new();
    let read_dir =
        fs::read_dir(&dir_path).map_err(|e| format!("Failed to read directory: {}", e))?;

    for entry in read_dir {
        let entry = entry.map_err(|e| format!("Failed to read entry: {}", e))?;
        let name = entry.file_name().to_string_lossy().to_string();

        if !show_hidden && name.starts_with('.') {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| format!("Failed to get file type: {}", e))?;

        entries.push(FileTreeNode {
            path: entry.path().to_string_lossy().to_string(),
            name,
            is_directory: file_type.is_dir(),
            is_file: file_type.is_file(),
            is_symlink: file_type.is_symlink(),
        });
    }

    sort_entries(&mut entries);
    Ok(entries)
}

pub fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path, e))
}

pub fn write_file(path: &str, content: &str) -> Result<(), String> {
    util::write_atomic(path, content)
}

/// Create an empty file. Fails if anything already exists at `path`.
pub fn create_file(path: &str) -> Result<(), String> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| format!("Failed to create file {}: {}", path, e))
}

/// Create a directory and any missing parents.
pub fn create_directory(path: &str) -> Result<(), String> {
    fs::create_dir_all(path).map_err(|e| format!("Failed to create directory {}: {}", path, e))
}

/// Delete a file, symlink, or directory. Directories are removed recursively.
pub fn delete_path(path: &str) -> Result<(), String> {
    let metadata =
        fs::symlink_metadata(path).map_err(|e| format!("Failed to stat {}: {}", path, e))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).map_err(|e| format!("Failed to delete directory {}: {}", path, e))
    } else {
        fs::remove_file(path).map_err(|e| format!("Failed to delete {}: {}", path, e))
    }
}

/// Rename `old_path` to `new_path`. Refuses to replace an existing destination.
pub fn rename_path(old_path: &str, new_path: &str) -> Result<(), String> {
    if fs::symlink_metadata(new_path).is_ok() {
        return Err(format!("Destination already exists: {}", new_path));
    }
    if let Some(parent) = Path::new(new_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(format!("Destination directory does not exist: {}", parent.display()));
        }
    }
    fs::rename(old_path, new_path)
        .map_err(|e| format!("Failed to rename {} to {}: {}", old_path, new_path, e))
}
