use std::any::Any;
use std::fs::File;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Determine the editor language id for a path based on its file name or extension.
pub fn language_from_path(path: &str) -> String {
    let path_obj = Path::new(path);
    if let Some(name) = path_obj.file_name().and_then(|n| n.to_str()) {
        if name.eq_ignore_ascii_case("dockerfile") {
            return "dockerfile".to_string();
        }
        if name == "Makefile" {
            return "makefile".to_string();
        }
    }
    let ext = path_obj
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "mjs" | "cjs" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "c" | "h" => "c",
        "cpp" | "cxx" | "cc" | "hpp" | "hxx" => "cpp",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "less" => "less",
        "json" => "json",
        "md" | "markdown" => "markdown",
        "yaml" | "yml" => "yaml",
        "xml" => "xml",
        "sql" => "sql",
        "sh" | "bash" | "zsh" => "shell",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "php" => "php",
        "toml" => "toml",
        _ => "plaintext",
    }
    .to_string()
}

/// Canonicalize `path` and check that it lies under `root`. `path` itself does
/// not have to exist yet.
///
/// The deepest existing ancestor is canonicalized and the remaining components
/// are appended. Parent-directory components in the non-existent tail are rejected.
pub fn resolve_within_root(path: &str, root: &str) -> Result<PathBuf, String> {
    let canonical_root = std::fs::canonicalize(root)
        .map_err(|e| format!("Failed to canonicalize root '{}': {}", root, e))?;

    let requested = Path::new(path);
    let mut existing = requested.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Err(format!("Path '{}' has no existing ancestor", path)),
        }
    }

    if Path::new(path)
        .components()
        .rev()
        .take(tail.len())
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!("Path '{}' contains a parent-directory component", path));
    }

    let mut resolved = std::fs::canonicalize(&existing)
        .map_err(|e| format!("Failed to canonicalize path '{}': {}", existing.display(), e))?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&canonical_root) {
        return Err(format!(
            "Path '{}' is outside the workspace root '{}'",
            path, root
        ));
    }
    Ok(resolved)
}

/// Render a panic payload for logging.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Write `content` to `path` by writing a sibling temp file and renaming it over
/// the original, so a crash mid-write never leaves a truncated file behind.
/// Existing file permissions are preserved.
pub fn write_atomic(path: &str, content: &str) -> Result<(), String> {
    let original_path = Path::new(path);
    let parent = original_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = std::fs::metadata(path).ok().map(|m| m.permissions());

    let tmp_path = parent.join(format!(
        ".{}.quantum-tmp",
        original_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string())
    ));

    {
        let mut tmp_file = File::create(&tmp_path)
            .map_err(|e| format!("Failed to create temp file '{}': {}", tmp_path.display(), e))?;
        tmp_file.write_all(content.as_bytes()).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            format!("Failed to write temp file '{}': {}", tmp_path.display(), e)
        })?;
        tmp_file.sync_all().map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            format!("Failed to sync temp file '{}': {}", tmp_path.display(), e)
        })?;
    }

    if let Some(permissions) = permissions {
        std::fs::set_permissions(&tmp_path, permissions).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            format!("Failed to set permissions on temp file: {}", e)
        })?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        format!("Failed to rename temp file to '{}': {}", path, e)
    })
}
