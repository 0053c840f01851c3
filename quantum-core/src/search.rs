use ignore::WalkBuilder;
use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::util;

/// Directory names never descended into, regardless of ignore files.
pub const EXCLUDED_DIRS: [&str; 5] = ["node_modules", ".git", "dist", "build", "coverage"];

const MAX_FILE_SIZE: u64 = 1_048_576;
const PROGRESS_INTERVAL: usize = 50;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFlags {
    pub match_case: bool,
    pub whole_word: bool,
    pub use_regex: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SearchMatch {
    /// Path relative to the search root.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
    /// 0-based character offset into the untrimmed line.
    pub column: u32,
    /// Match length in characters.
    pub length: u32,
    /// The source line with surrounding whitespace removed.
    pub text: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchProgress {
    pub files_searched: usize,
    pub matches: usize,
}

/// Compile `pattern` according to `flags`.
pub fn build_matcher(pattern: &str, flags: SearchFlags) -> Result<Regex, String> {
    let mut source = if flags.use_regex {
        pattern.to_string()
    } else {
        regex::escape(pattern)
    };
    if flags.whole_word {
        source = format!(r"\b(?:{})\b", source);
    }
    RegexBuilder::new(&source)
        .case_insensitive(!flags.match_case)
        .build()
        .map_err(|e| format!("Invalid search pattern: {}", e))
}

/// Check the first 8KB of an already-opened file for null bytes (binary indicator).
/// On success the handle is rewound for subsequent reading.
fn check_binary_and_rewind(file: &mut File) -> Result<bool, std::io::Error> {
    let mut buffer = [0u8; 8192];
    let bytes_read = file.read(&mut buffer)?;
    let is_binary = buffer[..bytes_read].contains(&0);
    file.seek(SeekFrom::Start(0))?;
    Ok(is_binary)
}

/// Read a file as text, or `None` if it is binary, too large, or unreadable.
fn read_text_file(path: &Path) -> Option<String> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("Failed to open '{}': {}", path.display(), e);
            return None;
        }
    };
    match file.metadata() {
        Ok(m) if m.len() > MAX_FILE_SIZE => return None,
        Ok(_) => {}
        Err(e) => {
            log::warn!("Failed to stat '{}': {}", path.display(), e);
            return None;
        }
    }
    match check_binary_and_rewind(&mut file) {
        Ok(true) => return None,
        Ok(false) => {}
        Err(e) => {
            log::warn!("Failed to read '{}': {}", path.display(), e);
            return None;
        }
    }
    let mut content = String::new();
    match file.read_to_string(&mut content) {
        Ok(_) => Some(content),
        // Not UTF-8; treat like binary.
        Err(_) => None,
    }
}

/// Files under `root` eligible for content search, in path order.
fn candidate_files(root: &str) -> impl Iterator<Item = PathBuf> {
    WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .same_file_system(true)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| EXCLUDED_DIRS.contains(&name)))
        })
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(|entry| entry.into_path())
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|c| c.load(Ordering::Relaxed))
}

/// Search file contents under `root`.
///
/// `on_progress` is called every 50 files and once when the walk ends. If `cancel`
/// is set the search stops at the next file boundary and returns partial results.
pub fn search_in_files<F>(
    root: &str,
    pattern: &str,
    flags: SearchFlags,
    cancel: Option<&AtomicBool>,
    mut on_progress: F,
) -> Result<Vec<SearchMatch>, String>
where
    F: FnMut(SearchProgress),
{
    if pattern.is_empty() {
        return Ok(Vec::new());
    }
    let matcher = build_matcher(pattern, flags)?;
    let root_path = Path::new(root);

    let mut results = Vec::new();
    let mut files_searched = 0usize;

    for path in candidate_files(root) {
        if is_cancelled(cancel) {
            log::debug!("Search for '{}' cancelled after {} files", pattern, files_searched);
            break;
        }

        if let Some(content) = read_text_file(&path) {
            let file = path
                .strip_prefix(root_path)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();

            for (line_idx, line) in content.lines().enumerate() {
                for m in matcher.find_iter(line) {
                    if m.as_str().is_empty() {
                        continue;
                    }
                    results.push(SearchMatch {
                        file: file.clone(),
                        line: (line_idx + 1) as u32,
                        column: line[..m.start()].chars().count() as u32,
                        length: m.as_str().chars().count() as u32,
                        text: line.trim().to_string(),
                    });
                }
            }
        }

        files_searched += 1;
        if files_searched % PROGRESS_INTERVAL == 0 {
            on_progress(SearchProgress {
                files_searched,
                matches: results.len(),
            });
        }
    }

    on_progress(SearchProgress {
        files_searched,
        matches: results.len(),
    });
    Ok(results)
}

/// Replace every match of `pattern` under `root` with `replacement`.
///
/// With `use_regex` the replacement may reference capture groups (`$1`); otherwise it is
/// inserted literally. Files are rewritten atomically. Returns the number of files changed.
pub fn replace_all(
    root: &str,
    pattern: &str,
    flags: SearchFlags,
    replacement: &str,
    cancel: Option<&AtomicBool>,
) -> Result<usize, String> {
    if pattern.is_empty() {
        return Ok(0);
    }
    let matcher = build_matcher(pattern, flags)?;

    let mut files_changed = 0usize;
    for path in candidate_files(root) {
        if is_cancelled(cancel) {
            break;
        }
        let Some(content) = read_text_file(&path) else {
            continue;
        };
        if !matcher.is_match(&content) {
            continue;
        }

        let updated = if flags.use_regex {
            matcher.replace_all(&content, replacement)
        } else {
            matcher.replace_all(&content, NoExpand(replacement))
        };
        if updated == content {
            continue;
        }

        let path_str = path.to_string_lossy();
        util::write_atomic(&path_str, &updated)?;
        files_changed += 1;
    }

    log::info!("Replaced '{}' in {} file(s)", pattern, files_changed);
    Ok(files_changed)
}
