use git2::{DiffFormat, DiffOptions, IndexAddOption, Repository, Signature, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Change classification derived from the porcelain status letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Modified,
    Added,
    Deleted,
    Renamed,
    Copied,
    Updated,
    Untracked,
    Unknown,
}

impl ChangeStatus {
    pub fn from_code(code: char) -> Self {
        match code {
            'M' => ChangeStatus::Modified,
            'A' => ChangeStatus::Added,
            'D' => ChangeStatus::Deleted,
            'R' => ChangeStatus::Renamed,
            'C' => ChangeStatus::Copied,
            'U' => ChangeStatus::Updated,
            '?' => ChangeStatus::Untracked,
            _ => ChangeStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Working,
    Untracked,
}

/// One path's entry in the working-tree status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitChangeRecord {
    pub path: String,
    pub status: ChangeStatus,
    pub staged: bool,
    #[serde(rename = "type")]
    pub kind: ChangeType,
}

impl GitChangeRecord {
    /// Build a record from the two porcelain status columns (index `x`, worktree `y`).
    pub fn from_codes(path: impl Into<String>, x: char, y: char) -> Self {
        let letter = if x != ' ' { x } else { y };
        GitChangeRecord {
            path: path.into(),
            status: ChangeStatus::from_code(letter),
            staged: x != ' ' && x != '?',
            kind: if x == '?' {
                ChangeType::Untracked
            } else {
                ChangeType::Working
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: String,
    pub files: Vec<GitChangeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    pub name: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub timestamp: i64,
    pub date: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub name: String,
    pub url: String,
}

/// Map libgit2 status bits onto the two porcelain columns.
pub fn porcelain_codes(status: Status) -> (char, char) {
    if status.is_conflicted() {
        return ('U', 'U');
    }
    if status.is_wt_new() && !status.intersects(index_bits()) {
        return ('?', '?');
    }

    let x = if status.is_index_new() {
        'A'
    } else if status.is_index_modified() {
        'M'
    } else if status.is_index_deleted() {
        'D'
    } else if status.is_index_renamed() {
        'R'
    } else if status.is_index_typechange() {
        'T'
    } else {
        ' '
    };

    let y = if status.is_wt_modified() {
        'M'
    } else if status.is_wt_deleted() {
        'D'
    } else if status.is_wt_renamed() {
        'R'
    } else if status.is_wt_typechange() {
        'T'
    } else {
        ' '
    };

    (x, y)
}

fn index_bits() -> Status {
    Status::INDEX_NEW
        | Status::INDEX_MODIFIED
        | Status::INDEX_DELETED
        | Status::INDEX_RENAMED
        | Status::INDEX_TYPECHANGE
}

/// Git operations for one workspace. Paths are relative to the repository root.
#[derive(Debug, Clone)]
pub struct GitService {
    root: PathBuf,
}

impl GitService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        GitService { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self) -> Result<Repository, String> {
        Repository::discover(&self.root).map_err(|e| format!("Not a git repo: {}", e))
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>, String> {
        repo.signature()
            .or_else(|_| Signature::now("Quantum IDE", "quantum@localhost"))
            .map_err(|e| format!("Failed to build signature: {}", e))
    }

    /// Turn an absolute path under the work tree into a repo-relative one.
    fn relative(repo: &Repository, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        if !candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }
        let workdir = repo.workdir().ok_or("Bare repository")?;
        if let Ok(rel) = candidate.strip_prefix(workdir) {
            return Ok(rel.to_path_buf());
        }
        let canonical_workdir = std::fs::canonicalize(workdir)
            .map_err(|e| format!("Failed to canonicalize work tree: {}", e))?;
        candidate
            .strip_prefix(&canonical_workdir)
            .map(Path::to_path_buf)
            .map_err(|_| format!("File not in repo: {}", path))
    }

    pub fn is_repo(&self) -> bool {
        self.open().is_ok()
    }

    /// Name of the checked-out branch. An unborn branch reports the name HEAD points at.
    pub fn current_branch(&self) -> Result<String, String> {
        let repo = self.open()?;
        let result = match repo.head() {
            Ok(head) => Ok(head.shorthand().unwrap_or("HEAD").to_string()),
            Err(_) => {
                let head = repo
                    .find_reference("HEAD")
                    .map_err(|e| format!("Failed to read HEAD: {}", e))?;
                Ok(head
                    .symbolic_target()
                    .map(|t| t.trim_start_matches("refs/heads/").to_string())
                    .unwrap_or_else(|| "HEAD".to_string()))
            }
        };
        result
    }

    pub fn status(&self) -> Result<GitStatus, String> {
        let repo = self.open()?;
        let branch = self.current_branch()?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(|e| format!("Failed to read status: {}", e))?;

        let mut files = Vec::new();
        for entry in statuses.iter() {
            let status = entry.status();
            if status.is_ignored() || status == Status::CURRENT {
                continue;
            }
            let Some(path) = entry.path() else {
                log::warn!("Skipping status entry with a non-UTF-8 path");
                continue;
            };
            let (x, y) = porcelain_codes(status);
            files.push(GitChangeRecord::from_codes(path, x, y));
        }

        Ok(GitStatus { branch, files })
    }

    /// Stage a path. Deleted files are removed from the index; directories are staged recursively.
    pub fn stage(&self, path: &str) -> Result<(), String> {
        let repo = self.open()?;
        let rel = Self::relative(&repo, path)?;
        let spec = rel.to_string_lossy().to_string();
        let mut index = repo.index().map_err(|e| format!("Failed to open index: {}", e))?;
        index
            .add_all([spec.as_str()], IndexAddOption::DEFAULT, None)
            .map_err(|e| format!("Failed to stage {}: {}", path, e))?;
        index
            .update_all([spec.as_str()], None)
            .map_err(|e| format!("Failed to stage {}: {}", path, e))?;
        index
            .write()
            .map_err(|e| format!("Failed to write index: {}", e))
    }

    pub fn unstage(&self, path: &str) -> Result<(), String> {
        let repo = self.open()?;
        let rel = Self::relative(&repo, path)?;
        let result = match repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(head) => repo
                .reset_default(Some(head.as_object()), [rel.as_path()])
                .map_err(|e| format!("Failed to unstage {}: {}", path, e)),
            Err(_) => {
                // No commits yet: unstaging means dropping the index entry.
                let mut index = repo.index().map_err(|e| format!("Failed to open index: {}", e))?;
                index
                    .remove_path(&rel)
                    .map_err(|e| format!("Failed to unstage {}: {}", path, e))?;
                index
                    .write()
                    .map_err(|e| format!("Failed to write index: {}", e))
            }
        };
        result
    }

    /// Commit the index. Returns the new commit hash.
    pub fn commit(&self, message: &str) -> Result<String, String> {
        if message.trim().is_empty() {
            return Err("Commit message cannot be empty".to_string());
        }
        let repo = self.open()?;
        let mut index = repo.index().map_err(|e| format!("Failed to open index: {}", e))?;
        let tree_id = index
            .write_tree()
            .map_err(|e| format!("Failed to write tree: {}", e))?;
        let tree = repo
            .find_tree(tree_id)
            .map_err(|e| format!("Failed to find tree: {}", e))?;

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let unchanged = match &parent {
            Some(p) => p.tree_id() == tree_id,
            None => tree.len() == 0,
        };
        if unchanged {
            return Err("Nothing to commit".to_string());
        }

        let sig = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(|e| format!("Commit failed: {}", e))?;
        Ok(oid.to_string())
    }

    /// Create a local branch at HEAD without checking it out.
    pub fn create_branch(&self, name: &str) -> Result<(), String> {
        let repo = self.open()?;
        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| format!("Cannot branch without a commit: {}", e))?;
        repo.branch(name, &head, false)
            .map(|_| ())
            .map_err(|e| format!("Failed to create branch {}: {}", name, e))
    }

    pub fn list_branches(&self) -> Result<Vec<BranchInfo>, String> {
        let repo = self.open()?;
        let branches = repo
            .branches(Some(git2::BranchType::Local))
            .map_err(|e| format!("Failed to list branches: {}", e))?;
        let mut result = Vec::new();
        for branch in branches {
            let (branch, _) = branch.map_err(|e| format!("Failed to read branch: {}", e))?;
            if let Ok(Some(name)) = branch.name() {
                result.push(BranchInfo {
                    name: name.to_string(),
                    is_current: branch.is_head(),
                });
            }
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    pub fn checkout(&self, branch: &str) -> Result<(), String> {
        let repo = self.open()?;
        let (object, reference) = repo
            .revparse_ext(branch)
            .map_err(|e| format!("Unknown revision {}: {}", branch, e))?;
        repo.checkout_tree(&object, None)
            .map_err(|e| format!("Checkout failed: {}", e))?;
        let moved = match reference.as_ref().and_then(|r| r.name()) {
            Some(name) => repo.set_head(name),
            None => repo.set_head_detached(object.id()),
        };
        moved.map_err(|e| format!("Failed to move HEAD: {}", e))
    }

    /// Commit history from HEAD, newest first. An unborn branch has no history.
    pub fn log(&self, limit: usize) -> Result<Vec<CommitRecord>, String> {
        let repo = self.open()?;
        if repo.head().is_err() {
            return Ok(Vec::new());
        }
        let mut walk = repo
            .revwalk()
            .map_err(|e| format!("Failed to walk history: {}", e))?;
        walk.set_sorting(git2::Sort::TIME)
            .map_err(|e| format!("Failed to walk history: {}", e))?;
        walk.push_head()
            .map_err(|e| format!("Failed to walk history: {}", e))?;

        let mut records = Vec::new();
        for oid in walk.take(limit) {
            let oid = oid.map_err(|e| format!("Failed to walk history: {}", e))?;
            let commit = repo
                .find_commit(oid)
                .map_err(|e| format!("Failed to read commit {}: {}", oid, e))?;
            let author = commit.author();
            let timestamp = commit.time().seconds();
            records.push(CommitRecord {
                hash: oid.to_string(),
                author: author.name().unwrap_or("Unknown").to_string(),
                email: author.email().unwrap_or("").to_string(),
                timestamp,
                date: format_timestamp(timestamp),
                subject: commit.summary().unwrap_or("").to_string(),
                body: commit.body().unwrap_or("").trim().to_string(),
            });
        }
        Ok(records)
    }

    /// Unified diff of unstaged changes for one path.
    pub fn diff(&self, path: &str) -> Result<String, String> {
        let repo = self.open()?;
        let rel = Self::relative(&repo, path)?;
        let mut opts = DiffOptions::new();
        opts.pathspec(rel.as_path());
        let diff = repo
            .diff_index_to_workdir(None, Some(&mut opts))
            .map_err(|e| format!("Diff failed: {}", e))?;

        let mut out = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                out.push(line.origin());
            }
            out.push_str(&String::from_utf8_lossy(line.content()));
            true
        })
        .map_err(|e| format!("Diff failed: {}", e))?;
        Ok(out)
    }

    pub fn stash(&self) -> Result<(), String> {
        let mut repo = self.open()?;
        let sig = Self::signature(&repo)?;
        let message = format!("WIP on {}", self.current_branch()?);
        repo.stash_save(&sig, &message, None)
            .map(|_| ())
            .map_err(|e| format!("Failed to stash changes: {}", e))
    }

    pub fn stash_pop(&self) -> Result<(), String> {
        let mut repo = self.open()?;
        repo.stash_pop(0, None)
            .map_err(|e| format!("Failed to pop stash: {}", e))
    }

    pub fn list_remotes(&self) -> Result<Vec<RemoteInfo>, String> {
        let repo = self.open()?;
        let names = repo
            .remotes()
            .map_err(|e| format!("Failed to list remotes: {}", e))?;
        let mut remotes = Vec::new();
        for name in names.iter().flatten() {
            let remote = repo
                .find_remote(name)
                .map_err(|e| format!("Failed to read remote {}: {}", name, e))?;
            remotes.push(RemoteInfo {
                name: name.to_string(),
                url: remote.url().unwrap_or("").to_string(),
            });
        }
        Ok(remotes)
    }

    /// Discard working-tree changes for a single path, restoring it to the HEAD version.
    /// Untracked files are left alone.
    pub fn revert(&self, path: &str) -> Result<(), String> {
        let repo = self.open()?;
        let rel = Self::relative(&repo, path)?;
        let mut checkout_opts = git2::build::CheckoutBuilder::new();
        checkout_opts.path(rel.as_path());
        checkout_opts.force();
        repo.checkout_head(Some(&mut checkout_opts))
            .map_err(|e| format!("Checkout failed: {}", e))
    }

    pub fn push(&self) -> Result<(), String> {
        let branch = self.current_branch()?;
        self.run_git(&["push", "origin", &branch])
    }

    pub fn pull(&self) -> Result<(), String> {
        let branch = self.current_branch()?;
        self.run_git(&["pull", "origin", &branch])
    }

    /// Network operations go through the git binary so credential helpers keep working.
    fn run_git(&self, args: &[&str]) -> Result<(), String> {
        log::debug!("Running git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| format!("Failed to run git: {}", e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "git {} failed: {}",
                args[0],
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

/// Format a unix timestamp into a human-readable date string.
fn format_timestamp(timestamp: i64) -> String {
    let days_since_epoch = timestamp.div_euclid(86400);

    let mut year = 1970i32;
    let mut remaining_days = days_since_epoch;
    // Commits dated before 1970 walk backwards first.
    while remaining_days < 0 {
        year -= 1;
        remaining_days += if is_leap_year(year) { 366 } else { 365 };
    }
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let february = if is_leap_year(year) { 29 } else { 28 };
    let days_in_months = [31, february, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    let mut month = 1u32;
    for days in days_in_months {
        if remaining_days < days {
            break;
        }
        remaining_days -= days;
        month += 1;
    }

    format!("{}-{:02}-{:02}", year, month, remaining_days + 1)
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}
