pub mod error;
pub mod paths;
pub mod porcelain;

pub use error::{Result, WorktreeError};

use git2::{BranchType, ErrorCode as GitErrorCode, Repository, Status, StatusOptions};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::process::Command;
use tracing::{debug, info, warn};

use rexec_protocol::{WorktreeChanges, WorktreeInfo, WorktreeStatus};

use crate::paths::{WORKTREES_DIR, has_worktrees_segment, is_contained, resolve, slugify, worktree_id};
use crate::porcelain::parse_worktree_list;

/// Selects a worktree to remove. The path wins when given; otherwise the
/// id or branch is matched against a fresh listing.
#[derive(Debug, Clone, Default)]
pub struct RemoveTarget {
    pub path: Option<PathBuf>,
    pub id: Option<String>,
    pub branch: Option<String>,
}

/// Provisions branch-bound working directories under `<project>/../worktrees/`.
///
/// Nothing is persisted: every descriptor is derived from the filesystem
/// and git's own worktree metadata.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: PathBuf,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self::new()
    }
}

struct ProjectLayout {
    project: PathBuf,
    root: PathBuf,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }

    /// New worktree on a new branch named after the slugified workspace name.
    pub async fn create(&self, project: &Path, name: &str, project_id: &str) -> Result<WorktreeInfo> {
        let branch = slugify(name);
        let (layout, target) = {
            let project = project.to_path_buf();
            let branch = branch.clone();
            blocking(move || {
                let layout = layout(&project)?;
                let target = target_path(&layout.root, &branch)?;
                if local_branch_exists(&layout.project, &branch)? {
                    return Err(WorktreeError::BranchExists(branch));
                }
                Ok((layout, target))
            })
            .await?
        };

        tokio::fs::create_dir_all(&layout.root).await?;
        self.run_git(
            &layout.project,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(&branch),
                target.as_os_str(),
            ],
        )
        .await?;

        info!(project = %layout.project.display(), path = %target.display(), branch = %branch, "worktree created");
        let name = name.trim().to_string();
        let project_id = project_id.to_string();
        blocking(move || describe(&target, Some(name.as_str()), &branch, &project_id, WorktreeStatus::Active))
            .await
    }

    /// Worktree for an existing branch: the local branch when present,
    /// otherwise a new local branch tracking `origin/<branch>`.
    pub async fn create_from_branch(
        &self,
        project: &Path,
        name: &str,
        project_id: &str,
        branch: &str,
    ) -> Result<WorktreeInfo> {
        if branch.trim().is_empty() || !git2::Branch::name_is_valid(branch)? {
            return Err(WorktreeError::InvalidBranch(branch.to_string()));
        }
        let name = match name.trim() {
            "" => branch.to_string(),
            name => name.to_string(),
        };
        let remote = format!("origin/{branch}");
        let (layout, target, local) = {
            let project = project.to_path_buf();
            let slug = slugify(&name);
            let branch = branch.to_string();
            let remote = remote.clone();
            blocking(move || {
                let layout = layout(&project)?;
                let target = target_path(&layout.root, &slug)?;
                let local = local_branch_exists(&layout.project, &branch)?;
                if !local && !remote_branch_exists(&layout.project, &remote)? {
                    return Err(WorktreeError::NotFound(format!("branch {branch}")));
                }
                Ok((layout, target, local))
            })
            .await?
        };

        tokio::fs::create_dir_all(&layout.root).await?;
        if local {
            self.run_git(
                &layout.project,
                [
                    OsStr::new("worktree"),
                    OsStr::new("add"),
                    target.as_os_str(),
                    OsStr::new(branch),
                ],
            )
            .await?;
        } else {
            self.run_git(
                &layout.project,
                [
                    OsStr::new("worktree"),
                    OsStr::new("add"),
                    OsStr::new("--track"),
                    OsStr::new("-b"),
                    OsStr::new(branch),
                    target.as_os_str(),
                    OsStr::new(&remote),
                ],
            )
            .await?;
        }

        info!(project = %layout.project.display(), path = %target.display(), branch = %branch, tracking = !local, "worktree created from branch");
        let branch = branch.to_string();
        let project_id = project_id.to_string();
        blocking(move || describe(&target, Some(name.as_str()), &branch, &project_id, WorktreeStatus::Active))
            .await
    }

    /// Managed worktrees of a project. Entries outside the managed root
    /// (the main checkout, externally created worktrees) are skipped.
    pub async fn list(&self, project: &Path, project_id: &str) -> Result<Vec<WorktreeInfo>> {
        let project = project.to_path_buf();
        let layout = blocking(move || layout(&project)).await?;
        self.list_in(&layout, project_id).await
    }

    async fn list_in(&self, layout: &ProjectLayout, project_id: &str) -> Result<Vec<WorktreeInfo>> {
        let output = self
            .run_git(
                &layout.project,
                [OsStr::new("worktree"), OsStr::new("list"), OsStr::new("--porcelain")],
            )
            .await?;

        let root = layout.root.clone();
        let project_id = project_id.to_string();
        blocking(move || {
            let mut worktrees = Vec::new();
            for entry in parse_worktree_list(&output) {
                if entry.bare {
                    continue;
                }
                let path = resolve(&entry.path)?;
                if !is_contained(&root, &path) {
                    debug!(path = %path.display(), "skipping worktree outside managed root");
                    continue;
                }
                let status = if entry.prunable || !path.is_dir() {
                    WorktreeStatus::Error
                } else {
                    WorktreeStatus::Active
                };
                let branch = entry.branch.unwrap_or_default();
                worktrees.push(describe(&path, None, &branch, &project_id, status)?);
            }
            Ok(worktrees)
        })
        .await
    }

    /// Remove a managed worktree, forcing once if the clean removal fails.
    pub async fn remove(&self, project: &Path, target: RemoveTarget) -> Result<WorktreeInfo> {
        let (layout, wanted_path) = {
            let project = project.to_path_buf();
            let path = target.path.clone().filter(|p| !p.as_os_str().is_empty());
            blocking(move || {
                let layout = layout(&project)?;
                let wanted = match path {
                    Some(path) => {
                        let resolved = resolve(&path)?;
                        if !is_contained(&layout.root, &resolved) {
                            return Err(WorktreeError::OutsideRoot(resolved));
                        }
                        Some(resolved)
                    }
                    None => None,
                };
                Ok((layout, wanted))
            })
            .await?
        };
        let wanted_id = target.id.as_deref().filter(|s| !s.is_empty());
        let wanted_branch = target.branch.as_deref().filter(|s| !s.is_empty());
        if wanted_path.is_none() && wanted_id.is_none() && wanted_branch.is_none() {
            return Err(WorktreeError::NotFound(
                "no worktree path, id or branch given".to_string(),
            ));
        }

        let listed = self.list_in(&layout, "").await?;
        let found = listed.into_iter().find(|w| match &wanted_path {
            Some(path) => &w.path == path,
            None => wanted_id == Some(w.id.as_str()) || wanted_branch == Some(w.branch.as_str()),
        });
        let Some(info) = found else {
            let what = wanted_path
                .map(|p| p.display().to_string())
                .or(wanted_id.map(str::to_string))
                .or(wanted_branch.map(str::to_string))
                .unwrap_or_default();
            return Err(WorktreeError::NotFound(what));
        };

        // Re-check right before touching the filesystem.
        if !is_contained(&layout.root, &info.path) {
            return Err(WorktreeError::OutsideRoot(info.path));
        }

        if !tokio::fs::try_exists(&info.path).await.unwrap_or(false) {
            self.run_git(&layout.project, [OsStr::new("worktree"), OsStr::new("prune")])
                .await?;
        } else if let Err(first) = self
            .run_git(
                &layout.project,
                [OsStr::new("worktree"), OsStr::new("remove"), info.path.as_os_str()],
            )
            .await
        {
            warn!(path = %info.path.display(), error = %first, "worktree removal failed, retrying with --force");
            self.run_git(
                &layout.project,
                [
                    OsStr::new("worktree"),
                    OsStr::new("remove"),
                    OsStr::new("--force"),
                    info.path.as_os_str(),
                ],
            )
            .await?;
        }

        info!(path = %info.path.display(), branch = %info.branch, "worktree removed");
        Ok(info)
    }

    /// Pending changes of a worktree. The path must sit below a directory
    /// literally named `worktrees`.
    pub fn get_status(&self, worktree: &Path) -> Result<WorktreeChanges> {
        let path = resolve(worktree)?;
        if !has_worktrees_segment(&path) {
            return Err(WorktreeError::NotAWorktree(path));
        }
        if !path.is_dir() {
            return Err(WorktreeError::NotFound(path.display().to_string()));
        }
        let repo = Repository::open(&path).map_err(|_| WorktreeError::NotAWorktree(path.clone()))?;
        collect_changes(&repo)
    }

    async fn run_git<I, S>(&self, cwd: &Path, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        debug!(cwd = %cwd.display(), ?args, "running git");
        let output = Command::new(&self.git)
            .args(&args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorktreeError::Git(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Filesystem and libgit2 work stays off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorktreeError::Io(std::io::Error::other(e)))?
}

fn layout(project: &Path) -> Result<ProjectLayout> {
    let project = std::fs::canonicalize(project).map_err(|_| {
        WorktreeError::InvalidProject(format!("{} does not exist", project.display()))
    })?;
    if !project.is_dir() {
        return Err(WorktreeError::InvalidProject(format!(
            "{} is not a directory",
            project.display()
        )));
    }
    let parent = project.parent().ok_or_else(|| {
        WorktreeError::InvalidProject(format!("{} has no parent directory", project.display()))
    })?;
    let root = parent.join(WORKTREES_DIR);
    let root = std::fs::canonicalize(&root).unwrap_or(root);
    Ok(ProjectLayout { project, root })
}

fn target_path(root: &Path, slug: &str) -> Result<PathBuf> {
    let target = root.join(slug);
    if !is_contained(root, &target) {
        return Err(WorktreeError::OutsideRoot(target));
    }
    if target.exists() {
        return Err(WorktreeError::AlreadyExists(target));
    }
    Ok(target)
}

fn open_project(project: &Path) -> Result<Repository> {
    Repository::open(project).map_err(|_| {
        WorktreeError::InvalidProject(format!("{} is not a git repository", project.display()))
    })
}

fn local_branch_exists(project: &Path, branch: &str) -> Result<bool> {
    branch_exists(&open_project(project)?, branch, BranchType::Local)
}

fn remote_branch_exists(project: &Path, branch: &str) -> Result<bool> {
    branch_exists(&open_project(project)?, branch, BranchType::Remote)
}

fn branch_exists(repo: &Repository, branch: &str, kind: BranchType) -> Result<bool> {
    match repo.find_branch(branch, kind) {
        Ok(_) => Ok(true),
        Err(e) if e.code() == GitErrorCode::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Descriptor for a worktree on disk. Without a caller-given name the
/// directory basename stands in.
fn describe(
    path: &Path,
    name: Option<&str>,
    branch: &str,
    project_id: &str,
    status: WorktreeStatus,
) -> Result<WorktreeInfo> {
    let path = resolve(path)?;
    let created_at_ms = std::fs::metadata(&path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    Ok(WorktreeInfo {
        id: worktree_id(&path),
        name: match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        },
        branch: branch.to_string(),
        path,
        project_id: project_id.to_string(),
        status,
        created_at_ms,
    })
}

fn collect_changes(repo: &Repository) -> Result<WorktreeChanges> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(false)
        .renames_head_to_index(true)
        .recurse_untracked_dirs(true);

    let staged_mask = Status::INDEX_NEW
        | Status::INDEX_MODIFIED
        | Status::INDEX_DELETED
        | Status::INDEX_RENAMED
        | Status::INDEX_TYPECHANGE;
    let unstaged_mask =
        Status::WT_MODIFIED | Status::WT_DELETED | Status::WT_RENAMED | Status::WT_TYPECHANGE;

    let mut changes = WorktreeChanges::default();
    for entry in repo.statuses(Some(&mut opts))?.iter() {
        let Some(path) = entry.path() else {
            continue;
        };
        let status = entry.status();
        if status.intersects(staged_mask) {
            changes.staged.push(path.to_string());
        }
        if status.contains(Status::WT_NEW) {
            changes.untracked.push(path.to_string());
        } else if status.intersects(unstaged_mask) {
            changes.unstaged.push(path.to_string());
        }
    }
    changes.has_changes =
        !(changes.staged.is_empty() && changes.unstaged.is_empty() && changes.untracked.is_empty());
    Ok(changes)
}
