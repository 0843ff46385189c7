/// Submissions - discovery, metadata and archiving
///
/// A submission is a directory, optionally a git checkout, with an optional
/// `<dir>.json` sidecar naming its author.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub commit: String,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub file_count: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionMeta {
    pub git: Option<GitInfo>,
    /// `name` from the `<dir>.json` sidecar file
    pub author: Option<String>,
    /// Full sidecar content
    pub sidecar: Option<Value>,
    pub stats: SourceStats,
}

/// One directory of untrusted code. Metadata is read once at load time;
/// reload to observe new commits.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    shortname: String,
    path: PathBuf,
    meta: SubmissionMeta,
}

impl Submission {
    pub async fn load(path: &Path) -> Result<Self> {
        let path = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("Submission directory not found: {}", path.display()))?;
        if !path.is_dir() {
            bail!("{} is not a directory", path.display());
        }
        let shortname = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("Submission directory has no usable name")?
            .to_string();

        let git = if path.join(".git").exists() {
            match git_info(&path).await {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(submission = %shortname, error = %e, "Failed to read git metadata");
                    None
                }
            }
        } else {
            None
        };

        let sidecar = read_sidecar(&path).await;
        let author = sidecar
            .as_ref()
            .and_then(|json| json.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let stats_root = path.clone();
        let stats = tokio::task::spawn_blocking(move || source_stats(&stats_root))
            .await
            .context("Source statistics task failed")?;

        Ok(Self {
            shortname,
            path,
            meta: SubmissionMeta {
                git,
                author,
                sidecar,
                stats,
            },
        })
    }

    /// Build a submission from already known parts, without touching disk
    pub fn from_parts(shortname: impl Into<String>, path: PathBuf, meta: SubmissionMeta) -> Self {
        Self {
            shortname: shortname.into(),
            path,
            meta,
        }
    }

    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &SubmissionMeta {
        &self.meta
    }

    /// Current commit, if version controlled
    pub fn revision(&self) -> Option<&str> {
        self.meta.git.as_ref().map(|git| git.commit.as_str())
    }

    pub fn is_version_controlled(&self) -> bool {
        self.meta.git.is_some()
    }

    /// Tar archive of the submission directory, injected as `/dut.tar`
    pub async fn archive(&self) -> Result<Vec<u8>> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.follow_symlinks(false);
            builder
                .append_dir_all(".", &root)
                .with_context(|| format!("Failed to archive {}", root.display()))?;
            builder.into_inner().context("Failed to finish submission archive")
        })
        .await
        .context("Archive task failed")?
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.meta.author, &self.meta.git) {
            (Some(author), _) => write!(f, "{}: {}", self.shortname, author),
            (None, Some(git)) => write!(
                f,
                "{}: {} / {}",
                self.shortname,
                git.branch.as_deref().unwrap_or("detached"),
                &git.commit[..git.commit.len().min(8)]
            ),
            (None, None) => f.write_str(&self.shortname),
        }
    }
}

async fn git(path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .args(args)
        .output()
        .await
        .context("Failed to spawn git")?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

async fn git_info(path: &Path) -> Result<GitInfo> {
    let commit = git(path, &["rev-parse", "HEAD"]).await?;
    let branch = git(path, &["branch", "--show-current"])
        .await
        .ok()
        .filter(|b| !b.is_empty());
    let date = git(path, &["show", "--no-patch", "--format=%cI", "HEAD"]).await.ok();
    Ok(GitInfo {
        branch,
        commit,
        date,
    })
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

async fn read_sidecar(path: &Path) -> Option<Value> {
    let sidecar = sidecar_path(path);
    let content = tokio::fs::read_to_string(&sidecar).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(path = %sidecar.display(), error = %e, "Ignoring malformed submission sidecar");
            None
        }
    }
}

fn source_stats(root: &Path) -> SourceStats {
    let mut stats = SourceStats::default();
    let files = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file());
    for entry in files {
        stats.file_count += 1;
        stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
    }
    stats
}

/// Where the watch loop finds submissions and how it refreshes them
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<Submission>>;

    /// Bring a version-controlled submission up to date
    async fn update(&self, submission: &Submission) -> Result<()>;
}

/// Each configured directory is one submission; updates are fast-forward
/// pulls
pub struct DirectorySource {
    directories: Vec<PathBuf>,
}

impl DirectorySource {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }
}

#[async_trait]
impl SubmissionSource for DirectorySource {
    async fn discover(&self) -> Result<Vec<Submission>> {
        let mut submissions = Vec::with_capacity(self.directories.len());
        for directory in &self.directories {
            if !directory.is_dir() {
                debug!(path = %directory.display(), "Skipping missing submission directory");
                continue;
            }
            match Submission::load(directory).await {
                Ok(submission) => submissions.push(submission),
                Err(e) => warn!(path = %directory.display(), error = %e, "Failed to load submission"),
            }
        }
        Ok(submissions)
    }

    async fn update(&self, submission: &Submission) -> Result<()> {
        git(submission.path(), &["pull", "--ff-only", "--quiet"])
            .await
            .with_context(|| format!("Failed to update {}", submission.shortname()))?;
        Ok(())
    }
}
