//! Version source interface and implementations.
//!
//! The version source lists the tags known for the application and
//! materializes a tag's source tree into a local directory:
//! - `GitSource` shells out to `git`
//! - `MockSource` keeps everything in memory (tests and development)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, Result};

/// Version source interface.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// One-time preparation before the first `list_tags` call.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// List every tag the source knows about, in source order.
    ///
    /// Fails with `SourceUnavailable` when the source cannot be reached.
    async fn list_tags(&self) -> Result<Vec<String>>;

    /// Clone-if-absent, pull-if-present the given tag into `dest`.
    async fn materialize(&self, tag: &str, dest: &Path) -> Result<()>;
}

/// Git-backed version source.
pub struct GitSource {
    repo_url: String,
    api_key: String,
    /// Checkout of the default branch used to read tags.
    index_dir: PathBuf,
}

impl GitSource {
    pub fn new(
        repo_url: impl Into<String>,
        api_key: impl Into<String>,
        workspace_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            api_key: api_key.into(),
            index_dir: workspace_dir.as_ref().join("main"),
        }
    }

    /// `Authorization` header for https remotes when an API key is set.
    fn auth_header(&self) -> Option<String> {
        if self.api_key.is_empty() || !self.repo_url.starts_with("https://") {
            return None;
        }
        let credentials = STANDARD.encode(format!("x-access-token:{}", self.api_key));
        Some(format!("Authorization: Basic {credentials}"))
    }

    /// The API key travels as environment-supplied config, so it never lands
    /// in a checkout's `.git/config` or in the process arguments.
    fn command(&self, args: &[&str], dir: Option<&Path>) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(header) = self.auth_header() {
            cmd.env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", header);
        }
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run git, mapping a spawn error or non-zero exit to `Err(detail)`.
    async fn git(&self, args: &[&str], dir: Option<&Path>) -> std::result::Result<String, String> {
        let mut cmd = self.command(args, dir);
        let output = cmd.output().await.map_err(|e| format!("failed to run git: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("git {} exited with {}: {}", args[0], output.status, stderr.trim()))
        }
    }

    async fn clone_or_pull(
        &self,
        branch: Option<&str>,
        dest: &Path,
    ) -> std::result::Result<(), String> {
        if dest.join(".git").exists() {
            info!(dest = %dest.display(), "Existing checkout found, pulling");
            if let Err(e) = self.git(&["pull"], Some(dest)).await {
                warn!(
                    dest = %dest.display(),
                    error = %e,
                    "Pull failed, using the existing checkout"
                );
            }
            return Ok(());
        }

        info!(dest = %dest.display(), branch = ?branch, "No checkout found, cloning");
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
        }

        let dest_str = dest.to_string_lossy();
        let mut args = vec!["clone"];
        if let Some(branch) = branch {
            args.extend(["--depth", "1", "--branch", branch]);
        }
        args.extend([self.repo_url.as_str(), &*dest_str]);

        self.git(&args, None).await.map(|_| ())
    }
}

#[async_trait]
impl VersionSource for GitSource {
    async fn prepare(&self) -> Result<()> {
        info!(repo_url = %self.repo_url, "Preparing tag index checkout");
        self.clone_or_pull(None, &self.index_dir)
            .await
            .map_err(ControllerError::Source)
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        if !self.index_dir.join(".git").exists() {
            // An earlier prepare failed; retry the clone.
            self.clone_or_pull(None, &self.index_dir)
                .await
                .map_err(ControllerError::SourceUnavailable)?;
        }

        debug!("Fetching tags");
        if let Err(e) = self
            .git(
                &["fetch", "--prune", "origin", "+refs/tags/*:refs/tags/*"],
                Some(&self.index_dir),
            )
            .await
        {
            warn!(error = %e, "Failed to fetch tags, using the locally known tags");
        }

        let out = self
            .git(&["tag", "--list"], Some(&self.index_dir))
            .await
            .map_err(ControllerError::SourceUnavailable)?;

        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn materialize(&self, tag: &str, dest: &Path) -> Result<()> {
        self.clone_or_pull(Some(tag), dest)
            .await
            .map_err(|reason| ControllerError::MaterializationFailed {
                tag: tag.to_string(),
                reason,
            })
    }
}

/// In-memory version source for testing and development.
#[derive(Default)]
pub struct MockSource {
    tags: Mutex<Vec<String>>,
    unavailable: Mutex<bool>,
    broken: Mutex<Option<String>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    materialized: Mutex<Vec<String>>,
}

impl MockSource {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Self::default();
        source.set_tags(tags);
        source
    }

    /// Replace the tag list.
    pub fn set_tags<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *lock(&self.tags) = tags.into_iter().map(Into::into).collect();
    }

    pub fn push_tag(&self, tag: impl Into<String>) {
        lock(&self.tags).push(tag.into());
    }

    /// Make `list_tags` fail with `SourceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    /// Make `list_tags` fail with a hard `Source` error.
    pub fn set_broken(&self, reason: Option<&str>) {
        *lock(&self.broken) = reason.map(str::to_string);
    }

    /// Make materializing `tag` fail.
    pub fn fail_materialize(&self, tag: impl Into<String>) {
        lock(&self.failing).insert(tag.into());
    }

    /// Make materializing `tag` take at least `delay`.
    pub fn delay_materialize(&self, tag: impl Into<String>, delay: Duration) {
        lock(&self.delays).insert(tag.into(), delay);
    }

    /// Tags materialized so far, in call order.
    pub fn materialized(&self) -> Vec<String> {
        lock(&self.materialized).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl VersionSource for MockSource {
    async fn list_tags(&self) -> Result<Vec<String>> {
        if *lock(&self.unavailable) {
            return Err(ControllerError::SourceUnavailable("mock source offline".into()));
        }
        if let Some(reason) = lock(&self.broken).clone() {
            return Err(ControllerError::Source(reason));
        }
        Ok(lock(&self.tags).clone())
    }

    async fn materialize(&self, tag: &str, dest: &Path) -> Result<()> {
        let delay = lock(&self.delays).get(tag).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failing).contains(tag) {
            return Err(ControllerError::MaterializationFailed {
                tag: tag.to_string(),
                reason: "mock materialization failure".into(),
            });
        }
        tokio::fs::create_dir_all(dest).await?;
        lock(&self.materialized).push(tag.to_string());
        debug!(tag, dest = %dest.display(), "[MOCK] Materialized version");
        Ok(())
    }
}
