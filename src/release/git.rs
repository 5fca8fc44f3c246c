//! Reading the current branch and its remote from a git checkout

use super::ReleaseError;
use std::path::Path;
use std::process::Command;
use url::Url;

/// Host the release repositories live on
pub const LAUNCHPAD_GIT_HOST: &str = "git.launchpad.net";

fn git(dir: &Path, args: &[&str]) -> Result<Option<String>, ReleaseError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|err| ReleaseError::Git(err.to_string()))?;
    if !output.status.success() {
        return Ok(None);
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!value.is_empty()).then_some(value))
}

/// Name of the checked-out branch; `None` on a detached HEAD
pub fn current_branch(dir: &Path) -> Result<Option<String>, ReleaseError> {
    git(dir, &["branch", "--show-current"])
}

/// URL of the remote the current branch tracks
pub fn current_remote_url(dir: &Path) -> Result<Option<String>, ReleaseError> {
    let Some(branch) = current_branch(dir)? else {
        return Ok(None);
    };
    let Some(remote) = git(dir, &["config", &format!("branch.{branch}.remote")])? else {
        return Ok(None);
    };
    git(dir, &["remote", "get-url", &remote])
}

/// Repository path of a `git.launchpad.net` URL
///
/// ```
/// use stagecraft::release::git::launchpad_repository_path;
///
/// assert_eq!(
///     launchpad_repository_path("git+ssh://user@git.launchpad.net/example").as_deref(),
///     Some("example")
/// );
/// ```
#[must_use]
pub fn launchpad_repository_path(remote_url: &str) -> Option<String> {
    let url = Url::parse(remote_url).ok()?;
    if url.host_str() != Some(LAUNCHPAD_GIT_HOST) {
        return None;
    }
    let path = url.path().trim_start_matches('/').trim_end_matches('/');
    (!path.is_empty()).then(|| path.to_string())
}

/// Repository to release from when `--repository` is absent
pub fn default_repository(dir: &Path) -> Result<String, ReleaseError> {
    let remote = current_remote_url(dir)?.ok_or(ReleaseError::NoRemoteBranch)?;
    launchpad_repository_path(&remote).ok_or_else(|| ReleaseError::ForeignRemote {
        host: LAUNCHPAD_GIT_HOST.to_string(),
    })
}

/// Commit to release when `--commit` is absent
pub fn default_commit(dir: &Path) -> Result<String, ReleaseError> {
    current_branch(dir)?.ok_or(ReleaseError::NoCurrentBranch)
}
