//! Publishing CI builds of a commit to an archive
//!
//! Independent of pipeline execution: finds the completed builds of a
//! commit, keeps the latest one per architecture and uploads it.

pub mod git;
pub mod launchpad;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

pub use launchpad::{LaunchpadArchive, LaunchpadCredentials, LaunchpadInstance};

/// Build state of a build that can be released
pub const SUCCESSFULLY_BUILT: &str = "Successfully built";

static COMMIT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{40}$").expect("commit id pattern is valid"));

/// Errors raised while selecting or releasing builds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    /// No `--repository` and no remote-tracking branch
    #[error(
        "No --repository option was given, and the current branch does not track a remote branch."
    )]
    NoRemoteBranch,

    /// No `--repository` and the remote is not hosted on the archive's git service
    #[error(
        "No --repository option was given, and the current branch does not track a remote branch on {host}."
    )]
    ForeignRemote {
        /// Expected git host.
        host: String,
    },

    /// No `--commit` and a detached HEAD
    #[error("No --commit option was given, and there is no current branch.")]
    NoCurrentBranch,

    /// The repository is unknown to the archive
    #[error("Repository {0} does not exist on Launchpad.")]
    RepositoryNotFound(String),

    /// The reference does not name a branch or tag
    #[error("{repository} has no branch or tag named {reference}.")]
    RefNotFound {
        /// Repository path.
        repository: String,
        /// Branch or tag name.
        reference: String,
    },

    /// Nothing qualifies for release
    #[error("{repository}:{commit} has no completed CI builds with attached files.")]
    NoBuilds {
        /// Repository path.
        repository: String,
        /// Resolved commit id.
        commit: String,
    },

    /// Talking to the archive failed
    #[error("Launchpad API error: {0}")]
    Api(String),

    /// Running git failed
    #[error("git failed: {0}")]
    Git(String),
}

/// A CI build as reported by the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiBuild {
    /// Archive-side identifier of the build
    pub link: String,
    /// Architecture it was built for
    pub arch_tag: String,
    /// Build state, e.g. "Successfully built"
    pub state: String,
    /// When the build finished
    pub date_built: Option<DateTime<Utc>>,
    /// Whether binary artifacts are attached
    pub has_binaries: bool,
}

impl CiBuild {
    /// Whether this build can be released
    #[must_use]
    pub fn is_releasable(&self) -> bool {
        self.state == SUCCESSFULLY_BUILT && self.has_binaries
    }
}

/// Where a build is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTarget {
    /// Archive reference, e.g. `ppa:owner/ubuntu/name`
    pub archive: String,
    /// Target suite
    pub suite: String,
    /// Target channel
    pub channel: String,
}

/// A store of repositories, CI builds and archives
#[allow(clippy::missing_errors_doc)]
pub trait BuildArchive {
    /// Archive-side identifier of the repository at `path`, if it exists
    fn find_repository(&self, path: &str) -> Result<Option<String>, ReleaseError>;

    /// Commit id of a branch or tag, if it exists
    fn resolve_ref(&self, repository: &str, reference: &str)
    -> Result<Option<String>, ReleaseError>;

    /// Every CI build reported for `commit`
    fn ci_builds(&self, repository: &str, commit: &str) -> Result<Vec<CiBuild>, ReleaseError>;

    /// Publishes `build` to `target`
    fn upload_build(&self, build: &CiBuild, target: &ReleaseTarget) -> Result<(), ReleaseError>;
}

/// One release invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    /// Repository path
    pub repository: String,
    /// Branch, tag or 40-hex commit id
    pub commit: String,
    /// Only release this architecture
    pub architecture: Option<String>,
    /// Where to publish
    pub target: ReleaseTarget,
    /// Only report what would be released
    pub dry_run: bool,
}

/// Qualifying builds grouped by architecture, with the resolved commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSelection {
    /// Commit id the builds belong to
    pub commit: String,
    /// Builds per architecture, in report order
    pub by_architecture: BTreeMap<String, Vec<CiBuild>>,
}

/// Picks and publishes builds
pub struct ReleaseSelector<'a> {
    archive: &'a dyn BuildArchive,
}

impl<'a> ReleaseSelector<'a> {
    /// Creates a selector over `archive`
    #[must_use]
    pub fn new(archive: &'a dyn BuildArchive) -> Self {
        Self { archive }
    }

    /// Finds every releasable build of the requested commit
    pub fn find_builds(&self, request: &ReleaseRequest) -> Result<BuildSelection, ReleaseError> {
        let repository = self
            .archive
            .find_repository(&request.repository)?
            .ok_or_else(|| ReleaseError::RepositoryNotFound(request.repository.clone()))?;

        let commit = if COMMIT_ID.is_match(&request.commit) {
            request.commit.clone()
        } else {
            self.archive
                .resolve_ref(&repository, &request.commit)?
                .ok_or_else(|| ReleaseError::RefNotFound {
                    repository: request.repository.clone(),
                    reference: request.commit.clone(),
                })?
        };

        let mut by_architecture: BTreeMap<String, Vec<CiBuild>> = BTreeMap::new();
        for build in self.archive.ci_builds(&repository, &commit)? {
            let wanted = request
                .architecture
                .as_ref()
                .is_none_or(|arch| *arch == build.arch_tag);
            if wanted && build.is_releasable() {
                by_architecture
                    .entry(build.arch_tag.clone())
                    .or_default()
                    .push(build);
            }
        }
        if by_architecture.is_empty() {
            return Err(ReleaseError::NoBuilds {
                repository: request.repository.clone(),
                commit,
            });
        }
        Ok(BuildSelection {
            commit,
            by_architecture,
        })
    }

    /// Releases the latest build of each architecture; returns the messages shown
    pub fn release(&self, request: &ReleaseRequest) -> Result<Vec<String>, ReleaseError> {
        let selection = self.find_builds(request)?;
        let mut messages = Vec::new();
        for (arch_tag, builds) in &selection.by_architecture {
            let Some(latest) = builds.iter().max_by_key(|build| build.date_built) else {
                continue;
            };
            let description = format!(
                "{arch_tag} build of {}:{} to {} {} {}",
                request.repository,
                selection.commit,
                request.target.archive,
                request.target.suite,
                request.target.channel
            );
            let message = if request.dry_run {
                format!("Would release {description}.")
            } else {
                self.archive.upload_build(latest, &request.target)?;
                format!("Released {description}.")
            };
            info!(build = %latest.link, "{message}");
            messages.push(message);
        }
        Ok(messages)
    }
}
