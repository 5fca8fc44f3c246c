//! `stagecraft release` - Publish a CI build to an archive

use anyhow::Result;
use stagecraft::release::git::{default_commit, default_repository};
use stagecraft::release::{
    LaunchpadArchive, LaunchpadCredentials, LaunchpadInstance, ReleaseError, ReleaseRequest,
    ReleaseSelector, ReleaseTarget,
};
use std::path::{Path, PathBuf};

/// Options of `release`
#[derive(clap::Args, Debug, Clone)]
pub struct ReleaseArgs {
    /// Launchpad instance: production, staging or qastaging
    #[arg(short = 'l', long = "launchpad", default_value = "production")]
    pub launchpad: LaunchpadInstance,

    /// Git repository path (default: the remote of the current branch)
    #[arg(long)]
    pub repository: Option<String>,

    /// Branch, tag or commit id (default: the current branch)
    #[arg(long)]
    pub commit: Option<String>,

    /// Only release builds for this architecture
    #[arg(short = 'a', long)]
    pub architecture: Option<String>,

    /// Only report what would be released
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Checkout used for the defaults
    #[arg(short = 'C', long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Target archive, e.g. ppa:OWNER/DISTRIBUTION/NAME
    pub archive: String,

    /// Target suite
    pub suite: String,

    /// Target channel
    pub channel: String,
}

/// Turns the arguments into a request, filling defaults from git
pub fn build_request(args: &ReleaseArgs, checkout: &Path) -> Result<ReleaseRequest, ReleaseError> {
    let repository = match &args.repository {
        Some(repository) => repository.clone(),
        None => default_repository(checkout)?,
    };
    let commit = match &args.commit {
        Some(commit) => commit.clone(),
        None => default_commit(checkout)?,
    };
    Ok(ReleaseRequest {
        repository: repository.trim_start_matches('/').to_string(),
        commit,
        architecture: args.architecture.clone(),
        target: ReleaseTarget {
            archive: args.archive.clone(),
            suite: args.suite.clone(),
            channel: args.channel.clone(),
        },
        dry_run: args.dry_run,
    })
}

fn try_release(args: &ReleaseArgs) -> Result<Vec<String>, ReleaseError> {
    let request = build_request(args, &args.project_dir)?;
    let archive = LaunchpadArchive::new(args.launchpad, LaunchpadCredentials::from_env())?;
    ReleaseSelector::new(&archive).release(&request)
}

/// Runs the release; returns the exit code
pub fn release(args: &ReleaseArgs) -> Result<i32> {
    match try_release(args) {
        Ok(messages) => {
            for message in messages {
                println!("{message}");
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(1)
        }
    }
}
