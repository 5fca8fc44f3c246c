//! stagecraft - run CI pipelines in containers
//!
//! ## Commands
//!
//! - `stagecraft run` - Run every stage of `.stagecraft.yaml`
//! - `stagecraft run-one JOB INDEX` - Run one matrix entry of a job
//! - `stagecraft clean` - Delete the project's environments
//! - `stagecraft release ARCHIVE SUITE CHANNEL` - Publish a CI build
//! - `stagecraft completions SHELL` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the pipeline, collecting outputs
//! stagecraft run --output-directory out
//!
//! # Re-run the second matrix entry of the "test" job
//! stagecraft run-one test 1
//!
//! # See what would be released
//! stagecraft release --dry-run ppa:owner/ubuntu/name focal edge
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e}");
            if std::env::var("STAGECRAFT_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
