//! Snap revisions from the snapd REST API inside an environment

use crate::executor::{Environment, ExecOptions, SnapRevisionQuery};
use crate::pipeline::EnvironmentError;
use serde::Deserialize;

/// Socket snapd listens on
pub const SNAPD_SOCKET: &str = "/run/snapd.socket";

#[derive(Debug, Deserialize)]
struct SnapResponse {
    #[serde(rename = "status-code")]
    status_code: Option<u16>,
    result: Option<SnapResult>,
}

#[derive(Debug, Deserialize)]
struct SnapResult {
    revision: Option<serde_json::Value>,
}

/// Asks snapd through `curl` in the environment
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapdRevisionQuery;

impl SnapdRevisionQuery {
    /// The `curl` invocation for `snap`
    #[must_use]
    pub fn query_argv(snap: &str) -> Vec<String> {
        vec![
            "curl".to_string(),
            "--silent".to_string(),
            "--unix-socket".to_string(),
            SNAPD_SOCKET.to_string(),
            format!("http://localhost/v2/snaps/{snap}"),
        ]
    }
}

/// Extracts the revision from a snapd answer; `None` when snapd does not know the snap
#[must_use]
pub fn parse_revision(body: &str) -> Option<String> {
    let response: SnapResponse = serde_json::from_str(body).ok()?;
    if response.status_code.is_some_and(|code| code != 200) {
        return None;
    }
    match response.result?.revision? {
        serde_json::Value::String(revision) => Some(revision),
        serde_json::Value::Number(revision) => Some(revision.to_string()),
        _ => None,
    }
}

impl SnapRevisionQuery for SnapdRevisionQuery {
    fn revision(
        &self,
        environment: &dyn Environment,
        snap: &str,
    ) -> Result<Option<String>, EnvironmentError> {
        let output = environment.execute(
            &Self::query_argv(snap),
            &ExecOptions::in_dir("/").captured(),
        )?;
        if !output.success() {
            tracing::debug!(snap, code = output.exit_code, "snapd is not reachable");
            return Ok(None);
        }
        Ok(parse_revision(&output.stdout))
    }
}
