//! Building the commands run inside an environment
//!
//! A job's `run-before`, `run` and `run-after` scripts are joined into one
//! `bash --noprofile --norc -ec` invocation so the first failing line stops
//! the job. Jobs with `root: false` run through `runuser`.

use crate::pipeline::ConfigError;
use std::collections::BTreeMap;

/// Shell used for job scripts
pub const SHELL: &str = "bash";

/// Joins the scripts that are set, in order
#[must_use]
pub fn join_scripts(
    run_before: Option<&str>,
    run: Option<&str>,
    run_after: Option<&str>,
) -> Option<String> {
    let parts: Vec<&str> = [run_before, run, run_after].into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// The argv running `script`, as `user` when given
#[must_use]
pub fn script_argv(script: &str, user: Option<&str>) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(user) = user {
        argv.extend(["runuser", "-u", user, "--"].map(String::from));
    }
    argv.extend([SHELL, "--noprofile", "--norc", "-ec", script].map(String::from));
    argv
}

/// Environment passed to a job's script
///
/// Job variables first, then `--set-env` pairs on top. Nothing from the host
/// is inherited.
#[must_use]
pub fn job_environment(
    job: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = job.clone();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Splits `KEY=VALUE` on the first `=`
pub fn parse_key_value(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::Invalid(format!(
            "'{raw}' is not a valid KEY=VALUE pair"
        ))),
    }
}

/// Renders an argv for logs
#[must_use]
pub fn render_command(argv: &[String]) -> String {
    shell_words::join(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_join_scripts() {
        assert_eq!(join_scripts(None, None, None), None);
        assert_eq!(
            join_scripts(Some("a"), Some("b"), Some("c")).as_deref(),
            Some("a\nb\nc")
        );
        assert_eq!(join_scripts(None, Some("tox"), None).as_deref(), Some("tox"));
    }

    #[test]
    fn test_script_argv_as_root() {
        assert_eq!(
            script_argv("tox", None),
            vec!["bash", "--noprofile", "--norc", "-ec", "tox"]
        );
    }

    #[test]
    fn test_script_argv_unprivileged() {
        assert_eq!(
            script_argv("whoami", Some("_stagecraft")),
            vec![
                "runuser",
                "-u",
                "_stagecraft",
                "--",
                "bash",
                "--noprofile",
                "--norc",
                "-ec",
                "whoami"
            ]
        );
    }

    #[test]
    fn test_set_env_overrides_job_environment() {
        let job = BTreeMap::from([
            ("A".to_string(), "job".to_string()),
            ("B".to_string(), "job".to_string()),
        ]);
        let overrides = BTreeMap::from([("A".to_string(), "cli".to_string())]);
        let env = job_environment(&job, &overrides);
        assert_eq!(env["A"], "cli");
        assert_eq!(env["B"], "job");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_parse_key_value_splits_on_first_equals() {
        assert_eq!(
            parse_key_value("URL=http://x?a=b").unwrap(),
            ("URL".to_string(), "http://x?a=b".to_string())
        );
        assert_eq!(
            parse_key_value("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_key_value("NOVALUE").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_render_command_quotes() {
        let argv = vec!["bash".to_string(), "-ec".to_string(), "echo hi".to_string()];
        assert_eq!(render_command(&argv), "bash -ec 'echo hi'");
    }
}
