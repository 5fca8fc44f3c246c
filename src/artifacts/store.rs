//! On-disk artifact records
//!
//! Layout: `<output>/<job>/<index>/files/...` plus `<output>/<job>/<index>/properties`.

use crate::artifacts::path_guard::{PathEscapeError, resolve, resolve_within};
use crate::artifacts::properties;
use crate::executor::{Environment, ExecOptions};
use crate::pipeline::{
    ArtifactError, EnvironmentError, JobInstance, License, OutputSpec, RunError,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the directory holding collected files
pub const FILES_DIR: &str = "files";
/// Name of the properties file
pub const PROPERTIES_FILE: &str = "properties";

const RESOLVE_CHUNK: usize = 256;

/// The recorded output of one job instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Name of the job
    pub job_name: String,
    /// Matrix index of the job
    pub index: usize,
    /// `<output>/<job>/<index>`
    pub path: PathBuf,
}

impl ArtifactRecord {
    /// Directory of collected files
    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.path.join(FILES_DIR)
    }

    /// Path of the properties file
    #[must_use]
    pub fn properties_path(&self) -> PathBuf {
        self.path.join(PROPERTIES_FILE)
    }

    /// Reads the properties document back
    pub fn read_properties(&self) -> Result<serde_json::Value, ArtifactError> {
        let path = self.properties_path();
        let invalid = |reason: String| ArtifactError::Properties {
            path: path.clone(),
            reason,
        };
        let text = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))
    }
}

/// Where an output match was found, and where it goes in the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMatch {
    /// Path relative to the base the pattern was evaluated against
    pub relative: PathBuf,
    /// Whether the pattern was evaluated against the project's parent
    pub from_parent: bool,
    /// Fully resolved location inside the environment
    pub source: PathBuf,
}

/// The artifact records of one output directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `output_dir`
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Root of the store
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Record location of a job instance
    #[must_use]
    pub fn record_for(&self, job_name: &str, index: usize) -> ArtifactRecord {
        ArtifactRecord {
            job_name: job_name.to_string(),
            index,
            path: self.output_dir.join(job_name).join(index.to_string()),
        }
    }

    /// Collects the instance's outputs into its record
    ///
    /// Patterns are evaluated inside `environment`, which sees the project at
    /// `managed_project`. The properties file is written whenever the job
    /// declares `output` or the pipeline declares a license.
    pub fn record_output(
        &self,
        environment: &dyn Environment,
        managed_project: &Path,
        instance: &JobInstance,
        output: Option<&OutputSpec>,
        license: Option<&License>,
    ) -> Result<Option<ArtifactRecord>, RunError> {
        if output.is_none() && license.is_none() {
            return Ok(None);
        }
        let record = self.record_for(instance.name(), instance.index());
        fs::create_dir_all(&record.path)?;

        let mut values = BTreeMap::new();
        if let Some(output) = output {
            let matches = collect_matches(environment, managed_project, &output.paths)?;
            let files_dir = record.files_dir();
            for found in &matches {
                let destination = files_dir.join(&found.relative);
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                environment.pull_file(&found.source, &destination)?;
            }
            debug!(job = %instance.name(), files = matches.len(), "Collected output files");

            values = output.properties.clone();
            if let Some(dynamic) = &output.dynamic_properties {
                let text = read_dynamic_properties(environment, managed_project, dynamic)?;
                properties::merge_dynamic(&mut values, &text);
            }
        }

        let document = properties::to_document(&values, license);
        fs::write(
            record.properties_path(),
            serde_json::to_string(&document).map_err(|e| ArtifactError::Properties {
                path: record.properties_path(),
                reason: e.to_string(),
            })?,
        )?;
        info!(job = %instance.name(), record = %record.path.display(), "Recorded output");
        Ok(Some(record))
    }

    /// Finds the single record produced by `job_name`
    pub fn find_input(&self, job_name: &str) -> Result<ArtifactRecord, ArtifactError> {
        let job_dir = self.output_dir.join(job_name);
        let mut candidates: Vec<(usize, PathBuf)> = fs::read_dir(&job_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.path().is_dir())
                    .filter_map(|e| {
                        let index = e.file_name().to_str()?.parse::<usize>().ok()?;
                        Some((index, e.path()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort();

        match candidates.len() {
            0 => Err(ArtifactError::InputMissing {
                job: job_name.to_string(),
            }),
            1 => {
                let (index, path) = candidates.remove(0);
                Ok(ArtifactRecord {
                    job_name: job_name.to_string(),
                    index,
                    path,
                })
            }
            _ => Err(ArtifactError::InputAmbiguous {
                job: job_name.to_string(),
                paths: candidates.into_iter().map(|(_, path)| path).collect(),
            }),
        }
    }

    /// Pushes a record's files and properties into `target` inside the project
    pub fn import(
        &self,
        environment: &dyn Environment,
        project: &Path,
        managed_project: &Path,
        record: &ArtifactRecord,
        target: &Path,
    ) -> Result<(), RunError> {
        let resolved = resolve_within(project, target)?;
        let relative = resolved
            .strip_prefix(resolve(project))
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let destination = managed_project.join(relative);

        let files_dir = record.files_dir();
        for file in walk_files(&files_dir)? {
            let relative = file.strip_prefix(&files_dir).unwrap_or(&file);
            environment.push_file(&file, &destination.join(FILES_DIR).join(relative))?;
        }
        let properties = record.properties_path();
        if properties.is_file() {
            environment.push_file(&properties, &destination.join(PROPERTIES_FILE))?;
        }
        info!(
            job = %record.job_name,
            target = %target.display(),
            "Imported input artifacts"
        );
        Ok(())
    }
}

/// Evaluates output patterns inside the environment
///
/// Patterns starting with `../` are evaluated against the parent of
/// `managed_project`. Every pattern must match; matched directories
/// contribute all the files beneath them. Results are deduplicated in
/// first-seen order, and every result must resolve inside its base.
pub fn collect_matches(
    environment: &dyn Environment,
    managed_project: &Path,
    patterns: &[String],
) -> Result<Vec<OutputMatch>, RunError> {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let mut listings: HashMap<bool, Vec<(PathBuf, bool)>> = HashMap::new();
    let mut selected: Vec<(bool, PathBuf)> = Vec::new();
    let mut seen = HashSet::new();
    for pattern in patterns {
        let (from_parent, relative_pattern) = match pattern.strip_prefix("../") {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        let relative_pattern = relative_pattern.trim_start_matches("./");
        let compiled =
            glob::Pattern::new(relative_pattern).map_err(|e| ArtifactError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        let entries = match listings.entry(from_parent) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let base = pattern_base(managed_project, from_parent);
                entry.insert(list_entries(environment, base)?)
            }
        };

        let mut matched_any = false;
        for (relative, is_dir) in entries.iter() {
            let hit = relative
                .ancestors()
                .filter(|ancestor| !ancestor.as_os_str().is_empty())
                .any(|ancestor| compiled.matches_path_with(ancestor, options));
            if !hit {
                continue;
            }
            matched_any = true;
            if !is_dir && seen.insert((from_parent, relative.clone())) {
                selected.push((from_parent, relative.clone()));
            }
        }
        if !matched_any {
            return Err(ArtifactError::NoMatches {
                pattern: pattern.clone(),
            }
            .into());
        }
    }

    let mut sources: Vec<Option<PathBuf>> = vec![None; selected.len()];
    for from_parent in [false, true] {
        let (positions, relatives): (Vec<usize>, Vec<&Path>) = selected
            .iter()
            .enumerate()
            .filter(|(_, (parent, _))| *parent == from_parent)
            .map(|(position, (_, relative))| (position, relative.as_path()))
            .unzip();
        if relatives.is_empty() {
            continue;
        }
        let base = pattern_base(managed_project, from_parent);
        let resolved = resolve_in_environment(environment, base, &relatives)?;
        for (position, source) in positions.into_iter().zip(resolved) {
            sources[position] = Some(source);
        }
    }
    Ok(selected
        .into_iter()
        .zip(sources)
        .map(|((from_parent, relative), source)| OutputMatch {
            source: source.unwrap_or_else(|| {
                pattern_base(managed_project, from_parent).join(&relative)
            }),
            relative,
            from_parent,
        })
        .collect())
}

fn pattern_base(managed_project: &Path, from_parent: bool) -> &Path {
    if from_parent {
        managed_project.parent().unwrap_or(managed_project)
    } else {
        managed_project
    }
}

/// Every entry below `base` inside the environment, relative and sorted
///
/// Symlinks are listed as they are, never followed.
fn list_entries(
    environment: &dyn Environment,
    base: &Path,
) -> Result<Vec<(PathBuf, bool)>, RunError> {
    let argv = [
        "find".to_string(),
        base.display().to_string(),
        "-mindepth".to_string(),
        "1".to_string(),
        "-printf".to_string(),
        "%y%P\\0".to_string(),
    ];
    let output = environment.execute(&argv, &ExecOptions::in_dir("/").captured())?;
    if !output.success() {
        return Err(EnvironmentError::Execute {
            name: environment.name().to_string(),
            reason: format!(
                "listing '{}' exited with status {}",
                base.display(),
                output.exit_code
            ),
        }
        .into());
    }
    let mut entries: Vec<(PathBuf, bool)> = output
        .stdout
        .split('\0')
        .filter_map(|line| {
            let mut chars = line.chars();
            let kind = chars.next()?;
            let relative = chars.as_str();
            (!relative.is_empty()).then(|| (PathBuf::from(relative), kind == 'd'))
        })
        .collect();
    entries.sort();
    Ok(entries)
}

/// Resolves `relatives` below `base` inside the environment
///
/// Symlinks are followed the way the environment's kernel would. Any result
/// outside the resolved `base` is a [`PathEscapeError`].
fn resolve_in_environment(
    environment: &dyn Environment,
    base: &Path,
    relatives: &[&Path],
) -> Result<Vec<PathBuf>, RunError> {
    let mut resolved_base = None;
    let mut resolved = Vec::with_capacity(relatives.len());
    for chunk in relatives.chunks(RESOLVE_CHUNK) {
        let mut argv: Vec<String> = ["readlink", "-m", "-z", "--"]
            .iter()
            .map(ToString::to_string)
            .collect();
        argv.push(base.display().to_string());
        argv.extend(chunk.iter().map(|relative| base.join(relative).display().to_string()));
        let output = environment.execute(&argv, &ExecOptions::in_dir("/").captured())?;
        let paths: Vec<PathBuf> = output
            .stdout
            .split('\0')
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect();
        if !output.success() || paths.len() != chunk.len() + 1 {
            return Err(EnvironmentError::Execute {
                name: environment.name().to_string(),
                reason: format!(
                    "resolving paths below '{}' exited with status {}",
                    base.display(),
                    output.exit_code
                ),
            }
            .into());
        }
        let mut paths = paths.into_iter();
        let chunk_base = paths.next().unwrap_or_default();
        let resolved_base = resolved_base.get_or_insert(chunk_base);
        for path in paths {
            if !path.starts_with(&*resolved_base) {
                return Err(PathEscapeError {
                    path,
                    base: resolved_base.clone(),
                }
                .into());
            }
            resolved.push(path);
        }
    }
    Ok(resolved)
}

fn read_dynamic_properties(
    environment: &dyn Environment,
    managed_project: &Path,
    path: &Path,
) -> Result<String, RunError> {
    let source = resolve_in_environment(environment, managed_project, &[path])?
        .pop()
        .unwrap_or_else(|| managed_project.join(path));
    let staging = tempfile::NamedTempFile::new()?;
    environment.pull_file(&source, staging.path())?;
    fs::read_to_string(staging.path()).map_err(|e| {
        ArtifactError::DynamicProperties {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Every file below `dir`, sorted
fn walk_files(dir: &Path) -> Result<Vec<PathBuf>, RunError> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();
    for entry in entries {
        let file_type = fs::symlink_metadata(&entry)?.file_type();
        if file_type.is_dir() {
            files.extend(walk_files(&entry)?);
        } else {
            files.push(entry);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{ISOLATED_PROJECT, LocalEnvironment};
    use crate::pipeline::matrix::{Job, instances};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn instance(name: &str, index: usize) -> JobInstance {
        let job = Job::from_fields(
            name,
            index,
            crate::pipeline::JobFields {
                series: Some("focal".to_string()),
                architectures: Some(vec!["amd64".to_string()]),
                run: Some("true".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        instances(&Arc::new(job)).remove(0)
    }

    fn output(paths: &[&str]) -> OutputSpec {
        OutputSpec {
            paths: paths.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_collect_matches_dedups_in_order() {
        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join("b.whl"), "b").unwrap();
        fs::write(project.path().join("a.whl"), "a").unwrap();
        fs::create_dir(project.path().join("dist")).unwrap();
        fs::write(project.path().join("dist/c.tar.gz"), "c").unwrap();

        let env = LocalEnvironment::new("test", project.path());
        let matches = collect_matches(
            &env,
            project.path(),
            &["b.whl".to_string(), "*.whl".to_string(), "dist".to_string()],
        )
        .unwrap();
        let relative: Vec<PathBuf> = matches.into_iter().map(|m| m.relative).collect();
        assert_eq!(
            relative,
            vec![
                PathBuf::from("b.whl"),
                PathBuf::from("a.whl"),
                PathBuf::from("dist/c.tar.gz"),
            ]
        );
    }

    #[test]
    fn test_unmatched_pattern_is_fatal() {
        let project = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new("test", project.path());
        let err = collect_matches(&env, project.path(), &["*.whl".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "*.whl has not matched any output files.");
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_parent_pattern_uses_parent_inside_environment() {
        let env = LocalEnvironment::isolated("test");
        env.write_file(Path::new("/build/test_1.0_all.deb"), "deb");
        env.write_file(Path::new("/build/project/README"), "");

        let matches =
            collect_matches(&env, Path::new(ISOLATED_PROJECT), &["../*.deb".to_string()])
                .unwrap();
        assert_eq!(
            matches,
            vec![OutputMatch {
                relative: PathBuf::from("test_1.0_all.deb"),
                from_parent: true,
                source: PathBuf::from("/build/test_1.0_all.deb"),
            }]
        );
    }

    #[test]
    fn test_parent_pattern_ignores_host_parent() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir(&project).unwrap();
        fs::write(dir.path().join("test_1.0_all.deb"), "").unwrap();
        let env = LocalEnvironment::new("test", &project);
        env.write_file(&dir.path().join("unrelated.txt"), "");

        let err = collect_matches(&env, &project, &["../*.deb".to_string()]).unwrap_err();
        assert_eq!(
            err,
            RunError::from(ArtifactError::NoMatches {
                pattern: "../*.deb".to_string()
            })
        );
    }

    #[test]
    fn test_record_output_pulls_parent_files_from_environment() {
        let output_dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::isolated("test");
        env.write_file(Path::new("/build/test_1.0_all.deb"), "deb");

        let store = ArtifactStore::new(output_dir.path());
        let record = store
            .record_output(
                &env,
                Path::new(ISOLATED_PROJECT),
                &instance("build", 0),
                Some(&output(&["../*.deb"])),
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            fs::read_to_string(record.files_dir().join("test_1.0_all.deb")).unwrap(),
            "deb"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("a/proj");
        fs::create_dir_all(&project).unwrap();
        std::os::unix::fs::symlink("../../target.txt", project.join("symlink.txt")).unwrap();

        let env = LocalEnvironment::new("test", &project);
        let err = collect_matches(&env, &project, &["*.txt".to_string()]).unwrap_err();
        assert!(matches!(err, RunError::PathEscape(_)));
        assert!(err.to_string().contains("/target.txt"));
    }

    #[test]
    fn test_record_output_with_dynamic_properties() {
        let project = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        fs::write(project.path().join("app.whl"), "wheel").unwrap();
        fs::write(
            project.path().join("dyn"),
            "version=0.2\nto-be-removed\nalready-missing\n",
        )
        .unwrap();

        let mut spec = output(&["*.whl"]);
        spec.properties = BTreeMap::from([
            ("version".to_string(), "0.1".to_string()),
            ("to-be-removed".to_string(), "x".to_string()),
        ]);
        spec.dynamic_properties = Some(PathBuf::from("dyn"));

        let store = ArtifactStore::new(output_dir.path());
        let env = LocalEnvironment::new("test", project.path());
        let record = store
            .record_output(&env, project.path(), &instance("build", 0), Some(&spec), None)
            .unwrap()
            .unwrap();

        assert_eq!(record.path, output_dir.path().join("build/0"));
        assert_eq!(
            fs::read_to_string(record.files_dir().join("app.whl")).unwrap(),
            "wheel"
        );
        assert_eq!(
            record.read_properties().unwrap(),
            serde_json::json!({"version": "0.2"})
        );
    }

    #[test]
    fn test_license_alone_writes_properties() {
        let project = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(output_dir.path());
        let env = LocalEnvironment::new("test", project.path());
        let license = License {
            spdx: Some("MIT".to_string()),
            path: None,
        };

        let record = store
            .record_output(&env, project.path(), &instance("lint", 0), None, Some(&license))
            .unwrap()
            .unwrap();
        assert_eq!(
            record.read_properties().unwrap(),
            serde_json::json!({"license": {"spdx": "MIT", "path": null}})
        );
    }

    #[test]
    fn test_nothing_declared_records_nothing() {
        let project = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(project.path().join("out"));
        let env = LocalEnvironment::new("test", project.path());
        let record = store
            .record_output(&env, project.path(), &instance("lint", 0), None, None)
            .unwrap();
        assert_eq!(record, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_dynamic_properties_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir(&project).unwrap();
        std::os::unix::fs::symlink("../target", project.join("properties")).unwrap();

        let mut spec = output(&[]);
        spec.dynamic_properties = Some(PathBuf::from("properties"));
        let store = ArtifactStore::new(dir.path().join("out"));
        let env = LocalEnvironment::new("test", &project);
        let err = store
            .record_output(&env, &project, &instance("build", 0), Some(&spec), None)
            .unwrap_err();
        assert!(matches!(err, RunError::PathEscape(_)));
    }

    #[test]
    fn test_find_input_missing_and_ambiguous() {
        let output_dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(output_dir.path());
        assert_eq!(
            store.find_input("build").unwrap_err(),
            ArtifactError::InputMissing {
                job: "build".to_string()
            }
        );

        fs::create_dir_all(output_dir.path().join("build/0")).unwrap();
        assert_eq!(store.find_input("build").unwrap().index, 0);

        fs::create_dir_all(output_dir.path().join("build/1")).unwrap();
        match store.find_input("build").unwrap_err() {
            ArtifactError::InputAmbiguous { paths, .. } => assert_eq!(
                paths,
                vec![
                    output_dir.path().join("build/0"),
                    output_dir.path().join("build/1"),
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_import_round_trip() {
        let project = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        fs::write(project.path().join("binary"), b"binary").unwrap();
        fs::create_dir(project.path().join("dist")).unwrap();
        fs::write(project.path().join("dist/empty"), b"").unwrap();

        let mut spec = output(&["binary", "dist/*"]);
        spec.properties = BTreeMap::from([("version".to_string(), "1.0".to_string())]);
        let store = ArtifactStore::new(output_dir.path());
        let env = LocalEnvironment::new("test", project.path());
        store
            .record_output(&env, project.path(), &instance("build", 0), Some(&spec), None)
            .unwrap();

        let record = store.find_input("build").unwrap();
        store
            .import(&env, project.path(), project.path(), &record, Path::new("artifacts"))
            .unwrap();

        let artifacts = project.path().join("artifacts");
        assert_eq!(fs::read(artifacts.join("files/binary")).unwrap(), b"binary");
        assert_eq!(fs::read(artifacts.join("files/dist/empty")).unwrap(), b"");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(
                &fs::read_to_string(artifacts.join("properties")).unwrap()
            )
            .unwrap(),
            serde_json::json!({"version": "1.0"})
        );
    }

    #[test]
    fn test_import_target_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir(&project).unwrap();
        let store = ArtifactStore::new(dir.path().join("out"));
        let record = store.record_for("build", 0);
        let env = LocalEnvironment::new("test", &project);

        let err = store
            .import(&env, &project, &project, &record, Path::new("../etc/secrets"))
            .unwrap_err();
        assert!(matches!(err, RunError::PathEscape(_)));
    }
}
