//! Containment checks for user-supplied paths
//!
//! Paths are resolved the way the kernel would walk them: symlinks are
//! followed component by component (dangling ones included, using their
//! target text), `..` pops the resolved prefix, and components that do not
//! exist yet are taken literally.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const MAX_SYMLINK_HOPS: usize = 40;

/// A path resolved outside the directory it must stay in
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{}' is not in the subpath of '{}'.", .path.display(), .base.display())]
pub struct PathEscapeError {
    /// The fully resolved offending path
    pub path: PathBuf,
    /// The resolved base it escaped from
    pub base: PathBuf,
}

/// Resolves `candidate` against `base` and checks it stays inside `base`
///
/// Returns the resolved absolute path. An absolute `candidate` is resolved on
/// its own and still has to land inside `base`.
pub fn resolve_within(base: &Path, candidate: &Path) -> Result<PathBuf, PathEscapeError> {
    let base = resolve(&absolute(base));
    let resolved = resolve(&base.join(candidate));
    if resolved.starts_with(&base) {
        Ok(resolved)
    } else {
        Err(PathEscapeError {
            path: resolved,
            base,
        })
    }
}

/// Resolves every symlink in `path`
#[must_use]
pub fn resolve(path: &Path) -> PathBuf {
    let mut pending: VecDeque<OsString> = VecDeque::new();
    let mut resolved = PathBuf::new();
    push_components(&mut pending, &mut resolved, path);

    let mut hops = 0;
    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let next = resolved.join(&part);
        let link = std::fs::symlink_metadata(&next)
            .ok()
            .filter(|meta| meta.file_type().is_symlink())
            .and_then(|_| std::fs::read_link(&next).ok());
        match link {
            Some(target) if hops < MAX_SYMLINK_HOPS => {
                hops += 1;
                let mut spliced: VecDeque<OsString> = VecDeque::new();
                push_components(&mut spliced, &mut resolved, &target);
                spliced.extend(pending.drain(..));
                pending = spliced;
            }
            _ => resolved = next,
        }
    }
    resolved
}

/// Queues the components of `path`, resetting `resolved` for absolute paths
fn push_components(queue: &mut VecDeque<OsString>, resolved: &mut PathBuf, path: &Path) {
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => *resolved = PathBuf::from(prefix.as_os_str()),
            Component::RootDir => {
                if resolved.as_os_str().is_empty() || !resolved.has_root() {
                    resolved.push(Component::RootDir);
                } else {
                    *resolved = PathBuf::from(Component::RootDir.as_os_str());
                }
            }
            Component::CurDir => {}
            Component::ParentDir => queue.push_back(OsString::from("..")),
            Component::Normal(name) => queue.push_back(name.to_os_string()),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
