//! `stagecraft completions` - Generate shell completions
//!
//! Supports bash, zsh, fish and PowerShell.

use anyhow::{Context, Result};
use clap_complete::Shell;
use std::fs;
use std::path::{Path, PathBuf};

pub fn generate_completions(shell: Shell) -> Result<String> {
    use clap_complete::generate;

    let mut cmd = super::build_cli();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, "stagecraft", &mut buf);

    String::from_utf8(buf).context("Failed to generate completions")
}

pub fn save_completions(completions: &str, output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(output_path, completions)
        .with_context(|| format!("Failed to write completions to: {}", output_path.display()))?;
    Ok(())
}

/// Where `shell` looks for user completions under `home`
pub fn completions_path(shell: Shell, home: &Path) -> Result<PathBuf> {
    Ok(match shell {
        Shell::Bash => home.join(".bash_completion.d").join("stagecraft"),
        Shell::Zsh => home.join(".zsh").join("completion").join("_stagecraft"),
        Shell::Fish => home
            .join(".config")
            .join("fish")
            .join("completions")
            .join("stagecraft.fish"),
        Shell::PowerShell => home
            .join("Documents")
            .join("PowerShell")
            .join("stagecraft.ps1"),
        _ => anyhow::bail!("Unsupported shell: {shell:?}"),
    })
}

pub fn get_default_completions_path(shell: Shell) -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME environment variable not set")?;
    completions_path(shell, Path::new(&home))
}
