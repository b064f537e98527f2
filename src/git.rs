//! Local git plumbing used by the upload pipeline
//!
//! The orchestrator only talks to the [`GitSource`] trait. [`GitCli`] is the
//! production implementation and shells out to the `git` binary the same way
//! a user would.

mod packfiles;

use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result};

pub use packfiles::{PackfileBundle, PACK_EXTENSION};

/// Upper bound on commits sent to `/search_commits`
pub const MAX_LATEST_COMMITS: usize = 1000;
/// Only history younger than this is considered for upload
pub const HISTORY_WINDOW: &str = "1 month ago";
/// Split packfiles larger than this
pub const MAX_PACK_SIZE: &str = "3m";

/// Git operations needed for one upload run.
///
/// Every method takes the working directory explicitly; `None` means the
/// process's current directory.
pub trait GitSource: Send + Sync {
    /// URL of the `origin` remote
    fn remote_url(&self, cwd: Option<&Path>) -> Result<String>;

    /// Recent commit SHAs, most recent first
    fn latest_commits(&self, cwd: Option<&Path>) -> Result<Vec<String>>;

    /// SHA of `HEAD`
    fn head_sha(&self, cwd: Option<&Path>) -> Result<String>;

    /// Objects reachable from `HEAD` but not from any of `excluded`
    fn revisions_excluding(&self, excluded: &[String], cwd: Option<&Path>)
        -> Result<Vec<String>>;

    /// Pack exactly `revisions` into one or more packfiles
    fn build_packfiles(&self, revisions: &[String], cwd: Option<&Path>)
        -> Result<PackfileBundle>;
}

/// [`GitSource`] backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run git with `args`, optionally feeding `input` on stdin, and return
    /// trimmed stdout
    fn run(&self, cwd: Option<&Path>, args: &[&str], input: Option<&[u8]>) -> Result<String> {
        let mut child = self
            .command(cwd)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn git {}", args.join(" ")))?;

        if let Some(input) = input {
            let mut stdin = child
                .stdin
                .take()
                .context("Failed to open stdin for git")?;
            stdin
                .write_all(input)
                .with_context(|| format!("Failed to write stdin of git {}", args.join(" ")))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn pack_objects(&self, bundle: &PackfileBundle, input: &[u8], cwd: Option<&Path>) -> Result<()> {
        let prefix = bundle.prefix().to_string_lossy().into_owned();
        let max_pack_size = format!("--max-pack-size={}", MAX_PACK_SIZE);
        self.run(
            cwd,
            &[
                "pack-objects",
                "--compression=9",
                max_pack_size.as_str(),
                prefix.as_str(),
            ],
            Some(input),
        )?;
        Ok(())
    }
}

fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl GitSource for GitCli {
    fn remote_url(&self, cwd: Option<&Path>) -> Result<String> {
        self.run(cwd, &["config", "--get", "remote.origin.url"], None)
    }

    fn latest_commits(&self, cwd: Option<&Path>) -> Result<Vec<String>> {
        let limit = MAX_LATEST_COMMITS.to_string();
        let since = format!("--since={}", HISTORY_WINDOW);
        let output = self.run(cwd, &["log", "--format=%H", "-n", limit.as_str(), since.as_str()], None)?;
        Ok(lines(&output))
    }

    fn head_sha(&self, cwd: Option<&Path>) -> Result<String> {
        self.run(cwd, &["rev-parse", "HEAD"], None)
    }

    fn revisions_excluding(
        &self,
        excluded: &[String],
        cwd: Option<&Path>,
    ) -> Result<Vec<String>> {
        let since = format!("--since={}", HISTORY_WINDOW);
        let exclusions: Vec<String> = excluded.iter().map(|sha| format!("^{}", sha)).collect();

        let mut args = vec![
            "rev-list",
            "--objects",
            "--filter=blob:none",
            since.as_str(),
            "--no-object-names",
            "HEAD",
        ];
        args.extend(exclusions.iter().map(String::as_str));

        let output = self.run(cwd, &args, None)?;
        Ok(lines(&output))
    }

    fn build_packfiles(
        &self,
        revisions: &[String],
        cwd: Option<&Path>,
    ) -> Result<PackfileBundle> {
        let mut input = revisions.join("\n").into_bytes();
        input.push(b'\n');

        let bundle = PackfileBundle::create().context("Failed to create packfile directory")?;
        match self.pack_objects(&bundle, &input, cwd) {
            Ok(()) => Ok(bundle),
            Err(e) => {
                // The system temp dir can be unusable for git (e.g. a
                // different filesystem); retry next to the repository
                let fallback = match cwd {
                    Some(dir) => dir.to_path_buf(),
                    None => std::env::current_dir()
                        .context("Failed to resolve working directory")?,
                };
                tracing::debug!(
                    "git pack-objects failed in temp dir ({}), retrying in {:?}",
                    e,
                    fallback
                );
                let bundle = PackfileBundle::create_in(&fallback)
                    .context("Failed to create packfile directory in working directory")?;
                self.pack_objects(&bundle, &input, cwd)?;
                Ok(bundle)
            }
        }
    }
}
