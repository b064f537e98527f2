//! One pass of the git metadata upload.
//!
//! Flow:
//! 1. Resolve the repository URL (tag override, else `origin`)
//! 2. Send the latest local commits to `/search_commits`
//! 3. Compute the objects the backend does not have
//! 4. Pack those objects into a temporary bundle
//! 5. POST each packfile to `/packfile`
//!
//! Empty intermediate results end the run early as [`RunOutcome::Aborted`].
//! Errors end it as [`RunOutcome::Failed`]; nothing propagates to the
//! caller, the next invocation starts over from scratch.

use std::{fmt, path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    codec,
    error::Error,
    executor::RequestExecutor,
    git::GitSource,
};

pub const SEARCH_COMMITS_ENDPOINT: &str = "/search_commits";
pub const PACKFILE_ENDPOINT: &str = "/packfile";
const PACKFILE_ACCEPTED: u16 = 204;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveRepo,
    SearchCommits,
    FilterRevisions,
    BuildPackfiles,
    UploadPackfiles,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolveRepo => "resolve-repo",
            Stage::SearchCommits => "search-commits",
            Stage::FilterRevisions => "filter-revisions",
            Stage::BuildPackfiles => "build-packfiles",
            Stage::UploadPackfiles => "upload-packfiles",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// No local commits, so nothing was sent
    NoLocalCommits,
    /// The backend already has every local revision
    NothingToUpload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done { uploaded: usize },
    Aborted(AbortReason),
    Failed { stage: Stage, error: String },
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

pub struct UploadOrchestrator {
    executor: RequestExecutor,
    git: Arc<dyn GitSource>,
    /// Repository URL provided by CI tags, if any
    repository_url: Option<String>,
}

impl UploadOrchestrator {
    pub fn new(
        executor: RequestExecutor,
        git: Arc<dyn GitSource>,
        repository_url: Option<String>,
    ) -> Self {
        Self {
            executor,
            git,
            repository_url,
        }
    }

    /// Run the pipeline once. Never fails; the outcome says how far it got.
    pub fn run(&self, cwd: Option<&Path>) -> RunOutcome {
        let mut stage = Stage::ResolveRepo;
        match self.run_stages(cwd, &mut stage) {
            Ok(outcome) => {
                tracing::info!("git metadata upload finished: {:?}", outcome);
                outcome
            }
            Err(e) => {
                tracing::error!("git metadata upload failed during {}: {:#}", stage, e);
                RunOutcome::Failed {
                    stage,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    fn run_stages(&self, cwd: Option<&Path>, stage: &mut Stage) -> Result<RunOutcome> {
        let repository_url = self.resolve_repository_url(cwd)?;
        tracing::debug!("Using repository URL {}", repository_url);

        *stage = Stage::SearchCommits;
        let latest_commits = match self.git.latest_commits(cwd) {
            Ok(commits) => commits,
            Err(e) => {
                tracing::debug!("Could not list latest commits: {:#}", e);
                Vec::new()
            }
        };
        if latest_commits.is_empty() {
            return Ok(RunOutcome::Aborted(AbortReason::NoLocalCommits));
        }
        let backend_commits = self.search_commits(&repository_url, &latest_commits)?;
        tracing::info!(
            "Backend knows {} of {} latest commits",
            backend_commits.len(),
            latest_commits.len()
        );

        *stage = Stage::FilterRevisions;
        let revisions = self
            .git
            .revisions_excluding(&backend_commits, cwd)
            .context("Failed to compute revisions missing from backend")?;
        if revisions.is_empty() {
            return Ok(RunOutcome::Aborted(AbortReason::NothingToUpload));
        }

        *stage = Stage::BuildPackfiles;
        let bundle = self
            .git
            .build_packfiles(&revisions, cwd)
            .context("Failed to build packfiles")?;

        *stage = Stage::UploadPackfiles;
        let head_sha = self.git.head_sha(cwd).context("Failed to read HEAD sha")?;
        let packfiles = bundle
            .packfiles()
            .with_context(|| format!("Failed to list packfiles in {:?}", bundle.directory()))?;

        let mut uploaded = 0;
        for path in &packfiles {
            let (content_type, payload) =
                codec::encode_upload_packfile(&repository_url, &head_sha, path)
                    .with_context(|| format!("Failed to encode packfile {:?}", path))?;
            let response = self.executor.send(
                PACKFILE_ENDPOINT,
                &payload,
                &[("Content-Type", content_type.as_str())],
            )?;
            if response.status != PACKFILE_ACCEPTED {
                return Err(Error::Protocol {
                    endpoint: PACKFILE_ENDPOINT.to_string(),
                    status: response.status,
                }
                .into());
            }
            uploaded += 1;
            tracing::debug!("Uploaded packfile {:?}", path);
        }

        *stage = Stage::Done;
        Ok(RunOutcome::Done { uploaded })
    }

    fn resolve_repository_url(&self, cwd: Option<&Path>) -> Result<String> {
        match self.repository_url.as_deref() {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => self
                .git
                .remote_url(cwd)
                .context("Failed to read repository URL from git remote"),
        }
    }

    fn search_commits(&self, repository_url: &str, commits: &[String]) -> Result<Vec<String>> {
        let payload = codec::encode_search_commits(repository_url, commits);
        let response = self.executor.send(SEARCH_COMMITS_ENDPOINT, &payload, &[])?;
        if !(200..300).contains(&response.status) {
            return Err(Error::Protocol {
                endpoint: SEARCH_COMMITS_ENDPOINT.to_string(),
                status: response.status,
            }
            .into());
        }
        Ok(codec::decode_search_commits(&response.body))
    }
}
