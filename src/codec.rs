//! Request and response bodies for the git metadata endpoints
//!
//! Two request shapes are produced here:
//! - `/search_commits`: a JSON envelope listing the local commits
//! - `/packfile`: a multipart body carrying a JSON metadata part and the
//!   raw packfile bytes
//!
//! Nothing in this module performs network I/O. The only fallible step is
//! reading the packfile from disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const MULTIPART_BOUNDARY: &str = "----------boundary------";
const CRLF: &[u8] = b"\r\n";
const COMMIT_TYPE: &str = "commit";

#[derive(Debug, Serialize)]
struct RepositoryMeta<'a> {
    repository_url: &'a str,
}

#[derive(Debug, Serialize)]
struct CommitRef<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct SearchCommitsRequest<'a> {
    meta: RepositoryMeta<'a>,
    data: Vec<CommitRef<'a>>,
}

#[derive(Debug, Serialize)]
struct PushedShaMetadata<'a> {
    data: CommitRef<'a>,
    meta: RepositoryMeta<'a>,
}

#[derive(Debug, Deserialize)]
struct SearchCommitsResponse {
    data: Vec<CommitEntry>,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Encode the `/search_commits` request body, preserving commit order
pub fn encode_search_commits(repository_url: &str, commits: &[String]) -> Vec<u8> {
    let request = SearchCommitsRequest {
        meta: RepositoryMeta { repository_url },
        data: commits
            .iter()
            .map(|sha| CommitRef {
                id: sha,
                kind: COMMIT_TYPE,
            })
            .collect(),
    };

    // Serializing borrowed strings into a Vec cannot fail
    serde_json::to_vec(&request).unwrap_or_default()
}

/// Decode the commits the backend already has.
///
/// A body that is not the expected envelope is logged and treated as
/// "backend knows nothing"; this never fails.
pub fn decode_search_commits(body: &[u8]) -> Vec<String> {
    let text = match std::str::from_utf8(body) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Unexpected decode error in search_commits response: {}", e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<SearchCommitsResponse>(text) {
        Ok(response) => response
            .data
            .into_iter()
            .filter(|entry| entry.kind == COMMIT_TYPE)
            .map(|entry| entry.id)
            .collect(),
        Err(e) if e.is_data() => {
            tracing::warn!(
                "Expected information not found in search_commits response: {}",
                e
            );
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Unexpected decode error in search_commits response: {}", e);
            Vec::new()
        }
    }
}

/// Build the multipart `/packfile` body for one packfile.
///
/// Returns the `Content-Type` header value and the body bytes.
pub fn encode_upload_packfile(
    repository_url: &str,
    sha: &str,
    file_path: &Path,
) -> Result<(String, Vec<u8>)> {
    let metadata = serde_json::to_vec(&PushedShaMetadata {
        data: CommitRef {
            id: sha,
            kind: COMMIT_TYPE,
        },
        meta: RepositoryMeta { repository_url },
    })?;

    let file_name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_content = std::fs::read(file_path)?;

    let delimiter = format!("--{}", MULTIPART_BOUNDARY).into_bytes();
    let packfile_disposition = format!(
        "Content-Disposition: form-data; name=\"packfile\"; filename=\"{}\"",
        file_name
    )
    .into_bytes();

    let closing = format!("--{}--", MULTIPART_BOUNDARY).into_bytes();

    let mut body = Vec::with_capacity(file_content.len() + metadata.len() + 512);
    let mut push_line = |line: &[u8]| {
        body.extend_from_slice(line);
        body.extend_from_slice(CRLF);
    };
    push_line(&delimiter);
    push_line(b"Content-Disposition: form-data; name=\"pushedSha\"");
    push_line(b"Content-Type: application/json");
    push_line(b"");
    push_line(&metadata);
    push_line(&delimiter);
    push_line(&packfile_disposition);
    push_line(b"Content-Type: application/octet-stream");
    push_line(b"");
    push_line(&file_content);
    push_line(&closing);

    let content_type = format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY);
    Ok((content_type, body))
}
