use std::{
    io,
    path::{Path, PathBuf},
};

use rand::{distr::Alphanumeric, Rng};
use tempfile::TempDir;

/// Only files with this extension are uploaded; `.idx` siblings are skipped
pub const PACK_EXTENSION: &str = ".pack";

const TOKEN_LEN: usize = 16;

/// Packfiles written for one upload run.
///
/// Files live in a private temporary directory and share a random token as
/// their name prefix. The directory and everything in it is removed when
/// the bundle is dropped.
#[derive(Debug)]
pub struct PackfileBundle {
    dir: TempDir,
    token: String,
}

impl PackfileBundle {
    /// Create an empty bundle in the system temp directory
    pub fn create() -> io::Result<Self> {
        Ok(Self::with_dir(TempDir::new()?))
    }

    /// Create an empty bundle in a fresh directory under `parent`
    pub fn create_in(parent: &Path) -> io::Result<Self> {
        Ok(Self::with_dir(TempDir::new_in(parent)?))
    }

    fn with_dir(dir: TempDir) -> Self {
        let token = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect::<String>();
        Self { dir, token }
    }

    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Path prefix handed to `git pack-objects`: `<dir>/<token>`
    pub fn prefix(&self) -> PathBuf {
        self.dir.path().join(&self.token)
    }

    /// Uploadable packfiles, sorted by file name
    pub fn packfiles(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(self.dir.path())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&self.token) || !name.ends_with(PACK_EXTENSION) {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packfiles_filters_by_token_and_extension() {
        let bundle = PackfileBundle::create().unwrap();
        let token = bundle.token().to_string();
        let dir = bundle.directory().to_path_buf();

        std::fs::write(dir.join(format!("{}-bbb.pack", token)), b"2").unwrap();
        std::fs::write(dir.join(format!("{}-aaa.pack", token)), b"1").unwrap();
        std::fs::write(dir.join(format!("{}-aaa.idx", token)), b"i").unwrap();
        std::fs::write(dir.join("other-ccc.pack"), b"x").unwrap();

        let names: Vec<String> = bundle
            .packfiles()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![format!("{}-aaa.pack", token), format!("{}-bbb.pack", token)]
        );
    }

    #[test]
    fn test_bundle_directory_removed_on_drop() {
        let bundle = PackfileBundle::create().unwrap();
        let dir = bundle.directory().to_path_buf();
        assert!(dir.exists());
        assert!(bundle.prefix().starts_with(&dir));
        drop(bundle);
        assert!(!dir.exists());
    }

    #[test]
    fn test_tokens_are_random() {
        let a = PackfileBundle::create().unwrap();
        let b = PackfileBundle::create().unwrap();
        assert_eq!(a.token().len(), TOKEN_LEN);
        assert_ne!(a.token(), b.token());
    }
}
