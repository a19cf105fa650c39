use std::{
    fs::{File, Permissions},
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::DriverError;

/// Puts a task artifact into a directory the task can read.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `source` into `dest_dir` and verify `checksum` when given.
    ///
    /// Returns the path of the fetched file.
    async fn fetch(
        &self,
        source: &str,
        checksum: Option<&str>,
        dest_dir: &Path,
    ) -> Result<PathBuf, DriverError>;
}

/// Expected digest of an artifact, written as `<algo>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Blake3(String),
}

impl Checksum {
    pub fn parse(raw: &str) -> Result<Self, DriverError> {
        let (algo, hex) = raw
            .split_once(':')
            .ok_or_else(|| DriverError::Config(format!("checksum '{raw}' is not <type>:<value>")))?;
        match algo {
            "blake3" if !hex.is_empty() => Ok(Checksum::Blake3(hex.to_ascii_lowercase())),
            "blake3" => Err(DriverError::Config("empty blake3 checksum".into())),
            other => Err(DriverError::Config(format!("unsupported checksum type '{other}'"))),
        }
    }

    fn verify(&self, actual: &blake3::Hash) -> Result<(), DriverError> {
        match self {
            Checksum::Blake3(expected) => {
                let actual = actual.to_hex();
                if actual.as_str() == expected {
                    Ok(())
                } else {
                    Err(DriverError::Artifact(format!(
                        "checksum mismatch: expected blake3:{expected}, got blake3:{actual}"
                    )))
                }
            }
        }
    }
}

/// Fetcher for local paths and `file://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFetcher;

#[async_trait]
impl ArtifactFetcher for FsFetcher {
    async fn fetch(
        &self,
        source: &str,
        checksum: Option<&str>,
        dest_dir: &Path,
    ) -> Result<PathBuf, DriverError> {
        let checksum = checksum.map(Checksum::parse).transpose()?;

        let path = match source.split_once("://") {
            None => Path::new(source),
            Some(("file", rest)) => Path::new(rest),
            Some((scheme, _)) => {
                return Err(DriverError::Artifact(format!(
                    "unsupported artifact scheme '{scheme}'"
                )));
            }
        };
        let name = path
            .file_name()
            .ok_or_else(|| DriverError::Artifact(format!("'{source}' does not name a file")))?;

        let dest = dest_dir.join(name);
        let bytes = {
            let (src, dir, dest) = (path.to_path_buf(), dest_dir.to_path_buf(), dest.clone());
            tokio::task::spawn_blocking(move || copy_verified(&src, &dir, &dest, checksum.as_ref()))
                .await
                .map_err(|e| DriverError::Artifact(format!("copy of '{source}' aborted: {e}")))??
        };

        info!(
            target: "tether.driver.artifact",
            %source,
            dest = %dest.display(),
            bytes,
            "artifact fetched"
        );
        Ok(dest)
    }
}

const CHUNK: usize = 64 * 1024;

fn io_err(op: &str, path: &Path, e: io::Error) -> DriverError {
    DriverError::Artifact(format!("{op} {}: {e}", path.display()))
}

/// Stream `src` into a temporary file in `dir` while hashing it, then rename it to `dest`.
///
/// The temporary file is deleted on every error path, so a failed fetch leaves nothing.
fn copy_verified(
    src: &Path,
    dir: &Path,
    dest: &Path,
    checksum: Option<&Checksum>,
) -> Result<u64, DriverError> {
    let mut input = File::open(src).map_err(|e| io_err("read", src, e))?;
    let mut part = tempfile::Builder::new()
        .prefix(".fetch-")
        .permissions(Permissions::from_mode(0o644))
        .tempfile_in(dir)
        .map_err(|e| io_err("create temporary file in", dir, e))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err("read", src, e)),
        };
        hasher.update(&buf[..n]);
        part.write_all(&buf[..n]).map_err(|e| io_err("write", part.path(), e))?;
        total += n as u64;
    }

    if let Some(sum) = checksum {
        sum.verify(&hasher.finalize())?;
        debug!(target: "tether.driver.artifact", src = %src.display(), "checksum verified");
    }
    part.persist(dest).map_err(|e| io_err("rename into", dest, e.error))?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(dir: &Path, body: &[u8]) -> PathBuf {
        let path = dir.join("app.jar");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn copies_local_file_with_valid_checksum() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let path = artifact(src.path(), b"jar bytes");
        let sum = format!("blake3:{}", blake3::hash(b"jar bytes").to_hex());

        let url = format!("file://{}", path.display());
        let out = FsFetcher.fetch(&url, Some(&sum), dest.path()).await.unwrap();
        assert_eq!(out, dest.path().join("app.jar"));
        assert_eq!(std::fs::read(out).unwrap(), b"jar bytes");
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let path = artifact(src.path(), b"tampered");
        let sum = format!("blake3:{}", blake3::hash(b"payload").to_hex());

        let err = FsFetcher
            .fetch(path.to_str().unwrap(), Some(&sum), dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Artifact(_)));
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn large_artifact_is_hashed_across_chunks() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..CHUNK * 3 + 17).map(|i| (i % 251) as u8).collect();
        let path = artifact(src.path(), &body);
        let sum = format!("blake3:{}", blake3::hash(&body).to_hex());

        let out = FsFetcher
            .fetch(path.to_str().unwrap(), Some(&sum), dest.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), body);
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_schemes_and_checksums() {
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            FsFetcher.fetch("https://example.com/app.jar", None, dest.path()).await,
            Err(DriverError::Artifact(_))
        ));
        assert!(matches!(
            FsFetcher.fetch("/tmp/app.jar", Some("md5:abc"), dest.path()).await,
            Err(DriverError::Config(_))
        ));
    }
}
