//! Content-addressed-by-identity artifact storage.
//!
//! Every run writes under `{owner}/{repo}/{pr_number}/{commit_sha}/`, so
//! artifacts for different commits of the same PR never collide and a
//! re-run of the same commit overwrites its previous attempt in place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::models::RunIdentity;

/// Relative artifact prefix for a run. `owner_repo` already carries the
/// `owner/repo` slash, so the scheme flattens to four path segments.
pub fn run_prefix(identity: &RunIdentity) -> String {
    format!(
        "{}/{}/{}",
        identity.owner_repo, identity.pr_number, identity.commit_sha
    )
}

/// Build the full relative reference for a named artifact of a run, the
/// same string `put` returns.
pub fn artifact_ref(identity: &RunIdentity, name: &str) -> String {
    format!("{}/{}", run_prefix(identity), name)
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under the run's prefix, replacing any previous
    /// artifact of the same name. Returns the full relative reference.
    async fn put(&self, identity: &RunIdentity, name: &str, bytes: &[u8]) -> Result<String>;

    /// Fetch an artifact by the reference `put` returned, `None` if it was
    /// never written.
    async fn get(&self, reference: &str) -> Result<Option<Vec<u8>>>;

    /// Names of all artifacts recorded for the run, sorted.
    async fn list(&self, identity: &RunIdentity) -> Result<Vec<String>>;
}

/// Local-filesystem artifact store rooted at a configurable directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory backing a run's artifacts. Plan executors bind-mount
    /// this so task containers write directly into the store.
    pub fn local_dir(&self, identity: &RunIdentity) -> PathBuf {
        self.root.join(run_prefix(identity))
    }

    fn resolve(&self, identity: &RunIdentity, name: &str) -> Result<PathBuf> {
        validate_relative(name)?;
        Ok(self.local_dir(identity).join(name))
    }
}

/// References and names may nest ("plan/tfplan.json") but must stay inside
/// the store root.
fn validate_relative(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("Artifact path must not be empty");
    }
    if Path::new(path).is_absolute() {
        bail!("Artifact path must be relative: {}", path);
    }
    if path.split('/').any(|part| part == "..") {
        bail!("Artifact path must not traverse upward: {}", path);
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, identity: &RunIdentity, name: &str, bytes: &[u8]) -> Result<String> {
        let path = self.resolve(identity, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        Ok(format!("{}/{}", run_prefix(identity), name))
    }

    async fn get(&self, reference: &str) -> Result<Option<Vec<u8>>> {
        validate_relative(reference)?;
        let path = self.root.join(reference);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read artifact {}", path.display()))
            }
        }
    }

    async fn list(&self, identity: &RunIdentity) -> Result<Vec<String>> {
        let dir = self.local_dir(identity);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let names = tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            for entry in walkdir::WalkDir::new(&dir).min_depth(1) {
                let entry = entry.context("Failed to walk artifact directory")?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&dir)
                    .context("Artifact path outside run directory")?;
                names.push(rel.to_string_lossy().replace('\\', "/"));
            }
            names.sort();
            Ok::<_, anyhow::Error>(names)
        })
        .await
        .context("Artifact listing task panicked")??;
        Ok(names)
    }
}
