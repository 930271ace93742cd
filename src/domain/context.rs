//! Isolated build context directories.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};
use git2::{build::RepoBuilder, FetchOptions};
use log::{debug, info, warn};
use uuid::Uuid;

/// Build context on disk, removed when dropped.
#[derive(Debug)]
pub struct BuildContext {
    root: PathBuf,
}

impl BuildContext {
    pub fn create(build_root: &Path) -> Result<Self, Error> {
        let root = build_root.join(format!("build-{}", Uuid::new_v4()));
        fs::create_dir_all(&root)
            .with_context(|| format!("Can't create build context {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn code_dir(&self) -> PathBuf {
        self.root.join("code")
    }

    /// Shallow clone, optionally pinned to a branch.
    pub fn populate_from_git(&self, repository: &str, branch: Option<&str>) -> Result<(), Error> {
        info!("Clone git repository {}", repository);
        let mut fetch_options = FetchOptions::new();
        fetch_options.depth(1);
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options);
        if let Some(branch) = branch {
            builder.branch(branch);
        }
        builder
            .clone(repository, &self.code_dir())
            .with_context(|| format!("Can't clone repository {}", repository))?;
        Ok(())
    }

    pub fn populate_from_dir(&self, source: &Path) -> Result<(), Error> {
        if !source.is_dir() {
            return Err(anyhow::anyhow!(
                "Code directory {} does not exist",
                source.display()
            ));
        }
        copy_dir_all(source, &self.code_dir())
            .with_context(|| format!("Can't copy code from {}", source.display()))
    }

    pub fn write_dockerfile(&self, contents: &str) -> Result<(), Error> {
        fs::write(self.root.join("Dockerfile"), contents).context("Can't write Dockerfile")
    }

    /// gzip compressed tarball of the whole context.
    pub fn archive(&self) -> Result<Bytes, Error> {
        let tar_gz = BytesMut::new().writer();
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = tar::Builder::new(enc);
        tar.append_dir_all(".", &self.root)?;
        let tar_gz = tar.into_inner()?.finish()?;
        Ok(tar_gz.into_inner().freeze())
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!("Removed build context {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Can't remove build context {}: {}", self.root.display(), e),
        }
    }
}

fn copy_dir_all(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), destination)?;
        }
    }
    Ok(())
}
