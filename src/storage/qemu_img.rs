//! Disk image operations backed by the `qemu-img` CLI.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::storage::{DiskSource, ImageStorage};

/// `qemu-img` command wrapper.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: String,
}

impl QemuImg {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(binary = %self.binary, args = ?args, "running qemu-img");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "qemu-img {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// The on-disk format of an existing image, as reported by
    /// `qemu-img info --output=json`.
    #[instrument(skip(self))]
    pub async fn image_format(&self, path: &Path) -> Result<String> {
        let path_arg = path.display().to_string();
        let output = self
            .run(&["info", "--output=json", path_arg.as_str()])
            .await
            .with_context(|| format!("failed to inspect image {}", path.display()))?;
        parse_image_format(&output)
    }
}

impl ImageStorage for QemuImg {
    /// Runs: `qemu-img create -f qcow2 -b {backing} -F {backing_format} {path}`
    ///
    /// The backing format is looked up from the parent first; modern
    /// qemu-img refuses chain creation without an explicit `-F`.
    async fn create_cow_image(&self, path: &Path, backing: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            bail!("refusing to overwrite existing image {}", path.display());
        }

        let backing_format = self
            .image_format(backing)
            .await
            .with_context(|| format!("cannot determine format of parent {}", backing.display()))?;

        let args = build_cow_create_args(path, backing, &backing_format);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args)
            .await
            .with_context(|| format!("failed to create copy-on-write image {}", path.display()))?;
        Ok(())
    }

    async fn copy_image(&self, src: &Path, dst: &Path) -> Result<()> {
        if tokio::fs::try_exists(dst).await.unwrap_or(false) {
            bail!("refusing to overwrite existing image {}", dst.display());
        }
        tokio::fs::copy(src, dst).await.with_context(|| {
            format!("failed to copy {} to {}", src.display(), dst.display())
        })?;
        Ok(())
    }

    async fn delete_image(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to delete image {}", path.display()))
            }
        }
    }

    fn disk_sources(&self, definition: &str) -> Result<Vec<DiskSource>> {
        super::disk_sources(definition)
    }
}

/// Argument list for a copy-on-write image creation. Extracted so the
/// exact backing reference can be asserted without shelling out.
pub(crate) fn build_cow_create_args(
    target: &Path,
    backing: &Path,
    backing_format: &str,
) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-b".to_string(),
        backing.display().to_string(),
        "-F".to_string(),
        backing_format.to_string(),
        target.display().to_string(),
    ]
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
}

/// Parse the `format` field out of `qemu-img info --output=json` output.
pub(crate) fn parse_image_format(json: &str) -> Result<String> {
    let info: ImageInfo =
        serde_json::from_str(json).context("unexpected qemu-img info output")?;
    Ok(info.format)
}
