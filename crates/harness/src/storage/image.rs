//! Copy-on-write clones of hard drive images

use std::path::Path;
use std::process::Command;
use tracing::debug;
use xboxtest_common::{Error, Result};

/// Creates a new image backed by an existing one
pub trait ImageCloner: Send + Sync {
    /// Blocks until `dest` is complete
    fn clone_image(&self, base: &Path, dest: &Path) -> Result<()>;
}

/// Clones with `qemu-img create` using a qcow2 backing file
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

    pub fn command(&self, base: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["create", "-F", "qcow2", "-f", "qcow2", "-b"])
            .arg(base)
            .arg(dest);
        cmd
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl ImageCloner for QemuImg {
    fn clone_image(&self, base: &Path, dest: &Path) -> Result<()> {
        debug!("Copying image {} to {}", base.display(), dest.display());

        let output = self
            .command(base, dest)
            .output()
            .map_err(|e| Error::Storage(format!("Failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(Error::Storage(format!(
                "{} could not clone {} ({}): {}",
                self.binary,
                base.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
