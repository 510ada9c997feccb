//! Modification session on a hard drive image
//!
//! An editor boots a headless helper instance with the image attached and a
//! disc that runs a file transfer server, then works on the image through it.

use super::paths::{same_drive, validate_directory_path, validate_file_path};
use crate::ftp::{Credentials, RemoteFs};
use crate::runner::{InstanceOptions, InstanceRunner};
use crate::session::Harness;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use xboxtest_common::{Error, Result};

/// Opens storage editors on hard drive images
#[async_trait]
pub trait EditorOpener: Send + Sync {
    async fn open(&self, harness: &Arc<Harness>, image: &Path) -> Result<StorageEditor>;
}

/// Boots the configured editor disc in a headless instance
#[derive(Debug, Default)]
pub struct EmulatorEditorOpener;

#[async_trait]
impl EditorOpener for EmulatorEditorOpener {
    async fn open(&self, harness: &Arc<Harness>, image: &Path) -> Result<StorageEditor> {
        let storage = &harness.config().storage;
        let disc = storage.editor_disc.clone().ok_or_else(|| {
            Error::Config("no storage editor disc configured".to_string())
        })?;
        let credentials = Credentials::new(storage.username.clone(), storage.password.clone());

        let options = InstanceOptions::default()
            .with_storage_image(image)
            .with_removable_media(disc)
            .force_headless();
        let mut runner = InstanceRunner::new(harness, options)?;
        runner.start().await?;

        match runner.storage_client(Some(&credentials)).await {
            Ok(client) => {
                info!("Storage editor ready for {}", image.display());
                Ok(StorageEditor::with_runner(Box::new(client), runner))
            }
            Err(e) => {
                if let Err(stop_err) = runner.stop().await {
                    warn!("Failed to stop storage editor instance: {}", stop_err);
                }
                Err(e)
            }
        }
    }
}

/// File operations on one hard drive image.
///
/// All paths are device paths and are validated before any transfer.
pub struct StorageEditor {
    fs: Box<dyn RemoteFs>,
    runner: Option<InstanceRunner>,
}

impl StorageEditor {
    /// Editor over an already running file server
    pub fn new(fs: Box<dyn RemoteFs>) -> Self {
        Self { fs, runner: None }
    }

    /// Editor that owns the instance serving `fs` and stops it on close
    pub fn with_runner(fs: Box<dyn RemoteFs>, runner: InstanceRunner) -> Self {
        Self {
            fs,
            runner: Some(runner),
        }
    }

    /// Open an editor on `image` with the session's editor opener
    pub async fn open(harness: &Arc<Harness>, image: &Path) -> Result<Self> {
        harness.editor_opener().open(harness, image).await
    }

    pub async fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        validate_file_path(path)?;
        debug!("Adding {} ({} bytes)", path, contents.len());
        self.fs.store(path, contents).await
    }

    pub async fn copy_file(&mut self, from: &str, to: &str) -> Result<()> {
        validate_file_path(from)?;
        validate_file_path(to)?;
        let contents = self.file_contents(from).await?;
        self.add_file(to, &contents).await
    }

    pub async fn add_directory(&mut self, path: &str) -> Result<()> {
        validate_directory_path(path)?;
        debug!("Adding directory {}", path);
        self.fs.make_dir(path).await
    }

    /// Delete a directory and everything in it
    pub async fn delete_directory(&mut self, path: &str) -> Result<()> {
        validate_directory_path(path)?;
        debug!("Deleting directory {}", path);
        remove_tree(self.fs.as_mut(), path.trim_end_matches('/').to_string()).await
    }

    /// Rename or move a directory within its drive
    pub async fn rename_directory(&mut self, from: &str, to: &str) -> Result<()> {
        validate_directory_path(from)?;
        validate_directory_path(to)?;
        if !same_drive(from, to) {
            return Err(Error::CrossDrive {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Renaming directory {} to {}", from, to);
        self.fs
            .rename(from.trim_end_matches('/'), to.trim_end_matches('/'))
            .await
    }

    /// Names in a directory
    pub async fn directory_contents(&mut self, path: &str) -> Result<Vec<String>> {
        validate_directory_path(path)?;
        self.fs.name_list(path).await
    }

    /// Mounted drives
    pub async fn drives(&mut self) -> Result<Vec<String>> {
        self.fs.name_list("/").await
    }

    pub async fn file_contents(&mut self, path: &str) -> Result<Bytes> {
        validate_file_path(path)?;
        Ok(Bytes::from(self.fs.retrieve(path).await?))
    }

    pub async fn delete_file(&mut self, path: &str) -> Result<()> {
        validate_file_path(path)?;
        debug!("Deleting {}", path);
        self.fs.delete(path).await
    }

    /// Rename or move a file; across drives this is a copy and a delete
    pub async fn rename_file(&mut self, from: &str, to: &str) -> Result<()> {
        validate_file_path(from)?;
        validate_file_path(to)?;
        debug!("Renaming {} to {}", from, to);
        if same_drive(from, to) {
            self.fs.rename(from, to).await
        } else {
            self.copy_file(from, to).await?;
            self.delete_file(from).await
        }
    }

    /// End the session and stop the helper instance, waiting for it to exit
    pub async fn close(mut self) -> Result<()> {
        if let Err(e) = self.fs.quit().await {
            warn!("Storage editor did not log out cleanly: {}", e);
        }
        match self.runner.take() {
            Some(mut runner) => runner.stop().await,
            None => Ok(()),
        }
    }
}

fn remove_tree<'a>(fs: &'a mut dyn RemoteFs, path: String) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let entries = fs.list(&format!("{}/", path)).await?;
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let child = format!("{}/{}", path, entry.name);
            if entry.is_dir {
                remove_tree(&mut *fs, child).await?;
            } else {
                fs.delete(&child).await?;
            }
        }
        fs.remove_dir(&path).await
    })
}
