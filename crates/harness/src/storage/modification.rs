//! Changes baked into a storage template when it is created

use super::editor::StorageEditor;
use super::paths::{same_drive, validate_directory_path, validate_file_path};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::path::Path;
use xboxtest_common::{Error, Result};

/// One change to a hard drive image. Paths are device paths (`/<drive>/...`);
/// directory paths end in `/`, file paths do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    AddFile { path: String, contents: Bytes },
    AddDirectory { path: String },
    DeleteFile { path: String },
    /// Deletes the directory and everything below it
    DeleteDirectory { path: String },
    CopyFile { from: String, to: String },
    /// Moves across drives by copying and deleting
    RenameFile { from: String, to: String },
    /// Only within one drive
    RenameDirectory { from: String, to: String },
    /// Applied in order
    Batch(Vec<Modification>),
}

impl Modification {
    pub fn add_file(path: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Modification::AddFile {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Add a file with the contents of a file on the host
    pub fn add_local_file(path: impl Into<String>, local: &Path) -> Result<Self> {
        let contents = std::fs::read(local)?;
        Ok(Self::add_file(path, contents))
    }

    pub fn add_directory(path: impl Into<String>) -> Self {
        Modification::AddDirectory { path: path.into() }
    }

    pub fn delete_file(path: impl Into<String>) -> Self {
        Modification::DeleteFile { path: path.into() }
    }

    pub fn delete_directory(path: impl Into<String>) -> Self {
        Modification::DeleteDirectory { path: path.into() }
    }

    pub fn copy_file(from: impl Into<String>, to: impl Into<String>) -> Self {
        Modification::CopyFile {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn rename_file(from: impl Into<String>, to: impl Into<String>) -> Self {
        Modification::RenameFile {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn rename_directory(from: impl Into<String>, to: impl Into<String>) -> Self {
        Modification::RenameDirectory {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn batch(modifications: impl IntoIterator<Item = Modification>) -> Self {
        Modification::Batch(modifications.into_iter().collect())
    }

    /// Check every path without touching any image
    pub fn validate(&self) -> Result<()> {
        match self {
            Modification::AddFile { path, .. } | Modification::DeleteFile { path } => {
                validate_file_path(path)
            }
            Modification::AddDirectory { path } | Modification::DeleteDirectory { path } => {
                validate_directory_path(path)
            }
            Modification::CopyFile { from, to } | Modification::RenameFile { from, to } => {
                validate_file_path(from)?;
                validate_file_path(to)
            }
            Modification::RenameDirectory { from, to } => {
                validate_directory_path(from)?;
                validate_directory_path(to)?;
                if !same_drive(from, to) {
                    return Err(Error::CrossDrive {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
                Ok(())
            }
            Modification::Batch(modifications) => {
                modifications.iter().try_for_each(Modification::validate)
            }
        }
    }

    /// Carry out the change through an open editor
    pub fn apply<'a>(&'a self, editor: &'a mut StorageEditor) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self {
                Modification::AddFile { path, contents } => editor.add_file(path, contents).await,
                Modification::AddDirectory { path } => editor.add_directory(path).await,
                Modification::DeleteFile { path } => editor.delete_file(path).await,
                Modification::DeleteDirectory { path } => editor.delete_directory(path).await,
                Modification::CopyFile { from, to } => editor.copy_file(from, to).await,
                Modification::RenameFile { from, to } => editor.rename_file(from, to).await,
                Modification::RenameDirectory { from, to } => {
                    editor.rename_directory(from, to).await
                }
                Modification::Batch(modifications) => {
                    for modification in modifications {
                        modification.apply(&mut *editor).await?;
                    }
                    Ok(())
                }
            }
        })
    }
}

impl std::fmt::Display for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modification::AddFile { path, contents } => {
                write!(f, "add file {} ({} bytes)", path, contents.len())
            }
            Modification::AddDirectory { path } => write!(f, "add directory {}", path),
            Modification::DeleteFile { path } => write!(f, "delete file {}", path),
            Modification::DeleteDirectory { path } => write!(f, "delete directory {}", path),
            Modification::CopyFile { from, to } => write!(f, "copy file {} to {}", from, to),
            Modification::RenameFile { from, to } => write!(f, "rename file {} to {}", from, to),
            Modification::RenameDirectory { from, to } => {
                write!(f, "rename directory {} to {}", from, to)
            }
            Modification::Batch(modifications) => {
                write!(f, "batch of {} modifications", modifications.len())
            }
        }
    }
}
