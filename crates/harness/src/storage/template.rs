//! Storage templates and the per-test instances cloned from them

use super::editor::StorageEditor;
use super::modification::Modification;
use crate::session::Harness;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use xboxtest_common::{Error, Result};

/// What a template is cloned from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateBase {
    /// A hard drive image on disk
    Image(PathBuf),
    /// Another template's image
    Template { name: String, image: PathBuf },
}

impl TemplateBase {
    pub fn image(&self) -> &Path {
        match self {
            TemplateBase::Image(path) => path,
            TemplateBase::Template { image, .. } => image,
        }
    }
}

impl From<PathBuf> for TemplateBase {
    fn from(path: PathBuf) -> Self {
        TemplateBase::Image(path)
    }
}

impl From<&Path> for TemplateBase {
    fn from(path: &Path) -> Self {
        TemplateBase::Image(path.to_path_buf())
    }
}

impl From<&Template> for TemplateBase {
    fn from(template: &Template) -> Self {
        TemplateBase::Template {
            name: template.name.clone(),
            image: template.image.clone(),
        }
    }
}

/// A named hard drive image with modifications already applied.
///
/// The template image is never booted directly; each test gets its own
/// copy-on-write instance from [`Template::create_fresh_instance`].
#[derive(Debug)]
pub struct Template {
    // Weak: the session caches its blank template
    harness: Weak<Harness>,
    name: String,
    image: PathBuf,
    parent: Option<String>,
    modifications: Vec<Modification>,
    instances: AtomicU64,
}

impl Template {
    /// Clone `base` into `<templates>/<name>.qcow2` and apply `modifications`.
    ///
    /// Names are unique within a session. Paths in the modifications are
    /// checked before anything is written.
    pub async fn create(
        harness: &Arc<Harness>,
        name: &str,
        base: impl Into<TemplateBase>,
        modifications: Vec<Modification>,
    ) -> Result<Self> {
        let base = base.into();
        validate_name(name)?;
        for modification in &modifications {
            modification.validate()?;
        }

        let image = harness.dirs().templates.join(format!("{}.qcow2", name));
        claim(&image, name)?;
        info!("Creating template {} from {}", name, base.image().display());

        if let Err(e) = build(harness, base.image(), &image, &modifications).await {
            if let Err(remove_err) = std::fs::remove_file(&image) {
                warn!("Failed to remove incomplete template {}: {}", image.display(), remove_err);
            }
            return Err(e);
        }

        let parent = match base {
            TemplateBase::Template { name, .. } => Some(name),
            TemplateBase::Image(_) => None,
        };
        Ok(Self {
            harness: Arc::downgrade(harness),
            name: name.to_string(),
            image,
            parent,
            modifications,
            instances: AtomicU64::new(0),
        })
    }

    /// A new template based on this one.
    ///
    /// This template's modifications are already in its image, so only
    /// `modifications` are applied to the child.
    pub async fn create_child(&self, name: &str, modifications: Vec<Modification>) -> Result<Template> {
        Template::create(&self.harness()?, name, self, modifications).await
    }

    /// Clone the template into a new image for one test: `<images>/<n>-<name>.qcow2`
    pub async fn create_fresh_instance(&self) -> Result<PathBuf> {
        let harness = self.harness()?;
        let number = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        let path = harness
            .dirs()
            .images
            .join(format!("{}-{}.qcow2", number, self.name));

        clone_image(&harness, &self.image, &path).await?;
        debug!("Created {} from template {}", path.display(), self.name);
        Ok(path)
    }

    fn harness(&self) -> Result<Arc<Harness>> {
        self.harness
            .upgrade()
            .ok_or_else(|| Error::Internal(format!("template {} outlived its test session", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Name of the template this one was derived from
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Modifications applied on top of the base (not the parent's)
    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn instance_count(&self) -> u64 {
        self.instances.load(Ordering::SeqCst)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return Err(Error::Config(format!("invalid template name {:?}", name)));
    }
    Ok(())
}

/// Reserve the template file so a second template with the same name fails
fn claim(image: &Path, name: &str) -> Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(image) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::Config(format!(
            "a template called {:?} already exists in this session",
            name
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn build(
    harness: &Arc<Harness>,
    base: &Path,
    image: &Path,
    modifications: &[Modification],
) -> Result<()> {
    clone_image(harness, base, image).await?;
    if modifications.is_empty() {
        return Ok(());
    }

    let mut editor = StorageEditor::open(harness, image).await?;
    let mut applied = Ok(());
    for modification in modifications {
        debug!("Applying {}", modification);
        applied = modification.apply(&mut editor).await;
        if applied.is_err() {
            break;
        }
    }

    // Always closed, so the helper instance has exited before the image is used
    let closed = editor.close().await;
    applied?;
    closed
}

/// Run the session's cloner off the async runtime and wait for it
async fn clone_image(harness: &Arc<Harness>, base: &Path, dest: &Path) -> Result<()> {
    let harness = Arc::clone(harness);
    let base = base.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || harness.image_cloner().clone_image(&base, &dest))
        .await
        .map_err(|e| Error::Internal(format!("image clone task failed: {}", e)))?
}
