//! Test session state shared by every instance and template

use crate::config::HarnessConfig;
use crate::emulator::{ProcessLauncher, SystemLauncher};
use crate::storage::{EditorOpener, EmulatorEditorOpener, ImageCloner, QemuImg, Template};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use xboxtest_common::{Error, PortRegistry, Result};

/// Name of the session template cloned from the configured blank image
pub const BLANK_TEMPLATE_NAME: &str = "blank_hdd";

/// Directories owned by one session
#[derive(Debug, Clone)]
pub struct SessionDirs {
    pub root: PathBuf,
    /// Per-test storage instances
    pub images: PathBuf,
    /// Storage templates
    pub templates: PathBuf,
    pub screenshots: PathBuf,
}

impl SessionDirs {
    fn create(root: &Path) -> Result<Self> {
        let dirs = Self {
            root: root.to_path_buf(),
            images: root.join("hdd_images"),
            templates: root.join("hdd_templates"),
            screenshots: root.join("screenshots"),
        };
        for dir in [&dirs.images, &dirs.templates, &dirs.screenshots] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(dirs)
    }
}

/// One test session.
///
/// Holds the configuration, session directories, the port registry shared by
/// all instance runners, the screenshot counter, and the seams used to start
/// emulators, clone images and open storage editors. Shared by `Arc`.
pub struct Harness {
    config: HarnessConfig,
    dirs: SessionDirs,
    // Removes the session directory when the session ends
    _temp_root: Option<TempDir>,
    ports: Arc<PortRegistry>,
    screenshot_counter: AtomicU64,
    launcher: Arc<dyn ProcessLauncher>,
    cloner: Arc<dyn ImageCloner>,
    editor_opener: Arc<dyn EditorOpener>,
    blank: OnceCell<Arc<Template>>,
}

impl Harness {
    /// Start a session with the default emulator, image tool and storage editor
    pub fn new(config: HarnessConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn builder(config: HarnessConfig) -> HarnessBuilder {
        HarnessBuilder {
            config,
            launcher: None,
            cloner: None,
            editor_opener: None,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn dirs(&self) -> &SessionDirs {
        &self.dirs
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn launcher(&self) -> &dyn ProcessLauncher {
        self.launcher.as_ref()
    }

    pub fn image_cloner(&self) -> &dyn ImageCloner {
        self.cloner.as_ref()
    }

    pub fn editor_opener(&self) -> &dyn EditorOpener {
        self.editor_opener.as_ref()
    }

    /// Next screenshot sequence number, starting at 1
    pub fn next_screenshot_number(&self) -> u64 {
        self.screenshot_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The blank hard drive template, created on first use
    pub async fn blank_template(self: &Arc<Self>) -> Result<Arc<Template>> {
        self.blank
            .get_or_try_init(|| async {
                let image = self.config.storage.blank_image.clone().ok_or_else(|| {
                    Error::Config("no blank hard drive image configured".to_string())
                })?;
                let template = Template::create(self, BLANK_TEMPLATE_NAME, image, Vec::new()).await?;
                Ok(Arc::new(template))
            })
            .await
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("root", &self.dirs.root)
            .field("reserved_ports", &self.ports.reserved_count())
            .finish()
    }
}

/// Builder for [`Harness`] with replaceable seams
pub struct HarnessBuilder {
    config: HarnessConfig,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    cloner: Option<Arc<dyn ImageCloner>>,
    editor_opener: Option<Arc<dyn EditorOpener>>,
}

impl HarnessBuilder {
    pub fn launcher(mut self, launcher: impl ProcessLauncher + 'static) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    pub fn image_cloner(mut self, cloner: impl ImageCloner + 'static) -> Self {
        self.cloner = Some(Arc::new(cloner));
        self
    }

    pub fn editor_opener(mut self, opener: impl EditorOpener + 'static) -> Self {
        self.editor_opener = Some(Arc::new(opener));
        self
    }

    /// Create the session directories and the session
    pub fn build(self) -> Result<Arc<Harness>> {
        let (root, temp_root) = match &self.config.session_root {
            Some(root) => (root.clone(), None),
            None => {
                let temp = tempfile::Builder::new().prefix("xboxtest-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        let dirs = SessionDirs::create(&root)?;
        info!("Test session directory: {}", root.display());

        let cloner: Arc<dyn ImageCloner> = match self.cloner {
            Some(cloner) => cloner,
            None => Arc::new(QemuImg::new(self.config.storage.qemu_img_binary.clone())),
        };
        let launcher: Arc<dyn ProcessLauncher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(SystemLauncher),
        };
        let editor_opener: Arc<dyn EditorOpener> = match self.editor_opener {
            Some(opener) => opener,
            None => Arc::new(EmulatorEditorOpener),
        };
        debug!("Session configuration: {:?}", self.config);

        Ok(Arc::new(Harness {
            config: self.config,
            dirs,
            _temp_root: temp_root,
            ports: Arc::new(PortRegistry::new()),
            screenshot_counter: AtomicU64::new(0),
            launcher,
            cloner,
            editor_opener,
            blank: OnceCell::new(),
        }))
    }
}
