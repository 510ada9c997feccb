//! Storage snapshots: templates, per-test instances and the editor used to
//! bake modifications into templates

pub mod editor;
pub mod image;
pub mod modification;
pub mod paths;
pub mod template;

pub use editor::{EditorOpener, EmulatorEditorOpener, StorageEditor};
pub use image::{ImageCloner, QemuImg};
pub use modification::Modification;
pub use template::{Template, TemplateBase};
