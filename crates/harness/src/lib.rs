//! xboxtest harness
//!
//! Drives emulated Xbox instances for automated tests:
//! - Launches the emulator with reserved ports and captures its debug output
//! - Sends controller input, resets and screenshots over the control channel
//! - Builds hard drive templates and hands each test a fresh copy-on-write image
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Harness (one per test session)                              │
//! │    ├── HarnessConfig, session directories                   │
//! │    ├── PortRegistry (shared by all runners)                 │
//! │    └── ProcessLauncher / ImageCloner / EditorOpener         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  InstanceRunner                                             │
//! │    ├── start() -> emulator process + 3 ports                │
//! │    ├── debug_stream() -> DebugStreamReader (serial)         │
//! │    ├── control() -> QmpClient                               │
//! │    ├── storage_client() -> FtpClient                        │
//! │    └── stop() / run(body) / Drop                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Template                                                   │
//! │    ├── create(base, modifications) via StorageEditor        │
//! │    ├── create_child(name, modifications)                    │
//! │    └── create_fresh_instance() -> <n>-<name>.qcow2          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod debug_stream;
pub mod emulator;
pub mod ftp;
pub mod runner;
pub mod session;
pub mod storage;

pub use config::HarnessConfig;
pub use debug_stream::DebugStreamReader;
pub use emulator::{EmulatorCommand, EmulatorProcess, InstancePorts, ProcessLauncher, SystemLauncher};
pub use ftp::{Credentials, DirEntry, FtpClient, RemoteFs};
pub use runner::{InstanceOptions, InstanceRunner, RunnerState};
pub use session::{Harness, HarnessBuilder, SessionDirs};
pub use storage::{
    EditorOpener, EmulatorEditorOpener, ImageCloner, Modification, QemuImg, StorageEditor, Template,
    TemplateBase,
};
pub use xboxtest_common::{ControllerButton, Error, Firmware, ForwardRule, RamSize, Result};
