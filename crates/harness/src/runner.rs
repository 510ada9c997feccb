//! Lifecycle of one emulator instance
//!
//! ```text
//! Created --start()--> Running --stop()--> Stopped
//! ```
//!
//! While running, the runner owns the emulator process, the three reserved
//! ports and the debug/control connections. `stop()` releases all of them
//! exactly once; dropping a running runner does the same synchronously.

use crate::debug_stream::DebugStreamReader;
use crate::emulator::{EmulatorCommand, EmulatorProcess, InstancePorts};
use crate::ftp::{Credentials, FtpClient};
use crate::session::Harness;
use futures::future::BoxFuture;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use xboxtest_common::{
    ControllerButton, Error, Firmware, ForwardRule, PortReservation, QmpClient, RamSize, Result,
};

/// How an instance is booted
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Hard drive image, usually a fresh instance of a storage template
    pub storage_image: Option<PathBuf>,
    /// Disc image in the DVD drive
    pub removable_media: Option<PathBuf>,
    pub ram_size: RamSize,
    /// Run without a window regardless of the session setting
    pub force_headless: bool,
    /// Port forwards in addition to the storage transfer port
    pub forward_rules: Vec<ForwardRule>,
}

impl InstanceOptions {
    pub fn with_storage_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.storage_image = Some(image.into());
        self
    }

    pub fn with_removable_media(mut self, media: impl Into<PathBuf>) -> Self {
        self.removable_media = Some(media.into());
        self
    }

    pub fn with_ram_size(mut self, ram_size: RamSize) -> Self {
        self.ram_size = ram_size;
        self
    }

    pub fn force_headless(mut self) -> Self {
        self.force_headless = true;
        self
    }

    pub fn with_forward_rule(mut self, rule: ForwardRule) -> Self {
        self.forward_rules.push(rule);
        self
    }
}

/// Lifecycle state of an [`InstanceRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Created => write!(f, "created"),
            RunnerState::Running => write!(f, "running"),
            RunnerState::Stopped => write!(f, "stopped"),
        }
    }
}

enum Stage {
    Created,
    Running(Box<Running>),
    Stopped,
}

/// Resources held while running. Fields drop in order: connections first,
/// then the process (terminated and waited), then the ports.
struct Running {
    debug: DebugStreamReader,
    control: Option<QmpClient>,
    process: EmulatorProcess,
    command: EmulatorCommand,
    storage_port: PortReservation,
    debug_port: PortReservation,
    control_port: PortReservation,
}

/// Runs one emulator instance
pub struct InstanceRunner {
    harness: Arc<Harness>,
    firmware: Firmware,
    options: InstanceOptions,
    stage: Stage,
}

impl InstanceRunner {
    /// Create a runner; fails when the session has no firmware configured
    pub fn new(harness: &Arc<Harness>, options: InstanceOptions) -> Result<Self> {
        let firmware = harness.config().firmware.clone().ok_or_else(|| {
            Error::Config(
                "firmware is not configured (set XBOXTEST_BIOS and XBOXTEST_MCPX_ROM)".to_string(),
            )
        })?;

        Ok(Self {
            harness: Arc::clone(harness),
            firmware,
            options,
            stage: Stage::Created,
        })
    }

    pub fn state(&self) -> RunnerState {
        match self.stage {
            Stage::Created => RunnerState::Created,
            Stage::Running(_) => RunnerState::Running,
            Stage::Stopped => RunnerState::Stopped,
        }
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    /// Launch the emulator and connect to its debug output
    pub async fn start(&mut self) -> Result<()> {
        if !matches!(self.stage, Stage::Created) {
            return Err(Error::invalid_state("start", self.state()));
        }

        let registry = self.harness.ports();
        let storage_port = registry.reserve()?;
        let debug_port = registry.reserve()?;
        let control_port = registry.reserve()?;
        let ports = InstancePorts {
            storage: storage_port.port(),
            debug: debug_port.port(),
            control: control_port.port(),
        };

        let command = EmulatorCommand::build(self.harness.config(), &self.firmware, &self.options, ports);
        info!(
            "Starting emulator (storage port {}, debug port {}, control port {})",
            ports.storage, ports.debug, ports.control
        );

        // Not restartable once a launch has been attempted
        self.stage = Stage::Stopped;
        let process = self.harness.launcher().launch(&command)?;

        let policy = self.harness.config().connect_policy();
        let reader = match DebugStreamReader::connect(ports.debug, &policy).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Debug stream on port {} never came up: {}", ports.debug, e);
                if let Err(stop_err) = process.stop().await {
                    warn!("Failed to stop emulator after failed start: {}", stop_err);
                }
                return Err(e);
            }
        };

        self.stage = Stage::Running(Box::new(Running {
            debug: reader,
            control: None,
            process,
            command,
            storage_port,
            debug_port,
            control_port,
        }));
        Ok(())
    }

    /// Tear the instance down: drain debug output, close connections,
    /// terminate the emulator and wait for it, release the ports.
    ///
    /// Does nothing unless running.
    pub async fn stop(&mut self) -> Result<()> {
        let running = match std::mem::replace(&mut self.stage, Stage::Stopped) {
            Stage::Running(running) => running,
            other => {
                self.stage = other;
                return Ok(());
            }
        };
        let Running {
            debug: mut reader,
            control,
            process,
            command,
            storage_port,
            debug_port,
            control_port,
        } = *running;

        if let Err(e) = reader.drain_available() {
            warn!("Failed to drain debug output on port {}: {}", reader.port(), e);
        }
        reader.close().await;

        if let Some(control) = control {
            control.close().await;
        }

        let pid = process.id();
        let result = process.stop().await;

        // Only once the process is gone
        storage_port.release();
        debug_port.release();
        control_port.release();

        match result {
            Ok(status) => {
                info!("Emulator PID {} stopped ({})", pid, status);
                debug!("Stopped instance: {}", command);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Start, run `body`, and stop regardless of how `body` finished.
    ///
    /// The body's error wins over a stop error.
    pub async fn run<T, F>(&mut self, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T>>,
    {
        self.start().await?;
        let result = body(self).await;
        let stopped = self.stop().await;

        match (result, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), stopped) => {
                if let Err(stop_err) = stopped {
                    warn!("Failed to stop instance after error: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    fn running(&self, operation: &str) -> Result<&Running> {
        match &self.stage {
            Stage::Running(running) => Ok(running.as_ref()),
            _ => Err(Error::invalid_state(operation, self.state())),
        }
    }

    fn running_mut(&mut self, operation: &str) -> Result<&mut Running> {
        let state = self.state();
        match &mut self.stage {
            Stage::Running(running) => Ok(running.as_mut()),
            _ => Err(Error::invalid_state(operation, state)),
        }
    }

    pub fn ports(&self) -> Result<InstancePorts> {
        Ok(self.running("query ports")?.command.ports)
    }

    pub fn command(&self) -> Result<&EmulatorCommand> {
        Ok(&self.running("query the command line")?.command)
    }

    /// Arguments the emulator was launched with
    pub fn args(&self) -> Result<&[String]> {
        Ok(&self.command()?.args)
    }

    pub fn debug_stream(&mut self) -> Result<&mut DebugStreamReader> {
        Ok(&mut self.running_mut("read debug output")?.debug)
    }

    /// The control channel, connected on first use
    pub async fn control(&mut self) -> Result<&QmpClient> {
        let policy = self.harness.config().connect_policy();
        let running = self.running_mut("use the control channel")?;

        let client = match running.control.take() {
            Some(client) => client,
            None => {
                let client = QmpClient::new("127.0.0.1", running.command.ports.control);
                client.connect_with_retry(&policy).await?;
                client
            }
        };
        let client = running.control.insert(client);
        Ok(&*client)
    }

    /// Press buttons together, optionally holding them for `hold_time`
    pub async fn press_buttons(
        &mut self,
        buttons: &[ControllerButton],
        hold_time: Option<Duration>,
    ) -> Result<()> {
        let keys: Vec<&str> = buttons.iter().map(|b| b.qcode()).collect();
        let hold_ms = hold_time.map(|d| u32::try_from(d.as_millis()).unwrap_or(u32::MAX));
        debug!("Pressing {:?}", buttons);
        self.control().await?.send_key(&keys, hold_ms).await
    }

    /// Hard-reset the machine
    pub async fn reset(&mut self) -> Result<()> {
        info!("Resetting instance");
        self.control().await?.system_reset().await
    }

    /// Save the framebuffer as `<n>-<filename>` in the screenshots directory
    pub async fn save_screenshot(&mut self, filename: &str) -> Result<PathBuf> {
        validate_screenshot_name(filename)?;
        self.running("save a screenshot")?;

        let number = self.harness.next_screenshot_number();
        let path = self
            .harness
            .dirs()
            .screenshots
            .join(format!("{}-{}", number, filename));

        self.control()
            .await?
            .screendump(&path.to_string_lossy())
            .await?;
        info!("Saved screenshot {}", path.display());
        Ok(path)
    }

    /// Connect to the guest's file transfer server, logging in if credentials are given
    pub async fn storage_client(&mut self, credentials: Option<&Credentials>) -> Result<FtpClient> {
        let config = self.harness.config();
        let policy = config.connect_policy();
        let timeout = Duration::from_secs(config.ftp.timeout_secs);
        let gateway: Ipv4Addr = config.ftp.host_gateway.parse().map_err(|_| {
            Error::Config(format!("invalid host gateway address {:?}", config.ftp.host_gateway))
        })?;
        let port = self.running("connect to storage")?.command.ports.storage;

        let mut client = FtpClient::connect_with_retry("127.0.0.1", port, gateway, timeout, &policy).await?;
        if let Some(credentials) = credentials {
            client.login(credentials).await?;
        }
        Ok(client)
    }
}

impl Drop for InstanceRunner {
    fn drop(&mut self) {
        if matches!(self.stage, Stage::Running(_)) {
            warn!("Instance runner dropped while running, tearing down");
            // Dropping the resources terminates and waits for the process
            self.stage = Stage::Stopped;
        }
    }
}

fn validate_screenshot_name(filename: &str) -> Result<()> {
    if filename.contains('/') || filename.contains('\\') {
        return Err(Error::Config(format!(
            "screenshot name {:?} must not contain a path separator",
            filename
        )));
    }

    let is_ppm = filename
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case("ppm"));
    if !is_ppm {
        return Err(Error::Config(format!(
            "screenshot name {:?} must have the extension .ppm",
            filename
        )));
    }
    Ok(())
}
