//! Emulator process management
//!
//! Builds the emulator command line and owns the spawned process.

use crate::config::HarnessConfig;
use crate::runner::InstanceOptions;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};
use xboxtest_common::{Error, Firmware, ForwardRule, Result};

/// Guest port the file transfer server listens on
pub const GUEST_FTP_PORT: u16 = 21;

/// Host ports wired to one emulator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancePorts {
    /// Forwarded to the guest's file transfer server
    pub storage: u16,
    /// Serial port (kernel debug output)
    pub debug: u16,
    /// QMP control channel
    pub control: u16,
}

/// Fully resolved emulator invocation
#[derive(Debug, Clone)]
pub struct EmulatorCommand {
    pub program: String,
    pub args: Vec<String>,
    pub ports: InstancePorts,
}

impl EmulatorCommand {
    /// Build the argument list for an instance
    pub fn build(
        config: &HarnessConfig,
        firmware: &Firmware,
        options: &InstanceOptions,
        ports: InstancePorts,
    ) -> Self {
        let mut args: Vec<String> = vec![
            "-cpu".to_string(),
            "pentium3".to_string(),
            "-m".to_string(),
            options.ram_size.as_arg().to_string(),
        ];

        args.extend(firmware.args());

        // Controller on the first port, SuperIO for the serial port, NIC
        args.extend(
            [
                "-device",
                "usb-hub,port=3",
                "-device",
                "usb-xbox-gamepad,port=3.1",
                "-device",
                "lpc47m157",
                "-net",
                "nic,model=nvnet",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        let mut user_net = format!(
            "user,{}",
            ForwardRule::new(GUEST_FTP_PORT, ports.storage).hostfwd()
        );
        for rule in &options.forward_rules {
            user_net.push(',');
            user_net.push_str(&rule.hostfwd());
        }
        args.extend(["-net".to_string(), user_net]);

        // The emulator blocks until the debug reader connects, so no output is lost.
        // The control channel is only connected when first needed.
        args.extend([
            "-serial".to_string(),
            format!("tcp::{},server", ports.debug),
            "-qmp".to_string(),
            format!("tcp::{},server,nowait", ports.control),
        ]);

        if options.force_headless || config.headless {
            args.extend(["-display".to_string(), "egl-headless".to_string()]);
        }

        if let Some(hdd) = &options.storage_image {
            args.extend([
                "-drive".to_string(),
                format!("index=0,media=disk,file={}", hdd.display()),
            ]);
        }

        if let Some(dvd) = &options.removable_media {
            args.extend([
                "-drive".to_string(),
                format!("index=1,media=cdrom,file={}", dvd.display()),
            ]);
        }

        Self {
            program: config.emulator_binary.clone(),
            args,
            ports,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        cmd
    }
}

impl std::fmt::Display for EmulatorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Starts emulator processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &EmulatorCommand) -> Result<EmulatorProcess>;
}

/// Launches the configured emulator binary
#[derive(Debug, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, command: &EmulatorCommand) -> Result<EmulatorProcess> {
        debug!("Emulator command: {}", command);

        let child = command.to_command().spawn().map_err(|e| {
            Error::Process(format!("Failed to spawn {}: {}", command.program, e))
        })?;

        info!("Emulator started with PID {}", child.id());
        Ok(EmulatorProcess::new(child))
    }
}

/// A running emulator process.
///
/// Stopping sends SIGTERM and then waits for the process to exit completely,
/// so the disk images it had open can be reused straight away. Dropping an
/// unstopped process does the same.
#[derive(Debug)]
pub struct EmulatorProcess {
    child: Child,
    exit_status: Option<ExitStatus>,
}

impl EmulatorProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exit_status: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process has exited (without blocking)
    pub fn has_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Request graceful termination and block until the process is gone
    pub fn terminate_and_wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let pid = Pid::from_raw(self.child.id() as i32);
        match kill(pid, Signal::SIGTERM) {
            // Already exited, reaped below
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(Error::Process(format!(
                    "Failed to terminate PID {}: {}",
                    pid, e
                )))
            }
        }

        let status = self.child.wait()?;
        debug!("Emulator PID {} exited with {}", pid, status);
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Terminate and wait without blocking the async runtime
    pub async fn stop(mut self) -> Result<ExitStatus> {
        tokio::task::spawn_blocking(move || self.terminate_and_wait())
            .await
            .map_err(|e| Error::Internal(format!("wait task failed: {}", e)))?
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            if let Err(e) = self.terminate_and_wait() {
                warn!("Failed to stop emulator PID {}: {}", self.child.id(), e);
            }
        }
    }
}
