//! Core types for xboxtest

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How much RAM the emulated Xbox has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RamSize {
    Mb64,
    Mb128,
}

impl Default for RamSize {
    fn default() -> Self {
        Self::Mb64
    }
}

impl RamSize {
    /// Value passed to the emulator's `-m` flag
    pub fn as_arg(&self) -> &'static str {
        match self {
            RamSize::Mb64 => "64M",
            RamSize::Mb128 => "128M",
        }
    }
}

impl std::fmt::Display for RamSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Buttons and sticks of the emulated controller.
///
/// The emulator binds each input to a keyboard key, so pressing a button
/// means sending that key's QEMU key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerButton {
    A,
    B,
    X,
    Y,
    White,
    Black,
    Start,
    Back,
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
    LeftTrigger,
    RightTrigger,
    LeftThumbUp,
    LeftThumbDown,
    LeftThumbLeft,
    LeftThumbRight,
    LeftThumbPress,
    RightThumbUp,
    RightThumbDown,
    RightThumbLeft,
    RightThumbRight,
    RightThumbPress,
}

impl ControllerButton {
    pub const ALL: [ControllerButton; 24] = [
        ControllerButton::A,
        ControllerButton::B,
        ControllerButton::X,
        ControllerButton::Y,
        ControllerButton::White,
        ControllerButton::Black,
        ControllerButton::Start,
        ControllerButton::Back,
        ControllerButton::DpadUp,
        ControllerButton::DpadDown,
        ControllerButton::DpadLeft,
        ControllerButton::DpadRight,
        ControllerButton::LeftTrigger,
        ControllerButton::RightTrigger,
        ControllerButton::LeftThumbUp,
        ControllerButton::LeftThumbDown,
        ControllerButton::LeftThumbLeft,
        ControllerButton::LeftThumbRight,
        ControllerButton::LeftThumbPress,
        ControllerButton::RightThumbUp,
        ControllerButton::RightThumbDown,
        ControllerButton::RightThumbLeft,
        ControllerButton::RightThumbRight,
        ControllerButton::RightThumbPress,
    ];

    /// QEMU key code the button is bound to
    pub fn qcode(&self) -> &'static str {
        match self {
            ControllerButton::A => "s",
            ControllerButton::B => "d",
            ControllerButton::X => "w",
            ControllerButton::Y => "e",
            ControllerButton::White => "x",
            ControllerButton::Black => "c",
            ControllerButton::Start => "ret",
            ControllerButton::Back => "backspace",
            ControllerButton::DpadUp => "up",
            ControllerButton::DpadDown => "down",
            ControllerButton::DpadLeft => "left",
            ControllerButton::DpadRight => "right",
            ControllerButton::LeftTrigger => "q",
            ControllerButton::RightTrigger => "r",
            ControllerButton::LeftThumbUp => "t",
            ControllerButton::LeftThumbDown => "g",
            ControllerButton::LeftThumbLeft => "f",
            ControllerButton::LeftThumbRight => "h",
            ControllerButton::LeftThumbPress => "v",
            ControllerButton::RightThumbUp => "i",
            ControllerButton::RightThumbDown => "k",
            ControllerButton::RightThumbLeft => "j",
            ControllerButton::RightThumbRight => "l",
            ControllerButton::RightThumbPress => "m",
        }
    }
}

/// Transport protocol of a forwarded port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl Default for TransportProtocol {
    fn default() -> Self {
        Self::Tcp
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Forward a host port to a port inside the emulated machine's user network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub guest_port: u16,
    pub host_port: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Guest address, empty for the default guest
    #[serde(default)]
    pub guest_ip: String,
    /// Host address to listen on, empty for all addresses
    #[serde(default)]
    pub host_ip: String,
}

impl ForwardRule {
    pub fn new(guest_port: u16, host_port: u16) -> Self {
        Self {
            guest_port,
            host_port,
            protocol: TransportProtocol::Tcp,
            guest_ip: String::new(),
            host_ip: String::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_guest_ip(mut self, ip: impl Into<String>) -> Self {
        self.guest_ip = ip.into();
        self
    }

    pub fn with_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = ip.into();
        self
    }

    /// `hostfwd=` option for user-mode networking
    pub fn hostfwd(&self) -> String {
        format!(
            "hostfwd={}:{}:{}-{}:{}",
            self.protocol, self.host_ip, self.host_port, self.guest_ip, self.guest_port
        )
    }
}

/// BIOS and MCPX boot ROM images the emulator boots with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    pub bios: PathBuf,
    pub mcpx_rom: PathBuf,
    /// Skip most of the boot animation
    #[serde(default = "default_short_animation")]
    pub short_animation: bool,
}

fn default_short_animation() -> bool {
    true
}

impl Firmware {
    pub fn new(bios: impl Into<PathBuf>, mcpx_rom: impl Into<PathBuf>) -> Self {
        Self {
            bios: bios.into(),
            mcpx_rom: mcpx_rom.into(),
            short_animation: true,
        }
    }

    /// Emulator arguments selecting this firmware
    pub fn args(&self) -> Vec<String> {
        let mut machine = format!("xbox,bootrom={}", self.mcpx_rom.display());
        if self.short_animation {
            machine.push_str(",short_animation");
        }
        vec![
            "-machine".to_string(),
            machine,
            "-bios".to_string(),
            self.bios.display().to_string(),
        ]
    }
}
