//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xboxtest_common::{Error, Firmware, Result, RetryPolicy};

/// Session-wide harness configuration.
///
/// Built once when the test session starts and handed to
/// [`crate::Harness::new`]; nothing reads emulator settings from ambient
/// process state after that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Emulator binary to launch
    pub emulator_binary: String,

    /// BIOS and boot ROM, required before any instance can be created
    pub firmware: Option<Firmware>,

    /// Run every instance without a window
    pub headless: bool,

    /// Where session directories are created (a temporary directory if unset)
    pub session_root: Option<PathBuf>,

    /// Connection retry policy for the debug, control and storage channels
    pub connect_retry: RetryConfig,

    /// Disk image configuration
    pub storage: StorageConfig,

    /// File transfer configuration
    pub ftp: FtpConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            emulator_binary: "xqemu".to_string(),
            firmware: None,
            headless: false,
            session_root: None,
            connect_retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            ftp: FtpConfig::default(),
        }
    }
}

/// Bounded retry settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.delay_ms))
    }
}

/// Disk image configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Tool used to create copy-on-write clones
    pub qemu_img_binary: String,

    /// Empty, formatted hard drive image used for the blank template
    pub blank_image: Option<PathBuf>,

    /// Disc image that boots into a file transfer server, used to modify templates
    pub editor_disc: Option<PathBuf>,

    /// Credentials of the editor disc's file transfer server
    pub username: String,
    pub password: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            qemu_img_binary: "qemu-img".to_string(),
            blank_image: None,
            editor_disc: None,
            username: "xbox".to_string(),
            password: "xbox".to_string(),
        }
    }
}

/// File transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    /// Address the guest uses to reach the host through user-mode networking.
    /// Announced in PORT commands for active-mode data connections.
    pub host_gateway: String,

    /// Timeout for a single control or data connection operation
    pub timeout_secs: u64,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host_gateway: "10.0.2.2".to_string(),
            timeout_secs: 60,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override settings from `XBOXTEST_*` environment variables
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override settings from a key lookup using the environment variable names
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(binary) = lookup("XBOXTEST_EMULATOR") {
            self.emulator_binary = binary;
        }

        if let Some(value) = lookup("XBOXTEST_HEADLESS") {
            self.headless = parse_bool("XBOXTEST_HEADLESS", &value)?;
        }

        if let Some(root) = lookup("XBOXTEST_SESSION_ROOT") {
            self.session_root = Some(PathBuf::from(root));
        }

        let bios = lookup("XBOXTEST_BIOS").map(PathBuf::from);
        let mcpx = lookup("XBOXTEST_MCPX_ROM").map(PathBuf::from);
        self.firmware = match (self.firmware.take(), bios, mcpx) {
            (_, Some(bios), Some(mcpx)) => Some(Firmware::new(bios, mcpx)),
            (Some(mut firmware), bios, mcpx) => {
                if let Some(bios) = bios {
                    firmware.bios = bios;
                }
                if let Some(mcpx) = mcpx {
                    firmware.mcpx_rom = mcpx;
                }
                Some(firmware)
            }
            (None, None, None) => None,
            (None, _, _) => {
                return Err(Error::Config(
                    "XBOXTEST_BIOS and XBOXTEST_MCPX_ROM must be set together".to_string(),
                ))
            }
        };

        Ok(self)
    }

    pub fn connect_policy(&self) -> RetryPolicy {
        self.connect_retry.policy()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("{} has invalid value {:?}", key, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = HarnessConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.emulator_binary, "xqemu");
        assert!(config.firmware.is_none());
        assert_eq!(config.connect_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("xboxtest.toml");
        std::fs::write(
            &path,
            r#"
headless = true

[firmware]
bios = "/roms/Complex_4627.bin"
mcpx_rom = "/roms/mcpx_1.0.bin"

[connect_retry]
max_attempts = 10
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert!(config.headless);
        let firmware = config.firmware.unwrap();
        assert!(firmware.short_animation);
        assert_eq!(firmware.bios, PathBuf::from("/roms/Complex_4627.bin"));
        assert_eq!(config.connect_retry.max_attempts, 10);
        assert_eq!(config.connect_retry.delay_ms, 50);
        assert_eq!(config.storage.username, "xbox");
    }

    #[test]
    fn test_save_load_keeps_firmware() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("xboxtest.toml");
        let config = HarnessConfig {
            firmware: Some(Firmware::new("/bios.bin", "/mcpx.bin")),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.firmware, config.firmware);
    }

    #[test]
    fn test_env_overrides() {
        let config = HarnessConfig::default()
            .apply_overrides(lookup(&[
                ("XBOXTEST_EMULATOR", "/opt/xqemu/bin/xqemu"),
                ("XBOXTEST_HEADLESS", "1"),
                ("XBOXTEST_BIOS", "/b.bin"),
                ("XBOXTEST_MCPX_ROM", "/m.bin"),
            ]))
            .unwrap();

        assert_eq!(config.emulator_binary, "/opt/xqemu/bin/xqemu");
        assert!(config.headless);
        assert_eq!(config.firmware, Some(Firmware::new("/b.bin", "/m.bin")));
    }

    #[test]
    fn test_env_half_firmware_rejected() {
        let err = HarnessConfig::default()
            .apply_overrides(lookup(&[("XBOXTEST_BIOS", "/b.bin")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Overriding one file of existing firmware is fine
        let config = HarnessConfig {
            firmware: Some(Firmware::new("/old.bin", "/m.bin")),
            ..Default::default()
        }
        .apply_overrides(lookup(&[("XBOXTEST_BIOS", "/new.bin")]))
        .unwrap();
        assert_eq!(config.firmware.unwrap().bios, PathBuf::from("/new.bin"));
    }

    #[test]
    fn test_invalid_headless_value() {
        let err = HarnessConfig::default()
            .apply_overrides(lookup(&[("XBOXTEST_HEADLESS", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
