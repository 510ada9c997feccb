//! Smoke tests against a real emulator
//!
//! Skipped unless firmware is configured (flags, `XBOXTEST_*` variables or a
//! config file). Run with: cargo test --package xboxtest-harness --test live -- --bios ... --mcpx-rom ...

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xboxtest_harness::{
    ControllerButton, Firmware, Harness, HarnessConfig, InstanceOptions, InstanceRunner,
    Modification, StorageEditor,
};

#[derive(Parser, Debug)]
#[command(name = "xboxtest-live")]
#[command(about = "Smoke tests for the xboxtest harness against a real emulator")]
struct Args {
    /// Harness configuration file
    #[arg(short, long, default_value = "xboxtest.toml")]
    config: PathBuf,

    /// Emulator binary
    #[arg(long)]
    emulator: Option<String>,

    /// BIOS image
    #[arg(long)]
    bios: Option<PathBuf>,

    /// MCPX boot ROM
    #[arg(long)]
    mcpx_rom: Option<PathBuf>,

    /// Run instances without a window
    #[arg(long)]
    headless: bool,

    /// Blank formatted hard drive image
    #[arg(long)]
    blank_image: Option<PathBuf>,

    /// Disc that boots into a file transfer server
    #[arg(long)]
    editor_disc: Option<PathBuf>,

    /// Disc that prints "Hello world! Output count: <n>" over the serial port
    #[arg(long)]
    kernel_debug_disc: Option<PathBuf>,

    // Arguments cargo passes to every test binary
    #[arg(long, hide = true)]
    nocapture: bool,
    #[arg(hide = true)]
    filter: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    match rt.block_on(async_main(args)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<HarnessConfig> {
    let mut config = HarnessConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .apply_env()?;

    if let Some(emulator) = &args.emulator {
        config.emulator_binary = emulator.clone();
    }
    match (&args.bios, &args.mcpx_rom) {
        (Some(bios), Some(mcpx)) => config.firmware = Some(Firmware::new(bios, mcpx)),
        (None, None) => {}
        _ => bail!("--bios and --mcpx-rom must be given together"),
    }
    config.headless |= args.headless;
    if args.blank_image.is_some() {
        config.storage.blank_image = args.blank_image.clone();
    }
    if args.editor_disc.is_some() {
        config.storage.editor_disc = args.editor_disc.clone();
    }
    Ok(config)
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    if config.firmware.is_none() {
        warn!("No firmware configured, skipping live tests");
        return Ok(());
    }
    let harness = Harness::new(config)?;

    boot_and_screenshot(&harness).await.context("boot")?;

    match &args.kernel_debug_disc {
        Some(disc) => kernel_debug_output(&harness, disc).await.context("kernel debug")?,
        None => info!("No kernel debug disc, skipping debug output test"),
    }

    let storage = &harness.config().storage;
    if storage.blank_image.is_some() && storage.editor_disc.is_some() {
        template_round_trip(&harness).await.context("templates")?;
    } else {
        info!("No blank image or editor disc, skipping template test");
    }

    info!("Live tests passed");
    Ok(())
}

async fn fresh_options(harness: &Arc<Harness>) -> anyhow::Result<InstanceOptions> {
    let options = InstanceOptions::default();
    if harness.config().storage.blank_image.is_none() {
        return Ok(options);
    }
    let image = harness.blank_template().await?.create_fresh_instance().await?;
    Ok(options.with_storage_image(image))
}

async fn boot_and_screenshot(harness: &Arc<Harness>) -> anyhow::Result<()> {
    let mut runner = InstanceRunner::new(harness, fresh_options(harness).await?)?;
    let path = runner
        .run(|runner| {
            Box::pin(async move {
                let status = runner.control().await?.query_status().await?;
                if !status.running {
                    return Err(xboxtest_harness::Error::Internal(format!(
                        "machine is {} after boot",
                        status.status
                    )));
                }
                runner.press_buttons(&[ControllerButton::A], Some(Duration::from_millis(150))).await?;
                let path = runner.save_screenshot("boot.ppm").await?;
                runner.reset().await?;
                Ok(path)
            })
        })
        .await?;

    if !path.is_file() {
        bail!("screenshot {} was not written", path.display());
    }
    info!("boot: ok ({})", path.display());
    Ok(())
}

async fn kernel_debug_output(harness: &Arc<Harness>, disc: &std::path::Path) -> anyhow::Result<()> {
    let options = fresh_options(harness).await?.with_removable_media(disc);
    let mut runner = InstanceRunner::new(harness, options)?;
    runner
        .run(|runner| {
            Box::pin(async move {
                let debug = runner.debug_stream()?;
                for count in 1..10 {
                    let line = debug.read_line().await?;
                    let expected = format!("Hello world! Output count: {}\n", count);
                    if line != expected {
                        return Err(xboxtest_harness::Error::Internal(format!(
                            "expected {:?}, got {:?}",
                            expected, line
                        )));
                    }
                }
                Ok(())
            })
        })
        .await?;
    info!("kernel debug: ok");
    Ok(())
}

async fn template_round_trip(harness: &Arc<Harness>) -> anyhow::Result<()> {
    let blank = harness.blank_template().await?;
    let template = blank
        .create_child(
            "live_files",
            vec![
                Modification::add_directory("/E/live/"),
                Modification::add_file("/E/live/hello.txt", "hello from the host"),
            ],
        )
        .await?;

    let image = template.create_fresh_instance().await?;
    let mut editor = StorageEditor::open(harness, &image).await?;
    let contents = editor.file_contents("/E/live/hello.txt").await;
    let listing = editor.directory_contents("/E/live/").await;
    editor.close().await?;

    if &contents?[..] != b"hello from the host" {
        bail!("file contents differ in {}", image.display());
    }
    info!("templates: ok ({:?})", listing?);
    Ok(())
}
