//! In-process stand-ins for the emulator, qemu-img and the storage editor

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use xboxtest_harness::config::RetryConfig;
use xboxtest_harness::{
    DirEntry, EditorOpener, EmulatorCommand, EmulatorProcess, Error, Firmware, Harness,
    HarnessConfig, ImageCloner, ProcessLauncher, RemoteFs, Result, StorageEditor,
};

/// Session config with firmware set and short connect retries
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        firmware: Some(Firmware::new("/roms/bios.bin", "/roms/mcpx.bin")),
        connect_retry: RetryConfig {
            max_attempts: 100,
            delay_ms: 10,
        },
        ..Default::default()
    }
}

/// Pretends to be the emulator: serves scripted serial output on the debug
/// port and a QMP server on the control port. The process itself is `sleep`.
#[derive(Clone)]
pub struct FakeEmulator {
    debug_chunks: Arc<Vec<Vec<u8>>>,
    serve_debug: bool,
    commands: Arc<Mutex<Vec<Value>>>,
    launches: Arc<Mutex<Vec<EmulatorCommand>>>,
}

impl FakeEmulator {
    pub fn new() -> Self {
        Self::with_debug_output(&[])
    }

    pub fn with_debug_output(chunks: &[&[u8]]) -> Self {
        Self {
            debug_chunks: Arc::new(chunks.iter().map(|c| c.to_vec()).collect()),
            serve_debug: true,
            commands: Arc::default(),
            launches: Arc::default(),
        }
    }

    /// Never opens the debug port
    pub fn without_debug_listener() -> Self {
        Self {
            serve_debug: false,
            ..Self::new()
        }
    }

    /// QMP commands received so far, capability negotiation excluded
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().clone()
    }

    pub fn launches(&self) -> Vec<EmulatorCommand> {
        self.launches.lock().clone()
    }
}

impl ProcessLauncher for FakeEmulator {
    fn launch(&self, command: &EmulatorCommand) -> Result<EmulatorProcess> {
        self.launches.lock().push(command.clone());

        if self.serve_debug {
            let listener = bind(command.ports.debug)?;
            let chunks = Arc::clone(&self.debug_chunks);
            tokio::spawn(async move {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                for chunk in chunks.iter() {
                    if stream.write_all(chunk).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                // Keep the serial port open like the emulator does
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }

        let listener = bind(command.ports.control)?;
        tokio::spawn(serve_qmp(listener, Arc::clone(&self.commands)));

        let child = Command::new("sleep").arg("30").spawn()?;
        Ok(EmulatorProcess::new(child))
    }
}

fn bind(port: u16) -> Result<TcpListener> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

async fn serve_qmp(listener: TcpListener, commands: Arc<Mutex<Vec<Value>>>) {
    let Ok((stream, _)) = listener.accept().await else { return };
    let mut stream = BufReader::new(stream);

    let greeting = json!({"QMP": {"version": {"qemu": {"major": 4, "minor": 0, "micro": 0}}, "capabilities": []}});
    if send(&mut stream, &greeting).await.is_err() {
        return;
    }

    loop {
        let mut line = String::new();
        match stream.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Ok(command) = serde_json::from_str::<Value>(&line) else { return };
        let name = command["execute"].as_str().unwrap_or_default().to_string();
        let mut reply = json!({"return": {}});

        match name.as_str() {
            "qmp_capabilities" => {}
            "screendump" => {
                if let Some(path) = command["arguments"]["filename"].as_str() {
                    let _ = std::fs::write(path, b"P6\n1 1\n255\n\x00\x00\x00");
                }
                commands.lock().push(command.clone());
            }
            "system_reset" => {
                commands.lock().push(command.clone());
                let event = json!({"event": "RESET", "timestamp": {"seconds": 0, "microseconds": 0}});
                if send(&mut stream, &event).await.is_err() {
                    return;
                }
            }
            "query-status" => {
                commands.lock().push(command.clone());
                reply = json!({"return": {"running": true, "singlestep": false, "status": "running"}});
            }
            _ => commands.lock().push(command.clone()),
        }

        if send(&mut stream, &reply).await.is_err() {
            return;
        }
    }
}

async fn send(stream: &mut BufReader<tokio::net::TcpStream>, message: &Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await
}

/// Directory standing in for the filesystem inside an image
pub fn tree_of(image: &Path) -> PathBuf {
    let mut path = image.as_os_str().to_owned();
    path.push(".fs");
    PathBuf::from(path)
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Copies the image file and its tree
#[derive(Clone, Default)]
pub struct CopyCloner {
    calls: Arc<AtomicUsize>,
}

impl CopyCloner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageCloner for CopyCloner {
    fn clone_image(&self, base: &Path, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::copy(base, dest)?;
        if tree_of(base).is_dir() {
            copy_tree(&tree_of(base), &tree_of(dest))?;
        }
        Ok(())
    }
}

/// Opens editors that work directly on an image's tree
#[derive(Clone, Default)]
pub struct DirEditorOpener {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl DirEditorOpener {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EditorOpener for DirEditorOpener {
    async fn open(&self, _harness: &Arc<Harness>, image: &Path) -> Result<StorageEditor> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let root = tree_of(image);
        std::fs::create_dir_all(&root)?;
        Ok(StorageEditor::new(Box::new(LocalFs {
            root,
            closed: Arc::clone(&self.closed),
        })))
    }
}

/// Device paths mapped onto a host directory, one subdirectory per drive
pub struct LocalFs {
    root: PathBuf,
    closed: Arc<AtomicUsize>,
}

impl LocalFs {
    fn host(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RemoteFs for LocalFs {
    async fn store(&mut self, path: &str, data: &[u8]) -> Result<()> {
        Ok(std::fs::write(self.host(path), data)?)
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.host(path))?)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = vec![
            DirEntry { name: ".".to_string(), is_dir: true },
            DirEntry { name: "..".to_string(), is_dir: true },
        ];
        for entry in std::fs::read_dir(self.host(path))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(entries)
    }

    async fn name_list(&mut self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(self.host(path))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        Ok(names)
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        Ok(std::fs::remove_file(self.host(path))?)
    }

    async fn remove_dir(&mut self, path: &str) -> Result<()> {
        // Like the guest server, only empty directories can be removed
        Ok(std::fs::remove_dir(self.host(path))?)
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        Ok(std::fs::create_dir(self.host(path))?)
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        Ok(std::fs::rename(self.host(from), self.host(to))?)
    }

    async fn quit(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A base image with empty C and E drives
pub fn blank_image(dir: &TempDir) -> PathBuf {
    let image = dir.path().join("blank hdd.qcow2");
    std::fs::write(&image, b"qcow2").unwrap();
    for drive in ["C", "E"] {
        std::fs::create_dir_all(tree_of(&image).join(drive)).unwrap();
    }
    image
}

pub fn storage_harness(cloner: &CopyCloner, opener: &DirEditorOpener) -> Arc<Harness> {
    Harness::builder(test_config())
        .image_cloner(cloner.clone())
        .editor_opener(opener.clone())
        .build()
        .unwrap()
}

pub fn is_io_error(err: &Error) -> bool {
    matches!(err, Error::Io(_))
}
