//! QMP (QEMU Machine Protocol) client implementation
//!
//! Provides async communication with the emulator's control channel over TCP.

use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// QMP client for emulator control
pub struct QmpClient {
    address: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl QmpClient {
    /// Create a new QMP client (does not connect)
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the QMP port
    pub async fn connect(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.address).await?;
        let mut reader = BufReader::new(stream);

        // Read greeting
        let line = read_message(&mut reader).await?;
        trace!("QMP greeting: {}", line.trim());

        let greeting: QmpMessage = serde_json::from_str(&line)
            .map_err(|e| Error::Qmp(format!("Invalid greeting: {}", e)))?;

        if greeting.qmp.is_none() {
            return Err(Error::Qmp("Invalid QMP greeting".to_string()));
        }

        // Send capabilities negotiation
        let negotiate = QmpCommand {
            execute: "qmp_capabilities".to_string(),
            arguments: None::<()>,
        };
        write_command(reader.get_mut(), &negotiate).await?;

        let line = read_message(&mut reader).await?;
        trace!("QMP capabilities response: {}", line.trim());

        let response: QmpResponse<serde_json::Value> = serde_json::from_str(&line)
            .map_err(|e| Error::Qmp(format!("Invalid response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(Error::Qmp(format!(
                "Capabilities negotiation failed: {}: {}",
                error.class, error.desc
            )));
        }

        *self.stream.lock().await = Some(reader);
        debug!("Connected to QMP at {}", self.address);

        Ok(())
    }

    /// Connect, retrying while the emulator has not opened its listener yet
    pub async fn connect_with_retry(&self, policy: &RetryPolicy) -> Result<()> {
        policy
            .retry(&format!("QMP connect to {}", self.address), || self.connect())
            .await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Execute a QMP command
    pub async fn execute<A: Serialize, R: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<A>,
    ) -> Result<R> {
        let mut guard = self.stream.lock().await;
        let reader = guard.as_mut().ok_or_else(|| Error::Qmp("Not connected".to_string()))?;

        let cmd = QmpCommand {
            execute: command.to_string(),
            arguments,
        };
        write_command(reader.get_mut(), &cmd).await?;

        // Read response (skip events)
        loop {
            let line = read_message(reader).await?;
            trace!("QMP response: {}", line.trim());

            let value: serde_json::Value = serde_json::from_str(&line)
                .map_err(|e| Error::Qmp(format!("Invalid response: {}", e)))?;
            if value.get("event").is_some() {
                continue;
            }

            let response: QmpResponse<R> = serde_json::from_value(value)
                .map_err(|e| Error::Qmp(format!("Invalid response: {}", e)))?;

            if let Some(error) = response.error {
                return Err(Error::Qmp(format!("{}: {}", error.class, error.desc)));
            }

            return response.result.ok_or_else(|| Error::Qmp("No return value".to_string()));
        }
    }

    /// Execute a command with no return value
    pub async fn execute_void<A: Serialize>(&self, command: &str, arguments: Option<A>) -> Result<()> {
        let _: serde_json::Value = self.execute(command, arguments).await?;
        Ok(())
    }

    /// Execute an arbitrary named command with JSON arguments
    pub async fn command(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let arguments = match arguments {
            serde_json::Value::Null => None,
            other => Some(other),
        };
        self.execute(name, arguments).await
    }

    /// Run state of the emulated machine
    pub async fn query_status(&self) -> Result<VmStatus> {
        self.execute("query-status", None::<()>).await
    }

    /// System reset
    pub async fn system_reset(&self) -> Result<()> {
        self.execute_void("system_reset", None::<()>).await
    }

    /// Send key event, optionally holding the keys for `hold_time_ms`
    pub async fn send_key(&self, keys: &[&str], hold_time_ms: Option<u32>) -> Result<()> {
        #[derive(Serialize)]
        struct KeyValue {
            #[serde(rename = "type")]
            key_type: String,
            data: String,
        }

        #[derive(Serialize)]
        struct Args {
            keys: Vec<KeyValue>,
            #[serde(rename = "hold-time", skip_serializing_if = "Option::is_none")]
            hold_time: Option<u32>,
        }

        let args = Args {
            keys: keys
                .iter()
                .map(|k| KeyValue {
                    key_type: "qcode".to_string(),
                    data: k.to_string(),
                })
                .collect(),
            hold_time: hold_time_ms,
        };

        self.execute_void("send-key", Some(args)).await
    }

    /// Dump the framebuffer to a PPM file on the host
    pub async fn screendump(&self, filename: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Args {
            filename: String,
        }

        self.execute_void(
            "screendump",
            Some(Args {
                filename: filename.to_string(),
            }),
        )
        .await
    }

    /// Close the connection
    pub async fn close(&self) {
        let mut guard = self.stream.lock().await;
        *guard = None;
    }
}

async fn write_command<A: Serialize>(stream: &mut TcpStream, command: &QmpCommand<A>) -> Result<()> {
    let cmd = serde_json::to_string(command)?;
    trace!("QMP command: {}", cmd);
    stream.write_all(cmd.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::ConnectionClosed("QMP peer closed the connection".to_string()));
    }
    Ok(line)
}

// QMP protocol types
#[derive(Debug, Serialize)]
struct QmpCommand<A> {
    execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<A>,
}

#[derive(Debug, Deserialize)]
struct QmpMessage {
    #[serde(rename = "QMP")]
    qmp: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QmpResponse<T> {
    #[serde(rename = "return")]
    result: Option<T>,
    error: Option<QmpError>,
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

/// Reply to `query-status`
#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub running: bool,
    /// `running`, `paused`, `shutdown`, ...
    pub status: String,
}
