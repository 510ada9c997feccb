//! FTP client for the file transfer server running inside the guest
//!
//! The guest sits behind the emulator's user-mode network, where only the
//! control port is forwarded. Data connections therefore use active mode, and
//! the address announced in `PORT` is the host gateway as seen from the guest
//! rather than our own local address.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};
use xboxtest_common::{Error, Result, RetryPolicy};

/// Login for the guest's file transfer server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

impl DirEntry {
    /// Parse a `LIST` line: mode, five fields, then the name (which may contain spaces)
    pub fn parse_list_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 8 {
            return None;
        }
        Some(Self {
            name: fields[7..].join(" "),
            is_dir: fields[0].starts_with('d'),
        })
    }
}

/// Directory and file operations on the emulated machine's storage.
///
/// Paths are device paths of the form `/<DRIVE>/<path>`.
#[async_trait]
pub trait RemoteFs: Send {
    async fn store(&mut self, path: &str, data: &[u8]) -> Result<()>;
    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>>;
    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>>;
    async fn name_list(&mut self, path: &str) -> Result<Vec<String>>;
    async fn delete(&mut self, path: &str) -> Result<()>;
    async fn remove_dir(&mut self, path: &str) -> Result<()>;
    async fn make_dir(&mut self, path: &str) -> Result<()>;
    async fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    async fn quit(&mut self) -> Result<()>;
}

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn into_error(self) -> Error {
        Error::Ftp {
            code: self.code,
            message: self.text,
        }
    }

    fn expect(self, codes: &[u16]) -> Result<Reply> {
        if codes.contains(&self.code) {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }
}

/// Active-mode FTP client
pub struct FtpClient {
    control: BufReader<TcpStream>,
    address: String,
    gateway: Ipv4Addr,
    timeout: Duration,
}

impl FtpClient {
    /// Connect and read the server greeting
    pub async fn connect(host: &str, port: u16, gateway: Ipv4Addr, timeout: Duration) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| timed_out(&format!("connect to {}", address), timeout))??;

        let mut client = Self {
            control: BufReader::new(stream),
            address,
            gateway,
            timeout,
        };

        let mut greeting = client.read_reply().await?;
        // 120: ready in a moment, a 220 follows
        if greeting.code == 120 {
            greeting = client.read_reply().await?;
        }
        let greeting = greeting.expect(&[220])?;
        debug!("FTP connected to {}: {}", client.address, greeting.text);
        Ok(client)
    }

    /// Connect, retrying while the guest server is not accepting yet.
    ///
    /// The emulator accepts on the forwarded port before the guest listens, so
    /// early attempts see the connection closed or reset rather than refused.
    pub async fn connect_with_retry(
        host: &str,
        port: u16,
        gateway: Ipv4Addr,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        policy
            .retry(&format!("FTP connect to {}:{}", host, port), || {
                Self::connect(host, port, gateway, timeout)
            })
            .await
    }

    pub async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        let reply = self
            .command(&format!("USER {}", credentials.username))
            .await?
            .expect(&[230, 331])?;
        if reply.code == 331 {
            self.command(&format!("PASS {}", credentials.password))
                .await?
                .expect(&[230, 202])?;
        }
        debug!("FTP logged in to {} as {}", self.address, credentials.username);
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        if line.starts_with("PASS ") {
            trace!("FTP > PASS ****");
        } else {
            trace!("FTP > {}", line);
        }

        let stream = self.control.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;

        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let first = self.read_control_line().await?;
        let code = first
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| Error::Ftp {
                code: 0,
                message: format!("malformed reply {:?}", first),
            })?;
        let mut text = first.get(4..).unwrap_or_default().to_string();

        // Multi-line reply: "123-..." up to a line starting "123 "
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let line = self.read_control_line().await?;
                text.push('\n');
                text.push_str(&line);
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }

        Ok(Reply { code, text })
    }

    async fn read_control_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.timeout, self.control.read_line(&mut line))
            .await
            .map_err(|_| timed_out("FTP reply", self.timeout))??;
        if n == 0 {
            return Err(Error::ConnectionClosed(format!(
                "FTP server at {} closed the connection",
                self.address
            )));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("FTP < {}", line);
        Ok(line)
    }

    /// Run a command that moves data over a separate connection opened by the server
    async fn transfer(&mut self, command: &str, upload: Option<&[u8]>, binary: bool) -> Result<Vec<u8>> {
        self.command(if binary { "TYPE I" } else { "TYPE A" })
            .await?
            .expect(&[200])?;

        let local_ip = self.control.get_ref().local_addr()?.ip();
        let listener = TcpListener::bind((local_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        let [a, b, c, d] = self.gateway.octets();
        self.command(&format!(
            "PORT {},{},{},{},{},{}",
            a,
            b,
            c,
            d,
            port >> 8,
            port & 0xff
        ))
        .await?
        .expect(&[200])?;

        self.command(command).await?.expect(&[125, 150])?;

        let (mut data, _) = tokio::time::timeout(self.timeout, listener.accept())
            .await
            .map_err(|_| timed_out("FTP data connection", self.timeout))??;

        let mut received = Vec::new();
        match upload {
            Some(bytes) => {
                data.write_all(bytes).await?;
                data.shutdown().await?;
            }
            None => {
                data.read_to_end(&mut received).await?;
            }
        }
        drop(data);

        self.read_reply().await?.expect(&[226, 250])?;
        Ok(received)
    }
}

#[async_trait]
impl RemoteFs for FtpClient {
    async fn store(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.transfer(&format!("STOR {}", path), Some(data), true).await?;
        Ok(())
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>> {
        self.transfer(&format!("RETR {}", path), None, true).await
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let raw = self.transfer(&format!("LIST {}", path), None, false).await?;
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(DirEntry::parse_list_line)
            .collect())
    }

    async fn name_list(&mut self, path: &str) -> Result<Vec<String>> {
        let raw = self.transfer(&format!("NLST {}", path), None, false).await?;
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        self.command(&format!("DELE {}", path)).await?.expect(&[250])?;
        Ok(())
    }

    async fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.command(&format!("RMD {}", path)).await?.expect(&[250])?;
        Ok(())
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.command(&format!("MKD {}", path))
            .await?
            .expect(&[250, 257])?;
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.command(&format!("RNFR {}", from)).await?.expect(&[350])?;
        self.command(&format!("RNTO {}", to)).await?.expect(&[250])?;
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        self.command("QUIT").await?.expect(&[221])?;
        Ok(())
    }
}

// Never retried
fn timed_out(what: &str, timeout: Duration) -> Error {
    Error::Timeout(format!("{} after {:?}", what, timeout))
}
