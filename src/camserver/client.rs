//! TCP client for the controller server
//!
//! Request/reply pairing assumes strict alternation on one connection, so
//! every operation takes `&mut self`. Share the client behind a mutex (see
//! [`crate::controller::MagController`]) when several callers need it.

use std::fmt::Display;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::reply::{classify_reply, Reply, ReplyStatus};
use crate::common::{CameraError, CameraResult, ErrorStatus};
use crate::config::CamServerConfig;

/// Default request terminator
pub const DEFAULT_TERMINATOR: &str = "\n";

/// Parameter synthesized from the simulated exposure in demo mode
const EXPOSURE_TIME_REMAINING: &str = "ExposureTimeRemaining";

/// Name of a file uploaded to the controller server
///
/// Consumed by [`CameraServerClient::load_file`], which also deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "uploaded files should be loaded or deleted"]
pub struct RemoteFile {
    name: String,
}

impl RemoteFile {
    pub fn from_name(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Client for one controller server connection
///
/// Connects lazily on the first command and reconnects after a transport
/// failure.
pub struct CameraServerClient {
    config: CamServerConfig,
    stream: Option<BufReader<TcpStream>>,
    status: ErrorStatus,
    simulated_exposure_time: f64,
}

impl CameraServerClient {
    /// Create a client; no connection is made yet
    pub fn new(config: CamServerConfig, status: ErrorStatus) -> Self {
        Self {
            config,
            stream: None,
            status,
            simulated_exposure_time: 0.0,
        }
    }

    /// Point the client at another controller server
    pub fn configure(&mut self, host: impl Into<String>, port: u16) {
        self.config.host = host.into();
        self.config.port = port;
        self.disconnect();
        info!(address = %self.config.address(), "Controller server endpoint set");
    }

    pub fn config(&self) -> &CamServerConfig {
        &self.config
    }

    pub fn is_demo(&self) -> bool {
        self.config.demo
    }

    /// Exposure time used to synthesize `ExposureTimeRemaining` in demo mode
    pub fn set_simulated_exposure_time(&mut self, seconds: f64) {
        self.simulated_exposure_time = seconds;
    }

    pub fn error_status(&self) -> &ErrorStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Drop the local end of the connection
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(address = %self.config.address(), "Controller server connection closed");
        }
    }

    /// Send a command with the default terminator and wait for the reply
    pub async fn command(&mut self, text: &str) -> CameraResult<Reply> {
        self.command_with_terminator(text, DEFAULT_TERMINATOR).await
    }

    /// Send a command with an explicit terminator and wait for the reply
    pub async fn command_with_terminator(
        &mut self,
        text: &str,
        terminator: &str,
    ) -> CameraResult<Reply> {
        if self.config.demo {
            return Ok(Reply::from_fields(["DEMO", "0"]));
        }

        debug!(command = text, "Sending command");
        let payload = format!("{}{}", text, terminator);
        let line = self.exchange(payload.as_bytes()).await?;
        let reply = Reply::parse(&line);
        debug!(command = text, reply = %reply, "Received reply");
        Ok(reply)
    }

    /// Echo a message from the controller server
    pub async fn echo(&mut self, message: &str) -> CameraResult<Reply> {
        self.command(&format!("Echo \"{}\"", message)).await
    }

    /// Connectivity check
    pub async fn test(&mut self) -> CameraResult<Reply> {
        self.echo("This is a ControllerServer test message.").await
    }

    /// Send a binary buffer to be written on the controller server's file system
    pub async fn upload_file(&mut self, buffer: &[u8]) -> CameraResult<RemoteFile> {
        let ack = self
            .command(&format!("cmd UploadFile {}", buffer.len()))
            .await?;

        if self.config.demo {
            return Ok(RemoteFile::from_name(""));
        }

        let status = self.classify_reply(Some(&ack));
        if status.is_error {
            return Err(CameraError::protocol(format!(
                "UploadFile rejected: {}",
                status.message
            )));
        }

        let line = self.exchange(buffer).await?;
        if let Reply::Error { message } = Reply::parse(&line) {
            return Err(CameraError::protocol(format!(
                "UploadFile failed: {}",
                message
            )));
        }

        let name = line
            .split(' ')
            .nth(1)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                CameraError::protocol(format!("Malformed UploadFile reply: {}", line.trim()))
            })?;

        info!(bytes = buffer.len(), file = name, "Uploaded file to controller server");
        Ok(RemoteFile::from_name(name))
    }

    /// Load an uploaded DSP code file into `board`
    ///
    /// The remote file is deleted afterwards whether or not the load worked.
    pub async fn load_file(&mut self, board: u32, file: RemoteFile) -> CameraResult<()> {
        let filename = file.name;
        let reply = self
            .command(&format!("LoadFile {} {}", board, filename))
            .await;

        if let Err(e) = self.delete_file(&filename).await {
            warn!(file = %filename, error = %e, "Failed to delete uploaded file");
        }

        let reply = reply?;
        let status = self.classify_reply(Some(&reply));
        if status.is_error {
            return Err(CameraError::protocol(format!(
                "LoadFile {}: {}",
                filename, status.message
            )));
        }

        info!(board, file = %filename, "Loaded file");
        Ok(())
    }

    /// Delete a file uploaded to the controller server
    ///
    /// A refusal by the server comes back as an error [`Reply`].
    pub async fn delete_file(&mut self, filename: &str) -> CameraResult<Reply> {
        self.command(&format!("cmd DeleteFile {}", filename)).await
    }

    /// Set a controller server parameter
    pub async fn set_parameter(&mut self, name: &str, value: impl Display) -> CameraResult<Reply> {
        self.command(&format!("Set {} {}", name, value)).await
    }

    /// Read a controller server parameter
    pub async fn get_parameter(&mut self, name: &str) -> CameraResult<Reply> {
        if self.config.demo {
            let value = if name == EXPOSURE_TIME_REMAINING {
                ((self.simulated_exposure_time * 1000.0).round() as i64).to_string()
            } else {
                "0".to_string()
            };
            return Ok(Reply::from_fields(["OK".to_string(), value]));
        }

        self.command(&format!("Get {}", name)).await
    }

    /// Shut the controller server down
    pub async fn close_server(&mut self) -> CameraResult<Reply> {
        self.command("CloseServer").await
    }

    /// Restart the controller server; the connection is reset by the server
    pub async fn restart_server(&mut self) -> CameraResult<Reply> {
        let reply = self.command("RestartServer").await;
        if !self.config.demo {
            self.disconnect();
        }
        reply
    }

    /// Reset the controller server; the connection is reset by the server
    pub async fn reset_server(&mut self) -> CameraResult<Reply> {
        let reply = self.command("ResetServer").await;
        if !self.config.demo {
            self.disconnect();
        }
        reply
    }

    /// Classify a reply and record the outcome in the shared error status
    pub fn classify_reply(&self, reply: Option<&Reply>) -> ReplyStatus {
        classify_reply(reply, &self.status)
    }

    /// Write `payload` and read one reply line
    ///
    /// The connection is dropped on any failure so the next call reconnects.
    async fn exchange(&mut self, payload: &[u8]) -> CameraResult<String> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        match Self::round_trip(&mut stream, payload, self.config.read_timeout()).await {
            Ok(line) => {
                self.stream = Some(stream);
                Ok(line)
            }
            Err(e) => {
                warn!(
                    address = %self.config.address(),
                    error = %e,
                    "Controller server exchange failed"
                );
                Err(e)
            }
        }
    }

    async fn round_trip(
        stream: &mut BufReader<TcpStream>,
        payload: &[u8],
        read_timeout: Option<Duration>,
    ) -> CameraResult<String> {
        stream.get_mut().write_all(payload).await?;
        stream.get_mut().flush().await?;

        let mut line = String::new();
        let n = match read_timeout {
            Some(limit) => timeout(limit, stream.read_line(&mut line))
                .await
                .map_err(|_| CameraError::timeout(format!("no reply within {:?}", limit)))??,
            None => stream.read_line(&mut line).await?,
        };

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "controller server closed the connection",
            )
            .into());
        }
        Ok(line)
    }

    async fn connect(&self) -> CameraResult<BufReader<TcpStream>> {
        let address = self.config.address();
        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));

        match timeout(self.config.connect_timeout(), connect).await {
            Err(_) => {
                warn!(address = %address, "Timed out connecting to controller server");
                Err(CameraError::timeout(format!("connecting to {}", address)))
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(address = %address, "Controller server refused connection");
                Err(CameraError::ConnectionRefused { address })
            }
            Ok(Err(e)) => {
                warn!(address = %address, error = %e, "Failed to connect to controller server");
                Err(e.into())
            }
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                info!(address = %address, "Connected to controller server");
                Ok(BufReader::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_client() -> CameraServerClient {
        let config = CamServerConfig {
            host: "camserver.invalid".to_string(),
            demo: true,
            ..Default::default()
        };
        CameraServerClient::new(config, ErrorStatus::new())
    }

    #[tokio::test]
    async fn demo_command_returns_canned_reply() {
        let mut client = demo_client();
        let reply = client.command("Echo \"hello\"").await.unwrap();
        assert_eq!(reply, Reply::from_fields(["DEMO", "0"]));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn demo_exposure_time_remaining_in_milliseconds() {
        let mut client = demo_client();
        client.set_simulated_exposure_time(2.5);
        let reply = client.get_parameter("ExposureTimeRemaining").await.unwrap();
        assert_eq!(reply.value(), Some("2500"));

        let reply = client.get_parameter("CCDTemp").await.unwrap();
        assert_eq!(reply.value(), Some("0"));
    }

    #[tokio::test]
    async fn demo_upload_returns_empty_name() {
        let mut client = demo_client();
        let file = client.upload_file(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(file.name(), "");
        client.load_file(0, file).await.unwrap();
    }

    #[tokio::test]
    async fn demo_restart_keeps_client_usable() {
        let mut client = demo_client();
        client.restart_server().await.unwrap();
        client.reset_server().await.unwrap();
        assert!(client.command("Get Temp").await.is_ok());
    }

    #[test]
    fn configure_replaces_endpoint() {
        let mut client = demo_client();
        client.configure("10.0.1.100", 2425);
        assert_eq!(client.config().address(), "10.0.1.100:2425");
        assert!(!client.is_connected());
    }

    #[test]
    fn remote_file_name() {
        let file = RemoteFile::from_name("/tmp/upload_3.lod");
        assert_eq!(file.name(), "/tmp/upload_3.lod");
    }
}
