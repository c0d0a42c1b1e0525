//! UDP discovery of controller servers
//!
//! An identification request (`0\r\n`) is broadcast to the request port and
//! every reply arriving on the reply port within the collection window is
//! kept. Reply payloads are whitespace separated with a fixed layout:
//!
//! ```text
//! 0 4501 guider_z1 2425 10.0.1.100 0
//!        ^ field 2: host name
//!                       ^ field 4: IP address
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::common::CameraResult;
use crate::config::DiscoveryConfig;

/// Identification request payload
pub const ID_REQUEST: &[u8] = b"0\r\n";

/// Returned when no controller server matches
pub const NO_ADDRESS: &str = "0.0.0.0";

const HOST_FIELD: usize = 2;
const IP_FIELD: usize = 4;
const MAX_DATAGRAM: usize = 1024;

/// One identification reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    /// Raw datagram payload
    pub payload: Vec<u8>,
    pub sender: SocketAddr,
}

impl DiscoveryReply {
    /// Payload as text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// IP address in `payload` if its host name field equals `host_name`
pub fn match_reply<'a>(payload: &'a str, host_name: &str) -> Option<&'a str> {
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match (fields.get(HOST_FIELD), fields.get(IP_FIELD)) {
        (Some(host), Some(ip)) if *host == host_name => Some(*ip),
        _ => None,
    }
}

/// Where identification replies are received from
#[async_trait]
trait ReplySource: Sync {
    async fn recv_reply(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl ReplySource for UdpSocket {
    async fn recv_reply(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Gather replies from `source` until `deadline`
///
/// A failed receive is logged and skipped; only the deadline ends collection.
async fn gather(source: &impl ReplySource, deadline: Instant) -> Vec<DiscoveryReply> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut replies = Vec::new();

    loop {
        match timeout_at(deadline, source.recv_reply(&mut buf)).await {
            Err(_) => break,
            Ok(Ok((len, sender))) => {
                debug!(%sender, bytes = len, "ID reply");
                replies.push(DiscoveryReply {
                    payload: buf[..len].to_vec(),
                    sender,
                });
            }
            Ok(Err(e)) => warn!(error = %e, "Discovery receive failed"),
        }
    }

    replies
}

/// Discovery client
#[derive(Debug, Clone)]
pub struct Discovery {
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Resolve `host_name` within the configured window
    pub async fn resolve(&self, host_name: &str) -> CameraResult<String> {
        self.resolve_within(host_name, self.config.wait()).await
    }

    /// Resolve `host_name` to an IP address
    ///
    /// Returns [`NO_ADDRESS`] when nothing matches. When several replies
    /// match, the last one wins.
    pub async fn resolve_within(&self, host_name: &str, wait: Duration) -> CameraResult<String> {
        info!(host = host_name, "Resolving controller server address");

        let replies = self.collect(wait).await?;
        if replies.is_empty() {
            error!(host = host_name, "No controller IDs received");
            return Ok(NO_ADDRESS.to_string());
        }

        let address = replies
            .iter()
            .filter_map(DiscoveryReply::text)
            .filter_map(|payload| match_reply(payload, host_name))
            .last()
            .unwrap_or(NO_ADDRESS)
            .to_string();

        if address == NO_ADDRESS {
            warn!(host = host_name, replies = replies.len(), "Controller server not found");
        } else {
            info!(host = host_name, address = %address, "Resolved controller server");
        }
        Ok(address)
    }

    /// Every reply received within the configured window
    pub async fn list_all(&self) -> CameraResult<Vec<DiscoveryReply>> {
        self.collect(self.config.wait()).await
    }

    /// Broadcast the request and gather replies until the deadline
    ///
    /// The socket is dropped on every return path.
    async fn collect(&self, wait: Duration) -> CameraResult<Vec<DiscoveryReply>> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.reply_port)).await?;
        socket.set_broadcast(true)?;

        let target = (self.config.broadcast_address.as_str(), self.config.request_port);
        socket.send_to(ID_REQUEST, target).await?;
        debug!(
            address = %self.config.broadcast_address,
            port = self.config.request_port,
            "Sent ID request"
        );

        Ok(gather(&socket, Instant::now() + wait).await)
    }
}
