//! Mock controller server for integration tests
//!
//! Speaks the line protocol on a localhost port and records every request.

#![allow(dead_code)] // Not every test binary uses every helper

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use magccd_rs::config::CamServerConfig;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Remote name handed out for every upload
pub const UPLOADED_FILE: &str = "/tmp/dsp_upload.lod";

/// Canned `Get ExposureTimeRemaining` value (ms)
pub const REMAINING_MS: &str = "2500";

/// Mock behaviour
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Reply line to `LoadFile`
    pub load_reply: String,
    /// Reply line to `StartReadout`
    pub readout_reply: String,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            load_reply: "OK".to_string(),
            readout_reply: "OK".to_string(),
        }
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
    pub uploads: Arc<Mutex<Vec<Vec<u8>>>>,
    pub connections: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let (req, upl, conns) = (requests.clone(), uploads.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conns.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, options.clone(), req.clone(), upl.clone()));
            }
        });

        Self {
            addr,
            requests,
            uploads,
            connections,
        }
    }

    pub fn config(&self) -> CamServerConfig {
        CamServerConfig {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            read_timeout_ms: Some(2000),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(
    stream: TcpStream,
    options: MockOptions,
    requests: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end().to_string();
        requests.lock().push(line.clone());

        let reply = if let Some(size) = line.strip_prefix("cmd UploadFile ") {
            let size: usize = size.parse().unwrap();
            writer.write_all(b"OK\n").await.unwrap();
            let mut buf = vec![0u8; size];
            reader.read_exact(&mut buf).await.unwrap();
            uploads.lock().push(buf);
            format!("OK {} \n", UPLOADED_FILE)
        } else if line.starts_with("LoadFile ") {
            format!("{}\n", options.load_reply)
        } else if line == "StartReadout" {
            format!("{}\n", options.readout_reply)
        } else if let Some(message) = line.strip_prefix("Echo ") {
            format!("OK {}\n", message)
        } else if line == "Get ExposureTimeRemaining" {
            format!("OK {}\n", REMAINING_MS)
        } else if line == "Get Bogus" {
            "ERROR unknown parameter Bogus\n".to_string()
        } else if line == "Hang" {
            // Never answer
            continue;
        } else if line == "RestartServer" || line == "ResetServer" {
            let _ = writer.write_all(b"OK\n").await;
            return;
        } else {
            "OK\n".to_string()
        };

        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}
