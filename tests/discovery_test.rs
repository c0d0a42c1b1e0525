//! UDP discovery against a mock responder on localhost

use std::sync::Arc;

use magccd_rs::config::DiscoveryConfig;
use magccd_rs::discovery::{Discovery, ID_REQUEST, NO_ADDRESS};
use parking_lot::Mutex;
use tokio::net::UdpSocket;

/// Answer every ID request with `replies`, recording the requests
async fn start_responder(replies: Vec<Vec<u8>>) -> (u16, Arc<Mutex<Vec<Vec<u8>>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let seen = requests.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            seen.lock().push(buf[..len].to_vec());
            for reply in &replies {
                socket.send_to(reply, from).await.unwrap();
            }
        }
    });

    (port, requests)
}

fn local_config(request_port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        request_port,
        reply_port: 0,
        broadcast_address: "127.0.0.1".to_string(),
        wait_ms: 300,
        controller_name: None,
    }
}

#[tokio::test]
async fn test_resolve_matching_host() {
    let (port, requests) = start_responder(vec![
        b"0 4501 guider_z1 2425 10.0.1.7 0\r\n".to_vec(),
        b"0 4501 hostX 2425 10.0.1.100 0\r\n".to_vec(),
    ])
    .await;
    let discovery = Discovery::new(local_config(port));

    let address = discovery.resolve("hostX").await.unwrap();
    assert_eq!(address, "10.0.1.100");
    assert_eq!(requests.lock().as_slice(), &[ID_REQUEST.to_vec()]);
}

#[tokio::test]
async fn test_unknown_host_returns_zero_address() {
    let (port, _) = start_responder(vec![b"0 4501 guider_z1 2425 10.0.1.7 0\r\n".to_vec()]).await;
    let discovery = Discovery::new(local_config(port));

    assert_eq!(discovery.resolve("hostX").await.unwrap(), NO_ADDRESS);
}

#[tokio::test]
async fn test_malformed_replies_are_skipped() {
    let (port, _) = start_responder(vec![
        b"garbage".to_vec(),
        vec![0xff, 0xfe, 0xfd],
        b"0 4501 hostX 2425 10.0.1.100 0\r\n".to_vec(),
    ])
    .await;
    let discovery = Discovery::new(local_config(port));

    assert_eq!(discovery.resolve("hostX").await.unwrap(), "10.0.1.100");
}

#[tokio::test]
async fn test_list_all_returns_every_reply() {
    let (port, _) = start_responder(vec![
        b"0 4501 guider_z1 2425 10.0.1.7 0\r\n".to_vec(),
        b"not an id".to_vec(),
    ])
    .await;
    let discovery = Discovery::new(local_config(port));

    let replies = discovery.list_all().await.unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].payload, b"0 4501 guider_z1 2425 10.0.1.7 0\r\n".to_vec());
    assert_eq!(replies[1].text(), Some("not an id"));
    assert_eq!(replies[0].sender.port(), port);
}
