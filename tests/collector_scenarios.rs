//! End-to-end scenarios against a live collector on loopback.

mod common;

use common::{settle, test_config, within, ZX_LOGIN_ACK, ZX_LOGIN_FRAME};
use locsrv::bus::{now, Bcast, PushClient, Resp, SubClient};
use locsrv::collector::Collector;
use locsrv::proto::zx303;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Harness {
    device_addr: String,
    publish_addr: String,
    pull_addr: String,
}

async fn start_collector() -> Harness {
    let conf = test_config();
    let collector = Collector::bind(&conf).await.unwrap();
    let harness = Harness {
        device_addr: format!("127.0.0.1:{}", collector.device_addr().unwrap().port()),
        publish_addr: collector.publish_addr().to_string(),
        pull_addr: collector.pull_addr().to_string(),
    };
    tokio::spawn(collector.serve());
    harness
}

async fn read_reply(sock: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    within(sock.read_exact(&mut buf)).await.unwrap();
    buf
}

#[tokio::test]
async fn login_is_acked_and_published_both_ways() {
    let harness = start_collector().await;
    let mut sub = SubClient::new(harness.publish_addr.clone());
    sub.subscribe(b"").await;
    settle().await;

    let mut sock = TcpStream::connect(&harness.device_addr).await.unwrap();
    sock.write_all(ZX_LOGIN_FRAME).await.unwrap();

    let ack = read_reply(&mut sock, ZX_LOGIN_ACK.len()).await;
    assert_eq!(ack, ZX_LOGIN_ACK);

    let incoming = Bcast::decode(&within(sub.recv()).await).unwrap();
    assert!(incoming.is_incoming);
    assert_eq!(incoming.proto, "ZX:LOGIN");
    assert_eq!(incoming.imei.as_deref(), Some("3590001234567890"));
    assert_eq!(incoming.packet, ZX_LOGIN_FRAME[2..ZX_LOGIN_FRAME.len() - 2]);

    let outgoing = Bcast::decode(&within(sub.recv()).await).unwrap();
    assert!(!outgoing.is_incoming);
    assert_eq!(outgoing.proto, "ZX:LOGIN");
    assert_eq!(outgoing.imei.as_deref(), Some("3590001234567890"));
    assert_eq!(outgoing.packet, ZX_LOGIN_ACK[2..ZX_LOGIN_ACK.len() - 2]);
    assert!(outgoing.when >= incoming.when);
}

#[tokio::test]
async fn time_sync_returns_current_utc() {
    let harness = start_collector().await;
    let mut sock = TcpStream::connect(&harness.device_addr).await.unwrap();
    sock.write_all(&[0x78, 0x78, 0x01, 0x30, 0x0d, 0x0a])
        .await
        .unwrap();

    // xx | 07 | 30 | YYYY MM DD HH MM SS | \r\n
    let reply = read_reply(&mut sock, 13).await;
    assert_eq!(&reply[..4], &[0x78, 0x78, 0x07, 0x30]);
    assert_eq!(&reply[11..], b"\r\n");
    let year = u16::from_be_bytes([reply[4], reply[5]]);
    assert!((2024..2100).contains(&year), "year {year}");
    assert!((1..=12).contains(&reply[6]));
    assert!((1..=31).contains(&reply[7]));
    assert!(reply[8] < 24 && reply[9] < 60 && reply[10] < 60);
}

#[tokio::test]
async fn duplicate_login_evicts_older_connection() {
    let harness = start_collector().await;

    let mut sock_a = TcpStream::connect(&harness.device_addr).await.unwrap();
    sock_a.write_all(ZX_LOGIN_FRAME).await.unwrap();
    assert_eq!(read_reply(&mut sock_a, ZX_LOGIN_ACK.len()).await, ZX_LOGIN_ACK);

    let mut sock_b = TcpStream::connect(&harness.device_addr).await.unwrap();
    sock_b.write_all(ZX_LOGIN_FRAME).await.unwrap();
    assert_eq!(read_reply(&mut sock_b, ZX_LOGIN_ACK.len()).await, ZX_LOGIN_ACK);

    // the collector closes A
    let mut buf = [0u8; 16];
    let n = within(sock_a.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0, "socket A should see EOF");

    // a response for the IMEI goes out over B
    let mut push = PushClient::new(harness.pull_addr.clone());
    let packet = zx303::status_response(25);
    push.send(
        Resp {
            imei: Some("3590001234567890".to_string()),
            when: now(),
            packet: packet.clone(),
        }
        .packed(),
    )
    .await
    .unwrap();

    let framed = zx303::enframe(&packet);
    assert_eq!(read_reply(&mut sock_b, framed.len()).await, framed);
}

#[tokio::test]
async fn oversize_junk_resets_deframer_but_keeps_connection() {
    let harness = start_collector().await;
    let mut sock = TcpStream::connect(&harness.device_addr).await.unwrap();

    // bind the connection to the binary protocol, then drown it in
    // junk with no framing marker
    sock.write_all(b"xx").await.unwrap();
    let junk = vec![0x41u8; 8192];
    sock.write_all(&junk).await.unwrap();
    sock.flush().await.unwrap();
    settle().await;

    sock.write_all(ZX_LOGIN_FRAME).await.unwrap();
    assert_eq!(read_reply(&mut sock, ZX_LOGIN_ACK.len()).await, ZX_LOGIN_ACK);
}

#[tokio::test]
async fn response_for_unconnected_imei_is_dropped() {
    let harness = start_collector().await;
    let mut push = PushClient::new(harness.pull_addr.clone());
    push.send(
        Resp {
            imei: Some("9999999999999999".to_string()),
            when: now(),
            packet: zx303::status_response(25),
        }
        .packed(),
    )
    .await
    .unwrap();
    // nothing to observe but the log line; the collector must stay up
    settle().await;
    let mut sock = TcpStream::connect(&harness.device_addr).await.unwrap();
    sock.write_all(ZX_LOGIN_FRAME).await.unwrap();
    assert_eq!(read_reply(&mut sock, ZX_LOGIN_ACK.len()).await, ZX_LOGIN_ACK);
}
