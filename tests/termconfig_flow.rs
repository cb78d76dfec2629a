//! Externally-computed replies from terminal configuration.

mod common;

use common::{settle, test_config, within};
use locsrv::bus::{Bcast, PubServer, PullServer, Resp};
use locsrv::config::ConfValue;
use locsrv::proto::zx303;

const WHEN: f64 = 1699999999.5;

fn status_bcast(imei: &str) -> Bcast {
    Bcast {
        is_incoming: true,
        proto: "ZX:STATUS".to_string(),
        imei: Some(imei.to_string()),
        when: WHEN,
        peeraddr: None,
        packet: vec![7, zx303::STATUS, 90, 2, 1, 25, 4],
    }
}

#[tokio::test]
async fn status_reply_uses_configured_interval_and_event_time() {
    let mut conf = test_config();
    let zpub = PubServer::bind("127.0.0.1:0").await.unwrap();
    let mut zpull = PullServer::bind("127.0.0.1:0").await.unwrap();
    conf.collector.publishurl = zpub.local_addr().to_string();
    conf.collector.listenurl = zpull.local_addr().to_string();
    conf.termconfig
        .insert("statusintervalminutes".to_string(), ConfValue::Int(10));
    conf.terminals.insert(
        "8613001234567890".to_string(),
        [("statusintervalminutes".to_string(), ConfValue::Int(3))]
            .into_iter()
            .collect(),
    );

    let termconf = conf.clone();
    tokio::spawn(async move { locsrv::termconfig::run(&termconf).await });
    settle().await;

    // default section applies to an unknown IMEI
    zpub.publish(status_bcast("3590001234567890").packed());
    let resp = Resp::decode(&within(zpull.recv()).await.unwrap()).unwrap();
    assert_eq!(resp.imei.as_deref(), Some("3590001234567890"));
    assert_eq!(resp.when, WHEN);
    assert_eq!(resp.packet, zx303::status_response(10));

    // the per-IMEI section overrides it
    zpub.publish(status_bcast("8613001234567890").packed());
    let resp = Resp::decode(&within(zpull.recv()).await.unwrap()).unwrap();
    assert_eq!(resp.packet, zx303::status_response(3));
}

#[tokio::test]
async fn setup_reply_is_built_from_the_section() {
    let mut conf = test_config();
    let zpub = PubServer::bind("127.0.0.1:0").await.unwrap();
    let mut zpull = PullServer::bind("127.0.0.1:0").await.unwrap();
    conf.collector.publishurl = zpub.local_addr().to_string();
    conf.collector.listenurl = zpull.local_addr().to_string();
    conf.termconfig
        .insert("uploadintervalseconds".to_string(), ConfValue::Int(0x0180));

    let termconf = conf.clone();
    tokio::spawn(async move { locsrv::termconfig::run(&termconf).await });
    settle().await;

    zpub.publish(
        Bcast {
            is_incoming: true,
            proto: "ZX:SETUP".to_string(),
            imei: Some("3590001234567890".to_string()),
            when: WHEN,
            peeraddr: None,
            packet: vec![5, zx303::SETUP, 0],
        }
        .packed(),
    );
    let resp = Resp::decode(&within(zpull.recv()).await.unwrap()).unwrap();
    assert_eq!(resp.when, WHEN);
    assert_eq!(resp.packet[1], zx303::SETUP);
    // configured upload interval leads the payload
    assert_eq!(&resp.packet[2..4], &0x0180u16.to_be_bytes());
}
