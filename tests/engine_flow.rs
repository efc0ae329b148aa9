use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::net::UdpSocket;

use sieve::config::{EngineConfig, FileConfig, SourceConfig, TelemetryConfig};
use sieve::dns::{DnsQuery, TYPE_A};
use sieve::engine::{Engine, QueryAction};
use sieve::store::MemoryStore;
use sieve::transport::udp::UdpTransport;

fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // Class: IN
    packet
}

fn ads_store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_category(3, "ads")
            .with_domain("ads.example.com", 3),
    )
}

async fn collector() -> (UdpSocket, TelemetryConfig) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TelemetryConfig {
        socket: socket.local_addr().unwrap(),
        queue: 64,
    };
    (socket, config)
}

async fn next_event(collector: &UdpSocket) -> serde_json::Value {
    let mut buf = [0u8; 2048];
    let len = tokio::time::timeout(Duration::from_secs(2), collector.recv(&mut buf))
        .await
        .expect("no telemetry event")
        .unwrap();
    assert_eq!(buf[len - 1], b'\n');
    serde_json::from_slice(&buf[..len]).unwrap()
}

fn blocking_config(telemetry: TelemetryConfig) -> EngineConfig {
    let mut config = EngineConfig {
        telemetry: Some(telemetry),
        sources: vec![SourceConfig {
            ip: "10.0.0.5".into(),
            block: vec![3],
            whitelist: vec![],
        }],
        ..EngineConfig::default()
    };
    config.filter.sinkhole = "192.0.2.1".parse().unwrap();
    config
}

#[tokio::test]
async fn blocked_query_gets_sinkhole_and_block_event() {
    let (collector, telemetry) = collector().await;
    let engine = Engine::build(blocking_config(telemetry), ads_store()).unwrap();

    let packet = build_query(0x0101, "ads.example.com", TYPE_A);
    let action = engine.process_query("10.0.0.5", &packet, None).await;

    let QueryAction::Blocked { response, .. } = action else {
        panic!("query was not blocked");
    };
    assert_eq!(response.rcode(), 0);
    assert_eq!(response.answers.len(), 1);
    assert_eq!(response.answers[0].name, "ads.example.com");
    assert_eq!(response.answers[0].rdata, vec![192, 0, 2, 1]);

    let event = next_event(&collector).await;
    assert_eq!(event["access_type"], "BLOCK");
    assert_eq!(event["domain"], "ads.example.com.");
    assert_eq!(event["registered_domain"], "example.com");
    assert_eq!(event["category"], 3);
    assert_eq!(event["source_ip"], "10.0.0.5");
    assert_eq!(event["type"], "A");
}

#[tokio::test]
async fn unconfigured_source_passes_with_pass_event() {
    let (collector, telemetry) = collector().await;
    let engine = Engine::build(blocking_config(telemetry), ads_store()).unwrap();

    let packet = build_query(0x0102, "ads.example.com", TYPE_A);
    let action = engine.process_query("10.9.9.9", &packet, None).await;

    let QueryAction::Forward { event, .. } = action else {
        panic!("query was not forwarded");
    };
    engine.complete(event);

    let event = next_event(&collector).await;
    assert_eq!(event["access_type"], "PASS");
    assert_eq!(event["category"], 3);
}

#[tokio::test]
async fn whitelisted_category_passes() {
    let mut config = blocking_config(collector().await.1);
    config.sources[0].whitelist = vec![3];
    let engine = Engine::build(config, ads_store()).unwrap();

    let packet = build_query(1, "ads.example.com", TYPE_A);
    let action = engine.process_query("10.0.0.5", &packet, None).await;

    assert!(matches!(action, QueryAction::Forward { .. }));
}

#[tokio::test]
async fn unknown_domain_passes_for_blocking_source() {
    let engine = Engine::build(blocking_config(collector().await.1), ads_store()).unwrap();

    let packet = build_query(1, "docs.rs", TYPE_A);
    let action = engine.process_query("10.0.0.5", &packet, None).await;

    let QueryAction::Forward { event: Some(event), .. } = action else {
        panic!("query was not forwarded");
    };
    assert_eq!(event.category, 0);
    assert_eq!(event.access_type, "PASS");
}

#[tokio::test]
async fn repeated_queries_hit_store_once() {
    let store = ads_store();
    let engine = Engine::build(blocking_config(collector().await.1), store.clone()).unwrap();
    let packet = build_query(1, "ads.example.com", TYPE_A);

    let first = engine.process_query("10.0.0.5", &packet, None).await;
    let second = engine.process_query("10.0.0.5", &packet, None).await;

    let (QueryAction::Blocked { response: a, .. }, QueryAction::Blocked { response: b, .. }) =
        (first, second)
    else {
        panic!("both queries should block");
    };
    assert_eq!(a.to_bytes(), b.to_bytes());
    assert_eq!(store.lookups(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_are_consistent() {
    let store = ads_store();
    let engine = Arc::new(Engine::build(blocking_config(collector().await.1), store).unwrap());

    let tasks = (0..64u16).map(|i| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let packet = build_query(i, "ads.example.com", TYPE_A);
            let source = if i % 2 == 0 { "10.0.0.5" } else { "10.0.0.6" };
            let action = engine.process_query(source, &packet, None).await;
            (i, matches!(action, QueryAction::Blocked { .. }))
        })
    });

    for result in futures::future::join_all(tasks).await {
        let (i, blocked) = result.unwrap();
        assert_eq!(blocked, i % 2 == 0, "query {}", i);
    }
}

#[tokio::test]
async fn failed_bulk_load_prevents_startup() {
    let store = ads_store();
    store.add_domain("other.example.com", 4);
    store.fail_scan_after(1);
    let mut config = blocking_config(collector().await.1);
    config.bulk.enabled = true;

    let result = Engine::build(config, store);

    assert!(matches!(result, Err(sieve::Error::BulkLoad { .. })));
}

fn sqlite_fixture(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("sieve-it-{}-{}.db", name, std::process::id()));
    let _ = std::fs::remove_file(&path);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE TABLE domains (domain TEXT NOT NULL, category_id INTEGER NOT NULL);
         INSERT INTO categories VALUES (3, 'ads'), (7, 'malware');
         INSERT INTO domains VALUES ('example.com', 7), ('b.example.com', 3);",
    )
    .unwrap();
    path
}

#[tokio::test]
async fn sqlite_backed_engine_from_file_config() {
    let path = sqlite_fixture("config");
    let raw = format!(
        r#"
        [telemetry]
        enabled = false

        [store]
        path = "{}"

        [bulk]
        enabled = true
        workers = 2
        shards = 4

        [[sources]]
        ip = "10.0.0.5"
        block = [3]
        "#,
        path.display()
    );
    let config = FileConfig::parse(&raw).unwrap().validate().unwrap();
    let engine = Engine::open(config).unwrap();

    let blocked = engine
        .process_query("10.0.0.5", &build_query(1, "a.b.example.com", TYPE_A), None)
        .await;
    let passed = engine
        .process_query("10.0.0.5", &build_query(2, "www.example.com", TYPE_A), None)
        .await;

    assert!(matches!(blocked, QueryAction::Blocked { .. }));
    let QueryAction::Forward { event: Some(event), .. } = passed else {
        panic!("query was not forwarded");
    };
    assert_eq!(event.category, 7);
    assert_eq!(engine.bulk_len(), 2);
    let _ = std::fs::remove_file(path);
}

async fn fake_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut response = buf[..len].to_vec();
            response[2] = 0x81;
            response[3] = 0x80;
            response[7] = 0x01;
            response.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
            response.extend_from_slice(&[0x00, 0x00, 0x01, 0x2C, 0x00, 0x04]);
            response.extend_from_slice(&[93, 184, 216, 34]);
            let _ = socket.send_to(&response, from).await;
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_transport_blocks_and_forwards() {
    let (collector, telemetry) = collector().await;
    let mut config = blocking_config(telemetry);
    config.sources[0].ip = "127.0.0.1".into();
    let engine = Arc::new(Engine::build(config, ads_store()).unwrap());

    let upstream = fake_upstream().await;
    let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let proxy_addr = transport.local_addr().unwrap();
    transport.start(vec![upstream], engine, Duration::from_secs(2));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 512];

    client
        .send_to(&build_query(0x0A0A, "ads.example.com", TYPE_A), proxy_addr)
        .await
        .unwrap();
    let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let answer = &buf[..len];
    assert_eq!(&answer[..2], &[0x0A, 0x0A]);
    assert_eq!(DnsQuery::parse(answer).unwrap().first().unwrap().domain, "ads.example.com");
    assert_eq!(next_event(&collector).await["access_type"], "BLOCK");
    // Sinkhole address sits right after the compressed answer header.
    assert!(answer.windows(4).any(|w| w == [192, 0, 2, 1]));

    client
        .send_to(&build_query(0x0B0B, "www.rust-lang.org", TYPE_A), proxy_addr)
        .await
        .unwrap();
    let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..2], &[0x0B, 0x0B]);
    assert_eq!(&buf[len - 4..len], &[93, 184, 216, 34]);
    let event = next_event(&collector).await;
    assert_eq!(event["access_type"], "PASS");
    assert_eq!(event["domain"], "www.rust-lang.org.");
}
