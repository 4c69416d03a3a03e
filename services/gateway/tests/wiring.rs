//! End-to-end wiring tests: a fake radio TCP server stands in for the
//! physical device, and we assert the gateway dials it, decodes frames,
//! and replays them to a virtual-node subscriber.

use gateway::config::{GatewayConfig, RadioConfig, SchedulerConfig, TaskSchedule, VirtualNodeConfig};
use mesh_proto::generated::{from_radio::PayloadVariant, FromRadio};
use mesh_transport::frame_payload;
use prost::Message;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

fn reserve_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn never_schedule() -> TaskSchedule {
    TaskSchedule { interval_minutes: 10_000, window: None }
}

fn test_config(radio_port: u16, vnode_port: u16, db_path: &std::path::Path) -> GatewayConfig {
    GatewayConfig {
        local_node: 0xAAAA_0001,
        radio: RadioConfig { host: "127.0.0.1".to_string(), port: radio_port },
        store_path: db_path.to_string_lossy().into_owned(),
        virtual_node: VirtualNodeConfig { bind: format!("127.0.0.1:{vnode_port}"), replay_capacity: 16 },
        scheduler: SchedulerConfig {
            traceroute: never_schedule(),
            time_sync: never_schedule(),
            admin_scan: never_schedule(),
            key_repair: never_schedule(),
            local_stats: never_schedule(),
        },
        announce: None,
        timers: Vec::new(),
        geofences: Vec::new(),
        script_dir: None,
    }
}

#[tokio::test]
async fn inbound_broadcast_text_is_replayed_to_a_virtual_node_subscriber() {
    let radio_port = reserve_port();
    let vnode_port = reserve_port();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gateway.sqlite3");

    let fake_radio = TcpListener::bind(("127.0.0.1", radio_port)).await.unwrap();
    let config = test_config(radio_port, vnode_port, &db_path);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway_task = tokio::spawn(gateway::run(config, shutdown_rx));

    let (mut radio_stream, _) = timeout(Duration::from_secs(2), fake_radio.accept()).await.unwrap().unwrap();

    let (packet, _id) = mesh_proto::encode_text_message(0xBBBB_0002, mesh_proto::BROADCAST_ADDR, 0, "hello mesh");
    let from_radio = FromRadio { id: 0, payload_variant: Some(PayloadVariant::Packet(packet)) };
    let bytes = from_radio.encode_to_vec();
    radio_stream.write_all(&frame_payload(&bytes)).await.unwrap();

    // Give the reader loop time to decode, log, and broadcast the frame
    // before a subscriber even connects — it must come back via replay.
    sleep(Duration::from_millis(300)).await;

    let mut subscriber = timeout(Duration::from_secs(2), TcpStream::connect(("127.0.0.1", vnode_port))).await.unwrap().unwrap();
    let mut buf = [0u8; 1024];
    let n = timeout(Duration::from_secs(2), subscriber.read(&mut buf)).await.unwrap().unwrap();
    assert!(n > 0, "expected the replayed frame on the virtual-node connection");

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(2), gateway_task).await;
}

#[tokio::test]
async fn config_loads_minimal_toml_with_defaults() {
    let toml_str = r#"
        local_node = "0x1a2b3c4d"
        [radio]
        host = "127.0.0.1"
        port = 4403
    "#;
    let cfg = gateway::config::load_config_from_str(toml_str).unwrap();
    assert_eq!(cfg.local_node, 0x1a2b3c4d);
    assert_eq!(cfg.virtual_node.bind, "0.0.0.0:4403");
    assert!(cfg.geofences.is_empty());
}
