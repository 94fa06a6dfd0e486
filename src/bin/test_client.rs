//! Demo peer for a running gateway
//!
//! Usage: `test-client [HOST:PORT]`
//!
//! Without an address the client reads the ports from the handshake file
//! named by `_PYFLUSS_CONN_INFO_PATH` and registers a watchdog. With an
//! address, the watchdog is registered only when `--callback PORT` is given.

use fluss_gateway::gateway::{
    handshake, CallbackServer, GatewayObject, LivenessProbe, PeerClient, WATCHDOG_KEY,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

const PROBE_ID: &str = "p0";

fn parse_args() -> Result<(Option<SocketAddr>, Option<u16>), Box<dyn std::error::Error>> {
    let mut addr = None;
    let mut callback = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--callback" {
            let port = args.next().ok_or("--callback needs a port")?;
            callback = Some(port.parse()?);
        } else {
            addr = Some(arg.parse()?);
        }
    }
    Ok((addr, callback))
}

fn handle_id(v: &Value) -> Option<String> {
    v.get("object_id").and_then(Value::as_str).map(str::to_string)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Testing Fluss gateway\n");

    let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let (addr, callback_port) = parse_args()?;
    let (mut client, callback_port) = match addr {
        Some(addr) => (PeerClient::connect(addr).await?, callback_port),
        None => {
            let path = handshake::path_from_env()
                .ok_or("pass HOST:PORT or set _PYFLUSS_CONN_INFO_PATH")?;
            let (client, record) = PeerClient::connect_from_handshake(&path, host).await?;
            println!(
                "Handshake: listener {}, callback {}",
                record.listener_port, record.callback_port
            );
            (client, Some(record.callback_port))
        }
    };
    println!("Connected\n");

    // Keep the gateway alive while the demo runs
    let watchdog = match callback_port {
        Some(port) => {
            let mut objects: HashMap<String, Arc<dyn GatewayObject>> = HashMap::new();
            objects.insert(PROBE_ID.to_string(), Arc::new(LivenessProbe::new()));
            let server = CallbackServer::connect(SocketAddr::new(host, port), objects).await?;
            client.register(WATCHDOG_KEY, PROBE_ID).await?;
            println!("Registered {} as {}\n", PROBE_ID, WATCHDOG_KEY);
            Some(server)
        }
        None => None,
    };

    println!("Test 1: connect");
    let response = client.call_entry("connect", vec![json!("localhost:9123")]).await?;
    println!("Response: {}\n", response);

    println!("Test 2: create_database demo");
    let response = client.call_entry("create_database", vec![json!("demo")]).await?;
    println!("Response: {}", response);
    let response = client.call_entry("list_databases", vec![]).await?;
    println!("Databases: {}\n", response);

    println!("Test 3: create_simple_table demo.users");
    let response = client
        .call_entry("create_simple_table", vec![json!("demo"), json!("users")])
        .await?;
    println!("Response: {}", response);
    let response = client
        .call_entry("table_schema", vec![json!("demo"), json!("users")])
        .await?;
    println!("Schema: {}\n", response);

    println!("Test 4: upsert_record x3");
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        let record = json!({ "id": id, "name": name, "age": 20 + id });
        let response = client
            .call_entry("upsert_record", vec![json!("demo"), json!("users"), record])
            .await?;
        println!("Response: {}", response);
    }
    client.call_entry("flush_all_writers", vec![]).await?;
    println!();

    println!("Test 5: read_table_data demo.users");
    let response = client
        .call_entry("read_table_data", vec![json!("demo"), json!("users"), json!(10)])
        .await?;
    println!("Response: {}\n", response);

    println!("Test 6: scan reader");
    let reader = client
        .call_entry(
            "create_scan_reader",
            vec![json!("demo"), json!("users"), json!("snapshot"), json!(10)],
        )
        .await?;
    match handle_id(&reader) {
        Some(id) => {
            let response = client.call(&id, "read_records", vec![json!(2)]).await?;
            println!("Batch: {}", response);
            let response = client.call(&id, "status", vec![]).await?;
            println!("Status: {}", response);
            client.call(&id, "close", vec![]).await?;
            println!("Released: {}\n", client.release(&id).await?);
        }
        None => println!("No reader: {}\n", reader),
    }

    println!("Test 7: check_table_health demo.users");
    let response = client
        .call_entry("check_table_health", vec![json!("demo"), json!("users")])
        .await?;
    println!("Response: {}\n", response);

    if let Some(server) = watchdog {
        // Dropping the callback connection lets the gateway exit on its own
        server.stop().await;
        println!("Watchdog stopped");
    }

    println!("All tests completed");
    Ok(())
}
