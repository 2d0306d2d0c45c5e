/// Example client picking instances registered by rendezvous agents
///
/// Usage:
///   1. Start an agent:
///      cargo run -p rendezvous-agent -- --name billing --port 9000
///   2. Run this example:
///      cargo run -p rendezvous-agent --example pick_client -- billing
use std::time::Duration;

use rendezvous_core::{ClientConfig, DiscoveryClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = std::env::args().nth(1).unwrap_or_else(|| "billing".to_string());

    // Connect to etcd
    let endpoint = "http://127.0.0.1:2379";
    println!("Connecting to etcd at {}", endpoint);
    let client = DiscoveryClient::connect(ClientConfig::new().with_endpoints([endpoint])).await?;

    // 1. Refresh once
    println!("\n1. Refreshing registry...");
    let count = client.refresh().await?;
    println!("   Entries under /{}/: {}", client.root(), count);

    // 2. List everything
    println!("\n2. All services:");
    println!("   {}", client.all_services());

    // 3. Pick a few times
    println!("\n3. Picking {} ...", service);
    for _ in 0..4 {
        match client.picker_detail(&service) {
            Ok(endpoint) => println!("   -> {}", endpoint),
            Err(e) => println!("   !! {}", e),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // 4. Fan out
    println!("\n4. Every live instance: {:?}", client.picker_all(&service));

    Ok(())
}
