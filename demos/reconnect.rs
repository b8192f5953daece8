//! Example: surviving a network outage
//!
//! Subscribes to the signed-in dealer's notifications, takes the simulated
//! network down, lets the server state change, then brings the network back
//! and watches the background probe run the recovery sequence.
//!
//! ```bash
//! cargo run --example reconnect
//! ```

use lotsync::core::User;
use lotsync::{ClientBuilder, MemoryBackend, ResilienceConfig};
use serde_json::json;
use std::time::Duration;

fn notification(id: &str, title: &str) -> serde_json::Value {
    json!({"id": id, "user_id": "d1", "title": title, "read": false})
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("lotsync_client=info")
        .init();

    println!("=== Reconnection Example ===\n");

    let backend = MemoryBackend::new();
    backend.insert_row("profiles", json!({"id": "d1", "dealer_name": "Northside Motors"}));
    backend.insert_row("notifications", notification("n1", "Offer received on your Camry"));
    backend.sign_in(User::new("d1"));

    let client = ClientBuilder::new(backend.clone())
        .with_config(ResilienceConfig::default().with_probe_interval(Duration::from_secs(1)))
        .build()?;
    client.initialize().await;

    let mut notices = client.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("📣 [{:?}] {}", notice.level, notice.message);
        }
    });

    let notifications = client.notifications().clone();
    notifications.load().await?;
    let _live = notifications.subscribe().await?;
    client.start_connectivity_monitoring();
    println!("✓ {} notification(s), feed live\n", notifications.items().len());

    println!("Taking the network down...");
    backend.set_network(false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    println!("online: {}", client.is_online());

    backend.delete_row("notifications", "n1");
    backend.insert_row("notifications", notification("n2", "Your listing sold"));

    println!("\nBringing the network back...");
    backend.set_network(true);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    println!("\n=== After Recovery ===");
    println!("online: {}", client.is_online());
    println!("open channels: {}", backend.open_channels());
    for item in notifications.items() {
        println!("  {} (read: {})", item.title, item.read);
    }

    client.stop_connectivity_monitoring().await;
    Ok(())
}
