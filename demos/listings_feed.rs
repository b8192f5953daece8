//! Example: a live listings board with optimistic writes
//!
//! Runs entirely in process against the memory backend. A second "dealer"
//! writes straight to the backend and the board picks the change up through
//! its realtime feed, re-fetched with the dealer's profile joined in.
//!
//! ```bash
//! cargo run --example listings_feed
//! ```

use lotsync::core::{ListingForm, ListingPatch, ListingStatus, RemoteError, User};
use lotsync::{ClientBuilder, MemoryBackend};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("lotsync_client=info")
        .init();

    println!("=== Live Listings Board ===\n");

    let backend = MemoryBackend::new();
    backend.insert_row("profiles", json!({"id": "d1", "dealer_name": "Northside Motors"}));
    backend.insert_row("profiles", json!({"id": "d2", "dealer_name": "Harbor Auto"}));
    backend.sign_in(User::new("d1").with_email("sales@northside.test"));

    let client = ClientBuilder::new(backend.clone()).build()?;
    let session = client.initialize().await;
    println!("Signed in as {:?}\n", session.profile.and_then(|p| p.dealer_name));

    let listings = client.listings().clone();
    listings.reload_all().await?;
    let _live = listings.subscribe().await;

    let mine = listings
        .create(ListingForm::new("Toyota", "Camry", 2024).with_pdi_fee(250.0))
        .await?;
    println!("✓ Created {} {} ({})", mine.make, mine.model, mine.id);

    // another dealer lists a car; we only see the realtime event
    backend.insert_row(
        "listings",
        json!({
            "id": "harbor-1",
            "dealer_id": "d2",
            "make": "Honda",
            "model": "Civic",
            "year": 2023,
            "status": "available",
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\nAvailable now:");
    for listing in listings.available() {
        let dealer = listing.dealer.and_then(|d| d.dealer_name).unwrap_or_default();
        println!("  {} {} {} from {}", listing.year, listing.make, listing.model, dealer);
    }

    // a rejected write is rolled back from server state
    backend.fail_calls("mutate:listings", RemoteError::forbidden("permission denied"));
    match listings
        .update(&mine.id, ListingPatch::status(ListingStatus::Sold))
        .await
    {
        Ok(_) => println!("\nUpdate unexpectedly succeeded"),
        Err(e) => println!("\n✗ Update rejected: {}", e.user_message()),
    }
    if let Some(current) = listings.store().get(&mine.id) {
        println!("  status after rollback: {}", current.status.as_str());
    }

    client.stop_connectivity_monitoring().await;
    println!("\n=== Done ===");
    Ok(())
}
