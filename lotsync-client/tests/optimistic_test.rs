//! Optimistic writes and rollback integration tests

mod common;

use common::{listing_row, notification_row, seeded_backend, signed_in_client, wait_until, DEALER, OTHER_DEALER};
use lotsync_client::NoticeLevel;
use lotsync_core::{ListingForm, ListingPatch, ListingStatus, RemoteError};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_failed_update_rolls_back_to_server_state() {
    let backend = seeded_backend();
    backend.insert_row("listings", listing_row("x", DEALER, "available"));
    let client = signed_in_client(&backend).await;
    let listings = client.listings().clone();
    listings.reload_all().await.unwrap();
    assert_eq!(listings.store().get("x").unwrap().status, ListingStatus::Available);

    backend.set_latency(Duration::from_millis(100));
    backend.fail_calls("mutate:listings", RemoteError::forbidden("permission denied"));

    let writer = listings.clone();
    let update = tokio::spawn(async move {
        writer
            .update("x", ListingPatch::status(ListingStatus::Sold))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(listings.store().get("x").unwrap().status, ListingStatus::Sold);

    let error = update.await.unwrap().unwrap_err();
    assert!(!error.is_retryable());
    assert_eq!(listings.store().get("x").unwrap().status, ListingStatus::Available);
    assert_eq!(backend.calls_matching("mutate:listings"), 1);

    // a second reload changes nothing
    let settled = listings.available();
    listings.reload_all().await.unwrap();
    assert_eq!(listings.available(), settled);
    assert_eq!(backend.row("listings", "x").unwrap()["status"], "available");
}

#[tokio::test]
async fn test_successful_update_keeps_joined_data() {
    let backend = seeded_backend();
    backend.insert_row("listings", listing_row("x", DEALER, "available"));
    let client = signed_in_client(&backend).await;
    let listings = client.listings().clone();
    listings.reload_all().await.unwrap();
    let mut notices = client.notices();

    let updated = listings
        .update("x", ListingPatch::status(ListingStatus::Pending))
        .await
        .unwrap();
    assert_eq!(updated.status, ListingStatus::Pending);
    assert_eq!(
        updated.dealer.and_then(|d| d.dealer_name).as_deref(),
        Some("Northside Motors")
    );
    assert!(listings.available().is_empty());
    assert_eq!(listings.mine().len(), 1);
    assert_eq!(notices.recv().await.unwrap().level, NoticeLevel::Success);
}

#[tokio::test]
async fn test_create_replaces_local_draft() {
    let backend = seeded_backend();
    let client = signed_in_client(&backend).await;
    let listings = client.listings().clone();

    let created = listings
        .create(ListingForm::new("Honda", "Civic", 2024).with_pdi_fee(250.0))
        .await
        .unwrap();
    assert!(!created.id.starts_with("local-"));
    assert_eq!(created.dealer_id, DEALER);
    assert!(created.dealer.is_some());

    let mine = listings.mine();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, created.id);
    assert_eq!(backend.rows("listings").len(), 1);
}

#[tokio::test]
async fn test_invalid_form_never_reaches_backend() {
    let backend = seeded_backend();
    let client = signed_in_client(&backend).await;
    backend.clear_calls();

    let result = client
        .listings()
        .create(ListingForm::new("Honda", "Civic", 2024).with_vin("TOO-SHORT"))
        .await;
    assert!(matches!(result, Err(lotsync_core::Error::Validation(_))));
    assert!(client.listings().mine().is_empty());
    assert_eq!(backend.calls_matching("mutate:"), 0);
}

#[tokio::test]
async fn test_failed_delete_restores_listing() {
    let backend = seeded_backend();
    backend.insert_row("listings", listing_row("x", DEALER, "available"));
    backend.insert_row("listings", listing_row("y", OTHER_DEALER, "available"));
    let client = signed_in_client(&backend).await;
    let listings = client.listings().clone();
    listings.reload_all().await.unwrap();

    backend.fail_calls("mutate:listings", RemoteError::forbidden("not your listing"));
    assert!(listings.delete("y").await.is_err());
    assert!(listings.store().contains("y"));
    assert_eq!(listings.available().len(), 2);

    backend.clear_failures();
    listings.delete("x").await.unwrap();
    assert!(!listings.store().contains("x"));
    assert!(backend.row("listings", "x").is_none());
}

#[tokio::test]
async fn test_renew_is_limited_to_owner() {
    let backend = seeded_backend();
    backend.insert_row("listings", listing_row("x", DEALER, "available"));
    backend.insert_row("listings", listing_row("y", OTHER_DEALER, "available"));
    let client = signed_in_client(&backend).await;
    let listings = client.listings().clone();

    listings.renew("x").await.unwrap();
    assert!(listings.store().get("x").unwrap().expires_at.is_some());
    assert!(listings.renew("y").await.is_err());
}

#[tokio::test]
async fn test_mark_all_read_updates_store_and_server() {
    let backend = seeded_backend();
    for id in ["n1", "n2", "n3"] {
        backend.insert_row("notifications", notification_row(id, DEALER, "Offer received"));
    }
    backend.insert_row("notifications", notification_row("n4", OTHER_DEALER, "Not mine"));
    let client = signed_in_client(&backend).await;
    let notifications = client.notifications().clone();
    notifications.load().await.unwrap();
    assert_eq!(notifications.unread_count(), 3);

    notifications.mark_as_read("n1").await.unwrap();
    assert_eq!(notifications.unread_count(), 2);

    notifications.mark_all_as_read().await.unwrap();
    assert_eq!(notifications.unread_count(), 0);
    let server_unread = backend
        .rows("notifications")
        .into_iter()
        .filter(|n| n["read"] == false)
        .count();
    assert_eq!(server_unread, 1);
}

#[tokio::test]
async fn test_failed_mark_read_reloads() {
    let backend = seeded_backend();
    backend.insert_row("notifications", notification_row("n1", DEALER, "Offer received"));
    let client = signed_in_client(&backend).await;
    let notifications = client.notifications().clone();
    notifications.load().await.unwrap();

    backend.fail_calls("mutate:notifications", RemoteError::server_error("boom"));
    assert!(notifications.mark_as_read("n1").await.is_err());
    assert_eq!(notifications.unread_count(), 1);
}

#[tokio::test]
async fn test_remote_change_lands_in_store_with_joins() {
    let backend = seeded_backend();
    let client = signed_in_client(&backend).await;
    let listings = client.listings().clone();
    let _feed = listings.subscribe().await;

    backend.insert_row("listings", listing_row("z", OTHER_DEALER, "available"));
    assert!(wait_until(|| async { listings.store().contains("z") }).await);
    let fetched = listings.store().get("z").unwrap();
    assert_eq!(
        fetched.dealer.and_then(|d| d.dealer_name).as_deref(),
        Some("Harbor Auto")
    );

    backend.delete_row("listings", "z");
    assert!(wait_until(|| async { !listings.store().contains("z") }).await);
}
