//! Listings feed: inventory, the dealer's own listings and search requests
//!
//! Writes follow the optimistic contract: the store changes first, the
//! server reply then reconciles it, and a failed write reloads every
//! collection from the server.

use crate::context::Context;
use crate::notice::Notice;
use crate::reconciler::{reload_handler, FeedSpec, FeedSubscription};
use crate::store::{store_handler, EntityStore, Placement};
use lotsync_core::{
    Error, Listing, ListingForm, ListingPatch, ListingStatus, Mutation, Query, Record, Result,
    Topic,
};
use serde_json::json;
use std::sync::Arc;

pub const AVAILABLE: &str = "available";
pub const MINE: &str = "mine";
pub const SEARCHING: &str = "searching";

/// Query shape shared by every listing read, joins included
pub fn listing_query() -> Query {
    Query::table(Listing::TABLE)
        .join("dealer", "profiles", "dealer_id")
        .join("model_codes", "model_codes", "model_code_id")
}

#[derive(Clone)]
pub struct ListingsFeed {
    ctx: Context,
    store: Arc<EntityStore<Listing>>,
}

impl ListingsFeed {
    pub fn new(ctx: Context) -> Self {
        let session = ctx.session.clone();
        let store = EntityStore::builder()
            .collection(AVAILABLE, Placement::Front, |l: &Listing| {
                l.status == ListingStatus::Available
            })
            .collection(MINE, Placement::Front, move |l: &Listing| {
                session.user_id().as_deref() == Some(l.dealer_id.as_str())
            })
            .collection(SEARCHING, Placement::Front, |l: &Listing| {
                l.status == ListingStatus::Searching
            })
            .build();
        Self {
            ctx,
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore<Listing>> {
        &self.store
    }

    pub fn available(&self) -> Vec<Listing> {
        self.store.items(AVAILABLE)
    }

    pub fn mine(&self) -> Vec<Listing> {
        self.store.items(MINE)
    }

    pub fn searching(&self) -> Vec<Listing> {
        self.store.items(SEARCHING)
    }

    async fn load(&self, collection: &'static str, query: Query) -> Result<Vec<Listing>> {
        self.store.set_loading(true);
        let result = self.ctx.fetch::<Listing>("load listings", query).await;
        self.store.set_loading(false);
        match result {
            Ok(listings) => {
                tracing::debug!(collection, count = listings.len(), "listings loaded");
                self.store.set(collection, listings.clone());
                self.store.set_error(None);
                Ok(listings)
            }
            Err(error) => {
                tracing::warn!(collection, error = %error, "listing load failed");
                self.store.set_error(Some(error.user_message()));
                self.ctx.report(&error);
                Err(error)
            }
        }
    }

    pub async fn load_available(&self) -> Result<Vec<Listing>> {
        let query = listing_query()
            .eq("status", ListingStatus::Available.as_str())
            .order("created_at", false);
        self.load(AVAILABLE, query).await
    }

    pub async fn load_mine(&self) -> Result<Vec<Listing>> {
        let Some(user_id) = self.ctx.session.user_id() else {
            return Ok(Vec::new());
        };
        let query = listing_query()
            .eq("dealer_id", user_id)
            .order("created_at", false);
        self.load(MINE, query).await
    }

    pub async fn load_searching(&self) -> Result<Vec<Listing>> {
        let query = listing_query()
            .eq("status", ListingStatus::Searching.as_str())
            .order("created_at", false);
        self.load(SEARCHING, query).await
    }

    /// Replace every collection with server state; the first failure is returned
    #[tracing::instrument(skip(self))]
    pub async fn reload_all(&self) -> Result<()> {
        let available = self.load_available().await;
        let mine = self.load_mine().await;
        let searching = self.load_searching().await;
        available.and(mine).and(searching).map(|_| ())
    }

    async fn fetch_listing(&self, id: &str) -> Result<Option<Listing>> {
        self.ctx
            .fetch_one("fetch listing", listing_query().eq("id", id))
            .await
    }

    /// Select a listing, from the cache when possible
    pub async fn select(&self, id: &str) -> Result<Option<Listing>> {
        if let Some(cached) = self.store.get(id) {
            self.store.select(Some(cached.clone()));
            return Ok(Some(cached));
        }
        let fetched = self.fetch_listing(id).await?;
        self.store.select(fetched.clone());
        Ok(fetched)
    }

    pub fn selected(&self) -> Option<Listing> {
        self.store.selected()
    }

    async fn roll_back(&self, error: &Error) {
        tracing::warn!(error = %error, "listing write failed, reloading from server");
        self.ctx.record_rollback(Listing::TABLE);
        self.store.set_error(Some(error.user_message()));
        self.ctx.report(error);
        if let Err(reload_error) = self.reload_all().await {
            tracing::warn!(error = %reload_error, "reload after failed write also failed");
        }
    }

    #[tracing::instrument(skip(self, form), fields(make = %form.make, model = %form.model))]
    pub async fn create(&self, form: ListingForm) -> Result<Listing> {
        form.validate()?;
        let user = self.ctx.session.require_user()?;

        let local_id = format!("local-{:016x}", rand::random::<u64>());
        self.store.add(form.draft(local_id.clone(), user.id.clone()));

        let mut row = serde_json::to_value(&form)?;
        row["dealer_id"] = json!(user.id);
        let inserted = self
            .ctx
            .mutate("create listing", Mutation::insert(Listing::TABLE, row))
            .await;
        self.store.remove(&local_id);

        let inserted = match inserted {
            Ok(row) => row,
            Err(error) => {
                self.roll_back(&error).await;
                return Err(error);
            }
        };
        let plain: Listing = lotsync_core::from_row(inserted)?;
        let listing = match self.fetch_listing(&plain.id).await {
            Ok(Some(joined)) => joined,
            _ => plain,
        };
        self.store.add(listing.clone());
        self.ctx.notices.publish(Notice::success("Listing created successfully"));
        tracing::info!(id = %listing.id, "listing created");
        Ok(listing)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: ListingPatch) -> Result<Listing> {
        patch.validate()?;
        let patch = patch.to_value()?;
        self.store.update(id, &patch);

        let result = self
            .ctx
            .mutate("update listing", Mutation::update(Listing::TABLE, id, patch))
            .await;
        let row = match result {
            Ok(row) => row,
            Err(error) => {
                self.roll_back(&error).await;
                return Err(error);
            }
        };

        // the reply carries no join data; keep what the store already has
        let listing = match self.store.get(id) {
            Some(current) => current.merged(&row)?,
            None => lotsync_core::from_row(row)?,
        };
        self.store.add(listing.clone());
        self.ctx.notices.publish(Notice::success("Listing updated successfully"));
        Ok(listing)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.remove(id);
        let result = self
            .ctx
            .mutate("delete listing", Mutation::delete(Listing::TABLE, id))
            .await;
        if let Err(error) = result {
            self.roll_back(&error).await;
            return Err(error);
        }
        self.ctx.notices.publish(Notice::success("Listing deleted successfully"));
        Ok(())
    }

    /// Extend a listing's expiry, then reload to pick up the new date
    #[tracing::instrument(skip(self))]
    pub async fn renew(&self, id: &str) -> Result<()> {
        if let Err(error) = self.ctx.rpc("renew_listing", json!({ "listing_id": id })).await {
            self.store.set_error(Some(error.user_message()));
            self.ctx.report(&error);
            return Err(error);
        }
        self.load_available().await?;
        self.load_mine().await?;
        self.ctx.notices.publish(Notice::success("Listing renewed successfully"));
        Ok(())
    }

    /// Keep the store live; changed rows are re-fetched with their joins
    pub async fn subscribe(&self) -> FeedSubscription {
        let feed = self.clone();
        let spec = FeedSpec::new(Topic::listings(), Listing::TABLE)
            .trust_payload(false)
            .refetch_with(listing_query());
        self.ctx
            .reconciler
            .subscribe(
                spec,
                store_handler(self.store.clone()),
                Some(reload_handler(move || {
                    let feed = feed.clone();
                    async move { feed.reload_all().await }
                })),
            )
            .await
    }
}
