//! In-memory entity stores with optimistic mutation support
//!
//! An [`EntityStore`] holds one record type split into named collections.
//! Each collection has a route predicate deciding which records belong in
//! it (listings, for instance, are split into available inventory, the
//! dealer's own listings and "in search of" requests) and a placement for
//! newly added records. A store also carries a "selected" slot and the
//! loading/error flags a screen renders.
//!
//! All mutators are synchronous and never touch the network. Observers are
//! woken through a version counter bumped on every change.

use crate::reconciler::{change_handler, ChangeFn, FeedChange};
use lotsync_core::{from_row, Record};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Decides whether a record belongs in a collection
pub type Route<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Where [`EntityStore::add`] puts a record not yet in a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Newest first (feeds, inventory)
    Front,
    /// Oldest first (chat history)
    Back,
}

struct Collection<T> {
    name: &'static str,
    route: Route<T>,
    placement: Placement,
    items: Vec<T>,
}

struct StoreState<T> {
    collections: Vec<Collection<T>>,
    selected: Option<T>,
    loading: bool,
    error: Option<String>,
}

pub struct EntityStore<T: Record> {
    state: RwLock<StoreState<T>>,
    version: watch::Sender<u64>,
}

impl<T: Record> EntityStore<T> {
    /// Store with a single collection named `all` that accepts everything
    pub fn single(placement: Placement) -> Self {
        Self::builder().collection("all", placement, |_| true).build()
    }

    pub fn builder() -> EntityStoreBuilder<T> {
        EntityStoreBuilder {
            collections: Vec::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState<T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Receiver bumped on every change
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Replace a collection wholesale with server-confirmed rows
    pub fn set(&self, collection: &str, items: Vec<T>) {
        {
            let mut state = self.write();
            let Some(target) = state.collections.iter_mut().find(|c| c.name == collection) else {
                tracing::warn!(collection, table = T::TABLE, "set on unknown collection");
                return;
            };
            target.items = items;
            let selected_id = state.selected.as_ref().map(|s| s.id().to_string());
            if let Some(id) = selected_id {
                let fresh = state
                    .collections
                    .iter()
                    .find_map(|c| c.items.iter().find(|r| r.id() == id))
                    .cloned();
                if let Some(fresh) = fresh {
                    state.selected = Some(fresh);
                }
            }
        }
        self.changed();
    }

    /// Upsert by id, re-routing the record across collections
    ///
    /// The record is placed in every collection whose route accepts it and
    /// removed from those that no longer do. Existing entries are replaced
    /// in place.
    pub fn add(&self, record: T) {
        {
            let mut state = self.write();
            for collection in state.collections.iter_mut() {
                let position = collection.items.iter().position(|r| r.id() == record.id());
                let belongs = (collection.route)(&record);
                match (position, belongs) {
                    (Some(i), true) => collection.items[i] = record.clone(),
                    (Some(i), false) => {
                        collection.items.remove(i);
                    }
                    (None, true) => match collection.placement {
                        Placement::Front => collection.items.insert(0, record.clone()),
                        Placement::Back => collection.items.push(record.clone()),
                    },
                    (None, false) => {}
                }
            }
            if state.selected.as_ref().is_some_and(|s| s.id() == record.id()) {
                state.selected = Some(record);
            }
        }
        self.changed();
    }

    /// Merge `patch` into every copy of record `id`; returns whether any existed
    pub fn update(&self, id: &str, patch: &Value) -> bool {
        let mut touched = false;
        {
            let mut state = self.write();
            let StoreState {
                collections,
                selected,
                ..
            } = &mut *state;
            let copies = collections
                .iter_mut()
                .flat_map(|c| c.items.iter_mut())
                .chain(selected.iter_mut())
                .filter(|r| r.id() == id);
            for record in copies {
                match record.merged(patch) {
                    Ok(merged) => {
                        *record = merged;
                        touched = true;
                    }
                    Err(error) => {
                        tracing::warn!(id, table = T::TABLE, error = %error, "patch did not apply");
                    }
                }
            }
        }
        if touched {
            self.changed();
        }
        touched
    }

    /// Drop record `id` from every collection and the selected slot
    pub fn remove(&self, id: &str) -> Option<T> {
        let mut removed = None;
        {
            let mut state = self.write();
            for collection in state.collections.iter_mut() {
                if let Some(i) = collection.items.iter().position(|r| r.id() == id) {
                    removed = Some(collection.items.remove(i));
                }
            }
            if state.selected.as_ref().is_some_and(|s| s.id() == id) {
                removed = removed.or(state.selected.take());
                state.selected = None;
            }
        }
        if removed.is_some() {
            self.changed();
        }
        removed
    }

    /// Empty every collection and the selected slot
    pub fn clear(&self) {
        {
            let mut state = self.write();
            for collection in state.collections.iter_mut() {
                collection.items.clear();
            }
            state.selected = None;
            state.error = None;
        }
        self.changed();
    }

    /// Apply one realtime change
    pub fn apply(&self, change: FeedChange) {
        match change {
            FeedChange::Upsert(row) => match from_row::<T>(row) {
                Ok(record) => self.add(record),
                Err(error) => {
                    tracing::warn!(table = T::TABLE, error = %error, "ignoring malformed change row")
                }
            },
            FeedChange::Delete(id) => {
                self.remove(&id);
            }
        }
    }

    pub fn items(&self, collection: &str) -> Vec<T> {
        self.read()
            .collections
            .iter()
            .find(|c| c.name == collection)
            .map(|c| c.items.clone())
            .unwrap_or_default()
    }

    /// First copy of record `id` in any collection, or the selected slot
    pub fn get(&self, id: &str) -> Option<T> {
        let state = self.read();
        state
            .collections
            .iter()
            .find_map(|c| c.items.iter().find(|r| r.id() == id))
            .or(state.selected.as_ref().filter(|s| s.id() == id))
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn select(&self, record: Option<T>) {
        self.write().selected = record;
        self.changed();
    }

    pub fn selected(&self) -> Option<T> {
        self.read().selected.clone()
    }

    pub fn set_loading(&self, loading: bool) {
        self.write().loading = loading;
        self.changed();
    }

    pub fn loading(&self) -> bool {
        self.read().loading
    }

    pub fn set_error(&self, error: Option<String>) {
        self.write().error = error;
        self.changed();
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }
}

/// Change handler that applies every change to `store`
pub fn store_handler<T: Record>(store: Arc<EntityStore<T>>) -> ChangeFn {
    change_handler(move |change| {
        let store = store.clone();
        async move { store.apply(change) }
    })
}

pub struct EntityStoreBuilder<T> {
    collections: Vec<Collection<T>>,
}

impl<T: Record> EntityStoreBuilder<T> {
    pub fn collection<F>(mut self, name: &'static str, placement: Placement, route: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.collections.push(Collection {
            name,
            route: Arc::new(route),
            placement,
            items: Vec::new(),
        });
        self
    }

    pub fn build(self) -> EntityStore<T> {
        let (version, _) = watch::channel(0);
        EntityStore {
            state: RwLock::new(StoreState {
                collections: self.collections,
                selected: None,
                loading: false,
                error: None,
            }),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_core::{from_row, Listing, ListingStatus};
    use serde_json::json;

    fn listing(id: &str, dealer: &str, status: &str) -> Listing {
        from_row(json!({
            "id": id,
            "dealer_id": dealer,
            "make": "Ford",
            "model": "Ranger",
            "year": 2021,
            "status": status,
            "created_at": "2024-05-01T08:00:00Z"
        }))
        .unwrap()
    }

    fn store() -> EntityStore<Listing> {
        EntityStore::builder()
            .collection("available", Placement::Front, |l: &Listing| {
                l.status == ListingStatus::Available
            })
            .collection("mine", Placement::Front, |l: &Listing| l.dealer_id == "me")
            .build()
    }

    #[test]
    fn test_add_routes_into_matching_collections() {
        let store = store();
        store.add(listing("a", "me", "available"));
        store.add(listing("b", "other", "available"));
        store.add(listing("c", "me", "sold"));

        let available: Vec<String> = store.items("available").into_iter().map(|l| l.id).collect();
        let mine: Vec<String> = store.items("mine").into_iter().map(|l| l.id).collect();
        assert_eq!(available, vec!["b", "a"]);
        assert_eq!(mine, vec!["c", "a"]);
    }

    #[test]
    fn test_add_is_upsert_and_reroutes() {
        let store = store();
        store.add(listing("a", "me", "available"));
        store.add(listing("a", "me", "available"));
        assert_eq!(store.items("available").len(), 1);

        store.add(listing("a", "me", "sold"));
        assert!(store.items("available").is_empty());
        assert_eq!(store.items("mine")[0].status, ListingStatus::Sold);
    }

    #[test]
    fn test_update_merges_everywhere() {
        let store = store();
        let record = listing("x", "me", "available");
        store.add(record.clone());
        store.select(Some(record));

        assert!(store.update("x", &json!({"status": "sold"})));
        assert_eq!(store.items("available")[0].status, ListingStatus::Sold);
        assert_eq!(store.items("mine")[0].status, ListingStatus::Sold);
        assert_eq!(store.selected().unwrap().status, ListingStatus::Sold);

        assert!(!store.update("missing", &json!({"status": "sold"})));
    }

    #[test]
    fn test_bad_patch_leaves_record() {
        let store = store();
        store.add(listing("x", "me", "available"));
        assert!(!store.update("x", &json!({"status": "teleported"})));
        assert_eq!(store.items("mine")[0].status, ListingStatus::Available);
    }

    #[test]
    fn test_remove_clears_selection() {
        let store = store();
        let record = listing("x", "me", "available");
        store.add(record.clone());
        store.select(Some(record));

        assert!(store.remove("x").is_some());
        assert!(store.selected().is_none());
        assert!(!store.contains("x"));
        assert!(store.remove("x").is_none());
    }

    #[test]
    fn test_set_replaces_and_refreshes_selection() {
        let store = store();
        store.add(listing("x", "me", "available"));
        store.select(store.get("x"));

        store.set("available", vec![listing("x", "me", "pending"), listing("y", "o", "available")]);
        assert_eq!(store.items("available").len(), 2);
        assert_eq!(store.selected().unwrap().status, ListingStatus::Pending);
    }

    #[test]
    fn test_back_placement_appends() {
        let store: EntityStore<Listing> = EntityStore::single(Placement::Back);
        store.add(listing("1", "me", "available"));
        store.add(listing("2", "me", "available"));
        let ids: Vec<String> = store.items("all").into_iter().map(|l| l.id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_apply_changes() {
        let store = store();
        store.apply(FeedChange::Upsert(serde_json::to_value(listing("a", "me", "available")).unwrap()));
        store.apply(FeedChange::Upsert(json!({"id": "broken"})));
        assert!(store.contains("a"));
        assert!(!store.contains("broken"));

        store.apply(FeedChange::Delete("a".into()));
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_flags_and_version() {
        let store = store();
        let before = store.version();
        store.set_loading(true);
        store.set_error(Some("boom".into()));
        assert!(store.loading());
        assert_eq!(store.error().as_deref(), Some("boom"));
        assert!(store.version() > before);
    }
}
