//! Change-feed fan-out
//!
//! Each open channel is a table, an optional row filter and the sending half
//! of the channel's event queue. Publishing walks the open channels and
//! delivers the event to every one whose table and filter match. Channels
//! whose receiver has gone away are dropped during the walk.

use lotsync_core::{ChangeEvent, ChangeFilter, ChannelId, RemoteChannel};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

struct Subscriber {
    table: String,
    filter: Option<ChangeFilter>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
pub(crate) struct ChannelHub {
    next_id: u64,
    subscribers: BTreeMap<ChannelId, Subscriber>,
}

impl ChannelHub {
    pub(crate) fn open(&mut self, table: &str, filter: Option<&ChangeFilter>) -> RemoteChannel {
        self.next_id += 1;
        let id = ChannelId(self.next_id);
        let (tx, events) = mpsc::unbounded_channel();
        self.subscribers.insert(
            id,
            Subscriber {
                table: table.to_string(),
                filter: filter.cloned(),
                tx,
            },
        );
        tracing::debug!(channel = %id, table, "channel opened");
        RemoteChannel { id, events }
    }

    pub(crate) fn close(&mut self, id: ChannelId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Drop every channel; receivers see their queue close
    pub(crate) fn close_all(&mut self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        count
    }

    pub(crate) fn publish(&mut self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, subscriber| {
            if subscriber.table != event.table {
                return true;
            }
            if let Some(filter) = &subscriber.filter {
                if !filter.matches(event) {
                    return true;
                }
            }
            match subscriber.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!(channel = %id, "dropping channel with no receiver");
                    false
                }
            }
        });
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_core::ChangeKind;
    use serde_json::json;

    #[test]
    fn test_publish_respects_table_and_filter() {
        let mut hub = ChannelHub::default();
        let mut all = hub.open("notifications", None);
        let mut mine = hub.open(
            "notifications",
            Some(&ChangeFilter::eq("user_id", "u1").only(ChangeKind::Insert)),
        );
        let mut other = hub.open("listings", None);

        let event = ChangeEvent::insert("notifications", json!({"id": "n1", "user_id": "u2"}));
        assert_eq!(hub.publish(&event), 1);
        assert!(all.events.try_recv().is_ok());
        assert!(mine.events.try_recv().is_err());
        assert!(other.events.try_recv().is_err());
    }

    #[test]
    fn test_dead_receivers_are_pruned() {
        let mut hub = ChannelHub::default();
        let channel = hub.open("listings", None);
        drop(channel);
        assert_eq!(hub.publish(&ChangeEvent::insert("listings", json!({"id": "x"}))), 0);
        assert_eq!(hub.len(), 0);
    }

    #[test]
    fn test_ids_keep_increasing() {
        let mut hub = ChannelHub::default();
        let first = hub.open("listings", None).id;
        hub.close_all();
        let second = hub.open("listings", None).id;
        assert!(second > first);
        assert!(hub.close(second));
        assert!(!hub.close(second));
    }
}
