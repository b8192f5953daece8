//! Session, change-feed and query types shared by every lotsync crate
//!
//! These are the shapes exchanged with the hosted backend: who is signed in,
//! which auth transitions the backend pushes, what a realtime change event
//! looks like, and how reads and writes are described. None of them carry
//! behaviour beyond small constructors and accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Authenticated identity as reported by the backend's auth service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Dealer profile row (`profiles` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub dealer_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "dealer".to_string()
}

impl Profile {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// A live session: bearer token plus the user it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

/// Auth transitions pushed by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One push from the auth stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<AuthSession>,
}

impl AuthChange {
    pub fn new(event: AuthEvent, session: Option<AuthSession>) -> Self {
        Self { event, session }
    }
}

/// Row change kinds emitted by the realtime feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => f.write_str("INSERT"),
            ChangeKind::Update => f.write_str("UPDATE"),
            ChangeKind::Delete => f.write_str("DELETE"),
        }
    }
}

/// A single realtime change event
///
/// `new` is present for inserts and updates, `old` for deletes. The row in
/// `new` may be partial: joined columns are never part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            new: Some(row),
            old: None,
        }
    }

    pub fn update(table: impl Into<String>, row: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            new: Some(row),
            old: None,
        }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            new: None,
            old: Some(old),
        }
    }

    /// Id of the affected row, taken from `new` or else `old`
    pub fn record_id(&self) -> Option<String> {
        self.new
            .as_ref()
            .and_then(row_id)
            .or_else(|| self.old.as_ref().and_then(row_id))
    }
}

/// Read the `id` column of a JSON row
pub fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Name of a realtime feed, e.g. `listings` or `notifications:<user>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn listings() -> Self {
        Self::new("listings")
    }

    pub fn notifications(user_id: &str) -> Self {
        Self(format!("notifications:{}", user_id))
    }

    pub fn messages(channel_id: &str) -> Self {
        Self(format!("messages:{}", channel_id))
    }

    pub fn chat_notifications(user_id: &str) -> Self {
        Self(format!("chat-notifications:{}", user_id))
    }

    pub fn admin_users() -> Self {
        Self::new("admin-users")
    }

    pub fn admin_invitations() -> Self {
        Self::new("admin-invitations")
    }

    /// Feeds scoped to one signed-in user's data or privileges
    pub fn user_scoped(user_id: &str) -> Vec<Topic> {
        vec![
            Self::notifications(user_id),
            Self::chat_notifications(user_id),
            Self::admin_users(),
            Self::admin_invitations(),
        ]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend-assigned identifier of an open realtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Row filter applied server-side to a change subscription (`column=eq.value`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub column: String,
    pub value: String,
    /// Restrict to one kind of change; `None` means all
    #[serde(default)]
    pub kind: Option<ChangeKind>,
}

impl ChangeFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            kind: None,
        }
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Whether an event passes this filter
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(kind) = self.kind {
            if kind != event.kind {
                return false;
            }
        }
        let row = event.new.as_ref().or(event.old.as_ref());
        match row.and_then(|r| r.get(&self.column)) {
            Some(Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// Comparison operators supported in query filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Embed a related row: `alias` receives the row of `table` whose `id`
/// equals this row's `foreign_key` column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub alias: String,
    pub table: String,
    pub foreign_key: String,
}

/// Declarative read against one table
///
/// ```rust
/// use lotsync_core::Query;
///
/// let query = Query::table("listings")
///     .join("dealer", "profiles", "dealer_id")
///     .eq("status", "available")
///     .order("created_at", false)
///     .limit(50);
/// assert_eq!(query.table, "listings");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order: Option<Order>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Count-only request: the backend answers without rows
    #[serde(default)]
    pub head: bool,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            joins: Vec::new(),
            filters: Vec::new(),
            order: None,
            limit: None,
            head: false,
        }
    }

    pub fn join(
        mut self,
        alias: impl Into<String>,
        table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.joins.push(Join {
            alias: alias.into(),
            table: table.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, op, value));
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    pub fn neq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Neq, value)
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Lt, value)
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn head(mut self) -> Self {
        self.head = true;
        self
    }
}

/// A write against one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Insert { table: String, row: Value },
    Update { table: String, id: String, patch: Value },
    /// Patch every row matching all `filters`; the result is the array of updated rows
    #[serde(rename = "update_where")]
    UpdateWhere { table: String, filters: Vec<Filter>, patch: Value },
    Delete { table: String, id: String },
}

impl Mutation {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Mutation::Insert {
            table: table.into(),
            row,
        }
    }

    pub fn update(table: impl Into<String>, id: impl Into<String>, patch: Value) -> Self {
        Mutation::Update {
            table: table.into(),
            id: id.into(),
            patch,
        }
    }

    pub fn update_where(table: impl Into<String>, filters: Vec<Filter>, patch: Value) -> Self {
        Mutation::UpdateWhere {
            table: table.into(),
            filters,
            patch,
        }
    }

    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Mutation::Delete {
            table: table.into(),
            id: id.into(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert { table, .. }
            | Mutation::Update { table, .. }
            | Mutation::UpdateWhere { table, .. }
            | Mutation::Delete { table, .. } => table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_wire_shape() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "eventType": "DELETE",
            "table": "listings",
            "old": {"id": "l-1"}
        }))
        .unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.record_id().as_deref(), Some("l-1"));
        assert!(event.new.is_none());
    }

    #[test]
    fn test_record_id_prefers_new_row() {
        let mut event = ChangeEvent::update("listings", json!({"id": "new"}));
        event.old = Some(json!({"id": "old"}));
        assert_eq!(event.record_id().as_deref(), Some("new"));
        assert_eq!(row_id(&json!({"id": 7})).as_deref(), Some("7"));
        assert_eq!(row_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::listings().as_str(), "listings");
        assert_eq!(Topic::notifications("u1").to_string(), "notifications:u1");
        assert_eq!(Topic::messages("c9").to_string(), "messages:c9");
        assert_eq!(
            Topic::chat_notifications("u1").as_str(),
            "chat-notifications:u1"
        );
        let scoped = Topic::user_scoped("u1");
        assert!(scoped.contains(&Topic::notifications("u1")));
        assert!(scoped.contains(&Topic::admin_users()));
        assert!(!scoped.contains(&Topic::listings()));
    }

    #[test]
    fn test_change_filter_matching() {
        let filter = ChangeFilter::eq("user_id", "u1").only(ChangeKind::Insert);
        assert_eq!(filter.to_string(), "user_id=eq.u1");

        let mine = ChangeEvent::insert("notifications", json!({"id": "n1", "user_id": "u1"}));
        let theirs = ChangeEvent::insert("notifications", json!({"id": "n2", "user_id": "u2"}));
        let update = ChangeEvent::update("notifications", json!({"id": "n1", "user_id": "u1"}));

        assert!(filter.matches(&mine));
        assert!(!filter.matches(&theirs));
        assert!(!filter.matches(&update));
    }

    #[test]
    fn test_query_builder() {
        let query = Query::table("messages")
            .eq("channel_id", "c1")
            .lt("created_at", "2024-01-01T00:00:00Z")
            .order("created_at", false)
            .limit(20);
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[1].op, FilterOp::Lt);
        assert_eq!(query.limit, Some(20));
        assert!(!query.head);
    }

    #[test]
    fn test_mutation_serialization() {
        let mutation = Mutation::update("listings", "l1", json!({"status": "sold"}));
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["op"], "update");
        assert_eq!(value["id"], "l1");
        assert_eq!(mutation.table(), "listings");

        let bulk = Mutation::update_where(
            "notifications",
            vec![Filter::eq("user_id", "u1"), Filter::eq("read", false)],
            json!({"read": true}),
        );
        assert_eq!(serde_json::to_value(&bulk).unwrap()["op"], "update_where");
    }

    #[test]
    fn test_profile_admin_flag() {
        let profile: Profile =
            serde_json::from_value(json!({"id": "u1", "role": "admin"})).unwrap();
        assert!(profile.is_admin());
        let dealer: Profile = serde_json::from_value(json!({"id": "u2"})).unwrap();
        assert_eq!(dealer.role, "dealer");
        assert!(!dealer.is_admin());
    }

    #[test]
    fn test_auth_event_names() {
        let value = serde_json::to_value(AuthEvent::TokenRefreshed).unwrap();
        assert_eq!(value, json!("TOKEN_REFRESHED"));
    }
}
