//! Tables of JSON rows and the query evaluator
//!
//! Every write records a [`ChangeEvent`]; the backend drains them after the
//! write and fans them out to open channels.

use chrono::{SecondsFormat, Utc};
use lotsync_core::{
    row_id, ChangeEvent, Filter, FilterOp, Mutation, Query, RemoteError, Result,
};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryDb {
    tables: HashMap<String, Vec<Value>>,
    next_id: u64,
    pending: Vec<ChangeEvent>,
}

/// Current time in the wire format used for `created_at` and friends
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> &[Value] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, table: &str, id: &str) -> Option<&Value> {
        self.rows(table)
            .iter()
            .find(|row| row_id(row).as_deref() == Some(id))
    }

    /// Evaluate a read; count-only queries return no rows
    pub fn select(&self, query: &Query) -> Vec<Value> {
        if query.head {
            return Vec::new();
        }
        let mut rows: Vec<Value> = self
            .rows(&query.table)
            .iter()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            .cloned()
            .collect();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_opt(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        for row in &mut rows {
            for join in &query.joins {
                let related = row
                    .get(&join.foreign_key)
                    .and_then(|key| row_id_of(key))
                    .and_then(|key| self.find(&join.table, &key))
                    .cloned()
                    .unwrap_or(Value::Null);
                if let Value::Object(fields) = row {
                    fields.insert(join.alias.clone(), related);
                }
            }
        }
        rows
    }

    /// Insert a row, filling `id` and `created_at` when absent
    pub fn insert(&mut self, table: &str, row: Value) -> Result<Value> {
        let Value::Object(mut fields) = row else {
            return Err(RemoteError::bad_request("row must be an object").into());
        };
        let id = match fields.get("id").and_then(row_id_of) {
            Some(id) => id,
            None => {
                self.next_id += 1;
                let id = format!("{}-{}", table, self.next_id);
                fields.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        if self.find(table, &id).is_some() {
            return Err(RemoteError::conflict(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                table
            ))
            .into());
        }
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(timestamp()));

        let row = Value::Object(fields);
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        self.pending.push(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    pub fn update(&mut self, table: &str, id: &str, patch: &Value) -> Result<Value> {
        let Value::Object(patch) = patch else {
            return Err(RemoteError::bad_request("patch must be an object").into());
        };
        let row = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r).as_deref() == Some(id)))
            .ok_or_else(|| RemoteError::not_found("The result contains 0 rows").with_code("PGRST116"))?;
        let old = row.clone();
        overlay(row, patch);
        let updated = row.clone();
        let mut event = ChangeEvent::update(table, updated.clone());
        event.old = Some(old);
        self.pending.push(event);
        Ok(updated)
    }

    pub fn update_where(&mut self, table: &str, filters: &[Filter], patch: &Value) -> Result<Vec<Value>> {
        let Value::Object(patch) = patch else {
            return Err(RemoteError::bad_request("patch must be an object").into());
        };
        let mut updated = Vec::new();
        let mut events = Vec::new();
        if let Some(rows) = self.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filters.iter().all(|f| matches(r, f))) {
                let old = row.clone();
                overlay(row, patch);
                let mut event = ChangeEvent::update(table, row.clone());
                event.old = Some(old);
                events.push(event);
                updated.push(row.clone());
            }
        }
        self.pending.extend(events);
        Ok(updated)
    }

    /// Delete by id; deleting a missing row is not an error
    pub fn delete(&mut self, table: &str, id: &str) -> Option<Value> {
        let rows = self.tables.get_mut(table)?;
        let index = rows.iter().position(|r| row_id(r).as_deref() == Some(id))?;
        let removed = rows.remove(index);
        self.pending.push(ChangeEvent::delete(table, removed.clone()));
        Some(removed)
    }

    pub fn apply(&mut self, mutation: &Mutation) -> Result<Value> {
        match mutation {
            Mutation::Insert { table, row } => self.insert(table, row.clone()),
            Mutation::Update { table, id, patch } => self.update(table, id, patch),
            Mutation::UpdateWhere {
                table,
                filters,
                patch,
            } => self.update_where(table, filters, patch).map(Value::Array),
            Mutation::Delete { table, id } => Ok(self.delete(table, id).unwrap_or(Value::Null)),
        }
    }

    pub(crate) fn take_events(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.pending)
    }
}

fn overlay(row: &mut Value, patch: &Map<String, Value>) {
    if let Value::Object(fields) = row {
        for (key, value) in patch {
            if key != "id" {
                fields.insert(key.clone(), value.clone());
            }
        }
        fields.insert("updated_at".to_string(), Value::String(timestamp()));
    }
}

fn row_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Missing and null values sort last
fn compare_opt(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub(crate) fn matches(row: &Value, filter: &Filter) -> bool {
    let field = row.get(&filter.column).unwrap_or(&Value::Null);
    match filter.op {
        FilterOp::Eq => field == &filter.value || as_text(field) == as_text(&filter.value),
        FilterOp::Neq => !(field == &filter.value || as_text(field) == as_text(&filter.value)),
        op => match compare(field, &filter.value) {
            Some(ordering) => match op {
                FilterOp::Lt => ordering == Ordering::Less,
                FilterOp::Lte => ordering != Ordering::Greater,
                FilterOp::Gt => ordering == Ordering::Greater,
                FilterOp::Gte => ordering != Ordering::Less,
                FilterOp::Eq | FilterOp::Neq => false,
            },
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_core::{ChangeKind, Error};
    use serde_json::json;

    fn seeded() -> MemoryDb {
        let mut db = MemoryDb::new();
        db.insert("profiles", json!({"id": "d1", "dealer_name": "Northside Motors"})).unwrap();
        for (id, status, year) in [("a", "available", 2020), ("b", "sold", 2022), ("c", "available", 2023)] {
            db.insert(
                "listings",
                json!({"id": id, "dealer_id": "d1", "status": status, "year": year}),
            )
            .unwrap();
        }
        db.take_events();
        db
    }

    #[test]
    fn test_select_filters_orders_and_joins() {
        let db = seeded();
        let query = Query::table("listings")
            .join("dealer", "profiles", "dealer_id")
            .eq("status", "available")
            .order("year", false)
            .limit(5);
        let rows = db.select(&query);
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(rows[0]["dealer"]["dealer_name"], "Northside Motors");
    }

    #[test]
    fn test_head_query_returns_nothing() {
        let db = seeded();
        assert!(db.select(&Query::table("listings").head()).is_empty());
    }

    #[test]
    fn test_range_filters() {
        let db = seeded();
        let rows = db.select(&Query::table("listings").lt("year", 2023));
        assert_eq!(rows.len(), 2);
        let rows = db.select(&Query::table("listings").neq("status", "sold"));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_insert_fills_defaults_and_rejects_duplicates() {
        let mut db = MemoryDb::new();
        let row = db.insert("messages", json!({"content": "hi"})).unwrap();
        assert_eq!(row["id"], "messages-1");
        assert!(row["created_at"].is_string());

        let err = db.insert("messages", json!({"id": "messages-1"})).unwrap_err();
        assert!(matches!(err, Error::Remote(ref r) if r.code.as_deref() == Some("23505")));
    }

    #[test]
    fn test_writes_record_events() {
        let mut db = seeded();
        db.update("listings", "a", &json!({"status": "sold"})).unwrap();
        db.delete("listings", "b");
        assert!(db.delete("listings", "missing").is_none());

        let events = db.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::Update);
        assert_eq!(events[0].old.as_ref().unwrap()["status"], "available");
        assert_eq!(events[1].kind, ChangeKind::Delete);
        assert!(db.take_events().is_empty());
    }

    #[test]
    fn test_update_missing_row() {
        let mut db = seeded();
        let err = db.update("listings", "zzz", &json!({"status": "sold"})).unwrap_err();
        assert_eq!(err.class(), lotsync_core::ErrorClass::Rejected);
    }

    #[test]
    fn test_update_where() {
        let mut db = seeded();
        let updated = db
            .update_where(
                "listings",
                &[Filter::eq("status", "available")],
                &json!({"status": "pending"}),
            )
            .unwrap();
        assert_eq!(updated.len(), 2);
        assert!(db.select(&Query::table("listings").eq("status", "available")).is_empty());
    }
}
