//! Marketplace procedures served by the in-process backend
//!
//! Parameter names and result shapes follow the hosted service: chat
//! procedures take `p_`-prefixed parameters and return arrays of rows.

use crate::backend::MemoryBackend;
use crate::db::{timestamp, MemoryDb};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use lotsync_core::{row_id, Error, Filter, Query, RemoteError, Result, User};
use serde_json::{json, Value};

/// Days a renewed listing stays up
const RENEWAL_DAYS: i64 = 30;

pub(crate) fn install(backend: &MemoryBackend) {
    backend.register_procedure("get_user_channels", get_user_channels);
    backend.register_procedure("fetch_channel_messages", fetch_channel_messages);
    backend.register_procedure("mark_channel_as_read", mark_channel_as_read);
    backend.register_procedure("renew_listing", renew_listing);
}

fn require_caller(caller: Option<&User>) -> Result<&User> {
    caller.ok_or_else(|| RemoteError::unauthorized("JWT expired").into())
}

fn param<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::bad_request(format!("missing parameter {}", name)).into())
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Channels the caller belongs to, most recent activity first
fn get_user_channels(db: &mut MemoryDb, _params: Value, caller: Option<&User>) -> Result<Value> {
    let user = require_caller(caller)?;
    let memberships: Vec<Value> = db.select(&Query::table("channel_members").eq("user_id", user.id.as_str()));

    let mut channels = Vec::new();
    for membership in memberships {
        let Some(channel_id) = membership.get("channel_id").and_then(Value::as_str) else {
            continue;
        };
        let Some(mut channel) = db.find("channels", channel_id).cloned() else {
            continue;
        };
        let last_read = parse_time(membership.get("last_read_at"));

        let messages = db.select(
            &Query::table("messages")
                .eq("channel_id", channel_id)
                .order("created_at", false),
        );
        let unread = messages
            .iter()
            .filter(|m| m.get("sender_id").and_then(Value::as_str) != Some(user.id.as_str()))
            .filter(|m| match (last_read, parse_time(m.get("created_at"))) {
                (Some(read), Some(sent)) => sent > read,
                _ => true,
            })
            .count();
        let other = db
            .select(&Query::table("channel_members").eq("channel_id", channel_id))
            .into_iter()
            .filter_map(|m| m.get("user_id").and_then(Value::as_str).map(str::to_string))
            .find(|id| id != &user.id);
        let other_name = other
            .as_deref()
            .and_then(|id| db.find("profiles", id))
            .and_then(|p| p.get("dealer_name").cloned())
            .unwrap_or(Value::Null);

        if let Value::Object(fields) = &mut channel {
            let latest = messages.first();
            fields.insert(
                "last_message".to_string(),
                latest.and_then(|m| m.get("content").cloned()).unwrap_or(Value::Null),
            );
            fields.insert(
                "last_message_at".to_string(),
                latest.and_then(|m| m.get("created_at").cloned()).unwrap_or(Value::Null),
            );
            fields.insert("unread_count".to_string(), json!(unread));
            fields.insert("other_member_id".to_string(), json!(other));
            fields.insert("other_member_name".to_string(), other_name);
        }
        channels.push(channel);
    }

    channels.sort_by(|a, b| {
        let at = |c: &Value| parse_time(c.get("last_message_at")).or_else(|| parse_time(c.get("created_at")));
        at(b).cmp(&at(a))
    });
    Ok(Value::Array(channels))
}

/// One page of a channel's messages, newest first, with the sender joined
fn fetch_channel_messages(db: &mut MemoryDb, params: Value, caller: Option<&User>) -> Result<Value> {
    require_caller(caller)?;
    let channel_id = param(&params, "p_channel_id")?;
    let limit = params
        .get("p_limit")
        .and_then(Value::as_u64)
        .unwrap_or(50) as usize;
    let before = parse_time(params.get("p_before_timestamp"));

    let mut messages: Vec<Value> = db
        .select(
            &Query::table("messages")
                .join("sender", "profiles", "sender_id")
                .eq("channel_id", channel_id)
                .order("created_at", false),
        )
        .into_iter()
        .filter(|m| match (before, parse_time(m.get("created_at"))) {
            (Some(before), Some(sent)) => sent < before,
            (Some(_), None) => false,
            (None, _) => true,
        })
        .collect();
    messages.truncate(limit);
    Ok(Value::Array(messages))
}

fn mark_channel_as_read(db: &mut MemoryDb, params: Value, caller: Option<&User>) -> Result<Value> {
    let user = require_caller(caller)?;
    let channel_id = param(&params, "p_channel_id")?;
    db.update_where(
        "channel_members",
        &[
            Filter::eq("channel_id", channel_id),
            Filter::eq("user_id", user.id.as_str()),
        ],
        &json!({ "last_read_at": timestamp() }),
    )?;
    Ok(Value::Null)
}

/// Push a listing's expiry out; only its dealer may do this
fn renew_listing(db: &mut MemoryDb, params: Value, caller: Option<&User>) -> Result<Value> {
    let user = require_caller(caller)?;
    let listing_id = param(&params, "listing_id")?;
    let listing = db
        .find("listings", listing_id)
        .ok_or_else(|| Error::from(RemoteError::not_found("Listing not found")))?;
    if listing.get("dealer_id").and_then(Value::as_str) != Some(user.id.as_str()) {
        return Err(RemoteError::forbidden("Only the listing's dealer can renew it").into());
    }
    let id = row_id(listing).unwrap_or_else(|| listing_id.to_string());
    let expires_at = (Utc::now() + Duration::days(RENEWAL_DAYS)).to_rfc3339_opts(SecondsFormat::Micros, true);
    db.update("listings", &id, &json!({ "expires_at": expires_at }))
}
