//! Marketplace records kept in the client-side stores

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row type that can live in an entity store
///
/// Partial updates are applied by merging a JSON object over the serialized
/// record, so any patch type that serializes to an object works.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Backend table the record comes from
    const TABLE: &'static str;

    fn id(&self) -> &str;

    /// Copy of `self` with the fields of `patch` overwritten
    fn merged(&self, patch: &Value) -> Result<Self> {
        let Value::Object(fields) = patch else {
            return Err(Error::Validation("patch must be a JSON object".to_string()));
        };
        let mut current = serde_json::to_value(self)?;
        if let Value::Object(target) = &mut current {
            for (key, value) in fields {
                if key != "id" {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(serde_json::from_value(current)?)
    }
}

/// Parse a backend row into a record
pub fn from_row<T: DeserializeOwned>(row: Value) -> Result<T> {
    Ok(serde_json::from_value(row)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Available,
    Pending,
    Sold,
    Cancelled,
    /// "In search of" request rather than inventory
    Searching,
    Archived,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Available => "available",
            ListingStatus::Pending => "pending",
            ListingStatus::Sold => "sold",
            ListingStatus::Cancelled => "cancelled",
            ListingStatus::Searching => "searching",
            ListingStatus::Archived => "archived",
        }
    }
}

/// Contact columns of a profile embedded into another row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DealerSummary {
    #[serde(default)]
    pub dealer_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCode {
    pub code: String,
}

/// A vehicle offered for transfer, or wanted (`Searching`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub dealer_id: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub pdi_fee: Option<f64>,
    #[serde(default)]
    pub condition_notes: Option<String>,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub model_code_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Joined from `profiles`; absent in realtime payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dealer: Option<DealerSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_codes: Option<ModelCode>,
}

impl Record for Listing {
    const TABLE: &'static str = "listings";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Partial listing update; unset fields are left alone
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdi_fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ListingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl ListingPatch {
    pub fn status(status: ListingStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(make) = &self.make {
            require_text("Make", make)?;
        }
        if let Some(model) = &self.model {
            require_text("Model", model)?;
        }
        if let Some(year) = self.year {
            validate_year(year)?;
        }
        if let Some(vin) = &self.vin {
            validate_vin(vin)?;
        }
        if let Some(fee) = self.pdi_fee {
            validate_fee(fee)?;
        }
        Ok(())
    }
}

/// Input for a new listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingForm {
    pub make: String,
    pub model: String,
    pub year: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdi_fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub status: ListingStatus,
}

impl ListingForm {
    pub fn new(make: impl Into<String>, model: impl Into<String>, year: i32) -> Self {
        Self {
            make: make.into(),
            model: model.into(),
            year,
            vin: None,
            pdi_fee: None,
            condition_notes: None,
            location: None,
            photo_url: None,
            status: ListingStatus::Available,
        }
    }

    pub fn with_vin(mut self, vin: impl Into<String>) -> Self {
        self.vin = Some(vin.into());
        self
    }

    pub fn with_pdi_fee(mut self, fee: f64) -> Self {
        self.pdi_fee = Some(fee);
        self
    }

    /// Mark the form as an "in search of" request
    pub fn searching(mut self) -> Self {
        self.status = ListingStatus::Searching;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require_text("Make", &self.make)?;
        require_text("Model", &self.model)?;
        validate_year(self.year)?;
        if let Some(vin) = &self.vin {
            validate_vin(vin)?;
        }
        if let Some(fee) = self.pdi_fee {
            validate_fee(fee)?;
        }
        Ok(())
    }

    /// Local stand-in shown until the backend returns the stored row
    pub fn draft(&self, id: impl Into<String>, dealer_id: impl Into<String>) -> Listing {
        Listing {
            id: id.into(),
            dealer_id: dealer_id.into(),
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year,
            vin: self.vin.clone(),
            pdi_fee: self.pdi_fee,
            condition_notes: self.condition_notes.clone(),
            status: self.status,
            created_at: Utc::now(),
            updated_at: None,
            location: self.location.clone(),
            photo_url: self.photo_url.clone(),
            segment_id: None,
            model_id: None,
            model_code_id: None,
            expires_at: None,
            dealer: None,
            model_codes: None,
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn validate_year(year: i32) -> Result<()> {
    let newest = Utc::now().year() + 2;
    if !(1900..=newest).contains(&year) {
        return Err(Error::Validation(format!(
            "Year must be between 1900 and {}",
            newest
        )));
    }
    Ok(())
}

fn validate_vin(vin: &str) -> Result<()> {
    if !vin.is_empty() && vin.len() != 17 {
        return Err(Error::Validation("VIN must be 17 characters".to_string()));
    }
    Ok(())
}

fn validate_fee(fee: f64) -> Result<()> {
    if !fee.is_finite() || fee < 0.0 {
        return Err(Error::Validation("PDI fee cannot be negative".to_string()));
    }
    Ok(())
}

/// In-app notification row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Record for Notification {
    const TABLE: &'static str = "notifications";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Chat message, with the sender's profile joined in when available
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<DealerSummary>,
}

impl ChatMessage {
    pub fn sender_name(&self) -> Option<&str> {
        self.sender.as_ref()?.dealer_name.as_deref()
    }

    pub fn sender_email(&self) -> Option<&str> {
        self.sender.as_ref()?.email.as_deref()
    }
}

impl Record for ChatMessage {
    const TABLE: &'static str = "messages";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A conversation, either direct or attached to a resource such as a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChannel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub other_member_id: Option<String>,
    #[serde(default)]
    pub other_member_name: Option<String>,
}

impl Record for ChatChannel {
    const TABLE: &'static str = "channels";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Unread-message alert for a chat channel (`chat_notifications` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatNotification {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Record for ChatNotification {
    const TABLE: &'static str = "chat_notifications";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Account row as seen from the admin screens (`profiles` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "dealer_role")]
    pub role: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dealer_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub brands: Vec<String>,
}

fn dealer_role() -> String {
    "dealer".to_string()
}

impl AppUser {
    /// Signed up and never touched since: still awaiting approval
    pub fn is_pending(&self) -> bool {
        self.role == "pending" && self.updated_at.map_or(true, |at| at == self.created_at)
    }

    /// Approved dealers and admins
    pub fn is_active(&self) -> bool {
        self.role != "pending"
    }
}

impl Record for AppUser {
    const TABLE: &'static str = "profiles";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Sign-up invitation issued by an admin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Invitation {
    pub fn is_pending(&self) -> bool {
        self.used_at.is_none()
    }
}

impl Record for Invitation {
    const TABLE: &'static str = "invitations";

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing_row() -> Value {
        json!({
            "id": "l1",
            "dealer_id": "d1",
            "make": "Toyota",
            "model": "Corolla",
            "year": 2022,
            "status": "available",
            "created_at": "2024-03-01T10:00:00Z",
            "dealer": {"dealer_name": "Northside Motors"}
        })
    }

    #[test]
    fn test_listing_from_row() {
        let listing: Listing = from_row(listing_row()).unwrap();
        assert_eq!(listing.status, ListingStatus::Available);
        assert_eq!(
            listing.dealer.unwrap().dealer_name.as_deref(),
            Some("Northside Motors")
        );
        assert!(listing.vin.is_none());
    }

    #[test]
    fn test_merge_patch_keeps_untouched_fields() {
        let listing: Listing = from_row(listing_row()).unwrap();
        let patch = ListingPatch::status(ListingStatus::Sold).to_value().unwrap();
        assert_eq!(patch, json!({"status": "sold"}));

        let merged = listing.merged(&patch).unwrap();
        assert_eq!(merged.status, ListingStatus::Sold);
        assert_eq!(merged.make, "Toyota");
        assert!(merged.dealer.is_some());
    }

    #[test]
    fn test_merge_ignores_id_and_rejects_non_objects() {
        let listing: Listing = from_row(listing_row()).unwrap();
        let merged = listing.merged(&json!({"id": "other", "year": 2023})).unwrap();
        assert_eq!(merged.id, "l1");
        assert_eq!(merged.year, 2023);
        assert!(matches!(
            listing.merged(&json!("sold")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_form_validation() {
        assert!(ListingForm::new("Honda", "Civic", 2021).validate().is_ok());
        assert!(ListingForm::new(" ", "Civic", 2021).validate().is_err());
        assert!(ListingForm::new("Honda", "Civic", 1850).validate().is_err());
        assert!(ListingForm::new("Honda", "Civic", 2021)
            .with_vin("SHORT")
            .validate()
            .is_err());
        assert!(ListingForm::new("Honda", "Civic", 2021)
            .with_pdi_fee(-5.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_form_draft() {
        let draft = ListingForm::new("Honda", "Civic", 2021)
            .searching()
            .draft("local-1", "d1");
        assert_eq!(draft.id(), "local-1");
        assert_eq!(draft.status, ListingStatus::Searching);
    }

    #[test]
    fn test_notification_type_column() {
        let n: Notification = from_row(json!({
            "id": "n1",
            "user_id": "u1",
            "title": "New message",
            "type": "chat",
            "created_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(n.kind.as_deref(), Some("chat"));
        assert!(!n.read);
    }

    #[test]
    fn test_chat_message_sender() {
        let m: ChatMessage = from_row(json!({
            "id": "m1",
            "channel_id": "c1",
            "sender_id": "u1",
            "content": "hi",
            "created_at": "2024-03-01T10:00:00Z",
            "sender": {"dealer_name": "Lakeview Auto", "email": "sales@lakeview.test"}
        }))
        .unwrap();
        assert_eq!(m.sender_name(), Some("Lakeview Auto"));
        assert_eq!(m.sender_email(), Some("sales@lakeview.test"));
    }

    #[test]
    fn test_pending_user_rules() {
        let fresh: AppUser = from_row(json!({
            "id": "u1",
            "role": "pending",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert!(fresh.is_pending());
        assert!(!fresh.is_active());

        let touched = fresh
            .merged(&json!({"updated_at": "2024-03-02T09:00:00Z"}))
            .unwrap();
        assert!(!touched.is_pending());

        let dealer = fresh.merged(&json!({"role": "dealer"})).unwrap();
        assert!(dealer.is_active());
        assert!(dealer.brands.is_empty());
    }

    #[test]
    fn test_chat_notification_and_invitation_rows() {
        let alert: ChatNotification = from_row(json!({
            "id": "cn1",
            "user_id": "u1",
            "channel_id": "c1",
            "title": "New message",
            "created_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert!(!alert.read);
        assert!(alert.message_id.is_none());

        let invite: Invitation = from_row(json!({
            "id": "i1",
            "email": "new@dealer.test",
            "created_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert!(invite.is_pending());
    }
}
