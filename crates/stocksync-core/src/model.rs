//! Entities, queued operations and the per-type payload schema.
//!
//! Payloads are free-form JSON objects, but each [`EntityType`] declares the
//! fields the backend relies on. [`validate_payload`] is run by the data
//! access facade before anything reaches the local store or the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Synchronized entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Material,
    Product,
    Batch,
    Customer,
    Sale,
}

impl EntityType {
    /// Every known entity type, in pull order.
    pub fn all() -> &'static [EntityType] {
        &[
            EntityType::Material,
            EntityType::Product,
            EntityType::Batch,
            EntityType::Customer,
            EntityType::Sale,
        ]
    }

    /// Stable name used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Material => "material",
            EntityType::Product => "product",
            EntityType::Batch => "batch",
            EntityType::Customer => "customer",
            EntityType::Sale => "sale",
        }
    }

    /// Fields that must be present as non-empty strings.
    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::Material => &["name"],
            EntityType::Product => &["name"],
            EntityType::Batch => &["product_key"],
            EntityType::Customer => &["name"],
            EntityType::Sale => &["customer_key"],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "material" | "materials" => Ok(EntityType::Material),
            "product" | "products" => Ok(EntityType::Product),
            "batch" | "batches" => Ok(EntityType::Batch),
            "customer" | "customers" => Ok(EntityType::Customer),
            "sale" | "sales" => Ok(EntityType::Sale),
            other => Err(ValidationError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Fields holding amounts that can never be negative.
const NON_NEGATIVE_FIELDS: &[&str] = &["qty", "quantity", "price", "stock"];

/// Check a payload against the schema of its entity type.
pub fn validate_payload(entity_type: EntityType, payload: &Value) -> Result<(), ValidationError> {
    let obj = payload.as_object().ok_or_else(|| ValidationError::NotAnObject {
        entity_type: entity_type.to_string(),
    })?;

    for field in entity_type.required_fields() {
        match obj.get(*field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(ValidationError::MissingField {
                    entity_type: entity_type.to_string(),
                    field: field.to_string(),
                });
            }
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: field.to_string(),
                    expected: "a string",
                });
            }
        }
    }

    for field in NON_NEGATIVE_FIELDS {
        match obj.get(*field) {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => {
                let value = n.as_f64().unwrap_or(0.0);
                if value < 0.0 {
                    return Err(ValidationError::Negative {
                        field: field.to_string(),
                        value,
                    });
                }
            }
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: field.to_string(),
                    expected: "a number",
                });
            }
        }
    }

    Ok(())
}

/// Reject empty keys before they reach storage.
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        Err(ValidationError::EmptyKey)
    } else {
        Ok(())
    }
}

/// A domain record synchronized between the local store and the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub key: String,
    pub payload: Value,
    /// Monotonic version assigned by whoever wrote last.
    #[serde(default)]
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(entity_type: EntityType, key: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_type,
            key: key.into(),
            payload,
            version: 1,
            updated_at: Utc::now(),
        }
    }
}

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Waiting for (re)delivery.
    Pending,
    /// Retry budget exhausted; needs a manual requeue.
    Dead,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Dead => "dead",
        }
    }
}

/// A local mutation awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    /// Global FIFO position, assigned by the store on insert.
    pub seq: i64,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_key: String,
    /// Full entity payload for create/update, `null` for delete.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the next delivery may be attempted.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub state: OperationState,
}

impl QueuedOperation {
    /// Build a fresh operation; `seq` is filled in when it is stored.
    pub fn new(
        kind: OperationKind,
        entity_type: EntityType,
        entity_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            kind,
            entity_type,
            entity_key: entity_key.into(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            state: OperationState::Pending,
        }
    }

    /// Whether the backoff window has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |t| t <= now)
    }

    pub fn is_dead(&self) -> bool {
        self.state == OperationState::Dead
    }
}
